//! Build settings from a JSON file and the command line.
//!
//! Both sources produce a [`BuildFile`]; command line values are merged over
//! the file and the result is validated into [`BuildOptions`].

use anyhow::{Context, Result, bail};
use log::debug;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::installer::RepoConfig;
use crate::runtime::Runtime;

/// Everything needed for one stage 2 build. Paths are absolute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildOptions {
    pub stage_dir: PathBuf,
    pub packages: Vec<String>,
    pub tarball: PathBuf,
    pub patch_dirs: Vec<PathBuf>,
    pub post_scripts_dir: PathBuf,
    pub repo: RepoConfig,
    /// Release number spliced into the version file; 0 for none.
    pub relnum: u32,
}

/// Partially specified build settings.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct BuildFile {
    pub stage_dir: Option<PathBuf>,
    pub packages: Vec<String>,
    pub tarball: Option<PathBuf>,
    pub patch_dirs: Vec<PathBuf>,
    pub post_scripts_dir: Option<PathBuf>,
    pub repofile: Option<PathBuf>,
    pub dver: Option<String>,
    pub basearch: Option<String>,
    pub relnum: Option<u32>,
    pub extra_repos: Vec<String>,
}

impl BuildFile {
    #[tracing::instrument(skip(runtime))]
    pub fn load<R: Runtime>(runtime: &R, path: &Path) -> Result<Self> {
        let content = runtime
            .read_to_string(path)
            .with_context(|| format!("Failed to read build file {:?}", path))?;
        let file: BuildFile = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse build file {:?}", path))?;
        debug!("Loaded build file {:?}", path);
        Ok(file)
    }

    /// Overlay `other` on `self`: scalar values in `other` win, lists are appended.
    pub fn merge(mut self, other: BuildFile) -> BuildFile {
        self.stage_dir = other.stage_dir.or(self.stage_dir);
        self.packages.extend(other.packages);
        self.tarball = other.tarball.or(self.tarball);
        self.patch_dirs.extend(other.patch_dirs);
        self.post_scripts_dir = other.post_scripts_dir.or(self.post_scripts_dir);
        self.repofile = other.repofile.or(self.repofile);
        self.dver = other.dver.or(self.dver);
        self.basearch = other.basearch.or(self.basearch);
        self.relnum = other.relnum.or(self.relnum);
        self.extra_repos.extend(other.extra_repos);
        self
    }

    /// Check required settings and make paths absolute against `cwd`.
    pub fn into_options(self, cwd: &Path) -> Result<BuildOptions> {
        let abs = |p: PathBuf| if p.is_absolute() { p } else { cwd.join(p) };

        let Some(stage_dir) = self.stage_dir else {
            bail!("stage directory is required");
        };
        let Some(tarball) = self.tarball else {
            bail!("tarball path is required");
        };
        let Some(post_scripts_dir) = self.post_scripts_dir else {
            bail!("post-install scripts directory is required");
        };
        let Some(repofile) = self.repofile else {
            bail!("repo file is required");
        };
        let Some(dver) = self.dver else {
            bail!("distro version (dver) is required");
        };
        let Some(basearch) = self.basearch else {
            bail!("base architecture (basearch) is required");
        };
        if self.packages.is_empty() {
            bail!("at least one package is required");
        }

        let stage_dir = crate::runtime::normalize_path(&abs(stage_dir));
        if stage_dir.file_name().is_none() {
            bail!("stage directory {:?} must not be the filesystem root", stage_dir);
        }

        Ok(BuildOptions {
            stage_dir,
            packages: self.packages,
            tarball: abs(tarball),
            patch_dirs: self.patch_dirs.into_iter().map(abs).collect(),
            post_scripts_dir: abs(post_scripts_dir),
            repo: RepoConfig {
                repofile: abs(repofile),
                dver,
                basearch,
                extra_repos: self.extra_repos,
            },
            relnum: self.relnum.unwrap_or(0),
        })
    }
}
