//! Post-install corrections to the staged tree.

use log::{debug, warn};
use std::path::{Path, PathBuf};

use crate::error::{BuildError, FsContext, Result};
use crate::runtime::{Runtime, is_path_under, normalize_path, relative_symlink_path, strip_root};

pub const OSG_VERSION_FILE: &str = "etc/osg-version";
pub const GSISSH_CONFIG_DIR: &str = "etc/gsissh";
pub const GSISSH_COMPAT_LINK: &str = "usr/etc/ssh";
pub const GSISSH_COMPAT_TARGET: &str = "../../etc/gsissh";
pub const ALTERNATIVES_DIR: &str = "/etc/alternatives";
pub const ALTERNATIVES_SCAN_ROOT: &str = "usr";

const TARBALL_MARKER: &str = "tarball";

/// gsissh looks for its config in `$GLOBUS_LOCATION/etc/ssh` but the files
/// live in `etc/gsissh`. Link them with a relative symlink so nothing needs
/// fixing after the tarball is unpacked.
#[tracing::instrument(skip(runtime))]
pub fn fix_gsissh_config_dir<R: Runtime>(runtime: &R, stage_dir: &Path) -> Result<()> {
    if !runtime.is_dir(&stage_dir.join(GSISSH_CONFIG_DIR)) {
        return Ok(());
    }

    let link = stage_dir.join(GSISSH_COMPAT_LINK);
    let target = Path::new(GSISSH_COMPAT_TARGET);
    if runtime.is_symlink(&link) && runtime.read_link(&link).ok().as_deref() == Some(target) {
        debug!("{:?} already points at {:?}", link, target);
        return Ok(());
    }

    let context = || "unable to fix gsissh config dir";
    if let Some(parent) = link.parent() {
        runtime.create_dir_all(parent).fs_context(context)?;
    }
    runtime.symlink(target, &link).fs_context(context)
}

/// Contents of the version marker file, split into its numeric prefix and
/// whatever follows it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionString {
    /// Already marks itself as a tarball build.
    Tarball(String),
    Plain { number: String, rest: String },
}

impl VersionString {
    /// Parse a version line. Returns `None` unless it starts with digits/dots.
    pub fn parse(line: &str) -> Option<Self> {
        let split = line
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(line.len());
        if split == 0 {
            return None;
        }
        if line.contains(TARBALL_MARKER) {
            return Some(VersionString::Tarball(line.to_string()));
        }
        let (number, rest) = line.split_at(split);
        Some(VersionString::Plain {
            number: number.to_string(),
            rest: rest.to_string(),
        })
    }

    /// The tarball form: `3.4.5\n` becomes `3.4.5-tarball\n`, or
    /// `3.4.5-tarball-2\n` with release 2. A zero release adds no suffix.
    pub fn to_tarball(&self, relnum: u32) -> String {
        match self {
            VersionString::Tarball(line) => line.clone(),
            VersionString::Plain { number, rest } => {
                let release = if relnum > 0 {
                    format!("-{}", relnum)
                } else {
                    String::new()
                };
                format!("{}-{}{}{}", number, TARBALL_MARKER, release, rest)
            }
        }
    }
}

/// Rewrite `etc/osg-version` to carry the `-tarball[-N]` marker.
#[tracing::instrument(skip(runtime))]
pub fn fix_osg_version<R: Runtime>(runtime: &R, stage_dir: &Path, relnum: u32) -> Result<()> {
    let path = stage_dir.join(OSG_VERSION_FILE);
    let content = runtime
        .read_to_string(&path)
        .fs_context(|| format!("unable to read {:?}", path))?;

    let line = content.split_inclusive('\n').next().unwrap_or("");
    if line.is_empty() {
        return Err(BuildError::verification(format!(
            "Could not read version string from {:?}",
            path
        )));
    }
    let version = VersionString::parse(line).ok_or_else(|| {
        BuildError::verification(format!("{:?} does not contain version", path))
    })?;

    let new_line = version.to_tarball(relnum);
    debug!("osg-version {:?} -> {:?}", line, new_line);
    runtime
        .write(&path, new_line.as_bytes())
        .fs_context(|| format!("unable to write {:?}", path))
}

/// Point symlinks that go through `/etc/alternatives` straight at their final
/// target inside the staging root. Only links to files are rewritten; links
/// that end at a directory are left as they are.
///
/// The alternatives bookkeeping is left out of the tarball, so links relying
/// on it would dangle for users. Broken chains are logged and skipped.
/// Returns the number of links rewritten.
#[tracing::instrument(skip(runtime))]
pub fn fix_alternatives_symlinks<R: Runtime>(runtime: &R, stage_dir: &Path) -> Result<usize> {
    let mut repaired = 0;
    for link in find_symlinks(runtime, &stage_dir.join(ALTERNATIVES_SCAN_ROOT))? {
        let target = runtime
            .read_link(&link)
            .fs_context(|| format!("unable to read symlink {:?}", link))?;
        if !target.starts_with(ALTERNATIVES_DIR) {
            continue;
        }

        let staged_alt = stage_dir.join(strip_root(&target));
        if !runtime.is_symlink(&staged_alt) {
            warn!("broken symlink to alternatives? {:?} -> {:?}", link, staged_alt);
            continue;
        }

        let alt_target = runtime
            .read_link(&staged_alt)
            .fs_context(|| format!("unable to read symlink {:?}", staged_alt))?;
        let final_target = if alt_target.is_absolute() {
            stage_dir.join(strip_root(&alt_target))
        } else {
            let alt_dir = staged_alt.parent().unwrap_or(stage_dir);
            normalize_path(&alt_dir.join(&alt_target))
        };
        if !is_path_under(&final_target, stage_dir) || !runtime.exists(&final_target) {
            warn!(
                "broken symlink from alternatives? {:?} -> {:?}",
                staged_alt, final_target
            );
            continue;
        }

        if runtime.is_dir(&final_target) {
            debug!("{:?} resolves to a directory, leaving it alone", link);
            continue;
        }

        let Some(new_target) = relative_symlink_path(&link, &final_target) else {
            warn!("cannot express {:?} relative to {:?}", final_target, link);
            continue;
        };

        debug!("{:?}: {:?} -> {:?}", link, target, new_target);
        runtime
            .remove_symlink(&link)
            .fs_context(|| format!("unable to remove symlink {:?}", link))?;
        runtime
            .symlink(&new_target, &link)
            .fs_context(|| format!("unable to create symlink {:?}", link))?;
        repaired += 1;
    }
    Ok(repaired)
}

/// Every symlink under `top`, without descending into symlinked directories.
fn find_symlinks<R: Runtime>(runtime: &R, top: &Path) -> Result<Vec<PathBuf>> {
    let mut links = Vec::new();
    if !runtime.is_dir(top) {
        return Ok(links);
    }
    let mut pending = vec![top.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let entries = runtime
            .read_dir(&dir)
            .fs_context(|| format!("unable to list {:?}", dir))?;
        for entry in entries {
            if runtime.is_symlink(&entry) {
                links.push(entry);
            } else if runtime.is_dir(&entry) {
                pending.push(entry);
            }
        }
    }
    Ok(links)
}
