//! Package installation into the staging root.
//!
//! The package manager is reached through the [`PackageInstaller`] trait;
//! [`YumInstaller`] is the production implementation. [`install_packages`]
//! wraps any installer with the scoped `/proc` mount and the post-install
//! presence check.

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{BuildError, FsContext, Result};
use crate::process::{CommandRunner, CommandSpec, path_str, run_checked};
use crate::runtime::Runtime;

/// Where packages come from and which distro/arch they are built for.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoConfig {
    pub repofile: PathBuf,
    pub dver: String,
    pub basearch: String,
    #[serde(default)]
    pub extra_repos: Vec<String>,
}

impl RepoConfig {
    /// `el7` -> `7`. Anything not shaped like `elN` is passed through.
    pub fn releasever(&self) -> &str {
        match self.dver.strip_prefix("el") {
            Some(num) if !num.is_empty() && num.chars().all(|c| c.is_ascii_digit()) => num,
            _ => &self.dver,
        }
    }
}

#[cfg_attr(test, mockall::automock)]
pub trait PackageInstaller: Send + Sync {
    /// Install `packages` (names or `@group`s) into `root`.
    fn install(&self, root: &Path, packages: &[String], repo: &RepoConfig) -> Result<()>;
}

/// `proc` mounted at `<root>/proc` for as long as the guard lives.
pub struct ProcMount<'a, C: CommandRunner> {
    runner: &'a C,
    path: PathBuf,
    mounted: bool,
}

impl<'a, C: CommandRunner> ProcMount<'a, C> {
    pub fn new<R: Runtime>(runtime: &R, runner: &'a C, root: &Path) -> Result<Self> {
        let path = root.join("proc");
        runtime
            .create_dir_all(&path)
            .fs_context(|| format!("unable to create {:?}", path))?;

        let cmd = CommandSpec::new("mount")
            .args(["-t", "proc", "proc"])
            .arg_path(&path)?;
        run_checked(runner, &cmd, || format!("unable to mount proc at {:?}", path))?;
        debug!("mounted proc at {:?}", path);

        Ok(Self {
            runner,
            path,
            mounted: true,
        })
    }

    pub fn unmount(mut self) -> Result<()> {
        self.unmount_impl()
    }

    fn unmount_impl(&mut self) -> Result<()> {
        if !self.mounted {
            return Ok(());
        }
        self.mounted = false;
        let cmd = CommandSpec::new("umount").arg_path(&self.path)?;
        let path = &self.path;
        run_checked(self.runner, &cmd, || format!("unable to unmount {:?}", path))?;
        debug!("unmounted {:?}", self.path);
        Ok(())
    }
}

impl<C: CommandRunner> Drop for ProcMount<'_, C> {
    fn drop(&mut self) {
        if let Err(e) = self.unmount_impl() {
            warn!("{}", e);
        }
    }
}

/// Return true if `pkg` is installed in `root`.
#[tracing::instrument(skip(runner))]
pub fn package_installed<C: CommandRunner + ?Sized>(
    runner: &C,
    root: &Path,
    pkg: &str,
) -> Result<bool> {
    let cmd = CommandSpec::new("rpm")
        .arg("--root")
        .arg_path(root)?
        .args(["-q", pkg]);
    Ok(runner.run(&cmd)?.success())
}

/// Install packages into `root` with `/proc` mounted, then check that every
/// non-group package actually got installed.
#[tracing::instrument(skip(runtime, runner, installer, repo))]
pub fn install_packages<R, C, I>(
    runtime: &R,
    runner: &C,
    installer: &I,
    root: &Path,
    packages: &[String],
    repo: &RepoConfig,
) -> Result<()>
where
    R: Runtime,
    C: CommandRunner,
    I: PackageInstaller + ?Sized,
{
    let proc_mount = ProcMount::new(runtime, runner, root)?;
    installer.install(root, packages, repo)?;
    proc_mount.unmount()?;

    for pkg in packages {
        if pkg.starts_with('@') {
            // can't check on groups
            continue;
        }
        if !package_installed(runner, root, pkg)? {
            return Err(BuildError::verification(format!(
                "{:?} not installed after yum install",
                pkg
            )));
        }
    }
    Ok(())
}

/// Production installer driving `yum --installroot`.
pub struct YumInstaller<'a, R: Runtime, C: CommandRunner> {
    runtime: &'a R,
    runner: &'a C,
}

impl<'a, R: Runtime, C: CommandRunner> YumInstaller<'a, R, C> {
    pub fn new(runtime: &'a R, runner: &'a C) -> Self {
        Self { runtime, runner }
    }
}

impl<R: Runtime, C: CommandRunner> PackageInstaller for YumInstaller<'_, R, C> {
    #[tracing::instrument(skip(self, repo))]
    fn install(&self, root: &Path, packages: &[String], repo: &RepoConfig) -> Result<()> {
        if !self.runtime.is_privileged() {
            return Err(BuildError::verification(
                "installing into a staging root requires root privileges",
            ));
        }

        let repos = self
            .runtime
            .read_to_string(&repo.repofile)
            .fs_context(|| format!("unable to read repo file {:?}", repo.repofile))?;

        let workdir = tempfile::Builder::new()
            .prefix("osg-stage2-yum")
            .tempdir()
            .map_err(|e| BuildError::filesystem("unable to create yum config dir", e))?;
        let conf_path = workdir.path().join("yum.conf");
        let conf = render_yum_conf(&repos, repo, &workdir.path().join("cache"));
        self.runtime
            .write(&conf_path, conf.as_bytes())
            .fs_context(|| format!("unable to write {:?}", conf_path))?;

        info!(
            "Installing {} package(s) for {} {}",
            packages.len(),
            repo.dver,
            repo.basearch
        );
        let mut cmd = CommandSpec::new("yum")
            .arg("-y")
            .arg("-c")
            .arg_path(&conf_path)?
            .arg(format!("--installroot={}", path_str(root)?))
            .arg(format!("--releasever={}", repo.releasever()));
        for extra in &repo.extra_repos {
            cmd = cmd.arg(format!("--enablerepo={}", extra));
        }
        let cmd = cmd.arg("install").args(packages).stream();

        run_checked(self.runner, &cmd, || {
            format!("yum install into {:?} failed", root)
        })?;
        Ok(())
    }
}

/// Build a self-contained yum.conf: a private `[main]` section followed by the
/// repo definitions with `$basearch`/`$releasever` filled in.
pub fn render_yum_conf(repos: &str, repo: &RepoConfig, cachedir: &Path) -> String {
    let repos = repos
        .replace("$basearch", &repo.basearch)
        .replace("$releasever", repo.releasever());
    format!(
        "[main]\n\
         cachedir={}\n\
         keepcache=0\n\
         gpgcheck=0\n\
         reposdir=\n\
         plugins=1\n\
         installonly_limit=3\n\
         \n\
         {}\n",
        cachedir.display(),
        repos.trim_end()
    )
}
