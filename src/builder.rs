//! Top-level stage 2 build.
//!
//! [`Stage2Builder::make_stage2_tarball`] runs every step in order and stops
//! at the first failure. Build failures are logged and reported as `false`;
//! only internal errors come back as `Err`.

use log::{error, info};
use std::path::Path;

use crate::archive::{remove_empty_dirs_from_tarball, split_stage_dir, tar_stage_dir};
use crate::config::BuildOptions;
use crate::error::Result;
use crate::fixups::{fix_alternatives_symlinks, fix_gsissh_config_dir, fix_osg_version};
use crate::installer::{PackageInstaller, install_packages, package_installed};
use crate::manifest::{read_stage1_rpmlist, write_package_list};
use crate::patch::apply_patches;
use crate::process::{CommandRunner, CommandSpec, run_checked};
use crate::runtime::Runtime;
use crate::scripts::copy_post_scripts;

/// Directories downstream tools expect to exist even when empty.
pub const ALWAYS_RECREATE_DIRS: &[&str] = &["var/lib/osg-ca-certs"];
pub const FETCH_CRL_DIR: &str = "etc/fetch-crl.d";

/// Give the owner read/write access everywhere and traverse on directories.
#[tracing::instrument(skip(runner))]
pub fn fix_permissions<C: CommandRunner + ?Sized>(runner: &C, stage_dir: &Path) -> Result<()> {
    let cmd = CommandSpec::new("chmod")
        .args(["-R", "u+rwX"])
        .arg_path(stage_dir)?;
    run_checked(runner, &cmd, || {
        format!("unable to fix permissions in {:?}", stage_dir)
    })?;
    Ok(())
}

pub struct Stage2Builder<R: Runtime, C: CommandRunner, I: PackageInstaller> {
    runtime: R,
    runner: C,
    installer: I,
}

impl<R: Runtime, C: CommandRunner, I: PackageInstaller> Stage2Builder<R, C, I> {
    pub fn new(runtime: R, runner: C, installer: I) -> Self {
        Self {
            runtime,
            runner,
            installer,
        }
    }

    /// Build the stage 2 tarball described by `opts`.
    ///
    /// Returns `Ok(true)` on success and `Ok(false)` after logging a build
    /// failure.
    #[tracing::instrument(skip(self, opts), fields(stage_dir = ?opts.stage_dir))]
    pub fn make_stage2_tarball(&self, opts: &BuildOptions) -> Result<bool> {
        self.status(opts, format!("Making stage2 tarball in {:?}", opts.stage_dir));
        match self.run_steps(opts) {
            Ok(()) => Ok(true),
            Err(e) if e.is_build_failure() => {
                error!("{}", e);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    fn status(&self, opts: &BuildOptions, msg: impl AsRef<str>) {
        info!(
            "[{},{}]: {}",
            opts.repo.dver,
            opts.repo.basearch,
            msg.as_ref()
        );
    }

    fn installed(&self, stage_dir: &Path, pkg: &str) -> Result<bool> {
        package_installed(&self.runner, stage_dir, pkg)
    }

    fn run_steps(&self, opts: &BuildOptions) -> Result<()> {
        let stage_dir = opts.stage_dir.as_path();
        let (_, topdir) = split_stage_dir(stage_dir)?;
        let rt = &self.runtime;

        self.status(opts, format!("Installing packages {:?}", opts.packages));
        install_packages(
            rt,
            &self.runner,
            &self.installer,
            stage_dir,
            &opts.packages,
            &opts.repo,
        )?;

        if !opts.patch_dirs.is_empty() {
            self.status(opts, format!("Patching packages using {:?}", opts.patch_dirs));
            apply_patches(rt, &self.runner, stage_dir, &opts.patch_dirs)?;
        }

        if self.installed(stage_dir, "gsi-openssh")? {
            self.status(opts, "Fixing gsissh config dir (if needed)");
            fix_gsissh_config_dir(rt, stage_dir)?;
        }

        if self.installed(stage_dir, "osg-version")? {
            self.status(opts, "Fixing osg-version");
            fix_osg_version(rt, stage_dir, opts.relnum)?;
        }

        self.status(opts, "Fixing broken /etc/alternatives symlinks");
        let repaired = fix_alternatives_symlinks(rt, stage_dir)?;
        info!("Rewrote {} alternatives symlink(s)", repaired);

        self.status(
            opts,
            format!("Copying OSG scripts from {:?}", opts.post_scripts_dir),
        );
        copy_post_scripts(
            rt,
            stage_dir,
            &opts.post_scripts_dir,
            &opts.repo.dver,
            &opts.repo.basearch,
        )?;

        let stage1_rpmlist = read_stage1_rpmlist(rt, stage_dir)?;
        self.status(opts, "Writing package list to osg/rpm-versions.txt");
        write_package_list(rt, &self.runner, stage_dir, &stage1_rpmlist)?;

        self.status(opts, "Fixing permissions");
        fix_permissions(&self.runner, stage_dir)?;

        self.status(opts, format!("Creating tarball {:?}", opts.tarball));
        tar_stage_dir(rt, &self.runner, stage_dir, &opts.tarball)?;

        self.status(opts, "Removing empty dirs from tarball");
        let mut recreate_dirs: Vec<String> =
            ALWAYS_RECREATE_DIRS.iter().map(|d| d.to_string()).collect();
        if self.installed(stage_dir, "fetch-crl")? {
            recreate_dirs.push(FETCH_CRL_DIR.to_string());
        }
        remove_empty_dirs_from_tarball(
            rt,
            &self.runner,
            &opts.tarball,
            &topdir,
            &recreate_dirs,
        )?;

        Ok(())
    }
}
