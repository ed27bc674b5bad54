//! Packing the staging directory into the stage 2 tarball.
//!
//! The tarball is built in two passes: `tar` packs the tree with an exclude
//! list (transient files plus everything stage 1 already shipped), then
//! [`remove_empty_dirs_from_tarball`] rewrites it without empty directories.

mod exclude;
mod prune;

use log::{debug, info};
use std::path::{Path, PathBuf};

use crate::error::{BuildError, FsContext, Result};
use crate::process::{CommandRunner, CommandSpec, path_str, run_checked};
use crate::runtime::Runtime;

pub use exclude::{render_exclude_list, write_exclude_list};
pub use prune::{pack_dir, remove_empty_dirs, remove_empty_dirs_from_tarball, unpack};

pub const STAGE1_FILELIST: &str = "stage1_filelist";
pub const EXCLUDE_LIST_NAME: &str = "exclude_list";

/// Patterns never shipped in the tarball: logs, caches, pseudo filesystems,
/// package manager bookkeeping and a few stage 1 only binaries.
pub const DEFAULT_EXCLUDES: &[&str] = &[
    "var/log/yum.log",
    "tmp/*",
    "var/cache/yum/*",
    "var/lib/rpm/*",
    "var/lib/yum/*",
    "var/tmp/*",
    "dev/*",
    "proc/*",
    "etc/rc.d/rc?.d",
    "etc/alternatives",
    "var/lib/alternatives",
    "usr/bin/[[]",
    "usr/share/man/man1/[[].1.gz",
    "bin/dbus*",
    "lib/libcap*",
    "lib/dbus*",
    "lib/security/pam*.so",
    "lib64/libcap*",
    "lib64/dbus*",
    "lib64/security/pam*.so",
    "usr/bin/gnome*",
    "*~",
    "stage1_rpmlist",
];

/// Split an absolute staging path into its parent and final component.
pub(crate) fn split_stage_dir(stage_dir: &Path) -> Result<(PathBuf, String)> {
    let base = stage_dir
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| {
            BuildError::Internal(anyhow::anyhow!(
                "staging directory {:?} has no usable final component",
                stage_dir
            ))
        })?;
    let parent = stage_dir.parent().ok_or_else(|| {
        BuildError::Internal(anyhow::anyhow!("staging directory {:?} has no parent", stage_dir))
    })?;
    Ok((parent.to_path_buf(), base.to_string()))
}

/// Create a gzipped tarball of `stage_dir` whose entries all start with the
/// staging directory's name.
#[tracing::instrument(skip(runtime, runner))]
pub fn tar_stage_dir<R: Runtime, C: CommandRunner + ?Sized>(
    runtime: &R,
    runner: &C,
    stage_dir: &Path,
    tarball: &Path,
) -> Result<()> {
    let (parent, base) = split_stage_dir(stage_dir)?;
    let tarball = if tarball.is_absolute() {
        tarball.to_path_buf()
    } else {
        runtime
            .current_dir()
            .fs_context(|| "unable to determine the current directory")?
            .join(tarball)
    };

    let exclude_list = parent.join(EXCLUDE_LIST_NAME);
    let cmd = CommandSpec::new("tar")
        .arg("-C")
        .arg_path(&parent)?
        .arg("-czf")
        .arg_path(&tarball)?
        .arg(format!("--exclude-from={}", path_str(&exclude_list)?))
        .arg(&base)
        .stream();

    let filelist = stage_dir.join(STAGE1_FILELIST);
    let filelist = runtime.is_file(&filelist).then_some(filelist);
    write_exclude_list(
        runtime,
        filelist.as_deref(),
        &exclude_list,
        &base,
        DEFAULT_EXCLUDES,
    )?;

    info!("Packing {:?} into {:?}", stage_dir, tarball);
    let result = run_checked(runner, &cmd, || {
        format!(
            "unable to create tarball ({:?}) from stage 2 dir ({:?})",
            tarball, stage_dir
        )
    });

    if let Err(e) = runtime.remove_file(&exclude_list) {
        debug!("could not remove {:?}: {}", exclude_list, e);
    }
    result.map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ToolStatus;
    use crate::process::{CommandOutput, MockCommandRunner};
    use crate::runtime::RealRuntime;
    use std::fs;
    use std::sync::{Arc, Mutex};
    use tempfile::tempdir;

    fn capturing_tar(
        code: i32,
        seen: Arc<Mutex<Option<(CommandSpec, String)>>>,
    ) -> MockCommandRunner {
        let mut runner = MockCommandRunner::new();
        runner.expect_run().times(1).returning(move |cmd| {
            let exclude_from = cmd
                .args
                .iter()
                .find_map(|a| a.strip_prefix("--exclude-from="))
                .unwrap()
                .to_string();
            let content = fs::read_to_string(exclude_from).unwrap();
            *seen.lock().unwrap() = Some((cmd.clone(), content));
            Ok(CommandOutput::exited(code, ""))
        });
        runner
    }

    #[test]
    fn test_split_stage_dir() {
        let (parent, base) = split_stage_dir(Path::new("/build/el7/stage2")).unwrap();
        assert_eq!(parent, PathBuf::from("/build/el7"));
        assert_eq!(base, "stage2");

        let err = split_stage_dir(Path::new("/")).unwrap_err();
        assert!(!err.is_build_failure());
    }

    #[test]
    fn test_tar_stage_dir_command_and_exclude_list() {
        let root = tempdir().unwrap();
        let stage = root.path().join("stage2");
        fs::create_dir_all(&stage).unwrap();
        fs::write(stage.join(STAGE1_FILELIST), "etc/foo.conf\n./usr/lib/libc.so.6\n").unwrap();
        let tarball = root.path().join("out/osg-wn-client.tar.gz");

        let seen = Arc::new(Mutex::new(None));
        let runner = capturing_tar(0, Arc::clone(&seen));
        tar_stage_dir(&RealRuntime, &runner, &stage, &tarball).unwrap();

        let (cmd, content) = seen.lock().unwrap().clone().unwrap();
        let exclude_list = root.path().join(EXCLUDE_LIST_NAME);
        assert_eq!(
            cmd.args,
            vec![
                "-C".to_string(),
                root.path().to_string_lossy().into_owned(),
                "-czf".to_string(),
                tarball.to_string_lossy().into_owned(),
                format!("--exclude-from={}", exclude_list.display()),
                "stage2".to_string(),
            ]
        );
        let lines: Vec<&str> = content.lines().collect();
        assert!(lines.contains(&"stage2/etc/foo.conf"));
        assert!(lines.contains(&"stage2/usr/lib/libc.so.6"));
        assert!(lines.contains(&"stage2/var/lib/rpm/*"));
        assert!(lines.contains(&"stage2/stage1_rpmlist"));

        // consumed once, then discarded
        assert!(!exclude_list.exists());
    }

    #[test]
    fn test_tar_stage_dir_without_filelist_still_excludes_defaults() {
        let root = tempdir().unwrap();
        let stage = root.path().join("stage2");
        fs::create_dir_all(&stage).unwrap();

        let seen = Arc::new(Mutex::new(None));
        let runner = capturing_tar(0, Arc::clone(&seen));
        tar_stage_dir(&RealRuntime, &runner, &stage, &root.path().join("t.tar.gz")).unwrap();

        let (_, content) = seen.lock().unwrap().clone().unwrap();
        assert_eq!(content.lines().count(), DEFAULT_EXCLUDES.len());
    }

    #[test]
    fn test_tar_stage_dir_failure() {
        let root = tempdir().unwrap();
        let stage = root.path().join("stage2");
        fs::create_dir_all(&stage).unwrap();

        let seen = Arc::new(Mutex::new(None));
        let runner = capturing_tar(2, seen);
        let err = tar_stage_dir(&RealRuntime, &runner, &stage, &root.path().join("t.tar.gz"))
            .unwrap_err();
        match &err {
            BuildError::Tool { status, .. } => assert_eq!(*status, ToolStatus::Exited(2)),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(err.to_string().contains("unable to create tarball"));
        assert!(!root.path().join(EXCLUDE_LIST_NAME).exists());
    }
}
