//! The package manifest shipped as `osg/rpm-versions.txt`.

use std::collections::BTreeSet;
use std::path::Path;

use crate::error::{FsContext, Result};
use crate::process::{CommandRunner, CommandSpec, run_checked};
use crate::runtime::Runtime;

pub const STAGE1_RPMLIST: &str = "stage1_rpmlist";
pub const MANIFEST_FILE: &str = "osg/rpm-versions.txt";

/// Read the NVRs stage 1 left in `stage1_rpmlist`. A missing file is fatal.
#[tracing::instrument(skip(runtime))]
pub fn read_stage1_rpmlist<R: Runtime>(runtime: &R, stage_dir: &Path) -> Result<BTreeSet<String>> {
    let path = stage_dir.join(STAGE1_RPMLIST);
    let content = runtime
        .read_to_string(&path)
        .fs_context(|| format!("unable to read stage 1 package list {:?}", path))?;
    Ok(content.split_whitespace().map(String::from).collect())
}

/// Sorted, newline-terminated manifest text for `installed` minus `exclude`.
pub fn render_manifest(installed: &BTreeSet<String>, exclude: &BTreeSet<String>) -> String {
    let mut out = installed
        .difference(exclude)
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join("\n");
    out.push('\n');
    out
}

/// Write every package installed in `stage_dir` that is not in `exclude`
/// to `osg/rpm-versions.txt`.
#[tracing::instrument(skip(runtime, runner, exclude))]
pub fn write_package_list<R: Runtime, C: CommandRunner + ?Sized>(
    runtime: &R,
    runner: &C,
    stage_dir: &Path,
    exclude: &BTreeSet<String>,
) -> Result<()> {
    let cmd = CommandSpec::new("rpm")
        .arg("--root")
        .arg_path(stage_dir)?
        .arg("-qa");
    let output = run_checked(runner, &cmd, || {
        format!("unable to list packages installed in {:?}", stage_dir)
    })?;
    let installed: BTreeSet<String> = output.stdout.split_whitespace().map(String::from).collect();

    let path = stage_dir.join(MANIFEST_FILE);
    if let Some(parent) = path.parent() {
        runtime
            .create_dir_all(parent)
            .fs_context(|| format!("unable to create {:?}", parent))?;
    }
    runtime
        .write(&path, render_manifest(&installed, exclude).as_bytes())
        .fs_context(|| format!("unable to write {:?}", path))
}
