//! Patch application on the staged tree.
//!
//! Patches are gathered from every patch directory and applied in order of
//! their file name alone, so `02-foo.patch` sorts after `el7/01-bar.patch`.
//! Each one must apply cleanly; the first failure stops the build.

use log::{info, warn};
use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};

use crate::error::{BuildError, FsContext, Result};
use crate::process::{CommandRunner, CommandSpec, run_checked};
use crate::runtime::Runtime;

pub const PATCH_GLOB: &str = "*.patch";
const PATCH_EXTENSION: &str = "patch";

/// Collect `*.patch` files from `patch_dirs`, sorted by file name.
///
/// The sort is stable, so same-named patches from different directories keep
/// the order in which their directories were given. A patch whose name is
/// not valid UTF-8 is an error rather than being skipped.
pub fn collect_patches<R: Runtime>(runtime: &R, patch_dirs: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let pattern = glob::Pattern::new(PATCH_GLOB).map_err(|e| BuildError::Internal(e.into()))?;
    let mut patches = Vec::new();
    for dir in patch_dirs {
        if !runtime.is_dir(dir) {
            warn!("patch directory {:?} does not exist", dir);
            continue;
        }
        let entries = runtime
            .read_dir(dir)
            .fs_context(|| format!("unable to read patch dir {:?}", dir))?;
        for entry in entries {
            let Some(name) = entry.file_name() else {
                continue;
            };
            let is_patch = match name.to_str() {
                Some(name) => pattern.matches(name),
                None if entry.extension() == Some(OsStr::new(PATCH_EXTENSION)) => {
                    return Err(BuildError::Internal(anyhow::anyhow!(
                        "patch file {:?} does not have a UTF-8 name",
                        entry
                    )));
                }
                None => false,
            };
            if is_patch {
                patches.push(entry);
            }
        }
    }
    patches.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    warn_duplicate_names(&patches);
    Ok(patches)
}

fn warn_duplicate_names(patches: &[PathBuf]) {
    let mut seen: HashMap<OsString, &Path> = HashMap::new();
    for patch in patches {
        let Some(name) = patch.file_name() else {
            continue;
        };
        if let Some(first) = seen.insert(name.to_os_string(), patch) {
            warn!(
                "patch {:?} has the same name as {:?}; applying in directory order",
                patch, first
            );
        }
    }
}

/// Apply every patch in `patch_dirs` to `stage_dir` with `-p1` and no fuzz.
#[tracing::instrument(skip(runtime, runner))]
pub fn apply_patches<R: Runtime, C: CommandRunner + ?Sized>(
    runtime: &R,
    runner: &C,
    stage_dir: &Path,
    patch_dirs: &[PathBuf],
) -> Result<()> {
    for patch in collect_patches(runtime, patch_dirs)? {
        info!("Applying patch {:?}", patch);
        let cmd = CommandSpec::new("patch")
            .args(["-p1", "--force", "--fuzz=0", "--no-backup-if-mismatch", "--input"])
            .arg_path(&patch)?
            .dir(stage_dir)
            .stream();
        run_checked(runner, &cmd, || {
            format!("patch file {:?} failed to apply", patch)
        })?;
    }
    Ok(())
}
