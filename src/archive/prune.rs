use flate2::read::GzDecoder;
use log::{debug, info};
use std::path::Path;

use crate::error::{BuildError, FsContext, Result};
use crate::process::{CommandRunner, CommandSpec, run_checked};
use crate::runtime::{Runtime, strip_root};

/// Rewrite `tarball` without empty directories, keeping `recreate_dirs`
/// (relative to `topdir`) even when they are empty.
///
/// The archive is unpacked into a temporary directory that is removed on
/// every exit path, then packed again with `tar` so hard links and owners
/// survive. The existing file is only replaced once the new archive is
/// complete.
#[tracing::instrument(skip(runtime, runner))]
pub fn remove_empty_dirs_from_tarball<R: Runtime, C: CommandRunner + ?Sized>(
    runtime: &R,
    runner: &C,
    tarball: &Path,
    topdir: &str,
    recreate_dirs: &[String],
) -> Result<()> {
    let name = tarball.file_name().ok_or_else(|| {
        BuildError::Internal(anyhow::anyhow!("tarball path {:?} has no file name", tarball))
    })?;
    let extract_dir = tempfile::Builder::new()
        .prefix("osg-stage2-prune")
        .tempdir()
        .map_err(|e| BuildError::filesystem("unable to create extraction directory", e))?;

    unpack(runtime, tarball, extract_dir.path())
        .fs_context(|| format!("unable to extract {:?}", tarball))?;

    let top = extract_dir.path().join(topdir);
    if runtime.is_dir(&top) {
        remove_empty_dirs(runtime, &top)
            .fs_context(|| format!("unable to remove empty directories from {:?}", tarball))?;
    }
    for dir in recreate_dirs {
        let path = top.join(strip_root(Path::new(dir)));
        runtime
            .create_dir_all(&path)
            .fs_context(|| format!("unable to recreate {:?}", dir))?;
    }
    runtime
        .create_dir_all(&top)
        .fs_context(|| format!("unable to recreate {:?}", topdir))?;

    let rebuilt = extract_dir.path().join(name);
    pack_dir(runner, extract_dir.path(), topdir, &rebuilt)?;

    // Copy next to the target first so the final rename stays on one filesystem.
    let staged = tarball.with_file_name(format!(".{}.tmp", name.to_string_lossy()));
    let replaced = runtime
        .copy(&rebuilt, &staged)
        .and_then(|_| runtime.rename(&staged, tarball));
    if replaced.is_err() && runtime.exists(&staged) {
        let _ = runtime.remove_file(&staged);
    }
    replaced.fs_context(|| format!("unable to replace {:?}", tarball))?;

    info!("Removed empty directories from {:?}", tarball);
    Ok(())
}

/// Unpack a gzipped tarball into `dest`, keeping permissions, links and, when
/// running as root, owners.
pub fn unpack<R: Runtime>(runtime: &R, tarball: &Path, dest: &Path) -> anyhow::Result<()> {
    let file = runtime.open(tarball)?;
    let mut archive = tar::Archive::new(GzDecoder::new(file));
    archive.set_preserve_permissions(true);
    archive.set_preserve_ownerships(runtime.is_privileged());
    archive.set_overwrite(true);
    archive.unpack(dest)?;
    Ok(())
}

/// Pack `parent/name` into a gzipped tarball at `dest` with entries rooted at `name`.
pub fn pack_dir<C: CommandRunner + ?Sized>(
    runner: &C,
    parent: &Path,
    name: &str,
    dest: &Path,
) -> Result<()> {
    let cmd = CommandSpec::new("tar")
        .arg("-C")
        .arg_path(parent)?
        .arg("-czf")
        .arg_path(dest)?
        .arg(name);
    run_checked(runner, &cmd, || format!("unable to pack {:?} into {:?}", name, dest))?;
    Ok(())
}

/// Delete every empty directory under `dir`, innermost first, `dir` included.
/// Symlinks to directories are left alone. Returns true if `dir` was removed.
pub fn remove_empty_dirs<R: Runtime>(runtime: &R, dir: &Path) -> anyhow::Result<bool> {
    let mut empty = true;
    for entry in runtime.read_dir(dir)? {
        if !runtime.is_symlink(&entry) && runtime.is_dir(&entry) {
            if !remove_empty_dirs(runtime, &entry)? {
                empty = false;
            }
        } else {
            empty = false;
        }
    }
    if empty {
        debug!("removing empty directory {:?}", dir);
        runtime.remove_dir(dir)?;
    }
    Ok(empty)
}
