use std::path::Path;

use crate::error::{FsContext, Result};
use crate::runtime::Runtime;

/// Exclude patterns for `tar --exclude-from`: every stage 1 file followed by
/// `extra_excludes`, each under `prepend_dir`.
///
/// Leading `./` and `/` are dropped from file list entries. Entries naming
/// the staging root itself are skipped, since they would exclude everything.
pub fn render_exclude_list(
    stage1_filelist: Option<&str>,
    prepend_dir: &str,
    extra_excludes: &[&str],
) -> String {
    let mut out = String::new();
    let filelist = stage1_filelist.unwrap_or_default();
    for line in filelist.lines() {
        let mut entry = line.trim_end_matches('\r');
        while let Some(rest) = entry.strip_prefix("./") {
            entry = rest;
        }
        let entry = entry.trim_start_matches('/');
        if entry.is_empty() || entry == "." {
            continue;
        }
        out.push_str(prepend_dir);
        out.push('/');
        out.push_str(entry);
        out.push('\n');
    }
    for excl in extra_excludes {
        out.push_str(prepend_dir);
        out.push('/');
        out.push_str(excl);
        out.push('\n');
    }
    out
}

#[tracing::instrument(skip(runtime, extra_excludes))]
pub fn write_exclude_list<R: Runtime>(
    runtime: &R,
    stage1_filelist: Option<&Path>,
    exclude_list: &Path,
    prepend_dir: &str,
    extra_excludes: &[&str],
) -> Result<()> {
    let filelist = match stage1_filelist {
        Some(path) => {
            debug_assert_ne!(path, exclude_list);
            Some(
                runtime
                    .read_to_string(path)
                    .fs_context(|| format!("unable to read {:?}", path))?,
            )
        }
        None => None,
    };
    let content = render_exclude_list(filelist.as_deref(), prepend_dir, extra_excludes);
    runtime
        .write(exclude_list, content.as_bytes())
        .fs_context(|| format!("unable to write exclude list {:?}", exclude_list))
}
