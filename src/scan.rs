// Initial enumeration of the sync root, seeds the file registry

use crate::paths::to_wire_path;
use anyhow::{Context, Result};
use std::path::Path;
use tracing::{debug, warn};

/// Recursively list every regular file under `root` as a relative wire path.
///
/// Symlinks are not followed. Entries that cannot be read, or whose names are not
/// valid UTF-8, are skipped with a warning. The result is sorted so the registry
/// order is stable across restarts.
pub fn enumerate_sync_root(root: &Path) -> Result<Vec<String>> {
    use walkdir::WalkDir;

    let meta = std::fs::metadata(root)
        .with_context(|| format!("sync root {} is not accessible", root.display()))?;
    if !meta.is_dir() {
        anyhow::bail!("sync root {} is not a directory", root.display());
    }

    let mut paths = Vec::new();
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!(error = %e, "skipping unreadable entry during scan");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        match to_wire_path(root, entry.path()) {
            Some(rel) => paths.push(rel),
            None => warn!(path = %entry.path().display(), "skipping file with non UTF-8 name"),
        }
    }
    paths.sort();
    debug!(count = paths.len(), root = %root.display(), "scanned sync root");
    Ok(paths)
}
