//! Relative path handling shared by the read engine, storage and scanner.
//!
//! Paths travel on the wire as UTF-8, `/`-separated and relative to the sync root.
//! Anything that could step outside the root is rejected before it reaches storage.

use crate::error::ProtocolError;
use crate::protocol::PATH_LIST_SEPARATOR;
use std::io;
use std::path::{Component, Path, PathBuf};

/// Check that `path` is a plain relative path.
///
/// Rejects empty paths, NUL bytes, absolute paths and parent (`..`) components.
pub fn validate_relative(path: &str) -> Result<(), ProtocolError> {
    use Component::{CurDir, Normal, ParentDir, Prefix, RootDir};

    let invalid = |reason| ProtocolError::InvalidPath {
        path: path.to_string(),
        reason,
    };
    if path.trim().is_empty() {
        return Err(invalid("empty path"));
    }
    if path.contains('\0') {
        return Err(invalid("path contains NUL byte"));
    }
    let mut normal = 0usize;
    for component in Path::new(path).components() {
        match component {
            CurDir => {}
            Normal(_) => normal += 1,
            ParentDir => return Err(invalid("parent directory component")),
            RootDir | Prefix(_) => return Err(invalid("absolute path")),
        }
    }
    if normal == 0 {
        return Err(invalid("path names no file"));
    }
    Ok(())
}

/// Validate `path` and rewrite it in its one canonical spelling.
///
/// `./a.txt`, `dir//a.txt` and `dir/./a.txt` all name the same file as `a.txt`
/// and `dir/a.txt` on disk, so they must also compare equal in the registry.
pub fn canonical_relative(path: &str) -> Result<String, ProtocolError> {
    validate_relative(path)?;
    let parts: Vec<&str> = Path::new(path)
        .components()
        .filter_map(|c| match c {
            Component::Normal(s) => s.to_str(),
            _ => None,
        })
        .collect();
    Ok(parts.join("/"))
}

/// Decode a NEW_FILE_PATH / NEW_FILE_END payload into a canonical path.
pub fn decode_path(payload: &[u8]) -> Result<String, ProtocolError> {
    let path = std::str::from_utf8(payload).map_err(|_| ProtocolError::InvalidUtf8)?;
    canonical_relative(path)
}

/// Split an INIT payload into its entries.
///
/// Blank entries are dropped and duplicates collapse onto their first occurrence;
/// entries are otherwise returned untouched, in wire order.
pub fn split_path_list(payload: &[u8]) -> Result<Vec<String>, ProtocolError> {
    let text = std::str::from_utf8(payload).map_err(|_| ProtocolError::InvalidUtf8)?;
    let mut seen = std::collections::HashSet::new();
    Ok(text
        .split(PATH_LIST_SEPARATOR)
        .filter(|s| !s.trim().is_empty())
        .filter(|s| seen.insert(*s))
        .map(str::to_string)
        .collect())
}

/// Resolve a relative wire path to a location under `root`.
///
/// Existing paths are canonicalized so a symlink inside the root cannot point the
/// write somewhere else; for new files the parent is canonicalized instead.
pub fn normalize_under_root(root: &Path, rel: &str) -> io::Result<PathBuf> {
    validate_relative(rel).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    let mut joined = root.to_path_buf();
    for component in Path::new(rel).components() {
        if let Component::Normal(s) = component {
            joined.push(s);
        }
    }

    let canon_root = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());
    let escapes = || {
        io::Error::new(
            io::ErrorKind::PermissionDenied,
            format!("path {rel:?} escapes sync root"),
        )
    };

    if let Ok(canon) = joined.canonicalize() {
        if !canon.starts_with(&canon_root) {
            return Err(escapes());
        }
        return Ok(canon);
    }
    if let (Some(parent), Some(name)) = (joined.parent(), joined.file_name()) {
        if let Ok(canon_parent) = parent.canonicalize() {
            if !canon_parent.starts_with(&canon_root) {
                return Err(escapes());
            }
            return Ok(canon_parent.join(name));
        }
    }
    // Parent does not exist yet; components were already checked
    Ok(joined)
}

/// Render `full` relative to `root` as a `/`-separated wire path.
pub fn to_wire_path(root: &Path, full: &Path) -> Option<String> {
    let rel = full.strip_prefix(root).ok()?;
    let mut parts = Vec::new();
    for component in rel.components() {
        match component {
            Component::Normal(s) => parts.push(s.to_str()?.to_string()),
            Component::CurDir => {}
            _ => return None,
        }
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn safe_relative_paths_pass() {
        assert!(validate_relative("a.txt").is_ok());
        assert!(validate_relative("parent/path.txt").is_ok());
        assert!(validate_relative("./dir/./file.txt").is_ok());
    }

    #[test]
    fn unsafe_paths_are_rejected() {
        assert!(validate_relative("").is_err());
        assert!(validate_relative("   ").is_err());
        assert!(validate_relative("../etc/passwd").is_err());
        assert!(validate_relative("dir/../../etc/passwd").is_err());
        assert!(validate_relative("/etc/passwd").is_err());
        assert!(validate_relative("file\0.txt").is_err());
        assert!(validate_relative(".").is_err());
    }

    #[test]
    fn decode_path_rejects_invalid_utf8() {
        assert!(matches!(
            decode_path(&[0xff, 0xfe]),
            Err(ProtocolError::InvalidUtf8)
        ));
        assert_eq!(decode_path(b"dir/a.txt").unwrap(), "dir/a.txt");
    }

    #[test]
    fn aliases_collapse_to_one_spelling() {
        assert_eq!(canonical_relative("taken.txt").unwrap(), "taken.txt");
        assert_eq!(canonical_relative("./taken.txt").unwrap(), "taken.txt");
        assert_eq!(canonical_relative("dir//a.txt").unwrap(), "dir/a.txt");
        assert_eq!(canonical_relative("dir/./a.txt").unwrap(), "dir/a.txt");
        assert_eq!(canonical_relative("dir/a.txt/").unwrap(), "dir/a.txt");
        assert!(canonical_relative("./../a.txt").is_err());
        assert_eq!(decode_path(b"./dir//b.txt").unwrap(), "dir/b.txt");
    }

    #[test]
    fn path_list_drops_blanks_and_duplicates() {
        let list = split_path_list(b"a.txt\n\n  \ndir/b.txt\na.txt\n").unwrap();
        assert_eq!(list, vec!["a.txt".to_string(), "dir/b.txt".to_string()]);
        assert!(split_path_list(b"").unwrap().is_empty());
    }

    #[test]
    fn normalize_keeps_paths_under_root() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        fs::create_dir(root.join("subdir")).unwrap();

        let result = normalize_under_root(root, "subdir/new.txt").unwrap();
        assert!(result.ends_with("subdir/new.txt"));

        // Parent does not exist yet
        let result = normalize_under_root(root, "a/b/c.txt").unwrap();
        assert!(result.ends_with("a/b/c.txt"));

        assert!(normalize_under_root(root, "../outside.txt").is_err());
    }

    #[cfg(unix)]
    #[test]
    fn normalize_refuses_symlink_escape() {
        let outside = TempDir::new().unwrap();
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        std::os::unix::fs::symlink(outside.path(), root.join("link")).unwrap();

        let err = normalize_under_root(root, "link/file.txt").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::PermissionDenied);
    }

    #[test]
    fn wire_paths_use_forward_slashes() {
        let root = Path::new("/srv/sync");
        assert_eq!(
            to_wire_path(root, &root.join("dir").join("a.txt")).as_deref(),
            Some("dir/a.txt")
        );
        assert_eq!(to_wire_path(root, root), None);
        assert_eq!(to_wire_path(root, Path::new("/elsewhere/a.txt")), None);
    }
}
