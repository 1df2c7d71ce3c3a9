//! Mapping between local paths and remote keys
//!
//! Keys always use `/` as separator. Local paths are normalized lexically
//! (no filesystem access): `\` is treated as a separator, empty and `.`
//! components are dropped and `..` pops the previous component.

use crate::error::{Result, TransferError};
use std::path::{Path, PathBuf};

/// Remote key separator
pub const KEY_SEPARATOR: char = '/';

fn components(path: &Path) -> Vec<String> {
    let text = path.to_string_lossy().replace('\\', "/");
    let mut out: Vec<String> = Vec::new();
    for part in text.split(KEY_SEPARATOR) {
        match part {
            "" | "." => {}
            ".." => {
                if out.last().is_some_and(|last| last != "..") {
                    out.pop();
                } else {
                    out.push("..".to_string());
                }
            }
            other => out.push(other.to_string()),
        }
    }
    out
}

fn scope_error(root: &Path, path: &Path) -> TransferError {
    TransferError::PathScope {
        root: root.to_path_buf(),
        path: path.to_path_buf(),
    }
}

/// Key suffix of `file_path` relative to `local_root`
///
/// Fails with `PathScope` when the file is not strictly below the root.
pub fn relative_key(local_root: &Path, file_path: &Path) -> Result<String> {
    let root = components(local_root);
    let file = components(file_path);

    if file.len() <= root.len() || file[..root.len()] != root[..] {
        return Err(scope_error(local_root, file_path));
    }
    let rest = &file[root.len()..];
    if rest.iter().any(|c| c == "..") {
        return Err(scope_error(local_root, file_path));
    }
    Ok(rest.join("/"))
}

/// Full remote key for a relative key under `prefix`
pub fn remote_key(prefix: &str, relative_key: &str) -> String {
    let prefix = prefix.trim_end_matches(KEY_SEPARATOR);
    let relative = relative_key.trim_start_matches(KEY_SEPARATOR);
    match (prefix.is_empty(), relative.is_empty()) {
        (true, _) => relative.to_string(),
        (false, true) => prefix.to_string(),
        (false, false) => format!("{}{}{}", prefix, KEY_SEPARATOR, relative),
    }
}

/// Local destination for `key` listed under `prefix`
///
/// Inverse of [`remote_key`]. Keys that do not start with the prefix, that
/// name the prefix itself, or whose remainder contains `.`/`..` segments are
/// rejected with `PathScope`.
pub fn local_path_for_key(local_root: &Path, prefix: &str, key: &str) -> Result<PathBuf> {
    let rejected = || scope_error(local_root, Path::new(key));

    let rest = key.strip_prefix(prefix).ok_or_else(rejected)?;
    let mut path = local_root.to_path_buf();
    let mut depth = 0;
    for part in rest.split(KEY_SEPARATOR) {
        match part {
            "" => {}
            "." | ".." => return Err(rejected()),
            part if part.contains('\\') => return Err(rejected()),
            part => {
                path.push(part);
                depth += 1;
            }
        }
    }
    if depth == 0 {
        return Err(rejected());
    }
    Ok(path)
}

/// Key of the zero-byte directory marker for `prefix`
pub fn directory_marker_key(prefix: &str) -> String {
    format!("{}{}", prefix.trim_end_matches(KEY_SEPARATOR), KEY_SEPARATOR)
}

pub fn is_directory_marker(key: &str, size: u64) -> bool {
    size == 0 && key.ends_with(KEY_SEPARATOR)
}

/// Object key named by a local-style path, separators normalized to `/`
pub fn key_from_path(path: &Path) -> String {
    path.to_string_lossy()
        .replace('\\', "/")
        .trim_start_matches(KEY_SEPARATOR)
        .to_string()
}

/// Whether a prefix would address the whole bucket
pub fn is_root_prefix(prefix: &str) -> bool {
    prefix.trim_matches(KEY_SEPARATOR).is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_relative_key_basic() {
        let key = relative_key(Path::new("/data/in"), Path::new("/data/in/a/b.csv")).unwrap();
        assert_eq!(key, "a/b.csv");
    }

    #[test]
    fn test_separator_variants_agree() {
        let file = Path::new("/data/in/sub/file.txt");
        let roots = ["/data/in", "/data/in/", "data/in", "/data//in/", "/data/./in"];
        for root in roots {
            let key = relative_key(Path::new(root), file).unwrap();
            assert_eq!(remote_key("out/", &key), "out/sub/file.txt", "root {:?}", root);
            assert_eq!(remote_key("out", &key), "out/sub/file.txt", "root {:?}", root);
        }
    }

    #[test]
    fn test_backslash_separators() {
        let key = relative_key(Path::new("C:\\data"), Path::new("C:\\data\\x\\y.bin")).unwrap();
        assert_eq!(key, "x/y.bin");
    }

    #[test]
    fn test_outside_root_rejected() {
        for file in ["/data/other/x", "/data/in", "/data/in/../secret", "/etc/passwd"] {
            let err = relative_key(Path::new("/data/in"), Path::new(file)).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::PathScope, "file {:?}", file);
        }
    }

    #[test]
    fn test_dotdot_inside_root_allowed() {
        let key = relative_key(Path::new("/data/in"), Path::new("/data/in/a/../b.txt")).unwrap();
        assert_eq!(key, "b.txt");
    }

    #[test]
    fn test_relative_root_cannot_escape() {
        let err = relative_key(Path::new("."), Path::new("../x")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PathScope);
        assert_eq!(relative_key(Path::new("."), Path::new("x/y")).unwrap(), "x/y");
    }

    #[test]
    fn test_remote_key_empty_prefix() {
        assert_eq!(remote_key("", "a/b"), "a/b");
        assert_eq!(remote_key("/", "/a/b"), "a/b");
        assert_eq!(remote_key("p", ""), "p");
    }

    #[test]
    fn test_local_path_for_key() {
        let root = Path::new("/dl");
        assert_eq!(
            local_path_for_key(root, "data/2024", "data/2024/x/y.csv").unwrap(),
            PathBuf::from("/dl/x/y.csv")
        );
        assert_eq!(
            local_path_for_key(root, "data/2024/", "data/2024/y.csv").unwrap(),
            PathBuf::from("/dl/y.csv")
        );
        assert_eq!(
            local_path_for_key(root, "", "top.txt").unwrap(),
            PathBuf::from("/dl/top.txt")
        );
    }

    #[test]
    fn test_local_path_for_key_rejects_escapes() {
        let root = Path::new("/dl");
        for key in [
            "data/../../etc/passwd",
            "data/./x",
            "data/",
            "other/x",
            "data/a\\..\\b",
        ] {
            let err = local_path_for_key(root, "data", key).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::PathScope, "key {:?}", key);
        }
    }

    #[test]
    fn test_directory_markers() {
        assert_eq!(directory_marker_key("a/b"), "a/b/");
        assert_eq!(directory_marker_key("a/b/"), "a/b/");
        assert!(is_directory_marker("a/b/", 0));
        assert!(!is_directory_marker("a/b/", 3));
        assert!(!is_directory_marker("a/b", 0));
    }

    #[test]
    fn test_key_from_path() {
        assert_eq!(key_from_path(Path::new("dir\\sub\\f.txt")), "dir/sub/f.txt");
        assert_eq!(key_from_path(Path::new("/abs/f.txt")), "abs/f.txt");
    }

    #[test]
    fn test_root_prefix() {
        assert!(is_root_prefix(""));
        assert!(is_root_prefix("/"));
        assert!(is_root_prefix("//"));
        assert!(!is_root_prefix("a/"));
    }
}
