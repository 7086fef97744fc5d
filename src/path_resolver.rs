// SPDX-License-Identifier: BSD-3-Clause

//! Path construction and resolution against a session's current working
//! directory, grounded in `resolvePath`/`buildPath`/`dirName` in the
//! original implementation.

use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

/// Join `cwd` and `arg` into a path, coalescing consecutive slashes.
/// `arg` is taken as absolute if it starts with `/`, otherwise relative to
/// `cwd`.
pub fn build_path(cwd: &str, arg: &str) -> String {
    let mut path = if arg.starts_with('/') {
        arg.to_string()
    } else {
        format!("{cwd}/{arg}")
    };

    let mut out = String::with_capacity(path.len());
    let mut prev_slash = false;
    for c in path.drain(..) {
        if c == '/' && prev_slash {
            continue;
        }
        prev_slash = c == '/';
        out.push(c);
    }
    out
}

/// Parent directory of `path` (string form, not filesystem-verified).
fn dir_name(path: &str) -> String {
    match path.rfind('/') {
        Some(0) => "/".to_string(),
        Some(i) => path[..i].to_string(),
        None => "/".to_string(),
    }
}

/// Resolve an absolute path: require its parent directory to exist and be a
/// directory, then collapse `.`/`..`/empty components.
///
/// Returns `None` if the parent directory doesn't exist or isn't a directory.
pub fn resolve_path(path: &str) -> Option<String> {
    assert!(!path.is_empty());
    assert!(path.starts_with('/'));

    let parent = dir_name(path);
    let meta = std::fs::metadata(&parent).ok()?;
    if !meta.is_dir() {
        return None;
    }

    let mut components: Vec<&str> = Vec::new();
    for part in path[1..].split('/') {
        if part.is_empty() || part == "." {
            continue;
        }
        if part == ".." {
            components.pop();
            continue;
        }
        components.push(part);
    }

    if components.is_empty() {
        return Some("/".to_string());
    }

    Some(format!("/{}", components.join("/")))
}

/// `build_path` followed by `resolve_path`.
pub fn build_resolved_path(cwd: &str, arg: &str) -> Option<String> {
    resolve_path(&build_path(cwd, arg))
}

/// Checks a resolved path names an existing directory.
pub fn is_directory(path: &str) -> bool {
    std::fs::metadata(path)
        .map(|m| m.is_dir())
        .unwrap_or(false)
}

/// Checks a resolved path names an existing regular file.
pub fn is_regular_file(path: &str) -> bool {
    std::fs::metadata(path)
        .map(|m| m.is_file())
        .unwrap_or(false)
}

/// Basename of a resolved path (component after the last `/`).
pub fn base_name(path: &str) -> &str {
    Path::new(path)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("/")
}

pub fn to_path_buf(path: &str) -> PathBuf {
    PathBuf::from(path)
}

/// Device id + inode, used to detect the reserved `/devZero` alias.
pub fn dev_ino(path: &str) -> Option<(u64, u64)> {
    std::fs::metadata(path).ok().map(|m| (m.dev(), m.ino()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn build_path_relative_joins_with_cwd() {
        assert_eq!(build_path("/home/user", "docs"), "/home/user/docs");
    }

    #[test]
    fn build_path_absolute_ignores_cwd() {
        assert_eq!(build_path("/home/user", "/etc/passwd"), "/etc/passwd");
    }

    #[test]
    fn build_path_coalesces_consecutive_slashes() {
        assert_eq!(build_path("/home//user", "a//b"), "/home/user/a/b");
    }

    #[test]
    fn resolve_path_collapses_dot_and_dotdot() {
        let dir = tempdir().unwrap();
        let root = dir.path().to_str().unwrap();
        std::fs::create_dir_all(format!("{root}/a/b")).unwrap();

        let resolved = resolve_path(&format!("{root}/a/./b/../c")).unwrap();
        assert_eq!(resolved, format!("{root}/a/c"));
    }

    #[test]
    fn resolve_path_clamps_dotdot_at_root() {
        let resolved = resolve_path("/../../etc").unwrap();
        assert_eq!(resolved, "/etc");
    }

    #[test]
    fn resolve_path_fails_when_parent_missing() {
        assert!(resolve_path("/no/such/dir/child").is_none());
    }

    #[test]
    fn resolve_path_fails_when_parent_is_a_file() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("f");
        std::fs::write(&file_path, b"x").unwrap();
        let bad = format!("{}/child", file_path.to_str().unwrap());
        assert!(resolve_path(&bad).is_none());
    }

    #[test]
    fn base_name_extracts_last_component() {
        assert_eq!(base_name("/a/b/c"), "c");
        assert_eq!(base_name("/"), "/");
    }
}
