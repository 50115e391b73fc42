//! Directory validation.
//!
//! Every filesystem existence check in bandar goes through [`resolve`], so
//! project trees, base collections, overlay layers and port paths all fail
//! with the same errors.

use std::path::{Component, Path, PathBuf};

use crate::error::{BandarError, Result};

/// Resolve `path` to an absolute, normalized directory.
///
/// With `root`, `path` is interpreted relative to `root` and the result must
/// lie strictly inside it. Containment is decided lexically after `.` and
/// `..` components are folded; symlinks are not followed.
///
/// # Errors
/// - [`BandarError::PathEscapesRoot`] if the normalized path is not below `root`.
/// - [`BandarError::NotADirectory`] if the result is not an existing directory.
pub fn resolve(path: impl AsRef<Path>, root: Option<&Path>) -> Result<PathBuf> {
    let path = path.as_ref();
    let joined = match root {
        Some(root) => root.join(path),
        None => path.to_path_buf(),
    };
    let resolved = normalize(&std::path::absolute(&joined)?);

    if let Some(root) = root {
        let root = normalize(&std::path::absolute(root)?);
        if resolved == root || !resolved.starts_with(&root) {
            return Err(BandarError::PathEscapesRoot {
                path: resolved,
                root,
            });
        }
    }

    if resolved.is_dir() {
        Ok(resolved)
    } else {
        Err(BandarError::NotADirectory { path: resolved })
    }
}

/// Fold `.` and `..` components without touching the filesystem.
///
/// `..` never climbs above the filesystem root.
#[must_use]
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => out.push(component.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() && !path.has_root() {
                    out.push("..");
                }
            }
            Component::Normal(part) => out.push(part),
        }
    }
    out
}

/// Strip `root` and the following separator from the front of `text`.
///
/// Returns `text` unchanged when it does not start with `root/`.
#[must_use]
pub fn strip_root<'a>(text: &'a str, root: &Path) -> &'a str {
    let root = root.to_string_lossy();
    let root = root.trim_end_matches('/');
    text.strip_prefix(root)
        .and_then(|rest| rest.strip_prefix('/'))
        .unwrap_or(text)
}

#[cfg(test)]
#[allow(clippy::all, clippy::pedantic, clippy::nursery)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::fs;

    #[test]
    fn resolves_existing_dir_without_root() {
        let dir = tempfile::tempdir().unwrap();
        let got = resolve(dir.path(), None).unwrap();
        assert_eq!(got, normalize(dir.path()));
    }

    #[test]
    fn missing_dir_is_not_a_directory() {
        let dir = tempfile::tempdir().unwrap();
        let err = resolve(dir.path().join("missing"), None).unwrap_err();
        assert!(matches!(err, BandarError::NotADirectory { .. }), "{err:?}");
    }

    #[test]
    fn regular_file_is_not_a_directory() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("Makefile");
        fs::write(&file, "PORTNAME=x\n").unwrap();
        let err = resolve(&file, None).unwrap_err();
        assert!(matches!(err, BandarError::NotADirectory { .. }), "{err:?}");
    }

    #[test]
    fn relative_to_root_returns_prefixed_path() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("www/nginx")).unwrap();
        let got = resolve("www/nginx", Some(dir.path())).unwrap();
        assert!(got.starts_with(dir.path()));
        assert!(got.ends_with("www/nginx"));
    }

    #[test]
    fn dotdot_inside_root_is_folded() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("www/nginx")).unwrap();
        fs::create_dir_all(dir.path().join("net/curl")).unwrap();
        let got = resolve("www/../net/curl", Some(dir.path())).unwrap();
        assert_eq!(got, normalize(&dir.path().join("net/curl")));
    }

    #[test]
    fn traversal_outside_root_is_rejected() {
        let outer = tempfile::tempdir().unwrap();
        let root = outer.path().join("mnt");
        fs::create_dir_all(&root).unwrap();
        fs::create_dir_all(outer.path().join("secret")).unwrap();
        let err = resolve("../secret", Some(&root)).unwrap_err();
        assert!(matches!(err, BandarError::PathEscapesRoot { .. }), "{err:?}");
    }

    #[test]
    fn absolute_path_outside_root_is_rejected() {
        let root = tempfile::tempdir().unwrap();
        let other = tempfile::tempdir().unwrap();
        let err = resolve(other.path(), Some(root.path())).unwrap_err();
        assert!(matches!(err, BandarError::PathEscapesRoot { .. }), "{err:?}");
    }

    #[test]
    fn root_itself_is_rejected() {
        let root = tempfile::tempdir().unwrap();
        for p in ["", ".", "www/.."] {
            let err = resolve(p, Some(root.path())).unwrap_err();
            assert!(matches!(err, BandarError::PathEscapesRoot { .. }), "{p}: {err:?}");
        }
    }

    #[test]
    fn escape_check_precedes_existence_check() {
        let root = tempfile::tempdir().unwrap();
        let err = resolve("../../does/not/exist", Some(root.path())).unwrap_err();
        assert!(matches!(err, BandarError::PathEscapesRoot { .. }), "{err:?}");
    }

    #[test]
    fn normalize_never_climbs_above_root() {
        assert_eq!(normalize(Path::new("/../../etc")), PathBuf::from("/etc"));
        assert_eq!(normalize(Path::new("/a/./b/../c")), PathBuf::from("/a/c"));
    }

    #[test]
    fn strip_root_requires_separator() {
        let root = Path::new("/tmp/bandar-mnt-x");
        assert_eq!(strip_root("/tmp/bandar-mnt-x/www/nginx", root), "www/nginx");
        assert_eq!(strip_root("/tmp/bandar-mnt-xy/www", root), "/tmp/bandar-mnt-xy/www");
        assert_eq!(strip_root("www/nginx", root), "www/nginx");
    }

    proptest! {
        #[test]
        fn escaping_paths_never_resolve(depth in 1usize..4, tail in "[a-z]{1,8}") {
            let root = tempfile::tempdir().unwrap();
            let candidate = format!("{}{}", "../".repeat(depth), tail);
            let err = resolve(&candidate, Some(root.path())).unwrap_err();
            let is_escape = matches!(err, BandarError::PathEscapesRoot { .. });
            prop_assert!(is_escape);
        }

        #[test]
        fn existing_subdirs_resolve_under_root(parts in prop::collection::vec("[a-z]{1,6}", 1..4)) {
            let root = tempfile::tempdir().unwrap();
            let rel: PathBuf = parts.iter().collect();
            fs::create_dir_all(root.path().join(&rel)).unwrap();
            let got = resolve(&rel, Some(root.path())).unwrap();
            prop_assert!(got.starts_with(normalize(root.path())));
            prop_assert!(got.is_dir());
        }
    }
}
