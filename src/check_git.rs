//! Sanity checks for the development repository layout.

use std::collections::BTreeSet;
use std::path::Path;

/// Entries every development repository should ignore.
pub const REQUIRED_IGNORES: &[&str] = &["work"];

/// Outcome of [`check`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GitCheck {
    /// `<dev>/.git` is missing.
    NotARepository,
    /// The repository is usable but could be configured better.
    Suboptimal {
        /// `true` when there is no `.gitignore` at all.
        missing_gitignore: bool,
        /// Required ignore entries that were not found, sorted.
        missing: Vec<&'static str>,
    },
    /// Nothing to report.
    Optimal,
}

impl GitCheck {
    /// Exit status: 2 for no repository, 1 for missing entries, 0 otherwise.
    #[must_use]
    pub const fn exit_code(&self) -> u8 {
        match self {
            Self::NotARepository => 2,
            Self::Suboptimal { missing, .. } if !missing.is_empty() => 1,
            _ => 0,
        }
    }
}

/// Inspect `dev_path` for a git repository and a suitable `.gitignore`.
///
/// # Errors
/// Returns an I/O error if `.gitignore` exists but cannot be read.
pub fn check(dev_path: &Path) -> std::io::Result<GitCheck> {
    if !dev_path.join(".git").is_dir() {
        return Ok(GitCheck::NotARepository);
    }

    let ignore = dev_path.join(".gitignore");
    let (missing_gitignore, present) = if ignore.is_file() {
        let text = std::fs::read_to_string(&ignore)?;
        (false, text.lines().map(str::trim).map(str::to_owned).collect())
    } else {
        (true, BTreeSet::new())
    };

    let missing: Vec<&'static str> = REQUIRED_IGNORES
        .iter()
        .copied()
        .filter(|req| !present.contains(*req))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();

    if missing.is_empty() && !missing_gitignore {
        Ok(GitCheck::Optimal)
    } else {
        Ok(GitCheck::Suboptimal {
            missing_gitignore,
            missing,
        })
    }
}

#[cfg(test)]
#[allow(clippy::all, clippy::pedantic, clippy::nursery)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn plain_directory_is_not_a_repository() {
        let dir = tempfile::tempdir().unwrap();
        let got = check(dir.path()).unwrap();
        assert_eq!(got, GitCheck::NotARepository);
        assert_eq!(got.exit_code(), 2);
    }

    #[test]
    fn missing_gitignore_lists_requirements() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join(".git")).unwrap();
        let got = check(dir.path()).unwrap();
        assert_eq!(
            got,
            GitCheck::Suboptimal {
                missing_gitignore: true,
                missing: vec!["work"],
            }
        );
        assert_eq!(got.exit_code(), 1);
    }

    #[test]
    fn complete_gitignore_is_optimal() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join(".git")).unwrap();
        fs::write(dir.path().join(".gitignore"), "*.shar\nwork\n").unwrap();
        let got = check(dir.path()).unwrap();
        assert_eq!(got, GitCheck::Optimal);
        assert_eq!(got.exit_code(), 0);
    }
}
