//! Deletion safety policy.
//!
//! An entry is eligible for deletion only if BOTH hold:
//! - its last-modified age is strictly greater than the minimum age, and
//! - its path lies under one of the allow-listed volatile roots.
//!
//! Protected roots (home, documents, application data) are never eligible,
//! even when they happen to sit inside a volatile root. Containment is checked
//! component-wise on lexically normalized paths, so `..` cannot climb out of
//! a root and `/tmpfoo` is not "under" `/tmp`.

use std::path::{Component, Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct SafetyPolicy {
    min_age: Duration,
    volatile_roots: Vec<PathBuf>,
    protected_roots: Vec<PathBuf>,
}

impl SafetyPolicy {
    pub fn new(min_age: Duration, volatile_roots: Vec<PathBuf>, protected_roots: Vec<PathBuf>) -> Self {
        let mut volatile_roots: Vec<PathBuf> = volatile_roots.iter().map(|p| normalize(p)).collect();
        volatile_roots.sort();
        volatile_roots.dedup();
        Self {
            min_age,
            volatile_roots,
            protected_roots: protected_roots.iter().map(|p| normalize(p)).collect(),
        }
    }

    pub fn min_age(&self) -> Duration {
        self.min_age
    }

    pub fn volatile_roots(&self) -> &[PathBuf] {
        &self.volatile_roots
    }

    /// Strictly under a volatile root (the root itself is never deletable)
    pub fn is_under_volatile_root(&self, path: &Path) -> bool {
        let path = normalize(path);
        self.volatile_roots
            .iter()
            .any(|root| path != *root && path.starts_with(root))
    }

    /// Inside a protected root, unless a more specific volatile root claims
    /// the path (`~/.cache` under a protected `~`). Ties go to protected.
    pub fn is_protected(&self, path: &Path) -> bool {
        let path = normalize(path);
        let Some(protected) = deepest_match(&self.protected_roots, &path) else {
            return false;
        };
        match deepest_match(&self.volatile_roots, &path) {
            Some(volatile) => protected >= volatile,
            None => true,
        }
    }

    pub fn is_old_enough(&self, age: Duration) -> bool {
        age > self.min_age
    }

    /// The full verdict used by both analyze and the apply-time re-check
    pub fn is_safe(&self, path: &Path, age: Duration) -> bool {
        self.is_old_enough(age) && self.is_under_volatile_root(path) && !self.is_protected(path)
    }

    /// Human-readable explanation of the verdict
    pub fn explain(&self, path: &Path, age: Duration) -> String {
        let days = age.as_secs() / 86_400;
        let min_days = self.min_age.as_secs() / 86_400;
        if self.is_protected(path) {
            "inside a protected location".to_string()
        } else if !self.is_under_volatile_root(path) {
            "not under a temp/cache location".to_string()
        } else if !self.is_old_enough(age) {
            format!("modified {} days ago (needs more than {})", days, min_days)
        } else {
            format!("file is {} days old", days)
        }
    }
}

/// Component depth of the deepest root containing `path`
fn deepest_match(roots: &[PathBuf], path: &Path) -> Option<usize> {
    roots
        .iter()
        .filter(|root| path.starts_with(root))
        .map(|root| root.components().count())
        .max()
}

/// Lexical normalization: drops `.`, resolves `..` against preceding
/// components. Does not touch the filesystem (and so never follows symlinks).
pub(crate) fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
