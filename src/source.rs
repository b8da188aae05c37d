//! Source and repository abstraction layer
//!
//! A [`RepositorySource`] is one configured hosting account. It can check that
//! it is reachable and enumerate the [`Repository`] handles visible to its
//! credentials. Support for a new hosting provider is added by implementing
//! these two traits; the backup engine only ever talks to them.

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};

/// A remote repository discovered from a source.
#[async_trait]
pub trait Repository: Send + Sync {
    /// Fully-qualified name such as `"org/repo"`, used verbatim as a nested path.
    fn full_name(&self) -> &str;

    /// Clone into `target`, or update the clone already there.
    ///
    /// With `bare` set the result is a mirror without a working tree. Running
    /// this twice against the same directory refreshes it. On failure the
    /// directory is left unchanged or empty, never holding a partial clone.
    async fn clone_into(&self, target: &Path, bare: bool) -> Result<()>;
}

/// One configured hosting account whose repositories are backed up.
#[async_trait]
pub trait RepositorySource: Send + Sync {
    /// Unique, filesystem-safe name used as the first path segment.
    fn name(&self) -> &str;

    /// Cheap reachability and authentication check.
    async fn test(&self) -> Result<()>;

    /// Every repository visible to this source.
    ///
    /// Paging happens internally. Any unrecoverable error fails the whole
    /// listing rather than returning what was fetched so far.
    async fn list_repositories(&self) -> Result<Vec<Box<dyn Repository>>>;
}

/// `<root>/<source name>/<full name>`, with each `/` in the full name
/// becoming its own path segment.
///
/// Fails for full names that would leave the source directory, such as
/// ones with `..` segments.
pub fn target_path(root: &Path, source_name: &str, full_name: &str) -> Result<PathBuf> {
    let mut path = root.join(source_name);
    let mut nested = false;

    for segment in full_name.split('/').filter(|segment| !segment.is_empty()) {
        if !is_safe_segment(segment) {
            bail!("Refusing unsafe repository name {:?}", full_name);
        }
        path.push(segment);
        nested = true;
    }

    if !nested {
        bail!("Refusing empty repository name {:?}", full_name);
    }

    Ok(path)
}

/// Whether a source name can be used as a single directory name.
pub fn is_valid_source_name(name: &str) -> bool {
    !name.is_empty() && is_safe_segment(name)
}

fn is_safe_segment(segment: &str) -> bool {
    segment != "." && segment != ".." && !segment.contains(['/', '\\', '\0'])
}

/// Check if a repository name matches any exclusion pattern.
///
/// Patterns are simple globs where `*` matches any run of characters.
pub fn matches_exclusion_pattern(name: &str, patterns: &[String]) -> bool {
    patterns.iter().any(|pattern| {
        if pattern.contains('*') {
            let pattern_regex = regex::escape(pattern).replace(r"\*", ".*");

            regex::Regex::new(&format!("^{}$", pattern_regex))
                .map(|re| re.is_match(name))
                .unwrap_or(false)
        } else {
            name == pattern
        }
    })
}
