//! Change-Set Computer: turns a commit window into file-level deltas.
//!
//! Only paths and statuses are classified here. File bytes are read later, per delta,
//! through a [`ContentResolver`].

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use git2::{Delta, Diff};
use tracing::{debug, info};

use crate::contract::ContentResolver;
use crate::error::GitError;
use crate::filter::Collection;
use crate::repository::GitRepository;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeltaStatus {
    Added,
    Modified,
    Deleted,
    Renamed,
    Unmodified,
}

impl fmt::Display for DeltaStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeltaStatus::Added => "Added",
            DeltaStatus::Modified => "Modified",
            DeltaStatus::Deleted => "Deleted",
            DeltaStatus::Renamed => "Renamed",
            DeltaStatus::Unmodified => "Unmodified",
        };
        f.write_str(name)
    }
}

impl From<Delta> for DeltaStatus {
    fn from(delta: Delta) -> Self {
        match delta {
            Delta::Added | Delta::Copied | Delta::Untracked => DeltaStatus::Added,
            Delta::Modified | Delta::Typechange | Delta::Conflicted => DeltaStatus::Modified,
            Delta::Deleted => DeltaStatus::Deleted,
            Delta::Renamed => DeltaStatus::Renamed,
            Delta::Unmodified | Delta::Ignored | Delta::Unreadable => DeltaStatus::Unmodified,
        }
    }
}

/// One file-level change. `Deleted` deltas carry only `old_path`; all others carry a
/// valid `new_path`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffDelta {
    pub old_path: String,
    pub new_path: String,
    pub status: DeltaStatus,
}

impl DiffDelta {
    pub fn added(path: impl Into<String>) -> Self {
        let path = path.into();
        Self {
            old_path: path.clone(),
            new_path: path,
            status: DeltaStatus::Added,
        }
    }

    pub fn modified(path: impl Into<String>) -> Self {
        Self {
            status: DeltaStatus::Modified,
            ..Self::added(path)
        }
    }

    pub fn deleted(path: impl Into<String>) -> Self {
        Self {
            old_path: path.into(),
            new_path: String::new(),
            status: DeltaStatus::Deleted,
        }
    }

    /// The path this delta is keyed by within a change set.
    pub fn path(&self) -> &str {
        match self.status {
            DeltaStatus::Deleted => &self.old_path,
            _ => &self.new_path,
        }
    }
}

/// Ordered, path-unique deltas for one cycle. Inserting a delta for a path already
/// present replaces the earlier one and moves it to the end.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    deltas: Vec<DiffDelta>,
}

impl ChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, delta: DiffDelta) {
        let path = delta.path().to_string();
        self.deltas.retain(|existing| existing.path() != path);
        self.deltas.push(delta);
    }

    pub fn len(&self) -> usize {
        self.deltas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deltas.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, DiffDelta> {
        self.deltas.iter()
    }

    /// Counts of each status, for logging.
    pub fn summary(&self) -> HashMap<DeltaStatus, usize> {
        let mut counts = HashMap::new();
        for delta in &self.deltas {
            *counts.entry(delta.status).or_insert(0) += 1;
        }
        counts
    }

    /// Deltas between the oldest and newest commit of the window, or between the
    /// workdir anchor and the working directory when one is set. A window of zero or
    /// one commits yields an empty change set.
    pub fn compute(repo: &GitRepository, collection: &Collection) -> Result<ChangeSet, GitError> {
        if let Some(anchor) = collection.workdir_anchor {
            let tree = repo.find_commit(anchor)?.tree().map_err(GitError::op("commit tree"))?;
            let diff = repo.diff_tree_to_workdir(&tree)?;
            let changes = Self::from_diff(&diff);
            info!(anchor = %anchor, deltas = changes.len(), "[DIFF] Computed working directory change set");
            return Ok(changes);
        }

        let (oldest, newest) = match (collection.oldest(), collection.newest()) {
            (Some(oldest), Some(newest)) if collection.commits.len() > 1 => (oldest, newest),
            _ => {
                debug!(window = collection.commits.len(), "[DIFF] Window too small to diff");
                return Ok(ChangeSet::new());
            }
        };
        let old_tree = repo.find_commit(oldest)?.tree().map_err(GitError::op("commit tree"))?;
        let new_tree = repo.find_commit(newest)?.tree().map_err(GitError::op("commit tree"))?;
        let diff = repo.diff_trees(Some(&old_tree), Some(&new_tree))?;
        let changes = Self::from_diff(&diff);
        info!(
            from = %oldest,
            to = %newest,
            deltas = changes.len(),
            "[DIFF] Computed change set"
        );
        Ok(changes)
    }

    /// Every file in the commit's tree as an `Added` delta.
    pub fn full_tree(repo: &GitRepository, commit: git2::Oid) -> Result<ChangeSet, GitError> {
        let tree = repo.find_commit(commit)?.tree().map_err(GitError::op("commit tree"))?;
        let diff = repo.diff_trees(None, Some(&tree))?;
        Ok(Self::from_diff(&diff))
    }

    /// One libgit2 diff lists each path at most once, so deltas are taken in diff order
    /// without the superseding scan [`ChangeSet::insert`] does.
    fn from_diff(diff: &Diff<'_>) -> ChangeSet {
        let deltas = diff.deltas().map(|delta| {
            let status = DeltaStatus::from(delta.status());
            let old_path = delta
                .old_file()
                .path()
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_default();
            let new_path = match status {
                DeltaStatus::Deleted => String::new(),
                _ => delta
                    .new_file()
                    .path()
                    .map(|p| p.to_string_lossy().into_owned())
                    .unwrap_or_default(),
            };
            DiffDelta {
                old_path,
                new_path,
                status,
            }
        });
        ChangeSet {
            deltas: deltas.collect(),
        }
    }
}

impl<'a> IntoIterator for &'a ChangeSet {
    type Item = &'a DiffDelta;
    type IntoIter = std::slice::Iter<'a, DiffDelta>;

    fn into_iter(self) -> Self::IntoIter {
        self.deltas.iter()
    }
}

impl FromIterator<DiffDelta> for ChangeSet {
    fn from_iter<I: IntoIterator<Item = DiffDelta>>(iter: I) -> Self {
        let mut changes = ChangeSet::new();
        for delta in iter {
            changes.insert(delta);
        }
        changes
    }
}

/// Reads delta contents from the checked out working directory.
#[derive(Debug, Clone)]
pub struct WorkdirResolver {
    root: PathBuf,
}

impl WorkdirResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn resolve_path(&self, path: &str) -> PathBuf {
        resolve_in(&self.root, path)
    }
}

impl ContentResolver for WorkdirResolver {
    fn read(&self, path: &str) -> std::io::Result<Vec<u8>> {
        std::fs::read(self.resolve_path(path))
    }
}

/// Joins a repo-relative delta path onto `root`; a leading separator on the delta path
/// would otherwise make `join` discard the root.
pub fn resolve_in(root: &Path, path: &str) -> PathBuf {
    root.join(path.trim_start_matches(['/', '\\']))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn later_delta_supersedes_earlier_for_same_path() {
        let mut changes = ChangeSet::new();
        changes.insert(DiffDelta::added("a.txt"));
        changes.insert(DiffDelta::added("b.txt"));
        changes.insert(DiffDelta::deleted("a.txt"));

        let deltas: Vec<_> = changes.iter().cloned().collect();
        assert_eq!(deltas, vec![DiffDelta::added("b.txt"), DiffDelta::deleted("a.txt")]);
    }

    #[test]
    fn deleted_delta_is_keyed_by_old_path() {
        let delta = DiffDelta::deleted("gone.yml");
        assert_eq!(delta.path(), "gone.yml");
        assert!(delta.new_path.is_empty());
    }

    #[test]
    fn resolve_trims_leading_separator() {
        let root = Path::new("/var/git2consul/data");
        assert_eq!(
            resolve_in(root, "/config.yml"),
            PathBuf::from("/var/git2consul/data/config.yml")
        );
        assert_eq!(
            resolve_in(root, "nested/app.json"),
            PathBuf::from("/var/git2consul/data/nested/app.json")
        );
    }

    #[test]
    fn summary_counts_statuses() {
        let changes: ChangeSet = vec![
            DiffDelta::added("a"),
            DiffDelta::added("b"),
            DiffDelta::modified("c"),
            DiffDelta::deleted("d"),
        ]
        .into_iter()
        .collect();
        let summary = changes.summary();
        assert_eq!(summary[&DeltaStatus::Added], 2);
        assert_eq!(summary[&DeltaStatus::Modified], 1);
        assert_eq!(summary[&DeltaStatus::Deleted], 1);
    }
}
