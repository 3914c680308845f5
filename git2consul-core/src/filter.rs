//! Commit Filter Pipeline: selects the window of commits one sync cycle reconciles.
//!
//! Filters are tagged variants applied left to right over an immutable [`Collection`].
//! Each application returns a new collection plus a success flag; a failing filter leaves
//! its input untouched and the pipeline carries on with the next one, so one bad filter
//! degrades the window instead of aborting the cycle.

use chrono::{DateTime, Utc};
use git2::Oid;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::error::GitError;
use crate::repository::{BranchRef, GitRepository, WalkOrder};

/// The working state threaded through the pipeline.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Collection {
    /// Commit window, oldest first.
    pub commits: Vec<Oid>,
    /// Active branch, set by [`Filter::ByBranch`].
    pub reference: Option<BranchRef>,
    /// When set, the change set is computed against the working directory instead of
    /// between two commits.
    pub workdir_anchor: Option<Oid>,
}

impl Collection {
    pub fn oldest(&self) -> Option<Oid> {
        self.commits.first().copied()
    }

    pub fn newest(&self) -> Option<Oid> {
        self.commits.last().copied()
    }

    /// Applies one filter, logging and keeping the input on failure.
    pub fn filter(self, repo: &GitRepository, filter: &Filter) -> Collection {
        let (next, ok) = filter.apply(repo, &self);
        if ok {
            next
        } else {
            self
        }
    }

    /// Applies every filter in order.
    pub fn filter_all(self, repo: &GitRepository, filters: &[Filter]) -> Collection {
        filters
            .iter()
            .fold(self, |collection, filter| collection.filter(repo, filter))
    }

    fn push_unique(&mut self, id: Oid) {
        if !self.commits.contains(&id) {
            self.commits.push(id);
        }
    }
}

/// One step of the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    /// Resolve the named branch and make it the active reference.
    ByBranch(String),
    /// Commits authored at or after the cutoff, plus one older anchor commit.
    ByDate(DateTime<Utc>),
    /// Complete the window topologically from the active reference down to its oldest
    /// commit.
    ByTopo,
    /// Diff the working directory against the named commit, tag or branch.
    ByHead(String),
    /// Append exactly one commit by id.
    ByCommitId(String),
}

#[derive(Debug, Error)]
pub enum FilterFailure {
    #[error("no active branch reference")]
    MissingReference,
    #[error("cutoff time is unset")]
    ZeroCutoff,
    #[error("empty commit identifier")]
    EmptyIdentifier,
    #[error("invalid commit identifier {0:?}")]
    InvalidIdentifier(String),
    #[error("window is empty, nothing to complete")]
    EmptyWindow,
    #[error("commit {0} is not reachable from the active reference")]
    Unreachable(Oid),
    #[error(transparent)]
    Git(#[from] GitError),
}

impl Filter {
    /// Runs the filter against `input`. On failure the returned collection is a copy of
    /// the input and the flag is `false`.
    pub fn apply(&self, repo: &GitRepository, input: &Collection) -> (Collection, bool) {
        let result = match self {
            Filter::ByBranch(name) => by_branch(repo, input, name),
            Filter::ByDate(cutoff) => by_date(repo, input, *cutoff),
            Filter::ByTopo => by_topo(repo, input),
            Filter::ByHead(anchor) => by_head(repo, input, anchor),
            Filter::ByCommitId(id) => by_commit_id(repo, input, id),
        };
        match result {
            Ok(collection) => {
                debug!(filter = ?self, window = collection.commits.len(), "[FILTER] Applied");
                (collection, true)
            }
            Err(e) => {
                warn!(filter = ?self, error = %e, "[FILTER] Filter failed, keeping previous window");
                (input.clone(), false)
            }
        }
    }
}

fn by_branch(repo: &GitRepository, input: &Collection, name: &str) -> Result<Collection, FilterFailure> {
    let branch = repo.find_branch(name)?;
    info!(branch = %branch.name, target = %branch.target, "[FILTER] Resolved branch");
    Ok(Collection {
        reference: Some(branch),
        ..input.clone()
    })
}

fn by_date(
    repo: &GitRepository,
    input: &Collection,
    cutoff: DateTime<Utc>,
) -> Result<Collection, FilterFailure> {
    let reference = input.reference.as_ref().ok_or(FilterFailure::MissingReference)?;
    if reference.target.is_zero() {
        return Err(FilterFailure::MissingReference);
    }
    if cutoff.timestamp() == 0 {
        return Err(FilterFailure::ZeroCutoff);
    }
    let cutoff_secs = cutoff.timestamp();

    // Newest first; stop at the first commit older than the cutoff, keeping it as the
    // base tree for the diff.
    let mut selected = Vec::new();
    for id in repo.walk(WalkOrder::TimeFirstParent, reference.target)? {
        let commit = repo.find_commit(id)?;
        let authored = commit.author().when().seconds();
        selected.push(id);
        if authored < cutoff_secs {
            debug!(commit = %id, authored, "[FILTER] Anchor commit before cutoff");
            break;
        }
    }

    let mut output = input.clone();
    for id in selected.into_iter().rev() {
        output.push_unique(id);
    }
    Ok(output)
}

fn by_topo(repo: &GitRepository, input: &Collection) -> Result<Collection, FilterFailure> {
    let reference = input.reference.as_ref().ok_or(FilterFailure::MissingReference)?;
    let oldest = input.oldest().ok_or(FilterFailure::EmptyWindow)?;

    let mut newer = Vec::new();
    let mut reached = false;
    for id in repo.walk(WalkOrder::Topological, reference.target)? {
        if id == oldest {
            reached = true;
            break;
        }
        newer.push(id);
    }
    if !reached {
        return Err(FilterFailure::Unreachable(oldest));
    }

    let mut commits = Vec::with_capacity(newer.len() + 1);
    commits.push(oldest);
    commits.extend(newer.into_iter().rev());
    Ok(Collection {
        commits,
        ..input.clone()
    })
}

fn by_head(repo: &GitRepository, input: &Collection, anchor: &str) -> Result<Collection, FilterFailure> {
    if anchor.trim().is_empty() {
        return Err(FilterFailure::EmptyIdentifier);
    }
    let id = repo.resolve_anchor(anchor)?;
    Ok(Collection {
        workdir_anchor: Some(id),
        ..input.clone()
    })
}

fn by_commit_id(repo: &GitRepository, input: &Collection, id: &str) -> Result<Collection, FilterFailure> {
    let id = id.trim();
    if id.is_empty() {
        return Err(FilterFailure::EmptyIdentifier);
    }
    let oid = Oid::from_str(id).map_err(|_| FilterFailure::InvalidIdentifier(id.to_string()))?;
    if oid.is_zero() {
        return Err(FilterFailure::EmptyIdentifier);
    }
    let commit = repo.find_commit(oid)?;
    let mut output = input.clone();
    output.push_unique(commit.id());
    Ok(output)
}
