//! Repository Provider: a thin layer over libgit2 for the operations the sync cycle needs.
//!
//! [`GitRepository`] owns the on-disk working copy. It is created once per process with
//! [`GitRepository::clone_or_open`] and then mutated in place by [`GitRepository::pull`].
//! Nothing here decides *what* to sync; that belongs to the filter pipeline and the
//! change-set computer.

use git2::build::{CheckoutBuilder, RepoBuilder};
use git2::{
    BranchType, CertificateCheckStatus, Commit, Cred, Diff, DiffOptions, FetchOptions, Oid,
    RemoteCallbacks, Repository, Sort, Tree,
};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::config::{Credentials, GitConfig};
use crate::error::{ConfigError, GitError};

const MAX_CREDENTIAL_ATTEMPTS: usize = 3;

/// A named pointer into history, resolved to the commit it points at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchRef {
    pub name: String,
    pub target: Oid,
}

/// Order in which [`GitRepository::walk`] yields commits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkOrder {
    /// Newest first by commit time, following first parents only.
    TimeFirstParent,
    /// Children before parents.
    Topological,
}

/// What a pull did to the local branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullOutcome {
    UpToDate,
    FastForward,
    /// Local history diverged from the remote and was reset to the remote tip.
    Reset,
}

/// Exclusive handle on the working copy used by one sync loop.
pub struct GitRepository {
    repo: Repository,
    workdir: PathBuf,
    credentials: Credentials,
    fingerprint: Option<Vec<u8>>,
}

impl GitRepository {
    /// Clones `config.url` into `config.pull_dir` when the directory does not exist yet,
    /// otherwise opens the existing working copy.
    pub fn clone_or_open(config: &GitConfig) -> Result<Self, GitError> {
        let fingerprint = config.fingerprint_bytes().map_err(config_to_git)?;
        let credentials = config.credentials();
        if config.pull_dir.exists() {
            info!(directory = %config.pull_dir.display(), "Found an existing repository");
            let repo = Repository::open(&config.pull_dir).map_err(GitError::op("open"))?;
            return Ok(Self::from_parts(repo, credentials, fingerprint));
        }

        info!(
            url = %config.url,
            directory = %config.pull_dir.display(),
            branch = %config.branch,
            "Cloning repository"
        );
        let mut builder = RepoBuilder::new();
        builder.fetch_options(fetch_options(credentials.clone(), fingerprint.clone()));
        let mut checkout = CheckoutBuilder::new();
        checkout.force();
        builder.with_checkout(checkout);
        builder.branch(&config.branch);
        let repo = builder
            .clone(&config.url, &config.pull_dir)
            .map_err(GitError::op("clone"))?;
        debug!(directory = %config.pull_dir.display(), "Clone finished");
        Ok(Self::from_parts(repo, credentials, fingerprint))
    }

    /// Opens an existing working copy without remote credentials.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, GitError> {
        let repo = Repository::open(dir.as_ref()).map_err(GitError::op("open"))?;
        Ok(Self::from_parts(repo, Credentials::Default, None))
    }

    fn from_parts(repo: Repository, credentials: Credentials, fingerprint: Option<Vec<u8>>) -> Self {
        let workdir = repo
            .workdir()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| repo.path().to_path_buf());
        Self {
            repo,
            workdir,
            credentials,
            fingerprint,
        }
    }

    /// Root of the checked out files; delta paths are relative to it.
    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    pub fn fetch(&self, remote_name: &str, refspecs: &[&str]) -> Result<(), GitError> {
        let mut remote = self
            .repo
            .find_remote(remote_name)
            .map_err(GitError::op("find remote"))?;
        let mut options = fetch_options(self.credentials.clone(), self.fingerprint.clone());
        remote
            .fetch(refspecs, Some(&mut options), None)
            .map_err(GitError::op("fetch"))?;
        debug!(remote = remote_name, ?refspecs, "Fetched remote");
        Ok(())
    }

    /// Fetches `branch` from `remote_name` and moves the local branch and working
    /// directory to the remote tip.
    pub fn pull(&self, remote_name: &str, branch: &str) -> Result<PullOutcome, GitError> {
        if !self.workdir.exists() {
            return Err(GitError::MissingPullDir(self.workdir.display().to_string()));
        }
        let remote_ref_name = format!("refs/remotes/{remote_name}/{branch}");
        let local_ref_name = format!("refs/heads/{branch}");
        let refspec = format!("+{local_ref_name}:{remote_ref_name}");
        self.fetch(remote_name, &[refspec.as_str()])?;

        let remote_ref = self
            .repo
            .find_reference(&remote_ref_name)
            .map_err(GitError::op("find remote branch"))?;
        let remote_target = remote_ref
            .target()
            .ok_or_else(|| GitError::SymbolicRef(remote_ref_name.clone()))?;

        if self.repo.find_reference(&local_ref_name).is_err() {
            self.repo
                .reference(&local_ref_name, remote_target, true, "git2consul: create local branch")
                .map_err(GitError::op("create local branch"))?;
            info!(branch, "Created local branch from remote");
        }
        self.repo
            .set_head(&local_ref_name)
            .map_err(GitError::op("set head"))?;

        let annotated = self
            .repo
            .reference_to_annotated_commit(&remote_ref)
            .map_err(GitError::op("annotated commit"))?;
        let (analysis, _) = self
            .repo
            .merge_analysis(&[&annotated])
            .map_err(GitError::op("merge analysis"))?;
        debug!(?analysis, branch, "Pull analysis");

        let outcome = if analysis.is_up_to_date() {
            PullOutcome::UpToDate
        } else if analysis.is_fast_forward() {
            PullOutcome::FastForward
        } else {
            warn!(branch, "Local branch diverged from remote, resetting to remote tip");
            PullOutcome::Reset
        };

        if outcome != PullOutcome::UpToDate {
            let mut local_ref = self
                .repo
                .find_reference(&local_ref_name)
                .map_err(GitError::op("find local branch"))?;
            local_ref
                .set_target(remote_target, "git2consul: pull")
                .map_err(GitError::op("update local branch"))?;
        }
        let mut checkout = CheckoutBuilder::new();
        checkout.force();
        self.repo
            .checkout_head(Some(&mut checkout))
            .map_err(GitError::op("checkout head"))?;
        self.repo
            .cleanup_state()
            .map_err(GitError::op("cleanup state"))?;
        Ok(outcome)
    }

    /// Commit ids reachable from `start` in the requested order.
    pub fn walk(&self, order: WalkOrder, start: Oid) -> Result<Vec<Oid>, GitError> {
        let mut walk = self.repo.revwalk().map_err(GitError::op("revwalk"))?;
        match order {
            WalkOrder::TimeFirstParent => {
                walk.set_sorting(Sort::TIME).map_err(GitError::op("revwalk sort"))?;
                walk.simplify_first_parent()
                    .map_err(GitError::op("revwalk first parent"))?;
            }
            WalkOrder::Topological => {
                walk.set_sorting(Sort::TOPOLOGICAL)
                    .map_err(GitError::op("revwalk sort"))?;
            }
        }
        walk.push(start).map_err(GitError::op("revwalk push"))?;
        walk.collect::<Result<Vec<_>, _>>()
            .map_err(GitError::op("revwalk next"))
    }

    pub fn find_commit(&self, id: Oid) -> Result<Commit<'_>, GitError> {
        self.repo.find_commit(id).map_err(GitError::op("find commit"))
    }

    pub fn find_tree(&self, id: Oid) -> Result<Tree<'_>, GitError> {
        self.repo.find_tree(id).map_err(GitError::op("find tree"))
    }

    /// Resolves a branch by name, preferring the local branch over `<remote>/<name>`.
    pub fn find_branch(&self, name: &str) -> Result<BranchRef, GitError> {
        let branch = match self.repo.find_branch(name, BranchType::Local) {
            Ok(branch) => branch,
            Err(local_err) => self
                .repo
                .find_branch(name, BranchType::Remote)
                .or_else(|_| {
                    self.repo
                        .find_branch(&format!("origin/{name}"), BranchType::Remote)
                })
                .map_err(|_| GitError::Git {
                    op: "find branch",
                    source: local_err,
                })?,
        };
        let reference = branch.into_reference();
        let full_name = reference.name().unwrap_or(name).to_string();
        let target = reference
            .target()
            .ok_or_else(|| GitError::SymbolicRef(full_name.clone()))?;
        Ok(BranchRef {
            name: full_name,
            target,
        })
    }

    /// Resolves a commit-ish (commit id, tag, branch) to the commit it names.
    pub fn resolve_anchor(&self, spec: &str) -> Result<Oid, GitError> {
        let object = self
            .repo
            .revparse_single(spec)
            .map_err(GitError::op("resolve anchor"))?;
        let commit = object
            .peel_to_commit()
            .map_err(GitError::op("peel anchor"))?;
        Ok(commit.id())
    }

    pub fn head_commit(&self) -> Result<Oid, GitError> {
        let head = self.repo.head().map_err(GitError::op("head"))?;
        let commit = head.peel_to_commit().map_err(GitError::op("peel head"))?;
        Ok(commit.id())
    }

    /// Structural diff between two trees; `None` on the old side lists every file.
    pub fn diff_trees(&self, old: Option<&Tree<'_>>, new: Option<&Tree<'_>>) -> Result<Diff<'_>, GitError> {
        let mut options = DiffOptions::new();
        self.repo
            .diff_tree_to_tree(old, new, Some(&mut options))
            .map_err(GitError::op("diff tree to tree"))
    }

    /// Diff between a tree and the checked out files, untracked files included.
    pub fn diff_tree_to_workdir(&self, tree: &Tree<'_>) -> Result<Diff<'_>, GitError> {
        let mut options = DiffOptions::new();
        options.include_untracked(true).recurse_untracked_dirs(true);
        self.repo
            .diff_tree_to_workdir_with_index(Some(tree), Some(&mut options))
            .map_err(GitError::op("diff tree to workdir"))
    }
}

fn config_to_git(err: ConfigError) -> GitError {
    GitError::Git {
        op: "configure",
        source: git2::Error::from_str(&err.to_string()),
    }
}

/// Fetch options carrying the credential callback and, when configured, the host key
/// fingerprint check.
fn fetch_options(credentials: Credentials, fingerprint: Option<Vec<u8>>) -> FetchOptions<'static> {
    let mut callbacks = RemoteCallbacks::new();
    let mut attempts = 0usize;
    callbacks.credentials(move |_url, username_from_url, _allowed| {
        attempts += 1;
        if attempts > MAX_CREDENTIAL_ATTEMPTS {
            return Err(git2::Error::from_str("authentication failed"));
        }
        match &credentials {
            Credentials::UserPass { username, password } => {
                debug!("Using username/password authentication");
                Cred::userpass_plaintext(username, password)
            }
            Credentials::SshKey {
                username,
                public_key,
                private_key,
                passphrase,
            } => {
                let user = username_from_url.unwrap_or(username);
                debug!(private_key = %private_key.display(), "Using ssh key authentication");
                Cred::ssh_key(user, public_key.as_deref(), private_key, passphrase.as_deref())
            }
            Credentials::Default => Cred::default(),
        }
    });
    callbacks.certificate_check(move |cert, hostname| {
        let Some(expected) = fingerprint.as_deref() else {
            return Ok(CertificateCheckStatus::CertificatePassthrough);
        };
        let Some(hostkey) = cert.as_hostkey() else {
            return Ok(CertificateCheckStatus::CertificatePassthrough);
        };
        let matches = match expected.len() {
            16 => hostkey.hash_md5().is_some_and(|h| h[..] == *expected),
            32 => hostkey.hash_sha256().is_some_and(|h| h[..] == *expected),
            _ => false,
        };
        if matches {
            Ok(CertificateCheckStatus::CertificateOk)
        } else {
            warn!(hostname, "Remote host key does not match the configured fingerprint");
            Err(git2::Error::from_str("remote host key fingerprint mismatch"))
        }
    });
    let mut options = FetchOptions::new();
    options.remote_callbacks(callbacks);
    options
}
