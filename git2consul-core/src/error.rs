//! Error types shared across the core crate.
//!
//! Each concern gets its own enum so callers can tell a per-cycle failure (git, KV
//! unreachable) apart from a fatal one (configuration, administrative locking).

use thiserror::Error;

/// Failures talking to the local working copy or the remote repository.
#[derive(Debug, Error)]
pub enum GitError {
    #[error("git {op} failed: {source}")]
    Git {
        op: &'static str,
        #[source]
        source: git2::Error,
    },
    #[error("reference {0} has no direct target")]
    SymbolicRef(String),
    #[error("pull directory {0} does not exist")]
    MissingPullDir(String),
}

impl GitError {
    pub(crate) fn op(op: &'static str) -> impl FnOnce(git2::Error) -> GitError {
        move |source| GitError::Git { op, source }
    }
}

/// Failures talking to the key-value store.
#[derive(Debug, Error)]
pub enum KvError {
    #[error("kv store unreachable: {0}")]
    Unreachable(String),
    #[error("kv request for {key} failed with status {status}: {body}")]
    Status {
        key: String,
        status: u16,
        body: String,
    },
    #[error("kv transport error: {0}")]
    Transport(String),
    #[error("kv store refused the write for {0}")]
    Rejected(String),
}

/// Failures from the coordination service backing the distributed lock.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock service unreachable: {0}")]
    Unreachable(String),
    #[error("lock {0} is not held by this process")]
    NotHeld(String),
    #[error("lock {key} was not released after {attempts} attempts: {last}")]
    ReleaseExhausted {
        key: String,
        attempts: u32,
        last: String,
    },
    #[error("lock service error: {0}")]
    Service(String),
}

/// Invalid configuration detected at construction time.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),
    #[error("invalid fingerprint: {0}")]
    Fingerprint(String),
    #[error("private key path set without a public key path")]
    IncompleteKeyPair,
    #[error("failed reading {path}: {reason}")]
    Read { path: String, reason: String },
}
