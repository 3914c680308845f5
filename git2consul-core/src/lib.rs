#![doc = "git2consul-core: reconciliation core for git2consul."]

//! Mirrors the files of a git branch into a key-value store, treating commit history as
//! a change log and the store as its materialised view.
//!
//! The pieces, leaves first:
//! - [`repository`]: clone, pull, walk and diff over a local working copy (libgit2).
//! - [`filter`]: the commit filter pipeline selecting one cycle's window.
//! - [`changeset`]: window to file-level deltas, plus the working directory resolver.
//! - [`reconcile`]: deltas to KV puts and deletes with per-key failure isolation.
//! - [`lock`]: session-backed distributed lock wrapper.
//! - [`synchronise`]: the timer-driven sync loop tying the above together.
//!
//! External services are reached only through the traits in [`contract`]. The CLI crate
//! provides the Consul implementations; [`memory`] and [`lock::MemoryLockService`]
//! provide in-process ones for tests.

pub mod changeset;
pub mod config;
pub mod contract;
pub mod error;
pub mod filter;
pub mod lock;
#[cfg(any(test, feature = "test-export-mocks"))]
pub mod memory;
pub mod metrics;
pub mod reconcile;
pub mod repository;
pub mod synchronise;
