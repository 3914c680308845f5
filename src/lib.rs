//! git2consul CLI crate: Consul adapters, configuration loading and command orchestration
//! around [`git2consul_core`].

pub mod cli;
pub mod consul;
pub mod load_config;
pub mod metrics;

pub use cli::{run, Cli, Commands};
