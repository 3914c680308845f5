///
/// This module implements the CLI interface for git2consul: command parsing, tracing setup
/// and the orchestration behind each subcommand.
///
/// All sync semantics (filter pipeline, change sets, reconciliation, locking) live in the
/// [`git2consul-core`] crate. This module wires the core to Consul, the pushgateway and the
/// process lifecycle.
///
/// ## Commands
/// - `sync`: run the periodic sync loop until SIGINT/SIGTERM.
/// - `resync` (alias `force`): reconcile every file of the branch tip once and exit.
/// - `operator`: register/deregister the service and take or release the fleet lock.
///   `force-lock`/`force-unlock` are hidden and bypass cooperative checks.
///
/// ## How To Use
/// - For command-line users: use the installed `git2consul` binary with `--help`.
/// - For programmatic/integration use: call [`run`] with a constructed [`Cli`].
///
/// ---
///
/// [`git2consul-core`]: ../../git2consul-core/
/// [`Cli`]: struct.Cli.html
/// [`run`]: fn.run.html
use crate::consul::{ConsulClient, ConsulConnector, ConsulLockService};
use crate::load_config::{load_config, CliConfig};
use crate::metrics::PushgatewayPublisher;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use git2consul_core::contract::KvClient;
use git2consul_core::lock::{DistributedLock, ReleasePolicy};
use git2consul_core::metrics::SyncCounters;
use git2consul_core::repository::GitRepository;
use git2consul_core::synchronise::{SyncLoop, SyncOptions};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const RELEASE_ATTEMPTS: u32 = 5;

/// CLI for git2consul: mirror a git branch into the Consul KV store.
#[derive(Parser)]
#[clap(
    name = "git2consul",
    version,
    about = "Continuously mirror the files of a git branch into the Consul KV store"
)]
pub struct Cli {
    /// Log level used when RUST_LOG is unset
    #[clap(long, global = true, default_value = "info")]
    pub log_level: String,

    #[clap(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Sync the configured branch into Consul every interval until interrupted
    Sync {
        /// Path to the YAML config file
        #[clap(long)]
        config: PathBuf,
        /// Minutes between cycles, overrides `sync.interval_minutes`
        #[clap(long)]
        interval: Option<u64>,
    },
    /// Write every file of the branch tip to Consul once
    #[clap(alias = "force")]
    Resync {
        /// Path to the YAML config file
        #[clap(long)]
        config: PathBuf,
    },
    /// Service registration and fleet lock administration
    Operator {
        /// Path to the YAML config file
        #[clap(long)]
        config: PathBuf,
        /// Overrides `consul.service_id`
        #[clap(long)]
        service_id: Option<String>,
        #[clap(subcommand)]
        action: OperatorAction,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Subcommand)]
pub enum OperatorAction {
    /// Register the service with the Consul agent
    Register,
    /// Deregister the service from the Consul agent
    Deregister,
    /// Wait for the service lock, hold it until interrupted, then release it
    Lock,
    /// Release the service lock held by the current session
    Unlock,
    #[clap(hide = true)]
    ForceLock,
    #[clap(hide = true)]
    ForceUnlock,
}

/// Installs the global subscriber. `RUST_LOG` wins over `level`.
pub fn init_tracing(level: &str, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let installed = match format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    if installed.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}

/// Extracted async CLI logic entrypoint for integration tests and main()
pub async fn run(cli: Cli) -> Result<()> {
    // Emit a top-level 'trace_initialised' event at the very start
    tracing::info!("trace_initialised");

    match cli.command {
        Commands::Sync { config, interval } => {
            let config = load_config(config)?;
            tracing::info!(command = "sync", "Starting synchronisation loop");
            sync(config, interval).await
        }
        Commands::Resync { config } => {
            let config = load_config(config)?;
            tracing::info!(command = "resync", "Starting full resync");
            resync(config).await
        }
        Commands::Operator {
            config,
            service_id,
            action,
        } => {
            let config = load_config(config)?;
            let service_id = service_id.unwrap_or_else(|| config.consul.service_id.clone());
            tracing::info!(command = "operator", ?action, %service_id, "[OPERATOR] Running operator action");
            operator(config, &service_id, action).await
        }
    }
}

/// Loop options derived from the config. `interval_minutes` is overridden by `--interval`.
pub fn sync_options(config: &CliConfig, interval_minutes: Option<u64>) -> SyncOptions {
    let minutes = interval_minutes.unwrap_or(config.sync.interval_minutes);
    SyncOptions {
        remote: config.git.remote.clone(),
        branch: config.git.branch.clone(),
        prefix: config.consul.path.clone(),
        interval: Duration::from_secs(minutes.saturating_mul(60)),
        // Same key as `operator lock`/`force-lock`, so an operator can pause the fleet.
        lock_key: config
            .sync
            .lock_cycles
            .then(|| config.consul.service_id.clone()),
    }
}

fn distributed_lock(config: &CliConfig) -> Result<DistributedLock> {
    let client = ConsulClient::new(&config.consul).context("Failed to build consul client")?;
    let service = ConsulLockService::new(client, config.consul.session_ttl());
    Ok(DistributedLock::new(Arc::new(service)).with_release_policy(ReleasePolicy {
        max_attempts: Some(RELEASE_ATTEMPTS),
        backoff: Duration::from_secs(1),
    }))
}

fn build_sync_loop(config: &CliConfig, interval: Option<u64>, counters: Arc<SyncCounters>) -> Result<SyncLoop> {
    let repo = GitRepository::clone_or_open(&config.git).context("Failed to clone or open repository")?;
    let connector = Arc::new(ConsulConnector::new(config.consul.clone()));
    let mut sync_loop = SyncLoop::new(repo, sync_options(config, interval), connector, counters);
    if config.sync.lock_cycles {
        sync_loop = sync_loop.with_lock(distributed_lock(config)?);
    }
    Ok(sync_loop)
}

async fn sync(config: CliConfig, interval: Option<u64>) -> Result<()> {
    let counters = Arc::new(SyncCounters::new());
    let publisher = if config.metrics.enabled {
        let publisher = PushgatewayPublisher::new(&config.metrics, counters.clone())?;
        tracing::info!(url = %publisher.url(), "Pushing metrics to pushgateway");
        Some(publisher.spawn())
    } else {
        None
    };

    let mut sync_loop = build_sync_loop(&config, interval, counters)?;
    sync_loop.run(shutdown_signal()).await;

    if let Some(task) = publisher {
        task.abort();
    }
    Ok(())
}

async fn resync(config: CliConfig) -> Result<()> {
    let counters = Arc::new(SyncCounters::new());
    let mut sync_loop = build_sync_loop(&config, None, counters.clone())?;
    let report = sync_loop.resync().await.context("Resync failed")?;

    if config.metrics.enabled {
        let publisher = PushgatewayPublisher::new(&config.metrics, counters)?;
        if let Err(e) = publisher.push().await {
            tracing::warn!(error = %e, "[METRICS] Could not push resync counters");
        }
    }

    if report.connection_failed {
        anyhow::bail!("Resync could not reach consul at {}", config.consul.addr);
    }
    if report.failed > 0 {
        anyhow::bail!("Resync failed for {} of {} keys", report.failed, report.deltas);
    }
    tracing::info!(synced = report.synced, "Resync complete");
    Ok(())
}

async fn operator(config: CliConfig, service_id: &str, action: OperatorAction) -> Result<()> {
    match action {
        OperatorAction::Register => {
            let client = ConsulClient::new(&config.consul)?;
            client
                .register_service(service_id, &config.consul.service_tags)
                .await
                .with_context(|| format!("Failed to register service {service_id}"))?;
        }
        OperatorAction::Deregister => {
            let client = ConsulClient::new(&config.consul)?;
            client
                .deregister_service(service_id)
                .await
                .with_context(|| format!("Failed to deregister service {service_id}"))?;
        }
        OperatorAction::Lock => {
            let lock = distributed_lock(&config)?;
            let mut handle = lock
                .acquire(service_id)
                .await
                .with_context(|| format!("Failed to acquire lock {service_id}"))?;
            tracing::info!(key = service_id, "[OPERATOR] Holding lock until interrupted");
            let lost = tokio::select! {
                _ = shutdown_signal() => false,
                _ = handle.lost() => true,
            };
            if lost {
                anyhow::bail!("Lock {service_id} was lost while held");
            }
            lock.release(service_id)
                .await
                .with_context(|| format!("Failed to release lock {service_id}"))?;
        }
        OperatorAction::Unlock => {
            distributed_lock(&config)?
                .release(service_id)
                .await
                .with_context(|| format!("Failed to release lock {service_id}"))?;
        }
        OperatorAction::ForceLock => {
            let lock = distributed_lock(&config)?;
            let handle = lock
                .force_acquire(service_id)
                .await
                .with_context(|| format!("Failed to force lock {service_id}"))?;
            tracing::warn!(key = handle.key(), "[OPERATOR] Lock forced, it stays held until force-unlock");
        }
        OperatorAction::ForceUnlock => {
            distributed_lock(&config)?
                .force_release(service_id)
                .await
                .with_context(|| format!("Failed to force unlock {service_id}"))?;
        }
    }
    Ok(())
}

/// Resolves on SIGINT, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for ctrl-c");
            futures::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                futures::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = futures::future::pending::<()>();

    futures::pin_mut!(ctrl_c, terminate);
    futures::future::select(ctrl_c, terminate).await;
    tracing::info!("Shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn force_is_an_alias_for_resync() {
        let cli = Cli::try_parse_from(["git2consul", "force", "--config", "c.yaml"]).unwrap();
        assert!(matches!(cli.command, Commands::Resync { .. }));
    }

    #[test]
    fn global_flags_parse_after_the_subcommand() {
        let cli = Cli::try_parse_from([
            "git2consul",
            "sync",
            "--config",
            "c.yaml",
            "--interval",
            "2",
            "--log-format",
            "json",
        ])
        .unwrap();
        assert_eq!(cli.log_format, LogFormat::Json);
        assert_eq!(cli.log_level, "info");
        match cli.command {
            Commands::Sync { interval, .. } => assert_eq!(interval, Some(2)),
            _ => panic!("expected sync"),
        }
    }

    #[test]
    fn hidden_operator_actions_still_parse() {
        let cli = Cli::try_parse_from([
            "git2consul",
            "operator",
            "--config",
            "c.yaml",
            "--service-id",
            "svc",
            "force-unlock",
        ])
        .unwrap();
        match cli.command {
            Commands::Operator {
                service_id, action, ..
            } => {
                assert_eq!(service_id.as_deref(), Some("svc"));
                assert_eq!(action, OperatorAction::ForceUnlock);
            }
            _ => panic!("expected operator"),
        }
    }

    #[test]
    fn sync_options_follow_config_and_flag() {
        let mut config = CliConfig::default();
        config.consul.path = "app".into();
        config.git.branch = "main".into();

        let options = sync_options(&config, None);
        assert_eq!(options.interval, Duration::from_secs(300));
        assert_eq!(options.prefix, "app");
        assert_eq!(options.branch, "main");
        assert_eq!(options.lock_key, None);

        config.sync.lock_cycles = true;
        let options = sync_options(&config, Some(1));
        assert_eq!(options.interval, Duration::from_secs(60));
        assert_eq!(options.lock_key.as_deref(), Some("git2consul"));
    }
}
