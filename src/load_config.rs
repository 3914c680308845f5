/// `load_config` module: Loads a static YAML config file, injects secrets from the environment
/// and validates the result before any command touches git or Consul.
///
/// # Responsibilities
/// - Parse the user-supplied YAML into the typed sections below (`git`, `consul`, `sync`, `metrics`)
/// - Inject secrets from the environment so they never need to live in the file
///   (`GIT_PASSWORD`, `GIT_SSH_PASSPHRASE`, `CONSUL_TOKEN`); `CONSUL_ADDR` overrides `consul.addr`
/// - Resolve `git.fingerprint_path` into the inline fingerprint
/// - Validate the git settings once, so configuration mistakes fail at startup
///
/// # Errors
/// All errors use `anyhow::Error` with context and are surfaced at the CLI boundary.
///
/// Every section and field is optional; see the `Default` impls for the values used.
use anyhow::{Context, Result};
use git2consul_core::config::GitConfig;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{error, info};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CliConfig {
    pub git: GitConfig,
    pub consul: ConsulSection,
    pub sync: SyncSection,
    pub metrics: MetricsSection,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ConsulSection {
    /// `host:port` of the Consul agent.
    pub addr: String,
    pub scheme: String,
    pub token: Option<String>,
    /// Key prefix every synced file is written under.
    pub path: String,
    /// Service registered by `operator register` and used as the lock key.
    pub service_id: String,
    pub service_tags: Vec<String>,
    pub session_ttl_secs: u64,
}

impl Default for ConsulSection {
    fn default() -> Self {
        Self {
            addr: "localhost:8500".to_string(),
            scheme: "http".to_string(),
            token: None,
            path: String::new(),
            service_id: "git2consul".to_string(),
            service_tags: Vec::new(),
            session_ttl_secs: 15,
        }
    }
}

impl ConsulSection {
    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs.max(10))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SyncSection {
    pub interval_minutes: u64,
    /// Take the service lock (`consul.service_id`) around every cycle, the same key
    /// `operator lock` and `force-lock` hold.
    pub lock_cycles: bool,
}

impl Default for SyncSection {
    fn default() -> Self {
        Self {
            interval_minutes: 5,
            lock_cycles: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MetricsSection {
    pub enabled: bool,
    pub pushgateway_addr: String,
    pub push_interval_secs: u64,
}

impl Default for MetricsSection {
    fn default() -> Self {
        Self {
            enabled: false,
            pushgateway_addr: "localhost:9091".to_string(),
            push_interval_secs: 30,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct GitSection {
    #[serde(flatten)]
    config: GitConfig,
    fingerprint_path: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawConfig {
    git: GitSection,
    consul: ConsulSection,
    sync: SyncSection,
    metrics: MetricsSection,
}

/// Loads a static YAML config file (no secrets) and injects required env vars for secrets.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<CliConfig> {
    let path_ref = path.as_ref();
    info!(config_path = ?path_ref, "Loading configuration from file");

    let config_content = match fs::read_to_string(path_ref) {
        Ok(content) => content,
        Err(e) => {
            error!(error = ?e, config_path = ?path_ref, "Failed to read config file");
            return Err(anyhow::anyhow!(
                "Failed to read config file {:?}: {}",
                path_ref,
                e
            ));
        }
    };

    let raw: RawConfig = match serde_yaml::from_str(&config_content) {
        Ok(conf) => {
            info!(config_path = ?path_ref, "Parsed config YAML successfully");
            conf
        }
        Err(e) => {
            error!(error = ?e, config_path = ?path_ref, "Failed to parse config YAML");
            return Err(anyhow::anyhow!("Failed to parse config YAML: {e}"));
        }
    };

    let mut git = raw.git.config;
    if let Some(fingerprint_path) = raw.git.fingerprint_path {
        let fingerprint = fs::read_to_string(&fingerprint_path).with_context(|| {
            format!("Failed to read fingerprint file {}", fingerprint_path.display())
        })?;
        git.fingerprint = Some(fingerprint.trim().to_string());
    }
    let mut consul = raw.consul;
    inject_env(&mut git, &mut consul);

    git.validate().context("Invalid git configuration")?;
    git.trace_loaded();
    info!(
        consul_addr = %consul.addr,
        consul_path = %consul.path,
        service_id = %consul.service_id,
        token_set = consul.token.is_some(),
        "Loaded consul configuration"
    );

    Ok(CliConfig {
        git,
        consul,
        sync: raw.sync,
        metrics: raw.metrics,
    })
}

fn inject_env(git: &mut GitConfig, consul: &mut ConsulSection) {
    if let Some(password) = non_empty_env("GIT_PASSWORD") {
        git.password = Some(password);
    }
    if let Some(passphrase) = non_empty_env("GIT_SSH_PASSPHRASE") {
        git.passphrase = Some(passphrase);
    }
    if let Some(token) = non_empty_env("CONSUL_TOKEN") {
        consul.token = Some(token);
    }
    if let Some(addr) = non_empty_env("CONSUL_ADDR") {
        info!(consul_addr = %addr, "CONSUL_ADDR overrides configured consul address");
        consul.addr = addr;
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}
