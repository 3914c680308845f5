//! Pushes the sync counters to a Prometheus pushgateway.
//!
//! The publisher runs on its own task and only reads [`SyncCounters`] snapshots; a failed
//! push is logged and retried on the next interval.

use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use git2consul_core::metrics::{CounterSnapshot, SyncCounters};
use reqwest::Url;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::load_config::MetricsSection;

const JOB: &str = "git2consul";

pub struct PushgatewayPublisher {
    http: reqwest::Client,
    url: Url,
    instance: String,
    counters: Arc<SyncCounters>,
    interval: Duration,
}

impl PushgatewayPublisher {
    pub fn new(section: &MetricsSection, counters: Arc<SyncCounters>) -> Result<Self> {
        let instance = std::env::var("HOSTNAME")
            .ok()
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| "unknown".to_string());
        let url = push_url(&section.pushgateway_addr, &instance)?;
        Ok(Self {
            http: reqwest::Client::new(),
            url,
            instance,
            counters,
            interval: Duration::from_secs(section.push_interval_secs.max(1)),
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub async fn push(&self) -> Result<()> {
        let body = render(&self.counters.snapshot(), &self.instance);
        let response = self
            .http
            .put(self.url.clone())
            .header("Content-Type", "text/plain; version=0.0.4")
            .body(body)
            .send()
            .await
            .context("pushgateway request failed")?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("pushgateway returned {status}");
        }
        debug!(url = %self.url, "[METRICS] Pushed counters");
        Ok(())
    }

    /// Pushes every interval until the returned task is aborted.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            loop {
                ticker.tick().await;
                if let Err(e) = self.push().await {
                    warn!(error = %e, url = %self.url, "[METRICS] Could not push to pushgateway");
                }
            }
        })
    }
}

/// `<addr>/metrics/job/git2consul/instance/<instance>`
pub fn push_url(addr: &str, instance: &str) -> Result<Url> {
    let raw = if addr.contains("://") {
        addr.to_string()
    } else {
        format!("http://{addr}")
    };
    let mut url = Url::parse(&raw).with_context(|| format!("invalid pushgateway address {raw:?}"))?;
    url.path_segments_mut()
        .map_err(|_| anyhow::anyhow!("pushgateway address {raw:?} cannot be a base url"))?
        .pop_if_empty()
        .extend(["metrics", "job", JOB, "instance", instance]);
    Ok(url)
}

/// Prometheus text exposition of the counters.
pub fn render(snapshot: &CounterSnapshot, instance: &str) -> String {
    let labels = format!(
        "source=\"git\",sink=\"consul\",instance=\"{}\"",
        escape_label_value(instance)
    );
    let mut out = String::new();
    let _ = writeln!(out, "# HELP git2consul_synced_total The total number of consul keys synced");
    let _ = writeln!(out, "# TYPE git2consul_synced_total counter");
    let _ = writeln!(out, "git2consul_synced_total{{{labels},state=\"success\"}} {}", snapshot.files_synced);
    let _ = writeln!(out, "git2consul_synced_total{{{labels},state=\"failed\"}} {}", snapshot.files_sync_failed);
    let _ = writeln!(out, "# HELP git2consul_consul_connections_total The total number of failed connections to consul");
    let _ = writeln!(out, "# TYPE git2consul_consul_connections_total counter");
    let _ = writeln!(
        out,
        "git2consul_consul_connections_total{{{labels},state=\"failed\"}} {}",
        snapshot.kv_connection_failed
    );
    let _ = writeln!(out, "# HELP git2consul_git_reads_total The total number of times git was pulled");
    let _ = writeln!(out, "# TYPE git2consul_git_reads_total counter");
    let _ = writeln!(out, "git2consul_git_reads_total{{{labels}}} {}", snapshot.git_reads);
    out
}

fn escape_label_value(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\n', "\\n").replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_url_targets_job_and_instance() {
        assert_eq!(
            push_url("localhost:9091", "node-1").unwrap().as_str(),
            "http://localhost:9091/metrics/job/git2consul/instance/node-1"
        );
        assert_eq!(
            push_url("https://push.example.com/", "a b").unwrap().as_str(),
            "https://push.example.com/metrics/job/git2consul/instance/a%20b"
        );
    }

    #[test]
    fn render_escapes_instance_label() {
        let text = render(&CounterSnapshot::default(), "node\"1\\a\nb");
        assert!(text.contains(r#"instance="node\"1\\a\nb""#));
        let samples: Vec<_> = text.lines().filter(|l| !l.starts_with('#')).collect();
        assert_eq!(samples.len(), 4);
    }

    #[test]
    fn render_emits_one_sample_per_counter() {
        let snapshot = CounterSnapshot {
            files_synced: 3,
            files_sync_failed: 1,
            kv_connection_failed: 2,
            git_reads: 7,
        };
        let text = render(&snapshot, "node-1");
        let samples: Vec<_> = text.lines().filter(|l| !l.starts_with('#')).collect();
        assert_eq!(samples.len(), 4);
        assert!(text.contains(
            "git2consul_synced_total{source=\"git\",sink=\"consul\",instance=\"node-1\",state=\"success\"} 3"
        ));
        assert!(text.contains("state=\"failed\"} 1"));
        assert!(text.contains(
            "git2consul_git_reads_total{source=\"git\",sink=\"consul\",instance=\"node-1\"} 7"
        ));
    }
}
