#![doc = "Consul integration: implements the core KV and lock contracts over the Consul HTTP API."]
//
//! # Consul adapter (CLI <-> Core)
//!
//! This module wires the traits in [`git2consul_core::contract`] to a real Consul agent:
//!
//! - [`ConsulClient`]: `KvClient` over `/v1/kv` plus agent service (de)registration.
//! - [`ConsulConnector`]: builds a client per sync cycle and probes `/v1/status/leader`, so an
//!   unreachable agent is reported once per cycle instead of once per key.
//! - [`ConsulLockService`]: `LockService` backed by Consul sessions. Cooperative locks use a
//!   TTL session renewed in the background; forced locks use a session without TTL that
//!   outlives the command.
//!
//! All transport details (URL building, token header, status mapping) live here; the core
//! only sees `KvError`/`LockError`.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use git2consul_core::contract::{KvClient, KvConnector, LockService};
use git2consul_core::error::{KvError, LockError};
use git2consul_core::lock::LockHandle;
use reqwest::{RequestBuilder, Response, StatusCode, Url};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::load_config::ConsulSection;

const TOKEN_HEADER: &str = "X-Consul-Token";
const INDEX_HEADER: &str = "X-Consul-Index";

/// HTTP client for one Consul agent. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ConsulClient {
    http: reqwest::Client,
    base: Url,
    token: Option<String>,
}

impl ConsulClient {
    pub fn new(section: &ConsulSection) -> Result<Self, KvError> {
        let base = base_url(&section.scheme, &section.addr)?;
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| KvError::Transport(e.to_string()))?;
        Ok(Self {
            http,
            base,
            token: section.token.clone(),
        })
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    /// `<base>/v1/<segments...>`, each segment percent-encoded.
    pub fn endpoint<'a, I>(&self, segments: I) -> Result<Url, KvError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| KvError::Transport(format!("{} cannot be a base url", self.base)))?
            .pop_if_empty()
            .push("v1")
            .extend(segments);
        Ok(url)
    }

    pub fn kv_url(&self, key: &str) -> Result<Url, KvError> {
        self.endpoint(std::iter::once("kv").chain(key.split('/')))
    }

    fn authorised(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.header(TOKEN_HEADER, token),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder, key: &str) -> Result<Response, KvError> {
        let response = self
            .authorised(request)
            .send()
            .await
            .map_err(transport_error)?;
        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(KvError::Status {
            key: key.to_string(),
            status: status.as_u16(),
            body,
        })
    }

    async fn bool_body(response: Response) -> Result<bool, KvError> {
        let body = response.text().await.map_err(transport_error)?;
        Ok(body.trim() == "true")
    }

    /// Probes the agent; an empty leader means the cluster cannot serve writes.
    pub async fn leader(&self) -> Result<String, KvError> {
        let url = self.endpoint(["status", "leader"])?;
        let response = self
            .authorised(self.http.get(url))
            .send()
            .await
            .map_err(|e| KvError::Unreachable(e.to_string()))?;
        if !response.status().is_success() {
            return Err(KvError::Unreachable(format!(
                "leader probe returned {}",
                response.status()
            )));
        }
        let leader: String = response
            .json()
            .await
            .map_err(|e| KvError::Unreachable(e.to_string()))?;
        if leader.is_empty() {
            return Err(KvError::Unreachable("cluster has no leader".into()));
        }
        Ok(leader)
    }

    /// Full KV entry metadata, used to find the session holding a lock key.
    async fn entry(&self, key: &str) -> Result<Option<KvEntry>, KvError> {
        let url = self.kv_url(key)?;
        let response = self.send(self.http.get(url), key).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let entries: Vec<KvEntry> = response.json().await.map_err(transport_error)?;
        Ok(entries.into_iter().next())
    }

    async fn kv_put_query(&self, key: &str, query: (&str, &str), value: &[u8]) -> Result<bool, KvError> {
        let mut url = self.kv_url(key)?;
        url.query_pairs_mut().append_pair(query.0, query.1);
        let response = self.send(self.http.put(url).body(value.to_vec()), key).await?;
        Self::bool_body(response).await
    }

    /// Blocks until `key` changes past `index` or `wait` elapses; returns the new index.
    async fn wait_for_change(&self, key: &str, index: u64, wait: Duration) -> Result<u64, KvError> {
        let mut url = self.kv_url(key)?;
        url.query_pairs_mut()
            .append_pair("index", &index.to_string())
            .append_pair("wait", &format!("{}s", wait.as_secs().max(1)));
        let response = self
            .send(self.http.get(url).timeout(wait + Duration::from_secs(5)), key)
            .await?;
        let next = response
            .headers()
            .get(INDEX_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);
        // Consul may reset the index; start over rather than block on a stale one.
        Ok(if next < index { 0 } else { next })
    }

    async fn create_session(&self, name: &str, ttl: Option<Duration>) -> Result<String, KvError> {
        let url = self.endpoint(["session", "create"])?;
        let body = SessionRequest {
            name: name.to_string(),
            behavior: "release",
            lock_delay: "0s",
            ttl: ttl.map(|ttl| format!("{}s", ttl.as_secs())),
        };
        let response = self.send(self.http.put(url).json(&body), name).await?;
        let created: SessionCreated = response.json().await.map_err(transport_error)?;
        debug!(session = %created.id, name, ?ttl, "Created consul session");
        Ok(created.id)
    }

    /// `Ok(false)` when the session no longer exists.
    async fn renew_session(&self, session: &str) -> Result<bool, KvError> {
        let url = self.endpoint(["session", "renew", session])?;
        let response = self.send(self.http.put(url), session).await?;
        Ok(response.status() != StatusCode::NOT_FOUND)
    }

    async fn destroy_session(&self, session: &str) -> Result<(), KvError> {
        let url = self.endpoint(["session", "destroy", session])?;
        self.send(self.http.put(url), session).await?;
        debug!(session, "Destroyed consul session");
        Ok(())
    }
}

#[async_trait]
impl KvClient for ConsulClient {
    async fn put(&self, key: &str, value: &[u8]) -> Result<bool, KvError> {
        let url = self.kv_url(key)?;
        let response = self.send(self.http.put(url).body(value.to_vec()), key).await?;
        Self::bool_body(response).await
    }

    async fn delete(&self, key: &str) -> Result<bool, KvError> {
        let url = self.kv_url(key)?;
        let response = self.send(self.http.delete(url), key).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(true);
        }
        Self::bool_body(response).await
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        let mut url = self.kv_url(key)?;
        url.set_query(Some("raw"));
        let response = self.send(self.http.get(url), key).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let bytes = response.bytes().await.map_err(transport_error)?;
        Ok(Some(bytes.to_vec()))
    }

    async fn register_service(&self, name: &str, tags: &[String]) -> Result<(), KvError> {
        let url = self.endpoint(["agent", "service", "register"])?;
        let body = ServiceRegistration {
            id: name.to_string(),
            name: name.to_string(),
            tags: tags.to_vec(),
        };
        self.send(self.http.put(url).json(&body), name).await?;
        info!(service_id = name, "Registered service with consul agent");
        Ok(())
    }

    async fn deregister_service(&self, name: &str) -> Result<(), KvError> {
        let url = self.endpoint(["agent", "service", "deregister", name])?;
        self.send(self.http.put(url), name).await?;
        info!(service_id = name, "Deregistered service from consul agent");
        Ok(())
    }
}

/// Builds a [`ConsulClient`] per cycle after checking the cluster has a leader.
#[derive(Debug, Clone)]
pub struct ConsulConnector {
    section: ConsulSection,
}

impl ConsulConnector {
    pub fn new(section: ConsulSection) -> Self {
        Self { section }
    }
}

#[async_trait]
impl KvConnector for ConsulConnector {
    async fn connect(&self) -> Result<Box<dyn KvClient>, KvError> {
        let client = ConsulClient::new(&self.section)?;
        let leader = client.leader().await?;
        debug!(leader = %leader, addr = %self.section.addr, "Connected to consul");
        Ok(Box::new(client))
    }
}

/// Session-backed locks on Consul KV keys.
pub struct ConsulLockService {
    client: ConsulClient,
    ttl: Duration,
    sessions: Mutex<HashMap<String, String>>,
}

impl ConsulLockService {
    pub fn new(client: ConsulClient, ttl: Duration) -> Self {
        Self {
            client,
            ttl,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    fn remember(&self, key: &str, session: String) -> Result<(), LockError> {
        self.sessions
            .lock()
            .map_err(|_| LockError::Service("session table poisoned".into()))?
            .insert(key.to_string(), session);
        Ok(())
    }

    fn forget(&self, key: &str) -> Result<Option<String>, LockError> {
        Ok(self
            .sessions
            .lock()
            .map_err(|_| LockError::Service("session table poisoned".into()))?
            .remove(key))
    }

    fn held_session(&self, key: &str) -> Result<Option<String>, LockError> {
        Ok(self
            .sessions
            .lock()
            .map_err(|_| LockError::Service("session table poisoned".into()))?
            .get(key)
            .cloned())
    }

    /// Retries `?acquire=` until granted. `session` is replaced when it expires while
    /// waiting.
    async fn wait_for_grant(&self, key: &str, session: &mut String) -> Result<(), LockError> {
        let mut index = 0u64;
        while !self.try_acquire(key, session).await? {
            debug!(key, index, "Lock held elsewhere, waiting for change");
            index = self
                .client
                .wait_for_change(key, index, self.ttl / 2)
                .await
                .map_err(lock_error)?;
            // The wait can outlast the TTL; keep the session alive or replace it.
            if !self.client.renew_session(session).await.map_err(lock_error)? {
                *session = self
                    .client
                    .create_session(key, Some(self.ttl))
                    .await
                    .map_err(lock_error)?;
            }
        }
        Ok(())
    }

    async fn try_acquire(&self, key: &str, session: &str) -> Result<bool, LockError> {
        let holder = holder_value(session);
        self.client
            .kv_put_query(key, ("acquire", session), &holder)
            .await
            .map_err(lock_error)
    }
}

#[async_trait]
impl LockService for ConsulLockService {
    async fn acquire_lock(&self, key: &str) -> Result<LockHandle, LockError> {
        let mut session = self
            .client
            .create_session(key, Some(self.ttl))
            .await
            .map_err(lock_error)?;
        if let Err(e) = self.wait_for_grant(key, &mut session).await {
            if let Err(cleanup) = self.client.destroy_session(&session).await {
                warn!(key, session = %session, error = %cleanup, "Could not destroy session after failed acquire");
            }
            return Err(e);
        }

        let (lost_tx, lost_rx) = watch::channel(false);
        let renewal = tokio::spawn(renew_until_lost(
            self.client.clone(),
            session.clone(),
            self.ttl,
            lost_tx,
        ));
        self.remember(key, session)?;
        Ok(LockHandle::new(key, lost_rx).with_renewal(renewal))
    }

    /// Releases with this process's session when it holds `key`, otherwise on behalf of
    /// whichever session currently holds it. Only a session created here is destroyed.
    async fn release_lock(&self, key: &str) -> Result<(), LockError> {
        let (session, owned) = match self.held_session(key)? {
            Some(session) => (session, true),
            None => {
                let holder = self
                    .client
                    .entry(key)
                    .await
                    .map_err(lock_error)?
                    .and_then(|entry| entry.session);
                match holder {
                    Some(session) => (session, false),
                    None => return Err(LockError::NotHeld(key.to_string())),
                }
            }
        };
        let released = self
            .client
            .kv_put_query(key, ("release", session.as_str()), &[])
            .await
            .map_err(lock_error)?;
        if !released {
            return Err(LockError::Service(format!("consul refused to release {key}")));
        }
        if owned {
            self.client
                .destroy_session(&session)
                .await
                .map_err(lock_error)?;
            self.forget(key)?;
        }
        Ok(())
    }

    async fn force_acquire(&self, key: &str) -> Result<LockHandle, LockError> {
        if let Some(entry) = self.client.entry(key).await.map_err(lock_error)? {
            if let Some(holder) = entry.session {
                warn!(key, session = %holder, "Destroying current lock holder session");
                self.client
                    .destroy_session(&holder)
                    .await
                    .map_err(lock_error)?;
            }
        }
        let session = self
            .client
            .create_session(key, None)
            .await
            .map_err(lock_error)?;
        if !self.try_acquire(key, &session).await? {
            return Err(LockError::Service(format!("{key} was re-taken during force acquire")));
        }
        info!(key, session = %session, "Forced lock acquired; it stays held until force-unlock");
        self.remember(key, session)?;

        // No TTL to renew; the task only keeps the loss channel open for the handle's life.
        let (lost_tx, lost_rx) = watch::channel(false);
        let keep_open = tokio::spawn(async move {
            let _lost_tx = lost_tx;
            futures::future::pending::<()>().await;
        });
        Ok(LockHandle::new(key, lost_rx).with_renewal(keep_open))
    }

    async fn force_release(&self, key: &str) -> Result<(), LockError> {
        if let Some(entry) = self.client.entry(key).await.map_err(lock_error)? {
            if let Some(holder) = entry.session {
                warn!(key, session = %holder, "Destroying lock holder session");
                self.client
                    .destroy_session(&holder)
                    .await
                    .map_err(lock_error)?;
            }
        }
        self.client.delete(key).await.map_err(lock_error)?;
        self.forget(key)?;
        Ok(())
    }
}

async fn renew_until_lost(
    client: ConsulClient,
    session: String,
    ttl: Duration,
    lost: watch::Sender<bool>,
) {
    let mut ticker = tokio::time::interval(ttl / 2);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        match client.renew_session(&session).await {
            Ok(true) => debug!(session = %session, "Renewed lock session"),
            Ok(false) => {
                warn!(session = %session, "Lock session expired or was destroyed");
                let _ = lost.send(true);
                return;
            }
            Err(e) => {
                warn!(session = %session, error = %e, "Failed to renew lock session, treating lock as lost");
                let _ = lost.send(true);
                return;
            }
        }
    }
}

/// Value stored under a lock key: who holds it, for operators reading the KV tree.
fn holder_value(session: &str) -> Vec<u8> {
    let holder = LockHolder {
        session: session.to_string(),
        host: std::env::var("HOSTNAME").unwrap_or_default(),
        pid: std::process::id(),
    };
    serde_json::to_vec(&holder).unwrap_or_default()
}

pub fn base_url(scheme: &str, addr: &str) -> Result<Url, KvError> {
    let raw = if addr.contains("://") {
        addr.to_string()
    } else {
        format!("{scheme}://{addr}")
    };
    Url::parse(&raw).map_err(|e| KvError::Transport(format!("invalid consul address {raw:?}: {e}")))
}

fn transport_error(e: reqwest::Error) -> KvError {
    if e.is_connect() || e.is_timeout() {
        KvError::Unreachable(e.to_string())
    } else {
        KvError::Transport(e.to_string())
    }
}

fn lock_error(e: KvError) -> LockError {
    match e {
        KvError::Unreachable(reason) => LockError::Unreachable(reason),
        other => LockError::Service(other.to_string()),
    }
}

#[derive(Debug, Deserialize)]
struct KvEntry {
    #[serde(rename = "Session")]
    session: Option<String>,
}

#[derive(Debug, Serialize)]
struct SessionRequest {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Behavior")]
    behavior: &'static str,
    #[serde(rename = "LockDelay")]
    lock_delay: &'static str,
    #[serde(rename = "TTL", skip_serializing_if = "Option::is_none")]
    ttl: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SessionCreated {
    #[serde(rename = "ID")]
    id: String,
}

#[derive(Debug, Serialize)]
struct ServiceRegistration {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Tags")]
    tags: Vec<String>,
}

#[derive(Debug, Serialize)]
struct LockHolder {
    session: String,
    host: String,
    pid: u32,
}
