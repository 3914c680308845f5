//! In-memory KV store for tests and local dry runs.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::contract::{KvClient, KvConnector};
use crate::error::KvError;

#[derive(Debug, Default)]
struct State {
    entries: BTreeMap<String, Vec<u8>>,
    services: BTreeMap<String, Vec<String>>,
    failing_keys: HashSet<String>,
}

/// A cloneable handle on a shared map. Clones see the same data.
#[derive(Debug, Clone, Default)]
pub struct MemoryKv {
    state: Arc<Mutex<State>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Puts and deletes on `key` fail until cleared.
    pub fn fail_key(&self, key: impl Into<String>) {
        if let Ok(mut state) = self.state.lock() {
            state.failing_keys.insert(key.into());
        }
    }

    pub fn clear_failures(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.failing_keys.clear();
        }
    }

    /// Insert directly, bypassing failure injection.
    pub fn seed(&self, key: impl Into<String>, value: impl Into<Vec<u8>>) {
        if let Ok(mut state) = self.state.lock() {
            state.entries.insert(key.into(), value.into());
        }
    }

    pub fn snapshot(&self) -> BTreeMap<String, Vec<u8>> {
        self.state
            .lock()
            .map(|state| state.entries.clone())
            .unwrap_or_default()
    }

    pub fn value(&self, key: &str) -> Option<String> {
        self.snapshot()
            .get(key)
            .map(|v| String::from_utf8_lossy(v).into_owned())
    }

    pub fn services(&self) -> BTreeMap<String, Vec<String>> {
        self.state
            .lock()
            .map(|state| state.services.clone())
            .unwrap_or_default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut State) -> Result<T, KvError>) -> Result<T, KvError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| KvError::Transport("memory kv poisoned".into()))?;
        f(&mut state)
    }
}

#[async_trait]
impl KvClient for MemoryKv {
    async fn put(&self, key: &str, value: &[u8]) -> Result<bool, KvError> {
        self.with_state(|state| {
            if state.failing_keys.contains(key) {
                return Err(KvError::Status {
                    key: key.to_string(),
                    status: 500,
                    body: "injected failure".into(),
                });
            }
            state.entries.insert(key.to_string(), value.to_vec());
            Ok(true)
        })
    }

    async fn delete(&self, key: &str) -> Result<bool, KvError> {
        self.with_state(|state| {
            if state.failing_keys.contains(key) {
                return Err(KvError::Status {
                    key: key.to_string(),
                    status: 500,
                    body: "injected failure".into(),
                });
            }
            state.entries.remove(key);
            Ok(true)
        })
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        self.with_state(|state| Ok(state.entries.get(key).cloned()))
    }

    async fn register_service(&self, name: &str, tags: &[String]) -> Result<(), KvError> {
        self.with_state(|state| {
            state.services.insert(name.to_string(), tags.to_vec());
            Ok(())
        })
    }

    async fn deregister_service(&self, name: &str) -> Result<(), KvError> {
        self.with_state(|state| {
            state.services.remove(name);
            Ok(())
        })
    }
}

/// Hands out clones of one [`MemoryKv`]; can be switched offline.
#[derive(Debug, Clone, Default)]
pub struct MemoryConnector {
    kv: MemoryKv,
    offline: Arc<AtomicBool>,
}

impl MemoryConnector {
    pub fn new(kv: MemoryKv) -> Self {
        Self {
            kv,
            offline: Arc::default(),
        }
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn kv(&self) -> &MemoryKv {
        &self.kv
    }
}

#[async_trait]
impl KvConnector for MemoryConnector {
    async fn connect(&self) -> Result<Box<dyn KvClient>, KvError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(KvError::Unreachable("memory connector offline".into()));
        }
        Ok(Box::new(self.kv.clone()))
    }
}
