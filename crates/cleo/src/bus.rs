//! Shared key-value store for cross-worker context.
//!
//! One file-locked JSON document maps namespaced string keys to JSON values.
//! Namespaces in use: `intent:<task_id>` (intent anchors, durable for a
//! task's lifetime), `agent:<id>:status`, `task:<id>:*`.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde_json::Value;

use crate::lockfile::LockGuard;
use crate::protocols::IntentAnchor;
use crate::workdir::Workdir;

pub const INTENT_KEY_PREFIX: &str = "intent:";

#[derive(Debug, Clone)]
pub struct ContextBus {
    path: PathBuf,
    lock_path: PathBuf,
}

impl ContextBus {
    pub fn new(workdir: &Workdir) -> Self {
        Self {
            path: workdir.bus_file(),
            lock_path: workdir.bus_lock(),
        }
    }

    pub fn put(&self, key: &str, value: Value) {
        let _guard = LockGuard::acquire(&self.lock_path);
        let mut data = self.read();
        data.insert(key.to_string(), value);
        self.write(&data);
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.read().remove(key)
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        let _guard = LockGuard::acquire(&self.lock_path);
        let mut data = self.read();
        let old = data.remove(key);
        if old.is_some() {
            self.write(&data);
        }
        old
    }

    /// All entries under a key prefix.
    pub fn scan(&self, prefix: &str) -> Vec<(String, Value)> {
        self.read()
            .into_iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .collect()
    }

    // ── Intent anchors ──────────────────────────────────────────────────

    pub fn put_intent(&self, anchor: &IntentAnchor) {
        let key = format!("{INTENT_KEY_PREFIX}{}", anchor.task_id);
        match serde_json::to_value(anchor) {
            Ok(v) => self.put(&key, v),
            Err(e) => tracing::warn!(error = %e, "failed to serialize intent anchor"),
        }
    }

    pub fn get_intent(&self, task_id: &str) -> Option<IntentAnchor> {
        let key = format!("{INTENT_KEY_PREFIX}{task_id}");
        self.get(&key)
            .and_then(|v| serde_json::from_value(v).ok())
    }

    pub fn set_agent_status(&self, agent_id: &str, status: &str) {
        self.put(&format!("agent:{agent_id}:status"), Value::String(status.to_string()));
    }

    // ── Internal ────────────────────────────────────────────────────────

    fn read(&self) -> BTreeMap<String, Value> {
        match std::fs::read_to_string(&self.path) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %e,
                    "context bus corrupt; starting from empty"
                );
                BTreeMap::new()
            }),
            Err(_) => BTreeMap::new(),
        }
    }

    fn write(&self, data: &BTreeMap<String, Value>) {
        match serde_json::to_string_pretty(data) {
            Ok(raw) => {
                if let Err(e) = std::fs::write(&self.path, raw) {
                    tracing::warn!(path = %self.path.display(), error = %e, "context bus write failed");
                }
            }
            Err(e) => tracing::warn!(error = %e, "context bus serialize failed"),
        }
    }
}
