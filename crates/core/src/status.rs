use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    #[default]
    Unknown,
    Checking,
    Healthy,
    Unhealthy,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ConnectionStatus {
    pub state: HealthState,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
    pub last_latency: Option<Duration>,
}

impl ConnectionStatus {
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.state == HealthState::Healthy
    }
}

/// Per-connection health, written by the monitor and read by everyone else.
#[derive(Debug, Clone, Default)]
pub struct StatusBoard {
    entries: Arc<RwLock<HashMap<Uuid, ConnectionStatus>>>,
}

impl StatusBoard {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, id: Uuid) -> Option<ConnectionStatus> {
        self.entries.read().get(&id).cloned()
    }

    #[must_use]
    pub fn snapshot(&self) -> HashMap<Uuid, ConnectionStatus> {
        self.entries.read().clone()
    }

    pub(crate) fn update<R>(&self, id: Uuid, apply: impl FnOnce(&mut ConnectionStatus) -> R) -> R {
        let mut entries = self.entries.write();
        apply(entries.entry(id).or_default())
    }

    /// Applies `apply` only while `live` holds, checked under the write lock.
    pub(crate) fn update_if<R>(
        &self,
        id: Uuid,
        live: impl FnOnce() -> bool,
        apply: impl FnOnce(&mut ConnectionStatus) -> R,
    ) -> Option<R> {
        let mut entries = self.entries.write();
        if !live() {
            return None;
        }
        Some(apply(entries.entry(id).or_default()))
    }

    /// Runs `f` while holding the write lock, ordering it against `update_if`.
    pub(crate) fn fenced<R>(&self, f: impl FnOnce() -> R) -> R {
        let _entries = self.entries.write();
        f()
    }

    pub(crate) fn forget(&self, id: Uuid) {
        self.entries.write().remove(&id);
    }
}
