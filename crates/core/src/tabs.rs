use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::family::{default_query, DatabaseFamily};
use crate::settings::{config_dir, SettingsError};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TabMode {
    #[default]
    Consume,
    Produce,
}

/// The part of a tab that survives a restart.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DurableTab {
    pub id: Uuid,
    pub name: String,
    pub query: String,
    #[serde(default)]
    pub mode: TabMode,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryOutput {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,
    #[serde(default)]
    pub affected_rows: Option<u64>,
}

/// Runtime tab: the durable record plus fields that are only valid for the
/// current process.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryTab {
    pub durable: DurableTab,
    pub result: Option<QueryOutput>,
    pub execution_time: Option<Duration>,
    pub error: Option<String>,
    pub is_loading: bool,
    /// Connection the in-flight execution runs against.
    pub running_on: Option<Uuid>,
    /// Connection events reported while executing.
    pub notice: Option<String>,
}

impl QueryTab {
    /// Fills every transient field with its empty default.
    #[must_use]
    pub fn rehydrate(durable: DurableTab) -> Self {
        Self {
            durable,
            result: None,
            execution_time: None,
            error: None,
            is_loading: false,
            running_on: None,
            notice: None,
        }
    }

    #[must_use]
    pub fn to_durable(&self) -> DurableTab {
        self.durable.clone()
    }

    #[must_use]
    pub fn id(&self) -> Uuid {
        self.durable.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.durable.name
    }

    #[must_use]
    pub fn query(&self) -> &str {
        &self.durable.query
    }

    #[must_use]
    pub fn mode(&self) -> TabMode {
        self.durable.mode
    }
}

impl From<DurableTab> for QueryTab {
    fn from(durable: DurableTab) -> Self {
        Self::rehydrate(durable)
    }
}

/// Partial tab update. Transient fields use a nested `Option` so a patch can
/// clear them (`Some(None)`) as well as leave them alone (`None`).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TabPatch {
    pub name: Option<String>,
    pub query: Option<String>,
    pub mode: Option<TabMode>,
    pub result: Option<Option<QueryOutput>>,
    pub execution_time: Option<Option<Duration>>,
    pub error: Option<Option<String>>,
    pub is_loading: Option<bool>,
}

impl TabPatch {
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    #[must_use]
    pub fn query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }

    #[must_use]
    pub fn mode(mut self, mode: TabMode) -> Self {
        self.mode = Some(mode);
        self
    }

    #[must_use]
    pub fn result(mut self, result: Option<QueryOutput>) -> Self {
        self.result = Some(result);
        self
    }

    #[must_use]
    pub fn execution_time(mut self, elapsed: Option<Duration>) -> Self {
        self.execution_time = Some(elapsed);
        self
    }

    #[must_use]
    pub fn error(mut self, error: Option<String>) -> Self {
        self.error = Some(error);
        self
    }

    #[must_use]
    pub fn loading(mut self, is_loading: bool) -> Self {
        self.is_loading = Some(is_loading);
        self
    }

    #[must_use]
    pub fn touches_durable(&self) -> bool {
        self.name.is_some() || self.query.is_some() || self.mode.is_some()
    }

    fn apply(self, tab: &mut QueryTab) {
        if let Some(name) = self.name {
            tab.durable.name = name;
        }
        if let Some(query) = self.query {
            tab.durable.query = query;
        }
        if let Some(mode) = self.mode {
            tab.durable.mode = mode;
        }
        if let Some(result) = self.result {
            tab.result = result;
        }
        if let Some(execution_time) = self.execution_time {
            tab.execution_time = execution_time;
        }
        if let Some(error) = self.error {
            tab.error = error;
        }
        if let Some(is_loading) = self.is_loading {
            tab.is_loading = is_loading;
            if !is_loading {
                tab.running_on = None;
            }
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TabsSnapshot {
    #[serde(default)]
    pub tabs: Vec<DurableTab>,
    #[serde(default)]
    pub active_tab_id: Option<Uuid>,
    #[serde(default)]
    pub counter: u64,
}

/// Open query tabs. Never empty, and the active id always names a live tab.
#[derive(Debug, Clone, PartialEq)]
pub struct QuerySession {
    tabs: Vec<QueryTab>,
    active_tab_id: Uuid,
    counter: u64,
}

impl QuerySession {
    #[must_use]
    pub fn new(family: Option<DatabaseFamily>) -> Self {
        Self::with_fresh_tab(0, family)
    }

    fn with_fresh_tab(counter: u64, family: Option<DatabaseFamily>) -> Self {
        let mut counter = counter;
        let tab = fresh_tab(&mut counter, family);
        Self {
            active_tab_id: tab.id(),
            tabs: vec![tab],
            counter,
        }
    }

    /// Rebuilds a session from its durable snapshot. Transient fields start
    /// empty; an empty snapshot yields one fresh default tab and a dangling
    /// active id falls back to the first tab.
    #[must_use]
    pub fn restore(snapshot: TabsSnapshot, family: Option<DatabaseFamily>) -> Self {
        let mut tabs: Vec<QueryTab> = Vec::with_capacity(snapshot.tabs.len());
        for durable in snapshot.tabs {
            if tabs.iter().all(|tab| tab.id() != durable.id) {
                tabs.push(QueryTab::rehydrate(durable));
            }
        }

        if tabs.is_empty() {
            return Self::with_fresh_tab(snapshot.counter, family);
        }

        let active_tab_id = snapshot
            .active_tab_id
            .filter(|id| tabs.iter().any(|tab| tab.id() == *id))
            .unwrap_or_else(|| tabs[0].id());
        let counter = snapshot.counter.max(tabs.len() as u64);

        Self {
            tabs,
            active_tab_id,
            counter,
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> TabsSnapshot {
        TabsSnapshot {
            tabs: self.tabs.iter().map(QueryTab::to_durable).collect(),
            active_tab_id: Some(self.active_tab_id),
            counter: self.counter,
        }
    }

    #[must_use]
    pub fn tabs(&self) -> &[QueryTab] {
        &self.tabs
    }

    #[must_use]
    pub fn tab(&self, id: Uuid) -> Option<&QueryTab> {
        self.tabs.iter().find(|tab| tab.id() == id)
    }

    #[must_use]
    pub fn active_tab_id(&self) -> Uuid {
        self.active_tab_id
    }

    #[must_use]
    pub fn active_tab(&self) -> &QueryTab {
        self.tab(self.active_tab_id).unwrap_or(&self.tabs[0])
    }

    #[must_use]
    pub fn counter(&self) -> u64 {
        self.counter
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tabs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tabs.is_empty()
    }

    fn tab_mut(&mut self, id: Uuid) -> Option<&mut QueryTab> {
        self.tabs.iter_mut().find(|tab| tab.id() == id)
    }

    pub fn add_tab(&mut self, family: Option<DatabaseFamily>) -> Uuid {
        let tab = fresh_tab(&mut self.counter, family);
        let id = tab.id();
        self.tabs.push(tab);
        self.active_tab_id = id;
        id
    }

    /// Closing the last tab or an unknown id is a no-op. When the active tab
    /// closes, the tab that slides into its index becomes active.
    pub fn close_tab(&mut self, id: Uuid) -> bool {
        if self.tabs.len() <= 1 {
            return false;
        }
        let Some(index) = self.tabs.iter().position(|tab| tab.id() == id) else {
            return false;
        };

        self.tabs.remove(index);
        if self.active_tab_id == id {
            let next = index.min(self.tabs.len() - 1);
            self.active_tab_id = self.tabs[next].id();
        }
        true
    }

    pub fn set_active_tab(&mut self, id: Uuid) -> bool {
        if self.tab(id).is_none() {
            return false;
        }
        self.active_tab_id = id;
        true
    }

    pub fn update_tab(&mut self, id: Uuid, patch: TabPatch) -> bool {
        let Some(tab) = self.tab_mut(id) else {
            return false;
        };
        patch.apply(tab);
        true
    }

    /// Replaces every tab with one fresh default tab for `family`.
    pub fn reset_for_connection(&mut self, family: Option<DatabaseFamily>) {
        let tab = fresh_tab(&mut self.counter, family);
        self.active_tab_id = tab.id();
        self.tabs = vec![tab];
    }

    pub fn begin_execution(&mut self, id: Uuid, connection: Uuid) -> bool {
        let Some(tab) = self.tab_mut(id) else {
            return false;
        };
        tab.is_loading = true;
        tab.running_on = Some(connection);
        tab.error = None;
        tab.notice = None;
        true
    }

    pub fn finish_execution(
        &mut self,
        id: Uuid,
        outcome: Result<QueryOutput, String>,
        elapsed: Duration,
    ) -> bool {
        let Some(tab) = self.tab_mut(id) else {
            return false;
        };
        tab.is_loading = false;
        tab.running_on = None;
        tab.execution_time = Some(elapsed);
        match outcome {
            Ok(output) => {
                tab.result = Some(output);
                tab.error = None;
            }
            Err(error) => {
                tab.result = None;
                tab.error = Some(error);
            }
        }
        true
    }

    /// Attaches `message` to every tab still executing against `connection`
    /// and returns how many were touched.
    pub fn note_connection_event(&mut self, connection: Uuid, message: &str) -> usize {
        let mut touched = 0;
        for tab in &mut self.tabs {
            if tab.is_loading && tab.running_on == Some(connection) {
                tab.notice = Some(message.to_string());
                touched += 1;
            }
        }
        touched
    }
}

fn fresh_tab(counter: &mut u64, family: Option<DatabaseFamily>) -> QueryTab {
    *counter += 1;
    QueryTab::rehydrate(DurableTab {
        id: Uuid::new_v4(),
        name: format!("Query {counter}"),
        query: default_query(family).to_string(),
        mode: TabMode::default(),
    })
}

#[derive(Debug, Error)]
pub enum TabsStoreError {
    #[error("failed to resolve config directory: {0}")]
    Config(#[from] SettingsError),
    #[error("failed to create config directory at {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize tabs snapshot: {source}")]
    Serialize {
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to write tabs snapshot at {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// JSON file holding the durable tab snapshot.
#[derive(Debug, Clone)]
pub struct TabsStore {
    path: PathBuf,
}

impl TabsStore {
    pub fn load_default() -> Result<Self, TabsStoreError> {
        Ok(Self::from_path(config_dir()?.join("tabs.json")))
    }

    #[must_use]
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Absent, unreadable and corrupt snapshots all read as `None`.
    #[must_use]
    pub fn load(&self) -> Option<TabsSnapshot> {
        if !self.path.exists() {
            return None;
        }

        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(error) => {
                tracing::warn!(path = %self.path.display(), %error, "failed to read tabs snapshot");
                return None;
            }
        };

        match serde_json::from_str(&raw) {
            Ok(snapshot) => Some(snapshot),
            Err(error) => {
                tracing::warn!(path = %self.path.display(), %error, "discarding corrupt tabs snapshot");
                None
            }
        }
    }

    pub fn save(&self, snapshot: &TabsSnapshot) -> Result<(), TabsStoreError> {
        if let Some(parent_dir) = self.path.parent() {
            fs::create_dir_all(parent_dir).map_err(|source| TabsStoreError::CreateDir {
                path: parent_dir.to_path_buf(),
                source,
            })?;
        }

        let rendered = serde_json::to_string_pretty(snapshot)
            .map_err(|source| TabsStoreError::Serialize { source })?;
        fs::write(&self.path, rendered).map_err(|source| TabsStoreError::Write {
            path: self.path.clone(),
            source,
        })
    }
}
