//! Shared state handle injected into every consumer (UI, background tasks).
//!
//! Owns the registry, selection, tab session and health monitor, and keeps
//! them consistent: removing or switching the active connection resets the
//! drill-down selection and restarts or stops health polling.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::backend::{BackendError, ConnectionBackend};
use crate::connections::{Connection, ConnectionPatch, ConnectionRegistry};
use crate::events::{EventBus, SessionEvent};
use crate::family::DatabaseFamily;
use crate::health::{HealthConfig, HealthMonitor};
use crate::selection::Selection;
use crate::settings::{config_dir, Settings, SettingsError};
use crate::status::{ConnectionStatus, StatusBoard};
use crate::tabs::{QueryOutput, QuerySession, QueryTab, TabPatch, TabsStore};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatePaths {
    pub settings: PathBuf,
    pub connections: PathBuf,
    pub tabs: PathBuf,
}

impl StatePaths {
    #[must_use]
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            settings: dir.join("settings.toml"),
            connections: dir.join("connections.toml"),
            tabs: dir.join("tabs.json"),
        }
    }

    pub fn default_paths() -> Result<Self, SettingsError> {
        Ok(Self::in_dir(&config_dir()?))
    }
}

struct Inner {
    registry: Mutex<ConnectionRegistry>,
    selection: RwLock<Selection>,
    session: Mutex<QuerySession>,
    board: StatusBoard,
    monitor: HealthMonitor,
    backend: Arc<dyn ConnectionBackend>,
    bus: EventBus,
    tabs_store: Option<TabsStore>,
    /// Family of the most recently activated connection; survives a `None`
    /// selection so the next activation can tell whether tabs are stale.
    last_family: Mutex<Option<DatabaseFamily>>,
}

#[derive(Clone)]
pub struct AppState {
    inner: Arc<Inner>,
}

impl AppState {
    #[must_use]
    pub fn new(
        registry: ConnectionRegistry,
        session: QuerySession,
        backend: Arc<dyn ConnectionBackend>,
        config: HealthConfig,
        tabs_store: Option<TabsStore>,
    ) -> Self {
        let board = StatusBoard::new();
        let bus = EventBus::new();
        let monitor = HealthMonitor::new(Arc::clone(&backend), board.clone(), bus.clone(), config);

        Self {
            inner: Arc::new(Inner {
                registry: Mutex::new(registry),
                selection: RwLock::new(Selection::new()),
                session: Mutex::new(session),
                board,
                monitor,
                backend,
                bus,
                tabs_store,
                last_family: Mutex::new(None),
            }),
        }
    }

    /// Loads the registry and tab snapshot from disk. Any unreadable file
    /// degrades to an empty default rather than failing startup.
    #[must_use]
    pub fn load(paths: &StatePaths, settings: &Settings, backend: Arc<dyn ConnectionBackend>) -> Self {
        let registry = match ConnectionRegistry::load_from_path(&paths.connections) {
            Ok(registry) => registry,
            Err(error) => {
                tracing::error!(%error, "starting with an empty connection list");
                ConnectionRegistry::empty(fresh_registry_path(&paths.connections))
            }
        };

        let tabs_store = TabsStore::from_path(&paths.tabs);
        let session = settings
            .restore_tabs
            .then(|| tabs_store.load())
            .flatten()
            .map_or_else(
                || QuerySession::new(None),
                |snapshot| QuerySession::restore(snapshot, None),
            );
        tracing::info!(
            connections = registry.list().len(),
            tabs = session.len(),
            "state loaded"
        );

        Self::new(
            registry,
            session,
            backend,
            settings.health.to_config(),
            Some(tabs_store),
        )
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.bus.subscribe()
    }

    #[must_use]
    pub fn status_board(&self) -> StatusBoard {
        self.inner.board.clone()
    }

    // Connection registry

    #[must_use]
    pub fn connections(&self) -> Vec<Connection> {
        self.inner.registry.lock().list().to_vec()
    }

    #[must_use]
    pub fn connection(&self, id: Uuid) -> Option<Connection> {
        self.inner.registry.lock().get(id).cloned()
    }

    pub fn add_connection(&self, connection: Connection) -> bool {
        let mut registry = self.inner.registry.lock();
        let added = registry.add(connection);
        if added {
            persist_registry(&registry);
        }
        added
    }

    /// Updating the active connection restarts its monitoring so reconnects
    /// use the new parameters.
    pub fn update_connection(&self, id: Uuid, patch: ConnectionPatch) -> bool {
        let updated = {
            let mut registry = self.inner.registry.lock();
            if !registry.update(id, patch) {
                return false;
            }
            persist_registry(&registry);
            registry.get(id).cloned()
        };

        if let Some(connection) = updated {
            if self.inner.monitor.active_connection_id() == Some(id) {
                self.inner.monitor.activate(connection);
            }
        }
        true
    }

    /// Idempotent. Removing the active connection clears the selection and
    /// stops its health polling before the backend handle is released.
    pub async fn remove_connection(&self, id: Uuid) -> bool {
        let removed = {
            let mut registry = self.inner.registry.lock();
            let removed = registry.remove(id);
            if removed {
                persist_registry(&registry);
            }
            removed
        };
        if !removed {
            return false;
        }

        let was_active = {
            let mut selection = self.inner.selection.write();
            let was_active = selection.active_connection_id() == Some(id);
            if was_active {
                selection.set_active_connection(None);
            }
            was_active
        };
        if was_active {
            self.inner.monitor.deactivate();
            self.publish_selection();
        }
        self.inner.board.forget(id);

        if let Err(error) = self.inner.backend.disconnect(id).await {
            tracing::debug!(connection_id = %id, %error, "disconnect after removal failed");
        }
        tracing::info!(connection_id = %id, was_active, "connection removed");
        true
    }

    // Selection

    #[must_use]
    pub fn selection(&self) -> Selection {
        self.inner.selection.read().clone()
    }

    /// Always clears database and collection. Unknown ids are ignored.
    pub fn set_active_connection(&self, id: Option<Uuid>) -> bool {
        let target = match id {
            Some(id) => match self.connection(id) {
                Some(connection) => Some(connection),
                None => {
                    tracing::debug!(connection_id = %id, "ignoring selection of unknown connection");
                    return false;
                }
            },
            None => None,
        };

        self.inner.selection.write().set_active_connection(id);

        match target {
            Some(connection) => {
                let family = connection.family;
                let previous_family = self.inner.last_family.lock().replace(family);
                self.inner.monitor.activate(connection);
                if previous_family.is_some_and(|previous| previous != family) {
                    self.reset_tabs_for_connection(Some(family));
                }
            }
            None => self.inner.monitor.deactivate(),
        }
        self.publish_selection();
        true
    }

    pub fn set_database(&self, name: Option<String>) {
        self.inner.selection.write().set_database(name);
        self.publish_selection();
    }

    pub fn set_collection(&self, name: Option<String>) {
        self.inner.selection.write().set_collection(name);
        self.publish_selection();
    }

    #[must_use]
    pub fn active_connection(&self) -> Option<Connection> {
        let selection = self.inner.selection.read();
        let registry = self.inner.registry.lock();
        selection.active_connection(&registry).cloned()
    }

    fn publish_selection(&self) {
        self.inner
            .bus
            .publish(SessionEvent::SelectionChanged(self.selection()));
    }

    // Health

    #[must_use]
    pub fn status(&self, id: Uuid) -> Option<ConnectionStatus> {
        self.inner.board.get(id)
    }

    #[must_use]
    pub fn statuses(&self) -> HashMap<Uuid, ConnectionStatus> {
        self.inner.board.snapshot()
    }

    /// Opens a backend session for a registered connection with its stored
    /// parameters. Unknown ids are reported as a backend error.
    pub async fn connect(&self, id: Uuid) -> Result<(), BackendError> {
        let connection = self
            .connection(id)
            .ok_or_else(|| BackendError::new(format!("unknown connection {id}")))?;
        self.inner
            .backend
            .connect(id, connection.family, &connection.params)
            .await
    }

    pub async fn check_now(&self) -> Option<ConnectionStatus> {
        self.inner.monitor.check_now().await
    }

    // Query tabs

    /// Read-only view of the tab session.
    pub fn with_tabs<R>(&self, read: impl FnOnce(&QuerySession) -> R) -> R {
        read(&self.inner.session.lock())
    }

    #[must_use]
    pub fn tabs(&self) -> Vec<QueryTab> {
        self.with_tabs(|session| session.tabs().to_vec())
    }

    #[must_use]
    pub fn active_tab_id(&self) -> Uuid {
        self.with_tabs(QuerySession::active_tab_id)
    }

    pub fn add_tab(&self, family: Option<DatabaseFamily>) -> Uuid {
        self.mutate_tabs(true, |session| session.add_tab(family))
    }

    pub fn close_tab(&self, id: Uuid) -> bool {
        self.mutate_tabs(true, |session| session.close_tab(id))
    }

    pub fn set_active_tab(&self, id: Uuid) -> bool {
        self.mutate_tabs(true, |session| session.set_active_tab(id))
    }

    pub fn update_tab(&self, id: Uuid, patch: TabPatch) -> bool {
        let durable = patch.touches_durable();
        self.mutate_tabs(durable, |session| session.update_tab(id, patch))
    }

    pub fn reset_tabs_for_connection(&self, family: Option<DatabaseFamily>) {
        self.mutate_tabs(true, |session| session.reset_for_connection(family));
    }

    pub fn begin_execution(&self, tab_id: Uuid, connection_id: Uuid) -> bool {
        self.mutate_tabs(false, |session| session.begin_execution(tab_id, connection_id))
    }

    pub fn finish_execution(
        &self,
        tab_id: Uuid,
        outcome: Result<QueryOutput, String>,
        elapsed: Duration,
    ) -> bool {
        self.mutate_tabs(false, |session| {
            session.finish_execution(tab_id, outcome, elapsed)
        })
    }

    fn mutate_tabs<R>(&self, durable: bool, mutate: impl FnOnce(&mut QuerySession) -> R) -> R {
        let (result, snapshot) = {
            let mut session = self.inner.session.lock();
            let result = mutate(&mut session);
            (result, durable.then(|| session.snapshot()))
        };

        if let (Some(snapshot), Some(store)) = (snapshot, &self.inner.tabs_store) {
            if let Err(error) = store.save(&snapshot) {
                tracing::warn!(%error, "failed to persist tabs snapshot");
            }
        }
        self.inner.bus.publish(SessionEvent::TabsChanged);
        result
    }

    /// Routes reconnect outcomes to tabs executing against that connection.
    /// Ends when the bus closes or the state is dropped.
    pub fn spawn_event_forwarder(&self) -> JoinHandle<()> {
        let mut events = self.subscribe();
        let inner: Weak<Inner> = Arc::downgrade(&self.inner);

        tokio::spawn(async move {
            loop {
                let (id, message) = match events.recv().await {
                    Ok(SessionEvent::Reconnected { id }) => {
                        (id, "connection re-established".to_string())
                    }
                    Ok(SessionEvent::ReconnectFailed { id, error }) => {
                        (id, format!("reconnect failed: {error}"))
                    }
                    Ok(_) => continue,
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "event forwarder lagged");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };

                let Some(inner) = inner.upgrade() else {
                    break;
                };
                let touched = inner.session.lock().note_connection_event(id, &message);
                if touched > 0 {
                    inner.bus.publish(SessionEvent::TabsChanged);
                }
            }
        })
    }

    /// Stops polling, writes the final tab snapshot and closes the event bus.
    pub fn shutdown(&self) {
        self.inner.monitor.deactivate();
        if let Some(store) = &self.inner.tabs_store {
            let snapshot = self.inner.session.lock().snapshot();
            if let Err(error) = store.save(&snapshot) {
                tracing::warn!(%error, "failed to persist tabs snapshot at shutdown");
            }
        }
        self.inner.bus.close();
        tracing::info!("state shut down");
    }
}

/// Moves an unusable connections file aside so the empty registry that
/// replaces it never overwrites it. Falls back to a sibling file when the
/// move itself fails.
fn fresh_registry_path(path: &Path) -> PathBuf {
    if !path.exists() {
        return path.to_path_buf();
    }
    match ConnectionRegistry::set_aside(path) {
        Ok(kept_at) => {
            tracing::warn!(kept_at = %kept_at.display(), "unreadable connections file kept aside");
            path.to_path_buf()
        }
        Err(error) => {
            let fallback = path.with_extension("recovered.toml");
            tracing::error!(%error, fallback = %fallback.display(), "saving connections to a separate file");
            fallback
        }
    }
}

fn persist_registry(registry: &ConnectionRegistry) {
    if let Err(error) = registry.persist() {
        tracing::warn!(%error, "failed to persist connection registry");
    }
}
