use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::connections::{Connection, ConnectionRegistry};

/// Drill-down position: connection, then database, then collection/table/key.
///
/// Choosing a level clears everything beneath it, even when the same value is
/// chosen again.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    active_connection: Option<Uuid>,
    database: Option<String>,
    collection: Option<String>,
}

impl Selection {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_active_connection(&mut self, id: Option<Uuid>) {
        self.active_connection = id;
        self.database = None;
        self.collection = None;
    }

    pub fn set_database(&mut self, name: Option<String>) {
        self.database = name;
        self.collection = None;
    }

    pub fn set_collection(&mut self, name: Option<String>) {
        self.collection = name;
    }

    #[must_use]
    pub fn active_connection_id(&self) -> Option<Uuid> {
        self.active_connection
    }

    #[must_use]
    pub fn database(&self) -> Option<&str> {
        self.database.as_deref()
    }

    #[must_use]
    pub fn collection(&self) -> Option<&str> {
        self.collection.as_deref()
    }

    /// Resolves the active id against the registry; a dangling id yields `None`.
    #[must_use]
    pub fn active_connection<'a>(&self, registry: &'a ConnectionRegistry) -> Option<&'a Connection> {
        self.active_connection.and_then(|id| registry.get(id))
    }
}
