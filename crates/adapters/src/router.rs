use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use quarry_core::backend::{BackendError, ConnectionBackend};
use quarry_core::connections::ConnectionParams;
use quarry_core::family::DatabaseFamily;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Dispatches each call to the backend registered for the connection's
/// family. `disconnect` only carries an id, so the family seen at `connect`
/// is remembered until the handle is released.
#[derive(Default)]
pub struct FamilyRouter {
    backends: HashMap<DatabaseFamily, Arc<dyn ConnectionBackend>>,
    families: RwLock<HashMap<Uuid, DatabaseFamily>>,
}

impl FamilyRouter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_backend(mut self, family: DatabaseFamily, backend: Arc<dyn ConnectionBackend>) -> Self {
        self.backends.insert(family, backend);
        self
    }

    #[must_use]
    pub fn supports(&self, family: DatabaseFamily) -> bool {
        self.backends.contains_key(&family)
    }

    fn backend_for(&self, family: DatabaseFamily) -> Result<&Arc<dyn ConnectionBackend>, BackendError> {
        self.backends.get(&family).ok_or_else(|| {
            BackendError::new(format!("no backend registered for {}", family.label()))
        })
    }
}

#[async_trait]
impl ConnectionBackend for FamilyRouter {
    async fn ping(&self, id: Uuid, family: DatabaseFamily) -> Result<(), BackendError> {
        self.backend_for(family)?.ping(id, family).await
    }

    async fn connect(
        &self,
        id: Uuid,
        family: DatabaseFamily,
        params: &ConnectionParams,
    ) -> Result<(), BackendError> {
        let backend = self.backend_for(family)?;
        let previous = self.families.write().await.insert(id, family);
        if let Some(previous) = previous.filter(|previous| *previous != family) {
            // family changed since the last connect; release the old handle
            if let Ok(stale) = self.backend_for(previous) {
                if let Err(error) = stale.disconnect(id).await {
                    tracing::debug!(connection_id = %id, %error, "releasing handle of previous family failed");
                }
            }
        }
        backend.connect(id, family, params).await
    }

    async fn disconnect(&self, id: Uuid) -> Result<(), BackendError> {
        let Some(family) = self.families.write().await.remove(&id) else {
            tracing::debug!(connection_id = %id, "disconnect for a connection that was never opened");
            return Ok(());
        };
        self.backend_for(family)?.disconnect(id).await
    }
}
