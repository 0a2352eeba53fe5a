use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::connections::ConnectionParams;
use crate::family::DatabaseFamily;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct BackendError {
    message: String,
}

impl BackendError {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Driver-facing capability surface, keyed by connection id.
///
/// Implementations own the live driver handles and any credential lookup;
/// callers only ever pass stored parameters.
#[async_trait]
pub trait ConnectionBackend: Send + Sync {
    async fn ping(&self, id: Uuid, family: DatabaseFamily) -> Result<(), BackendError>;

    async fn connect(
        &self,
        id: Uuid,
        family: DatabaseFamily,
        params: &ConnectionParams,
    ) -> Result<(), BackendError>;

    async fn disconnect(&self, id: Uuid) -> Result<(), BackendError>;
}
