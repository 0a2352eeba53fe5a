use std::collections::HashMap;

use async_trait::async_trait;
use mysql_async::prelude::Queryable;
use mysql_async::{Conn, Opts, OptsBuilder};
use quarry_core::backend::{BackendError, ConnectionBackend};
use quarry_core::connections::{ConnectionParams, PasswordSource};
use quarry_core::family::DatabaseFamily;
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

const PASSWORD_ENV: &str = "QUARRY_DB_PASSWORD";
const DEFAULT_KEYRING_SERVICE: &str = "quarry";

#[derive(Debug, Error)]
enum OptsError {
    #[error("invalid connection string: {0}")]
    Url(#[from] mysql_async::UrlError),
    #[error("connection has neither a host nor a connection string")]
    MissingHost,
}

impl From<OptsError> for BackendError {
    fn from(error: OptsError) -> Self {
        BackendError::new(error.to_string())
    }
}

/// One live `Conn` per connection id.
#[derive(Default)]
pub struct MysqlBackend {
    connections: Mutex<HashMap<Uuid, Conn>>,
}

impl MysqlBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn is_connected(&self, id: Uuid) -> bool {
        self.connections.lock().await.contains_key(&id)
    }
}

#[async_trait]
impl ConnectionBackend for MysqlBackend {
    async fn ping(&self, id: Uuid, _family: DatabaseFamily) -> Result<(), BackendError> {
        let mut connections = self.connections.lock().await;
        let conn = connections
            .get_mut(&id)
            .ok_or_else(|| BackendError::new("not connected"))?;
        conn.ping().await.map_err(to_connection_error)
    }

    async fn connect(
        &self,
        id: Uuid,
        _family: DatabaseFamily,
        params: &ConnectionParams,
    ) -> Result<(), BackendError> {
        let opts = opts_from_params(id, params)?;
        let conn = Conn::new(opts).await.map_err(to_connection_error)?;

        let stale = self.connections.lock().await.insert(id, conn);
        if let Some(stale) = stale {
            if let Err(error) = stale.disconnect().await {
                tracing::debug!(connection_id = %id, %error, "closing replaced mysql handle failed");
            }
        }
        tracing::info!(connection_id = %id, "mysql connection opened");
        Ok(())
    }

    async fn disconnect(&self, id: Uuid) -> Result<(), BackendError> {
        let Some(conn) = self.connections.lock().await.remove(&id) else {
            return Ok(());
        };
        conn.disconnect().await.map_err(to_connection_error)
    }
}

fn opts_from_params(id: Uuid, params: &ConnectionParams) -> Result<OptsBuilder, OptsError> {
    let mut builder = match non_empty(params.connection_string.as_deref()) {
        Some(url) => OptsBuilder::from_opts(Opts::from_url(url)?),
        None => {
            let host = non_empty(params.host.as_deref()).ok_or(OptsError::MissingHost)?;
            OptsBuilder::default()
                .ip_or_hostname(host)
                .tcp_port(params.port.unwrap_or(3306))
        }
    };

    if let Some(user) = non_empty(params.user.as_deref()) {
        builder = builder.user(Some(user));
    }

    if let Some(password) = resolve_password(id, params) {
        builder = builder.pass(Some(password));
    }

    if let Some(database) = non_empty(params.database.as_deref()) {
        builder = builder.db_name(Some(database));
    }

    Ok(builder)
}

fn resolve_password(id: Uuid, params: &ConnectionParams) -> Option<String> {
    let env_password = std::env::var(PASSWORD_ENV)
        .ok()
        .filter(|pw| !pw.is_empty());

    match params.password_source {
        PasswordSource::EnvVar => env_password,
        PasswordSource::Keyring => {
            if let Some(password) = load_keyring_password(id, params) {
                return Some(password);
            }

            if let Some(password) = env_password {
                store_keyring_password(id, params, &password);
                return Some(password);
            }

            None
        }
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.and_then(|raw| {
        let trimmed = raw.trim();
        (!trimmed.is_empty()).then_some(trimmed)
    })
}

fn keyring_names(id: Uuid, params: &ConnectionParams) -> (String, String) {
    let service = non_empty(params.keyring_service.as_deref()).unwrap_or(DEFAULT_KEYRING_SERVICE);
    let account = non_empty(params.keyring_account.as_deref())
        .map_or_else(|| id.to_string(), str::to_string);
    (service.to_string(), account)
}

#[cfg(any(target_os = "linux", target_os = "macos", target_os = "windows"))]
fn load_keyring_password(id: Uuid, params: &ConnectionParams) -> Option<String> {
    let entry = keyring_entry(id, params)?;
    entry.get_password().ok().filter(|pw| !pw.is_empty())
}

#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
fn load_keyring_password(_id: Uuid, _params: &ConnectionParams) -> Option<String> {
    None
}

#[cfg(any(target_os = "linux", target_os = "macos", target_os = "windows"))]
fn store_keyring_password(id: Uuid, params: &ConnectionParams, password: &str) {
    if password.is_empty() {
        return;
    }
    if let Some(entry) = keyring_entry(id, params) {
        if let Err(error) = entry.set_password(password) {
            tracing::debug!(connection_id = %id, %error, "caching password in keyring failed");
        }
    }
}

#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
fn store_keyring_password(_id: Uuid, _params: &ConnectionParams, _password: &str) {}

#[cfg(any(target_os = "linux", target_os = "macos", target_os = "windows"))]
fn keyring_entry(id: Uuid, params: &ConnectionParams) -> Option<keyring::Entry> {
    let (service, account) = keyring_names(id, params);
    keyring::Entry::new(&service, &account).ok()
}

fn to_connection_error(error: mysql_async::Error) -> BackendError {
    BackendError::new(error.to_string())
}
