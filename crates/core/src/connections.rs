use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::family::DatabaseFamily;
use crate::settings::{config_dir, SettingsError};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PasswordSource {
    #[default]
    EnvVar,
    Keyring,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ConnectionParams {
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub database: Option<String>,
    /// Full connection URI; takes precedence over the discrete fields when set.
    #[serde(default)]
    pub connection_string: Option<String>,
    #[serde(default)]
    pub password_source: PasswordSource,
    #[serde(default)]
    pub keyring_service: Option<String>,
    #[serde(default)]
    pub keyring_account: Option<String>,
    #[serde(default)]
    pub read_only: bool,
}

impl ConnectionParams {
    #[must_use]
    pub fn host(host: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            host: Some(host.into()),
            user: Some(user.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn uri(connection_string: impl Into<String>) -> Self {
        Self {
            connection_string: Some(connection_string.into()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Connection {
    pub id: Uuid,
    pub name: String,
    pub family: DatabaseFamily,
    #[serde(default)]
    pub params: ConnectionParams,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Connection {
    #[must_use]
    pub fn new(name: impl Into<String>, family: DatabaseFamily, params: ConnectionParams) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            family,
            params,
            created_at: now,
            updated_at: now,
        }
    }

    /// Port to dial, falling back to the family's well-known port.
    #[must_use]
    pub fn effective_port(&self) -> Option<u16> {
        self.params.port.or(self.family.traits().default_port)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionPatch {
    pub name: Option<String>,
    pub family: Option<DatabaseFamily>,
    pub params: Option<ConnectionParams>,
}

impl ConnectionPatch {
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    #[must_use]
    pub fn family(mut self, family: DatabaseFamily) -> Self {
        self.family = Some(family);
        self
    }

    #[must_use]
    pub fn params(mut self, params: ConnectionParams) -> Self {
        self.params = Some(params);
        self
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("failed to resolve config directory: {0}")]
    Config(#[from] SettingsError),
    #[error("failed to read connections file at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse connections file at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("failed to create config directory at {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize connections: {source}")]
    Serialize {
        #[source]
        source: toml::ser::Error,
    },
    #[error("failed to write connections file at {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to move connections file at {path} aside: {source}")]
    SetAside {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ConnectionsDocument {
    #[serde(default)]
    connections: Vec<Connection>,
}

impl ConnectionsDocument {
    /// Collapses duplicate ids (last entry wins) while keeping file order.
    fn normalize(&mut self) {
        let mut kept: Vec<Connection> = Vec::with_capacity(self.connections.len());
        for connection in self.connections.drain(..) {
            if let Some(existing) = kept.iter_mut().find(|kept| kept.id == connection.id) {
                *existing = connection;
            } else {
                kept.push(connection);
            }
        }
        self.connections = kept;
    }
}

/// Durable list of configured connections, persisted as `connections.toml`.
#[derive(Debug, Clone)]
pub struct ConnectionRegistry {
    path: PathBuf,
    connections: Vec<Connection>,
}

impl ConnectionRegistry {
    pub fn load_default() -> Result<Self, RegistryError> {
        let path = default_connections_path()?;
        Self::load_from_path(path)
    }

    pub fn load_from_path(path: impl Into<PathBuf>) -> Result<Self, RegistryError> {
        let path = path.into();
        if !path.exists() {
            return Ok(Self::empty(path));
        }

        let raw = fs::read_to_string(&path).map_err(|source| RegistryError::Read {
            path: path.clone(),
            source,
        })?;

        if raw.trim().is_empty() {
            return Ok(Self::empty(path));
        }

        let mut doc: ConnectionsDocument =
            toml::from_str(&raw).map_err(|source| RegistryError::Parse {
                path: path.clone(),
                source,
            })?;
        doc.normalize();

        Ok(Self {
            path,
            connections: doc.connections,
        })
    }

    #[must_use]
    pub fn empty(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            connections: Vec::new(),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn list(&self) -> &[Connection] {
        &self.connections
    }

    #[must_use]
    pub fn get(&self, id: Uuid) -> Option<&Connection> {
        self.connections.iter().find(|connection| connection.id == id)
    }

    #[must_use]
    pub fn contains(&self, id: Uuid) -> bool {
        self.get(id).is_some()
    }

    /// Returns `false` without touching the list when the id is already taken.
    pub fn add(&mut self, connection: Connection) -> bool {
        if self.contains(connection.id) {
            return false;
        }
        self.connections.push(connection);
        true
    }

    pub fn update(&mut self, id: Uuid, patch: ConnectionPatch) -> bool {
        let Some(connection) = self
            .connections
            .iter_mut()
            .find(|connection| connection.id == id)
        else {
            return false;
        };

        if let Some(name) = patch.name {
            connection.name = name;
        }
        if let Some(family) = patch.family {
            connection.family = family;
        }
        if let Some(params) = patch.params {
            connection.params = params;
        }
        connection.updated_at = Utc::now().max(connection.updated_at);
        true
    }

    pub fn remove(&mut self, id: Uuid) -> bool {
        let original_len = self.connections.len();
        self.connections.retain(|connection| connection.id != id);
        self.connections.len() != original_len
    }

    /// Renames the file at `path` to `<name>.corrupt-<timestamp>` and returns
    /// the new location.
    pub fn set_aside(path: &Path) -> Result<PathBuf, RegistryError> {
        let mut name = path
            .file_name()
            .map(std::ffi::OsStr::to_os_string)
            .unwrap_or_default();
        name.push(format!(".corrupt-{}", Utc::now().format("%Y%m%d%H%M%S%3f")));
        let target = path.with_file_name(name);

        fs::rename(path, &target).map_err(|source| RegistryError::SetAside {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(target)
    }

    pub fn persist(&self) -> Result<(), RegistryError> {
        if let Some(parent_dir) = self.path.parent() {
            fs::create_dir_all(parent_dir).map_err(|source| RegistryError::CreateDir {
                path: parent_dir.to_path_buf(),
                source,
            })?;
        }

        let doc = ConnectionsDocument {
            connections: self.connections.clone(),
        };
        let rendered =
            toml::to_string_pretty(&doc).map_err(|source| RegistryError::Serialize { source })?;

        fs::write(&self.path, rendered).map_err(|source| RegistryError::Write {
            path: self.path.clone(),
            source,
        })
    }
}

pub fn default_connections_path() -> Result<PathBuf, RegistryError> {
    Ok(config_dir()?.join("connections.toml"))
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use tempfile::TempDir;
    use uuid::Uuid;

    use super::{Connection, ConnectionParams, ConnectionPatch, ConnectionRegistry, PasswordSource};
    use crate::family::DatabaseFamily;

    fn temp_connections_path(temp_dir: &TempDir) -> PathBuf {
        temp_dir.path().join("connections.toml")
    }

    fn sample_connection(name: &str) -> Connection {
        Connection::new(
            name,
            DatabaseFamily::Postgres,
            ConnectionParams::host("127.0.0.1", "postgres"),
        )
    }

    #[test]
    fn missing_connections_file_loads_empty_registry() {
        let temp_dir = TempDir::new().expect("failed to create temp directory");
        let registry = ConnectionRegistry::load_from_path(temp_connections_path(&temp_dir))
            .expect("failed to load registry");
        assert!(registry.list().is_empty());
    }

    #[test]
    fn add_persist_reload_update_and_remove() {
        let temp_dir = TempDir::new().expect("failed to create temp directory");
        let path = temp_connections_path(&temp_dir);

        let mut registry = ConnectionRegistry::load_from_path(&path).expect("failed to load");
        let mut connection = sample_connection("local");
        connection.params.database = Some("app".to_string());
        connection.params.password_source = PasswordSource::Keyring;
        let id = connection.id;

        assert!(registry.add(connection.clone()));
        registry.persist().expect("failed to persist registry");

        let mut reloaded = ConnectionRegistry::load_from_path(&path).expect("failed to reload");
        assert_eq!(reloaded.get(id), Some(&connection));

        let before = reloaded.get(id).expect("connection should exist").updated_at;
        assert!(reloaded.update(id, ConnectionPatch::default().name("staging")));
        let updated = reloaded.get(id).expect("connection should exist");
        assert_eq!(updated.name, "staging");
        assert!(updated.updated_at >= before);
        reloaded.persist().expect("failed to persist update");

        let mut reloaded = ConnectionRegistry::load_from_path(&path).expect("failed to reload");
        assert_eq!(
            reloaded.get(id).map(|connection| connection.name.as_str()),
            Some("staging")
        );

        assert!(reloaded.remove(id));
        reloaded.persist().expect("failed to persist removal");
        let reloaded = ConnectionRegistry::load_from_path(path).expect("failed final reload");
        assert!(reloaded.list().is_empty());
    }

    #[test]
    fn remove_is_idempotent() {
        let mut registry = ConnectionRegistry::empty("unused.toml");
        let connection = sample_connection("local");
        let id = connection.id;
        registry.add(connection);

        assert!(registry.remove(id));
        assert!(!registry.remove(id));
        assert!(!registry.remove(Uuid::new_v4()));
    }

    #[test]
    fn names_need_not_be_unique_but_ids_must_be() {
        let mut registry = ConnectionRegistry::empty("unused.toml");
        let first = sample_connection("shared");
        let second = sample_connection("shared");
        let duplicate = first.clone();

        assert!(registry.add(first));
        assert!(registry.add(second));
        assert!(!registry.add(duplicate));
        assert_eq!(registry.list().len(), 2);
    }

    #[test]
    fn update_of_unknown_id_is_ignored() {
        let mut registry = ConnectionRegistry::empty("unused.toml");
        assert!(!registry.update(Uuid::new_v4(), ConnectionPatch::default().name("ghost")));
    }

    #[test]
    fn effective_port_falls_back_to_family_default() {
        let mut connection = sample_connection("local");
        assert_eq!(connection.effective_port(), Some(5432));
        connection.params.port = Some(6543);
        assert_eq!(connection.effective_port(), Some(6543));
    }

    #[test]
    fn set_aside_moves_file_without_touching_its_bytes() {
        let temp_dir = TempDir::new().expect("failed to create temp directory");
        let path = temp_connections_path(&temp_dir);
        std::fs::write(&path, "[[connections]]\nid = \"nope\"\n").expect("failed to write file");

        let kept_at = ConnectionRegistry::set_aside(&path).expect("set aside should succeed");

        assert!(!path.exists());
        assert!(kept_at
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.starts_with("connections.toml.corrupt-")));
        assert_eq!(
            std::fs::read_to_string(&kept_at).expect("kept file should be readable"),
            "[[connections]]\nid = \"nope\"\n"
        );
    }

    #[test]
    fn duplicate_ids_in_file_collapse_to_last_entry() {
        let temp_dir = TempDir::new().expect("failed to create temp directory");
        let path = temp_connections_path(&temp_dir);

        let original = sample_connection("first");
        let mut renamed = original.clone();
        renamed.name = "second".to_string();

        let mut registry = ConnectionRegistry::empty(&path);
        registry.connections = vec![original, renamed];
        registry.persist().expect("failed to persist registry");

        let reloaded = ConnectionRegistry::load_from_path(&path).expect("failed to reload");
        assert_eq!(reloaded.list().len(), 1);
        assert_eq!(reloaded.list()[0].name, "second");
    }
}
