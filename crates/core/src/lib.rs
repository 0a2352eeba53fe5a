pub mod backend;
pub mod connections;
pub mod events;
pub mod family;
pub mod health;
pub mod selection;
pub mod settings;
pub mod state;
pub mod status;
pub mod tabs;

pub use backend::{BackendError, ConnectionBackend};
pub use connections::{Connection, ConnectionParams, ConnectionPatch, ConnectionRegistry};
pub use events::{EventBus, SessionEvent};
pub use family::DatabaseFamily;
pub use health::{HealthConfig, HealthMonitor};
pub use selection::Selection;
pub use settings::Settings;
pub use state::{AppState, StatePaths};
pub use status::{ConnectionStatus, HealthState, StatusBoard};
pub use tabs::{QuerySession, QueryTab, TabPatch, TabsStore};
