pub mod mysql;
pub mod router;

use std::sync::Arc;

use quarry_core::family::DatabaseFamily;

pub use mysql::MysqlBackend;
pub use router::FamilyRouter;

/// Router with every driver this build ships.
#[must_use]
pub fn default_router() -> FamilyRouter {
    FamilyRouter::new().with_backend(DatabaseFamily::MySql, Arc::new(MysqlBackend::new()))
}
