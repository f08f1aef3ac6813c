pub mod auth;
pub mod dirs;
pub mod handlers;
pub mod probe;
pub mod server;
pub mod store;

use std::path::Path;

/// Shared application state threaded through axum handlers.
///
/// The config store is opened first so a repaired host secret is in place
/// before the user directory decrypts anything.
#[derive(Clone)]
pub struct AppState {
    pub config: store::ConfigStore,
    pub users: store::UserDirectory,
    pub audit: store::AuditLog,
}

impl AppState {
    pub fn open(data_dir: &Path) -> Self {
        let config = store::ConfigStore::open(&data_dir.join(dirs::CONFIG_FILE));
        let users = store::UserDirectory::open(&data_dir.join(dirs::USERS_FILE), config.clone());
        let audit = store::AuditLog::open(&data_dir.join(dirs::AUDIT_FILE), config.clone());
        Self {
            config,
            users,
            audit,
        }
    }
}

pub use probe::{probe_health, HealthProber, RemoteLibraryConnection, RemoteToken, RetryPolicy};
pub use server::{run, ServerOptions};
