pub mod audit;
pub mod config;
pub mod crypto;
pub mod persist;
pub mod users;

pub use audit::{AuditLog, AuditLogEntry};
pub use config::{ConfigPatch, ConfigStore, ServerConfig};
pub use users::{NewUser, Permission, PermissionSet, SharedUser, UserDirectory, UserPatch};
