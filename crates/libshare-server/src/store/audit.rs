use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{error, info};

use super::config::ConfigStore;
use super::persist::{now, random_hex, read_json, write_json};

// ── Action constants ─────────────────────────────────────────────────────────

pub const ACTION_AUTH_DENIED: &str = "auth.denied";
pub const ACTION_REMOTE_HEALTH: &str = "remote.health";
pub const ACTION_USER_CREATE: &str = "user.create";
pub const ACTION_USER_UPDATE: &str = "user.update";
pub const ACTION_USER_DELETE: &str = "user.delete";
pub const ACTION_CONFIG_UPDATE: &str = "config.update";
pub const ACTION_SECRET_RESET: &str = "secret.reset";
pub const ACTION_AUDIT_CLEAR: &str = "audit.clear";

/// Hard cap on stored entries; the oldest are dropped first.
pub const MAX_ENTRIES: usize = 10_000;
/// Entries older than this are dropped when the log is loaded.
pub const RETENTION_SECS: i64 = 90 * 86_400;
pub const DEFAULT_LIMIT: usize = 100;

// ── AuditLogEntry ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditLogEntry {
    pub id: String,
    pub user_id: String,
    pub nickname: String,
    pub action: String,
    pub resource_type: String,
    pub resource_id: Option<String>,
    #[serde(default)]
    pub details: serde_json::Value,
    pub ip_address: String,
    pub timestamp: i64,
    pub success: bool,
}

impl AuditLogEntry {
    pub fn new(
        user_id: impl Into<String>,
        nickname: impl Into<String>,
        action: &str,
        resource_type: &str,
        ip_address: impl Into<String>,
        success: bool,
    ) -> Self {
        Self {
            id: String::new(), // allocated by the log
            user_id: user_id.into(),
            nickname: nickname.into(),
            action: action.to_owned(),
            resource_type: resource_type.to_owned(),
            resource_id: None,
            details: serde_json::Value::Null,
            ip_address: ip_address.into(),
            timestamp: 0,
            success,
        }
    }

    pub fn with_resource(mut self, resource_id: impl Into<String>) -> Self {
        self.resource_id = Some(resource_id.into());
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

// ── AuditLog ─────────────────────────────────────────────────────────────────

/// Append-only audit trail, stored oldest first.
#[derive(Clone)]
pub struct AuditLog {
    path: Arc<PathBuf>,
    config: ConfigStore,
    entries: Arc<Mutex<Vec<AuditLogEntry>>>,
}

impl AuditLog {
    /// Load the log, dropping entries past the retention window.
    ///
    /// Retention is only applied here; entries that age out while the
    /// process runs stay until the next load.
    pub fn open(path: &Path, config: ConfigStore) -> Self {
        let log = Self {
            path: Arc::new(path.to_owned()),
            config,
            entries: Arc::new(Mutex::new(Vec::new())),
        };

        let mut entries = match read_json::<Vec<AuditLogEntry>>(path) {
            Ok(entries) => entries.unwrap_or_default(),
            Err(e) => {
                error!(error = %e, "failed to load audit log; starting empty");
                Vec::new()
            }
        };

        let cutoff = now() - RETENTION_SECS;
        let before = entries.len();
        entries.retain(|e| e.timestamp >= cutoff);
        let removed = before - entries.len();
        if removed > 0 {
            info!(removed, "pruned old audit entries");
            log.persist(&entries);
        }

        *log.lock() = entries;
        log
    }

    /// Record `entry` if auditing is enabled. Returns the stored entry.
    pub fn add_log(&self, mut entry: AuditLogEntry) -> Option<AuditLogEntry> {
        if !self.config.get_config().enable_audit_log {
            return None;
        }

        entry.id = random_hex(16);
        entry.timestamp = now();

        let mut entries = self.lock();
        entries.push(entry.clone());
        if entries.len() > MAX_ENTRIES {
            let excess = entries.len() - MAX_ENTRIES;
            entries.drain(..excess);
        }
        self.persist(&entries);
        Some(entry)
    }

    /// Up to `limit` most recent entries, newest first.
    pub fn get_logs(&self, limit: usize) -> Vec<AuditLogEntry> {
        self.lock().iter().rev().take(limit).cloned().collect()
    }

    /// Up to `limit` most recent entries for `user_id`, newest first.
    pub fn get_logs_by_user(&self, user_id: &str, limit: usize) -> Vec<AuditLogEntry> {
        self.lock()
            .iter()
            .rev()
            .filter(|e| e.user_id == user_id)
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn clear_logs(&self) {
        let mut entries = self.lock();
        entries.clear();
        self.persist(&entries);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn persist(&self, entries: &[AuditLogEntry]) {
        if let Err(e) = write_json(&self.path, entries) {
            error!(error = %e, "failed to save audit log");
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<AuditLogEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
