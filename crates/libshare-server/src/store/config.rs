use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use super::crypto::is_valid_host_secret;
use super::persist::{random_hex, read_json, write_json};

pub const DEFAULT_PORT: u16 = 8765;

/// Persisted sharing configuration, one per installation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerConfig {
    pub is_enabled: bool,
    pub port: u16,
    /// Hex-encoded AES-256 key for encrypting tokens at rest.
    pub host_secret: String,
    #[serde(rename = "allowedIPs")]
    pub allowed_ips: BTreeSet<String>,
    /// Peers whose `X-Forwarded-*` headers are believed. Empty trusts none.
    pub trusted_proxies: BTreeSet<String>,
    pub max_connections: usize,
    /// Bytes.
    pub max_upload_size: u64,
    /// Bytes per second, 0 for unlimited.
    pub max_upload_rate: u64,
    pub enable_audit_log: bool,
    pub require_https: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssl_cert_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssl_key_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub publish_library_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    /// Defaults with an empty host secret; [`ConfigStore`] fills it in.
    fn default() -> Self {
        Self {
            is_enabled: false,
            port: DEFAULT_PORT,
            host_secret: String::new(),
            allowed_ips: BTreeSet::new(),
            trusted_proxies: BTreeSet::new(),
            max_connections: 10,
            max_upload_size: 100 * 1024 * 1024,
            max_upload_rate: 10 * 1024 * 1024,
            enable_audit_log: true,
            require_https: false,
            ssl_cert_path: None,
            ssl_key_path: None,
            publish_library_path: None,
        }
    }
}

/// Partial update for [`ConfigStore::update_config`]. `None` leaves the field as is.
#[derive(Debug, Clone, Default)]
pub struct ConfigPatch {
    pub is_enabled: Option<bool>,
    pub port: Option<u16>,
    pub host_secret: Option<String>,
    pub allowed_ips: Option<BTreeSet<String>>,
    pub trusted_proxies: Option<BTreeSet<String>>,
    pub max_connections: Option<usize>,
    pub max_upload_size: Option<u64>,
    pub max_upload_rate: Option<u64>,
    pub enable_audit_log: Option<bool>,
    pub require_https: Option<bool>,
    pub ssl_cert_path: Option<Option<PathBuf>>,
    pub ssl_key_path: Option<Option<PathBuf>>,
    pub publish_library_path: Option<Option<PathBuf>>,
}

impl ConfigPatch {
    fn apply(self, cfg: &mut ServerConfig) {
        if let Some(v) = self.is_enabled {
            cfg.is_enabled = v;
        }
        if let Some(v) = self.port {
            cfg.port = v;
        }
        if let Some(v) = self.host_secret {
            cfg.host_secret = v;
        }
        if let Some(v) = self.allowed_ips {
            cfg.allowed_ips = v;
        }
        if let Some(v) = self.trusted_proxies {
            cfg.trusted_proxies = v;
        }
        if let Some(v) = self.max_connections {
            cfg.max_connections = v;
        }
        if let Some(v) = self.max_upload_size {
            cfg.max_upload_size = v;
        }
        if let Some(v) = self.max_upload_rate {
            cfg.max_upload_rate = v;
        }
        if let Some(v) = self.enable_audit_log {
            cfg.enable_audit_log = v;
        }
        if let Some(v) = self.require_https {
            cfg.require_https = v;
        }
        if let Some(v) = self.ssl_cert_path {
            cfg.ssl_cert_path = v;
        }
        if let Some(v) = self.ssl_key_path {
            cfg.ssl_key_path = v;
        }
        if let Some(v) = self.publish_library_path {
            cfg.publish_library_path = v;
        }
    }
}

/// Generate a fresh 32-byte host secret, hex-encoded.
pub fn generate_host_secret() -> String {
    random_hex(32)
}

/// Thread-safe handle to the persisted [`ServerConfig`].
#[derive(Clone)]
pub struct ConfigStore {
    path: Arc<PathBuf>,
    state: Arc<Mutex<ServerConfig>>,
}

impl ConfigStore {
    /// Load the configuration at `path`, creating or repairing it as needed.
    ///
    /// Never fails: read or parse errors are logged and in-memory defaults
    /// are used without touching the file.
    pub fn open(path: &Path) -> Self {
        let store = Self {
            path: Arc::new(path.to_owned()),
            state: Arc::new(Mutex::new(ServerConfig::default())),
        };
        store.load();
        store
    }

    /// Re-read the file into memory.
    pub fn load(&self) {
        let mut state = self.lock();
        match read_json::<ServerConfig>(&self.path) {
            Ok(Some(mut cfg)) => {
                if !is_valid_host_secret(&cfg.host_secret) {
                    warn!(
                        path = %self.path.display(),
                        "host secret missing or too short; regenerating (existing encrypted tokens become unreadable)"
                    );
                    cfg.host_secret = generate_host_secret();
                    self.persist(&cfg);
                }
                *state = cfg;
            }
            Ok(None) => {
                let cfg = ServerConfig {
                    host_secret: generate_host_secret(),
                    ..ServerConfig::default()
                };
                info!(path = %self.path.display(), "writing default sharing configuration");
                self.persist(&cfg);
                *state = cfg;
            }
            Err(e) => {
                error!(error = %e, "failed to load sharing configuration; using defaults");
                *state = ServerConfig {
                    host_secret: generate_host_secret(),
                    ..ServerConfig::default()
                };
            }
        }
    }

    pub fn get_config(&self) -> ServerConfig {
        self.lock().clone()
    }

    pub fn host_secret(&self) -> String {
        self.lock().host_secret.clone()
    }

    /// Merge `patch` into the current configuration and persist it.
    pub fn update_config(&self, patch: ConfigPatch) -> ServerConfig {
        let mut state = self.lock();
        patch.apply(&mut state);
        if !is_valid_host_secret(&state.host_secret) {
            warn!("rejected invalid host secret in update; regenerating");
            state.host_secret = generate_host_secret();
        }
        self.persist(&state);
        state.clone()
    }

    /// Replace the host secret with a fresh one and return it.
    ///
    /// Tokens encrypted under the previous secret can no longer be decrypted.
    pub fn reset_host_secret(&self) -> String {
        let mut state = self.lock();
        state.host_secret = generate_host_secret();
        self.persist(&state);
        warn!("host secret reset; tokens encrypted with the previous secret are unreadable");
        state.host_secret.clone()
    }

    /// Whether `ip` may connect. An empty allowlist admits everyone.
    pub fn is_ip_allowed(&self, ip: &str) -> bool {
        let state = self.lock();
        state.allowed_ips.is_empty() || state.allowed_ips.contains(ip)
    }

    /// Whether forwarding headers from the socket peer `ip` are believed.
    pub fn is_trusted_proxy(&self, ip: &str) -> bool {
        self.lock().trusted_proxies.contains(ip)
    }

    fn persist(&self, cfg: &ServerConfig) {
        if let Err(e) = write_json(&self.path, cfg) {
            error!(error = %e, "failed to save sharing configuration");
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ServerConfig> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
