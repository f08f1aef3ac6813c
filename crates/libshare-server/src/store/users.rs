use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use constant_time_eq::constant_time_eq;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::config::ConfigStore;
use super::crypto::{self, is_valid_host_secret, looks_encrypted};
use super::persist::{now, random_hex, read_json, write_json};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Permission {
    ReadOnly,
    Download,
    Upload,
    Edit,
    Full,
}

impl Permission {
    pub const ALL: [Permission; 5] = [
        Self::ReadOnly,
        Self::Download,
        Self::Upload,
        Self::Edit,
        Self::Full,
    ];

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().replace('-', "_").as_str() {
            "READ_ONLY" => Some(Self::ReadOnly),
            "DOWNLOAD" => Some(Self::Download),
            "UPLOAD" => Some(Self::Upload),
            "EDIT" => Some(Self::Edit),
            "FULL" => Some(Self::Full),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ReadOnly => "READ_ONLY",
            Self::Download => "DOWNLOAD",
            Self::Upload => "UPLOAD",
            Self::Edit => "EDIT",
            Self::Full => "FULL",
        }
    }
}

impl std::fmt::Display for Permission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub type PermissionSet = BTreeSet<Permission>;

/// Whether `set` grants `wanted`, directly or through `FULL`.
pub fn has_permission(set: &PermissionSet, wanted: Permission) -> bool {
    set.contains(&wanted) || set.contains(&Permission::Full)
}

/// Flip `perm` in `set`.
///
/// `FULL` on grants everything; `FULL` off removes only `FULL`. Removing any
/// other permission also drops `FULL`, since the set is no longer complete.
pub fn toggle_permission(set: &mut PermissionSet, perm: Permission) {
    if set.remove(&perm) {
        if perm != Permission::Full {
            set.remove(&Permission::Full);
        }
    } else if perm == Permission::Full {
        set.extend(Permission::ALL);
    } else {
        set.insert(perm);
    }
}

/// A remote identity authorized to use this library.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SharedUser {
    pub id: String,
    pub user_token: String,
    pub access_token: String,
    pub nickname: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hardware_id: Option<String>,
    #[serde(default)]
    pub permissions: PermissionSet,
    pub created_at: i64,
    pub last_access_at: i64,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
}

fn default_true() -> bool {
    true
}

/// Enrollment request for [`UserDirectory::add_user`].
#[derive(Debug, Clone)]
pub struct NewUser {
    pub user_token: String,
    /// Issued automatically when `None`.
    pub access_token: Option<String>,
    pub nickname: String,
    pub icon_url: Option<String>,
    pub hardware_id: Option<String>,
    pub permissions: PermissionSet,
    pub is_active: bool,
    pub ip_address: Option<String>,
}

impl NewUser {
    pub fn new(user_token: impl Into<String>, nickname: impl Into<String>) -> Self {
        Self {
            user_token: user_token.into(),
            access_token: None,
            nickname: nickname.into(),
            icon_url: None,
            hardware_id: None,
            permissions: [Permission::ReadOnly].into(),
            is_active: true,
            ip_address: None,
        }
    }
}

/// Partial update for [`UserDirectory::update_user`].
#[derive(Debug, Clone, Default)]
pub struct UserPatch {
    pub nickname: Option<String>,
    pub icon_url: Option<Option<String>>,
    pub hardware_id: Option<Option<String>>,
    pub permissions: Option<PermissionSet>,
    pub is_active: Option<bool>,
    pub ip_address: Option<Option<String>>,
    pub access_token: Option<String>,
}

/// Generate a new access token: 32 random bytes, hex-encoded.
pub fn generate_access_token() -> String {
    random_hex(32)
}

/// Thread-safe handle to the persisted user directory.
///
/// Tokens are held in plaintext in memory and encrypted per field on write.
/// Lookups are linear scans; directories are expected to stay small.
#[derive(Clone)]
pub struct UserDirectory {
    path: Arc<PathBuf>,
    config: ConfigStore,
    users: Arc<Mutex<Vec<SharedUser>>>,
}

impl UserDirectory {
    /// Load the directory at `path`, decrypting tokens with the current host secret.
    pub fn open(path: &Path, config: ConfigStore) -> Self {
        let secret = config.host_secret();
        let users = match read_json::<Vec<SharedUser>>(path) {
            Ok(Some(mut users)) => {
                for user in &mut users {
                    decrypt_field(&mut user.user_token, &secret, &user.id);
                    decrypt_field(&mut user.access_token, &secret, &user.id);
                }
                users
            }
            Ok(None) => Vec::new(),
            Err(e) => {
                error!(error = %e, "failed to load shared users; starting empty");
                Vec::new()
            }
        };
        debug!(count = users.len(), "loaded shared users");

        Self {
            path: Arc::new(path.to_owned()),
            config,
            users: Arc::new(Mutex::new(users)),
        }
    }

    /// Enroll a user. The returned record carries plaintext tokens for
    /// one-time display.
    pub fn add_user(&self, candidate: NewUser) -> SharedUser {
        let mut users = self.lock();

        let mut id = random_hex(16);
        while users.iter().any(|u| u.id == id) {
            id = random_hex(16);
        }
        let ts = now();
        let user = SharedUser {
            id,
            user_token: candidate.user_token,
            access_token: candidate
                .access_token
                .unwrap_or_else(generate_access_token),
            nickname: candidate.nickname,
            icon_url: candidate.icon_url,
            hardware_id: candidate.hardware_id,
            permissions: candidate.permissions,
            created_at: ts,
            last_access_at: ts,
            is_active: candidate.is_active,
            ip_address: candidate.ip_address,
        };

        users.push(user.clone());
        self.persist(&users);
        info!(id = %user.id, nickname = %user.nickname, "shared user added");
        user
    }

    pub fn list_users(&self) -> Vec<SharedUser> {
        self.lock().clone()
    }

    pub fn get_user_by_token(&self, user_token: &str) -> Option<SharedUser> {
        self.lock()
            .iter()
            .find(|u| u.user_token == user_token)
            .cloned()
    }

    pub fn get_user_by_id(&self, id: &str) -> Option<SharedUser> {
        self.lock().iter().find(|u| u.id == id).cloned()
    }

    /// Merge `patch` into the user with `id`. Returns the updated record.
    pub fn update_user(&self, id: &str, patch: UserPatch) -> Option<SharedUser> {
        self.modify(id, |user| {
            if let Some(v) = patch.nickname {
                user.nickname = v;
            }
            if let Some(v) = patch.icon_url {
                user.icon_url = v;
            }
            if let Some(v) = patch.hardware_id {
                user.hardware_id = v;
            }
            if let Some(v) = patch.permissions {
                user.permissions = v;
            }
            if let Some(v) = patch.is_active {
                user.is_active = v;
            }
            if let Some(v) = patch.ip_address {
                user.ip_address = v;
            }
            if let Some(v) = patch.access_token {
                user.access_token = v;
            }
        })
    }

    /// Stamp the access time and client address. Returns false if `id` is unknown.
    pub fn update_last_access(&self, id: &str, ip: Option<String>) -> bool {
        self.modify(id, |user| {
            user.last_access_at = now();
            if ip.is_some() {
                user.ip_address = ip;
            }
        })
        .is_some()
    }

    /// Flip one permission on the user with `id`; see [`toggle_permission`].
    pub fn toggle_permission(&self, id: &str, perm: Permission) -> Option<SharedUser> {
        self.modify(id, |user| toggle_permission(&mut user.permissions, perm))
    }

    /// Remove the user with `id`. Returns true if it existed.
    pub fn delete_user(&self, id: &str) -> bool {
        let mut users = self.lock();
        let before = users.len();
        users.retain(|u| u.id != id);
        let existed = users.len() != before;
        if existed {
            self.persist(&users);
            info!(id, "shared user deleted");
        }
        existed
    }

    /// Authenticate a request: both tokens must match an active user.
    pub fn verify_token_pair(&self, user_token: &str, access_token: &str) -> Option<SharedUser> {
        self.lock()
            .iter()
            .find(|u| {
                let user_ok = constant_time_eq(u.user_token.as_bytes(), user_token.as_bytes());
                let access_ok =
                    constant_time_eq(u.access_token.as_bytes(), access_token.as_bytes());
                user_ok & access_ok && u.is_active
            })
            .cloned()
    }

    fn modify(&self, id: &str, f: impl FnOnce(&mut SharedUser)) -> Option<SharedUser> {
        let mut users = self.lock();
        let user = users.iter_mut().find(|u| u.id == id)?;
        f(user);
        let updated = user.clone();
        self.persist(&users);
        Some(updated)
    }

    fn persist(&self, users: &[SharedUser]) {
        let stored = stored_form(users, &self.config.host_secret());
        if let Err(e) = write_json(&self.path, &stored) {
            error!(error = %e, "failed to save shared users");
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<SharedUser>> {
        self.users.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// The records as written to disk.
///
/// Tokens are encrypted when `secret` is a valid host secret. With a weak
/// secret they are written in plaintext for compatibility with older
/// installations. Values still in triplet form (encrypted under a previous
/// secret) are written back unchanged.
pub fn stored_form(users: &[SharedUser], secret: &str) -> Vec<SharedUser> {
    let can_encrypt = is_valid_host_secret(secret);
    users
        .iter()
        .map(|u| {
            let mut u = u.clone();
            if can_encrypt {
                encrypt_field(&mut u.user_token, secret);
                encrypt_field(&mut u.access_token, secret);
            }
            u
        })
        .collect()
}

fn decrypt_field(value: &mut String, secret: &str, user_id: &str) {
    if !looks_encrypted(value) {
        return;
    }
    match crypto::decrypt(value, secret) {
        Some(plain) => *value = plain,
        None => warn!(user_id, "could not decrypt stored token; keeping stored value"),
    }
}

fn encrypt_field(value: &mut String, secret: &str) {
    if looks_encrypted(value) {
        return;
    }
    match crypto::encrypt(value, secret) {
        Ok(ct) => *value = ct,
        Err(e) => warn!(error = %e, "token encryption failed; storing plaintext"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::config::ConfigPatch;

    fn make_dir() -> (UserDirectory, ConfigStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let config = ConfigStore::open(&dir.path().join("server-config.json"));
        let users = UserDirectory::open(&dir.path().join("shared-users.json"), config.clone());
        (users, config, dir)
    }

    fn stored(dir: &tempfile::TempDir) -> Vec<SharedUser> {
        read_json(&dir.path().join("shared-users.json"))
            .unwrap()
            .unwrap()
    }

    fn perms(list: &[Permission]) -> PermissionSet {
        list.iter().copied().collect()
    }

    #[test]
    fn add_returns_plaintext_and_stores_ciphertext() {
        let (users, config, dir) = make_dir();
        let mut candidate = NewUser::new("peer-1", "Living room");
        candidate.access_token = Some("acc-1".into());
        let user = users.add_user(candidate);

        assert_eq!(user.user_token, "peer-1");
        assert_eq!(user.access_token, "acc-1");
        assert_eq!(user.created_at, user.last_access_at);
        assert!(user.is_active);

        let on_disk = &stored(&dir)[0];
        assert!(looks_encrypted(&on_disk.user_token));
        assert!(looks_encrypted(&on_disk.access_token));
        let secret = config.host_secret();
        assert_eq!(
            crypto::decrypt(&on_disk.access_token, &secret).as_deref(),
            Some("acc-1")
        );
    }

    #[test]
    fn access_token_is_issued_when_absent() {
        let (users, _config, _dir) = make_dir();
        let user = users.add_user(NewUser::new("peer", "nick"));
        assert_eq!(user.access_token.len(), 64);
        assert_eq!(user.permissions, perms(&[Permission::ReadOnly]));
    }

    #[test]
    fn ids_are_unique() {
        let (users, _config, _dir) = make_dir();
        let a = users.add_user(NewUser::new("a", "a"));
        let b = users.add_user(NewUser::new("b", "b"));
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn reopen_decrypts_tokens() {
        let (users, config, dir) = make_dir();
        let user = users.add_user(NewUser::new("peer", "nick"));

        let reopened = UserDirectory::open(&dir.path().join("shared-users.json"), config);
        let found = reopened.get_user_by_id(&user.id).unwrap();
        assert_eq!(found.user_token, "peer");
        assert_eq!(found.access_token, user.access_token);
    }

    #[test]
    fn lookups() {
        let (users, _config, _dir) = make_dir();
        let user = users.add_user(NewUser::new("peer", "nick"));
        assert_eq!(users.get_user_by_token("peer").unwrap().id, user.id);
        assert_eq!(users.get_user_by_id(&user.id).unwrap().nickname, "nick");
        assert!(users.get_user_by_token("nobody").is_none());
        assert!(users.get_user_by_id("missing").is_none());
    }

    #[test]
    fn verify_token_pair_requires_both_and_active() {
        let (users, _config, _dir) = make_dir();
        let mut candidate = NewUser::new("peer", "nick");
        candidate.access_token = Some("secret-access".into());
        let user = users.add_user(candidate);

        assert!(users.verify_token_pair("peer", "secret-access").is_some());
        assert!(users.verify_token_pair("peer", "wrong").is_none());
        assert!(users.verify_token_pair("other", "secret-access").is_none());
        assert!(users.verify_token_pair("peer", "secret-acces").is_none());

        users.update_user(
            &user.id,
            UserPatch {
                is_active: Some(false),
                ..Default::default()
            },
        );
        assert!(users.verify_token_pair("peer", "secret-access").is_none());
    }

    #[test]
    fn update_user_merges_fields() {
        let (users, _config, dir) = make_dir();
        let user = users.add_user(NewUser::new("peer", "old"));
        let updated = users
            .update_user(
                &user.id,
                UserPatch {
                    nickname: Some("new".into()),
                    icon_url: Some(Some("http://x/icon.png".into())),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(updated.nickname, "new");
        assert_eq!(updated.user_token, "peer");
        assert_eq!(stored(&dir)[0].nickname, "new");
        assert!(users.update_user("missing", UserPatch::default()).is_none());
    }

    #[test]
    fn update_last_access_stamps_ip() {
        let (users, _config, dir) = make_dir();
        let user = users.add_user(NewUser::new("peer", "nick"));
        assert!(users.update_last_access(&user.id, Some("10.1.1.1".into())));
        assert_eq!(stored(&dir)[0].ip_address.as_deref(), Some("10.1.1.1"));
        assert!(!users.update_last_access("missing", None));
    }

    #[test]
    fn delete_user_removes_entry() {
        let (users, _config, dir) = make_dir();
        let user = users.add_user(NewUser::new("peer", "nick"));
        assert!(users.delete_user(&user.id));
        assert!(!users.delete_user(&user.id));
        assert!(users.get_user_by_id(&user.id).is_none());
        assert!(stored(&dir).is_empty());
    }

    #[test]
    fn getters_return_copies() {
        let (users, _config, _dir) = make_dir();
        let user = users.add_user(NewUser::new("peer", "nick"));
        let mut copy = users.get_user_by_id(&user.id).unwrap();
        copy.permissions.insert(Permission::Full);
        copy.is_active = false;
        let fresh = users.get_user_by_id(&user.id).unwrap();
        assert!(!fresh.permissions.contains(&Permission::Full));
        assert!(fresh.is_active);
    }

    #[test]
    fn full_toggles() {
        let mut set = perms(&[Permission::ReadOnly]);
        toggle_permission(&mut set, Permission::Full);
        assert_eq!(set, perms(&Permission::ALL));

        toggle_permission(&mut set, Permission::Edit);
        assert_eq!(
            set,
            perms(&[Permission::ReadOnly, Permission::Download, Permission::Upload])
        );
    }

    #[test]
    fn full_off_keeps_the_rest() {
        let mut set = perms(&Permission::ALL);
        toggle_permission(&mut set, Permission::Full);
        assert_eq!(
            set,
            perms(&[
                Permission::ReadOnly,
                Permission::Download,
                Permission::Upload,
                Permission::Edit
            ])
        );
    }

    #[test]
    fn individual_on_only_adds_it() {
        let mut set = perms(&[Permission::ReadOnly, Permission::Download, Permission::Upload]);
        toggle_permission(&mut set, Permission::Edit);
        assert!(!set.contains(&Permission::Full));
        assert_eq!(set.len(), 4);
    }

    #[test]
    fn full_implies_everything() {
        let set = perms(&[Permission::Full]);
        assert!(Permission::ALL.iter().all(|p| has_permission(&set, *p)));
        let set = perms(&[Permission::Download]);
        assert!(!has_permission(&set, Permission::Upload));
    }

    #[test]
    fn directory_toggle_persists() {
        let (users, _config, dir) = make_dir();
        let user = users.add_user(NewUser::new("peer", "nick"));
        let updated = users.toggle_permission(&user.id, Permission::Full).unwrap();
        assert_eq!(updated.permissions, perms(&Permission::ALL));
        assert_eq!(stored(&dir)[0].permissions, perms(&Permission::ALL));
    }

    #[test]
    fn permissions_serialize_as_strings() {
        let json = serde_json::to_string(&perms(&[Permission::ReadOnly, Permission::Full])).unwrap();
        assert_eq!(json, r#"["READ_ONLY","FULL"]"#);
        assert_eq!(Permission::from_str("read-only"), Some(Permission::ReadOnly));
        assert_eq!(Permission::from_str("bogus"), None);
    }

    fn record(user_token: &str, access_token: &str) -> SharedUser {
        SharedUser {
            id: "u1".into(),
            user_token: user_token.into(),
            access_token: access_token.into(),
            nickname: "n".into(),
            icon_url: None,
            hardware_id: None,
            permissions: perms(&[Permission::ReadOnly]),
            created_at: 1,
            last_access_at: 1,
            is_active: true,
            ip_address: None,
        }
    }

    #[test]
    fn weak_secret_stores_plaintext() {
        let users = [record("peer", "acc")];
        let not_hex = "zz".repeat(32);
        for secret in ["", "abc123", not_hex.as_str()] {
            assert_eq!(stored_form(&users, secret), users);
        }
    }

    #[test]
    fn strong_secret_stores_triplets() {
        let secret = "ab".repeat(32);
        let out = stored_form(&[record("peer", "acc")], &secret);
        assert!(looks_encrypted(&out[0].user_token));
        assert_eq!(crypto::decrypt(&out[0].user_token, &secret).as_deref(), Some("peer"));
        assert_eq!(crypto::decrypt(&out[0].access_token, &secret).as_deref(), Some("acc"));
        assert_eq!(out[0].nickname, "n");
    }

    #[test]
    fn leftover_triplet_is_written_back_unchanged() {
        let old = crypto::encrypt("peer", &"cd".repeat(32)).unwrap();
        let out = stored_form(&[record(&old, "acc")], &"ab".repeat(32));
        assert_eq!(out[0].user_token, old);
        assert!(looks_encrypted(&out[0].access_token));
    }

    #[test]
    fn plaintext_entries_migrate_on_next_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shared-users.json");
        std::fs::write(
            &path,
            r#"[{"id":"u1","userToken":"peer","accessToken":"acc","nickname":"n",
                "permissions":["READ_ONLY"],"createdAt":1,"lastAccessAt":1,"isActive":true}]"#,
        )
        .unwrap();
        let config = ConfigStore::open(&dir.path().join("server-config.json"));
        let users = UserDirectory::open(&path, config);

        assert!(users.verify_token_pair("peer", "acc").is_some());
        users.update_last_access("u1", None);
        assert!(looks_encrypted(&stored(&dir)[0].access_token));
    }

    #[test]
    fn secret_rotation_preserves_unreadable_tokens() {
        let (users, config, dir) = make_dir();
        users.add_user(NewUser::new("peer", "nick"));
        let old_ct = stored(&dir)[0].user_token.clone();

        config.update_config(ConfigPatch {
            host_secret: Some("cd".repeat(32)),
            ..Default::default()
        });
        let reopened = UserDirectory::open(&dir.path().join("shared-users.json"), config);

        let user = &reopened.list_users()[0];
        assert_eq!(user.user_token, old_ct);
        assert!(reopened.get_user_by_token("peer").is_none());

        reopened.update_last_access(&user.id, None);
        assert_eq!(stored(&dir)[0].user_token, old_ct);
    }
}
