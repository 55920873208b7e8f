//! Credential storage
//!
//! Persists token sets per authorization server so credentials survive
//! restarts. Both stores keep at most one [`TokenSet`] per origin.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use super::token::TokenSet;
use crate::config::Config;
use crate::{Error, Result};

/// Persistent storage of token sets keyed by authorization server origin.
///
/// The token manager calls `load` at most once per origin, while holding its
/// state lock, so it should be quick. Writes are issued from the blocking
/// thread pool and may block.
pub trait CredentialStore: Send + Sync {
    /// Load the token set for `origin`. A record that cannot be read back
    /// is treated as absent.
    fn load(&self, origin: &str) -> Result<Option<TokenSet>>;

    /// Save `tokens`, replacing whatever was stored for `tokens.origin`
    fn save(&self, tokens: &TokenSet) -> Result<()>;

    /// Remove the record for `origin`, if any
    fn remove(&self, origin: &str) -> Result<()>;

    /// Remove every record
    fn clear(&self) -> Result<()>;
}

/// In-process store, for tests and embedders that bring their own persistence
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    tokens: RwLock<HashMap<String, TokenSet>>,
}

impl MemoryCredentialStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records
    pub fn len(&self) -> usize {
        self.tokens.read().len()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.tokens.read().is_empty()
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn load(&self, origin: &str) -> Result<Option<TokenSet>> {
        Ok(self.tokens.read().get(origin).cloned())
    }

    fn save(&self, tokens: &TokenSet) -> Result<()> {
        self.tokens
            .write()
            .insert(tokens.origin.clone(), tokens.clone());
        Ok(())
    }

    fn remove(&self, origin: &str) -> Result<()> {
        self.tokens.write().remove(origin);
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        self.tokens.write().clear();
        Ok(())
    }
}

const FILE_SUFFIX: &str = "_tokens.json";

/// One JSON file per origin under a private directory
#[derive(Debug)]
pub struct FileCredentialStore {
    base_dir: PathBuf,
}

impl FileCredentialStore {
    /// Create a store rooted at `base_dir`, creating it owner-only if needed
    pub fn new(base_dir: impl Into<PathBuf>) -> Result<Self> {
        let base_dir = base_dir.into();
        if !base_dir.exists() {
            fs::create_dir_all(&base_dir).map_err(|e| {
                Error::Storage(format!(
                    "Failed to create credential dir {}: {e}",
                    base_dir.display()
                ))
            })?;
            restrict_permissions(&base_dir, 0o700);
        }

        Ok(Self { base_dir })
    }

    /// Create a store in the configured location (default `~/.mcp-gateway/oauth`)
    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(config.storage_dir()?)
    }

    /// Directory holding the records
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Storage key for an origin
    fn storage_key(origin: &str) -> String {
        let hash = Sha256::digest(origin.as_bytes());
        hex::encode(hash)[..16].to_string()
    }

    /// Get the file path for an origin's tokens
    fn token_path(&self, origin: &str) -> PathBuf {
        self.base_dir
            .join(format!("{}{FILE_SUFFIX}", Self::storage_key(origin)))
    }
}

impl CredentialStore for FileCredentialStore {
    fn load(&self, origin: &str) -> Result<Option<TokenSet>> {
        let path = self.token_path(origin);

        let content = match fs::read(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(origin = %origin, "No stored tokens found");
                return Ok(None);
            }
            Err(e) => {
                warn!(origin = %origin, error = %e, "Failed to read token file");
                return Ok(None);
            }
        };

        match serde_json::from_slice::<TokenSet>(&content) {
            Ok(tokens) if tokens.origin == origin => {
                debug!(origin = %origin, expires_at = %tokens.expires_at, "Loaded stored tokens");
                Ok(Some(tokens))
            }
            Ok(tokens) => {
                warn!(origin = %origin, stored = %tokens.origin, "Stored tokens belong to another origin, ignoring");
                Ok(None)
            }
            Err(e) => {
                warn!(origin = %origin, error = %e, "Failed to parse stored tokens, ignoring");
                Ok(None)
            }
        }
    }

    fn save(&self, tokens: &TokenSet) -> Result<()> {
        let path = self.token_path(&tokens.origin);
        let tmp = path.with_extension("json.tmp");

        let content = serde_json::to_vec_pretty(tokens)
            .map_err(|e| Error::Storage(format!("Failed to serialize tokens: {e}")))?;

        let mut file = fs::File::create(&tmp)
            .map_err(|e| Error::Storage(format!("Failed to write token file: {e}")))?;
        restrict_permissions(&tmp, 0o600);
        file.write_all(&content)
            .and_then(|()| file.sync_all())
            .map_err(|e| Error::Storage(format!("Failed to write token file: {e}")))?;
        drop(file);

        fs::rename(&tmp, &path)
            .map_err(|e| Error::Storage(format!("Failed to replace token file: {e}")))?;

        info!(origin = %tokens.origin, "Saved OAuth tokens");
        Ok(())
    }

    fn remove(&self, origin: &str) -> Result<()> {
        let path = self.token_path(origin);
        match fs::remove_file(&path) {
            Ok(()) => {
                info!(origin = %origin, "Deleted OAuth tokens");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Storage(format!("Failed to delete token file: {e}"))),
        }
    }

    fn clear(&self) -> Result<()> {
        let entries = match fs::read_dir(&self.base_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        for entry in entries {
            let path = entry?.path();
            let is_record = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(FILE_SUFFIX));
            if is_record {
                fs::remove_file(&path)?;
            }
        }
        info!(dir = %self.base_dir.display(), "Cleared stored OAuth tokens");
        Ok(())
    }
}

/// Set restrictive permissions (owner only)
#[cfg_attr(not(unix), allow(unused_variables))]
fn restrict_permissions(path: &Path, mode: u32) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(mode)) {
            warn!(path = %path.display(), error = %e, "Failed to restrict permissions");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeDelta, TimeZone, Utc};
    use pretty_assertions::assert_eq;

    fn tokens(origin: &str) -> TokenSet {
        TokenSet {
            access_token: "at-123".to_string(),
            refresh_token: Some("rt-456".to_string()),
            expires_at: Utc.with_ymd_and_hms(2030, 1, 2, 3, 4, 5).unwrap() + TimeDelta::milliseconds(678),
            granted_scopes: ["read".to_string(), "write".to_string()].into_iter().collect(),
            origin: origin.to_string(),
            client_id: "client-1".to_string(),
        }
    }

    #[test]
    fn file_store_round_trips_exactly() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCredentialStore::new(dir.path().join("oauth")).unwrap();
        let original = tokens("https://auth.example.com");

        store.save(&original).unwrap();
        let loaded = store.load("https://auth.example.com").unwrap().unwrap();
        assert_eq!(loaded, original);

        // saving again what was loaded produces identical bytes
        let path = store.token_path("https://auth.example.com");
        let first = fs::read(&path).unwrap();
        store.save(&loaded).unwrap();
        assert_eq!(fs::read(&path).unwrap(), first);
    }

    #[test]
    fn file_store_keeps_one_record_per_origin() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCredentialStore::new(dir.path()).unwrap();

        store.save(&tokens("https://a.example.com")).unwrap();
        let mut replacement = tokens("https://a.example.com");
        replacement.access_token = "at-new".to_string();
        store.save(&replacement).unwrap();
        store.save(&tokens("https://b.example.com")).unwrap();

        let loaded = store.load("https://a.example.com").unwrap().unwrap();
        assert_eq!(loaded.access_token, "at-new");
        let files = fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(files, 2);
    }

    #[test]
    fn file_store_treats_garbage_as_absent() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCredentialStore::new(dir.path()).unwrap();
        fs::write(store.token_path("https://auth.example.com"), b"{not json").unwrap();

        assert!(store.load("https://auth.example.com").unwrap().is_none());
        assert!(store.load("https://never-saved.example.com").unwrap().is_none());
    }

    #[test]
    fn file_store_remove_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCredentialStore::new(dir.path()).unwrap();
        store.save(&tokens("https://a.example.com")).unwrap();
        store.save(&tokens("https://b.example.com")).unwrap();

        store.remove("https://a.example.com").unwrap();
        // removing twice is fine
        store.remove("https://a.example.com").unwrap();
        assert!(store.load("https://a.example.com").unwrap().is_none());
        assert!(store.load("https://b.example.com").unwrap().is_some());

        store.clear().unwrap();
        assert!(store.load("https://b.example.com").unwrap().is_none());
    }

    #[cfg(unix)]
    #[test]
    fn file_store_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("creds");
        let store = FileCredentialStore::new(&base).unwrap();
        store.save(&tokens("https://auth.example.com")).unwrap();

        let dir_mode = fs::metadata(&base).unwrap().permissions().mode() & 0o777;
        assert_eq!(dir_mode, 0o700);
        let file_mode = fs::metadata(store.token_path("https://auth.example.com"))
            .unwrap()
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(file_mode, 0o600);
    }

    #[test]
    fn storage_key_is_stable_and_short() {
        let a = FileCredentialStore::storage_key("https://auth.example.com");
        assert_eq!(a.len(), 16);
        assert_eq!(a, FileCredentialStore::storage_key("https://auth.example.com"));
        assert_ne!(a, FileCredentialStore::storage_key("https://other.example.com"));
    }

    #[test]
    fn memory_store_basics() {
        let store = MemoryCredentialStore::new();
        assert!(store.is_empty());
        store.save(&tokens("https://a.example.com")).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(
            store.load("https://a.example.com").unwrap(),
            Some(tokens("https://a.example.com"))
        );
        store.remove("https://a.example.com").unwrap();
        assert!(store.load("https://a.example.com").unwrap().is_none());
        store.save(&tokens("https://b.example.com")).unwrap();
        store.clear().unwrap();
        assert!(store.is_empty());
    }
}
