//! Machine-account secret store.
//!
//! The live store holds the domain machine password and keytab blobs. A
//! copy of the store is kept per NetBIOS name in the appliance database
//! directory and is used to restore the live store when it goes missing.

use crate::error::{CallError, CallResult, Errno};
use crate::fsutil::atomic_write;
use crate::secret::SecretString;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

const MACHINE_PASSWORD_PREFIX: &str = "SECRETS/MACHINE_PASSWORD/";
const KEYTAB_PREFIX: &str = "SECRETS/KEYTAB/";

/// Secret store contract.
#[async_trait]
pub trait SecretsStore: Send + Sync {
    /// Machine password for `domain` (the workgroup). Fails with `ENOENT`
    /// when the store itself is missing; `Ok(None)` means the store exists
    /// but holds no entry for the domain.
    async fn get_machine_secret(&self, domain: &str) -> CallResult<Option<SecretString>>;

    /// Record the machine password for `domain`.
    async fn set_machine_secret(&self, domain: &str, secret: &SecretString) -> CallResult<()>;

    /// Persist a keytab blob under `name`.
    async fn put_keytab(&self, name: &str, keytab: &[u8]) -> CallResult<()>;

    /// Copy the live store into the database backup for `netbiosname`.
    async fn backup(&self, netbiosname: &str) -> CallResult<()>;

    /// Restore the live store from the database backup. Returns `false`
    /// when no backup exists.
    async fn restore(&self, netbiosname: &str) -> CallResult<bool>;

    /// Drop any in-memory copy so the next read hits storage.
    async fn flush_cache(&self);
}

type Entries = BTreeMap<String, String>;

/// [`SecretsStore`] persisted as a JSON map of base64 values.
#[derive(Debug)]
pub struct FileSecretsStore {
    path: PathBuf,
    backup_dir: PathBuf,
    cache: RwLock<Option<Entries>>,
}

impl FileSecretsStore {
    /// Create a store at `path` with backups under `backup_dir`.
    pub fn new(path: impl Into<PathBuf>, backup_dir: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            backup_dir: backup_dir.into(),
            cache: RwLock::new(None),
        }
    }

    /// Live store path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn backup_path(&self, netbiosname: &str) -> PathBuf {
        self.backup_dir
            .join(format!("{}.secrets.json", netbiosname.to_ascii_uppercase()))
    }

    fn load(&self) -> CallResult<Entries> {
        if let Some(entries) = self.cache.read().as_ref() {
            return Ok(entries.clone());
        }
        let data = std::fs::read(&self.path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                CallError::new(
                    Errno::ENOENT,
                    format!("{}: secrets file does not exist", self.path.display()),
                )
            } else {
                e.into()
            }
        })?;
        let entries: Entries = serde_json::from_slice(&data).map_err(|e| {
            CallError::new(
                Errno::EFAULT,
                format!("{}: corrupt secrets file: {}", self.path.display(), e),
            )
        })?;
        *self.cache.write() = Some(entries.clone());
        Ok(entries)
    }

    fn store(&self, entries: &Entries) -> CallResult<()> {
        let data = serde_json::to_vec_pretty(entries)
            .map_err(|e| CallError::new(Errno::EFAULT, e.to_string()))?;
        atomic_write(&self.path, &data, 0o600)?;
        *self.cache.write() = Some(entries.clone());
        Ok(())
    }

    fn load_or_empty(&self) -> CallResult<Entries> {
        match self.load() {
            Ok(entries) => Ok(entries),
            Err(e) if e.errno == Errno::ENOENT => Ok(Entries::new()),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl SecretsStore for FileSecretsStore {
    async fn get_machine_secret(&self, domain: &str) -> CallResult<Option<SecretString>> {
        let entries = self.load()?;
        let key = format!("{}{}", MACHINE_PASSWORD_PREFIX, domain.to_ascii_uppercase());
        let Some(encoded) = entries.get(&key) else {
            return Ok(None);
        };
        let raw = STANDARD.decode(encoded).map_err(|e| {
            CallError::new(Errno::EFAULT, format!("{}: invalid encoding: {}", key, e))
        })?;
        let secret = String::from_utf8(raw)
            .map_err(|_| CallError::new(Errno::EFAULT, format!("{}: not valid UTF-8", key)))?;
        Ok(Some(SecretString::new(secret)))
    }

    async fn set_machine_secret(&self, domain: &str, secret: &SecretString) -> CallResult<()> {
        let mut entries = self.load_or_empty()?;
        entries.insert(
            format!("{}{}", MACHINE_PASSWORD_PREFIX, domain.to_ascii_uppercase()),
            STANDARD.encode(secret.expose()),
        );
        self.store(&entries)
    }

    async fn put_keytab(&self, name: &str, keytab: &[u8]) -> CallResult<()> {
        let mut entries = self.load_or_empty()?;
        entries.insert(format!("{}{}", KEYTAB_PREFIX, name), STANDARD.encode(keytab));
        self.store(&entries)
    }

    async fn backup(&self, netbiosname: &str) -> CallResult<()> {
        let entries = self.load()?;
        let data = serde_json::to_vec_pretty(&entries)
            .map_err(|e| CallError::new(Errno::EFAULT, e.to_string()))?;
        atomic_write(&self.backup_path(netbiosname), &data, 0o600)?;
        info!(netbiosname, "backed up secrets");
        Ok(())
    }

    async fn restore(&self, netbiosname: &str) -> CallResult<bool> {
        let backup = self.backup_path(netbiosname);
        let data = match std::fs::read(&backup) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(netbiosname, "no secrets backup available");
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        };
        let entries: Entries = serde_json::from_slice(&data).map_err(|e| {
            CallError::new(
                Errno::EFAULT,
                format!("{}: corrupt secrets backup: {}", backup.display(), e),
            )
        })?;
        self.store(&entries)?;
        info!(netbiosname, "restored secrets from backup");
        Ok(true)
    }

    async fn flush_cache(&self) {
        *self.cache.write() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, FileSecretsStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSecretsStore::new(dir.path().join("secrets.json"), dir.path().join("db"));
        (dir, store)
    }

    #[tokio::test]
    async fn test_missing_file_vs_missing_entry() {
        let (_dir, store) = store();
        let err = store.get_machine_secret("EXAMPLE").await.unwrap_err();
        assert_eq!(err.errno, Errno::ENOENT);

        store
            .set_machine_secret("OTHER", &SecretString::new("pw"))
            .await
            .unwrap();
        assert!(store.get_machine_secret("EXAMPLE").await.unwrap().is_none());
        let secret = store.get_machine_secret("other").await.unwrap().unwrap();
        assert_eq!(secret.expose(), "pw");
    }

    #[tokio::test]
    async fn test_backup_and_restore() {
        let (_dir, store) = store();
        store
            .set_machine_secret("EXAMPLE", &SecretString::new("machinepw"))
            .await
            .unwrap();
        store.backup("truenas").await.unwrap();

        std::fs::remove_file(store.path()).unwrap();
        store.flush_cache().await;
        assert_eq!(
            store.get_machine_secret("EXAMPLE").await.unwrap_err().errno,
            Errno::ENOENT
        );

        assert!(store.restore("truenas").await.unwrap());
        let secret = store.get_machine_secret("EXAMPLE").await.unwrap().unwrap();
        assert_eq!(secret.expose(), "machinepw");
    }

    #[tokio::test]
    async fn test_restore_without_backup() {
        let (_dir, store) = store();
        assert!(!store.restore("truenas").await.unwrap());
    }

    #[tokio::test]
    async fn test_cache_serves_until_flushed() {
        let (_dir, store) = store();
        store
            .set_machine_secret("EXAMPLE", &SecretString::new("pw"))
            .await
            .unwrap();
        std::fs::remove_file(store.path()).unwrap();
        assert!(store.get_machine_secret("EXAMPLE").await.unwrap().is_some());
        store.flush_cache().await;
        assert!(store.get_machine_secret("EXAMPLE").await.is_err());
    }
}
