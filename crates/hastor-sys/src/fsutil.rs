//! Small file-system helpers shared by the state stores.

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{ErrorKind, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

/// Replace `path` with `data` by writing a sibling temp file and renaming
/// it over the target, so readers never observe a partial file.
pub fn atomic_write(path: &Path, data: &[u8], mode: u32) -> std::io::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = parent.join(format!(".{}.tmp.{}", file_name, std::process::id()));
    {
        let mut f = std::fs::File::create(&tmp)?;
        f.set_permissions(std::fs::Permissions::from_mode(mode))?;
        f.write_all(data)?;
        f.sync_all()?;
    }
    std::fs::rename(&tmp, path)
}

/// A singleton persisted as a JSON document. Readers take snapshots;
/// [`JsonState::replace`] writes the file first and only then swaps the
/// in-memory value, so the two never disagree after a failed write.
#[derive(Debug)]
pub struct JsonState<T> {
    path: PathBuf,
    value: RwLock<T>,
}

impl<T> JsonState<T>
where
    T: Clone + Default + Serialize + DeserializeOwned,
{
    /// Load `path`, or start from `T::default()` if it does not exist.
    pub fn load(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        let value = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| std::io::Error::new(ErrorKind::InvalidData, format!("{}: {e}", path.display())))?,
            Err(e) if e.kind() == ErrorKind::NotFound => T::default(),
            Err(e) => return Err(e),
        };
        Ok(Self {
            path,
            value: RwLock::new(value),
        })
    }

    /// In-memory only, for tests and tools.
    pub fn ephemeral(value: T) -> Self {
        Self {
            path: PathBuf::new(),
            value: RwLock::new(value),
        }
    }

    /// Backing file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current value.
    pub fn snapshot(&self) -> T {
        self.value.read().clone()
    }

    /// Persist `value` (mode 0600) and make it current.
    pub fn replace(&self, value: T) -> std::io::Result<()> {
        if !self.path.as_os_str().is_empty() {
            let data = serde_json::to_vec_pretty(&value)
                .map_err(|e| std::io::Error::new(ErrorKind::InvalidData, e))?;
            atomic_write(&self.path, &data, 0o600)?;
        }
        *self.value.write() = value;
        Ok(())
    }
}
