//! Key ring persistence.
//!
//! Grace keys are stored as a JSON array of `{ e_s_b64u, d_s_b64u }`, oldest
//! first. The current pair installed by the last rotation is stored next to
//! it. Both are read once at startup and rewritten after each rotation.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use log::debug;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::errors::{KeyWrapError, KeyWrapResult};

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct PersistedGraceKey {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub e_s_b64u: Option<String>,
    pub d_s_b64u: String,
}

/// Current exponent pair written after a rotation.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct PersistedCurrentKey {
    pub e_s_b64u: String,
    pub d_s_b64u: String,
}

/// Rotation writes the grace set first and the current pair second, so a
/// crash in between restarts on the old current key.
pub trait GraceKeyStore {
    fn load(&self) -> KeyWrapResult<Vec<PersistedGraceKey>>;
    fn save(&self, entries: &[PersistedGraceKey]) -> KeyWrapResult<()>;
    /// `None` until the first rotation.
    fn load_current(&self) -> KeyWrapResult<Option<PersistedCurrentKey>>;
    fn save_current(&self, current: &PersistedCurrentKey) -> KeyWrapResult<()>;
}

/// JSON file store. A missing file reads as an empty grace set; the current
/// pair lives in `<path>.current`.
pub struct FileGraceKeyStore {
    path: PathBuf,
}

impl FileGraceKeyStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn current_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".current");
        self.path.with_file_name(name)
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> KeyWrapResult<Option<T>> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!("No key file at {}", path.display());
            return Ok(None);
        }
        Err(e) => {
            return Err(KeyWrapError::Persistence(format!(
                "read {}: {}",
                path.display(),
                e
            )))
        }
    };
    if raw.trim().is_empty() {
        return Ok(None);
    }
    serde_json::from_str(&raw)
        .map(Some)
        .map_err(|e| KeyWrapError::Persistence(format!("parse {}: {}", path.display(), e)))
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> KeyWrapResult<()> {
    let json =
        serde_json::to_string_pretty(value).map_err(|e| KeyWrapError::Persistence(e.to_string()))?;
    // Write then rename so a crash never leaves a truncated file
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, json)
        .and_then(|_| std::fs::rename(&tmp, path))
        .map_err(|e| KeyWrapError::Persistence(format!("write {}: {}", path.display(), e)))
}

impl GraceKeyStore for FileGraceKeyStore {
    fn load(&self) -> KeyWrapResult<Vec<PersistedGraceKey>> {
        Ok(read_json(&self.path)?.unwrap_or_default())
    }

    fn save(&self, entries: &[PersistedGraceKey]) -> KeyWrapResult<()> {
        write_json(&self.path, entries)
    }

    fn load_current(&self) -> KeyWrapResult<Option<PersistedCurrentKey>> {
        read_json(&self.current_path())
    }

    fn save_current(&self, current: &PersistedCurrentKey) -> KeyWrapResult<()> {
        write_json(&self.current_path(), current)
    }
}

#[derive(Default)]
pub struct MemoryGraceKeyStore {
    entries: Mutex<Vec<PersistedGraceKey>>,
    current: Mutex<Option<PersistedCurrentKey>>,
}

impl MemoryGraceKeyStore {
    pub fn new(entries: Vec<PersistedGraceKey>) -> Self {
        Self {
            entries: Mutex::new(entries),
            current: Mutex::default(),
        }
    }

    pub fn entries(&self) -> Vec<PersistedGraceKey> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn current(&self) -> Option<PersistedCurrentKey> {
        self.current
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl GraceKeyStore for MemoryGraceKeyStore {
    fn load(&self) -> KeyWrapResult<Vec<PersistedGraceKey>> {
        Ok(self.entries())
    }

    fn save(&self, entries: &[PersistedGraceKey]) -> KeyWrapResult<()> {
        *self.entries.lock().unwrap_or_else(|e| e.into_inner()) = entries.to_vec();
        Ok(())
    }

    fn load_current(&self) -> KeyWrapResult<Option<PersistedCurrentKey>> {
        Ok(self.current())
    }

    fn save_current(&self, current: &PersistedCurrentKey) -> KeyWrapResult<()> {
        *self.current.lock().unwrap_or_else(|e| e.into_inner()) = Some(current.clone());
        Ok(())
    }
}

impl<T: GraceKeyStore + ?Sized> GraceKeyStore for std::sync::Arc<T> {
    fn load(&self) -> KeyWrapResult<Vec<PersistedGraceKey>> {
        (**self).load()
    }

    fn save(&self, entries: &[PersistedGraceKey]) -> KeyWrapResult<()> {
        (**self).save(entries)
    }

    fn load_current(&self) -> KeyWrapResult<Option<PersistedCurrentKey>> {
        (**self).load_current()
    }

    fn save_current(&self, current: &PersistedCurrentKey) -> KeyWrapResult<()> {
        (**self).save_current(current)
    }
}
