use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use blake3::Hasher as Blake3;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::Preferences;
use crate::errors::{NamespaceError, NamespaceResult};

const PREFERENCES_VERSION: u16 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PreferencesEnvelope {
    version: u16,
    checksum: [u8; 32],
    payload: Map<String, Value>,
    last_updated: DateTime<Utc>,
}

/// Preferences persisted as a single JSON document with integrity checks.
///
/// Every write rewrites the whole document through a `.new` sibling and an
/// atomic rename, so a crash never leaves a half-written file behind.
#[derive(Debug)]
pub struct FilePreferences {
    path: PathBuf,
    entries: Mutex<Map<String, Value>>,
}

impl FilePreferences {
    /// Opens (or starts) the document at `path`, rejecting tampered or foreign files.
    pub fn open(path: impl AsRef<Path>) -> NamespaceResult<Self> {
        let path = path.as_ref().to_path_buf();
        let entries = if path.exists() {
            load(&path)?
        } else {
            Map::new()
        };
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, entries: &Map<String, Value>) {
        if let Err(error) = save(&self.path, entries) {
            log::error!(
                "Failed to persist preferences to {}: {}",
                self.path.display(),
                error
            );
        }
    }
}

impl Preferences for FilePreferences {
    fn object(&self, key: &str) -> Option<Value> {
        self.entries.lock().get(key).cloned()
    }

    fn set(&self, key: &str, value: Option<Value>) {
        let mut entries = self.entries.lock();
        match value {
            Some(value) => {
                entries.insert(key.to_string(), value);
            }
            None => {
                entries.remove(key);
            }
        }
        self.persist(&entries);
    }

    fn transaction(&self, key: &str, update: &mut dyn FnMut(&mut Option<Value>)) {
        let mut entries = self.entries.lock();
        let mut object = entries.get(key).cloned();
        update(&mut object);
        match object {
            Some(value) => {
                entries.insert(key.to_string(), value);
            }
            None => {
                entries.remove(key);
            }
        }
        self.persist(&entries);
    }
}

fn load(path: &Path) -> NamespaceResult<Map<String, Value>> {
    let bytes = fs::read(path)?;
    let envelope: PreferencesEnvelope = serde_json::from_slice(&bytes)?;
    if envelope.version != PREFERENCES_VERSION {
        return Err(NamespaceError::Storage(format!(
            "Unsupported preferences version {}",
            envelope.version
        )));
    }

    if checksum(&envelope.payload)? != envelope.checksum {
        return Err(NamespaceError::Storage(
            "Preferences integrity verification failed".to_string(),
        ));
    }

    Ok(envelope.payload)
}

fn save(path: &Path, entries: &Map<String, Value>) -> NamespaceResult<()> {
    let envelope = PreferencesEnvelope {
        version: PREFERENCES_VERSION,
        checksum: checksum(entries)?,
        payload: entries.clone(),
        last_updated: Utc::now(),
    };

    let serialized = serde_json::to_vec_pretty(&envelope)?;
    let tmp_path = path.with_extension("new");
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    {
        let mut file = File::create(&tmp_path)?;
        file.write_all(&serialized)?;
        file.sync_all()?;
    }
    fs::rename(tmp_path, path)?;
    Ok(())
}

fn checksum(payload: &Map<String, Value>) -> NamespaceResult<[u8; 32]> {
    let mut hasher = Blake3::new();
    hasher.update(&serde_json::to_vec(payload)?);
    Ok(*hasher.finalize().as_bytes())
}
