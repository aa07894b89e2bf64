//! Durable record of which assets are on disk, surviving process restarts.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use serde::{Deserialize, Serialize};

use crate::{asset::DownloadState, error::HozonResult, util::write_atomic};

/// String key-value storage with restart durability.
pub trait KeyValueStore: Send + Sync + 'static {
    fn get(&self, key: &str) -> HozonResult<Option<String>>;

    fn set(&self, key: &str, value: &str) -> HozonResult<()>;

    fn remove(&self, key: &str) -> HozonResult<()>;

    fn keys(&self) -> HozonResult<Vec<String>>;
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    map: Mutex<BTreeMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> HozonResult<Option<String>> {
        Ok(self.map.lock().unwrap().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> HozonResult<()> {
        self.map
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> HozonResult<()> {
        self.map.lock().unwrap().remove(key);
        Ok(())
    }

    fn keys(&self) -> HozonResult<Vec<String>> {
        Ok(self.map.lock().unwrap().keys().cloned().collect())
    }
}

/// A JSON object on disk, rewritten atomically on every change.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    map: Mutex<BTreeMap<String, String>>,
}

impl JsonFileStore {
    pub fn open(path: impl Into<PathBuf>) -> HozonResult<Self> {
        let path = path.into();
        let map = match std::fs::read(&path) {
            Ok(data) => serde_json::from_slice(&data)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        Ok(Self {
            path,
            map: Mutex::new(map),
        })
    }

    fn save(&self, map: &BTreeMap<String, String>) -> HozonResult<()> {
        let data = serde_json::to_vec_pretty(map)?;
        write_atomic(&self.path, &data)
    }
}

impl KeyValueStore for JsonFileStore {
    fn get(&self, key: &str) -> HozonResult<Option<String>> {
        Ok(self.map.lock().unwrap().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> HozonResult<()> {
        let mut map = self.map.lock().unwrap();
        map.insert(key.to_string(), value.to_string());
        self.save(&map)
    }

    fn remove(&self, key: &str) -> HozonResult<()> {
        let mut map = self.map.lock().unwrap();
        if map.remove(key).is_some() {
            self.save(&map)?;
        }
        Ok(())
    }

    fn keys(&self) -> HozonResult<Vec<String>> {
        Ok(self.map.lock().unwrap().keys().cloned().collect())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    /// Local master manifest, relative to the base download directory.
    pub path: PathBuf,
    /// Set once every fetch of the asset finished.
    pub complete: bool,
}

impl IndexEntry {
    fn decode(value: &str) -> Self {
        // a bare path is a complete entry
        serde_json::from_str(value).unwrap_or_else(|_| IndexEntry {
            path: PathBuf::from(value),
            complete: true,
        })
    }
}

/// Asset name to local manifest mapping.
#[derive(Clone)]
pub struct PersistedIndex {
    store: Arc<dyn KeyValueStore>,
    base_dir: PathBuf,
}

impl PersistedIndex {
    pub fn new(store: Arc<dyn KeyValueStore>, base_dir: impl Into<PathBuf>) -> Self {
        Self {
            store,
            base_dir: base_dir.into(),
        }
    }

    pub fn entry(&self, name: &str) -> HozonResult<Option<IndexEntry>> {
        Ok(self.store.get(name)?.map(|v| IndexEntry::decode(&v)))
    }

    /// Local manifest path of a completely downloaded asset.
    pub fn get(&self, name: &str) -> HozonResult<Option<PathBuf>> {
        Ok(self
            .entry(name)?
            .filter(|entry| entry.complete)
            .map(|entry| entry.path))
    }

    /// Record an asset as downloaded. Dangling entries of other assets are dropped on the way.
    pub fn set(&self, name: &str, path: impl Into<PathBuf>) -> HozonResult<()> {
        self.write(
            name,
            IndexEntry {
                path: path.into(),
                complete: true,
            },
        )?;
        self.prune_dangling()?;
        Ok(())
    }

    /// Record the master manifest of an asset whose pipeline is still running.
    pub fn set_pending(&self, name: &str, path: impl Into<PathBuf>) -> HozonResult<()> {
        self.write(
            name,
            IndexEntry {
                path: path.into(),
                complete: false,
            },
        )
    }

    fn write(&self, name: &str, entry: IndexEntry) -> HozonResult<()> {
        let value = serde_json::to_string(&entry)?;
        self.store.set(name, &value)
    }

    pub fn remove(&self, name: &str) -> HozonResult<()> {
        self.store.remove(name)
    }

    /// State as far as disk is concerned; `active` reports an in-flight pipeline.
    pub fn download_state(&self, name: &str, active: bool) -> HozonResult<DownloadState> {
        if active {
            return Ok(DownloadState::Downloading);
        }

        Ok(match self.get(name)? {
            Some(path) if self.base_dir.join(&path).is_file() => DownloadState::Downloaded,
            _ => DownloadState::NotDownloaded,
        })
    }

    /// Names of every complete entry, dangling ones included.
    pub fn names(&self) -> HozonResult<Vec<String>> {
        let mut names = Vec::new();
        for name in self.store.keys()? {
            if self.get(&name)?.is_some() {
                names.push(name);
            }
        }
        Ok(names)
    }

    /// Name of an asset, pending or complete, whose manifest lives below `dir`.
    pub fn owner_of(&self, dir: &Path) -> HozonResult<Option<String>> {
        for name in self.store.keys()? {
            if let Some(entry) = self.entry(&name)? {
                if entry.path.starts_with(dir) {
                    return Ok(Some(name));
                }
            }
        }
        Ok(None)
    }

    /// Entries whose pipeline never finished.
    pub fn pending(&self) -> HozonResult<Vec<(String, IndexEntry)>> {
        let mut pending = Vec::new();
        for name in self.store.keys()? {
            if let Some(entry) = self.entry(&name)? {
                if !entry.complete {
                    pending.push((name, entry));
                }
            }
        }
        Ok(pending)
    }

    /// Drop complete entries whose manifest is gone from disk. Returns the removed names.
    pub fn prune_dangling(&self) -> HozonResult<Vec<String>> {
        let mut removed = Vec::new();
        for name in self.store.keys()? {
            let Some(entry) = self.entry(&name)? else {
                continue;
            };
            if entry.complete && !self.base_dir.join(&entry.path).is_file() {
                log::info!("Dropping dangling index entry {name}");
                self.store.remove(&name)?;
                removed.push(name);
            }
        }
        Ok(removed)
    }
}
