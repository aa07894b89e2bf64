use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloaderConfig {
    /// Root of every downloaded asset.
    pub base_dir: PathBuf,
    /// Where transfers are buffered. Defaults to `<base_dir>/.tmp`.
    pub temp_dir: Option<PathBuf>,
    /// Persisted index file. Defaults to `<base_dir>/index.json`.
    pub index_path: Option<PathBuf>,
    /// File name of the local master manifest inside the program directory.
    pub master_manifest_name: String,
    pub event_capacity: usize,
}

impl DownloaderConfig {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            ..Default::default()
        }
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.temp_dir
            .clone()
            .unwrap_or_else(|| self.base_dir.join(".tmp"))
    }

    pub fn index_path(&self) -> PathBuf {
        self.index_path
            .clone()
            .unwrap_or_else(|| self.base_dir.join("index.json"))
    }
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("downloads"),
            temp_dir: None,
            index_path: None,
            master_manifest_name: "master.m3u8".to_string(),
            event_capacity: 256,
        }
    }
}
