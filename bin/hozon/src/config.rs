use std::{path::Path, time::Duration};

use hozon::DownloaderConfig;
use serde::{Deserialize, Serialize};

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub downloader: DownloaderConfig,
    pub http: HttpConfig,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Overrides the generated browser user agent.
    pub user_agent: Option<String>,
    pub timeout_secs: u64,
    /// Extra headers in `Name: value` form.
    pub headers: Vec<String>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            user_agent: None,
            timeout_secs: 60,
            headers: Vec::new(),
        }
    }
}

impl HttpConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Config {
    pub fn load(file: Option<&Path>) -> anyhow::Result<Self> {
        let Some(file) = file else {
            return Ok(Self::default());
        };
        let data = std::fs::read_to_string(file)?;
        let config = toml::from_str(&data)?;
        Ok(config)
    }
}
