use std::fmt;

use serde::{Deserialize, Serialize};
use url::Url;

/// A downloadable asset, identified by its caller-chosen `name`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Asset {
    pub name: String,
    pub content_id: String,
    pub program_id: String,
    pub root_manifest_url: Url,

    /// Declares the asset as DRM protected before any manifest is seen.
    ///
    /// A content key line inside the video manifest marks the asset
    /// protected as well.
    #[serde(default)]
    pub protected: bool,
}

impl Asset {
    pub fn new(
        name: impl Into<String>,
        content_id: impl Into<String>,
        program_id: impl Into<String>,
        root_manifest_url: Url,
    ) -> Self {
        Self {
            name: name.into(),
            content_id: content_id.into(),
            program_id: program_id.into(),
            root_manifest_url,
            protected: false,
        }
    }

    pub fn protected(mut self, protected: bool) -> Self {
        self.protected = protected;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadState {
    NotDownloaded,
    Downloading,
    Downloaded,
}

impl fmt::Display for DownloadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DownloadState::NotDownloaded => "not downloaded",
            DownloadState::Downloading => "downloading",
            DownloadState::Downloaded => "downloaded",
        };
        f.write_str(s)
    }
}
