//! Offline HLS downloads.
//!
//! Starting from a master manifest, [`Downloader`] discovers and fetches the
//! first video rendition, its optional subtitles and every segment of both,
//! rewriting the manifests so they address the local copies:
//!
//! ```text
//!  master ──► video manifest ──► segment, segment, ...
//!         └─► subtitles manifest ──► subtitle segment, ...
//! ```
//!
//! The completion state of every asset is kept in a [`PersistedIndex`], so
//! a restarted process still knows what is on disk.

pub mod asset;
pub mod config;
pub mod downloader;
pub mod drm;
pub mod error;
pub mod events;
pub mod index;
pub mod layout;
pub mod manifest;
pub mod registry;
pub mod rewrite;
pub mod transport;
mod util;

pub use asset::{Asset, DownloadState};
pub use config::DownloaderConfig;
pub use downloader::{Dispatch, Downloader, DownloaderBuilder};
pub use error::{HozonError, HozonResult};
pub use events::{Event, EventBus, Progress};
pub use index::PersistedIndex;
