//! Line-oriented extraction of the URIs that drive the download pipeline.
//!
//! Only the handful of patterns needed to discover child resources are
//! recognized; this is not a general m3u8 validator.

use once_cell::sync::Lazy;
use regex::Regex;
use url::Url;

use crate::error::{HozonError, HozonResult};

static MASTER_VIDEO: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^([^#\s][^\r\n]*\.m3u8(?:\?[^\s]*)?)\r?$").unwrap());
static MASTER_SUBTITLES: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?m)^#EXT-X-MEDIA:TYPE=SUBTITLES[^\r\n]*?URI="([^"\r\n]+)""#).unwrap()
});
static VIDEO_SEGMENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^([^#\s][^\r\n]*\.ts(?:\?[^\s]*)?)\r?$").unwrap());
static SUBTITLE_SEGMENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^([^#\s][^\r\n]*\.vtt(?:\?[^\s]*)?)\r?$").unwrap());

static KEY_LINE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^#EXT-X-KEY:([^\r\n]*)\r?$").unwrap());
static KEY_METHOD: Lazy<Regex> = Lazy::new(|| Regex::new(r"METHOD=([A-Za-z0-9-]+)").unwrap());
static KEY_URI: Lazy<Regex> = Lazy::new(|| Regex::new(r#"URI="([^"]+)""#).unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Grammar {
    /// First variant playlist referenced by a master manifest.
    MasterVideo,
    /// Subtitle rendition declared by a master manifest, if any.
    MasterSubtitles,
    /// Every `.ts` segment of a video manifest.
    VideoSegments,
    /// Every `.vtt` segment of a subtitles manifest.
    SubtitleSegments,
}

impl Grammar {
    /// Whether an empty extraction aborts the pipeline branch.
    pub fn is_required(&self) -> bool {
        matches!(self, Grammar::MasterVideo | Grammar::VideoSegments)
    }

    fn describe(&self) -> &'static str {
        match self {
            Grammar::MasterVideo => "video playlist",
            Grammar::MasterSubtitles => "subtitles playlist",
            Grammar::VideoSegments => "video segment",
            Grammar::SubtitleSegments => "subtitle segment",
        }
    }
}

/// Extract the raw (possibly relative) URIs matched by `grammar`, in manifest order.
pub fn extract(text: &str, grammar: Grammar) -> Vec<String> {
    let (regex, first_only) = match grammar {
        Grammar::MasterVideo => (&*MASTER_VIDEO, true),
        Grammar::MasterSubtitles => (&*MASTER_SUBTITLES, true),
        Grammar::VideoSegments => (&*VIDEO_SEGMENT, false),
        Grammar::SubtitleSegments => (&*SUBTITLE_SEGMENT, false),
    };

    let matches = regex
        .captures_iter(text)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string());
    if first_only {
        matches.take(1).collect()
    } else {
        matches.collect()
    }
}

/// Same as [`extract`], but fails when a required grammar matches nothing.
pub fn extract_required(text: &str, grammar: Grammar) -> HozonResult<Vec<String>> {
    let uris = extract(text, grammar);
    if uris.is_empty() && grammar.is_required() {
        return Err(HozonError::ManifestParse(format!(
            "no {} found in manifest",
            grammar.describe()
        )));
    }
    Ok(uris)
}

/// Resolve an extracted URI against the url the manifest was fetched from.
pub fn resolve(base: &Url, uri: &str) -> HozonResult<Url> {
    base.join(uri)
        .map_err(|e| HozonError::InvalidUrl(format!("{uri} (relative to {base}): {e}")))
}

/// Content key URI of the first `#EXT-X-KEY` line whose method is not `NONE`.
///
/// Returns `Some` for protected media playlists. The URI is kept verbatim,
/// since key identifiers such as `skd://...` are not fetchable urls.
pub fn key_uri(text: &str) -> Option<String> {
    KEY_LINE
        .captures_iter(text)
        .filter_map(|c| c.get(1))
        .map(|attrs| attrs.as_str())
        .find(|attrs| {
            KEY_METHOD
                .captures(attrs)
                .and_then(|c| c.get(1))
                .is_some_and(|m| m.as_str() != "NONE")
        })
        .map(|attrs| {
            KEY_URI
                .captures(attrs)
                .and_then(|c| c.get(1))
                .map(|m| m.as_str().to_string())
                .unwrap_or_default()
        })
}
