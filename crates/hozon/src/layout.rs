//! Where each fetched resource lands, relative to the base download directory.
//!
//! ```text
//! <base>/<program_id>/<master manifest name>
//! <base>/<program_id>/<host>/<path>          (everything else)
//! ```

use std::path::PathBuf;

use url::{Position, Url};

use crate::error::{HozonError, HozonResult};

pub fn asset_dir(program_id: &str) -> PathBuf {
    PathBuf::from(program_id)
}

pub fn master_path(program_id: &str, manifest_name: &str) -> PathBuf {
    asset_dir(program_id).join(manifest_name)
}

/// Mirror the remote location of `url` below the asset directory.
///
/// The mirrored part is exactly what remains of the url once its scheme
/// is stripped (query and fragment excluded), so rewritten manifests keep
/// pointing at the right files.
pub fn mirror_path(program_id: &str, url: &Url) -> HozonResult<PathBuf> {
    if url.host_str().is_none() {
        return Err(HozonError::InvalidUrl(format!("{url} has no host")));
    }

    let remote = &url[Position::BeforeHost..Position::AfterPath];
    let mut path = asset_dir(program_id);
    for segment in remote.split('/').filter(|s| !s.is_empty()) {
        path.push(segment);
    }
    if remote.ends_with('/') {
        path.push("index");
    }
    Ok(path)
}
