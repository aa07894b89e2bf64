use std::{collections::HashMap, fmt, path::PathBuf};

use url::Url;

use crate::{asset::Asset, transport::MediaSelection};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FetchId(u64);

impl FetchId {
    #[cfg(test)]
    pub(crate) fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for FetchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fetch#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AssetId(u64);

/// Pipeline phase a fetch belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Master,
    VideoManifest,
    SubtitlesManifest,
    Segment,
    SubtitleSegment,
}

/// One in-flight network retrieval.
#[derive(Debug, Clone)]
pub struct FetchHandle {
    pub id: FetchId,
    pub url: Url,
    /// Owning asset. Not an ownership relation: the asset outlives none of its fetches.
    pub asset: AssetId,
    pub stage: Stage,
    /// Final location, relative to the base download directory.
    pub destination: PathBuf,
    /// Alternate renditions reported by the transfer engine for this fetch.
    pub media_selections: Vec<MediaSelection>,
}

/// Arena of active assets and their outstanding fetches.
///
/// Owned by the coordination task alone, so it needs no locking.
#[derive(Debug, Default)]
pub struct TaskRegistry {
    next_fetch: u64,
    next_asset: u64,
    assets: HashMap<AssetId, Asset>,
    handles: HashMap<FetchId, FetchHandle>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking an asset whose pipeline is about to begin.
    pub fn activate(&mut self, asset: Asset) -> AssetId {
        self.next_asset += 1;
        let id = AssetId(self.next_asset);
        self.assets.insert(id, asset);
        id
    }

    /// Stop tracking an asset. Its remaining handles, if any, are dropped too.
    pub fn deactivate(&mut self, id: AssetId) -> Option<Asset> {
        self.handles.retain(|_, h| h.asset != id);
        self.assets.remove(&id)
    }

    pub fn asset(&self, id: AssetId) -> Option<&Asset> {
        self.assets.get(&id)
    }

    pub fn register(
        &mut self,
        asset: AssetId,
        stage: Stage,
        url: Url,
        destination: PathBuf,
    ) -> FetchId {
        self.next_fetch += 1;
        let id = FetchId(self.next_fetch);
        self.handles.insert(
            id,
            FetchHandle {
                id,
                url,
                asset,
                stage,
                destination,
                media_selections: Vec::new(),
            },
        );
        id
    }

    pub fn handle(&self, id: FetchId) -> Option<&FetchHandle> {
        self.handles.get(&id)
    }

    /// The asset a fetch belongs to.
    pub fn resolve(&self, id: FetchId) -> Option<&Asset> {
        self.handles
            .get(&id)
            .and_then(|handle| self.assets.get(&handle.asset))
    }

    /// Remove a fetch once its completion is delivered.
    pub fn unregister(&mut self, id: FetchId) -> Option<FetchHandle> {
        self.handles.remove(&id)
    }

    pub fn find_active_by_name(&self, name: &str) -> Option<AssetId> {
        self.assets
            .iter()
            .find(|(_, asset)| asset.name == name)
            .map(|(id, _)| *id)
    }

    pub fn find_active_by_program(&self, program_id: &str) -> Option<&Asset> {
        self.assets
            .values()
            .find(|asset| asset.program_id == program_id)
    }

    pub fn active_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.assets.values().map(|a| a.name.clone()).collect();
        names.sort();
        names
    }

    pub fn active_assets(&self) -> Vec<AssetId> {
        self.assets.keys().copied().collect()
    }

    /// Number of fetches still outstanding for an asset.
    pub fn outstanding(&self, asset: AssetId) -> usize {
        self.handles.values().filter(|h| h.asset == asset).count()
    }

    pub fn handles_of(&self, asset: AssetId) -> Vec<FetchId> {
        let mut ids: Vec<_> = self
            .handles
            .values()
            .filter(|h| h.asset == asset)
            .map(|h| h.id)
            .collect();
        ids.sort();
        ids
    }

    /// Keep a media selection reported for a fetch. Returns `false` for unknown fetches.
    pub fn retain_selection(&mut self, id: FetchId, selection: MediaSelection) -> bool {
        match self.handles.get_mut(&id) {
            Some(handle) => {
                if !handle.media_selections.contains(&selection) {
                    handle.media_selections.push(selection);
                }
                true
            }
            None => false,
        }
    }

    pub fn selections_of(&self, asset: AssetId) -> Vec<MediaSelection> {
        let mut selections = Vec::new();
        for id in self.handles_of(asset) {
            for selection in &self.handles[&id].media_selections {
                if !selections.contains(selection) {
                    selections.push(selection.clone());
                }
            }
        }
        selections
    }
}
