//! The coordination task.
//!
//! Every completion, progress report and caller command is handled here,
//! one message at a time, so the registry and the per-asset pipelines are
//! never touched concurrently. Transfers run inside the transport engine;
//! manifest processing runs on the blocking pool and reports back through
//! its own channel.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
};

use tokio::sync::{mpsc, oneshot};
use url::Url;

use super::Dispatch;
use crate::{
    asset::{Asset, DownloadState},
    drm::{DrmBinder, DrmScope, KeyProvider},
    error::{HozonError, HozonResult},
    events::{Event, EventBus},
    index::PersistedIndex,
    layout,
    manifest::{self, Grammar},
    registry::{AssetId, FetchHandle, FetchId, Stage, TaskRegistry},
    rewrite,
    transport::{
        Fetch, FetchReporter, MediaSelection, Transport, TransportError, TransportEvent,
        TransportSender,
    },
    util,
};

pub(crate) enum Command {
    Download(Asset, oneshot::Sender<HozonResult<Dispatch>>),
    Cancel(String, oneshot::Sender<bool>),
    State(String, oneshot::Sender<HozonResult<DownloadState>>),
    Delete(String, oneshot::Sender<HozonResult<()>>),
    MediaSelections(String, oneshot::Sender<Vec<MediaSelection>>),
    Shutdown(oneshot::Sender<()>),
}

/// Child resources found in a processed manifest.
#[derive(Debug, Default)]
struct Discovered {
    children: Vec<(Stage, Url)>,
    key_uri: Option<String>,
}

struct ManifestProcessed {
    asset: AssetId,
    stage: Stage,
    url: Url,
    result: HozonResult<Discovered>,
}

#[derive(Default)]
struct Pipeline {
    /// Manifests fetched but not yet processed.
    pending_manifests: usize,
    segments_done: usize,
    /// Set on the first failure; the pipeline then only drains.
    abandoned: bool,
    cancelled: bool,
    key_provider: Option<Arc<dyn KeyProvider>>,
}

pub(crate) struct Sequencer {
    base_dir: PathBuf,
    master_manifest_name: String,

    registry: TaskRegistry,
    pipelines: HashMap<AssetId, Pipeline>,

    index: PersistedIndex,
    events: EventBus,
    transport: Arc<dyn Transport>,
    binder: Option<Arc<dyn DrmBinder>>,

    transport_tx: TransportSender,
    manifest_tx: mpsc::UnboundedSender<ManifestProcessed>,
}

pub(crate) struct SequencerChannels {
    transfers: mpsc::UnboundedReceiver<(FetchId, TransportEvent)>,
    manifests: mpsc::UnboundedReceiver<ManifestProcessed>,
}

impl Sequencer {
    pub(crate) fn new(
        base_dir: PathBuf,
        master_manifest_name: String,
        index: PersistedIndex,
        events: EventBus,
        transport: Arc<dyn Transport>,
        binder: Option<Arc<dyn DrmBinder>>,
    ) -> (Self, SequencerChannels) {
        let (transport_tx, transfers) = mpsc::unbounded_channel();
        let (manifest_tx, manifests) = mpsc::unbounded_channel();

        let sequencer = Self {
            base_dir,
            master_manifest_name,
            registry: TaskRegistry::new(),
            pipelines: HashMap::new(),
            index,
            events,
            transport,
            binder,
            transport_tx,
            manifest_tx,
        };
        (
            sequencer,
            SequencerChannels {
                transfers,
                manifests,
            },
        )
    }

    pub(crate) async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        channels: SequencerChannels,
    ) {
        let SequencerChannels {
            mut transfers,
            mut manifests,
        } = channels;

        self.restore().await;

        loop {
            tokio::select! {
                Some((id, event)) = transfers.recv() => self.on_transport_event(id, event).await,
                Some(processed) = manifests.recv() => self.on_manifest(processed).await,
                command = commands.recv() => {
                    let Some(command) = command else {
                        self.shutdown();
                        break;
                    };
                    if !self.on_command(command).await {
                        break;
                    }
                }
            }
        }
    }

    /// Reconcile the persisted index with the disk after a restart.
    async fn restore(&mut self) {
        match self.index.pending() {
            Ok(pending) => {
                for (name, entry) in pending {
                    log::info!("Discarding unfinished download of {name}");
                    if let Some(dir) = entry.path.parent().filter(|p| !p.as_os_str().is_empty())
                    {
                        self.remove_files(&name, dir).await;
                    }
                    if let Err(e) = self.index.remove(&name) {
                        log::warn!("Failed to remove index entry of {name}: {e}");
                    }
                }
            }
            Err(e) => log::error!("Failed to read persisted index: {e}"),
        }

        if let Err(e) = self.index.prune_dangling() {
            log::error!("Failed to prune persisted index: {e}");
        }
        self.events.publish(Event::RestoreComplete);
    }

    fn shutdown(&mut self) {
        let active = self.registry.active_names();
        if !active.is_empty() {
            log::info!("Stopping with active downloads: {}", active.join(", "));
        }
        for asset in self.registry.active_assets() {
            for id in self.registry.handles_of(asset) {
                self.transport.cancel(id);
            }
        }
        log::info!("Downloader stopped.");
    }

    /// Serve one caller command. Returns `false` once the service should stop.
    async fn on_command(&mut self, command: Command) -> bool {
        match command {
            Command::Download(asset, reply) => {
                let _ = reply.send(self.download(asset));
            }
            Command::Cancel(name, reply) => {
                let _ = reply.send(self.cancel(&name).await);
            }
            Command::State(name, reply) => {
                let active = self.registry.find_active_by_name(&name).is_some();
                let _ = reply.send(self.index.download_state(&name, active));
            }
            Command::Delete(name, reply) => {
                let _ = reply.send(self.delete(&name).await);
            }
            Command::MediaSelections(name, reply) => {
                let selections = self
                    .registry
                    .find_active_by_name(&name)
                    .map(|id| self.registry.selections_of(id))
                    .unwrap_or_default();
                let _ = reply.send(selections);
            }
            Command::Shutdown(done) => {
                self.shutdown();
                let _ = done.send(());
                return false;
            }
        }
        true
    }

    fn download(&mut self, asset: Asset) -> HozonResult<Dispatch> {
        validate(&asset)?;

        if self.registry.find_active_by_name(&asset.name).is_some() {
            log::warn!("{} is already downloading, ignoring request.", asset.name);
            return Ok(Dispatch::AlreadyActive);
        }
        if self.index.download_state(&asset.name, false)? == DownloadState::Downloaded {
            log::info!("{} is already downloaded.", asset.name);
            return Ok(Dispatch::AlreadyDownloaded);
        }
        if let Some(owner) = self.program_owner(&asset.program_id)? {
            if owner != asset.name {
                return Err(HozonError::ProgramInUse(asset.program_id, owner));
            }
        }

        log::info!("Start downloading {}.", asset.name);
        let url = asset.root_manifest_url.clone();
        let destination = layout::master_path(&asset.program_id, &self.master_manifest_name);
        let name = asset.name.clone();

        let id = self.registry.activate(asset);
        self.pipelines.insert(id, Pipeline::default());
        self.dispatch(id, Stage::Master, url, destination);
        self.events.state(&name, DownloadState::Downloading);

        Ok(Dispatch::Started)
    }

    /// Asset whose files live in the directory of `program_id`, active or indexed.
    fn program_owner(&self, program_id: &str) -> HozonResult<Option<String>> {
        if let Some(asset) = self.registry.find_active_by_program(program_id) {
            return Ok(Some(asset.name.clone()));
        }
        self.index.owner_of(&layout::asset_dir(program_id))
    }

    async fn cancel(&mut self, name: &str) -> bool {
        let Some(id) = self.registry.find_active_by_name(name) else {
            return false;
        };

        log::info!("Cancelling download of {name}.");
        if let Some(pipeline) = self.pipelines.get_mut(&id) {
            pipeline.cancelled = true;
        }
        self.abandon(id);
        self.settle(id).await;
        true
    }

    async fn delete(&mut self, name: &str) -> HozonResult<()> {
        if self.registry.find_active_by_name(name).is_some() {
            return Err(HozonError::AssetBusy(name.to_string()));
        }
        let entry = self
            .index
            .entry(name)?
            .ok_or_else(|| HozonError::UnknownAsset(name.to_string()))?;

        if let Some(dir) = entry.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            util::remove_path(&self.base_dir.join(dir)).await?;
        }
        self.index.remove(name)?;
        log::info!("Deleted {name}.");
        self.events.state(name, DownloadState::NotDownloaded);
        Ok(())
    }

    fn dispatch(&mut self, asset: AssetId, stage: Stage, url: Url, destination: PathBuf) {
        let key_provider = match stage {
            Stage::Segment => self
                .pipelines
                .get(&asset)
                .and_then(|p| p.key_provider.clone()),
            _ => None,
        };

        let id = self
            .registry
            .register(asset, stage, url.clone(), destination);
        log::debug!("Dispatching {id} ({stage:?}): {url}");

        let reporter = FetchReporter::new(id, self.transport_tx.clone());
        self.transport.start(
            Fetch {
                id,
                url,
                stage,
                key_provider,
            },
            reporter,
        );
    }

    async fn on_transport_event(&mut self, id: FetchId, event: TransportEvent) {
        match event {
            TransportEvent::Progress(progress) => {
                let Some(asset) = self.registry.resolve(id) else {
                    return;
                };
                if let Some(percent) = progress.fraction() {
                    self.events.progress(&asset.name, percent);
                }
            }
            TransportEvent::MediaSelection(selection) => {
                log::debug!("{id} resolved media selection {selection:?}");
                self.registry.retain_selection(id, selection);
            }
            TransportEvent::Finished(result) => self.on_finished(id, result).await,
        }
    }

    async fn on_finished(&mut self, id: FetchId, result: Result<PathBuf, TransportError>) {
        let Some(handle) = self.registry.unregister(id) else {
            log::warn!("Completion of unknown {id}, ignoring.");
            if let Ok(temp) = result {
                discard(&temp).await;
            }
            return;
        };
        let asset = handle.asset;
        let Some(name) = self.registry.asset(asset).map(|a| a.name.clone()) else {
            return;
        };
        let (abandoned, cancelled) = self
            .pipelines
            .get(&asset)
            .map(|p| (p.abandoned, p.cancelled))
            .unwrap_or((true, false));

        match result {
            Err(e) if e.is_cancelled() || cancelled => {
                log::info!("{:?} fetch of {name} stopped: {e}", handle.stage);
                self.abandon(asset);
            }
            Err(e) => {
                if abandoned {
                    log::info!("{:?} fetch of {name} stopped: {e}", handle.stage);
                } else {
                    log::error!("Failed to fetch {} for {name}: {e}", handle.url);
                }
                self.abandon(asset);
            }
            Ok(temp) if abandoned => discard(&temp).await,
            Ok(temp) => self.on_fetched(&name, handle, &temp).await,
        }

        self.settle(asset).await;
    }

    async fn on_fetched(&mut self, name: &str, handle: FetchHandle, temp: &Path) {
        let destination = self.base_dir.join(&handle.destination);
        if let Err(e) = util::move_into_place(temp, &destination).await {
            // surfaces as a read failure for manifests
            log::error!(
                "Failed to move {} to {}: {e}",
                temp.display(),
                destination.display()
            );
        }

        match handle.stage {
            Stage::Master => {
                if let Err(e) = self.index.set_pending(name, &handle.destination) {
                    log::error!("Failed to record {name} in the persisted index: {e}");
                }
                self.process_manifest(handle.asset, handle.stage, handle.url, destination);
            }
            Stage::VideoManifest | Stage::SubtitlesManifest => {
                self.process_manifest(handle.asset, handle.stage, handle.url, destination);
            }
            Stage::Segment | Stage::SubtitleSegment => {
                if let Some(pipeline) = self.pipelines.get_mut(&handle.asset) {
                    pipeline.segments_done += 1;
                }
            }
        }
    }

    /// Rewrite and parse a fetched manifest off the coordination task.
    fn process_manifest(&mut self, asset: AssetId, stage: Stage, url: Url, path: PathBuf) {
        if let Some(pipeline) = self.pipelines.get_mut(&asset) {
            pipeline.pending_manifests += 1;
        }

        let tx = self.manifest_tx.clone();
        tokio::task::spawn_blocking(move || {
            let result = discover(&path, stage, &url);
            let _ = tx.send(ManifestProcessed {
                asset,
                stage,
                url,
                result,
            });
        });
    }

    async fn on_manifest(&mut self, processed: ManifestProcessed) {
        let ManifestProcessed {
            asset,
            stage,
            url,
            result,
        } = processed;
        let Some(pipeline) = self.pipelines.get_mut(&asset) else {
            return;
        };
        pipeline.pending_manifests -= 1;
        if pipeline.abandoned {
            self.settle(asset).await;
            return;
        }

        match result {
            Ok(discovered) => {
                if let Err(e) = self.dispatch_children(asset, stage, discovered) {
                    log::error!("Failed to continue after {url}: {e}");
                    self.abandon(asset);
                }
            }
            Err(e) => {
                log::error!("Failed to process {stage:?} manifest {url}: {e}");
                self.abandon(asset);
            }
        }

        self.settle(asset).await;
    }

    fn dispatch_children(
        &mut self,
        asset: AssetId,
        stage: Stage,
        discovered: Discovered,
    ) -> HozonResult<()> {
        let Some(info) = self.registry.asset(asset).cloned() else {
            return Ok(());
        };

        if stage == Stage::VideoManifest && (info.protected || discovered.key_uri.is_some()) {
            self.bind_drm(asset, &info, discovered.key_uri)?;
        }

        let count = discovered.children.len();
        for (child_stage, url) in discovered.children {
            let destination = layout::mirror_path(&info.program_id, &url)?;
            self.dispatch(asset, child_stage, url, destination);
        }
        log::info!("{count} fetch(es) queued after {stage:?} of {}.", info.name);
        Ok(())
    }

    fn bind_drm(&mut self, asset: AssetId, info: &Asset, key_uri: Option<String>) -> HozonResult<()> {
        let Some(pipeline) = self.pipelines.get_mut(&asset) else {
            return Ok(());
        };
        if pipeline.key_provider.is_some() {
            return Ok(());
        }
        let Some(binder) = &self.binder else {
            log::warn!(
                "{} is protected but no DRM binder is configured, segments are fetched as is.",
                info.name
            );
            return Ok(());
        };

        let scope = DrmScope {
            program_id: info.program_id.clone(),
            content_id: info.content_id.clone(),
            key_uri,
        };
        log::debug!("Binding key provider for {scope:?}");
        pipeline.key_provider = Some(binder.bind(&scope)?);
        Ok(())
    }

    /// Mark a pipeline as failed and cancel whatever it still has in flight.
    fn abandon(&mut self, asset: AssetId) {
        let Some(pipeline) = self.pipelines.get_mut(&asset) else {
            return;
        };
        if pipeline.abandoned {
            return;
        }
        pipeline.abandoned = true;

        for id in self.registry.handles_of(asset) {
            self.transport.cancel(id);
        }
    }

    /// Finish a pipeline once nothing is outstanding for it.
    async fn settle(&mut self, asset: AssetId) {
        let Some(pipeline) = self.pipelines.get(&asset) else {
            return;
        };
        if self.registry.outstanding(asset) > 0 || pipeline.pending_manifests > 0 {
            return;
        }

        let succeeded = !pipeline.abandoned && pipeline.segments_done > 0;
        if !pipeline.abandoned && pipeline.segments_done == 0 {
            log::warn!("Pipeline finished without fetching any segment.");
        }

        self.pipelines.remove(&asset);
        let Some(info) = self.registry.deactivate(asset) else {
            return;
        };

        if succeeded {
            let path = layout::master_path(&info.program_id, &self.master_manifest_name);
            match self.index.set(&info.name, &path) {
                Ok(()) => {
                    log::info!("{} downloaded.", info.name);
                    self.events.state(&info.name, DownloadState::Downloaded);
                    return;
                }
                Err(e) => log::error!("Failed to record {} as downloaded: {e}", info.name),
            }
        }

        self.discard_asset(&info).await;
        self.events.state(&info.name, DownloadState::NotDownloaded);
    }

    /// Remove the files and the index entry of a pipeline that did not complete.
    async fn discard_asset(&self, info: &Asset) {
        self.remove_files(&info.name, &layout::asset_dir(&info.program_id))
            .await;
        if let Err(e) = self.index.remove(&info.name) {
            log::warn!("Failed to remove index entry of {}: {e}", info.name);
        }
    }

    async fn remove_files(&self, name: &str, dir: &Path) {
        let dir = self.base_dir.join(dir);
        if let Err(e) = util::remove_path(&dir).await {
            log::warn!("Failed to remove files of {name} at {}: {e}", dir.display());
        }
    }
}

fn validate(asset: &Asset) -> HozonResult<()> {
    if asset.name.is_empty() {
        return Err(HozonError::InvalidAsset("empty asset name".to_string()));
    }

    let mut components = Path::new(&asset.program_id).components();
    match (components.next(), components.next()) {
        (Some(std::path::Component::Normal(_)), None) => {}
        _ => {
            return Err(HozonError::InvalidAsset(format!(
                "program id {:?} is not a plain directory name",
                asset.program_id
            )))
        }
    }

    match asset.root_manifest_url.scheme() {
        "http" | "https" => Ok(()),
        scheme => Err(HozonError::InvalidUrl(format!(
            "unsupported scheme {scheme} in {}",
            asset.root_manifest_url
        ))),
    }
}

/// Rewrite a fetched manifest in place and extract its children from the original text.
fn discover(path: &Path, stage: Stage, url: &Url) -> HozonResult<Discovered> {
    let text = std::fs::read_to_string(path)?;

    let qualify_against = (stage == Stage::Master).then_some(url);
    if let Err(e) = rewrite::rewrite_manifest(path, qualify_against) {
        log::warn!("Failed to rewrite {}: {e}", path.display());
    }

    let mut discovered = Discovered::default();
    match stage {
        Stage::Master => {
            for uri in manifest::extract_required(&text, Grammar::MasterVideo)? {
                let url = manifest::resolve(url, &uri)?;
                discovered.children.push((Stage::VideoManifest, url));
            }
            for uri in manifest::extract(&text, Grammar::MasterSubtitles) {
                let url = manifest::resolve(url, &uri)?;
                discovered.children.push((Stage::SubtitlesManifest, url));
            }
        }
        Stage::VideoManifest => {
            for uri in manifest::extract_required(&text, Grammar::VideoSegments)? {
                let url = manifest::resolve(url, &uri)?;
                discovered.children.push((Stage::Segment, url));
            }
            discovered.key_uri = manifest::key_uri(&text);
        }
        Stage::SubtitlesManifest => {
            for uri in manifest::extract(&text, Grammar::SubtitleSegments) {
                let url = manifest::resolve(url, &uri)?;
                discovered.children.push((Stage::SubtitleSegment, url));
            }
        }
        Stage::Segment | Stage::SubtitleSegment => {}
    }
    Ok(discovered)
}

async fn discard(temp: &Path) {
    if let Err(e) = tokio::fs::remove_file(temp).await {
        log::debug!("Failed to discard {}: {e}", temp.display());
    }
}
