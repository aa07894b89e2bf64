mod sequencer;

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot};

use self::sequencer::{Command, Sequencer};
use crate::{
    asset::{Asset, DownloadState},
    config::DownloaderConfig,
    drm::DrmBinder,
    error::{HozonError, HozonResult},
    events::{Event, EventBus},
    index::{JsonFileStore, KeyValueStore, PersistedIndex},
    transport::{HttpTransport, MediaSelection, Transport},
};

/// Outcome of a download request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// The master manifest fetch was dispatched.
    Started,
    /// A pipeline for this asset name is already running; nothing was dispatched.
    AlreadyActive,
    /// The asset is on disk already.
    AlreadyDownloaded,
}

/// Handle to a running download service.
///
/// Cloning is cheap; every clone talks to the same coordination task.
#[derive(Clone)]
pub struct Downloader {
    commands: mpsc::UnboundedSender<Command>,
    events: EventBus,
    index: PersistedIndex,
}

impl Downloader {
    pub fn builder(config: DownloaderConfig) -> DownloaderBuilder {
        DownloaderBuilder::new(config)
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> HozonResult<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .map_err(|_| HozonError::ServiceStopped)?;
        rx.await.map_err(|_| HozonError::ServiceStopped)
    }

    /// Start downloading an asset, unless it is downloading or downloaded already.
    pub async fn download(&self, asset: Asset) -> HozonResult<Dispatch> {
        self.request(|tx| Command::Download(asset, tx)).await?
    }

    /// Cancel the active pipeline of an asset. Returns `false` if none is active.
    ///
    /// The asset reports `NotDownloaded` once every in-flight fetch drained.
    pub async fn cancel(&self, name: &str) -> HozonResult<bool> {
        self.request(|tx| Command::Cancel(name.to_string(), tx))
            .await
    }

    pub async fn state(&self, name: &str) -> HozonResult<DownloadState> {
        self.request(|tx| Command::State(name.to_string(), tx))
            .await?
    }

    /// Remove a downloaded asset from disk and from the persisted index.
    pub async fn delete(&self, name: &str) -> HozonResult<()> {
        self.request(|tx| Command::Delete(name.to_string(), tx))
            .await?
    }

    /// Alternate renditions reported so far for the fetches of an active asset.
    pub async fn media_selections(&self, name: &str) -> HozonResult<Vec<MediaSelection>> {
        self.request(|tx| Command::MediaSelections(name.to_string(), tx))
            .await
    }

    /// Names of every asset recorded as downloaded.
    pub fn downloaded(&self) -> HozonResult<Vec<String>> {
        self.index.names()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    /// Cancel every transfer and stop the coordination task.
    pub async fn shutdown(&self) -> HozonResult<()> {
        self.request(Command::Shutdown).await
    }
}

pub struct DownloaderBuilder {
    config: DownloaderConfig,
    transport: Option<Arc<dyn Transport>>,
    store: Option<Arc<dyn KeyValueStore>>,
    binder: Option<Arc<dyn DrmBinder>>,
    events: Option<EventBus>,
}

impl DownloaderBuilder {
    pub fn new(config: DownloaderConfig) -> Self {
        Self {
            config,
            transport: None,
            store: None,
            binder: None,
            events: None,
        }
    }

    /// Transfer engine. Defaults to [`HttpTransport`] with a default client.
    pub fn transport(mut self, transport: impl Transport) -> Self {
        self.transport = Some(Arc::new(transport));
        self
    }

    /// Durable store behind the persisted index. Defaults to a [`JsonFileStore`].
    pub fn store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn drm_binder(mut self, binder: impl DrmBinder) -> Self {
        self.binder = Some(Arc::new(binder));
        self
    }

    /// Share an event bus, so subscriptions made before start see `RestoreComplete`.
    pub fn events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Spawn the coordination task. Must be called within a tokio runtime.
    pub fn start(self) -> HozonResult<Downloader> {
        let config = self.config;
        std::fs::create_dir_all(&config.base_dir)?;

        let store = match self.store {
            Some(store) => store,
            None => Arc::new(JsonFileStore::open(config.index_path())?),
        };
        let transport = match self.transport {
            Some(transport) => transport,
            None => Arc::new(HttpTransport::new(
                reqwest::Client::new(),
                config.temp_dir(),
            )),
        };
        let events = self
            .events
            .unwrap_or_else(|| EventBus::new(config.event_capacity));
        let index = PersistedIndex::new(store, &config.base_dir);

        let (sequencer, channels) = Sequencer::new(
            config.base_dir.clone(),
            config.master_manifest_name.clone(),
            index.clone(),
            events.clone(),
            transport,
            self.binder,
        );
        let (commands, command_rx) = mpsc::unbounded_channel();
        tokio::spawn(sequencer.run(command_rx, channels));

        log::info!(
            "Downloader started in {}.",
            config.base_dir.display()
        );
        Ok(Downloader {
            commands,
            events,
            index,
        })
    }
}
