//! Contract between the sequencer and a byte-transfer engine.
//!
//! An engine receives a [`Fetch`] and reports back through the paired
//! [`FetchReporter`]: any number of progress and media selection events,
//! then exactly one completion carrying the path of a temporary file.

pub mod http;

use std::{path::PathBuf, sync::Arc};

use thiserror::Error;
use tokio::sync::mpsc;
use url::Url;

use crate::{
    drm::KeyProvider,
    events::Progress,
    registry::{FetchId, Stage},
};

pub use http::HttpTransport;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("transfer cancelled")]
    Cancelled,

    #[error("transfer abandoned by the engine")]
    Abandoned,

    #[error("HTTP error: {0}")]
    HttpStatus(reqwest::StatusCode),

    #[error(transparent)]
    Request(#[from] reqwest::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl TransportError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TransportError::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Audio,
    Subtitles,
}

/// An alternate rendition the engine found while transferring.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MediaSelection {
    pub kind: MediaKind,
    pub language: Option<String>,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct Fetch {
    pub id: FetchId,
    pub url: Url,
    pub stage: Stage,
    pub key_provider: Option<Arc<dyn KeyProvider>>,
}

#[derive(Debug)]
pub enum TransportEvent {
    Progress(Progress),
    MediaSelection(MediaSelection),
    /// Terminal event: temporary file holding the body, or the failure.
    Finished(Result<PathBuf, TransportError>),
}

pub(crate) type TransportSender = mpsc::UnboundedSender<(FetchId, TransportEvent)>;

/// Reports the outcome of one fetch back to the coordination task.
///
/// Dropping a reporter without calling [`finish`](Self::finish) reports
/// [`TransportError::Abandoned`], so every fetch completes exactly once.
#[derive(Debug)]
pub struct FetchReporter {
    id: FetchId,
    tx: TransportSender,
    finished: bool,
}

impl FetchReporter {
    pub(crate) fn new(id: FetchId, tx: TransportSender) -> Self {
        Self {
            id,
            tx,
            finished: false,
        }
    }

    pub fn id(&self) -> FetchId {
        self.id
    }

    pub fn progress(&self, progress: Progress) {
        let _ = self.tx.send((self.id, TransportEvent::Progress(progress)));
    }

    pub fn media_selection(&self, selection: MediaSelection) {
        let _ = self
            .tx
            .send((self.id, TransportEvent::MediaSelection(selection)));
    }

    pub fn finish(mut self, result: Result<PathBuf, TransportError>) {
        self.finished = true;
        let _ = self.tx.send((self.id, TransportEvent::Finished(result)));
    }
}

impl Drop for FetchReporter {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.tx.send((
                self.id,
                TransportEvent::Finished(Err(TransportError::Abandoned)),
            ));
        }
    }
}

pub trait Transport: Send + Sync + 'static {
    /// Begin transferring `fetch`. Must return without waiting for the transfer.
    fn start(&self, fetch: Fetch, reporter: FetchReporter);

    /// Ask the engine to stop a transfer.
    ///
    /// The completion is still delivered, with [`TransportError::Cancelled`].
    fn cancel(&self, id: FetchId);
}

impl<T> Transport for Arc<T>
where
    T: Transport,
{
    fn start(&self, fetch: Fetch, reporter: FetchReporter) {
        self.as_ref().start(fetch, reporter)
    }

    fn cancel(&self, id: FetchId) {
        self.as_ref().cancel(id)
    }
}
