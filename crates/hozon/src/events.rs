use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast;

use crate::asset::DownloadState;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    /// Progress of the most recently reporting fetch of an asset.
    ///
    /// `percent` is a fraction where `1.0` means done. It is not clamped:
    /// overlapping time ranges can push it past `1.0` for a moment.
    ProgressChanged { asset_name: String, percent: f64 },
    StateChanged {
        asset_name: String,
        state: DownloadState,
    },
    /// Persisted state was reconciled after start-up.
    RestoreComplete,
}

/// Raw progress as reported by a transfer engine.
#[derive(Debug, Clone, PartialEq)]
pub enum Progress {
    /// Discrete file transfer.
    Bytes { written: u64, expected: Option<u64> },
    /// Continuous media transfer, as loaded time ranges over the expected duration.
    TimeRanges {
        loaded: Vec<Duration>,
        expected_total: Duration,
    },
}

impl Progress {
    /// Completed fraction, or `None` when the total is unknown.
    pub fn fraction(&self) -> Option<f64> {
        match self {
            Progress::Bytes { written, expected } => match expected {
                Some(expected) if *expected > 0 => Some(*written as f64 / *expected as f64),
                _ => None,
            },
            Progress::TimeRanges {
                loaded,
                expected_total,
            } => {
                if expected_total.is_zero() {
                    return None;
                }
                let total = expected_total.as_secs_f64();
                Some(loaded.iter().map(|d| d.as_secs_f64() / total).sum())
            }
        }
    }
}

/// Fire-and-forget fan out of [`Event`]s. Events without subscribers are dropped.
#[derive(Clone, Debug)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, event: Event) {
        log::trace!("Publishing {event:?}");
        let _ = self.tx.send(event);
    }

    pub fn progress(&self, asset_name: &str, percent: f64) {
        self.publish(Event::ProgressChanged {
            asset_name: asset_name.to_string(),
            percent,
        });
    }

    pub fn state(&self, asset_name: &str, state: DownloadState) {
        self.publish(Event::StateChanged {
            asset_name: asset_name.to_string(),
            state,
        });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
