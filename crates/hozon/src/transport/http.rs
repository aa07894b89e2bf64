use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use futures::StreamExt;
use reqwest::Client;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use super::{Fetch, FetchReporter, Transport, TransportError};
use crate::{events::Progress, registry::FetchId};

/// Plain HTTP engine: streams each body into a temp file under `temp_dir`.
#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
    temp_dir: PathBuf,
    transfers: Arc<Mutex<HashMap<FetchId, CancellationToken>>>,
}

impl HttpTransport {
    pub fn new(client: Client, temp_dir: impl Into<PathBuf>) -> Self {
        Self {
            client,
            temp_dir: temp_dir.into(),
            transfers: Default::default(),
        }
    }

    /// Number of transfers still running.
    pub fn active(&self) -> usize {
        self.transfers.lock().unwrap().len()
    }
}

impl Transport for HttpTransport {
    fn start(&self, fetch: Fetch, reporter: FetchReporter) {
        let token = CancellationToken::new();
        self.transfers
            .lock()
            .unwrap()
            .insert(fetch.id, token.clone());

        let client = self.client.clone();
        let temp_dir = self.temp_dir.clone();
        let transfers = self.transfers.clone();
        tokio::spawn(async move {
            if let Some(provider) = &fetch.key_provider {
                log::debug!(
                    "{} carries content key scope {}/{}",
                    fetch.url,
                    provider.scope().program_id,
                    provider.scope().content_id
                );
            }

            let result = tokio::select! {
                _ = token.cancelled() => Err(TransportError::Cancelled),
                result = transfer(&client, &fetch, &temp_dir, &reporter) => result,
            };
            transfers.lock().unwrap().remove(&fetch.id);
            reporter.finish(result);
        });
    }

    fn cancel(&self, id: FetchId) {
        if let Some(token) = self.transfers.lock().unwrap().get(&id) {
            token.cancel();
        }
    }
}

async fn transfer(
    client: &Client,
    fetch: &Fetch,
    temp_dir: &Path,
    reporter: &FetchReporter,
) -> Result<PathBuf, TransportError> {
    let response = client.get(fetch.url.clone()).send().await?;
    if !response.status().is_success() {
        let status = response.status();
        if let Ok(body) = response.text().await {
            log::warn!("Error body: {body}");
        }
        return Err(TransportError::HttpStatus(status));
    }

    tokio::fs::create_dir_all(temp_dir).await?;
    let (file, temp_path) = tempfile::Builder::new()
        .prefix(".hozon-")
        .suffix(".part")
        .tempfile_in(temp_dir)?
        .into_parts();
    let mut file = tokio::fs::File::from_std(file);

    let expected = response.content_length();
    let mut written = 0u64;
    let mut body = response.bytes_stream();
    while let Some(chunk) = body.next().await {
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
        reporter.progress(Progress::Bytes { written, expected });
    }
    file.flush().await?;
    drop(file);

    // the temp file is removed on any early return above
    let path = temp_path.keep().map_err(|e| e.error)?;
    Ok(path)
}
