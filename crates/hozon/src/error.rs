use thiserror::Error;

use crate::transport::TransportError;

#[derive(Error, Debug)]
pub enum HozonError {
    #[error("Invalid manifest: {0}")]
    ManifestParse(String),

    #[error("Invalid url: {0}")]
    InvalidUrl(String),

    #[error("Transfer failed: {0}")]
    Transport(#[from] TransportError),

    #[error("Invalid asset: {0}")]
    InvalidAsset(String),

    #[error("Asset {0} is not known")]
    UnknownAsset(String),

    #[error("Asset {0} has an active download")]
    AssetBusy(String),

    #[error("Program directory {0} already belongs to asset {1}")]
    ProgramInUse(String, String),

    #[error("Downloader service has stopped")]
    ServiceStopped,

    #[error(transparent)]
    IOError(#[from] std::io::Error),

    #[error(transparent)]
    PersistError(#[from] tempfile::PersistError),

    #[error(transparent)]
    UrlParseError(#[from] url::ParseError),

    #[error(transparent)]
    JsonError(#[from] serde_json::Error),
}

pub type HozonResult<T> = Result<T, HozonError>;
