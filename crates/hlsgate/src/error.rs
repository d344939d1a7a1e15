use std::path::PathBuf;

use reqwest::StatusCode;
use thiserror::Error;
use url::Url;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("manifest error: {0}")]
    Manifest(String),

    #[error("unsupported manifest feature: {0}")]
    Unsupported(String),

    #[error(transparent)]
    InvalidUrl(#[from] url::ParseError),

    #[error("network error fetching {url}: {reason}")]
    Network { url: Url, reason: String },

    #[error("not found: {0}")]
    NotFound(Url),

    #[error("HTTP {status} fetching {url}")]
    Client { status: StatusCode, url: Url },

    #[error("decryption failed: {0}")]
    Decryption(String),

    #[error("write error at {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("session error: {0}")]
    Session(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Request(#[from] reqwest::Error),
}

impl GatewayError {
    /// A 404 on a media segment during live polling: the segment is not
    /// available yet and will be re-enumerated on the next refresh.
    pub fn is_not_found(&self) -> bool {
        matches!(self, GatewayError::NotFound(_))
    }

    pub(crate) fn write(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        GatewayError::Write {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T, E = GatewayError> = std::result::Result<T, E>;
