use std::fmt;

use thiserror::Error;

/// Coarse classification of a failed download, stored in the progress ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    RequestFailed,
    Cancelled,
    Io,
    Other,
}

impl FailureKind {
    /// Human-readable reason shown to observers of the ledger.
    pub fn tag(&self) -> &'static str {
        match self {
            FailureKind::RequestFailed => "request failed",
            FailureKind::Cancelled => "download was cancelled",
            FailureKind::Io => "i/o failure while streaming",
            FailureKind::Other => "download failed",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("request failed: {0}")]
    RequestFailed(#[source] TransportError),

    #[error("download was cancelled")]
    Cancelled,

    #[error("i/o failure while streaming: {0}")]
    Io(#[from] std::io::Error),

    #[error("download failed: {0}")]
    Other(String),
}

impl DownloadError {
    pub fn kind(&self) -> FailureKind {
        match self {
            DownloadError::RequestFailed(_) => FailureKind::RequestFailed,
            DownloadError::Cancelled => FailureKind::Cancelled,
            DownloadError::Io(_) => FailureKind::Io,
            DownloadError::Other(_) => FailureKind::Other,
        }
    }
}

/// Failure to obtain a file body from the remote file endpoint.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("server responded with status {0}")]
    Status(u16),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Url(#[from] url::ParseError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Failure talking to the bookmark / reading position endpoints.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("server responded with status {0}")]
    Status(u16),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Url(#[from] url::ParseError),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("local store i/o: {0}")]
    Io(#[from] std::io::Error),

    #[error("local store document is malformed: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("remote bookmark call failed: {0}")]
    Remote(#[from] ApiError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("server returned {received} ids for {sent} submitted bookmarks")]
    IdCountMismatch { sent: usize, received: usize },
}
