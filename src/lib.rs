//! Offline periodical library: downloads edition files with bounded
//! concurrency and observable progress, and keeps bookmarks and reading
//! positions in sync with the server.
//!
//! - [`downloader`] streams files to disk and publishes to the
//!   [`progress`] ledger.
//! - [`bookmarks`] reconciles the local bookmark table with the server.
//! - [`debounce`] throttles bookmark syncs and last-page posts.
//! - [`state`] is the local record store; [`files`] the per-user directory.

pub mod bookmarks;
pub mod debounce;
pub mod downloader;
pub mod error;
pub mod files;
pub mod progress;
pub mod state;
pub mod transport;

/// Identifier of an edition; download tasks and ledger entries share it.
pub type EditionId = i64;

pub use bookmarks::{Bookmark, BookmarkStore, BookmarkSync, HttpReaderApi, LastPage, ReaderApi, RemoteBookmark};
pub use debounce::{Debouncer, PositionSync, DEFAULT_QUIET_PERIOD};
pub use downloader::{DownloadHandle, Downloader, CHUNK_SIZE, DEFAULT_CONCURRENCY};
pub use error::{ApiError, DownloadError, FailureKind, StoreError, SyncError, TransportError};
pub use files::{FileStore, FileType};
pub use progress::{ProgressEntry, ProgressLedger, ProgressSubscription, ProgressSummary, Snapshot};
pub use state::{DownloadRegistry, DownloadedEdition, LocalStore};
pub use transport::{FileBody, FileSource, HttpFileSource};
