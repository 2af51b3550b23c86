use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{DownloadError, TransportError};
use crate::files::{remove_if_present, FileStore, FileType};
use crate::progress::{ProgressEntry, ProgressLedger};
use crate::transport::{BodyReader, FileSource};
use crate::EditionId;

/// Transfers running at once; further downloads wait for a slot.
pub const DEFAULT_CONCURRENCY: usize = 8;
/// Bytes copied between progress updates and cancellation checks.
pub const CHUNK_SIZE: usize = 16 * 1024;

/// Downloads edition files with bounded concurrency and reports progress
/// through a [`ProgressLedger`].
pub struct Downloader {
    source: Arc<dyn FileSource>,
    files: FileStore,
    ledger: ProgressLedger,
    active: Arc<Mutex<HashMap<EditionId, CancellationToken>>>,
    slots: Arc<Semaphore>,
}

/// Awaitable outcome of a submitted download.
pub struct DownloadHandle {
    id: EditionId,
    join: JoinHandle<Result<PathBuf, DownloadError>>,
}

impl DownloadHandle {
    pub fn id(&self) -> EditionId {
        self.id
    }

    pub async fn wait(self) -> Result<PathBuf, DownloadError> {
        match self.join.await {
            Ok(outcome) => outcome,
            Err(err) => Err(DownloadError::Other(err.to_string())),
        }
    }
}

impl Downloader {
    pub fn new(source: Arc<dyn FileSource>, files: FileStore, ledger: ProgressLedger, concurrency: usize) -> Self {
        Self {
            source,
            files,
            ledger,
            active: Arc::new(Mutex::new(HashMap::new())),
            slots: Arc::new(Semaphore::new(concurrency.max(1))),
        }
    }

    pub fn ledger(&self) -> &ProgressLedger {
        &self.ledger
    }

    pub fn files(&self) -> &FileStore {
        &self.files
    }

    /// Starts downloading `id` into `<root>/<prefix>/<id><ext>`.
    ///
    /// `on_success` runs after the body is fully on disk and before the
    /// ledger reports `Success`. Returns `None` when `id` is already being
    /// downloaded; the running transfer is left alone.
    pub fn download<F, Fut>(&self, id: EditionId, prefix: &str, file_type: FileType, on_success: F) -> Option<DownloadHandle>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = CancellationToken::new();
        {
            // Registry changes and their ledger entry are published together.
            let mut active = lock(&self.active);
            if active.contains_key(&id) {
                debug!(id, "download already in flight");
                return None;
            }
            active.insert(id, token.clone());
            self.ledger
                .set(id, ProgressEntry::Loading { current: 0, total: 0 });
        }

        let job = Transfer {
            id,
            prefix: prefix.to_string(),
            file_type,
            source: self.source.clone(),
            files: self.files.clone(),
            ledger: self.ledger.clone(),
            token: token.clone(),
        };
        let active = self.active.clone();
        let slots = self.slots.clone();

        let join = tokio::spawn(async move {
            let permit = tokio::select! {
                biased;
                _ = token.cancelled() => None,
                permit = slots.acquire_owned() => permit.ok(),
            };

            let outcome = match permit {
                Some(_permit) => job.run().await,
                None => Err(DownloadError::Cancelled),
            };

            match outcome {
                Ok(path) => {
                    on_success().await;
                    finish(&active, &job.ledger, id, ProgressEntry::Success);
                    info!(id, path = %path.display(), "download complete");
                    Ok(path)
                }
                Err(err) => {
                    finish(&active, &job.ledger, id, ProgressEntry::Error(err.kind()));
                    warn!(id, error = %err, "download failed");
                    Err(err)
                }
            }
        });

        Some(DownloadHandle { id, join })
    }

    /// Signals cancellation; the transfer stops at its next chunk boundary.
    pub fn cancel_download(&self, id: EditionId) {
        if let Some(token) = lock(&self.active).get(&id) {
            debug!(id, "cancelling download");
            token.cancel();
        }
    }

    /// Deletes the file and forgets its ledger entry. `cleanup` runs once the
    /// file is gone. Filesystem errors are logged and reported as `false`.
    pub async fn delete_file<F, Fut>(&self, id: EditionId, prefix: &str, file_type: FileType, cleanup: F) -> bool
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ()>,
    {
        if let Err(err) = self.files.delete(prefix, id, file_type).await {
            warn!(id, error = %err, "failed to delete file");
            return false;
        }
        cleanup().await;
        self.ledger.remove(id);
        info!(id, "file deleted");
        true
    }

    pub fn are_all_loadings_complete(&self) -> bool {
        lock(&self.active).is_empty()
    }

    /// Path of a downloaded edition; existence is not checked.
    pub fn file_for_reading(&self, edition_id: EditionId, publication_id: &str) -> PathBuf {
        self.files.reader_path(edition_id, publication_id)
    }
}

type Registry = Mutex<HashMap<EditionId, CancellationToken>>;

fn lock(active: &Registry) -> MutexGuard<'_, HashMap<EditionId, CancellationToken>> {
    active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Drops the task from the registry, then publishes its terminal entry.
fn finish(active: &Registry, ledger: &ProgressLedger, id: EditionId, entry: ProgressEntry) {
    let mut active = lock(active);
    active.remove(&id);
    ledger.set(id, entry);
}

struct Transfer {
    id: EditionId,
    prefix: String,
    file_type: FileType,
    source: Arc<dyn FileSource>,
    files: FileStore,
    ledger: ProgressLedger,
    token: CancellationToken,
}

impl Transfer {
    async fn run(&self) -> Result<PathBuf, DownloadError> {
        let body = tokio::select! {
            biased;
            _ = self.token.cancelled() => return Err(DownloadError::Cancelled),
            body = self.source.fetch(self.id) => body,
        };
        let body = match body {
            Ok(body) => body,
            Err(TransportError::Io(err)) => return Err(DownloadError::Io(err)),
            Err(err) => return Err(DownloadError::RequestFailed(err)),
        };
        let total = body.content_length.unwrap_or(0);

        let (path, file) = self
            .files
            .create(&self.prefix, self.id, self.file_type)
            .await
            .map_err(|err| DownloadError::Other(format!("cannot create output file: {}", err)))?;
        debug!(id = self.id, total, path = %path.display(), "streaming to disk");

        match self.copy(body.reader, file, total).await {
            Ok(()) => Ok(path),
            Err(err) => {
                if let Err(remove_err) = remove_if_present(&path).await {
                    warn!(id = self.id, error = %remove_err, "failed to remove partial file");
                }
                Err(err)
            }
        }
    }

    async fn copy(&self, mut reader: BodyReader, mut file: File, total: u64) -> Result<(), DownloadError> {
        let mut buffer = vec![0u8; CHUNK_SIZE];
        let mut written: u64 = 0;
        loop {
            if self.token.is_cancelled() {
                return Err(DownloadError::Cancelled);
            }
            let n = tokio::select! {
                biased;
                _ = self.token.cancelled() => return Err(DownloadError::Cancelled),
                n = read_chunk(&mut reader, &mut buffer) => n?,
            };
            if n == 0 {
                break;
            }
            file.write_all(&buffer[..n]).await?;
            written += n as u64;
            self.ledger.set(
                self.id,
                ProgressEntry::Loading {
                    current: written,
                    total,
                },
            );
            tokio::task::yield_now().await;
        }
        file.flush().await?;
        file.sync_all().await?;
        Ok(())
    }
}

/// Fills `buffer` unless the body ends first; returns the bytes read.
async fn read_chunk(reader: &mut BodyReader, buffer: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buffer.len() {
        let n = reader.read(&mut buffer[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
