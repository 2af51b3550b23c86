#![allow(dead_code)]

use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, ReadBuf};

use periodicals_sync::bookmarks::ServerId;
use periodicals_sync::{
    ApiError, Bookmark, EditionId, FileBody, FileSource, LastPage, ProgressEntry, ProgressLedger,
    ReaderApi, RemoteBookmark, TransportError,
};

/// Serves files of fixed sizes from memory.
#[derive(Default)]
pub struct MemorySource {
    sizes: HashMap<EditionId, usize>,
    stalled: HashMap<EditionId, usize>,
    broken: HashMap<EditionId, usize>,
    pub fetches: AtomicUsize,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, id: EditionId, size: usize) -> Self {
        self.sizes.insert(id, size);
        self
    }

    /// The body sends `sent` bytes of a larger file and then never finishes.
    pub fn with_stalled_file(mut self, id: EditionId, sent: usize) -> Self {
        self.stalled.insert(id, sent);
        self
    }

    /// The body sends `sent` bytes and then fails with a connection reset.
    pub fn with_broken_file(mut self, id: EditionId, sent: usize) -> Self {
        self.broken.insert(id, sent);
        self
    }
}

struct ResetReader;

impl AsyncRead for ResetReader {
    fn poll_read(self: Pin<&mut Self>, _: &mut Context<'_>, _: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Err(io::ErrorKind::ConnectionReset.into()))
    }
}

#[async_trait]
impl FileSource for MemorySource {
    async fn fetch(&self, id: EditionId) -> Result<FileBody, TransportError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if let Some(&sent) = self.stalled.get(&id) {
            let (mut tx, rx) = tokio::io::duplex(64 * 1024);
            tokio::spawn(async move {
                let _ = tx.write_all(&vec![1u8; sent]).await;
                std::future::pending::<()>().await;
            });
            return Ok(FileBody {
                content_length: Some(sent as u64 * 4),
                reader: Box::pin(rx),
            });
        }
        if let Some(&sent) = self.broken.get(&id) {
            let body = std::io::Cursor::new(vec![2u8; sent]).chain(ResetReader);
            return Ok(FileBody {
                content_length: Some(sent as u64 * 2),
                reader: Box::pin(body),
            });
        }
        match self.sizes.get(&id) {
            Some(&size) => Ok(FileBody {
                content_length: Some(size as u64),
                reader: Box::pin(std::io::Cursor::new(vec![(id % 251) as u8; size])),
            }),
            None => Err(TransportError::Status(404)),
        }
    }
}

/// Collects ledger snapshots until `done` holds for one of them.
pub async fn watch_until(
    ledger: &ProgressLedger,
    id: EditionId,
    done: impl Fn(Option<ProgressEntry>) -> bool,
) -> Vec<Option<ProgressEntry>> {
    let mut subscription = ledger.subscribe();
    let mut seen = Vec::new();
    if done(ledger.get(id)) {
        seen.push(ledger.get(id));
        return seen;
    }
    let collect = async {
        while let Some(snapshot) = subscription.next().await {
            let entry = snapshot.get(&id).copied();
            seen.push(entry);
            if done(entry) {
                break;
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(10), collect)
        .await
        .expect("ledger never reached the expected state");
    seen
}

/// In-memory bookmark server assigning ids from a counter.
pub struct FakeServer {
    next_id: Mutex<ServerId>,
    bookmarks: Mutex<Vec<RemoteBookmark>>,
    pub fail_create: AtomicBool,
    pub create_calls: Mutex<Vec<usize>>,
    pub delete_calls: Mutex<Vec<Vec<ServerId>>>,
    pub posted_pages: Mutex<Vec<LastPage>>,
}

impl FakeServer {
    pub fn starting_at(next_id: ServerId) -> Self {
        Self {
            next_id: Mutex::new(next_id),
            bookmarks: Mutex::new(Vec::new()),
            fail_create: AtomicBool::new(false),
            create_calls: Mutex::new(Vec::new()),
            delete_calls: Mutex::new(Vec::new()),
            posted_pages: Mutex::new(Vec::new()),
        }
    }

    /// A bookmark created from another device.
    pub fn insert_remote(&self, edition_id: EditionId, page: u32) -> ServerId {
        let mut next = self.next_id.lock().unwrap();
        let id = *next;
        *next += 1;
        self.bookmarks.lock().unwrap().push(RemoteBookmark {
            server_id: Some(id),
            edition_id,
            page,
        });
        id
    }

    pub fn delete_remote(&self, server_id: ServerId) {
        self.bookmarks
            .lock()
            .unwrap()
            .retain(|b| b.server_id != Some(server_id));
    }

    pub fn remote_pages(&self, edition_id: EditionId) -> Vec<u32> {
        let mut pages: Vec<u32> = self
            .bookmarks
            .lock()
            .unwrap()
            .iter()
            .filter(|b| b.edition_id == edition_id)
            .map(|b| b.page)
            .collect();
        pages.sort_unstable();
        pages
    }
}

#[async_trait]
impl ReaderApi for FakeServer {
    async fn list_bookmarks(&self, edition_id: EditionId) -> Result<Vec<RemoteBookmark>, ApiError> {
        let mut list: Vec<RemoteBookmark> = self
            .bookmarks
            .lock()
            .unwrap()
            .iter()
            .filter(|b| b.edition_id == edition_id)
            .cloned()
            .collect();
        list.sort_by_key(|b| b.page);
        Ok(list)
    }

    async fn create_bookmarks(&self, bookmarks: &[Bookmark]) -> Result<Vec<ServerId>, ApiError> {
        self.create_calls.lock().unwrap().push(bookmarks.len());
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(ApiError::Status(503));
        }
        Ok(bookmarks
            .iter()
            .map(|b| self.insert_remote(b.edition_id, b.page))
            .collect())
    }

    async fn delete_bookmarks(&self, server_ids: &[ServerId]) -> Result<(), ApiError> {
        self.delete_calls.lock().unwrap().push(server_ids.to_vec());
        self.bookmarks
            .lock()
            .unwrap()
            .retain(|b| b.server_id.map_or(true, |id| !server_ids.contains(&id)));
        Ok(())
    }

    async fn last_page(&self, edition_id: EditionId) -> Result<LastPage, ApiError> {
        let posted = self.posted_pages.lock().unwrap();
        Ok(posted
            .iter()
            .rev()
            .find(|p| p.edition_id == edition_id)
            .copied()
            .unwrap_or(LastPage { edition_id, page: 0 }))
    }

    async fn post_last_page(&self, last_page: LastPage) -> Result<(), ApiError> {
        self.posted_pages.lock().unwrap().push(last_page);
        Ok(())
    }
}
