use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::bookmarks::{BookmarkSync, LastPage};
use crate::EditionId;

pub const DEFAULT_QUIET_PERIOD: Duration = Duration::from_millis(2000);

/// Forwards the latest submitted value once submissions pause for the quiet
/// period. Older unconsumed values are overwritten.
pub struct Debouncer<T> {
    tx: watch::Sender<Option<T>>,
    task: JoinHandle<()>,
}

impl<T> Debouncer<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn spawn<H, Fut, E>(quiet: Duration, name: &'static str, handler: H) -> Self
    where
        H: Fn(T) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: std::fmt::Display + Send + 'static,
    {
        let (tx, rx) = watch::channel(None);
        let task = tokio::spawn(run(rx, quiet, name, handler));
        Self { tx, task }
    }

    pub fn submit(&self, value: T) {
        self.tx.send_replace(Some(value));
    }

    /// Stops accepting values; a pending value is still delivered.
    pub async fn close(self) {
        drop(self.tx);
        if let Err(err) = self.task.await {
            warn!(error = %err, "debounce loop ended abnormally");
        }
    }
}

async fn run<T, H, Fut, E>(mut rx: watch::Receiver<Option<T>>, quiet: Duration, name: &'static str, handler: H)
where
    T: Clone,
    H: Fn(T) -> Fut,
    Fut: Future<Output = Result<(), E>>,
    E: std::fmt::Display,
{
    loop {
        if rx.changed().await.is_err() {
            return;
        }
        // Each arrival restarts the quiet period.
        let open = loop {
            match tokio::time::timeout(quiet, rx.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => break false,
                Err(_) => break true,
            }
        };

        let value = rx.borrow_and_update().clone();
        if let Some(value) = value {
            debug!(channel = name, "debounced event fired");
            if let Err(err) = handler(value).await {
                warn!(channel = name, error = %err, "debounced handler failed");
            }
        }
        if !open {
            return;
        }
    }
}

/// Debounced bookmark synchronization and last-page posting.
pub struct PositionSync {
    bookmarks: Debouncer<EditionId>,
    last_page: Debouncer<LastPage>,
}

impl PositionSync {
    pub fn spawn(sync: Arc<BookmarkSync>, quiet: Duration) -> Self {
        let api = sync.api().clone();
        let bookmarks = Debouncer::spawn(quiet, "bookmarks", move |edition_id: EditionId| {
            let sync = sync.clone();
            async move { sync.sync_all_bookmarks(edition_id).await }
        });
        let last_page = Debouncer::spawn(quiet, "last_page", move |last_page: LastPage| {
            let api = api.clone();
            async move { api.post_last_page(last_page).await }
        });
        Self {
            bookmarks,
            last_page,
        }
    }

    /// Records that bookmarks of the edition changed.
    pub fn bookmark_touched(&self, edition_id: EditionId) {
        self.bookmarks.submit(edition_id);
    }

    /// Records the current reading position. Page zero is not reported.
    pub fn page_changed(&self, last_page: LastPage) {
        if last_page.page > 0 {
            self.last_page.submit(last_page);
        }
    }

    /// Delivers pending events and stops both loops.
    pub async fn shutdown(self) {
        tokio::join!(self.bookmarks.close(), self.last_page.close());
    }
}
