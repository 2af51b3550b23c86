use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error, info, warn};

use super::{Bookmark, BookmarkStore, NewBookmark, ReaderApi, RemoteBookmark};
use crate::error::SyncError;
use crate::EditionId;

/// Keeps the local bookmark store and the server consistent.
///
/// All operations touching an edition's rows take that edition's lock, so a
/// manual sync and a debounced one never interleave.
pub struct BookmarkSync {
    store: Arc<dyn BookmarkStore>,
    api: Arc<dyn ReaderApi>,
    locks: Mutex<HashMap<EditionId, Arc<AsyncMutex<()>>>>,
}

impl BookmarkSync {
    pub fn new(store: Arc<dyn BookmarkStore>, api: Arc<dyn ReaderApi>) -> Self {
        Self {
            store,
            api,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn api(&self) -> &Arc<dyn ReaderApi> {
        &self.api
    }

    fn edition_lock(&self, edition_id: EditionId) -> Arc<AsyncMutex<()>> {
        let mut locks = self
            .locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks.entry(edition_id).or_default().clone()
    }

    /// Live bookmarks of the edition ordered by page.
    pub async fn bookmarks(&self, edition_id: EditionId) -> Result<Vec<Bookmark>, SyncError> {
        Ok(self.store.bookmarks(edition_id).await?)
    }

    /// Adds a local bookmark unless a live one already sits on `page`.
    pub async fn add_bookmark(&self, edition_id: EditionId, page: u32) -> Result<Vec<Bookmark>, SyncError> {
        let lock = self.edition_lock(edition_id);
        let _guard = lock.lock().await;

        let live = self.store.bookmarks(edition_id).await?;
        if live.iter().all(|b| b.page != page) {
            self.store.insert(NewBookmark::local(edition_id, page)).await?;
            debug!(edition_id, page, "bookmark added");
        }
        Ok(self.store.bookmarks(edition_id).await?)
    }

    /// Tombstones the bookmark. One that never reached the server is purged
    /// right away since there is nothing to delete remotely.
    pub async fn remove_bookmark(&self, bookmark: &Bookmark) -> Result<Vec<Bookmark>, SyncError> {
        let edition_id = bookmark.edition_id;
        let lock = self.edition_lock(edition_id);
        let _guard = lock.lock().await;

        match self.store.get(bookmark.local_id).await? {
            Some(current) if current.server_id.is_none() => {
                self.store.delete_many(&[current.local_id]).await?;
            }
            Some(current) => self.store.mark_to_remove(current.local_id).await?,
            None => debug!(local_id = bookmark.local_id, "bookmark already gone"),
        }
        Ok(self.store.bookmarks(edition_id).await?)
    }

    /// Pushes local-only bookmarks, reflects remote deletions, then pulls
    /// bookmarks created elsewhere.
    pub async fn sync_all_bookmarks(&self, edition_id: EditionId) -> Result<(), SyncError> {
        let lock = self.edition_lock(edition_id);
        let _guard = lock.lock().await;

        if let Err(err) = self.add_local_bookmarks_to_server(edition_id).await {
            match err {
                SyncError::Remote(err) => {
                    warn!(edition_id, error = %err, "bookmark push failed, continuing with remote state")
                }
                other => return Err(other),
            }
        }

        if let Err(err) = self.delete_bookmarks_marked_to_remove(edition_id).await {
            match err {
                SyncError::Remote(err) => {
                    warn!(edition_id, error = %err, "remote bookmark deletion failed, tombstones kept")
                }
                other => return Err(other),
            }
        }

        let remote = self.api.list_bookmarks(edition_id).await?;
        let deleted = self
            .synchronize_deleted_bookmarks(edition_id, &remote)
            .await?;

        let remote = self.api.list_bookmarks(edition_id).await?;
        let added = self.add_new_bookmarks_from_server(edition_id, remote).await?;

        info!(edition_id, deleted = deleted.len(), added, "bookmarks synchronized");
        Ok(())
    }

    /// Submits never-pushed bookmarks and stores the returned server ids.
    ///
    /// Ids are matched to bookmarks by position. A response whose length
    /// differs from the submission is rejected without touching the store.
    pub async fn add_local_bookmarks_to_server(&self, edition_id: EditionId) -> Result<usize, SyncError> {
        let local = self.store.local_bookmarks(edition_id).await?;
        if local.is_empty() {
            return Ok(0);
        }

        let ids = self.api.create_bookmarks(&local).await?;
        if ids.len() != local.len() {
            error!(
                edition_id,
                sent = local.len(),
                received = ids.len(),
                "server id count does not match pushed bookmarks"
            );
            return Err(SyncError::IdCountMismatch {
                sent: local.len(),
                received: ids.len(),
            });
        }

        for (bookmark, server_id) in local.iter().zip(ids) {
            self.store
                .update_server_id(bookmark.local_id, server_id)
                .await?;
        }
        debug!(edition_id, pushed = local.len(), "local bookmarks pushed");
        Ok(local.len())
    }

    /// Removes synchronized local bookmarks whose server id is missing from
    /// `server_bookmarks`. Returns the removed rows.
    pub async fn synchronize_deleted_bookmarks(
        &self,
        edition_id: EditionId,
        server_bookmarks: &[RemoteBookmark],
    ) -> Result<Vec<Bookmark>, SyncError> {
        let existing: HashSet<_> = server_bookmarks
            .iter()
            .filter_map(|b| b.server_id)
            .collect();
        let deleted: Vec<Bookmark> = self
            .store
            .synchronized_bookmarks(edition_id)
            .await?
            .into_iter()
            .filter(|b| b.server_id.map_or(false, |id| !existing.contains(&id)))
            .collect();

        let ids: Vec<_> = deleted.iter().map(|b| b.local_id).collect();
        self.store.delete_many(&ids).await?;
        Ok(deleted)
    }

    /// Deletes tombstoned bookmarks on the server, then purges them locally.
    /// Nothing is purged if the remote call fails.
    pub async fn delete_bookmarks_marked_to_remove(&self, edition_id: EditionId) -> Result<(), SyncError> {
        let marked = self.store.marked_to_remove(edition_id).await?;
        if marked.is_empty() {
            return Ok(());
        }

        let server_ids: Vec<_> = marked.iter().filter_map(|b| b.server_id).collect();
        if !server_ids.is_empty() {
            self.api.delete_bookmarks(&server_ids).await?;
        }
        self.store.delete_marked_to_remove(edition_id).await?;
        debug!(edition_id, purged = marked.len(), "tombstoned bookmarks purged");
        Ok(())
    }

    /// Inserts server bookmarks on pages not yet bookmarked locally. With no
    /// local bookmarks at all, every server bookmark is taken as is.
    pub async fn add_new_bookmarks_from_server(
        &self,
        edition_id: EditionId,
        server_bookmarks: Vec<RemoteBookmark>,
    ) -> Result<usize, SyncError> {
        let (server_bookmarks, unidentified): (Vec<_>, Vec<_>) = server_bookmarks
            .into_iter()
            .partition(|b| b.server_id.is_some());
        for bookmark in &unidentified {
            warn!(edition_id, page = bookmark.page, "server bookmark without id skipped");
        }

        let local = self.store.bookmarks(edition_id).await?;
        let staged: Vec<NewBookmark> = if local.is_empty() {
            server_bookmarks.into_iter().map(NewBookmark::from).collect()
        } else {
            let mut taken: HashSet<u32> = local.iter().map(|b| b.page).collect();
            server_bookmarks
                .into_iter()
                .filter(|b| taken.insert(b.page))
                .map(NewBookmark::from)
                .collect()
        };

        let count = staged.len();
        self.store.insert_many(staged).await?;
        Ok(count)
    }
}
