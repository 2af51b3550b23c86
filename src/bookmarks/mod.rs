//! Bookmarks and reading positions, kept consistent between the local store
//! and the server.

pub mod reconciler;
pub mod remote;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::EditionId;

pub use reconciler::BookmarkSync;
pub use remote::{HttpReaderApi, ReaderApi};

pub type LocalId = u64;
pub type ServerId = i64;

/// A bookmark row in the local store.
///
/// `server_id` is `None` until the bookmark has been pushed. `to_remove`
/// marks a bookmark whose deletion still has to reach the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bookmark {
    pub local_id: LocalId,
    pub server_id: Option<ServerId>,
    pub edition_id: EditionId,
    pub page: u32,
    pub to_remove: bool,
}

impl Bookmark {
    pub fn is_synchronized(&self) -> bool {
        self.server_id.is_some()
    }
}

/// A bookmark about to be inserted; the store assigns the local id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewBookmark {
    pub server_id: Option<ServerId>,
    pub edition_id: EditionId,
    pub page: u32,
}

impl NewBookmark {
    pub fn local(edition_id: EditionId, page: u32) -> Self {
        Self {
            server_id: None,
            edition_id,
            page,
        }
    }
}

/// Bookmark as exchanged with the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteBookmark {
    #[serde(rename = "bookmarkId", default, skip_serializing_if = "Option::is_none")]
    pub server_id: Option<ServerId>,
    #[serde(rename = "releaseId")]
    pub edition_id: EditionId,
    pub page: u32,
}

impl From<&Bookmark> for RemoteBookmark {
    fn from(bookmark: &Bookmark) -> Self {
        Self {
            server_id: bookmark.server_id,
            edition_id: bookmark.edition_id,
            page: bookmark.page,
        }
    }
}

impl From<RemoteBookmark> for NewBookmark {
    fn from(remote: RemoteBookmark) -> Self {
        Self {
            server_id: remote.server_id,
            edition_id: remote.edition_id,
            page: remote.page,
        }
    }
}

/// Most recent reading position for an edition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastPage {
    #[serde(rename = "releaseId")]
    pub edition_id: EditionId,
    pub page: u32,
}

/// Local bookmark table.
///
/// Queries other than `marked_to_remove` and `get` never return tombstoned
/// rows. Inserts silently drop a row whose server id is already present.
#[async_trait]
pub trait BookmarkStore: Send + Sync {
    async fn get(&self, local_id: LocalId) -> Result<Option<Bookmark>, StoreError>;

    /// Live bookmarks of the edition ordered by page.
    async fn bookmarks(&self, edition_id: EditionId) -> Result<Vec<Bookmark>, StoreError>;

    /// Live bookmarks that were never pushed, in insertion order.
    async fn local_bookmarks(&self, edition_id: EditionId) -> Result<Vec<Bookmark>, StoreError>;

    /// Live bookmarks that carry a server id.
    async fn synchronized_bookmarks(&self, edition_id: EditionId) -> Result<Vec<Bookmark>, StoreError>;

    async fn marked_to_remove(&self, edition_id: EditionId) -> Result<Vec<Bookmark>, StoreError>;

    async fn insert(&self, bookmark: NewBookmark) -> Result<(), StoreError> {
        self.insert_many(vec![bookmark]).await
    }

    async fn insert_many(&self, bookmarks: Vec<NewBookmark>) -> Result<(), StoreError>;

    async fn update_server_id(&self, local_id: LocalId, server_id: ServerId) -> Result<(), StoreError>;

    async fn mark_to_remove(&self, local_id: LocalId) -> Result<(), StoreError>;

    async fn delete_many(&self, local_ids: &[LocalId]) -> Result<(), StoreError>;

    async fn delete_marked_to_remove(&self, edition_id: EditionId) -> Result<(), StoreError>;
}
