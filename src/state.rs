use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::debug;

use crate::bookmarks::{Bookmark, BookmarkStore, LocalId, NewBookmark, ServerId};
use crate::error::StoreError;
use crate::EditionId;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DownloadedEdition {
    pub edition_id: EditionId,
    pub publication_id: String,
    pub downloaded_at: DateTime<Utc>,
}

/// Persistent "edition X is downloaded" flags.
#[async_trait]
pub trait DownloadRegistry: Send + Sync {
    async fn mark_downloaded(&self, edition_id: EditionId, publication_id: &str) -> Result<(), StoreError>;

    async fn clear_downloaded(&self, edition_id: EditionId) -> Result<(), StoreError>;

    async fn downloaded_editions(&self) -> Result<Vec<DownloadedEdition>, StoreError>;
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
struct StoreDocument {
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    next_local_id: LocalId,
    #[serde(default)]
    bookmarks: Vec<Bookmark>,
    #[serde(default)]
    downloaded: BTreeMap<EditionId, DownloadedEdition>,
}

/// Record store for bookmarks, downloaded flags and preferences.
///
/// Either purely in memory or backed by a JSON document that is rewritten
/// after every mutation.
pub struct LocalStore {
    path: Option<PathBuf>,
    doc: Mutex<StoreDocument>,
}

impl LocalStore {
    pub fn in_memory() -> Self {
        Self {
            path: None,
            doc: Mutex::new(StoreDocument {
                next_local_id: 1,
                ..StoreDocument::default()
            }),
        }
    }

    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let mut doc = match fs::read_to_string(&path).await {
            Ok(content) => serde_json::from_str::<StoreDocument>(&content)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => StoreDocument::default(),
            Err(err) => return Err(err.into()),
        };
        let highest = doc.bookmarks.iter().map(|b| b.local_id).max().unwrap_or(0);
        doc.next_local_id = doc.next_local_id.max(highest + 1);
        debug!(path = %path.display(), bookmarks = doc.bookmarks.len(), "opened local store");
        Ok(Self {
            path: Some(path),
            doc: Mutex::new(doc),
        })
    }

    pub async fn username(&self) -> Option<String> {
        self.doc.lock().await.username.clone()
    }

    pub async fn set_username(&self, username: &str) -> Result<(), StoreError> {
        self.mutate(|doc| doc.username = Some(username.to_string())).await
    }

    async fn query(&self, filter: impl Fn(&Bookmark) -> bool) -> Vec<Bookmark> {
        let doc = self.doc.lock().await;
        doc.bookmarks.iter().filter(|b| filter(*b)).cloned().collect()
    }

    /// Applies `apply` to a copy of the document and installs the copy only
    /// once it is on disk.
    async fn mutate<T>(&self, apply: impl FnOnce(&mut StoreDocument) -> T) -> Result<T, StoreError> {
        let mut doc = self.doc.lock().await;
        let mut next = doc.clone();
        let out = apply(&mut next);
        if let Some(path) = &self.path {
            persist(path, &next).await?;
        }
        *doc = next;
        Ok(out)
    }
}

async fn persist(path: &Path, doc: &StoreDocument) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await?;
        }
    }
    let content = serde_json::to_string_pretty(doc)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, content).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}

#[async_trait]
impl BookmarkStore for LocalStore {
    async fn get(&self, local_id: LocalId) -> Result<Option<Bookmark>, StoreError> {
        Ok(self.query(|b| b.local_id == local_id).await.into_iter().next())
    }

    async fn bookmarks(&self, edition_id: EditionId) -> Result<Vec<Bookmark>, StoreError> {
        let mut list = self
            .query(|b| b.edition_id == edition_id && !b.to_remove)
            .await;
        list.sort_by_key(|b| (b.page, b.local_id));
        Ok(list)
    }

    async fn local_bookmarks(&self, edition_id: EditionId) -> Result<Vec<Bookmark>, StoreError> {
        Ok(self
            .query(|b| b.edition_id == edition_id && !b.to_remove && b.server_id.is_none())
            .await)
    }

    async fn synchronized_bookmarks(&self, edition_id: EditionId) -> Result<Vec<Bookmark>, StoreError> {
        Ok(self
            .query(|b| b.edition_id == edition_id && !b.to_remove && b.server_id.is_some())
            .await)
    }

    async fn marked_to_remove(&self, edition_id: EditionId) -> Result<Vec<Bookmark>, StoreError> {
        Ok(self
            .query(|b| b.edition_id == edition_id && b.to_remove)
            .await)
    }

    async fn insert_many(&self, bookmarks: Vec<NewBookmark>) -> Result<(), StoreError> {
        if bookmarks.is_empty() {
            return Ok(());
        }
        self.mutate(|doc| {
            for new in bookmarks {
                let duplicate = new.server_id.is_some()
                    && doc.bookmarks.iter().any(|b| b.server_id == new.server_id);
                if duplicate {
                    continue;
                }
                let local_id = doc.next_local_id.max(1);
                doc.next_local_id = local_id + 1;
                doc.bookmarks.push(Bookmark {
                    local_id,
                    server_id: new.server_id,
                    edition_id: new.edition_id,
                    page: new.page,
                    to_remove: false,
                });
            }
        })
        .await
    }

    async fn update_server_id(&self, local_id: LocalId, server_id: ServerId) -> Result<(), StoreError> {
        self.mutate(|doc| {
            if let Some(b) = doc.bookmarks.iter_mut().find(|b| b.local_id == local_id) {
                b.server_id = Some(server_id);
            }
        })
        .await
    }

    async fn mark_to_remove(&self, local_id: LocalId) -> Result<(), StoreError> {
        self.mutate(|doc| {
            if let Some(b) = doc.bookmarks.iter_mut().find(|b| b.local_id == local_id) {
                b.to_remove = true;
            }
        })
        .await
    }

    async fn delete_many(&self, local_ids: &[LocalId]) -> Result<(), StoreError> {
        if local_ids.is_empty() {
            return Ok(());
        }
        self.mutate(|doc| doc.bookmarks.retain(|b| !local_ids.contains(&b.local_id)))
            .await
    }

    async fn delete_marked_to_remove(&self, edition_id: EditionId) -> Result<(), StoreError> {
        self.mutate(|doc| {
            doc.bookmarks
                .retain(|b| !(b.edition_id == edition_id && b.to_remove))
        })
        .await
    }
}

#[async_trait]
impl DownloadRegistry for LocalStore {
    async fn mark_downloaded(&self, edition_id: EditionId, publication_id: &str) -> Result<(), StoreError> {
        let entry = DownloadedEdition {
            edition_id,
            publication_id: publication_id.to_string(),
            downloaded_at: Utc::now(),
        };
        self.mutate(|doc| {
            doc.downloaded.insert(edition_id, entry);
        })
        .await
    }

    async fn clear_downloaded(&self, edition_id: EditionId) -> Result<(), StoreError> {
        self.mutate(|doc| {
            doc.downloaded.remove(&edition_id);
        })
        .await
    }

    async fn downloaded_editions(&self) -> Result<Vec<DownloadedEdition>, StoreError> {
        Ok(self.doc.lock().await.downloaded.values().cloned().collect())
    }
}
