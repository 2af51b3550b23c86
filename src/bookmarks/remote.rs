use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use url::Url;

use super::{Bookmark, LastPage, RemoteBookmark, ServerId};
use crate::error::ApiError;
use crate::transport::{build_client, with_token};
use crate::EditionId;

/// Server side of bookmarks and reading positions.
#[async_trait]
pub trait ReaderApi: Send + Sync {
    /// Bookmarks of the edition, ordered by page.
    async fn list_bookmarks(&self, edition_id: EditionId) -> Result<Vec<RemoteBookmark>, ApiError>;

    /// Creates the bookmarks; returns one server id per input, in input order.
    async fn create_bookmarks(&self, bookmarks: &[Bookmark]) -> Result<Vec<ServerId>, ApiError>;

    async fn delete_bookmarks(&self, server_ids: &[ServerId]) -> Result<(), ApiError>;

    async fn last_page(&self, edition_id: EditionId) -> Result<LastPage, ApiError>;

    async fn post_last_page(&self, last_page: LastPage) -> Result<(), ApiError>;
}

#[derive(Clone)]
pub struct HttpReaderApi {
    client: Client,
    base: Url,
    token: Option<String>,
}

impl HttpReaderApi {
    pub fn new(base: Url, token: Option<String>) -> Self {
        Self {
            client: build_client(),
            base,
            token,
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> Result<reqwest::RequestBuilder, ApiError> {
        let url = self.base.join(path)?;
        Ok(with_token(self.client.request(method, url), self.token.as_deref()))
    }

    async fn send(request: reqwest::RequestBuilder) -> Result<reqwest::Response, ApiError> {
        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(ApiError::Status(response.status().as_u16()));
        }
        Ok(response)
    }

    async fn send_json<T: DeserializeOwned>(request: reqwest::RequestBuilder) -> Result<T, ApiError> {
        Ok(Self::send(request).await?.json().await?)
    }
}

#[async_trait]
impl ReaderApi for HttpReaderApi {
    async fn list_bookmarks(&self, edition_id: EditionId) -> Result<Vec<RemoteBookmark>, ApiError> {
        let request = self
            .request(reqwest::Method::GET, "api/v1/bookmarks")?
            .query(&[("releaseId", edition_id)]);
        Self::send_json(request).await
    }

    async fn create_bookmarks(&self, bookmarks: &[Bookmark]) -> Result<Vec<ServerId>, ApiError> {
        let body: Vec<RemoteBookmark> = bookmarks.iter().map(RemoteBookmark::from).collect();
        let request = self
            .request(reqwest::Method::POST, "api/v1/bookmarks")?
            .json(&body);
        Self::send_json(request).await
    }

    async fn delete_bookmarks(&self, server_ids: &[ServerId]) -> Result<(), ApiError> {
        let query: Vec<(&str, ServerId)> = server_ids.iter().map(|id| ("bookmarkIds", *id)).collect();
        let request = self
            .request(reqwest::Method::DELETE, "api/v1/bookmarks")?
            .query(&query);
        Self::send(request).await?;
        Ok(())
    }

    async fn last_page(&self, edition_id: EditionId) -> Result<LastPage, ApiError> {
        let request = self
            .request(reqwest::Method::GET, "api/v1/reader/last-page")?
            .query(&[("releaseId", edition_id)]);
        Self::send_json(request).await
    }

    async fn post_last_page(&self, last_page: LastPage) -> Result<(), ApiError> {
        let request = self
            .request(reqwest::Method::POST, "api/v1/reader/last-page")?
            .json(&last_page);
        Self::send(request).await?;
        Ok(())
    }
}
