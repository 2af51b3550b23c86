use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::TryStreamExt;
use reqwest::{header, Client};
use tokio::io::AsyncRead;
use tokio_util::io::StreamReader;
use url::Url;

use crate::error::TransportError;
use crate::EditionId;

pub type BodyReader = Pin<Box<dyn AsyncRead + Send>>;

/// A successful file response: the declared length and a streamed body.
pub struct FileBody {
    pub content_length: Option<u64>,
    pub reader: BodyReader,
}

/// Remote endpoint serving edition files.
#[async_trait]
pub trait FileSource: Send + Sync {
    async fn fetch(&self, id: EditionId) -> Result<FileBody, TransportError>;
}

pub(crate) fn build_client() -> Client {
    Client::builder()
        .user_agent(concat!("psync/", env!("CARGO_PKG_VERSION")))
        .connect_timeout(Duration::from_secs(10))
        .build()
        .unwrap_or_else(|_| Client::new())
}

pub(crate) fn with_token(request: reqwest::RequestBuilder, token: Option<&str>) -> reqwest::RequestBuilder {
    match token {
        Some(token) => request.header(header::AUTHORIZATION, format!("Bearer {}", token)),
        None => request,
    }
}

/// Streams release files from `/api/v1/subscriptions/releases/{id}/file`.
#[derive(Clone)]
pub struct HttpFileSource {
    client: Client,
    base: Url,
    token: Option<String>,
}

impl HttpFileSource {
    pub fn new(base: Url, token: Option<String>) -> Self {
        Self {
            client: build_client(),
            base,
            token,
        }
    }
}

#[async_trait]
impl FileSource for HttpFileSource {
    async fn fetch(&self, id: EditionId) -> Result<FileBody, TransportError> {
        let url = self
            .base
            .join(&format!("api/v1/subscriptions/releases/{}/file", id))?;
        let response = with_token(self.client.get(url), self.token.as_deref())
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(TransportError::Status(response.status().as_u16()));
        }

        let content_length = response.content_length();
        let stream = response
            .bytes_stream()
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err));
        Ok(FileBody {
            content_length,
            reader: Box::pin(StreamReader::new(stream)),
        })
    }
}
