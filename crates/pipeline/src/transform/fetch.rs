//! Source retrieval.

use std::time::Duration;

use async_trait::async_trait;

use super::TransformError;

/// Retrieves the raw bytes of a source image.
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, TransformError>;
}

/// Fetches `http(s)://` sources with reqwest and `file://` sources from
/// the local filesystem.
pub struct UrlFetcher {
    client: reqwest::Client,
}

/// Default bound on one source download, headers and body included.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

impl UrlFetcher {
    /// Create a fetcher whose HTTP requests give up after `timeout`.
    pub fn new(timeout: Duration) -> Result<Self, TransformError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SourceFetcher for UrlFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, TransformError> {
        if let Some(path) = url.strip_prefix("file://") {
            return Ok(tokio::fs::read(path).await?);
        }
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(TransformError::UnsupportedUrl(url.to_string()));
        }

        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransformError::FetchStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        Ok(response.bytes().await?.to_vec())
    }
}
