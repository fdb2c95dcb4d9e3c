//! Output persistence.

use std::path::PathBuf;

use async_trait::async_trait;
use uuid::Uuid;

use super::TransformError;

/// Persists an encoded output and returns its location.
#[async_trait]
pub trait OutputStore: Send + Sync {
    async fn store(&self, bytes: Vec<u8>) -> Result<String, TransformError>;
}

/// Writes outputs as `output-{uuid}.jpg` into a local directory.
///
/// The returned location is `{base_url}/{file}` when a public base URL is
/// configured, otherwise the file path.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    dir: PathBuf,
    base_url: Option<String>,
}

impl LocalStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            base_url: None,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into().trim_end_matches('/').to_string());
        self
    }

    pub fn dir(&self) -> &PathBuf {
        &self.dir
    }
}

#[async_trait]
impl OutputStore for LocalStorage {
    async fn store(&self, bytes: Vec<u8>) -> Result<String, TransformError> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let file_name = format!("output-{}.jpg", Uuid::new_v4());
        let path = self.dir.join(&file_name);
        tokio::fs::write(&path, bytes).await?;

        Ok(match &self.base_url {
            Some(base) => format!("{base}/{file_name}"),
            None => path.display().to_string(),
        })
    }
}
