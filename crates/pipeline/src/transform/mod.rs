//! The per-item transform: fetch, re-encode as JPEG, persist.
//!
//! [`TransformUnit`] holds no shared mutable state. Every failure is
//! returned as a [`TransformError`] so the queue's retry policy sees it.

use std::io::Cursor;
use std::sync::Arc;

use image::codecs::jpeg::JpegEncoder;
use image::DynamicImage;
use pixelbatch_core::job::{ImageJob, OutputDescriptor};

pub mod fetch;
pub mod storage;

pub use fetch::{SourceFetcher, UrlFetcher, DEFAULT_FETCH_TIMEOUT};
pub use storage::{LocalStorage, OutputStore};

/// Default JPEG quality for re-encoded outputs.
pub const DEFAULT_JPEG_QUALITY: u8 = 50;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum TransformError {
    #[error("Source fetch failed: {0}")]
    Fetch(#[from] reqwest::Error),

    #[error("Source {url} returned HTTP {status}")]
    FetchStatus { url: String, status: u16 },

    #[error("Unsupported source url: {0}")]
    UnsupportedUrl(String),

    #[error("Image could not be transcoded: {0}")]
    Image(#[from] image::ImageError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Transcode task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

// ---------------------------------------------------------------------------
// Transcode
// ---------------------------------------------------------------------------

/// Decode any supported format and re-encode as baseline JPEG at `quality`.
///
/// Alpha is dropped; JPEG has no alpha channel.
pub fn transcode_jpeg(bytes: &[u8], quality: u8) -> Result<Vec<u8>, image::ImageError> {
    let decoded = image::load_from_memory(bytes)?;
    let rgb = DynamicImage::ImageRgb8(decoded.to_rgb8());

    let mut out = Cursor::new(Vec::new());
    rgb.write_with_encoder(JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100)))?;
    Ok(out.into_inner())
}

// ---------------------------------------------------------------------------
// TransformUnit
// ---------------------------------------------------------------------------

pub struct TransformUnit {
    fetcher: Arc<dyn SourceFetcher>,
    store: Arc<dyn OutputStore>,
    quality: u8,
}

impl TransformUnit {
    pub fn new(fetcher: Arc<dyn SourceFetcher>, store: Arc<dyn OutputStore>) -> Self {
        Self {
            fetcher,
            store,
            quality: DEFAULT_JPEG_QUALITY,
        }
    }

    pub fn with_quality(mut self, quality: u8) -> Self {
        self.quality = quality;
        self
    }

    pub fn quality(&self) -> u8 {
        self.quality
    }

    /// Run the transform for one job.
    pub async fn run(&self, job: &ImageJob) -> Result<OutputDescriptor, TransformError> {
        let source = self.fetcher.fetch(&job.url).await?;
        let quality = self.quality;
        let encoded =
            tokio::task::spawn_blocking(move || transcode_jpeg(&source, quality)).await??;
        let location = self.store.store(encoded).await?;

        tracing::debug!(
            request_id = %job.request_id,
            group_id = %job.group_id,
            location = %location,
            "Image transcoded",
        );
        Ok(OutputDescriptor::for_job(job, location))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
