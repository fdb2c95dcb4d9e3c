//! Job payload and output descriptor for one image transform.
//!
//! An [`ImageJob`] is what the submitter enqueues; an [`OutputDescriptor`]
//! is what the transform unit hands back and the batch tracker stores.

use serde::{Deserialize, Serialize};

use crate::batch::GroupKey;
use crate::error::CoreError;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Maximum length of a source URL.
const MAX_URL_LEN: usize = 2048;

/// Maximum length of a request, group or item identifier.
const MAX_ID_LEN: usize = 128;

/// URL schemes a source may use.
const ALLOWED_SCHEMES: &[&str] = &["http://", "https://", "file://"];

/// Failure reason recorded for a job whose final lease expired.
pub const LEASE_EXPIRED_REASON: &str = "lease expired after final attempt";

// ---------------------------------------------------------------------------
// ImageJob
// ---------------------------------------------------------------------------

/// One unit of queued work: transcode the image at `url`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageJob {
    /// Source location of the input image.
    pub url: String,
    /// Identifies the originating batch upload.
    pub request_id: String,
    /// Sub-batch reported together in one webhook (a product).
    pub group_id: String,
    /// Optional caller-side identifier for the item.
    #[serde(default)]
    pub item_id: Option<String>,
}

impl ImageJob {
    pub fn new(
        url: impl Into<String>,
        request_id: impl Into<String>,
        group_id: impl Into<String>,
    ) -> Self {
        Self {
            url: url.into(),
            request_id: request_id.into(),
            group_id: group_id.into(),
            item_id: None,
        }
    }

    pub fn with_item_id(mut self, item_id: impl Into<String>) -> Self {
        self.item_id = Some(item_id.into());
        self
    }

    /// The tracker entry this job reports into.
    pub fn group_key(&self) -> GroupKey {
        GroupKey::new(&self.request_id, &self.group_id)
    }

    /// Validate the payload before it is enqueued.
    ///
    /// Rules:
    /// - `url` must be non-empty, at most `MAX_URL_LEN` bytes, and use an
    ///   http, https or file scheme.
    /// - `request_id` and `group_id` must be non-empty and at most
    ///   `MAX_ID_LEN` bytes; `item_id`, when present, likewise.
    pub fn validate(&self) -> Result<(), CoreError> {
        let url = self.url.trim();
        if url.is_empty() {
            return Err(CoreError::Validation("Job url must not be empty".into()));
        }
        if url.len() > MAX_URL_LEN {
            return Err(CoreError::Validation(format!(
                "Job url must not exceed {MAX_URL_LEN} characters"
            )));
        }
        if !ALLOWED_SCHEMES.iter().any(|s| url.starts_with(s)) {
            return Err(CoreError::Validation(format!(
                "Job url '{url}' must use one of: {ALLOWED_SCHEMES:?}"
            )));
        }
        validate_id("request_id", &self.request_id)?;
        validate_id("group_id", &self.group_id)?;
        if let Some(item_id) = &self.item_id {
            validate_id("item_id", item_id)?;
        }
        Ok(())
    }
}

/// Ensure an identifier is non-blank and bounded.
pub fn validate_id(field: &str, value: &str) -> Result<(), CoreError> {
    if value.trim().is_empty() {
        return Err(CoreError::Validation(format!("{field} must not be empty")));
    }
    if value.len() > MAX_ID_LEN {
        return Err(CoreError::Validation(format!(
            "{field} must not exceed {MAX_ID_LEN} characters"
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// OutputDescriptor
// ---------------------------------------------------------------------------

/// Result of one successful transform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputDescriptor {
    pub request_id: String,
    pub group_id: String,
    pub item_id: Option<String>,
    /// Where the re-encoded image was persisted (path or public URL).
    pub output_location: String,
}

impl OutputDescriptor {
    /// Describe the output produced for `job`.
    pub fn for_job(job: &ImageJob, output_location: impl Into<String>) -> Self {
        Self {
            request_id: job.request_id.clone(),
            group_id: job.group_id.clone(),
            item_id: job.item_id.clone(),
            output_location: output_location.into(),
        }
    }

    pub fn group_key(&self) -> GroupKey {
        GroupKey::new(&self.request_id, &self.group_id)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> ImageJob {
        ImageJob::new("https://cdn.example.com/a.png", "req-1", "prod-1")
    }

    #[test]
    fn valid_job_passes() {
        assert!(job().validate().is_ok());
        assert!(job().with_item_id("sku-9").validate().is_ok());
    }

    #[test]
    fn empty_url_rejected() {
        let mut j = job();
        j.url = "   ".into();
        assert!(j.validate().is_err());
    }

    #[test]
    fn unsupported_scheme_rejected() {
        let mut j = job();
        j.url = "ftp://example.com/a.png".into();
        let err = j.validate().unwrap_err();
        assert!(err.to_string().contains("must use one of"));
    }

    #[test]
    fn file_scheme_accepted() {
        let mut j = job();
        j.url = "file:///tmp/a.png".into();
        assert!(j.validate().is_ok());
    }

    #[test]
    fn blank_group_rejected() {
        let mut j = job();
        j.group_id = String::new();
        let err = j.validate().unwrap_err();
        assert_eq!(err.to_string(), "Validation failed: group_id must not be empty");
    }

    #[test]
    fn overlong_item_id_rejected() {
        let j = job().with_item_id("x".repeat(MAX_ID_LEN + 1));
        assert!(j.validate().is_err());
    }

    #[test]
    fn item_id_defaults_when_missing_from_json() {
        let j: ImageJob = serde_json::from_str(
            r#"{"url":"http://x/y.png","request_id":"r","group_id":"g"}"#,
        )
        .unwrap();
        assert!(j.item_id.is_none());
    }

    #[test]
    fn descriptor_copies_identity_from_job() {
        let j = job().with_item_id("sku-9");
        let out = OutputDescriptor::for_job(&j, "/out/output-1.jpg");
        assert_eq!(out.request_id, "req-1");
        assert_eq!(out.group_id, "prod-1");
        assert_eq!(out.item_id.as_deref(), Some("sku-9"));
        assert_eq!(out.group_key(), j.group_key());
    }
}
