//! Attachment uploads to external object storage
//!
//! [`AttachmentUploader`] validates the attachment, picks an object key and
//! hands the bytes to an [`ObjectStorage`] collaborator. It never retries;
//! the orchestrator decides whether a failed upload is attempted again.
//!
//! Progress reaches the caller as whole percentages that never decrease and
//! never hit 100 until the collaborator has reported success.

use crate::config::UploadConfig;
use async_trait::async_trait;
use chrono::Utc;
use courier_core::{DeliveryError, DeliveryResult, UploadError};
use futures_util::stream::{self, StreamExt};
use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Receives `(bytes_sent, bytes_total)` while a transfer is running.
pub type ProgressSink = Arc<dyn Fn(u64, u64) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadObject {
    pub key: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Store the object and return its durable URL.
    async fn put(&self, object: UploadObject, progress: ProgressSink) -> Result<String, UploadError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedAttachment {
    pub url: String,
    pub key: String,
    pub size: u64,
}

/// Media class of an attachment, used as the object key prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaClass {
    Image,
    Voice,
    Video,
    File,
}

impl MediaClass {
    pub fn from_mime(mime_type: &str) -> Self {
        let top = mime_type.split('/').next().unwrap_or_default();
        match top {
            "image" => MediaClass::Image,
            "audio" => MediaClass::Voice,
            "video" => MediaClass::Video,
            _ => MediaClass::File,
        }
    }

    pub fn prefix(self) -> &'static str {
        match self {
            MediaClass::Image => "images/",
            MediaClass::Voice => "voices/",
            MediaClass::Video => "videos/",
            MediaClass::File => "files/",
        }
    }
}

const BLOCKED_TYPES: &[&str] = &[
    "application/x-msdownload",
    "application/x-executable",
    "application/x-sh",
    "application/x-msi",
];

/// Turns raw transfer counts into monotonic percentages in `[0, 99]`.
struct ProgressTracker<F> {
    last: AtomicU8,
    on_progress: F,
}

impl<F> ProgressTracker<F>
where
    F: Fn(u8) + Send + Sync,
{
    fn new(on_progress: F) -> Self {
        Self {
            last: AtomicU8::new(0),
            on_progress,
        }
    }

    fn report(&self, sent: u64, total: u64) {
        if total == 0 {
            return;
        }
        let percent = ((sent.min(total) * 100) / total).min(99) as u8;
        let previous = self.last.fetch_max(percent, Ordering::SeqCst);
        if percent > previous {
            (self.on_progress)(percent);
        }
    }

    fn complete(&self) {
        self.last.store(100, Ordering::SeqCst);
        (self.on_progress)(100);
    }
}

#[derive(Clone)]
pub struct AttachmentUploader {
    storage: Arc<dyn ObjectStorage>,
    max_attachment_bytes: u64,
}

impl AttachmentUploader {
    pub fn new(storage: Arc<dyn ObjectStorage>, max_attachment_bytes: u64) -> Self {
        Self {
            storage,
            max_attachment_bytes,
        }
    }

    pub fn max_attachment_bytes(&self) -> u64 {
        self.max_attachment_bytes
    }

    /// Size and type checks done before any transfer.
    pub fn validate(&self, size: u64, mime_type: &str) -> Result<(), UploadError> {
        if size > self.max_attachment_bytes {
            return Err(UploadError::TooLarge {
                size,
                limit: self.max_attachment_bytes,
            });
        }

        let mut parts = mime_type.splitn(2, '/');
        let well_formed = matches!(
            (parts.next(), parts.next()),
            (Some(top), Some(sub)) if !top.is_empty() && !sub.is_empty()
        );
        if !well_formed || BLOCKED_TYPES.contains(&mime_type) {
            return Err(UploadError::UnsupportedType(mime_type.to_string()));
        }
        Ok(())
    }

    pub fn object_key(mime_type: &str, file_name: &str) -> String {
        let sanitized: String = file_name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
            .collect();
        format!(
            "{}{}_{}",
            MediaClass::from_mime(mime_type).prefix(),
            Utc::now().timestamp_millis(),
            sanitized
        )
    }

    pub async fn upload<F>(
        &self,
        bytes: &[u8],
        mime_type: &str,
        file_name: &str,
        on_progress: F,
    ) -> Result<UploadedAttachment, UploadError>
    where
        F: Fn(u8) + Send + Sync + 'static,
    {
        let size = bytes.len() as u64;
        self.validate(size, mime_type)?;

        let key = Self::object_key(mime_type, file_name);
        let tracker = Arc::new(ProgressTracker::new(on_progress));
        let sink: ProgressSink = {
            let tracker = tracker.clone();
            Arc::new(move |sent, total| tracker.report(sent, total))
        };

        tracing::debug!("Uploading {} ({} bytes) as {}", file_name, size, key);

        let url = self
            .storage
            .put(
                UploadObject {
                    key: key.clone(),
                    mime_type: mime_type.to_string(),
                    bytes: bytes.to_vec(),
                },
                sink,
            )
            .await?;

        tracker.complete();
        tracing::info!("Uploaded {} to {}", key, url);

        Ok(UploadedAttachment { url, key, size })
    }
}

/// Object storage reached over plain HTTP PUT.
pub struct HttpObjectStorage {
    http: reqwest::Client,
    endpoint: String,
    bucket: String,
    public_base_url: String,
    chunk_size: usize,
    max_attachment_bytes: u64,
}

impl HttpObjectStorage {
    pub fn new(config: &UploadConfig) -> DeliveryResult<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(300))
            .build()
            .map_err(|e| DeliveryError::Config(format!("upload client: {}", e)))?;

        Ok(Self {
            http,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            bucket: config.bucket.clone(),
            public_base_url: config.public_base_url.trim_end_matches('/').to_string(),
            chunk_size: config.chunk_size.max(1),
            max_attachment_bytes: config.max_attachment_bytes,
        })
    }

    fn map_status(&self, status: StatusCode, size: u64, mime_type: &str, body: String) -> UploadError {
        match status {
            StatusCode::PAYLOAD_TOO_LARGE => UploadError::TooLarge {
                size,
                limit: self.max_attachment_bytes,
            },
            StatusCode::UNSUPPORTED_MEDIA_TYPE => UploadError::UnsupportedType(mime_type.to_string()),
            other => UploadError::Rejected {
                status: other.as_u16(),
                reason: if body.is_empty() {
                    other.to_string()
                } else {
                    body
                },
            },
        }
    }
}

#[async_trait]
impl ObjectStorage for HttpObjectStorage {
    async fn put(&self, object: UploadObject, progress: ProgressSink) -> Result<String, UploadError> {
        let total = object.bytes.len() as u64;
        let chunks: Vec<Vec<u8>> = object
            .bytes
            .chunks(self.chunk_size)
            .map(|chunk| chunk.to_vec())
            .collect();

        let mut sent = 0u64;
        let body = stream::iter(chunks).map(move |chunk| {
            sent += chunk.len() as u64;
            progress(sent, total);
            Ok::<_, std::io::Error>(chunk)
        });

        let url = format!("{}/{}/{}", self.endpoint, self.bucket, object.key);
        let response = self
            .http
            .put(&url)
            .header(CONTENT_TYPE, object.mime_type.as_str())
            .body(reqwest::Body::wrap_stream(body))
            .send()
            .await
            .map_err(|e| UploadError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(self.map_status(status, total, &object.mime_type, body));
        }

        Ok(format!("{}/{}", self.public_base_url, object.key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct ChunkedStorage {
        chunks: u64,
        fail_with: Option<UploadError>,
    }

    #[async_trait]
    impl ObjectStorage for ChunkedStorage {
        async fn put(&self, object: UploadObject, progress: ProgressSink) -> Result<String, UploadError> {
            let total = object.bytes.len() as u64;
            // Report out of order and past the end to exercise clamping.
            progress(total / 2, total);
            progress(total / 4, total);
            for i in 1..=self.chunks {
                progress(total * i / self.chunks, total);
            }
            progress(total * 2, total);

            match &self.fail_with {
                Some(err) => Err(err.clone()),
                None => Ok(format!("https://cdn.example/{}", object.key)),
            }
        }
    }

    fn recorder() -> (Arc<Mutex<Vec<u8>>>, impl Fn(u8) + Send + Sync + 'static) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        (seen, move |p| sink.lock().unwrap().push(p))
    }

    #[tokio::test]
    async fn test_progress_is_monotonic_and_ends_at_100() {
        let uploader = AttachmentUploader::new(Arc::new(ChunkedStorage { chunks: 4, fail_with: None }), 1024 * 1024);
        let (seen, on_progress) = recorder();

        let uploaded = uploader
            .upload(&vec![1u8; 4000], "audio/ogg", "voice.ogg", on_progress)
            .await
            .unwrap();

        assert!(uploaded.key.starts_with("voices/"));
        assert!(uploaded.url.ends_with(&uploaded.key));
        assert_eq!(uploaded.size, 4000);

        let seen = seen.lock().unwrap();
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(seen.last(), Some(&100));
        assert_eq!(seen.iter().filter(|p| **p == 100).count(), 1);
    }

    #[tokio::test]
    async fn test_failed_upload_never_reports_100() {
        let failure = UploadError::Rejected {
            status: 500,
            reason: "boom".into(),
        };
        let uploader = AttachmentUploader::new(
            Arc::new(ChunkedStorage {
                chunks: 2,
                fail_with: Some(failure.clone()),
            }),
            1024,
        );
        let (seen, on_progress) = recorder();

        let result = uploader.upload(&[0u8; 100], "image/png", "a.png", on_progress).await;

        assert_eq!(result, Err(failure));
        assert!(seen.lock().unwrap().iter().all(|p| *p < 100));
    }

    #[tokio::test]
    async fn test_oversized_attachment_is_rejected_before_transfer() {
        let uploader = AttachmentUploader::new(Arc::new(ChunkedStorage { chunks: 1, fail_with: None }), 10);
        let (seen, on_progress) = recorder();

        let result = uploader.upload(&[0u8; 11], "audio/ogg", "v.ogg", on_progress).await;

        assert_eq!(result, Err(UploadError::TooLarge { size: 11, limit: 10 }));
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_validate_rejects_malformed_and_blocked_types() {
        let uploader = AttachmentUploader::new(Arc::new(ChunkedStorage { chunks: 1, fail_with: None }), 10);

        assert!(uploader.validate(5, "application/pdf").is_ok());
        assert!(matches!(uploader.validate(5, "pdf"), Err(UploadError::UnsupportedType(_))));
        assert!(matches!(uploader.validate(5, ""), Err(UploadError::UnsupportedType(_))));
        assert!(matches!(
            uploader.validate(5, "application/x-msdownload"),
            Err(UploadError::UnsupportedType(_))
        ));
    }

    #[test]
    fn test_object_key_prefix_by_media_class() {
        assert!(AttachmentUploader::object_key("image/jpeg", "cat.jpg").starts_with("images/"));
        assert!(AttachmentUploader::object_key("video/mp4", "clip.mp4").starts_with("videos/"));
        assert!(AttachmentUploader::object_key("application/pdf", "doc.pdf").starts_with("files/"));

        let key = AttachmentUploader::object_key("audio/webm", "my voice (1).webm");
        assert!(key.starts_with("voices/"));
        assert!(key.ends_with("_my_voice__1_.webm"));
    }
}
