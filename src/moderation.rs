//! Content moderation side channel.
//!
//! Reviews run concurrently with the upload they belong to, but their result
//! is only applied after the upload commits. [`ModerationHook::start`]
//! returns a [`ModerationTicket`]; the upload path calls
//! [`ModerationTicket::commit`] once the document row exists, or drops the
//! ticket to discard the verdicts.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use bytes::Bytes;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::object_store::{Bucket, PutObjectInput};
use crate::storage::models::{DocumentLock, LockKind};
use crate::storage::Database;

#[derive(Debug, Error)]
pub enum ReviewError {
    #[error("Moderation request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("Moderation provider returned {status}: {body}")]
    Status { status: u16, body: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Verdict {
    Pass,
    Block {
        #[serde(default)]
        reason: String,
        #[serde(default)]
        words: Vec<String>,
    },
}

/// Black-box moderation provider.
#[async_trait]
pub trait ContentReviewer: Send + Sync {
    async fn review_text(&self, text: &str) -> Result<Verdict, ReviewError>;

    async fn review_image(&self, image: &[u8]) -> Result<Verdict, ReviewError>;
}

/// Reviewer backed by an HTTP moderation service.
///
/// `POST {base}/text` with `{"content": ...}` and `POST {base}/image` with
/// `{"image": <base64>}`; both answer with a [`Verdict`].
pub struct WebhookReviewer {
    base_url: String,
    client: reqwest::Client,
}

impl WebhookReviewer {
    pub fn new(
        base_url: impl Into<String>,
        connect_timeout: Duration,
        read_timeout: Duration,
    ) -> Result<Self, ReviewError> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(read_timeout)
            .build()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    async fn post(&self, path: &str, body: serde_json::Value) -> Result<Verdict, ReviewError> {
        let resp = self
            .client
            .post(format!("{}/{path}", self.base_url))
            .json(&body)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(ReviewError::Status { status, body });
        }
        Ok(resp.json().await?)
    }
}

#[async_trait]
impl ContentReviewer for WebhookReviewer {
    async fn review_text(&self, text: &str) -> Result<Verdict, ReviewError> {
        self.post("text", serde_json::json!({ "content": text }))
            .await
    }

    async fn review_image(&self, image: &[u8]) -> Result<Verdict, ReviewError> {
        let encoded = base64::engine::general_purpose::STANDARD.encode(image);
        self.post("image", serde_json::json!({ "image": encoded }))
            .await
    }
}

/// Everything a single upload hands to moderation.
#[derive(Debug, Clone, Default)]
pub struct ReviewJob {
    /// Storage prefix of the document.
    pub path: String,
    pub text: Option<String>,
    /// Rendered pages as `(page id, png)`.
    pub page_images: Vec<(String, Bytes)>,
    /// Media uploaded alongside the document, as `(name, bytes)`.
    pub medias: Vec<(String, Bytes)>,
    /// Media already in storage under `{path}/medias/`, fetched by the task.
    pub stored_media_names: Vec<String>,
}

impl ReviewJob {
    pub fn is_empty(&self) -> bool {
        self.text.as_deref().map_or(true, str::is_empty)
            && self.page_images.is_empty()
            && self.medias.is_empty()
            && self.stored_media_names.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModerationOutcome {
    /// The upload failed, nothing was applied.
    Abandoned,
    /// The lock set was replaced with these locks.
    Applied(Vec<DocumentLock>),
    /// The document vanished before the locks could be written.
    DocumentMissing,
    /// The verdicts could not be recorded.
    Failed,
}

/// Handle to a running review. Dropping it abandons the review.
pub struct ModerationTicket {
    commit: oneshot::Sender<i64>,
    handle: JoinHandle<ModerationOutcome>,
}

impl ModerationTicket {
    /// Release the verdicts for `document_id`.
    pub fn commit(self, document_id: i64) -> JoinHandle<ModerationOutcome> {
        // The task only exits early by panicking; the handle reports that.
        let _ = self.commit.send(document_id);
        self.handle
    }
}

#[derive(Clone)]
pub struct ModerationHook {
    reviewer: Arc<dyn ContentReviewer>,
    bucket: Arc<dyn Bucket>,
    db: Database,
}

impl ModerationHook {
    pub fn new(reviewer: Arc<dyn ContentReviewer>, bucket: Arc<dyn Bucket>, db: Database) -> Self {
        Self {
            reviewer,
            bucket,
            db,
        }
    }

    /// Start reviewing `job` in the background. Returns `None` when there is
    /// nothing to review.
    pub fn start(&self, job: ReviewJob) -> Option<ModerationTicket> {
        if job.is_empty() {
            return None;
        }

        let (commit, committed) = oneshot::channel();
        let hook = self.clone();
        let handle = tokio::spawn(async move { hook.run(job, committed).await });
        Some(ModerationTicket { commit, handle })
    }

    async fn run(self, mut job: ReviewJob, committed: oneshot::Receiver<i64>) -> ModerationOutcome {
        for name in std::mem::take(&mut job.stored_media_names) {
            let key = format!("{}/medias/{name}", job.path);
            match self.bucket.get_object(&key).await {
                Ok(data) => job.medias.push((name, data)),
                Err(e) => warn!(key = %key, error = %e, "Failed to fetch media for review"),
            }
        }

        let locks = self.review(&job).await;

        let Ok(document_id) = committed.await else {
            debug!(path = %job.path, "Upload did not commit, discarding review");
            return ModerationOutcome::Abandoned;
        };

        for (page_id, png) in &job.page_images {
            let key = format!("{}/page_image/{page_id}.png", job.path);
            let input = PutObjectInput {
                name: key.clone(),
                data: png.clone(),
                content_type: Some("image/png".to_string()),
            };
            if let Err(e) = self.bucket.put_object(input).await {
                warn!(key = %key, error = %e, "Failed to store page image");
            }
        }

        match self.db.set_locks(document_id, locks.clone()) {
            Ok(true) => {
                if !locks.is_empty() {
                    info!(document_id, locks = locks.len(), "Document locked by moderation");
                }
                ModerationOutcome::Applied(locks)
            }
            Ok(false) => ModerationOutcome::DocumentMissing,
            Err(e) => {
                warn!(document_id, error = %e, "Failed to record moderation result");
                ModerationOutcome::Failed
            }
        }
    }

    async fn review(&self, job: &ReviewJob) -> Vec<DocumentLock> {
        let mut locks = Vec::new();

        if let Some(text) = job.text.as_deref().filter(|t| !t.is_empty()) {
            match self.reviewer.review_text(text).await {
                Ok(verdict) => push_lock(&mut locks, verdict, LockKind::Text, None),
                Err(e) => warn!(path = %job.path, error = %e, "Text review failed"),
            }
        }

        for (page_id, png) in &job.page_images {
            match self.reviewer.review_image(png).await {
                Ok(verdict) => push_lock(&mut locks, verdict, LockKind::Page, Some(page_id)),
                Err(e) => warn!(page_id = %page_id, error = %e, "Page review failed"),
            }
        }

        for (name, data) in &job.medias {
            if data.is_empty() {
                continue;
            }
            match self.reviewer.review_image(data).await {
                Ok(verdict) => push_lock(&mut locks, verdict, LockKind::Media, Some(name)),
                Err(e) => warn!(media = %name, error = %e, "Media review failed"),
            }
        }

        locks
    }
}

fn push_lock(locks: &mut Vec<DocumentLock>, verdict: Verdict, kind: LockKind, target: Option<&str>) {
    if let Verdict::Block { reason, words } = verdict {
        locks.push(DocumentLock {
            kind,
            target: target.map(str::to_string),
            reason,
            words,
            locked_at: Utc::now(),
        });
    }
}
