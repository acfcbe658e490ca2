//! Auto-snapshot scheduler.
//!
//! Re-materializes live-edited documents from the editing engine at most once
//! per `min_interval`, with at most one cycle per document in flight across
//! all instances sharing a [`LockService`].

pub mod raster;
pub mod source;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::lock::{snapshot_lock_key, LockError, LockService, SnapshotTimes};
use crate::upload::{DocumentBundle, UploadError, UploadHeader, UploadOrchestrator, UploadRequest};
use raster::{rasterize_pages, RasterError, Rasterizer};
use source::{DocumentSnapshot, SnapshotSource};

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("Snapshot request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Editing engine returned {status}: {body}")]
    Engine { status: u16, body: String },
    #[error("Malformed snapshot: {0}")]
    Malformed(String),
    #[error(transparent)]
    Raster(#[from] RasterError),
    #[error(transparent)]
    Upload(#[from] UploadError),
    #[error(transparent)]
    Lock(#[from] LockError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// This instance snapshotted (or saw contention) within the interval.
    Throttled,
    /// Another holder owns the document's lease.
    LockHeld,
    /// The shared store shows a snapshot within the interval.
    RecentlySnapshotted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SnapshotOutcome {
    Snapshotted { version_id: String, last_cmd_id: u64 },
    Skipped { reason: SkipReason },
}

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub min_interval: Duration,
    pub lock_ttl: Duration,
    pub time_ttl: Duration,
    pub raster_width: usize,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_secs(600),
            lock_ttl: Duration::from_secs(10),
            time_ttl: Duration::from_secs(3600),
            raster_width: 5,
        }
    }
}

pub struct AutoSnapshotScheduler {
    recent: DashMap<i64, DateTime<Utc>>,
    locks: Arc<dyn LockService>,
    times: Arc<dyn SnapshotTimes>,
    source: Arc<dyn SnapshotSource>,
    rasterizer: Option<Arc<dyn Rasterizer>>,
    orchestrator: Arc<UploadOrchestrator>,
    settings: SchedulerSettings,
}

impl AutoSnapshotScheduler {
    pub fn new(
        locks: Arc<dyn LockService>,
        times: Arc<dyn SnapshotTimes>,
        source: Arc<dyn SnapshotSource>,
        orchestrator: Arc<UploadOrchestrator>,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            recent: DashMap::new(),
            locks,
            times,
            source,
            rasterizer: None,
            orchestrator,
            settings,
        }
    }

    pub fn with_rasterizer(mut self, rasterizer: Arc<dyn Rasterizer>) -> Self {
        self.rasterizer = Some(rasterizer);
        self
    }

    /// Run one trigger for `document_id`. Contention and throttling are
    /// reported as [`SnapshotOutcome::Skipped`], never as errors.
    pub async fn trigger(&self, document_id: i64) -> Result<SnapshotOutcome, SnapshotError> {
        if self.within_interval(self.recent.get(&document_id).map(|t| *t)) {
            return Ok(skipped(SkipReason::Throttled));
        }

        let key = snapshot_lock_key(document_id);
        let Some(lease) = self.locks.try_lock(&key, self.settings.lock_ttl).await? else {
            debug!(document_id, "Snapshot already running elsewhere");
            self.recent.insert(document_id, Utc::now());
            return Ok(skipped(SkipReason::LockHeld));
        };

        let result = self.run_locked(document_id).await;

        match self.locks.unlock(&lease).await {
            Ok(true) => {}
            Ok(false) => warn!(document_id, "Snapshot lease expired before release"),
            Err(e) => warn!(document_id, error = %e, "Failed to release snapshot lease"),
        }
        result
    }

    /// Fire-and-forget form of [`trigger`](Self::trigger); failures are logged.
    pub fn spawn_trigger(self: &Arc<Self>, document_id: i64) -> JoinHandle<()> {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            match scheduler.trigger(document_id).await {
                Ok(SnapshotOutcome::Snapshotted { version_id, .. }) => {
                    debug!(document_id, version_id = %version_id, "Snapshot cycle finished")
                }
                Ok(SnapshotOutcome::Skipped { reason }) => {
                    debug!(document_id, ?reason, "Snapshot cycle skipped")
                }
                Err(e) => warn!(document_id, error = %e, "Snapshot cycle failed"),
            }
        })
    }

    async fn run_locked(&self, document_id: i64) -> Result<SnapshotOutcome, SnapshotError> {
        if let Some(shared) = self.times.last_snapshot(document_id).await? {
            self.recent.insert(document_id, shared);
            if self.within_interval(Some(shared)) {
                return Ok(skipped(SkipReason::RecentlySnapshotted));
            }
        }

        info!(document_id, "Starting snapshot cycle");
        let snapshot = self.source.fetch(document_id).await?;
        let page_images = self.page_images(&snapshot).await?;

        let DocumentSnapshot {
            last_cmd_id,
            document_data,
            document_text,
            medias_size,
            ..
        } = snapshot;
        let request = UploadRequest {
            header: UploadHeader {
                document_id: Some(document_id),
                last_cmd_id: Some(last_cmd_id),
                ..Default::default()
            },
            bundle: DocumentBundle {
                document_meta: document_data.document_meta,
                pages: document_data.pages,
                media_names: document_data.media_names,
                medias_size,
                document_text,
                freesymbols: None,
                page_images,
            },
            medias: Vec::new(),
        };
        let outcome = self.orchestrator.upload(request).await?;

        let now = Utc::now();
        self.recent.insert(document_id, now);
        if let Err(e) = self
            .times
            .record_snapshot(document_id, now, self.settings.time_ttl)
            .await
        {
            warn!(document_id, error = %e, "Failed to record snapshot time");
        }

        info!(
            document_id,
            version_id = %outcome.version_id,
            last_cmd_id = outcome.last_cmd_id,
            "Snapshot stored"
        );
        Ok(SnapshotOutcome::Snapshotted {
            version_id: outcome.version_id,
            last_cmd_id: outcome.last_cmd_id,
        })
    }

    /// Page rasters are only needed for moderation.
    async fn page_images(
        &self,
        snapshot: &DocumentSnapshot,
    ) -> Result<Vec<(String, bytes::Bytes)>, SnapshotError> {
        if !self.orchestrator.moderates() {
            return Ok(Vec::new());
        }
        let mut images = snapshot.decoded_pngs()?;
        if !snapshot.page_svgs.is_empty() {
            match &self.rasterizer {
                Some(rasterizer) => images.extend(
                    rasterize_pages(
                        Arc::clone(rasterizer),
                        snapshot.page_svgs.clone(),
                        self.settings.raster_width,
                    )
                    .await?,
                ),
                None => debug!(
                    pages = snapshot.page_svgs.len(),
                    "No rasterizer configured, page svgs not reviewed"
                ),
            }
        }
        Ok(images)
    }

    fn within_interval(&self, last: Option<DateTime<Utc>>) -> bool {
        let Some(last) = last else { return false };
        let elapsed = Utc::now().signed_duration_since(last);
        elapsed
            .to_std()
            .map_or(true, |elapsed| elapsed < self.settings.min_interval)
    }
}

fn skipped(reason: SkipReason) -> SnapshotOutcome {
    SnapshotOutcome::Skipped { reason }
}
