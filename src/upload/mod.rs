//! Upload orchestration: fan part writes out to object storage, then publish
//! the manifest and record the version.
//!
//! ```text
//! ReceivingHeader -> ValidatingParams -> NewDocument | ExistingDocument
//!   -> UploadingParts -> AssemblingManifest -> WritingManifest
//!   -> RecordingVersion -> Done
//! ```
//!
//! Any failure abandons the upload. Relational rows are written only after
//! every object write has succeeded; objects written before a failure are
//! left behind.

pub mod wire;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use dashmap::DashMap;
use serde_json::Value;
use thiserror::Error;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::id_alloc::IdAllocator;
use crate::manifest::{Manifest, ManifestError, MANIFEST_NAME};
use crate::moderation::{ModerationHook, ModerationOutcome, ReviewJob};
use crate::object_store::{Bucket, ObjectStoreError, PutObjectInput};
use crate::permissions::{PermType, PermissionError, PermissionResolver};
use crate::storage::models::Document;
use crate::storage::{Database, DatabaseError, VersionCommit};

pub const FREESYMBOLS_NAME: &str = "freesymbols.json";

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("{0}")]
    Protocol(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    NotFound(String),
    #[error("Failed to store {key}: {source}")]
    Storage {
        key: String,
        #[source]
        source: ObjectStoreError,
    },
    #[error("Inconsistent upload: {0}")]
    Consistency(#[from] ManifestError),
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

impl UploadError {
    fn storage(key: impl Into<String>, source: ObjectStoreError) -> Self {
        UploadError::Storage {
            key: key.into(),
            source,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadStage {
    ReceivingHeader,
    ValidatingParams,
    NewDocument,
    ExistingDocument,
    UploadingParts,
    AssemblingManifest,
    WritingManifest,
    RecordingVersion,
    Done,
}

/// Who the upload is for. Exactly one of `user_id` and `document_id` is set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadHeader {
    pub user_id: Option<i64>,
    pub document_id: Option<i64>,
    pub project_id: Option<i64>,
    /// Edit-sequence number the update is based on. Required with `document_id`.
    pub last_cmd_id: Option<String>,
}

/// Validated form of [`UploadHeader`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadTarget {
    New {
        user_id: i64,
        project_id: Option<i64>,
    },
    Existing {
        document_id: i64,
        last_cmd_id: u64,
    },
}

impl UploadHeader {
    pub fn target(&self) -> Result<UploadTarget, UploadError> {
        match (self.user_id, self.document_id) {
            (Some(user_id), None) => Ok(UploadTarget::New {
                user_id,
                project_id: self.project_id,
            }),
            (None, Some(document_id)) => {
                let raw = self
                    .last_cmd_id
                    .as_deref()
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .ok_or_else(|| {
                        UploadError::Protocol("last_cmd_id is required with document_id".into())
                    })?;
                let last_cmd_id = raw.parse().map_err(|_| {
                    UploadError::Protocol(format!("last_cmd_id must be an integer, got {raw:?}"))
                })?;
                Ok(UploadTarget::Existing {
                    document_id,
                    last_cmd_id,
                })
            }
            (Some(_), Some(_)) => Err(UploadError::Protocol(
                "user_id and document_id are mutually exclusive".into(),
            )),
            (None, None) => Err(UploadError::Protocol(
                "one of user_id or document_id is required".into(),
            )),
        }
    }
}

/// Document content handed to the orchestrator.
#[derive(Debug, Clone)]
pub struct DocumentBundle {
    pub document_meta: Manifest,
    /// Page bodies; each must be an object with a string `id`.
    pub pages: Vec<Value>,
    pub media_names: Vec<String>,
    /// Size of media already in storage, for updates that do not resend it.
    pub medias_size: u64,
    pub document_text: Option<String>,
    pub freesymbols: Option<Value>,
    /// Rendered pages as `(page id, png)`, only used for moderation.
    pub page_images: Vec<(String, Bytes)>,
}

#[derive(Debug, Clone)]
pub struct MediaPayload {
    pub name: String,
    pub content: Bytes,
}

#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub header: UploadHeader,
    pub bundle: DocumentBundle,
    /// Raw media, first upload only.
    pub medias: Vec<MediaPayload>,
}

#[derive(Debug)]
pub struct UploadOutcome {
    pub document: Document,
    pub version_id: String,
    pub last_cmd_id: u64,
    /// Resolves once moderation has applied (or discarded) its verdicts.
    pub moderation: Option<JoinHandle<ModerationOutcome>>,
}

/// A page with its id checked and body serialized.
struct PagePart {
    id: String,
    body: Bytes,
}

struct Progress {
    stage: UploadStage,
}

impl Progress {
    fn enter(&mut self, stage: UploadStage) {
        debug!(from = ?self.stage, to = ?stage, "Upload stage");
        self.stage = stage;
    }
}

pub struct UploadOrchestrator {
    bucket: Arc<dyn Bucket>,
    db: Database,
    ids: Arc<IdAllocator>,
    permissions: Arc<dyn PermissionResolver>,
    moderation: Option<ModerationHook>,
}

impl UploadOrchestrator {
    pub fn new(
        bucket: Arc<dyn Bucket>,
        db: Database,
        ids: Arc<IdAllocator>,
        permissions: Arc<dyn PermissionResolver>,
        moderation: Option<ModerationHook>,
    ) -> Self {
        Self {
            bucket,
            db,
            ids,
            permissions,
            moderation,
        }
    }

    pub fn bucket(&self) -> &Arc<dyn Bucket> {
        &self.bucket
    }

    /// Whether uploads are reviewed, and so whether page rasters are wanted.
    pub fn moderates(&self) -> bool {
        self.moderation.is_some()
    }

    pub async fn upload(&self, request: UploadRequest) -> Result<UploadOutcome, UploadError> {
        let mut progress = Progress {
            stage: UploadStage::ReceivingHeader,
        };
        match self.run(request, &mut progress).await {
            Ok(outcome) => {
                progress.enter(UploadStage::Done);
                Ok(outcome)
            }
            Err(e) => {
                warn!(stage = ?progress.stage, error = %e, "Upload failed");
                Err(e)
            }
        }
    }

    async fn run(
        &self,
        request: UploadRequest,
        progress: &mut Progress,
    ) -> Result<UploadOutcome, UploadError> {
        let UploadRequest {
            header,
            bundle,
            medias,
        } = request;

        progress.enter(UploadStage::ValidatingParams);
        let target = header.target()?;
        let pages = validate_pages(&bundle)?;
        validate_medias(&target, &bundle, &medias)?;
        if let UploadTarget::New {
            user_id,
            project_id: Some(project_id),
        } = target
        {
            self.require_editable(project_id, user_id).await?;
        }

        let (document_id, path, owner_id, existing, last_cmd_id) = match target {
            UploadTarget::Existing {
                document_id,
                last_cmd_id,
            } => {
                progress.enter(UploadStage::ExistingDocument);
                let document = self
                    .db
                    .get_document(document_id)?
                    .filter(|doc| !doc.is_deleted())
                    .ok_or_else(|| {
                        UploadError::NotFound(format!("Document {document_id} not found"))
                    })?;
                (
                    document_id,
                    document.path.clone(),
                    document.user_id,
                    Some(document),
                    last_cmd_id,
                )
            }
            UploadTarget::New { user_id, .. } => {
                progress.enter(UploadStage::NewDocument);
                let path = uuid::Uuid::new_v4().simple().to_string();
                (self.ids.next_id(), path, user_id, None, 0)
            }
        };

        let ticket = self.moderation.as_ref().and_then(|hook| {
            hook.start(ReviewJob {
                path: path.clone(),
                text: bundle.document_text.clone(),
                page_images: bundle.page_images.clone(),
                medias: medias
                    .iter()
                    .map(|m| (m.name.clone(), m.content.clone()))
                    .collect(),
                stored_media_names: if existing.is_some() {
                    bundle.media_names.clone()
                } else {
                    Vec::new()
                },
            })
        });

        progress.enter(UploadStage::UploadingParts);
        let pages_size: u64 = pages.iter().map(|p| p.body.len() as u64).sum();
        let media_size: u64 = if medias.is_empty() {
            bundle.medias_size
        } else {
            medias.iter().map(|m| m.content.len() as u64).sum()
        };
        let freesymbols = bundle
            .freesymbols
            .as_ref()
            .map(serde_json::to_vec)
            .transpose()
            .map_err(|e| UploadError::Protocol(format!("Invalid freesymbols: {e}")))?
            .map(Bytes::from);
        let freesymbols_size = freesymbols.as_ref().map_or(0, |b| b.len() as u64);

        let versions = self.upload_parts(&path, pages, medias, freesymbols).await?;

        progress.enter(UploadStage::AssemblingManifest);
        let mut manifest = bundle.document_meta;
        let page_versions: HashMap<String, String> = versions
            .iter()
            .filter_map(|entry| {
                let id = entry.key().strip_prefix("pages/")?.strip_suffix(".json")?;
                Some((id.to_string(), entry.value().clone()))
            })
            .collect();
        manifest.apply_page_versions(&page_versions)?;
        manifest.last_cmd_id = Some(last_cmd_id);
        manifest.freesymbols_version_id = versions
            .get(FREESYMBOLS_NAME)
            .map(|v| v.value().clone());
        let name = manifest
            .name()
            .map(str::to_string)
            .or_else(|| existing.as_ref().map(|doc| doc.name.clone()))
            .unwrap_or_default();
        let manifest_bytes = serde_json::to_vec(&manifest)
            .map_err(|e| UploadError::Protocol(format!("Invalid document_meta: {e}")))?;
        let manifest_size = manifest_bytes.len() as u64;

        progress.enter(UploadStage::WritingManifest);
        let manifest_key = format!("{path}/{MANIFEST_NAME}");
        let info = self
            .bucket
            .put_object(PutObjectInput::new(manifest_key.clone(), manifest_bytes))
            .await
            .map_err(|e| {
                warn!(prefix = %path, "Orphaned objects left under prefix");
                UploadError::storage(manifest_key.clone(), e)
            })?;
        if info.version_id.is_empty() {
            warn!(prefix = %path, "Manifest stored without a version id");
            return Err(UploadError::storage(
                manifest_key,
                ObjectStoreError::Backend(
                    "no version id returned; is bucket versioning enabled?".into(),
                ),
            ));
        }

        progress.enter(UploadStage::RecordingVersion);
        let accessor_id = owner_id;
        let commit = VersionCommit {
            document_id,
            owner_id,
            project_id: match target {
                UploadTarget::New { project_id, .. } => project_id,
                UploadTarget::Existing { .. } => None,
            },
            path: path.clone(),
            name,
            size: pages_size + media_size + freesymbols_size + manifest_size,
            version_id: info.version_id.clone(),
            version_row_id: self.ids.next_id(),
            last_cmd_id,
            accessor_id,
            access_record_id: self.ids.next_id(),
            committed_at: Utc::now(),
        };
        let document = self.db.commit_version(&commit)?;

        info!(
            document_id,
            version_id = %info.version_id,
            last_cmd_id,
            first_upload = existing.is_none(),
            "Recorded document version"
        );

        Ok(UploadOutcome {
            document,
            version_id: info.version_id,
            last_cmd_id,
            moderation: ticket.map(|t| t.commit(document_id)),
        })
    }

    async fn require_editable(&self, project_id: i64, user_id: i64) -> Result<(), UploadError> {
        match self.permissions.project_perm(project_id, user_id).await {
            Ok(perm) if perm >= PermType::Editable => Ok(()),
            Ok(_) => Err(UploadError::Forbidden(format!(
                "No edit permission on project {project_id}"
            ))),
            Err(PermissionError::ProjectNotFound(id)) => {
                Err(UploadError::NotFound(format!("Project {id} not found")))
            }
            Err(e) => {
                warn!(project_id, user_id, error = %e, "Permission lookup failed");
                Err(UploadError::Forbidden(format!(
                    "No edit permission on project {project_id}"
                )))
            }
        }
    }

    /// Write every part concurrently. Returns logical name -> version id,
    /// only once every write has succeeded.
    async fn upload_parts(
        &self,
        path: &str,
        pages: Vec<PagePart>,
        medias: Vec<MediaPayload>,
        freesymbols: Option<Bytes>,
    ) -> Result<Arc<DashMap<String, String>>, UploadError> {
        let versions: Arc<DashMap<String, String>> = Arc::new(DashMap::new());
        let mut tasks = JoinSet::new();

        let parts = pages
            .into_iter()
            .map(|page| (format!("pages/{}.json", page.id), page.body))
            .chain(
                medias
                    .into_iter()
                    .map(|media| (format!("medias/{}", media.name), media.content)),
            )
            .chain(freesymbols.map(|data| (FREESYMBOLS_NAME.to_string(), data)));

        for (name, data) in parts {
            let bucket = Arc::clone(&self.bucket);
            let versions = Arc::clone(&versions);
            let key = format!("{path}/{name}");
            tasks.spawn(async move {
                let info = bucket
                    .put_object(PutObjectInput::new(key.clone(), data))
                    .await
                    .map_err(|e| UploadError::storage(key, e))?;
                if !info.version_id.is_empty() {
                    versions.insert(name, info.version_id);
                }
                Ok::<(), UploadError>(())
            });
        }

        while let Some(joined) = tasks.join_next().await {
            let result = joined.unwrap_or_else(|e| {
                Err(UploadError::storage(
                    path,
                    ObjectStoreError::Backend(format!("upload task failed: {e}")),
                ))
            });
            if let Err(e) = result {
                tasks.abort_all();
                warn!(prefix = %path, "Orphaned objects left under prefix");
                return Err(e);
            }
        }

        Ok(versions)
    }
}

/// Check every page has a usable id and that the manifest lists exactly the
/// uploaded pages.
fn validate_pages(bundle: &DocumentBundle) -> Result<Vec<PagePart>, UploadError> {
    let mut parts = Vec::with_capacity(bundle.pages.len());
    for (index, page) in bundle.pages.iter().enumerate() {
        let id = page
            .get("id")
            .and_then(Value::as_str)
            .filter(|id| is_path_segment(id))
            .ok_or_else(|| UploadError::Protocol(format!("page {index} has no valid id")))?;
        let body = serde_json::to_vec(page)
            .map_err(|e| UploadError::Protocol(format!("page {id} is not valid JSON: {e}")))?;
        parts.push(PagePart {
            id: id.to_string(),
            body: Bytes::from(body),
        });
    }

    bundle
        .document_meta
        .check_page_set(parts.iter().map(|p| p.id.as_str()))?;
    Ok(parts)
}

fn validate_medias(
    target: &UploadTarget,
    bundle: &DocumentBundle,
    medias: &[MediaPayload],
) -> Result<(), UploadError> {
    if medias.is_empty() {
        return Ok(());
    }
    if matches!(target, UploadTarget::Existing { .. }) {
        return Err(UploadError::Protocol(
            "media can only be sent with the first upload".into(),
        ));
    }
    let mut names = HashSet::with_capacity(medias.len());
    for media in medias {
        if !names.insert(media.name.as_str()) {
            return Err(UploadError::Protocol(format!(
                "media {} was sent more than once",
                media.name
            )));
        }
        if !is_path_segment(&media.name) {
            return Err(UploadError::Protocol(format!(
                "invalid media name {:?}",
                media.name
            )));
        }
        if !bundle.media_names.contains(&media.name) {
            return Err(UploadError::Protocol(format!(
                "media {} was not declared",
                media.name
            )));
        }
    }
    Ok(())
}

fn is_path_segment(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains('/')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(user: Option<i64>, doc: Option<i64>, cmd: Option<&str>) -> UploadHeader {
        UploadHeader {
            user_id: user,
            document_id: doc,
            project_id: None,
            last_cmd_id: cmd.map(str::to_string),
        }
    }

    #[test]
    fn header_targets() {
        assert_eq!(
            header(Some(7), None, None).target().unwrap(),
            UploadTarget::New {
                user_id: 7,
                project_id: None
            }
        );
        assert_eq!(
            header(None, Some(1), Some("42")).target().unwrap(),
            UploadTarget::Existing {
                document_id: 1,
                last_cmd_id: 42
            }
        );
    }

    #[test]
    fn header_rejections() {
        for bad in [
            header(None, None, None),
            header(Some(7), Some(1), Some("1")),
            header(None, Some(1), None),
            header(None, Some(1), Some(" ")),
            header(None, Some(1), Some("abc")),
        ] {
            assert!(matches!(bad.target(), Err(UploadError::Protocol(_))), "{bad:?}");
        }
    }

    #[test]
    fn path_segments() {
        assert!(is_path_segment("logo.png"));
        assert!(!is_path_segment("../logo.png"));
        assert!(!is_path_segment(".."));
        assert!(!is_path_segment(""));
    }
}
