#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use docstore::id_alloc::IdAllocator;
use docstore::manifest::Manifest;
use docstore::moderation::ModerationHook;
use docstore::object_store::{
    AccessKey, AccessKeyRequest, Bucket, LocalStore, ObjectInfo, ObjectStoreError, Provider,
    PutObjectInput, UploadInfo,
};
use docstore::permissions::{PermissionResolver, StaticPermissions};
use docstore::storage::Database;
use docstore::upload::{
    DocumentBundle, MediaPayload, UploadHeader, UploadOrchestrator, UploadRequest,
};
use serde_json::{json, Value};

pub struct Harness {
    pub dir: tempfile::TempDir,
    pub db: Database,
    pub store: Arc<LocalStore>,
    pub ids: Arc<IdAllocator>,
    pub permissions: Arc<StaticPermissions>,
}

impl Harness {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path().join("data")).unwrap();
        let store = Arc::new(LocalStore::new(dir.path().join("files")).unwrap());
        Self {
            dir,
            db,
            store,
            ids: Arc::new(IdAllocator::new(3).unwrap()),
            permissions: Arc::new(StaticPermissions::new()),
        }
    }

    pub fn bucket(&self) -> Arc<dyn Bucket> {
        self.store.clone()
    }

    pub fn orchestrator(&self) -> UploadOrchestrator {
        self.orchestrator_with(self.bucket(), None)
    }

    pub fn orchestrator_with(
        &self,
        bucket: Arc<dyn Bucket>,
        moderation: Option<ModerationHook>,
    ) -> UploadOrchestrator {
        let permissions: Arc<dyn PermissionResolver> = self.permissions.clone();
        UploadOrchestrator::new(
            bucket,
            self.db.clone(),
            Arc::clone(&self.ids),
            permissions,
            moderation,
        )
    }
}

pub fn manifest(name: &str, page_ids: &[&str]) -> Manifest {
    let pages: Vec<Value> = page_ids.iter().map(|id| json!({ "id": id })).collect();
    serde_json::from_value(json!({ "name": name, "pagesList": pages })).unwrap()
}

pub fn pages(page_ids: &[&str]) -> Vec<Value> {
    page_ids
        .iter()
        .map(|id| json!({ "id": id, "shapes": [{ "type": "rect" }] }))
        .collect()
}

pub fn bundle(page_ids: &[&str], media_names: &[&str]) -> DocumentBundle {
    DocumentBundle {
        document_meta: manifest("Plan", page_ids),
        pages: pages(page_ids),
        media_names: media_names.iter().map(|n| n.to_string()).collect(),
        medias_size: 0,
        document_text: None,
        freesymbols: None,
        page_images: Vec::new(),
    }
}

pub fn first_upload(user_id: i64, page_ids: &[&str], media: &[(&str, &[u8])]) -> UploadRequest {
    let names: Vec<&str> = media.iter().map(|(name, _)| *name).collect();
    UploadRequest {
        header: UploadHeader {
            user_id: Some(user_id),
            ..Default::default()
        },
        bundle: bundle(page_ids, &names),
        medias: media
            .iter()
            .map(|(name, data)| MediaPayload {
                name: name.to_string(),
                content: Bytes::copy_from_slice(data),
            })
            .collect(),
    }
}

pub fn update(document_id: i64, last_cmd_id: &str, page_ids: &[&str]) -> UploadRequest {
    UploadRequest {
        header: UploadHeader {
            document_id: Some(document_id),
            last_cmd_id: Some(last_cmd_id.to_string()),
            ..Default::default()
        },
        bundle: bundle(page_ids, &[]),
        medias: Vec::new(),
    }
}

/// Delegates to an inner bucket but fails writes whose key contains `poison`.
/// Writes whose key contains `unversioned` succeed with an empty version id,
/// the way a bucket without versioning answers.
pub struct FailingBucket {
    pub inner: Arc<dyn Bucket>,
    pub poison: String,
    pub unversioned: Option<String>,
    pub writes: AtomicUsize,
}

impl FailingBucket {
    pub fn new(inner: Arc<dyn Bucket>, poison: &str) -> Self {
        Self {
            inner,
            poison: poison.to_string(),
            unversioned: None,
            writes: AtomicUsize::new(0),
        }
    }

    pub fn unversioned(inner: Arc<dyn Bucket>, pattern: &str) -> Self {
        Self {
            unversioned: Some(pattern.to_string()),
            ..Self::new(inner, "never-matches")
        }
    }
}

#[async_trait]
impl Bucket for FailingBucket {
    fn provider(&self) -> Provider {
        self.inner.provider()
    }

    fn bucket_name(&self) -> &str {
        self.inner.bucket_name()
    }

    async fn put_object(&self, input: PutObjectInput) -> Result<UploadInfo, ObjectStoreError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        if input.name.contains(&self.poison) {
            return Err(ObjectStoreError::Backend("injected failure".into()));
        }
        let strip_version = self
            .unversioned
            .as_ref()
            .is_some_and(|pattern| input.name.contains(pattern.as_str()));
        let info = self.inner.put_object(input).await?;
        if strip_version {
            return Ok(UploadInfo::default());
        }
        Ok(info)
    }

    async fn get_object(&self, name: &str) -> Result<Bytes, ObjectStoreError> {
        self.inner.get_object(name).await
    }

    async fn get_object_version(
        &self,
        name: &str,
        version_id: &str,
    ) -> Result<Bytes, ObjectStoreError> {
        self.inner.get_object_version(name, version_id).await
    }

    async fn get_object_info(&self, name: &str) -> Result<ObjectInfo, ObjectStoreError> {
        self.inner.get_object_info(name).await
    }

    async fn list_objects(&self, prefix: &str) -> Result<Vec<String>, ObjectStoreError> {
        self.inner.list_objects(prefix).await
    }

    async fn copy_object(&self, src: &str, dest: &str) -> Result<UploadInfo, ObjectStoreError> {
        self.inner.copy_object(src, dest).await
    }

    async fn generate_access_key(
        &self,
        request: &AccessKeyRequest,
    ) -> Result<AccessKey, ObjectStoreError> {
        self.inner.generate_access_key(request).await
    }
}
