//! Permission lookups owned by the team/project service.
//!
//! This crate only consumes effective permissions; granting and revoking
//! them happens elsewhere.

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;

use crate::storage::models::{DocType, Document};

/// Effective permission, ordered from weakest to strongest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PermType {
    None,
    ReadOnly,
    Commentable,
    Editable,
    Admin,
    Creator,
}

#[derive(Debug, Error)]
pub enum PermissionError {
    #[error("Project not found: {0}")]
    ProjectNotFound(i64),
    #[error("Permission service unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait PermissionResolver: Send + Sync {
    /// The user's effective permission on a project.
    async fn project_perm(&self, project_id: i64, user_id: i64)
        -> Result<PermType, PermissionError>;

    /// The user's effective permission on a document: owner, then project
    /// membership, then the document's public visibility.
    async fn document_perm(
        &self,
        document: &Document,
        user_id: i64,
    ) -> Result<PermType, PermissionError> {
        if document.user_id == user_id {
            return Ok(PermType::Creator);
        }
        let from_project = match document.project_id {
            Some(project_id) => match self.project_perm(project_id, user_id).await {
                Ok(perm) => perm,
                Err(PermissionError::ProjectNotFound(_)) => PermType::None,
                Err(e) => return Err(e),
            },
            None => PermType::None,
        };
        let from_visibility = match document.doc_type {
            DocType::Private | DocType::Shareable => PermType::None,
            DocType::PublicReadable => PermType::ReadOnly,
            DocType::PublicCommentable => PermType::Commentable,
            DocType::PublicEditable => PermType::Editable,
        };
        Ok(from_project.max(from_visibility))
    }
}

/// Grants everything. Used when no permission service is wired in.
pub struct AllowAll;

#[async_trait]
impl PermissionResolver for AllowAll {
    async fn project_perm(&self, _: i64, _: i64) -> Result<PermType, PermissionError> {
        Ok(PermType::Creator)
    }
}

/// In-memory grants keyed by (project, user).
#[derive(Default)]
pub struct StaticPermissions {
    projects: DashMap<i64, ()>,
    grants: DashMap<(i64, i64), PermType>,
}

impl StaticPermissions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant(&self, project_id: i64, user_id: i64, perm: PermType) {
        self.projects.insert(project_id, ());
        self.grants.insert((project_id, user_id), perm);
    }

    pub fn add_project(&self, project_id: i64) {
        self.projects.insert(project_id, ());
    }
}

#[async_trait]
impl PermissionResolver for StaticPermissions {
    async fn project_perm(
        &self,
        project_id: i64,
        user_id: i64,
    ) -> Result<PermType, PermissionError> {
        if !self.projects.contains_key(&project_id) {
            return Err(PermissionError::ProjectNotFound(project_id));
        }
        Ok(self
            .grants
            .get(&(project_id, user_id))
            .map(|perm| *perm)
            .unwrap_or(PermType::None))
    }
}
