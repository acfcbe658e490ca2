//! Typed view of `document-meta.json`.
//!
//! Only the fields the upload path reads or writes are modelled; everything
//! else the editor stores in the manifest rides along in `extra` untouched.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub const MANIFEST_NAME: &str = "document-meta.json";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ManifestError {
    #[error("page {0} is listed in the manifest but was not uploaded")]
    MissingPage(String),
    #[error("page {0} was uploaded but is not listed in the manifest")]
    UnlistedPage(String),
    #[error("page {0} is listed more than once")]
    DuplicatePage(String),
    #[error("page {0} was uploaded more than once")]
    DuplicateUpload(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageDescriptor {
    pub id: String,
    #[serde(rename = "versionId", default, skip_serializing_if = "Option::is_none")]
    pub version_id: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(rename = "pagesList")]
    pub pages_list: Vec<PageDescriptor>,
    #[serde(rename = "lastCmdId", default, skip_serializing_if = "Option::is_none")]
    pub last_cmd_id: Option<u64>,
    #[serde(
        rename = "freesymbolsVersionId",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub freesymbols_version_id: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Manifest {
    /// Document display name, if the editor put one in the manifest.
    pub fn name(&self) -> Option<&str> {
        self.extra.get("name").and_then(Value::as_str)
    }

    pub fn page_ids(&self) -> impl Iterator<Item = &str> {
        self.pages_list.iter().map(|p| p.id.as_str())
    }

    /// The listed page ids must be unique and equal to `uploaded`.
    pub fn check_page_set<'a>(
        &self,
        uploaded: impl IntoIterator<Item = &'a str>,
    ) -> Result<(), ManifestError> {
        let mut listed: HashMap<&str, bool> = HashMap::with_capacity(self.pages_list.len());
        for id in self.page_ids() {
            if listed.insert(id, false).is_some() {
                return Err(ManifestError::DuplicatePage(id.to_string()));
            }
        }
        for id in uploaded {
            match listed.get_mut(id) {
                Some(true) => return Err(ManifestError::DuplicateUpload(id.to_string())),
                Some(seen) => *seen = true,
                None => return Err(ManifestError::UnlistedPage(id.to_string())),
            }
        }
        match self.page_ids().find(|id| listed.get(id) == Some(&false)) {
            Some(missing) => Err(ManifestError::MissingPage(missing.to_string())),
            None => Ok(()),
        }
    }

    /// Stamp each listed page with the version id storage assigned to it.
    /// Fails without modifying anything if a listed page has no version.
    pub fn apply_page_versions(
        &mut self,
        versions: &HashMap<String, String>,
    ) -> Result<(), ManifestError> {
        if let Some(missing) = self.page_ids().find(|id| !versions.contains_key(*id)) {
            return Err(ManifestError::MissingPage(missing.to_string()));
        }
        for page in &mut self.pages_list {
            page.version_id = versions.get(&page.id).cloned();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn manifest(ids: &[&str]) -> Manifest {
        let pages: Vec<Value> = ids.iter().map(|id| json!({ "id": id })).collect();
        serde_json::from_value(json!({ "name": "Plan", "pagesList": pages, "theme": "dark" }))
            .unwrap()
    }

    #[test]
    fn unknown_fields_survive() {
        let m = manifest(&["p1"]);
        assert_eq!(m.name(), Some("Plan"));
        let out = serde_json::to_value(&m).unwrap();
        assert_eq!(out["theme"], "dark");
        assert!(out.get("lastCmdId").is_none());
    }

    #[test]
    fn page_set_must_match_exactly() {
        let m = manifest(&["p1", "p2"]);
        assert!(m.check_page_set(["p2", "p1"]).is_ok());
        assert_eq!(
            m.check_page_set(["p1"]),
            Err(ManifestError::MissingPage("p2".into()))
        );
        assert_eq!(
            m.check_page_set(["p1", "p2", "p3"]),
            Err(ManifestError::UnlistedPage("p3".into()))
        );
        assert_eq!(
            manifest(&["p1", "p1"]).check_page_set(["p1"]),
            Err(ManifestError::DuplicatePage("p1".into()))
        );
        assert_eq!(
            manifest(&["p1"]).check_page_set(["p1", "p1"]),
            Err(ManifestError::DuplicateUpload("p1".into()))
        );
    }

    #[test]
    fn versions_are_stamped_in_place() {
        let mut m = manifest(&["p1", "p2"]);
        let mut versions = HashMap::new();
        versions.insert("p1".to_string(), "v1".to_string());
        assert!(m.apply_page_versions(&versions).is_err());
        assert!(m.pages_list.iter().all(|p| p.version_id.is_none()));

        versions.insert("p2".to_string(), "v2".to_string());
        m.apply_page_versions(&versions).unwrap();
        m.last_cmd_id = Some(42);
        let out = serde_json::to_value(&m).unwrap();
        assert_eq!(out["pagesList"][1]["versionId"], "v2");
        assert_eq!(out["lastCmdId"], 42);
    }
}
