//! Client for the live-editing engine's snapshot endpoint.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Deserializer};
use serde_json::Value;

use super::SnapshotError;
use crate::manifest::Manifest;

/// A full re-materialization of one document, as served by the engine.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentSnapshot {
    #[serde(deserialize_with = "cmd_id")]
    pub last_cmd_id: String,
    pub document_data: SnapshotData,
    #[serde(default)]
    pub document_text: Option<String>,
    #[serde(default)]
    pub medias_size: u64,
    /// Vector renderings that still need rasterizing.
    #[serde(default)]
    pub page_svgs: Vec<PageSvg>,
    /// Ready-made rasters, base64 encoded.
    #[serde(default)]
    pub page_pngs: Vec<PagePng>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SnapshotData {
    pub document_meta: Manifest,
    pub pages: Vec<Value>,
    #[serde(default)]
    pub media_names: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PageSvg {
    pub id: String,
    pub svg: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PagePng {
    pub id: String,
    pub png: String,
}

impl DocumentSnapshot {
    /// Decode the ready-made rasters. Malformed base64 aborts the cycle.
    pub fn decoded_pngs(&self) -> Result<Vec<(String, Bytes)>, SnapshotError> {
        self.page_pngs
            .iter()
            .map(|page| {
                base64::engine::general_purpose::STANDARD
                    .decode(&page.png)
                    .map(|png| (page.id.clone(), Bytes::from(png)))
                    .map_err(|e| {
                        SnapshotError::Malformed(format!("page {} png is not base64: {e}", page.id))
                    })
            })
            .collect()
    }
}

fn cmd_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) => s,
        Value::Number(n) => n.to_string(),
        other => {
            return Err(serde::de::Error::custom(format!(
                "lastCmdId must be a string or number, got {other}"
            )))
        }
    })
}

#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn fetch(&self, document_id: i64) -> Result<DocumentSnapshot, SnapshotError>;
}

pub struct HttpSnapshotSource {
    url: String,
    client: reqwest::Client,
}

impl HttpSnapshotSource {
    pub fn new(
        url: impl Into<String>,
        connect_timeout: Duration,
        read_timeout: Duration,
    ) -> Result<Self, SnapshotError> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(read_timeout)
            .build()?;
        Ok(Self {
            url: url.into(),
            client,
        })
    }
}

#[async_trait]
impl SnapshotSource for HttpSnapshotSource {
    async fn fetch(&self, document_id: i64) -> Result<DocumentSnapshot, SnapshotError> {
        let resp = self
            .client
            .get(&self.url)
            .query(&[("documentId", document_id.to_string())])
            .send()
            .await?;

        let status = resp.status();
        let body = resp.bytes().await?;
        if !status.is_success() {
            return Err(SnapshotError::Engine {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }
        serde_json::from_slice(&body).map_err(|e| SnapshotError::Malformed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_engine_payload() {
        let body = serde_json::json!({
            "lastCmdId": 42,
            "documentData": {
                "document_meta": { "pagesList": [{ "id": "p1" }] },
                "pages": [{ "id": "p1" }],
                "media_names": ["logo.png"]
            },
            "documentText": "hello",
            "mediasSize": 10,
            "pagePngs": [{ "id": "p1", "png": "iVBO" }]
        });
        let snapshot: DocumentSnapshot = serde_json::from_value(body).unwrap();
        assert_eq!(snapshot.last_cmd_id, "42");
        assert_eq!(snapshot.document_data.media_names, ["logo.png"]);
        assert_eq!(snapshot.medias_size, 10);
        assert!(snapshot.page_svgs.is_empty());

        let pngs = snapshot.decoded_pngs().unwrap();
        assert_eq!(pngs[0].0, "p1");
        assert_eq!(&pngs[0].1[..3], b"\x89PN");
    }

    #[test]
    fn rejects_bad_png_encoding() {
        let snapshot: DocumentSnapshot = serde_json::from_value(serde_json::json!({
            "lastCmdId": "1",
            "documentData": { "document_meta": { "pagesList": [] }, "pages": [] },
            "pagePngs": [{ "id": "p1", "png": "!!!" }]
        }))
        .unwrap();
        assert!(matches!(
            snapshot.decoded_pngs(),
            Err(SnapshotError::Malformed(_))
        ));
    }
}
