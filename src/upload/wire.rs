//! Frames of the streaming upload session.
//!
//! The client sends a JSON header frame, a JSON metadata frame, then on a
//! first upload one binary frame per declared media name, in declared order.
//! The server answers with a single [`SessionReply`].

use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{DocumentBundle, MediaPayload, UploadError, UploadHeader, UploadRequest};
use crate::manifest::Manifest;

/// Transport-neutral session frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
    Close,
}

#[derive(Debug, Deserialize)]
pub struct HeaderFrame {
    #[serde(default, deserialize_with = "flexible_id")]
    pub user_id: Option<i64>,
    #[serde(default, deserialize_with = "flexible_id")]
    pub document_id: Option<i64>,
    #[serde(default, deserialize_with = "flexible_id")]
    pub project_id: Option<i64>,
    #[serde(default, deserialize_with = "flexible_string")]
    pub last_cmd_id: Option<String>,
}

impl From<HeaderFrame> for UploadHeader {
    fn from(frame: HeaderFrame) -> Self {
        UploadHeader {
            user_id: frame.user_id,
            document_id: frame.document_id,
            project_id: frame.project_id,
            last_cmd_id: frame.last_cmd_id,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct MetadataFrame {
    pub document_meta: Manifest,
    pub pages: Vec<Value>,
    #[serde(default)]
    pub media_names: Vec<String>,
    #[serde(default)]
    pub medias_size: u64,
    #[serde(default)]
    pub document_text: Option<String>,
    #[serde(default)]
    pub freesymbols: Option<Value>,
}

impl From<MetadataFrame> for DocumentBundle {
    fn from(frame: MetadataFrame) -> Self {
        DocumentBundle {
            document_meta: frame.document_meta,
            pages: frame.pages,
            media_names: frame.media_names,
            medias_size: frame.medias_size,
            document_text: frame.document_text,
            freesymbols: frame.freesymbols,
            page_images: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyStatus {
    Success,
    Fail,
}

/// The single terminal frame of a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionReply {
    pub status: ReplyStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl SessionReply {
    pub fn success(document_id: i64, version_id: &str) -> Self {
        SessionReply {
            status: ReplyStatus::Success,
            message: None,
            data: Some(serde_json::json!({
                "doc_id": document_id.to_string(),
                "version_id": version_id,
            })),
        }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        SessionReply {
            status: ReplyStatus::Fail,
            message: Some(message.into()),
            data: None,
        }
    }
}

/// Read header, metadata and media frames into an [`UploadRequest`].
///
/// Stops reading as soon as the request is complete; anything the client
/// sends afterwards is not consumed.
pub async fn collect_upload<S>(frames: &mut S) -> Result<UploadRequest, UploadError>
where
    S: Stream<Item = Frame> + Unpin,
{
    let header: HeaderFrame = parse_json(next_text(frames, "header").await?, "header")?;
    let header = UploadHeader::from(header);
    let metadata: MetadataFrame = parse_json(next_text(frames, "metadata").await?, "metadata")?;

    let mut medias = Vec::new();
    let is_first_upload = header.document_id.is_none();
    if is_first_upload {
        for name in &metadata.media_names {
            match frames.next().await {
                Some(Frame::Binary(content)) => medias.push(MediaPayload {
                    name: name.clone(),
                    content,
                }),
                Some(Frame::Text(_)) => {
                    return Err(UploadError::Protocol(format!(
                        "expected binary frame for media {name}"
                    )))
                }
                Some(Frame::Close) | None => {
                    return Err(UploadError::Protocol(format!(
                        "session closed before media {name} was received"
                    )))
                }
            }
        }
    }

    Ok(UploadRequest {
        header,
        bundle: metadata.into(),
        medias,
    })
}

async fn next_text<S>(frames: &mut S, what: &str) -> Result<String, UploadError>
where
    S: Stream<Item = Frame> + Unpin,
{
    match frames.next().await {
        Some(Frame::Text(text)) => Ok(text),
        Some(Frame::Binary(_)) => Err(UploadError::Protocol(format!(
            "expected text frame for {what}"
        ))),
        Some(Frame::Close) | None => Err(UploadError::Protocol(format!(
            "session closed before {what} was received"
        ))),
    }
}

fn parse_json<T: serde::de::DeserializeOwned>(text: String, what: &str) -> Result<T, UploadError> {
    serde_json::from_str(&text).map_err(|e| UploadError::Protocol(format!("invalid {what}: {e}")))
}

#[derive(Deserialize)]
#[serde(untagged)]
enum NumberOrString {
    Number(i64),
    String(String),
}

/// Accept ids as JSON numbers or strings; empty strings mean absent.
fn flexible_id<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<NumberOrString>::deserialize(deserializer)? {
        None => Ok(None),
        Some(NumberOrString::Number(n)) => Ok(Some(n)),
        Some(NumberOrString::String(s)) if s.trim().is_empty() => Ok(None),
        Some(NumberOrString::String(s)) => s
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| de::Error::custom(format!("invalid id {s:?}"))),
    }
}

fn flexible_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<NumberOrString>::deserialize(deserializer)? {
        None => None,
        Some(NumberOrString::Number(n)) => Some(n.to_string()),
        Some(NumberOrString::String(s)) => Some(s),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    fn metadata(media_names: &[&str]) -> String {
        serde_json::json!({
            "document_meta": { "name": "Plan", "pagesList": [{ "id": "p1" }] },
            "pages": [{ "id": "p1", "shapes": [] }],
            "media_names": media_names,
        })
        .to_string()
    }

    #[tokio::test]
    async fn first_upload_collects_media_in_order() {
        let mut frames = stream::iter(vec![
            Frame::Text(r#"{"user_id": "7", "document_id": ""}"#.into()),
            Frame::Text(metadata(&["a.png", "b.png"])),
            Frame::Binary(Bytes::from_static(b"A")),
            Frame::Binary(Bytes::from_static(b"B")),
        ]);

        let request = collect_upload(&mut frames).await.unwrap();
        assert_eq!(request.header.user_id, Some(7));
        assert_eq!(request.header.document_id, None);
        let names: Vec<&str> = request.medias.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, ["a.png", "b.png"]);
        assert_eq!(request.medias[1].content, Bytes::from_static(b"B"));
    }

    #[tokio::test]
    async fn update_does_not_wait_for_media() {
        let mut frames = stream::iter(vec![
            Frame::Text(r#"{"document_id": 12, "last_cmd_id": 42}"#.into()),
            Frame::Text(metadata(&["a.png"])),
        ]);

        let request = collect_upload(&mut frames).await.unwrap();
        assert_eq!(request.header.document_id, Some(12));
        assert_eq!(request.header.last_cmd_id.as_deref(), Some("42"));
        assert!(request.medias.is_empty());
        assert_eq!(request.bundle.media_names, ["a.png"]);
    }

    #[tokio::test]
    async fn wrong_frame_types_are_protocol_errors() {
        let mut frames = stream::iter(vec![Frame::Binary(Bytes::from_static(b"x"))]);
        assert!(matches!(
            collect_upload(&mut frames).await,
            Err(UploadError::Protocol(_))
        ));

        let mut frames = stream::iter(vec![
            Frame::Text(r#"{"user_id": 7}"#.into()),
            Frame::Text(metadata(&["a.png"])),
            Frame::Text("oops".into()),
        ]);
        assert!(matches!(
            collect_upload(&mut frames).await,
            Err(UploadError::Protocol(_))
        ));

        let mut frames = stream::iter(vec![Frame::Text("{not json".into())]);
        assert!(matches!(
            collect_upload(&mut frames).await,
            Err(UploadError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn early_close_is_reported() {
        let mut frames = stream::iter(vec![
            Frame::Text(r#"{"user_id": 7}"#.into()),
            Frame::Close,
        ]);
        let err = collect_upload(&mut frames).await.unwrap_err();
        assert!(err.to_string().contains("metadata"));
    }

    #[test]
    fn replies_serialize_compactly() {
        let ok = serde_json::to_value(SessionReply::success(5, "v1")).unwrap();
        assert_eq!(
            ok,
            serde_json::json!({ "status": "success", "data": { "doc_id": "5", "version_id": "v1" } })
        );
        let fail = serde_json::to_value(SessionReply::fail("nope")).unwrap();
        assert_eq!(fail, serde_json::json!({ "status": "fail", "message": "nope" }));
    }
}
