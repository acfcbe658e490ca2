use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};

use crate::upload::wire::{collect_upload, Frame, SessionReply};
use crate::AppState;

pub async fn upload_ws(State(state): State<Arc<AppState>>, ws: WebSocketUpgrade) -> Response {
    let limit = state.config.max_upload_size as usize;
    ws.max_message_size(limit)
        .max_frame_size(limit)
        .on_upgrade(move |socket| upload_session(state, socket))
}

async fn upload_session(state: Arc<AppState>, socket: WebSocket) {
    let (mut sender, receiver) = socket.split();
    let mut frames = receiver
        .filter_map(|message| async move {
            match message {
                Ok(Message::Text(text)) => Some(Frame::Text(text)),
                Ok(Message::Binary(data)) => Some(Frame::Binary(Bytes::from(data))),
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => None,
                Ok(Message::Close(_)) => Some(Frame::Close),
                Err(e) => {
                    tracing::debug!(error = %e, "Upload session read failed");
                    Some(Frame::Close)
                }
            }
        })
        .boxed();

    let reply = match collect_upload(&mut frames).await {
        Ok(request) => match state.orchestrator.upload(request).await {
            Ok(outcome) => SessionReply::success(outcome.document.id, &outcome.version_id),
            Err(e) => SessionReply::fail(e.to_string()),
        },
        Err(e) => {
            tracing::debug!(error = %e, "Rejected upload session");
            SessionReply::fail(e.to_string())
        }
    };

    match serde_json::to_string(&reply) {
        Ok(text) => {
            if let Err(e) = sender.send(Message::Text(text)).await {
                tracing::debug!(error = %e, "Client left before the upload reply");
            }
        }
        Err(e) => tracing::error!(error = %e, "Failed to encode upload reply"),
    }
    let _ = sender.close().await;
}
