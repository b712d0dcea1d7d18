//! WebSocket transport (axum).
//!
//! Adapts axum's split [`WebSocket`] to [`SocketReader`] / [`SocketWriter`]
//! and exposes the HTTP handlers mounted by [`crate::router`].

use async_trait::async_trait;
use axum::{
    Json,
    extract::{
        Path, Query, State,
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
    },
    http::{HeaderMap, header::AUTHORIZATION},
    response::Response,
};
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use serde::{Deserialize, Serialize};

use crate::{
    handler::{ChatState, handle_connection},
    socket::{InboundFrame, SocketReader, SocketWriter, TransportError},
};

/// Read half of an axum WebSocket.
pub struct WsReader(SplitStream<WebSocket>);

/// Write half of an axum WebSocket.
pub struct WsWriter(SplitSink<WebSocket, Message>);

#[async_trait]
impl SocketReader for WsReader {
    async fn recv(&mut self) -> Option<Result<InboundFrame, TransportError>> {
        loop {
            let message = match self.0.next().await? {
                Ok(message) => message,
                Err(e) => return Some(Err(TransportError::Io(e.to_string()))),
            };

            return Some(Ok(match message {
                Message::Text(text) => InboundFrame::Text(text.as_str().to_owned()),
                Message::Binary(bytes) => InboundFrame::Binary(bytes.to_vec()),
                Message::Close(_) => InboundFrame::Close,
                // axum answers pings itself
                Message::Ping(_) | Message::Pong(_) => continue,
            }));
        }
    }
}

#[async_trait]
impl SocketWriter for WsWriter {
    async fn send(&mut self, text: &str) -> Result<(), TransportError> {
        self.0
            .send(Message::Text(text.to_owned().into()))
            .await
            .map_err(|e| TransportError::Io(e.to_string()))
    }

    async fn close(&mut self, code: u16, reason: &str) -> Result<(), TransportError> {
        let frame = CloseFrame { code, reason: reason.to_owned().into() };
        self.0
            .send(Message::Close(Some(frame)))
            .await
            .map_err(|e| TransportError::Io(e.to_string()))
    }
}

/// Query string of the chat upgrade request.
#[derive(Debug, Default, Deserialize)]
pub struct ChatQuery {
    /// Bearer credential, for clients that cannot set headers
    pub token: Option<String>,
}

/// `GET /ws/chat/{room_id}`
///
/// Always upgrades. Rejections are reported as a close frame so browser
/// clients can see the reason.
pub async fn chat_socket(
    State(state): State<ChatState>,
    Path(room_id): Path<u64>,
    Query(query): Query<ChatQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let credential = query.token.or_else(|| bearer_token(&headers));
    let tracked = state.connections.token();

    ws.on_upgrade(move |socket| async move {
        let (sink, stream) = socket.split();
        handle_connection(&state, room_id, credential, WsReader(stream), WsWriter(sink)).await;
        drop(tracked);
    })
}

/// Body of `GET /rooms/{room_id}/connections`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomConnections {
    /// Room queried
    pub room_id: u64,
    /// Live connection handles, ascending
    pub connections: Vec<u64>,
}

/// `GET /rooms/{room_id}/connections`
pub async fn room_connections(
    State(state): State<ChatState>,
    Path(room_id): Path<u64>,
) -> Json<RoomConnections> {
    let mut connections: Vec<u64> = state.registry.members_of(room_id).into_iter().collect();
    connections.sort_unstable();
    Json(RoomConnections { room_id, connections })
}

/// `GET /health`
pub async fn health() -> &'static str {
    "ok"
}

/// Extract the token from an `Authorization: Bearer <token>` header.
fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    scheme.eq_ignore_ascii_case("bearer").then(|| token.trim().to_string())
}
