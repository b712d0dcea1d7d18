//! End-to-end tests over real TCP with a WebSocket client.
//!
//! Drives the axum entry point: credential extraction from the query string
//! and the `Authorization` header, rejection close frames, fan-out between
//! clients, ping handling and graceful shutdown.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use futures_util::{SinkExt, StreamExt};
use roomcast_core::{RejectReason, Room, RoomKind, UserIdentity};
use roomcast_proto::{ServerEvent, close};
use roomcast_server::{
    ChatState, Collaborators, ConnectionConfig, LocalBroadcast, MemoryMembership,
    MemoryMessageLog, MemoryPresence, Server, ServerError, StaticAuthenticator, SystemEnv,
};
use tokio::{net::TcpStream, sync::oneshot, task::JoinHandle, time::timeout};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{
        Message,
        client::IntoClientRequest,
        http::HeaderValue,
        protocol::CloseFrame,
    },
};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const ROOM: u64 = 10;
const WAIT: Duration = Duration::from_secs(5);

struct Running {
    addr: SocketAddr,
    state: ChatState,
    presence: Arc<MemoryPresence>,
    stop: oneshot::Sender<()>,
    server: JoinHandle<Result<(), ServerError>>,
}

async fn start() -> Running {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let env = Arc::new(SystemEnv::new());
    let presence = Arc::new(MemoryPresence::new(env.clone()));

    let collaborators = Collaborators {
        auth: Arc::new(
            StaticAuthenticator::new()
                .with_token("alice-token", UserIdentity::new(1, "alice"))
                .with_token("bob-token", UserIdentity::new(2, "bob"))
                .with_token("mallory-token", UserIdentity::new(3, "mallory")),
        ),
        membership: Arc::new(MemoryMembership::from_rooms([Room::new(
            ROOM,
            RoomKind::Group,
            [1, 2],
        )])),
        log: Arc::new(MemoryMessageLog::new()),
        broadcast: Arc::new(LocalBroadcast::new()),
        presence: presence.clone(),
        env,
    };

    let server = Server::from_parts(listener, collaborators, ConnectionConfig::default());
    let addr = server.local_addr().unwrap();
    let state = server.state().clone();

    let (stop, stop_rx) = oneshot::channel::<()>();
    let server = tokio::spawn(server.run_until(async {
        let _ = stop_rx.await;
    }));

    Running { addr, state, presence, stop, server }
}

async fn connect(addr: SocketAddr, token: Option<&str>) -> Client {
    let url = match token {
        Some(token) => format!("ws://{addr}/ws/chat/{ROOM}?token={token}"),
        None => format!("ws://{addr}/ws/chat/{ROOM}"),
    };
    let (ws, _) = connect_async(url).await.expect("upgrade failed");
    ws
}

/// Next data or close frame, skipping pings and pongs.
async fn next_message(ws: &mut Client) -> Message {
    loop {
        let message = timeout(WAIT, ws.next())
            .await
            .expect("no frame in time")
            .expect("stream ended")
            .unwrap();
        if !matches!(message, Message::Ping(_) | Message::Pong(_)) {
            return message;
        }
    }
}

async fn next_event(ws: &mut Client) -> ServerEvent {
    match next_message(ws).await {
        Message::Text(text) => ServerEvent::from_json(text.as_str()).unwrap(),
        other => panic!("expected text frame, got {other:?}"),
    }
}

async fn close_frame(ws: &mut Client) -> CloseFrame {
    match next_message(ws).await {
        Message::Close(Some(frame)) => frame,
        other => panic!("expected close frame, got {other:?}"),
    }
}

async fn join(addr: SocketAddr, token: &str, user_id: u64) -> Client {
    let mut ws = connect(addr, Some(token)).await;
    assert_eq!(next_event(&mut ws).await, ServerEvent::Connected { room_id: ROOM, user_id });
    ws
}

fn chat(content: &str) -> Message {
    Message::text(serde_json::json!({ "type": "message", "content": content }).to_string())
}

#[tokio::test]
async fn query_token_joins_and_messages_fan_out() {
    let running = start().await;
    let mut alice = join(running.addr, "alice-token", 1).await;
    let mut bob = join(running.addr, "bob-token", 2).await;

    assert_eq!(running.state.registry.members_of(ROOM).len(), 2);

    alice.send(chat("hi")).await.unwrap();

    for ws in [&mut alice, &mut bob] {
        let ServerEvent::Message { data } = next_event(ws).await else {
            panic!("expected message");
        };
        assert_eq!(data.content, "hi");
        assert_eq!(data.sender_id, 1);
        assert_eq!(data.sender_username, "alice");
        assert_eq!(data.sequence, 0);
    }

    let _ = running.stop.send(());
}

#[tokio::test]
async fn bearer_header_joins() {
    let running = start().await;

    let mut request = format!("ws://{}/ws/chat/{ROOM}", running.addr).into_client_request().unwrap();
    request.headers_mut().insert("authorization", HeaderValue::from_static("Bearer bob-token"));
    let (mut bob, _) = connect_async(request).await.unwrap();

    assert_eq!(next_event(&mut bob).await, ServerEvent::Connected { room_id: ROOM, user_id: 2 });
    assert!(running.presence.is_online(2));

    let _ = running.stop.send(());
}

#[tokio::test]
async fn rejected_upgrades_close_with_policy_violation() {
    let running = start().await;

    let cases = [
        (Some("forged"), RejectReason::InvalidCredential),
        (Some("mallory-token"), RejectReason::NotMember),
        (None, RejectReason::MissingCredential),
    ];

    for (token, expected) in cases {
        let mut ws = connect(running.addr, token).await;
        let frame = close_frame(&mut ws).await;

        assert_eq!(u16::from(frame.code), close::POLICY_VIOLATION);
        assert_eq!(frame.reason.as_str(), expected.as_str());
    }

    assert_eq!(running.state.registry.connection_count(), 0);
    assert!(!running.presence.is_online(3));

    let _ = running.stop.send(());
}

#[tokio::test]
async fn pings_do_not_disturb_the_session() {
    let running = start().await;
    let mut alice = join(running.addr, "alice-token", 1).await;
    let mut bob = join(running.addr, "bob-token", 2).await;

    alice.send(Message::Ping(Vec::from("still here?").into())).await.unwrap();
    alice.send(chat("after ping")).await.unwrap();

    let ServerEvent::Message { data } = next_event(&mut bob).await else {
        panic!("expected message");
    };
    assert_eq!(data.content, "after ping");
    assert_eq!(running.state.registry.user_connection_count(1), 1);

    let _ = running.stop.send(());
}

#[tokio::test]
async fn shutdown_waits_for_live_connections() {
    let running = start().await;
    let mut alice = join(running.addr, "alice-token", 1).await;
    let mut bob = join(running.addr, "bob-token", 2).await;

    let _ = running.stop.send(());
    let result = timeout(WAIT, running.server).await.expect("shutdown hung").unwrap();
    assert!(result.is_ok());

    // Every connection task finished before run_until returned
    assert!(running.state.connections.is_empty());
    assert_eq!(running.state.registry.connection_count(), 0);
    assert!(!running.presence.is_online(1));
    assert!(!running.presence.is_online(2));

    for ws in [&mut alice, &mut bob] {
        let frame = close_frame(ws).await;
        assert_eq!(u16::from(frame.code), close::GOING_AWAY);
        assert_eq!(frame.reason.as_str(), "server shutting down");
    }
}
