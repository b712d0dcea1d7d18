//! Connection handler tests over in-memory sockets.
//!
//! Every test drives real `handle_connection` tasks with the production
//! registry, hub and ingest pipeline; only the socket, auth table and clock
//! are doubles.

use std::{
    sync::{Arc, Mutex, mpsc as std_mpsc},
    time::Duration,
};

use roomcast_core::{
    CloseReason, RejectReason, Room, RoomKind, UserIdentity, env::test_utils::MockEnv,
};
use roomcast_proto::{ErrorCode, ServerEvent, close};
use roomcast_server::{
    ChatState, ClientEnd, Collaborators, ConnectionConfig, LocalBroadcast, MemoryMembership,
    MemoryMessageLog, MemoryPresence, MessageLog, NewMessage, OutboundFrame, PageOrder,
    StaticAuthenticator, StorageError, StoredMessage, handle_connection, memory_socket,
    room_topic,
};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::timeout,
};

const ROOM: u64 = 10;
const WAIT: Duration = Duration::from_secs(5);

struct Harness {
    state: ChatState,
    presence: Arc<MemoryPresence>,
    log: Arc<MemoryMessageLog>,
    hub: Arc<LocalBroadcast>,
    shutdown: watch::Sender<bool>,
}

fn harness(config: ConnectionConfig) -> Harness {
    let env = Arc::new(MockEnv::with_seed(7));
    let auth = StaticAuthenticator::new()
        .with_token("alice-token", UserIdentity::new(1, "alice"))
        .with_token("bob-token", UserIdentity::new(2, "bob"))
        .with_token("mallory-token", UserIdentity::new(3, "mallory"));
    let membership = MemoryMembership::from_rooms([Room::new(ROOM, RoomKind::Group, [1, 2])]);

    let presence = Arc::new(MemoryPresence::new(env.clone()));
    let log = Arc::new(MemoryMessageLog::new());
    let hub = Arc::new(LocalBroadcast::new());
    let (shutdown, shutdown_rx) = watch::channel(false);

    let collaborators = Collaborators {
        auth: Arc::new(auth),
        membership: Arc::new(membership),
        log: log.clone(),
        broadcast: hub.clone(),
        presence: presence.clone(),
        env,
    };

    Harness {
        state: ChatState::new(collaborators, config, shutdown_rx),
        presence,
        log,
        hub,
        shutdown,
    }
}

impl Harness {
    /// Spawn a connection task. `socket_capacity` is how many frames the
    /// client buffers before server writes block.
    fn connect(
        &self,
        room_id: u64,
        token: Option<&str>,
        socket_capacity: usize,
    ) -> (JoinHandle<CloseReason>, ClientEnd) {
        let (reader, writer, client) = memory_socket(socket_capacity);
        let state = self.state.clone();
        let credential = token.map(str::to_string);

        let task = tokio::spawn(async move {
            handle_connection(&state, room_id, credential, reader, writer).await
        });
        (task, client)
    }

    /// Connect and wait for the join confirmation.
    async fn join(&self, token: &str, user_id: u64) -> (JoinHandle<CloseReason>, ClientEnd) {
        let (task, mut client) = self.connect(ROOM, Some(token), 256);
        assert_eq!(next_event(&mut client).await, ServerEvent::Connected { room_id: ROOM, user_id });
        (task, client)
    }
}

async fn next_frame(client: &mut ClientEnd) -> OutboundFrame {
    match timeout(WAIT, client.recv()).await {
        Ok(Some(frame)) => frame,
        Ok(None) => panic!("server dropped the socket"),
        Err(_) => panic!("no frame within {WAIT:?}"),
    }
}

async fn next_event(client: &mut ClientEnd) -> ServerEvent {
    match next_frame(client).await {
        OutboundFrame::Text(text) => ServerEvent::from_json(&text).unwrap(),
        other => panic!("expected text frame, got {other:?}"),
    }
}

async fn finished(task: JoinHandle<CloseReason>) -> CloseReason {
    timeout(WAIT, task).await.expect("connection task did not finish").unwrap()
}

fn message(content: &str) -> String {
    serde_json::json!({ "type": "message", "content": content }).to_string()
}

#[tokio::test]
async fn member_joins_and_messages_fan_out() {
    let h = harness(ConnectionConfig::default());
    let (_alice_task, mut alice) = h.join("alice-token", 1).await;
    let (_bob_task, mut bob) = h.join("bob-token", 2).await;

    assert_eq!(h.state.registry.members_of(ROOM).len(), 2);
    assert!(h.presence.is_online(1));
    assert!(h.presence.is_online(2));

    assert!(alice.send_text(&message("hi")).await);

    for client in [&mut alice, &mut bob] {
        let ServerEvent::Message { data } = next_event(client).await else {
            panic!("expected message");
        };
        assert_eq!(data.content, "hi");
        assert_eq!(data.sender_id, 1);
        assert_eq!(data.sender_username, "alice");
        assert_eq!(data.room_id, ROOM);
        assert_eq!(data.sequence, 0);
    }

    let stored = h.log.read_page(ROOM, None, 10, PageOrder::OldestFirst).unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].sender_id, 1);
    assert_eq!(stored[0].content, "hi");
}

#[tokio::test]
async fn rejected_connections_never_join() {
    let h = harness(ConnectionConfig::default());

    let cases = [
        (ROOM, Some("mallory-token"), RejectReason::NotMember),
        (ROOM, Some("forged"), RejectReason::InvalidCredential),
        (ROOM, Some("   "), RejectReason::MissingCredential),
        (ROOM, None, RejectReason::MissingCredential),
        (99, Some("alice-token"), RejectReason::NotMember),
    ];

    for (room_id, token, expected) in cases {
        let (task, mut client) = h.connect(room_id, token, 8);

        assert_eq!(
            next_frame(&mut client).await,
            OutboundFrame::Close { code: close::POLICY_VIOLATION, reason: expected.as_str().to_string() }
        );
        assert_eq!(finished(task).await, CloseReason::Rejected(expected));
    }

    assert_eq!(h.state.registry.connection_count(), 0);
    assert!(h.state.registry.members_of(ROOM).is_empty());
    assert!(h.presence.transitions_for(3).is_empty());
    assert_eq!(h.hub.subscriber_count(&room_topic(ROOM)), 0);
}

#[tokio::test]
async fn client_close_releases_everything() {
    let h = harness(ConnectionConfig::default());
    let (task, mut alice) = h.join("alice-token", 1).await;

    assert!(alice.send_close().await);

    assert_eq!(
        next_frame(&mut alice).await,
        OutboundFrame::Close { code: close::NORMAL, reason: "client closed".to_string() }
    );
    assert_eq!(finished(task).await, CloseReason::ClientClosed);

    assert_eq!(h.state.registry.connection_count(), 0);
    assert_eq!(h.hub.subscriber_count(&room_topic(ROOM)), 0);
    assert_eq!(h.presence.transitions_for(1), vec![true, false]);
    assert!(h.presence.record(1).and_then(|r| r.last_seen).is_some());
}

#[tokio::test]
async fn racing_close_triggers_release_once() {
    let h = harness(ConnectionConfig::default());

    for _ in 0..20 {
        let (task, mut alice) = h.join("alice-token", 1).await;

        // Transport failure, client close, hang-up and shutdown all at once
        let _ = tokio::join!(alice.fail_transport("reset"), alice.send_close());
        alice.hang_up();
        h.shutdown.send_replace(true);

        let reason = finished(task).await;
        assert!(
            matches!(
                reason,
                CloseReason::Transport(_) | CloseReason::ClientClosed | CloseReason::ServerShutdown
            ),
            "unexpected reason {reason:?}"
        );
        h.shutdown.send_replace(false);
    }

    assert_eq!(h.state.registry.connection_count(), 0);
    assert_eq!(h.hub.subscriber_count(&room_topic(ROOM)), 0);

    let transitions = h.presence.transitions_for(1);
    assert_eq!(transitions.len(), 40);
    assert!(transitions.chunks(2).all(|pair| pair == [true, false]));
}

#[tokio::test]
async fn two_tabs_keep_user_online_until_last_closes() {
    let h = harness(ConnectionConfig::default());
    let (first, mut tab1) = h.join("alice-token", 1).await;
    let (second, mut tab2) = h.join("alice-token", 1).await;

    assert_eq!(h.state.registry.user_connection_count(1), 2);

    tab1.hang_up();
    assert_eq!(finished(first).await, CloseReason::ClientClosed);
    assert!(h.presence.is_online(1));

    // The remaining tab still gets room traffic
    let (_bob_task, bob) = h.join("bob-token", 2).await;
    assert!(bob.send_text(&message("still there?")).await);
    let ServerEvent::Message { data } = next_event(&mut tab2).await else {
        panic!("expected message");
    };
    assert_eq!(data.content, "still there?");

    tab2.hang_up();
    assert_eq!(finished(second).await, CloseReason::ClientClosed);
    assert!(!h.presence.is_online(1));
    assert_eq!(h.presence.transitions_for(1), vec![true, false]);
}

#[tokio::test]
async fn stalled_client_is_dropped_without_hurting_others() {
    let config = ConnectionConfig {
        outbound_capacity: 16,
        write_timeout: Duration::from_millis(200),
        ..ConnectionConfig::default()
    };
    let h = harness(config);

    // Alice's socket buffers one frame and she never reads past the
    // confirmation
    let (alice_task, mut alice) = h.connect(ROOM, Some("alice-token"), 1);
    assert_eq!(next_event(&mut alice).await, ServerEvent::Connected { room_id: ROOM, user_id: 1 });
    let alice_handle = h.state.registry.members_of(ROOM).into_iter().next().unwrap();

    let (bob_task, mut bob) = h.join("bob-token", 2).await;
    let (_sender_task, sender) = h.join("bob-token", 2).await;

    let reader = tokio::spawn(async move {
        let mut seen = Vec::new();
        while seen.len() < 100 {
            match next_event(&mut bob).await {
                ServerEvent::Message { data } => seen.push(data.content),
                other => panic!("unexpected event {other:?}"),
            }
        }
        (bob, seen)
    });

    for i in 0..100 {
        assert!(sender.send_text(&message(&format!("m{i}"))).await);
    }
    let (bob, seen) = timeout(WAIT, reader).await.expect("healthy subscriber stalled").unwrap();

    let expected: Vec<String> = (0..100).map(|i| format!("m{i}")).collect();
    assert_eq!(seen, expected);

    let reason = finished(alice_task).await;
    assert!(reason.is_slow_consumer(), "unexpected reason {reason:?}");
    assert_eq!(reason.close_code(), close::TRY_AGAIN_LATER);
    assert!(!h.state.registry.contains(alice_handle));
    assert!(!h.presence.is_online(1));

    // Bob is unaffected
    assert!(!bob_task.is_finished());
    assert!(h.presence.is_online(2));
    drop(bob);
}

#[tokio::test]
async fn frame_errors_go_to_sender_only() {
    let h = harness(ConnectionConfig::default());
    let (alice_task, mut alice) = h.join("alice-token", 1).await;
    let (_bob_task, mut bob) = h.join("bob-token", 2).await;

    assert!(alice.send_text(&message("  ")).await);
    let ServerEvent::Error { code, .. } = next_event(&mut alice).await else {
        panic!("expected error");
    };
    assert_eq!(code, ErrorCode::EmptyMessage);

    assert!(alice.send_text("{not json").await);
    let ServerEvent::Error { code, message: error_message } = next_event(&mut alice).await else {
        panic!("expected error");
    };
    assert_eq!(code, ErrorCode::MalformedFrame);
    assert_eq!(error_message, "Invalid message format");

    // Connection survives; the next valid message is delivered to both
    assert!(alice.send_text(&message("ok")).await);
    for client in [&mut alice, &mut bob] {
        let ServerEvent::Message { data } = next_event(client).await else {
            panic!("expected message");
        };
        assert_eq!(data.content, "ok");
    }

    assert!(bob.try_recv().is_none());
    assert!(!alice_task.is_finished());
    assert_eq!(h.log.total_message_count(), 1);
}

#[tokio::test]
async fn one_senders_messages_arrive_in_order() {
    let h = harness(ConnectionConfig::default());
    let (_alice_task, alice) = h.join("alice-token", 1).await;
    let (_bob_task, mut bob) = h.join("bob-token", 2).await;

    for i in 0..50 {
        assert!(alice.send_text(&message(&format!("m{i}"))).await);
    }

    for i in 0..50u64 {
        let ServerEvent::Message { data } = next_event(&mut bob).await else {
            panic!("expected message");
        };
        assert_eq!(data.content, format!("m{i}"));
        assert_eq!(data.sequence, i);
    }
}

#[tokio::test]
async fn typing_reaches_the_room() {
    let h = harness(ConnectionConfig::default());
    let (_alice_task, alice) = h.join("alice-token", 1).await;
    let (_bob_task, mut bob) = h.join("bob-token", 2).await;

    assert!(alice.send_text(r#"{"type":"typing","is_typing":true}"#).await);

    assert_eq!(
        next_event(&mut bob).await,
        ServerEvent::Typing { room_id: ROOM, user_id: 1, username: "alice".to_string(), is_typing: true }
    );
    assert_eq!(h.log.total_message_count(), 0);
}

#[tokio::test]
async fn binary_frame_closes_with_unsupported_data() {
    let h = harness(ConnectionConfig::default());
    let (task, mut alice) = h.join("alice-token", 1).await;

    assert!(alice.send_binary(&[0xde, 0xad]).await);

    let OutboundFrame::Close { code, .. } = next_frame(&mut alice).await else {
        panic!("expected close frame");
    };
    assert_eq!(code, close::UNSUPPORTED_DATA);
    assert!(matches!(finished(task).await, CloseReason::ProtocolViolation(_)));
    assert_eq!(h.state.registry.connection_count(), 0);
}

#[tokio::test]
async fn transport_error_closes_and_releases() {
    let h = harness(ConnectionConfig::default());
    let (task, alice) = h.join("alice-token", 1).await;

    assert!(alice.fail_transport("connection reset").await);

    assert_eq!(
        finished(task).await,
        CloseReason::Transport("socket I/O error: connection reset".to_string())
    );
    assert_eq!(h.state.registry.connection_count(), 0);
    assert!(!h.presence.is_online(1));
}

#[tokio::test]
async fn shutdown_closes_every_connection() {
    let h = harness(ConnectionConfig::default());
    let (alice_task, mut alice) = h.join("alice-token", 1).await;
    let (bob_task, mut bob) = h.join("bob-token", 2).await;

    h.shutdown.send_replace(true);

    for client in [&mut alice, &mut bob] {
        assert_eq!(
            next_frame(client).await,
            OutboundFrame::Close { code: close::GOING_AWAY, reason: "server shutting down".to_string() }
        );
    }
    assert_eq!(finished(alice_task).await, CloseReason::ServerShutdown);
    assert_eq!(finished(bob_task).await, CloseReason::ServerShutdown);

    assert_eq!(h.state.registry.connection_count(), 0);
    assert_eq!(h.hub.topic_count(), 0);
}

/// Message log whose appends block until the test opens the gate.
struct GatedLog {
    inner: MemoryMessageLog,
    entered: mpsc::UnboundedSender<()>,
    gate: Mutex<std_mpsc::Receiver<()>>,
}

impl MessageLog for GatedLog {
    fn append(&self, message: NewMessage) -> Result<StoredMessage, StorageError> {
        let _ = self.entered.send(());
        // Returns once the sender is dropped
        let _ = self.gate.lock().unwrap().recv();
        self.inner.append(message)
    }

    fn read_page(
        &self,
        room_id: u64,
        before_sequence: Option<u64>,
        limit: usize,
        order: PageOrder,
    ) -> Result<Vec<StoredMessage>, StorageError> {
        self.inner.read_page(room_id, before_sequence, limit, order)
    }

    fn latest_sequence(&self, room_id: u64) -> Result<Option<u64>, StorageError> {
        self.inner.latest_sequence(room_id)
    }
}

#[tokio::test]
async fn stuck_append_does_not_hold_up_shutdown() {
    let (entered_tx, mut entered_rx) = mpsc::unbounded_channel();
    let (gate_tx, gate_rx) = std_mpsc::channel::<()>();
    let log = Arc::new(GatedLog {
        inner: MemoryMessageLog::new(),
        entered: entered_tx,
        gate: Mutex::new(gate_rx),
    });

    let env = Arc::new(MockEnv::with_seed(11));
    let hub = Arc::new(LocalBroadcast::new());
    let (shutdown, shutdown_rx) = watch::channel(false);
    let collaborators = Collaborators {
        auth: Arc::new(
            StaticAuthenticator::new()
                .with_token("alice-token", UserIdentity::new(1, "alice"))
                .with_token("bob-token", UserIdentity::new(2, "bob")),
        ),
        membership: Arc::new(MemoryMembership::from_rooms([Room::new(
            ROOM,
            RoomKind::Group,
            [1, 2],
        )])),
        log: log.clone(),
        broadcast: hub.clone(),
        presence: Arc::new(MemoryPresence::new(env.clone())),
        env,
    };
    let state = ChatState::new(collaborators, ConnectionConfig::default(), shutdown_rx);

    let spawn = |token: &str| {
        let (reader, writer, client) = memory_socket(16);
        let state = state.clone();
        let credential = Some(token.to_string());
        let task = tokio::spawn(async move {
            handle_connection(&state, ROOM, credential, reader, writer).await
        });
        (task, client)
    };

    let (alice_task, mut alice) = spawn("alice-token");
    assert_eq!(next_event(&mut alice).await, ServerEvent::Connected { room_id: ROOM, user_id: 1 });
    let (bob_task, mut bob) = spawn("bob-token");
    assert_eq!(next_event(&mut bob).await, ServerEvent::Connected { room_id: ROOM, user_id: 2 });

    assert!(alice.send_text(&message("stuck")).await);
    timeout(WAIT, entered_rx.recv()).await.expect("append never started");

    // The append is still blocked; shutdown must not wait for it
    shutdown.send_replace(true);
    let reason = timeout(Duration::from_secs(1), alice_task)
        .await
        .expect("connection waited on the stuck append")
        .unwrap();
    assert_eq!(reason, CloseReason::ServerShutdown);
    assert_eq!(finished(bob_task).await, CloseReason::ServerShutdown);
    assert_eq!(state.registry.connection_count(), 0);

    drop(gate_tx);

    // Bob saw the close and nothing else: the abandoned ingest never published
    assert_eq!(
        next_frame(&mut bob).await,
        OutboundFrame::Close { code: close::GOING_AWAY, reason: "server shutting down".to_string() }
    );
    assert!(bob.try_recv().is_none());
    assert_eq!(hub.topic_count(), 0);
}
