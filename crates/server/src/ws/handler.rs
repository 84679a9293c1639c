// Connection gateway and per-connection socket loop.
//
// The credential is presented at connection establishment (query param on
// the upgrade request) and verified before the WebSocket exists; a bad
// token refuses the upgrade with a 401 and no application event is ever
// exchanged. There is no in-band re-authentication.

use anyhow::anyhow;
use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::IntoResponse,
};
use cinesync_common::protocol::ws::{ClientEvent, ServerEvent};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::protocol as ws_protocol;
use super::registry::SessionRegistry;
use super::SyncRouterState;
use crate::chat::{self, Notice};
use crate::error::{ErrorCode, HandlerError, ServerError};
use crate::metrics;
use crate::playback;
use crate::presence;
use crate::store::Stores;

// Liveness probe: the server pings every HEARTBEAT_INTERVAL_MS and forces
// a disconnect when no pong arrives within HEARTBEAT_TIMEOUT_MS.
pub(crate) const HEARTBEAT_INTERVAL_MS: u64 = 25_000;
pub(crate) const HEARTBEAT_TIMEOUT_MS: u64 = 60_000;
pub(crate) const MAX_FRAME_BYTES: u32 = 1_048_576;

#[derive(Debug, Deserialize)]
pub(crate) struct ConnectQuery {
    #[serde(default)]
    token: Option<String>,
}

pub(crate) async fn ws_upgrade(
    State(state): State<SyncRouterState>,
    Query(query): Query<ConnectQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let Some(token) = query.token.filter(|token| !token.is_empty()) else {
        return ServerError::new(ErrorCode::AuthInvalidToken, "missing credential token")
            .into_response();
    };

    let access = match state.jwt_service.validate_access_token(&token) {
        Ok(access) => access,
        Err(error) => {
            warn!(error = ?error, "refusing connection: credential rejected");
            return ServerError::new(
                ErrorCode::AuthInvalidToken,
                "invalid or expired credential token",
            )
            .into_response();
        }
    };

    let registry = state.registry.clone();
    let stores = state.stores.clone();
    let session_id = Uuid::new_v4();
    ws.max_frame_size(MAX_FRAME_BYTES as usize)
        .on_upgrade(move |socket| {
            handle_socket(registry, stores, session_id, access.user_id, socket)
        })
        .into_response()
}

fn frame_size_exceeded_reason() -> String {
    format!("websocket frame exceeds maximum size of {MAX_FRAME_BYTES} bytes")
}

fn is_frame_size_violation(error: &axum::Error) -> bool {
    let message = error.to_string().to_ascii_lowercase();
    message.contains("message too long")
        || message.contains("frame too long")
        || message.contains("too large")
        || message.contains("too big")
        || message.contains("size limit")
}

async fn close_frame_too_large(socket: &mut WebSocket) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: close_code::SIZE,
            reason: frame_size_exceeded_reason().into(),
        })))
        .await;
}

async fn handle_socket(
    registry: std::sync::Arc<SessionRegistry>,
    stores: Stores,
    session_id: Uuid,
    user_id: Uuid,
    mut socket: WebSocket,
) {
    registry.create_session(session_id, user_id).await;
    info!(%session_id, %user_id, "session connected");

    let (outbound_sender, mut outbound_receiver) = mpsc::unbounded_channel::<ServerEvent>();
    if !registry.register_outbound(session_id, outbound_sender).await {
        registry.remove_session(session_id).await;
        return;
    }

    let mut heartbeat_interval =
        tokio::time::interval(std::time::Duration::from_millis(HEARTBEAT_INTERVAL_MS));
    heartbeat_interval.reset(); // skip immediate first tick
    let mut last_pong = Instant::now();
    let heartbeat_timeout = std::time::Duration::from_millis(HEARTBEAT_TIMEOUT_MS);

    loop {
        tokio::select! {
            _ = heartbeat_interval.tick() => {
                if last_pong.elapsed() > heartbeat_timeout {
                    warn!(%session_id, %user_id, "heartbeat timeout, disconnecting");
                    break;
                }
                if socket.send(Message::Ping(vec![].into())).await.is_err() {
                    break;
                }
            }
            maybe_outbound = outbound_receiver.recv() => {
                match maybe_outbound {
                    Some(outbound_event) => {
                        if ws_protocol::send_server_event(&mut socket, &outbound_event).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            maybe_message = socket.recv() => {
                let Some(message) = maybe_message else {
                    break;
                };

                match message {
                    Ok(Message::Text(raw_message)) => {
                        if raw_message.len() > MAX_FRAME_BYTES as usize {
                            close_frame_too_large(&mut socket).await;
                            break;
                        }

                        let inbound = match ws_protocol::decode_client_event(&raw_message) {
                            Ok(event) => event,
                            Err(_) => {
                                let reply = ErrorCode::ValidationFailed
                                    .event("invalid websocket frame payload");
                                if ws_protocol::send_server_event(&mut socket, &reply).await.is_err() {
                                    break;
                                }
                                continue;
                            }
                        };

                        let replies =
                            dispatch_event(&stores, &registry, session_id, user_id, inbound).await;
                        let mut send_failed = false;
                        for reply in replies {
                            if ws_protocol::send_server_event(&mut socket, &reply).await.is_err() {
                                send_failed = true;
                                break;
                            }
                        }
                        if send_failed {
                            break;
                        }
                    }
                    Ok(Message::Ping(payload)) => {
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Pong(_)) => {
                        last_pong = Instant::now();
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(error) => {
                        if is_frame_size_violation(&error) {
                            close_frame_too_large(&mut socket).await;
                        }
                        break;
                    }
                }
            }
        }
    }

    // Voluntary and forced disconnects take the same path: drop the session
    // from the channel first so it never sees its own departure, then run
    // the leave cleanup for the room it was bound to.
    if let Some((user_id, Some(room_id))) = registry.remove_session(session_id).await {
        if let Err(cleanup_error) = leave_cleanup(&stores, &registry, room_id, user_id).await {
            error!(error = ?cleanup_error, %session_id, %room_id, "disconnect cleanup failed");
        }
    }
    info!(%session_id, %user_id, "session disconnected");
}

fn event_name(event: &ClientEvent) -> &'static str {
    match event {
        ClientEvent::Join { .. } => "join",
        ClientEvent::Leave { .. } => "leave",
        ClientEvent::Play { .. } => "play",
        ClientEvent::Pause { .. } => "pause",
        ClientEvent::Seek { .. } => "seek",
        ClientEvent::Change { .. } => "change",
        ClientEvent::Message { .. } => "message",
    }
}

/// Run one inbound event and turn its outcome into frames for the caller.
///
/// Client errors surface to the originating session only. Collaborator
/// failures are logged and swallowed — the caller sees nothing happen —
/// except for join, which surfaces a generic failure.
async fn dispatch_event(
    stores: &Stores,
    registry: &SessionRegistry,
    session_id: Uuid,
    user_id: Uuid,
    event: ClientEvent,
) -> Vec<ServerEvent> {
    let name = event_name(&event);
    let started_at = Instant::now();

    let result = match event {
        ClientEvent::Join { room_id, password } => {
            handle_join(stores, registry, session_id, user_id, room_id, password).await
        }
        ClientEvent::Leave { room_id } => {
            handle_leave(stores, registry, session_id, user_id, room_id).await
        }
        ClientEvent::Play { room_id } => {
            playback::handle_play(stores, registry, user_id, room_id).await
        }
        ClientEvent::Pause { room_id } => {
            playback::handle_pause(stores, registry, user_id, room_id).await
        }
        ClientEvent::Seek { room_id, time } => {
            playback::handle_seek(stores, registry, user_id, room_id, time).await
        }
        ClientEvent::Change { room_id, url, platform } => {
            playback::handle_change(stores, registry, user_id, room_id, url, platform).await
        }
        ClientEvent::Message { room_id, content } => {
            chat::handle_message(stores, registry, user_id, room_id, content).await
        }
    };

    let latency_ms = started_at.elapsed().as_millis() as u64;
    match result {
        Ok(replies) => {
            metrics::record_ws_request(name, false, latency_ms);
            replies
        }
        Err(HandlerError::Client(reply)) => {
            metrics::record_ws_request(name, true, latency_ms);
            vec![reply]
        }
        Err(HandlerError::Internal(handler_error)) => {
            metrics::record_ws_request(name, true, latency_ms);
            error!(
                error = ?handler_error,
                %session_id,
                %user_id,
                event = name,
                "collaborator failure while handling event",
            );
            if name == "join" {
                vec![ErrorCode::InternalError.event("Failed to join room")]
            } else {
                Vec::new()
            }
        }
    }
}

/// Bind the session to a room. The caller gets the room snapshot and the
/// chat history; the room gets an updated participant list and a system
/// join notice.
///
/// The `password` field rides the frame for wire compatibility; password
/// checks belong to the room CRUD layer, not the sync engine.
async fn handle_join(
    stores: &Stores,
    registry: &SessionRegistry,
    session_id: Uuid,
    user_id: Uuid,
    room_id: Uuid,
    _password: Option<String>,
) -> Result<Vec<ServerEvent>, HandlerError> {
    let Some(room) = stores.rooms.fetch(room_id).await? else {
        return Err(HandlerError::client(ErrorCode::NotFound, "Room not found"));
    };

    presence::ensure_member(&stores.rooms, &room, user_id).await?;

    let previous = registry
        .bind_room(session_id, room_id)
        .await
        .ok_or_else(|| HandlerError::Internal(anyhow!("session {session_id} vanished mid-join")))?;
    if let Some(previous_room) = previous {
        if previous_room != room_id {
            // Switching rooms runs the full leave path for the old room.
            leave_cleanup(stores, registry, previous_room, user_id).await?;
        }
    }

    let mut replies = vec![ServerEvent::RoomUpdate { room }];
    replies.push(chat::history_event(stores, room_id).await?);

    presence::broadcast_participants(stores, registry, room_id).await?;
    chat::post_system_notice(stores, registry, room_id, user_id, Notice::Joined).await?;

    Ok(replies)
}

async fn handle_leave(
    stores: &Stores,
    registry: &SessionRegistry,
    session_id: Uuid,
    user_id: Uuid,
    room_id: Uuid,
) -> Result<Vec<ServerEvent>, HandlerError> {
    match registry.room_for_session(session_id).await {
        Some(bound_room) if bound_room == room_id => {
            registry.unbind_room(session_id).await;
            leave_cleanup(stores, registry, room_id, user_id).await?;
        }
        _ => {
            debug!(%session_id, %room_id, "leave for a room the session is not bound to");
        }
    }
    Ok(Vec::new())
}

/// Shared by explicit leave, implicit room switch, and disconnect:
/// membership removal, system leave notice, presence rebroadcast.
pub(crate) async fn leave_cleanup(
    stores: &Stores,
    registry: &SessionRegistry,
    room_id: Uuid,
    user_id: Uuid,
) -> anyhow::Result<()> {
    presence::remove_member(&stores.rooms, room_id, user_id).await?;
    chat::post_system_notice(stores, registry, room_id, user_id, Notice::Left).await?;
    presence::broadcast_participants(stores, registry, room_id).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::router;
    use crate::auth::jwt::AccessTokenService;
    use crate::store::rooms::NewRoom;
    use crate::store::Stores;
    use crate::ws::registry::SessionRegistry;
    use chrono::Utc;
    use cinesync_common::protocol::ws::{ClientEvent, ServerEvent};
    use cinesync_common::types::{MessageKind, Room, User};
    use futures_util::{SinkExt, StreamExt};
    use std::sync::Arc;
    use tokio::net::TcpListener;
    use tokio::time::timeout;
    use tokio_tungstenite::{
        connect_async, tungstenite, tungstenite::Message as WsFrame, MaybeTlsStream,
        WebSocketStream,
    };
    use uuid::Uuid;

    const TEST_SECRET: &str = "cinesync_test_secret_that_is_definitely_long_enough";

    type ClientSocket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

    struct TestServer {
        ws_url: String,
        jwt_service: Arc<AccessTokenService>,
        stores: Stores,
    }

    async fn spawn_server() -> TestServer {
        let jwt_service =
            Arc::new(AccessTokenService::new(TEST_SECRET).expect("jwt service should initialize"));
        let stores = Stores::memory();
        let registry = Arc::new(SessionRegistry::default());
        let app = router(jwt_service.clone(), registry, stores.clone());

        let listener =
            TcpListener::bind("127.0.0.1:0").await.expect("listener should bind");
        let addr = listener.local_addr().expect("listener should have an address");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("test server should serve");
        });

        TestServer { ws_url: format!("ws://{addr}/v1/ws"), jwt_service, stores }
    }

    fn sample_user(name: &str) -> User {
        User {
            id: Uuid::new_v4(),
            username: None,
            display_name: name.to_string(),
            avatar_url: None,
            created_at: Utc::now(),
            last_active: Utc::now(),
        }
    }

    async fn seed_user(server: &TestServer, name: &str) -> User {
        let user = sample_user(name);
        server.stores.users.insert_for_tests(user.clone()).await;
        user
    }

    async fn seed_room(server: &TestServer, host_id: Uuid, max_participants: i32) -> Room {
        server
            .stores
            .rooms
            .create(NewRoom {
                name: "movie night".to_string(),
                host_id,
                max_participants,
                is_public: true,
                password_hash: None,
            })
            .await
            .expect("room should be created")
    }

    async fn connect(server: &TestServer, user_id: Uuid) -> ClientSocket {
        let token =
            server.jwt_service.issue_access_token(user_id).expect("token should be issued");
        let (socket, _) = connect_async(format!("{}?token={token}", server.ws_url))
            .await
            .expect("websocket should connect");
        socket
    }

    async fn ws_send(socket: &mut ClientSocket, event: &ClientEvent) {
        let raw = serde_json::to_string(event).expect("client event should serialize");
        socket.send(WsFrame::Text(raw.into())).await.expect("client event should send");
    }

    async fn ws_recv(socket: &mut ClientSocket) -> ServerEvent {
        loop {
            let next = timeout(std::time::Duration::from_secs(2), socket.next())
                .await
                .expect("timed out waiting for websocket frame");
            let frame =
                next.expect("websocket should remain open").expect("frame should decode");

            match frame {
                WsFrame::Text(payload) => {
                    return serde_json::from_str::<ServerEvent>(&payload)
                        .expect("text frame should decode as server event");
                }
                WsFrame::Ping(payload) => {
                    socket.send(WsFrame::Pong(payload)).await.expect("pong should send");
                }
                WsFrame::Close(_) => panic!("websocket closed unexpectedly"),
                WsFrame::Binary(_) | WsFrame::Pong(_) | WsFrame::Frame(_) => {}
            }
        }
    }

    async fn join(socket: &mut ClientSocket, room_id: Uuid) {
        ws_send(socket, &ClientEvent::Join { room_id, password: None }).await;
    }

    #[tokio::test]
    async fn connection_without_token_is_refused() {
        let server = spawn_server().await;

        let error = connect_async(server.ws_url.clone())
            .await
            .expect_err("upgrade must be refused without a token");
        let tungstenite::Error::Http(response) = error else {
            panic!("expected an http refusal, got {error:?}");
        };
        assert_eq!(response.status(), 401);
    }

    #[tokio::test]
    async fn connection_with_garbage_token_is_refused() {
        let server = spawn_server().await;

        let error = connect_async(format!("{}?token=not-a-jwt", server.ws_url))
            .await
            .expect_err("upgrade must be refused for an invalid token");
        let tungstenite::Error::Http(response) = error else {
            panic!("expected an http refusal, got {error:?}");
        };
        assert_eq!(response.status(), 401);
    }

    #[tokio::test]
    async fn join_delivers_snapshot_history_participants_and_notice() {
        let server = spawn_server().await;
        let host = seed_user(&server, "Alice").await;
        let room = seed_room(&server, host.id, 10).await;

        let mut socket = connect(&server, host.id).await;
        join(&mut socket, room.id).await;

        let ServerEvent::RoomUpdate { room: snapshot } = ws_recv(&mut socket).await else {
            panic!("first frame must be the room snapshot");
        };
        assert_eq!(snapshot.id, room.id);

        let ServerEvent::ChatHistory { room_id, messages } = ws_recv(&mut socket).await else {
            panic!("second frame must be the chat history");
        };
        assert_eq!(room_id, room.id);
        assert!(messages.is_empty());

        let ServerEvent::Participants { participants, .. } = ws_recv(&mut socket).await else {
            panic!("third frame must be the participant list");
        };
        assert_eq!(participants, vec![host.clone()]);

        let ServerEvent::NewMessage { message } = ws_recv(&mut socket).await else {
            panic!("fourth frame must be the join notice");
        };
        assert_eq!(message.message.kind, MessageKind::System);
        assert_eq!(message.message.content, "Alice joined the room");
    }

    #[tokio::test]
    async fn join_unknown_room_reports_not_found() {
        let server = spawn_server().await;
        let user = seed_user(&server, "Alice").await;

        let mut socket = connect(&server, user.id).await;
        join(&mut socket, Uuid::new_v4()).await;

        let ServerEvent::Error { code, message } = ws_recv(&mut socket).await else {
            panic!("expected an error frame");
        };
        assert_eq!(code, "NOT_FOUND");
        assert_eq!(message, "Room not found");
    }

    #[tokio::test]
    async fn host_playback_fans_out_and_non_host_is_rejected() {
        let server = spawn_server().await;
        let host = seed_user(&server, "Alice").await;
        let viewer = seed_user(&server, "Bob").await;
        let room = seed_room(&server, host.id, 10).await;

        let mut host_socket = connect(&server, host.id).await;
        join(&mut host_socket, room.id).await;
        for _ in 0..4 {
            ws_recv(&mut host_socket).await; // snapshot, history, participants, notice
        }

        let mut viewer_socket = connect(&server, viewer.id).await;
        join(&mut viewer_socket, room.id).await;
        for _ in 0..4 {
            ws_recv(&mut viewer_socket).await;
        }
        // The host sees the viewer arrive.
        ws_recv(&mut host_socket).await; // participants
        ws_recv(&mut host_socket).await; // join notice

        // Non-host control is rejected with no state change.
        ws_send(&mut viewer_socket, &ClientEvent::Play { room_id: room.id }).await;
        let ServerEvent::Error { code, message } = ws_recv(&mut viewer_socket).await else {
            panic!("expected an error frame");
        };
        assert_eq!(code, "AUTH_FORBIDDEN");
        assert_eq!(message, "Only host can control playback");
        let persisted = server.stores.rooms.fetch(room.id).await.unwrap().unwrap();
        assert!(!persisted.is_playing);

        // Host control reaches every subscriber.
        ws_send(&mut host_socket, &ClientEvent::Play { room_id: room.id }).await;
        let expected = ServerEvent::StateChanged { playing: true, current_time: 0.0 };
        assert_eq!(ws_recv(&mut viewer_socket).await, expected);
        assert_eq!(ws_recv(&mut host_socket).await, expected);
    }

    #[tokio::test]
    async fn chat_messages_are_enriched_and_fanned_out() {
        let server = spawn_server().await;
        let host = seed_user(&server, "Alice").await;
        let room = seed_room(&server, host.id, 10).await;

        let mut socket = connect(&server, host.id).await;
        join(&mut socket, room.id).await;
        for _ in 0..4 {
            ws_recv(&mut socket).await;
        }

        ws_send(
            &mut socket,
            &ClientEvent::Message { room_id: room.id, content: "hello room".to_string() },
        )
        .await;

        let ServerEvent::NewMessage { message } = ws_recv(&mut socket).await else {
            panic!("expected the chat broadcast");
        };
        assert_eq!(message.message.content, "hello room");
        assert_eq!(message.user.id, host.id);
    }

    #[tokio::test]
    async fn disconnect_runs_the_leave_path_once() {
        let server = spawn_server().await;
        let host = seed_user(&server, "Alice").await;
        let viewer = seed_user(&server, "Bob").await;
        let room = seed_room(&server, host.id, 10).await;

        let mut host_socket = connect(&server, host.id).await;
        join(&mut host_socket, room.id).await;
        for _ in 0..4 {
            ws_recv(&mut host_socket).await;
        }

        let mut viewer_socket = connect(&server, viewer.id).await;
        join(&mut viewer_socket, room.id).await;
        for _ in 0..4 {
            ws_recv(&mut viewer_socket).await;
        }
        ws_recv(&mut host_socket).await; // participants
        ws_recv(&mut host_socket).await; // join notice

        viewer_socket.close(None).await.expect("close should send");

        let ServerEvent::NewMessage { message } = ws_recv(&mut host_socket).await else {
            panic!("expected the leave notice");
        };
        assert_eq!(message.message.content, "Bob left the room");

        let ServerEvent::Participants { participants, .. } = ws_recv(&mut host_socket).await
        else {
            panic!("expected exactly one participant rebroadcast");
        };
        assert_eq!(participants, vec![host.clone()]);

        let remaining = server.stores.rooms.participant_ids(room.id).await.unwrap();
        assert_eq!(remaining, vec![host.id]);
    }

    #[tokio::test]
    async fn switching_rooms_emits_the_leave_path_for_the_old_room() {
        let server = spawn_server().await;
        let host = seed_user(&server, "Alice").await;
        let traveler = seed_user(&server, "Bob").await;
        let room_a = seed_room(&server, host.id, 10).await;
        let room_b = seed_room(&server, host.id, 10).await;

        let mut host_socket = connect(&server, host.id).await;
        join(&mut host_socket, room_a.id).await;
        for _ in 0..4 {
            ws_recv(&mut host_socket).await;
        }

        let mut traveler_socket = connect(&server, traveler.id).await;
        join(&mut traveler_socket, room_a.id).await;
        for _ in 0..4 {
            ws_recv(&mut traveler_socket).await;
        }
        ws_recv(&mut host_socket).await; // participants
        ws_recv(&mut host_socket).await; // join notice

        // Joining room B implicitly leaves room A, notice included.
        join(&mut traveler_socket, room_b.id).await;

        let ServerEvent::NewMessage { message } = ws_recv(&mut host_socket).await else {
            panic!("expected the implicit leave notice in the old room");
        };
        assert_eq!(message.message.kind, MessageKind::System);
        assert_eq!(message.message.content, "Bob left the room");

        let ServerEvent::Participants { participants, .. } = ws_recv(&mut host_socket).await
        else {
            panic!("expected the old room's participant rebroadcast");
        };
        assert_eq!(participants, vec![host.clone()]);

        assert_eq!(
            server.stores.rooms.participant_ids(room_b.id).await.unwrap(),
            vec![traveler.id],
        );
    }

    #[tokio::test]
    async fn malformed_frames_get_a_validation_error() {
        let server = spawn_server().await;
        let user = seed_user(&server, "Alice").await;

        let mut socket = connect(&server, user.id).await;
        socket
            .send(WsFrame::Text("{\"type\":\"warp\"}".into()))
            .await
            .expect("frame should send");

        let ServerEvent::Error { code, .. } = ws_recv(&mut socket).await else {
            panic!("expected an error frame");
        };
        assert_eq!(code, "VALIDATION_FAILED");
    }
}
