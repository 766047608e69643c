//! Drives a full session against an in-process token service and room.

use axum::{
    Json, Router,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde_json::{Value, json};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::sync::mpsc;
use voxroom_client::{console, microphone::UnavailableMicrophone};
use voxroom_core::{
    controller::{ControllerConfig, SessionController},
    credential::HttpCredentialFetcher,
    types::{ChatSender, ConnectionStatus, SessionSnapshot},
};
use voxroom_transport::WsTransport;

#[derive(Clone)]
struct Backend {
    addr: SocketAddr,
    room_log: mpsc::UnboundedSender<Value>,
}

async fn generate_token(State(backend): State<Backend>, Json(body): Json<Value>) -> Response {
    if body["room_name"] == "closed-room" {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "detail": "Token generation failed: room is closed" })),
        )
            .into_response();
    }
    Json(json!({
        "token": format!("token-for-{}", body["participant_name"].as_str().unwrap_or_default()),
        "url": format!("ws://{}/rtc", backend.addr),
        "room_name": body["room_name"],
        "participant_name": body["participant_name"],
    }))
    .into_response()
}

async fn rtc(ws: WebSocketUpgrade, headers: HeaderMap, State(backend): State<Backend>) -> Response {
    let authorized = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == "Bearer token-for-alice");
    if !authorized {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    ws.on_upgrade(move |socket| agent_room(socket, backend))
}

async fn send_json(socket: &mut WebSocket, frame: Value) {
    let _ = socket.send(Message::Text(frame.to_string().into())).await;
}

/// A room with one agent that greets the user and answers chat messages.
async fn agent_room(mut socket: WebSocket, backend: Backend) {
    send_json(
        &mut socket,
        json!({ "type": "joined", "room": "voice-room", "identity": "alice" }),
    )
    .await;
    send_json(
        &mut socket,
        json!({ "type": "participant_joined", "identity": "agent-7", "agent": true }),
    )
    .await;

    while let Some(Ok(message)) = socket.recv().await {
        let Message::Text(text) = message else {
            continue;
        };
        let frame: Value = serde_json::from_str(text.as_str()).unwrap();
        let _ = backend.room_log.send(frame.clone());
        match frame["type"].as_str() {
            Some("chat") => {
                let reply = format!("You said: {}", frame["text"].as_str().unwrap_or_default());
                send_json(
                    &mut socket,
                    json!({
                        "type": "chat",
                        "sender": "agent",
                        "text": reply,
                        "sentAt": "2025-01-01T12:00:00Z"
                    }),
                )
                .await;
            }
            Some("leave") => break,
            _ => {}
        }
    }
}

async fn start_backend() -> (String, mpsc::UnboundedReceiver<Value>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (room_log, log) = mpsc::unbounded_channel();
    let app = Router::new()
        .route("/api/generate-token", post(generate_token))
        .route("/rtc", get(rtc))
        .with_state(Backend { addr, room_log });
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{}", addr), log)
}

fn client(api_url: &str, room: &str) -> SessionController {
    SessionController::new(
        ControllerConfig {
            connect_timeout: Duration::from_secs(5),
            ..Default::default()
        },
        Arc::new(HttpCredentialFetcher::new(api_url, room, "alice")),
        Arc::new(WsTransport::new()),
        Arc::new(UnavailableMicrophone),
    )
}

async fn until(
    controller: &SessionController,
    predicate: impl FnMut(&SessionSnapshot) -> bool,
) -> SessionSnapshot {
    tokio::time::timeout(Duration::from_secs(10), controller.wait_for(predicate))
        .await
        .expect("timed out waiting for controller state")
        .expect("controller stopped")
}

#[tokio::test]
async fn test_full_session() {
    let (api_url, mut room_log) = start_backend().await;
    let controller = client(&api_url, "voice-room");
    let mut transitions = controller.subscribe_transitions();

    controller.connect();
    let snapshot = until(&controller, |s| {
        s.connection_status == ConnectionStatus::Connected && s.agent_present
    })
    .await;
    assert!(!snapshot.is_speaking);
    assert!(snapshot.error.is_none());

    controller.send_chat_message("What are your opening hours?");
    let snapshot = until(&controller, |s| s.chat_messages.len() == 2).await;
    assert_eq!(snapshot.chat_messages[0].sender, ChatSender::User);
    assert_eq!(snapshot.chat_messages[1].sender, ChatSender::Agent);
    assert_eq!(
        snapshot.chat_messages[1].text,
        "You said: What are your opening hours?"
    );
    assert_eq!(
        console::describe_change(&SessionSnapshot::new(80.0), &snapshot)
            .last()
            .map(|line| line.ends_with("agent: You said: What are your opening hours?")),
        Some(true)
    );

    // No audio input in this build: the session stays up and only reports.
    controller.toggle_speaking();
    let snapshot = until(&controller, |s| s.error.is_some()).await;
    assert_eq!(snapshot.connection_status, ConnectionStatus::Connected);
    assert!(!snapshot.is_speaking);

    controller.disconnect();
    until(&controller, |s| s.connection_status == ConnectionStatus::Disconnected).await;

    let mut frames = Vec::new();
    while frames.last().map(String::as_str) != Some("leave") {
        let frame = tokio::time::timeout(Duration::from_secs(5), room_log.recv())
            .await
            .expect("room never saw the leave frame")
            .expect("room stopped");
        frames.push(frame["type"].as_str().unwrap_or_default().to_string());
    }
    assert_eq!(frames, vec!["chat".to_string(), "leave".to_string()]);

    assert_eq!(transitions.recv().await.unwrap(), ConnectionStatus::Connecting);
    assert_eq!(transitions.recv().await.unwrap(), ConnectionStatus::Connected);
    assert_eq!(transitions.recv().await.unwrap(), ConnectionStatus::Disconnected);
}

#[tokio::test]
async fn test_token_service_failure_is_reported() {
    let (api_url, _room_log) = start_backend().await;
    let controller = client(&api_url, "closed-room");

    controller.connect();
    let snapshot = until(&controller, |s| s.error.is_some()).await;
    assert_eq!(snapshot.connection_status, ConnectionStatus::Disconnected);
    let error = snapshot.error.unwrap();
    assert!(error.contains("500"));
    assert!(error.contains("room is closed"));
}

#[tokio::test]
async fn test_unreachable_room_fails_attempt() {
    let (api_url, _room_log) = start_backend().await;
    // The room rejects any identity other than alice.
    let controller = SessionController::new(
        ControllerConfig::default(),
        Arc::new(HttpCredentialFetcher::new(&api_url, "voice-room", "mallory")),
        Arc::new(WsTransport::new()),
        Arc::new(UnavailableMicrophone),
    );

    controller.connect();
    let snapshot = until(&controller, |s| s.error.is_some()).await;
    assert_eq!(snapshot.connection_status, ConnectionStatus::Disconnected);
    assert!(snapshot.error.unwrap().starts_with("Voice connection failed"));
}
