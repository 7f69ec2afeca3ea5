#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use url::Url;

use tugo_client::realtime::stomp::{decode_frames, Command, Frame};
use tugo_client::realtime::TransportSettings;
use tugo_client::session::{LogNavigator, RefreshSettings, RefreshSignals, SessionClient};
use tugo_client::storage::{KeyValueStore, MemoryStore};

pub const USER_ID: i64 = 7;

// ---------------------------------------------------------------------------
// Fake backend state
// ---------------------------------------------------------------------------

#[derive(Clone, Debug)]
pub enum BrokerEvent {
    Push { destination: String, body: String },
    /// Send a STOMP ERROR frame and leave the socket open.
    Error { message: String },
    Kick,
}

/// Counters and knobs shared by the fake REST API and the fake broker.
pub struct BackendState {
    pub refresh_calls: AtomicUsize,
    pub logout_calls: AtomicUsize,
    pub room_list_calls: AtomicUsize,
    pub refresh_ok: AtomicBool,
    pub refresh_delay_ms: AtomicU64,
    pub unread: AtomicU64,
    pub read_count: AtomicU64,
    /// Current session generation; `session=v{n}` is the only valid cookie.
    generation: AtomicU64,

    pub connections: AtomicUsize,
    pub disconnects: AtomicUsize,
    pub handshake_cookies: Mutex<Vec<Option<String>>>,
    /// `heart-beat` header of every CONNECT received.
    pub connect_heartbeats: Mutex<Vec<String>>,
    /// `heart-beat` header the broker answers CONNECT with. It never
    /// actually sends heart-beats.
    pub broker_heartbeat: Mutex<String>,
    /// Live broker subscriptions: id → destination.
    pub subscriptions: Mutex<HashMap<String, String>>,
    /// SEND frames received: (destination, body).
    pub sent: Mutex<Vec<(String, String)>>,
    pub open_room_bodies: Mutex<Vec<Value>>,
    events: broadcast::Sender<BrokerEvent>,
}

impl BackendState {
    fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            refresh_calls: AtomicUsize::new(0),
            logout_calls: AtomicUsize::new(0),
            room_list_calls: AtomicUsize::new(0),
            refresh_ok: AtomicBool::new(true),
            refresh_delay_ms: AtomicU64::new(0),
            unread: AtomicU64::new(0),
            read_count: AtomicU64::new(0),
            generation: AtomicU64::new(0),
            connections: AtomicUsize::new(0),
            disconnects: AtomicUsize::new(0),
            handshake_cookies: Mutex::new(Vec::new()),
            connect_heartbeats: Mutex::new(Vec::new()),
            broker_heartbeat: Mutex::new("0,0".to_string()),
            subscriptions: Mutex::new(HashMap::new()),
            sent: Mutex::new(Vec::new()),
            open_room_bodies: Mutex::new(Vec::new()),
            events,
        }
    }

    pub fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    pub fn set_refresh_ok(&self, ok: bool) {
        self.refresh_ok.store(ok, Ordering::SeqCst);
    }

    pub fn set_refresh_delay(&self, delay: Duration) {
        self.refresh_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Invalidate the current session cookie, as an access token expiry would.
    pub fn expire_session(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    pub fn subscriptions_to(&self, destination: &str) -> usize {
        self.subscriptions
            .lock()
            .values()
            .filter(|d| d.as_str() == destination)
            .count()
    }

    pub fn push(&self, destination: &str, body: &str) {
        // send() returns Err if there are no receivers; that's fine.
        let _ = self.events.send(BrokerEvent::Push {
            destination: destination.to_string(),
            body: body.to_string(),
        });
    }

    /// Report a broker error on every connection.
    pub fn fail(&self, message: &str) {
        let _ = self.events.send(BrokerEvent::Error {
            message: message.to_string(),
        });
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Close every broker connection with a SockJS close frame.
    pub fn kick(&self) {
        let _ = self.events.send(BrokerEvent::Kick);
    }

    fn authorized(&self, headers: &HeaderMap) -> bool {
        let generation = self.generation.load(Ordering::SeqCst);
        if generation == 0 {
            return false;
        }
        let expected = format!("session=v{generation}");
        headers
            .get_all(header::COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(';'))
            .any(|pair| pair.trim() == expected)
    }
}

type Shared = Arc<BackendState>;

pub struct Backend {
    pub addr: SocketAddr,
    pub url: Url,
    pub state: Shared,
}

/// Start the fake REST API and SockJS broker on an ephemeral port.
pub async fn start_backend() -> Backend {
    let state = Arc::new(BackendState::new());
    let app = Router::new()
        .route("/api/v1/auth/refresh", post(refresh))
        .route("/api/v1/auth/logout", post(logout))
        .route("/api/v1/notes/rooms", get(list_rooms).post(open_room))
        .route("/api/v1/notes/rooms/{id}/messages", get(room_messages))
        .route("/api/v1/notes/rooms/{id}/read", patch(mark_read))
        .route("/api/v1/notes/unread-count", get(unread_count))
        .route("/api/v1/probe/no-content", get(no_content))
        .route("/api/v1/probe/reset-content", get(reset_content))
        .route("/api/v1/probe/empty", get(empty_ok))
        .route("/api/v1/probe/broken", get(broken))
        .route("/ws-stomp/{server}/{session}/websocket", get(ws_upgrade))
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    Backend {
        addr,
        url: Url::parse(&format!("http://{addr}/")).unwrap(),
        state,
    }
}

// ---------------------------------------------------------------------------
// Client helpers
// ---------------------------------------------------------------------------

/// Refresh settings with a short foreign-lock wait.
pub fn fast_refresh() -> RefreshSettings {
    RefreshSettings {
        lock_wait: Duration::from_millis(100),
        ..RefreshSettings::default()
    }
}

pub fn fast_transport() -> TransportSettings {
    TransportSettings {
        reconnect_delay: Duration::from_millis(100),
        heartbeat: Duration::from_secs(1),
    }
}

pub fn client_with(
    backend: &Backend,
    store: Arc<dyn KeyValueStore>,
    signals: RefreshSignals,
    navigator: Arc<LogNavigator>,
    settings: RefreshSettings,
) -> SessionClient {
    SessionClient::builder(backend.url.clone())
        .store(store)
        .signals(signals)
        .navigator(navigator)
        .settings(settings)
        .build()
        .expect("build client")
}

pub fn client(backend: &Backend) -> SessionClient {
    client_with(
        backend,
        Arc::new(MemoryStore::new()),
        RefreshSignals::new(),
        Arc::new(LogNavigator::new()),
        fast_refresh(),
    )
}

/// A client that already holds a valid session cookie.
pub async fn logged_in_client(backend: &Backend) -> SessionClient {
    let client = client(backend);
    assert!(client.refresh().await, "initial refresh should succeed");
    client
}

/// Poll `cond` until it holds, failing the test after five seconds.
pub async fn eventually<F: Fn() -> bool>(what: &str, cond: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !cond() {
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub fn note_json(room_id: i64, message_id: i64) -> Value {
    json!({
        "messageId": message_id,
        "roomId": room_id,
        "senderId": 3,
        "senderNickname": "mina",
        "content": format!("note {message_id}"),
        "sentAt": "2025-03-01T10:00:00Z",
    })
}

pub fn room_json(room_id: i64, peer_id: i64) -> Value {
    json!({
        "roomId": room_id,
        "peer": { "userId": peer_id, "nickname": format!("peer{peer_id}") },
        "lastMessage": "see you",
        "lastMessageAt": "2025-03-01T10:00:00Z",
        "unreadCount": 2,
    })
}

// ---------------------------------------------------------------------------
// REST handlers
// ---------------------------------------------------------------------------

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({ "message": "access token expired" })),
    )
        .into_response()
}

async fn refresh(State(state): State<Shared>) -> Response {
    state.refresh_calls.fetch_add(1, Ordering::SeqCst);

    let delay = state.refresh_delay_ms.load(Ordering::SeqCst);
    if delay > 0 {
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }

    if !state.refresh_ok.load(Ordering::SeqCst) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "message": "refresh token expired" })),
        )
            .into_response();
    }

    let generation = state.generation.fetch_add(1, Ordering::SeqCst) + 1;
    (
        StatusCode::OK,
        [(header::SET_COOKIE, format!("session=v{generation}; Path=/; HttpOnly"))],
    )
        .into_response()
}

async fn logout(State(state): State<Shared>) -> StatusCode {
    state.logout_calls.fetch_add(1, Ordering::SeqCst);
    StatusCode::NO_CONTENT
}

async fn list_rooms(State(state): State<Shared>, headers: HeaderMap) -> Response {
    state.room_list_calls.fetch_add(1, Ordering::SeqCst);
    if !state.authorized(&headers) {
        return unauthorized();
    }
    Json(json!({ "status": 200, "data": [room_json(42, 3), room_json(43, 4)] })).into_response()
}

async fn open_room(
    State(state): State<Shared>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if !state.authorized(&headers) {
        return unauthorized();
    }
    let peer = body["targetUserId"].as_i64().unwrap_or(0);
    state.open_room_bodies.lock().push(body);
    Json(room_json(100 + peer, peer)).into_response()
}

async fn room_messages(
    State(state): State<Shared>,
    headers: HeaderMap,
    Path(room_id): Path<i64>,
) -> Response {
    if !state.authorized(&headers) {
        return unauthorized();
    }
    Json(json!([note_json(room_id, 1), note_json(room_id, 2)])).into_response()
}

async fn mark_read(
    State(state): State<Shared>,
    headers: HeaderMap,
    Path(_room_id): Path<i64>,
) -> Response {
    if !state.authorized(&headers) {
        return unauthorized();
    }
    Json(json!({ "readCount": state.read_count.load(Ordering::SeqCst) })).into_response()
}

async fn unread_count(State(state): State<Shared>, headers: HeaderMap) -> Response {
    if !state.authorized(&headers) {
        return unauthorized();
    }
    Json(json!({ "count": state.unread.load(Ordering::SeqCst) })).into_response()
}

async fn no_content(State(state): State<Shared>, headers: HeaderMap) -> Response {
    if !state.authorized(&headers) {
        return unauthorized();
    }
    StatusCode::NO_CONTENT.into_response()
}

async fn reset_content(State(state): State<Shared>, headers: HeaderMap) -> Response {
    if !state.authorized(&headers) {
        return unauthorized();
    }
    StatusCode::RESET_CONTENT.into_response()
}

async fn empty_ok(State(state): State<Shared>, headers: HeaderMap) -> Response {
    if !state.authorized(&headers) {
        return unauthorized();
    }
    (StatusCode::OK, "").into_response()
}

async fn broken() -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "message": "boom" })),
    )
        .into_response()
}

// ---------------------------------------------------------------------------
// Fake SockJS/STOMP broker
// ---------------------------------------------------------------------------

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<Shared>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let cookie = headers
        .get(header::COOKIE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    state.handshake_cookies.lock().push(cookie);
    ws.on_upgrade(move |socket| broker_connection(socket, state))
}

fn sockjs_array(payloads: &[String]) -> Message {
    Message::Text(format!("a{}", serde_json::to_string(payloads).unwrap()).into())
}

async fn broker_connection(socket: WebSocket, state: Shared) {
    state.connections.fetch_add(1, Ordering::SeqCst);
    let mut events = state.events.subscribe();
    let (mut tx, mut rx) = socket.split();
    let mut owned: HashMap<String, String> = HashMap::new();

    if tx.send(Message::Text("o".into())).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            msg = rx.next() => {
                let text = match msg {
                    Some(Ok(Message::Text(t))) => t,
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => continue,
                };
                let payloads: Vec<String> = match serde_json::from_str(text.as_str()) {
                    Ok(p) => p,
                    Err(_) => break,
                };

                let mut replies = Vec::new();
                let mut close = false;
                for payload in payloads {
                    for frame in decode_frames(&payload).expect("client sent a malformed frame") {
                        match frame.command {
                            Command::Connect => {
                                state
                                    .connect_heartbeats
                                    .lock()
                                    .push(frame.get("heart-beat").unwrap_or_default().to_string());
                                let heartbeat = state.broker_heartbeat.lock().clone();
                                replies.push(
                                    Frame::new(Command::Connected)
                                        .header("version", "1.2")
                                        .header("heart-beat", heartbeat)
                                        .encode(),
                                );
                            }
                            Command::Subscribe => {
                                let id = frame.get("id").unwrap_or_default().to_string();
                                let destination =
                                    frame.get("destination").unwrap_or_default().to_string();
                                owned.insert(id.clone(), destination.clone());
                                state.subscriptions.lock().insert(id, destination);
                            }
                            Command::Unsubscribe => {
                                if let Some(id) = frame.get("id") {
                                    owned.remove(id);
                                    state.subscriptions.lock().remove(id);
                                }
                            }
                            Command::Send => {
                                let destination =
                                    frame.get("destination").unwrap_or_default().to_string();
                                state.sent.lock().push((destination, frame.body.clone()));
                            }
                            Command::Disconnect => {
                                state.disconnects.fetch_add(1, Ordering::SeqCst);
                                close = true;
                            }
                            _ => {}
                        }
                    }
                }

                if !replies.is_empty() && tx.send(sockjs_array(&replies)).await.is_err() {
                    break;
                }
                if close {
                    break;
                }
            }
            event = events.recv() => {
                match event {
                    Ok(BrokerEvent::Push { destination, body }) => {
                        let frames: Vec<String> = owned
                            .iter()
                            .filter(|(_, d)| **d == destination)
                            .map(|(id, _)| {
                                Frame::new(Command::Message)
                                    .header("subscription", id.as_str())
                                    .header("destination", destination.as_str())
                                    .header("message-id", "m-1")
                                    .with_body(body.clone())
                                    .encode()
                            })
                            .collect();
                        if frames.is_empty() {
                            continue;
                        }
                        if tx.send(sockjs_array(&frames)).await.is_err() {
                            break;
                        }
                    }
                    Ok(BrokerEvent::Error { message }) => {
                        let frame = Frame::new(Command::Error)
                            .header("message", message.as_str())
                            .with_body(message)
                            .encode();
                        if tx.send(sockjs_array(&[frame])).await.is_err() {
                            break;
                        }
                    }
                    Ok(BrokerEvent::Kick) => {
                        let _ = tx.send(Message::Text(r#"c[3000,"Go away!"]"#.into())).await;
                        break;
                    }
                    Err(_) => break,
                }
            }
        }
    }

    let mut subscriptions = state.subscriptions.lock();
    for id in owned.keys() {
        subscriptions.remove(id);
    }
}
