//! STOMP over SockJS over a WebSocket, with automatic reconnect.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use reqwest::cookie::{CookieStore, Jar};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{self, Instant, Interval};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, COOKIE};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tugo_common::id::{prefix, prefixed_ulid};
use url::Url;

use crate::error::RealtimeError;

use super::sockjs::{self, SockJsFrame};
use super::stomp::{decode_frames, Command, Frame, HEARTBEAT_EOL};
use super::transport::{Connector, FrameHandler, SessionListener, StompSession};
use super::TransportSettings;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

/// Missed broker heart-beats tolerated before the link is declared dead.
const HEARTBEAT_GRACE: u32 = 3;

/// Opens [`WsStompSession`]s against the backend's SockJS endpoint.
#[derive(Clone)]
pub struct SockJsConnector {
    base_url: Url,
    cookies: Option<Arc<Jar>>,
    settings: TransportSettings,
}

impl SockJsConnector {
    pub fn new(base_url: Url, settings: TransportSettings) -> Self {
        Self {
            base_url,
            cookies: None,
            settings,
        }
    }

    /// Present this jar's cookies for the backend origin during the
    /// handshake. Share it with the HTTP client so both carry the same
    /// session.
    pub fn with_cookies(mut self, cookies: Arc<Jar>) -> Self {
        self.cookies = Some(cookies);
        self
    }

    async fn connect_socket(&self) -> Result<WsStream, RealtimeError> {
        let url = sockjs::websocket_url(&self.base_url)?;
        let mut request = url.as_str().into_client_request()?;

        if let Some(cookie) = self
            .cookies
            .as_ref()
            .and_then(|jar| jar.cookies(&self.base_url))
        {
            let value = HeaderValue::from_bytes(cookie.as_bytes())
                .map_err(|e| RealtimeError::Handshake(e.to_string()))?;
            request.headers_mut().insert(COOKIE, value);
        }

        let (stream, response) = tokio_tungstenite::connect_async(request).await?;
        tracing::debug!(%url, status = %response.status(), "websocket handshake complete");
        Ok(stream)
    }
}

#[async_trait]
impl Connector for SockJsConnector {
    async fn open(
        &self,
        listener: Arc<dyn SessionListener>,
    ) -> Result<Arc<dyn StompSession>, RealtimeError> {
        // Fail fast on an unusable origin instead of retrying forever.
        sockjs::websocket_url(&self.base_url)?;

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let session = Arc::new(WsStompSession {
            outbound: outbound_tx,
            subscriptions: DashMap::new(),
            connected: AtomicBool::new(false),
            shutdown: shutdown_tx,
        });

        tokio::spawn(run(
            self.clone(),
            session.clone(),
            listener,
            outbound_rx,
            shutdown_rx,
        ));
        Ok(session)
    }
}

struct Registration {
    destination: String,
    handler: FrameHandler,
}

/// Handle on a running connection loop.
pub struct WsStompSession {
    outbound: mpsc::UnboundedSender<Frame>,
    subscriptions: DashMap<String, Registration>,
    connected: AtomicBool,
    shutdown: watch::Sender<bool>,
}

enum Flow {
    Continue,
    Close(String),
}

#[async_trait]
impl StompSession for WsStompSession {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn subscribe(&self, destination: &str, handler: FrameHandler) -> String {
        let id = prefixed_ulid(prefix::SUBSCRIPTION);
        self.subscriptions.insert(
            id.clone(),
            Registration {
                destination: destination.to_string(),
                handler,
            },
        );
        if self.is_connected() {
            self.enqueue(Frame::subscribe(&id, destination));
        }
        id
    }

    fn unsubscribe(&self, id: &str) {
        if self.subscriptions.remove(id).is_some() && self.is_connected() {
            self.enqueue(Frame::unsubscribe(id));
        }
    }

    fn publish(&self, destination: &str, body: &str) -> Result<(), RealtimeError> {
        if !self.is_connected() {
            return Err(RealtimeError::NotConnected);
        }
        if !self.enqueue(Frame::send(destination, body)) {
            return Err(RealtimeError::NotConnected);
        }
        Ok(())
    }

    async fn deactivate(&self) {
        self.shutdown.send_replace(true);
    }
}

impl WsStompSession {
    fn enqueue(&self, frame: Frame) -> bool {
        self.outbound.send(frame).is_ok()
    }

    async fn drive(
        &self,
        socket: WsStream,
        settings: &TransportSettings,
        listener: &dyn SessionListener,
        outbound: &mut mpsc::UnboundedReceiver<Frame>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> String {
        let (mut sink, mut stream) = socket.split();

        // Frames queued while offline are stale; registrations are replayed
        // on CONNECTED instead.
        while outbound.try_recv().is_ok() {}

        let mut heartbeat = heartbeat_timer(settings.heartbeat);
        if let Some(timer) = heartbeat.as_mut() {
            timer.tick().await;
        }
        let mut inbound_deadline: Option<Duration> = None;
        let mut last_inbound = Instant::now();

        loop {
            tokio::select! {
                msg = stream.next() => {
                    last_inbound = Instant::now();
                    let text = match msg {
                        Some(Ok(Message::Text(text))) => text,
                        Some(Ok(Message::Close(_))) | None => return "socket closed".to_string(),
                        Some(Ok(_)) => continue,
                        Some(Err(err)) => return err.to_string(),
                    };
                    match self
                        .on_text(text.as_str(), &mut sink, settings, listener, &mut inbound_deadline)
                        .await
                    {
                        Ok(Flow::Continue) => {}
                        Ok(Flow::Close(reason)) => return reason,
                        Err(err) => {
                            tracing::warn!(%err, "dropping realtime connection");
                            return err.to_string();
                        }
                    }
                }
                Some(frame) = outbound.recv() => {
                    if let Err(err) = send_frames(&mut sink, &[frame]).await {
                        return err.to_string();
                    }
                }
                _ = next_tick(&mut heartbeat) => {
                    if !self.is_connected() {
                        continue;
                    }
                    if let Some(deadline) = inbound_deadline {
                        if last_inbound.elapsed() > deadline {
                            return "broker heart-beat timed out".to_string();
                        }
                    }
                    if let Err(err) = send_payload(&mut sink, HEARTBEAT_EOL.to_string()).await {
                        return err.to_string();
                    }
                }
                _ = shutdown.changed() => {
                    if self.is_connected() {
                        // Flush queued UNSUBSCRIBEs ahead of DISCONNECT.
                        let mut frames = Vec::new();
                        while let Ok(frame) = outbound.try_recv() {
                            frames.push(frame);
                        }
                        frames.push(Frame::disconnect());
                        let _ = send_frames(&mut sink, &frames).await;
                    }
                    let _ = sink.close().await;
                    return "deactivated".to_string();
                }
            }
        }
    }

    async fn on_text(
        &self,
        text: &str,
        sink: &mut WsSink,
        settings: &TransportSettings,
        listener: &dyn SessionListener,
        inbound_deadline: &mut Option<Duration>,
    ) -> Result<Flow, RealtimeError> {
        match sockjs::parse(text)? {
            SockJsFrame::Open => {
                let heartbeat_ms = settings.heartbeat.as_millis() as u64;
                send_frames(sink, &[Frame::connect(heartbeat_ms)]).await?;
                Ok(Flow::Continue)
            }
            SockJsFrame::Heartbeat => Ok(Flow::Continue),
            SockJsFrame::Close { code, reason } => {
                Ok(Flow::Close(format!("closed by server ({code}): {reason}")))
            }
            SockJsFrame::Messages(payloads) => {
                for payload in payloads {
                    for frame in decode_frames(&payload)? {
                        if let Flow::Close(reason) = self
                            .on_frame(frame, sink, settings, listener, inbound_deadline)
                            .await?
                        {
                            return Ok(Flow::Close(reason));
                        }
                    }
                }
                Ok(Flow::Continue)
            }
        }
    }

    async fn on_frame(
        &self,
        frame: Frame,
        sink: &mut WsSink,
        settings: &TransportSettings,
        listener: &dyn SessionListener,
        inbound_deadline: &mut Option<Duration>,
    ) -> Result<Flow, RealtimeError> {
        match frame.command {
            Command::Connected => {
                // With heart-beats off we offered `0,0`, so the broker owes us none.
                *inbound_deadline = broker_heartbeat(&frame)
                    .filter(|_| !settings.heartbeat.is_zero())
                    .map(|sx| sx.max(settings.heartbeat) * HEARTBEAT_GRACE);
                self.connected.store(true, Ordering::SeqCst);

                let replay: Vec<Frame> = self
                    .subscriptions
                    .iter()
                    .map(|entry| Frame::subscribe(entry.key(), &entry.destination))
                    .collect();
                if !replay.is_empty() {
                    send_frames(sink, &replay).await?;
                }

                tracing::info!(
                    version = frame.get("version").unwrap_or("?"),
                    resubscribed = replay.len(),
                    "STOMP session established"
                );
                listener.on_connected(self);
            }
            Command::Message => self.dispatch(&frame),
            Command::Error => {
                let message = frame.get("message").unwrap_or(frame.body.as_str());
                tracing::warn!(%message, "broker reported an error");
                return Ok(Flow::Close(format!("broker error: {message}")));
            }
            Command::Receipt => {
                tracing::debug!(receipt = frame.get("receipt-id"), "receipt");
            }
            other => {
                tracing::debug!(command = other.as_str(), "ignoring unexpected frame");
            }
        }
        Ok(Flow::Continue)
    }

    fn dispatch(&self, frame: &Frame) {
        let Some(id) = frame.get("subscription") else {
            tracing::debug!("MESSAGE without subscription header");
            return;
        };
        // Clone out so the handler may unsubscribe without deadlocking the map.
        let handler = self.subscriptions.get(id).map(|r| r.handler.clone());
        match handler {
            Some(handler) => handler(frame),
            None => tracing::debug!(subscription = id, "message for unknown subscription"),
        }
    }
}

/// Interval the broker promised to send heart-beats at, if any.
fn broker_heartbeat(connected: &Frame) -> Option<Duration> {
    connected
        .get("heart-beat")
        .and_then(|v| v.split_once(','))
        .and_then(|(sx, _)| sx.trim().parse::<u64>().ok())
        .filter(|&sx| sx > 0)
        .map(Duration::from_millis)
}

/// `None` when heart-beats are disabled.
fn heartbeat_timer(period: Duration) -> Option<Interval> {
    (!period.is_zero()).then(|| time::interval(period))
}

async fn next_tick(timer: &mut Option<Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn send_frames(sink: &mut WsSink, frames: &[Frame]) -> Result<(), RealtimeError> {
    let payloads: Vec<String> = frames.iter().map(Frame::encode).collect();
    sink.send(Message::Text(sockjs::encode(&payloads).into()))
        .await?;
    Ok(())
}

async fn send_payload(sink: &mut WsSink, payload: String) -> Result<(), RealtimeError> {
    sink.send(Message::Text(sockjs::encode(&[payload]).into()))
        .await?;
    Ok(())
}

async fn run(
    connector: SockJsConnector,
    session: Arc<WsStompSession>,
    listener: Arc<dyn SessionListener>,
    mut outbound: mpsc::UnboundedReceiver<Frame>,
    mut shutdown: watch::Receiver<bool>,
) {
    let settings = connector.settings;

    loop {
        if *shutdown.borrow() {
            break;
        }

        let socket = tokio::select! {
            result = connector.connect_socket() => result,
            _ = shutdown.changed() => break,
        };

        let reason = match socket {
            Ok(socket) => {
                session
                    .drive(socket, &settings, listener.as_ref(), &mut outbound, &mut shutdown)
                    .await
            }
            Err(err) => {
                tracing::warn!(%err, "realtime connection attempt failed");
                err.to_string()
            }
        };

        if session.connected.swap(false, Ordering::SeqCst) {
            listener.on_disconnected(&reason);
        }
        if *shutdown.borrow() {
            break;
        }

        tracing::info!(
            %reason,
            delay_ms = settings.reconnect_delay.as_millis() as u64,
            "realtime connection lost; reconnecting"
        );
        tokio::select! {
            _ = time::sleep(settings.reconnect_delay) => {}
            _ = shutdown.changed() => break,
        }
    }

    session.connected.store(false, Ordering::SeqCst);
    tracing::debug!("realtime session stopped");
}
