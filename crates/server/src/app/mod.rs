mod relay;
mod signaling;

use crate::config::ServerConfig;
use crate::metrics::Metrics;
use crate::presence::{Availability, ConnectionHandle, PresenceDirectory};
use crate::registry::CallRegistry;
use crate::util::generate_id;
use catline_proto::call::{CallEndReason, CallEnded, ClientEvent, ErrorEvent, ServerEvent, SnapshotState};
use catline_proto::{CodecError, EventFrame};
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::convert::TryFrom;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, error, info, warn};

#[derive(Debug)]
pub enum ServerError {
    Io,
    Codec,
}

impl Display for ServerError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io => write!(f, "io failure"),
            Self::Codec => write!(f, "codec failure"),
        }
    }
}

impl Error for ServerError {}

/// Presence and call bookkeeping behind one lock: every coordinator and
/// relay operation is a single atomic cross-map transaction. Raw map access
/// stays inside `presence.rs` and `registry.rs`.
pub struct SignalingState {
    pub directory: PresenceDirectory,
    pub registry: CallRegistry,
}

/// One removed call plus what is needed to notify the surviving party.
pub struct CallTeardown {
    pub call_id: String,
    pub peer: String,
    pub peer_sender: Option<mpsc::Sender<ServerEvent>>,
}

impl SignalingState {
    fn new() -> Self {
        SignalingState {
            directory: PresenceDirectory::new(),
            registry: CallRegistry::new(),
        }
    }

    /// Removes every call record naming the user and resets both parties to
    /// idle. Notification happens after the core lock is released.
    pub fn detach_user_calls(&mut self, user_id: &str) -> Vec<CallTeardown> {
        let mut teardowns = Vec::new();
        for call_id in self.registry.calls_involving(user_id) {
            let Some(record) = self.registry.remove(&call_id) else {
                continue;
            };
            let Some(peer) = record.other_party(user_id).map(str::to_string) else {
                continue;
            };
            self.directory.set_availability(user_id, Availability::Idle);
            self.directory.set_availability(&peer, Availability::Idle);
            let peer_sender = self.directory.live_sender(&peer);
            teardowns.push(CallTeardown {
                call_id,
                peer,
                peer_sender,
            });
        }
        teardowns
    }
}

pub struct AppState {
    pub config: ServerConfig,
    pub metrics: Arc<Metrics>,
    pub core: RwLock<SignalingState>,
    pub ring_timers: Mutex<HashMap<String, JoinHandle<()>>>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(config: ServerConfig) -> Arc<Self> {
        Arc::new(AppState {
            config,
            metrics: Arc::new(Metrics::new()),
            core: RwLock::new(SignalingState::new()),
            ring_timers: Mutex::new(HashMap::new()),
            started_at: Instant::now(),
        })
    }

    /// Binds a connection to a user identity; last connection wins. Calls
    /// the previous connection was part of are torn down first, then the
    /// fresh handle is installed with idle availability.
    pub async fn register_connection(
        self: &Arc<Self>,
        user_id: &str,
        sender: mpsc::Sender<ServerEvent>,
    ) -> String {
        let session_id = generate_id(user_id);
        let teardowns = {
            let mut core = self.core.write().await;
            let teardowns = core.detach_user_calls(user_id);
            core.directory.register(
                user_id,
                ConnectionHandle {
                    session_id: session_id.clone(),
                    sender,
                },
            );
            teardowns
        };
        self.finish_teardowns(user_id, teardowns).await;
        session_id
    }

    /// Disconnect-cleanup hook: runs before the presence entry is dropped,
    /// so no stale calling/in-call state survives a disconnect. A stale
    /// session id means a newer connection already replaced this one.
    pub async fn handle_disconnect(self: &Arc<Self>, user_id: &str, session_id: &str) {
        let teardowns = {
            let mut core = self.core.write().await;
            if core.directory.session_id(user_id) != Some(session_id) {
                return;
            }
            let teardowns = core.detach_user_calls(user_id);
            core.directory.unregister(user_id, session_id);
            teardowns
        };
        if !teardowns.is_empty() {
            info!(user = %user_id, calls = teardowns.len(), "disconnect call cleanup");
        }
        self.finish_teardowns(user_id, teardowns).await;
    }

    /// Delivery-failure path: the outbound queue is gone but the read loop
    /// has not observed the disconnect yet.
    pub async fn force_disconnect(self: &Arc<Self>, user_id: &str) {
        let teardowns = {
            let mut core = self.core.write().await;
            let teardowns = core.detach_user_calls(user_id);
            core.directory.evict(user_id);
            teardowns
        };
        self.finish_teardowns(user_id, teardowns).await;
    }

    async fn finish_teardowns(self: &Arc<Self>, user_id: &str, teardowns: Vec<CallTeardown>) {
        for teardown in teardowns {
            self.cancel_ring_timer(&teardown.call_id).await;
            self.metrics.mark_call_ended();
            if let Some(sender) = teardown.peer_sender {
                let event = ServerEvent::CallEnded(CallEnded {
                    call_id: teardown.call_id.clone(),
                    ended_by: user_id.to_string(),
                    reason: Some(CallEndReason::PeerDisconnected),
                });
                if sender.send(event).await.is_err() {
                    warn!(peer = %teardown.peer, call = %teardown.call_id, "peer unreachable during teardown");
                }
            }
        }
    }

    pub async fn cancel_ring_timer(&self, call_id: &str) {
        if let Some(handle) = self.ring_timers.lock().await.remove(call_id) {
            handle.abort();
        }
    }

    /// Sends one event to a user's live connection. A closed outbound queue
    /// is treated as a disconnect so no call is left half-connected.
    pub async fn deliver(self: &Arc<Self>, user_id: &str, event: ServerEvent) -> bool {
        let sender = { self.core.read().await.directory.live_sender(user_id) };
        match sender {
            Some(sender) => {
                if sender.send(event).await.is_ok() {
                    true
                } else {
                    warn!(user = %user_id, "outbound queue closed, forcing disconnect");
                    self.force_disconnect(user_id).await;
                    false
                }
            }
            None => {
                debug!(user = %user_id, "event dropped, user offline");
                false
            }
        }
    }

    pub async fn snapshot(&self) -> SnapshotState {
        let core = self.core.read().await;
        let mut metrics = self.metrics.snapshot_json();
        metrics["uptime_seconds"] = serde_json::json!(self.started_at.elapsed().as_secs());
        SnapshotState {
            calls: core.registry.snapshot(),
            presence: core.directory.snapshot(),
            metrics,
        }
    }

    pub async fn handle_client_event(self: &Arc<Self>, user_id: &str, event: ClientEvent) {
        match event {
            ClientEvent::Hello(_) => {
                debug!(user = %user_id, "duplicate hello ignored");
            }
            ClientEvent::Initiate(request) => self.initiate(user_id, request).await,
            ClientEvent::Accept(request) => self.accept(user_id, &request.call_id).await,
            ClientEvent::Reject(request) => self.reject(user_id, &request.call_id).await,
            ClientEvent::End(request) => self.end(user_id, &request.call_id).await,
            ClientEvent::Offer(signal) => self.relay_offer(user_id, signal).await,
            ClientEvent::Answer(signal) => self.relay_answer(user_id, signal).await,
            ClientEvent::Candidate(signal) => self.relay_candidate(user_id, signal).await,
            ClientEvent::Snapshot => {
                let snapshot = self.snapshot().await;
                self.deliver(user_id, ServerEvent::SnapshotState(snapshot))
                    .await;
            }
        }
    }
}

pub async fn run(state: Arc<AppState>) -> Result<(), ServerError> {
    if let Some(metrics_bind) = state.config.metrics_bind.clone() {
        tokio::spawn(serve_metrics(Arc::clone(&state.metrics), metrics_bind));
    }
    let listener = match TcpListener::bind(&state.config.bind).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(address = %state.config.bind, error = %err, "listener bind failed");
            return Err(ServerError::Io);
        }
    };
    info!(address = %state.config.bind, "catline listening");
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                tokio::spawn(handle_connection(Arc::clone(&state), stream, peer));
            }
            Err(err) => {
                warn!(error = %err, "accept failed");
            }
        }
    }
}

fn keepalive_interval_seconds(base: u64) -> u64 {
    let half = base.saturating_div(2).max(1);
    half.max(5)
}

async fn handle_connection(state: Arc<AppState>, stream: TcpStream, peer: SocketAddr) {
    let websocket = match accept_async(stream).await {
        Ok(websocket) => websocket,
        Err(err) => {
            debug!(%peer, error = %err, "websocket handshake failed");
            return;
        }
    };
    state.metrics.incr_connections();
    let (mut sink, mut source) = websocket.split();
    let (tx, mut rx) = mpsc::channel::<ServerEvent>(state.config.outbound_queue_depth);

    let metrics = Arc::clone(&state.metrics);
    let keepalive = Duration::from_secs(keepalive_interval_seconds(
        state.config.connection_keepalive,
    ));
    let writer = tokio::spawn(async move {
        let mut sequence: u64 = 1;
        let mut keepalive_timer = tokio::time::interval(keepalive);
        keepalive_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                event = rx.recv() => {
                    let Some(event) = event else {
                        break;
                    };
                    let frame = match event.into_frame(sequence) {
                        Ok(frame) => frame,
                        Err(err) => {
                            error!(error = %err, "outbound event encode failed");
                            continue;
                        }
                    };
                    sequence += 1;
                    let encoded = match frame.encode() {
                        Ok(encoded) => encoded,
                        Err(err) => {
                            error!(error = %err, "outbound frame encode failed");
                            continue;
                        }
                    };
                    if sink.send(Message::Binary(encoded)).await.is_err() {
                        break;
                    }
                    metrics.mark_egress();
                }
                _ = keepalive_timer.tick() => {
                    if sink.send(Message::Ping(Vec::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
        let _ = sink.close().await;
    });

    let mut buffer: Vec<u8> = Vec::new();
    let mut identity: Option<(String, String)> = None;
    while let Some(message) = source.next().await {
        let message = match message {
            Ok(message) => message,
            Err(err) => {
                debug!(%peer, error = %err, "socket error");
                break;
            }
        };
        match message {
            Message::Binary(data) => {
                buffer.extend_from_slice(&data);
                if !consume_frames(&state, &tx, &mut buffer, &mut identity).await {
                    break;
                }
            }
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => {}
            _ => {
                let _ = tx
                    .send(ServerEvent::Error(ErrorEvent {
                        message: "binary frames required".to_string(),
                    }))
                    .await;
            }
        }
    }

    if let Some((user_id, session_id)) = identity {
        state.handle_disconnect(&user_id, &session_id).await;
    }
    drop(tx);
    let _ = writer.await;
    state.metrics.decr_connections();
}

async fn consume_frames(
    state: &Arc<AppState>,
    tx: &mpsc::Sender<ServerEvent>,
    buffer: &mut Vec<u8>,
    identity: &mut Option<(String, String)>,
) -> bool {
    loop {
        match EventFrame::decode(buffer) {
            Ok((frame, consumed)) => {
                buffer.drain(0..consumed);
                state.metrics.mark_ingress();
                let event = match ClientEvent::try_from(&frame) {
                    Ok(event) => event,
                    Err(err) => {
                        warn!(error = %err, "unparseable client event");
                        let _ = tx
                            .send(ServerEvent::Error(ErrorEvent {
                                message: err.to_string(),
                            }))
                            .await;
                        return false;
                    }
                };
                let known_user = identity.as_ref().map(|(user_id, _)| user_id.clone());
                match known_user {
                    None => {
                        if let ClientEvent::Hello(hello) = event {
                            let session_id = state
                                .register_connection(&hello.user_id, tx.clone())
                                .await;
                            info!(user = %hello.user_id, "connection registered");
                            *identity = Some((hello.user_id, session_id));
                        } else {
                            let _ = tx
                                .send(ServerEvent::Error(ErrorEvent {
                                    message: "hello required".to_string(),
                                }))
                                .await;
                            return false;
                        }
                    }
                    Some(user) => {
                        state.handle_client_event(&user, event).await;
                    }
                }
            }
            Err(CodecError::UnexpectedEof) => return true,
            Err(err) => {
                error!(error = %err, "frame decode failure");
                let _ = tx
                    .send(ServerEvent::Error(ErrorEvent {
                        message: err.to_string(),
                    }))
                    .await;
                return false;
            }
        }
    }
}

/// Minimal plaintext metrics endpoint; one request per connection.
async fn serve_metrics(metrics: Arc<Metrics>, bind: String) {
    let listener = match TcpListener::bind(&bind).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(address = %bind, error = %err, "metrics listener bind failed");
            return;
        }
    };
    info!(address = %bind, "metrics listener ready");
    loop {
        let Ok((mut stream, _)) = listener.accept().await else {
            continue;
        };
        let metrics = Arc::clone(&metrics);
        tokio::spawn(async move {
            let mut request = [0u8; 1024];
            let _ = stream.read(&mut request).await;
            let body = metrics.encode_prometheus();
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            let _ = stream.write_all(response.as_bytes()).await;
        });
    }
}
