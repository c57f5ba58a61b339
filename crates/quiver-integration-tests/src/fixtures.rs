//! Test fixtures for integration tests
//!
//! Provides in-process stand-ins for the NSQ daemons:
//! - [`MockNsqd`]: speaks the TCP protocol, records every client command
//!   and lets tests push messages, heartbeats and disconnects
//! - [`MockLookupd`]: serves `/lookup` over HTTP from a mutable producer table

use anyhow::Result;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use quiver_protocol::{AuthResponse, Frame, IdentifyResponse, Message, MessageId, MAGIC_V2};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

// ============================================================================
// MockNsqd
// ============================================================================

/// Broker behaviour knobs
#[derive(Debug, Clone)]
pub struct MockNsqdOptions {
    pub max_rdy_count: u64,
    pub msg_timeout: Duration,
    /// Require `AUTH` with this secret before `SUB`
    pub auth_secret: Option<String>,
}

impl Default for MockNsqdOptions {
    fn default() -> Self {
        Self {
            max_rdy_count: 2500,
            msg_timeout: Duration::from_secs(60),
            auth_secret: None,
        }
    }
}

/// A command as received from a client
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedCommand {
    pub client: usize,
    pub name: String,
    pub args: Vec<String>,
    pub body: Option<Bytes>,
}

enum ClientAction {
    Frame(Frame),
    Disconnect,
}

struct ClientSlot {
    id: usize,
    tx: mpsc::UnboundedSender<ClientAction>,
    subscribed: bool,
}

struct NsqdState {
    options: MockNsqdOptions,
    commands: Mutex<Vec<ReceivedCommand>>,
    clients: Mutex<Vec<ClientSlot>>,
    next_client: AtomicUsize,
    next_message: AtomicU64,
}

impl NsqdState {
    fn send_to(&self, client: usize, action: ClientAction) {
        if let Some(slot) = self.clients.lock().iter().find(|slot| slot.id == client) {
            let _ = slot.tx.send(action);
        }
    }
}

/// An in-process nsqd for testing
pub struct MockNsqd {
    pub addr: SocketAddr,
    state: Arc<NsqdState>,
    shutdown: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl MockNsqd {
    /// Start a broker on a random port
    pub async fn start() -> Result<Self> {
        Self::start_with(MockNsqdOptions::default()).await
    }

    pub async fn start_with(options: MockNsqdOptions) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let state = Arc::new(NsqdState {
            options,
            commands: Mutex::new(Vec::new()),
            clients: Mutex::new(Vec::new()),
            next_client: AtomicUsize::new(0),
            next_message: AtomicU64::new(1),
        });
        let shutdown = CancellationToken::new();

        let handle = tokio::spawn({
            let state = state.clone();
            let shutdown = shutdown.clone();
            async move {
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        accepted = listener.accept() => match accepted {
                            Ok((stream, peer)) => {
                                debug!(%peer, "Mock nsqd accepted client");
                                tokio::spawn(serve_client(stream, state.clone(), shutdown.clone()));
                            }
                            Err(e) => {
                                tracing::error!("Mock nsqd accept failed: {}", e);
                                break;
                            }
                        },
                    }
                }
            }
        });

        info!("Mock nsqd listening on {}", addr);
        Ok(Self {
            addr,
            state,
            shutdown,
            handle: Some(handle),
        })
    }

    /// `host:port` string for consumer configuration
    pub fn address(&self) -> String {
        self.addr.to_string()
    }

    /// Send a message to the first subscribed client
    pub fn publish(&self, body: impl Into<Bytes>) -> Option<MessageId> {
        self.publish_with_attempts(body, 1)
    }

    pub fn publish_with_attempts(&self, body: impl Into<Bytes>, attempts: u16) -> Option<MessageId> {
        let n = self.state.next_message.fetch_add(1, Ordering::SeqCst);
        let id = MessageId::parse(&format!("{:016x}", n)).ok()?;
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as i64)
            .unwrap_or_default();
        let message = Message::new(id, timestamp, attempts, body);

        let clients = self.state.clients.lock();
        let slot = clients.iter().find(|slot| slot.subscribed)?;
        slot.tx
            .send(ClientAction::Frame(Frame::Message(message)))
            .ok()?;
        Some(id)
    }

    /// Send `_heartbeat_` to every client
    pub fn heartbeat(&self) {
        for slot in self.state.clients.lock().iter() {
            let _ = slot.tx.send(ClientAction::Frame(Frame::Response(Bytes::from_static(
                quiver_protocol::HEARTBEAT,
            ))));
        }
    }

    /// Send an error frame to every client
    pub fn send_error(&self, error: &'static str) {
        for slot in self.state.clients.lock().iter() {
            let _ = slot
                .tx
                .send(ClientAction::Frame(Frame::Error(Bytes::from_static(error.as_bytes()))));
        }
    }

    /// Drop every client connection
    pub fn disconnect_clients(&self) {
        for slot in self.state.clients.lock().iter() {
            let _ = slot.tx.send(ClientAction::Disconnect);
        }
    }

    pub fn commands(&self) -> Vec<ReceivedCommand> {
        self.state.commands.lock().clone()
    }

    pub fn commands_named(&self, name: &str) -> Vec<ReceivedCommand> {
        self.state
            .commands
            .lock()
            .iter()
            .filter(|command| command.name == name)
            .cloned()
            .collect()
    }

    pub fn count(&self, name: &str) -> usize {
        self.commands_named(name).len()
    }

    /// RDY values in the order they were received
    pub fn rdy_history(&self) -> Vec<u64> {
        self.commands_named("RDY")
            .iter()
            .filter_map(|command| command.args.first()?.parse().ok())
            .collect()
    }

    pub fn last_rdy(&self) -> Option<u64> {
        self.rdy_history().last().copied()
    }

    pub fn subscribed_clients(&self) -> usize {
        self.state
            .clients
            .lock()
            .iter()
            .filter(|slot| slot.subscribed)
            .count()
    }

    /// Connections accepted since start
    pub fn accepted_connections(&self) -> usize {
        self.state.next_client.load(Ordering::SeqCst)
    }

    /// Stop accepting and drop every client
    pub async fn shutdown(mut self) -> Result<()> {
        self.shutdown.cancel();
        if let Some(handle) = self.handle.take() {
            handle.await?;
        }
        Ok(())
    }
}

impl Drop for MockNsqd {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn serve_client(stream: TcpStream, state: Arc<NsqdState>, shutdown: CancellationToken) {
    let client = state.next_client.fetch_add(1, Ordering::SeqCst);
    let (read, write) = stream.into_split();
    let (tx, rx) = mpsc::unbounded_channel();

    state.clients.lock().push(ClientSlot {
        id: client,
        tx: tx.clone(),
        subscribed: false,
    });

    let reader = tokio::spawn({
        let state = state.clone();
        async move {
            if let Err(e) = read_commands(read, client, &state).await {
                debug!(client, "Mock nsqd reader stopped: {}", e);
            }
            state.send_to(client, ClientAction::Disconnect);
        }
    });

    if let Err(e) = write_frames(write, rx, shutdown).await {
        debug!(client, "Mock nsqd writer stopped: {}", e);
    }

    reader.abort();
    state.clients.lock().retain(|slot| slot.id != client);
    debug!(client, "Mock nsqd client gone");
}

async fn write_frames(
    mut write: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<ClientAction>,
    shutdown: CancellationToken,
) -> Result<()> {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            action = rx.recv() => match action {
                Some(ClientAction::Frame(frame)) => {
                    let mut buf = BytesMut::new();
                    frame.encode(&mut buf);
                    write.write_all(&buf).await?;
                }
                Some(ClientAction::Disconnect) | None => break,
            },
        }
    }
    let _ = write.shutdown().await;
    Ok(())
}

async fn read_commands(read: OwnedReadHalf, client: usize, state: &NsqdState) -> Result<()> {
    let mut reader = BufReader::new(read);

    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic).await?;
    anyhow::ensure!(&magic == MAGIC_V2, "unexpected magic {:?}", magic);

    let respond = |frame: Frame| state.send_to(client, ClientAction::Frame(frame));
    let mut authenticated = state.options.auth_secret.is_none();

    while let Some(command) = read_command(&mut reader, client).await? {
        state.commands.lock().push(command.clone());

        match command.name.as_str() {
            "IDENTIFY" => {
                let response = IdentifyResponse {
                    max_rdy_count: state.options.max_rdy_count,
                    version: "1.3.0-mock".to_string(),
                    msg_timeout: state.options.msg_timeout.as_millis() as u64,
                    tls_v1: false,
                    auth_required: state.options.auth_secret.is_some(),
                };
                respond(Frame::Response(serde_json::to_vec(&response)?.into()));
            }
            "AUTH" => {
                let expected = state.options.auth_secret.as_deref().unwrap_or_default();
                if command.body.as_deref() == Some(expected.as_bytes()) {
                    authenticated = true;
                    let response = AuthResponse {
                        identity: "mock-user".to_string(),
                        identity_url: String::new(),
                        permission_count: 1,
                    };
                    respond(Frame::Response(serde_json::to_vec(&response)?.into()));
                } else {
                    respond(Frame::Error(Bytes::from_static(b"E_AUTH_FAILED AUTH failed")));
                    break;
                }
            }
            "SUB" => {
                if !authenticated {
                    respond(Frame::Error(Bytes::from_static(b"E_AUTH_FIRST AUTH required")));
                    break;
                }
                if let Some(slot) = state.clients.lock().iter_mut().find(|slot| slot.id == client) {
                    slot.subscribed = true;
                }
                respond(Frame::Response(Bytes::from_static(quiver_protocol::OK)));
            }
            "CLS" => {
                if let Some(slot) = state.clients.lock().iter_mut().find(|slot| slot.id == client) {
                    slot.subscribed = false;
                }
                respond(Frame::Response(Bytes::from_static(quiver_protocol::CLOSE_WAIT)));
            }
            _ => {}
        }
    }
    Ok(())
}

/// One command line, plus the sized body for IDENTIFY and AUTH.
/// `None` on a clean EOF.
async fn read_command<R>(reader: &mut R, client: usize) -> Result<Option<ReceivedCommand>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    if reader.read_line(&mut line).await? == 0 {
        return Ok(None);
    }

    let mut parts = line.trim_end().split(' ').map(String::from);
    let name = parts.next().unwrap_or_default();
    let args: Vec<String> = parts.collect();

    let body = if name == "IDENTIFY" || name == "AUTH" {
        let size = reader.read_u32().await? as usize;
        let mut body = vec![0u8; size];
        reader.read_exact(&mut body).await?;
        Some(Bytes::from(body))
    } else {
        None
    };

    Ok(Some(ReceivedCommand {
        client,
        name,
        args,
        body,
    }))
}

// ============================================================================
// MockLookupd
// ============================================================================

struct LookupdState {
    producers: Mutex<HashMap<String, Vec<SocketAddr>>>,
    wrapped: bool,
    requests: AtomicUsize,
}

#[derive(Debug, Deserialize)]
struct LookupParams {
    topic: String,
}

/// An in-process nsqlookupd HTTP endpoint for testing
pub struct MockLookupd {
    pub addr: SocketAddr,
    state: Arc<LookupdState>,
    shutdown: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl MockLookupd {
    /// Serve bare `{"producers": [...]}` responses
    pub async fn start() -> Result<Self> {
        Self::start_inner(false).await
    }

    /// Serve legacy `{"status_code": 200, "data": {...}}` responses
    pub async fn start_wrapped() -> Result<Self> {
        Self::start_inner(true).await
    }

    async fn start_inner(wrapped: bool) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let state = Arc::new(LookupdState {
            producers: Mutex::new(HashMap::new()),
            wrapped,
            requests: AtomicUsize::new(0),
        });
        let app = Router::new()
            .route("/lookup", get(lookup))
            .with_state(state.clone());

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn({
            let shutdown = shutdown.clone();
            async move {
                let _ = axum::serve(listener, app)
                    .with_graceful_shutdown(async move { shutdown.cancelled().await })
                    .await;
            }
        });

        info!("Mock nsqlookupd listening on {}", addr);
        Ok(Self {
            addr,
            state,
            shutdown,
            handle: Some(handle),
        })
    }

    pub fn address(&self) -> String {
        self.addr.to_string()
    }

    /// Announce `producer` as a source of `topic`
    pub fn register(&self, topic: &str, producer: SocketAddr) {
        let mut producers = self.state.producers.lock();
        let list = producers.entry(topic.to_string()).or_default();
        if !list.contains(&producer) {
            list.push(producer);
        }
    }

    /// Withdraw `producer`; the topic stays known with whatever is left
    pub fn unregister(&self, topic: &str, producer: SocketAddr) {
        if let Some(list) = self.state.producers.lock().get_mut(topic) {
            list.retain(|addr| *addr != producer);
        }
    }

    /// `/lookup` requests served so far
    pub fn requests(&self) -> usize {
        self.state.requests.load(Ordering::SeqCst)
    }

    pub async fn shutdown(mut self) -> Result<()> {
        self.shutdown.cancel();
        if let Some(handle) = self.handle.take() {
            handle.await?;
        }
        Ok(())
    }
}

impl Drop for MockLookupd {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn lookup(
    State(state): State<Arc<LookupdState>>,
    Query(params): Query<LookupParams>,
) -> Response {
    state.requests.fetch_add(1, Ordering::SeqCst);

    let Some(producers) = state.producers.lock().get(&params.topic).cloned() else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "message": "TOPIC_NOT_FOUND" })),
        )
            .into_response();
    };

    let producers: Vec<_> = producers
        .iter()
        .map(|addr| {
            json!({
                "remote_address": addr.to_string(),
                "hostname": "mock",
                "broadcast_address": addr.ip().to_string(),
                "tcp_port": addr.port(),
                "http_port": 0,
                "version": "1.3.0-mock",
            })
        })
        .collect();
    let data = json!({ "channels": [], "producers": producers });

    if state.wrapped {
        Json(json!({ "status_code": 200, "status_txt": "OK", "data": data })).into_response()
    } else {
        Json(data).into_response()
    }
}
