//! A single subscribed session with one nsqd
//!
//! Every [`BrokerConnection`] runs as its own task. The coordinator talks to
//! it through a [`ConnectionHandle`] (commands in) and receives
//! [`ConnectionEvent`]s (lifecycle and messages out). Socket reads happen on
//! a dedicated reader task because frame decoding is not cancellation safe.
//!
//! Lifecycle: `Connecting → Ready ⇄ NotReady → Closed`, with `Errored`
//! reported before `Closed` whenever the session fails.

use crate::config::{ConsumerConfig, SensitiveString};
use crate::error::{Error, Result};
use crate::resolver::BrokerTarget;
#[cfg(feature = "tls")]
use crate::tls::TlsUpgrader;
use bytes::Bytes;
use quiver_protocol::{
    read_frame, write_command, AuthResponse, Command, Frame, IdentifyRequest, IdentifyResponse,
    Message, MessageId, ProtocolError, MAGIC_V2, OK,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, info, warn};

/// How long to wait for `CLOSE_WAIT` after sending `CLS`
const CLOSE_WAIT_TIMEOUT: Duration = Duration::from_secs(1);

/// Frames buffered between the reader task and the session loop
const FRAME_BUFFER: usize = 64;

// ============================================================================
// Identity and state
// ============================================================================

/// Process-unique connection identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Ready,
    NotReady,
    Closed,
    Errored,
}

/// Acknowledgment sent for a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckKind {
    Finish,
    Touch,
    Requeue { delay: Duration, backoff: bool },
}

#[derive(Debug)]
pub enum ConnectionCommand {
    Ack { id: MessageId, kind: AckKind },
    /// Stop granting credit, drain, then close cleanly
    Close,
}

#[derive(Debug)]
pub struct ConnectionEvent {
    pub connection: ConnectionId,
    pub kind: ConnectionEventKind,
}

#[derive(Debug)]
pub enum ConnectionEventKind {
    Ready,
    NotReady,
    Message {
        message: Message,
        /// Broker-side timeout negotiated for this session
        msg_timeout: Duration,
    },
    Error(String),
    /// Always the last event of a connection
    Closed {
        /// The close was asked for through [`ConnectionHandle::close`]
        requested: bool,
    },
}

// ============================================================================
// Handles
// ============================================================================

/// Command side of a running connection
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    commands: mpsc::UnboundedSender<ConnectionCommand>,
}

impl ConnectionHandle {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queue an acknowledgment; false once the connection is gone
    pub fn send_ack(&self, id: MessageId, kind: AckKind) -> bool {
        self.commands
            .send(ConnectionCommand::Ack { id, kind })
            .is_ok()
    }

    pub fn close(&self) -> bool {
        self.commands.send(ConnectionCommand::Close).is_ok()
    }

    pub fn downgrade(&self) -> WeakConnectionHandle {
        WeakConnectionHandle {
            id: self.id,
            commands: self.commands.downgrade(),
        }
    }
}

#[cfg(test)]
impl ConnectionHandle {
    /// Handle backed by a bare channel instead of a running connection
    pub(crate) fn for_test(
        id: ConnectionId,
    ) -> (Self, mpsc::UnboundedReceiver<ConnectionCommand>) {
        let (commands, rx) = mpsc::unbounded_channel();
        (Self { id, commands }, rx)
    }
}

/// Non-owning handle kept alongside in-flight messages.
///
/// Upgrading fails once the coordinator has dropped the connection.
#[derive(Debug, Clone)]
pub struct WeakConnectionHandle {
    id: ConnectionId,
    commands: mpsc::WeakUnboundedSender<ConnectionCommand>,
}

impl WeakConnectionHandle {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn upgrade(&self) -> Option<ConnectionHandle> {
        self.commands.upgrade().map(|commands| ConnectionHandle {
            id: self.id,
            commands,
        })
    }
}

// ============================================================================
// Settings
// ============================================================================

/// Per-connection settings shared by every connection of a consumer
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub topic: String,
    pub channel: String,
    pub max_in_flight: u64,
    pub identify: IdentifyRequest,
    pub auth_secret: Option<SensitiveString>,
    pub heartbeat_interval: Duration,
    pub connect_timeout: Duration,
    pub drain_timeout: Duration,
    pub backoff_base: Duration,
    pub max_backoff: Duration,
    #[cfg(feature = "tls")]
    pub tls: Option<TlsUpgrader>,
}

impl ConnectionSettings {
    pub fn from_config(config: &ConsumerConfig) -> Result<Self> {
        Ok(Self {
            topic: config.topic.clone(),
            channel: config.channel.clone(),
            max_in_flight: config.max_in_flight,
            identify: config.identify_request(),
            auth_secret: config.auth_secret.clone(),
            heartbeat_interval: config.heartbeat_interval,
            connect_timeout: config.connect_timeout,
            drain_timeout: config.drain_timeout,
            backoff_base: config.backoff_base,
            max_backoff: config.max_backoff,
            #[cfg(feature = "tls")]
            tls: if config.tls {
                Some(TlsUpgrader::new(config.tls_insecure_skip_verify)?)
            } else {
                None
            },
        })
    }
}

/// `base × 2^exponent`, capped at `max`
pub(crate) fn backoff_delay(exponent: u32, base: Duration, max: Duration) -> Duration {
    let factor = 2u32.checked_pow(exponent).unwrap_or(u32::MAX);
    base.checked_mul(factor).unwrap_or(max).min(max)
}

// ============================================================================
// Stream
// ============================================================================

/// Plaintext or TLS-upgraded socket
enum ClientStream {
    Plaintext(TcpStream),
    #[cfg(feature = "tls")]
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl AsyncRead for ClientStream {
    fn poll_read(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match self.get_mut() {
            ClientStream::Plaintext(s) => std::pin::Pin::new(s).poll_read(cx, buf),
            #[cfg(feature = "tls")]
            ClientStream::Tls(s) => std::pin::Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ClientStream {
    fn poll_write(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        match self.get_mut() {
            ClientStream::Plaintext(s) => std::pin::Pin::new(s).poll_write(cx, buf),
            #[cfg(feature = "tls")]
            ClientStream::Tls(s) => std::pin::Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match self.get_mut() {
            ClientStream::Plaintext(s) => std::pin::Pin::new(s).poll_flush(cx),
            #[cfg(feature = "tls")]
            ClientStream::Tls(s) => std::pin::Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match self.get_mut() {
            ClientStream::Plaintext(s) => std::pin::Pin::new(s).poll_shutdown(cx),
            #[cfg(feature = "tls")]
            ClientStream::Tls(s) => std::pin::Pin::new(s).poll_shutdown(cx),
        }
    }
}

// ============================================================================
// Flow control
// ============================================================================

/// Credit bookkeeping for one session.
///
/// Unacknowledged messages are tracked by id so a broker-side redelivery of
/// the same id never counts twice.
#[derive(Debug)]
struct FlowControl {
    credit: u64,
    unacked: HashMap<MessageId, Instant>,
    backoff_level: u32,
    backoff_until: Option<Instant>,
    draining: bool,
}

impl FlowControl {
    fn new(credit: u64) -> Self {
        Self {
            credit,
            unacked: HashMap::new(),
            backoff_level: 0,
            backoff_until: None,
            draining: false,
        }
    }

    fn is_ready(&self) -> bool {
        !self.draining && self.backoff_until.is_none() && (self.unacked.len() as u64) < self.credit
    }

    /// RDY count the broker should currently hold
    fn rdy(&self) -> u64 {
        if self.draining || self.backoff_until.is_some() {
            0
        } else {
            self.credit
        }
    }

    fn received(&mut self, id: MessageId, deadline: Instant) {
        self.unacked.insert(id, deadline);
    }

    fn touched(&mut self, id: MessageId, deadline: Instant) {
        if let Some(current) = self.unacked.get_mut(&id) {
            *current = deadline;
        }
    }

    fn responded(&mut self, id: &MessageId) -> bool {
        self.unacked.remove(id).is_some()
    }

    /// Forget messages the broker has already timed out
    fn expire(&mut self, now: Instant) -> usize {
        let before = self.unacked.len();
        self.unacked.retain(|_, deadline| *deadline > now);
        before - self.unacked.len()
    }

    fn next_expiry(&self) -> Option<Instant> {
        self.unacked.values().min().copied()
    }

    fn succeeded(&mut self) {
        self.backoff_level = self.backoff_level.saturating_sub(1);
    }

    fn start_backoff(&mut self, now: Instant, base: Duration, max: Duration) -> Duration {
        self.backoff_level = self.backoff_level.saturating_add(1);
        let delay = backoff_delay(self.backoff_level - 1, base, max);
        self.backoff_until = Some(now + delay);
        delay
    }

    fn end_backoff(&mut self) {
        self.backoff_until = None;
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// `E_FIN_FAILED` and friends only mean the id was stale
fn is_fatal_broker_error(body: &str) -> bool {
    !matches!(
        body.split_whitespace().next(),
        Some("E_FIN_FAILED" | "E_REQ_FAILED" | "E_TOUCH_FAILED")
    )
}

// ============================================================================
// Connection
// ============================================================================

/// Established, subscribed socket
struct Session {
    stream: ClientStream,
    identify: IdentifyResponse,
}

/// One subscribed session with one broker
pub struct BrokerConnection {
    id: ConnectionId,
    target: BrokerTarget,
    settings: Arc<ConnectionSettings>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
}

impl BrokerConnection {
    /// Start a connection task. Its events arrive on `events`, ending with
    /// [`ConnectionEventKind::Closed`].
    pub fn spawn(
        id: ConnectionId,
        target: BrokerTarget,
        settings: Arc<ConnectionSettings>,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> (ConnectionHandle, JoinHandle<()>) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let connection = Self {
            id,
            target,
            settings,
            events,
        };
        let task = tokio::spawn(connection.run(commands_rx));

        (
            ConnectionHandle {
                id,
                commands: commands_tx,
            },
            task,
        )
    }

    async fn run(self, mut commands: mpsc::UnboundedReceiver<ConnectionCommand>) {
        debug!(connection = %self.id, address = %self.target, "Connecting");

        let connect_timeout = self.settings.connect_timeout;
        let connected = tokio::select! {
            result = timeout(connect_timeout, self.connect()) => match result {
                Ok(result) => result.map(Some),
                Err(_) => Err(Error::Timeout(format!(
                    "connecting to {} took longer than {:?}",
                    self.target, connect_timeout
                ))),
            },
            _ = wait_for_close(&mut commands) => Ok(None),
        };

        let requested = match connected {
            Ok(Some(session)) => match self.session(session, &mut commands).await {
                Ok(requested) => requested,
                Err(e) => {
                    self.report_error(&e);
                    false
                }
            },
            Ok(None) => true,
            Err(e) => {
                self.report_error(&e);
                false
            }
        };

        debug!(connection = %self.id, address = %self.target, requested, "Connection closed");
        self.emit(ConnectionEventKind::Closed { requested });
    }

    fn emit(&self, kind: ConnectionEventKind) {
        let _ = self.events.send(ConnectionEvent {
            connection: self.id,
            kind,
        });
    }

    fn report_error(&self, error: &Error) {
        warn!(connection = %self.id, address = %self.target, error = %error, "Connection failed");
        self.emit(ConnectionEventKind::Error(error.to_string()));
    }

    /// Magic, IDENTIFY, optional TLS and AUTH, then SUB
    async fn connect(&self) -> Result<Session> {
        let tcp = TcpStream::connect(self.target.address())
            .await
            .map_err(|e| Error::ConnectionError {
                address: self.target.to_string(),
                reason: e.to_string(),
            })?;
        tcp.set_nodelay(true)?;

        let mut stream = ClientStream::Plaintext(tcp);
        stream.write_all(MAGIC_V2).await?;

        write_command(&mut stream, &Command::Identify(self.settings.identify.clone())).await?;
        let identify = IdentifyResponse::from_body(&expect_response(&mut stream).await?)?;
        debug!(
            connection = %self.id,
            version = %identify.version,
            max_rdy_count = identify.max_rdy_count,
            msg_timeout = identify.msg_timeout,
            "Identified"
        );

        if identify.tls_v1 {
            stream = self.upgrade_tls(stream).await?;
            let body = expect_response(&mut stream).await?;
            if body != OK {
                return Err(unexpected("TLS upgrade", &body));
            }
        } else if self.settings.identify.tls_v1 {
            return Err(Error::TlsError(format!(
                "{} declined the TLS upgrade",
                self.target
            )));
        }

        if identify.auth_required {
            let secret = self
                .settings
                .auth_secret
                .as_ref()
                .ok_or_else(|| Error::ConnectionError {
                    address: self.target.to_string(),
                    reason: "broker requires AUTH but no auth secret is configured".to_string(),
                })?;
            write_command(&mut stream, &Command::Auth(secret.expose_secret().to_string())).await?;
            let auth = AuthResponse::from_body(&expect_response(&mut stream).await?)?;
            info!(
                connection = %self.id,
                identity = %auth.identity,
                permissions = auth.permission_count,
                "Authenticated"
            );
        } else if self.settings.auth_secret.is_some() {
            debug!(connection = %self.id, "Auth secret configured but broker does not require AUTH");
        }

        write_command(
            &mut stream,
            &Command::Sub {
                topic: self.settings.topic.clone(),
                channel: self.settings.channel.clone(),
            },
        )
        .await?;
        let body = expect_response(&mut stream).await?;
        if body != OK {
            return Err(unexpected("SUB", &body));
        }

        Ok(Session { stream, identify })
    }

    #[cfg(feature = "tls")]
    async fn upgrade_tls(&self, stream: ClientStream) -> Result<ClientStream> {
        let upgrader = self.settings.tls.as_ref().ok_or_else(|| {
            Error::TlsError("broker offered TLS that was not requested".to_string())
        })?;

        match stream {
            ClientStream::Plaintext(tcp) => {
                let tls = upgrader.upgrade(tcp, self.target.host()).await?;
                debug!(connection = %self.id, "TLS established");
                Ok(ClientStream::Tls(Box::new(tls)))
            }
            tls => Ok(tls),
        }
    }

    #[cfg(not(feature = "tls"))]
    async fn upgrade_tls(&self, _stream: ClientStream) -> Result<ClientStream> {
        Err(Error::TlsError(
            "broker requested TLS but quiver-client was built without the `tls` feature".to_string(),
        ))
    }

    /// Run a subscribed session until it is closed or fails.
    ///
    /// Returns `Ok(true)` after a requested close.
    async fn session(
        &self,
        session: Session,
        commands: &mut mpsc::UnboundedReceiver<ConnectionCommand>,
    ) -> Result<bool> {
        let Session { stream, identify } = session;
        let (mut reader, mut writer) = tokio::io::split(stream);

        let (frames_tx, mut frames) = mpsc::channel(FRAME_BUFFER);
        let reader_task = tokio::spawn(async move {
            loop {
                let frame = read_frame(&mut reader).await;
                let failed = frame.is_err();
                if frames_tx.send(frame).await.is_err() || failed {
                    break;
                }
            }
        });

        let result = self
            .pump(&mut writer, &mut frames, commands, &identify)
            .await;

        reader_task.abort();
        let _ = writer.shutdown().await;
        result
    }

    async fn pump(
        &self,
        writer: &mut WriteHalf<ClientStream>,
        frames: &mut mpsc::Receiver<quiver_protocol::Result<Frame>>,
        commands: &mut mpsc::UnboundedReceiver<ConnectionCommand>,
        identify: &IdentifyResponse,
    ) -> Result<bool> {
        let msg_timeout = Duration::from_millis(identify.msg_timeout);
        let max_rdy = if identify.max_rdy_count == 0 {
            self.settings.max_in_flight
        } else {
            identify.max_rdy_count
        };
        let credit = self.settings.max_in_flight.min(max_rdy);
        if credit < self.settings.max_in_flight {
            warn!(
                connection = %self.id,
                max_in_flight = self.settings.max_in_flight,
                max_rdy_count = max_rdy,
                "Broker caps RDY below max_in_flight"
            );
        }

        let mut flow = FlowControl::new(credit);
        let mut rdy_sent = flow.rdy();
        write_command(writer, &Command::Rdy(rdy_sent)).await?;

        let mut ready = flow.is_ready();
        self.emit(if ready {
            ConnectionEventKind::Ready
        } else {
            ConnectionEventKind::NotReady
        });
        info!(
            connection = %self.id,
            address = %self.target,
            topic = %self.settings.topic,
            channel = %self.settings.channel,
            rdy = rdy_sent,
            "Subscribed"
        );

        let heartbeat_timeout = self.settings.heartbeat_interval * 2;
        let mut last_frame = Instant::now();
        let mut drain_deadline: Option<Instant> = None;
        let mut commands_open = true;

        loop {
            if drain_deadline.is_some() && flow.unacked.is_empty() {
                break;
            }

            let expiry = if flow.is_ready() {
                None
            } else {
                flow.next_expiry()
            };

            tokio::select! {
                frame = frames.recv() => {
                    let frame = match frame {
                        Some(frame) => frame?,
                        None => {
                            return Err(Error::ConnectionError {
                                address: self.target.to_string(),
                                reason: "connection closed by broker".to_string(),
                            })
                        }
                    };
                    last_frame = Instant::now();

                    match frame {
                        frame if frame.is_heartbeat() => {
                            debug!(connection = %self.id, "Heartbeat");
                            write_command(writer, &Command::Nop).await?;
                        }
                        Frame::Message(message) => {
                            if drain_deadline.is_some() {
                                debug!(connection = %self.id, message_id = %message.id, "Requeueing message received while draining");
                                write_command(writer, &Command::Req { id: message.id, timeout_ms: 0 }).await?;
                                continue;
                            }
                            flow.received(message.id, last_frame + msg_timeout);
                            self.emit(ConnectionEventKind::Message { message, msg_timeout });
                        }
                        Frame::Response(body) => {
                            debug!(connection = %self.id, response = %String::from_utf8_lossy(&body), "Unsolicited response");
                        }
                        Frame::Error(body) => {
                            let text = String::from_utf8_lossy(&body).into_owned();
                            if is_fatal_broker_error(&text) {
                                return Err(ProtocolError::Broker(text).into());
                            }
                            warn!(connection = %self.id, error = %text, "Broker rejected acknowledgment");
                        }
                    }
                }
                command = commands.recv(), if commands_open => match command {
                    Some(ConnectionCommand::Ack { id, kind }) => {
                        self.apply_ack(writer, &mut flow, id, kind, msg_timeout).await?;
                    }
                    Some(ConnectionCommand::Close) => {
                        if drain_deadline.is_none() {
                            info!(connection = %self.id, unacked = flow.unacked.len(), "Draining");
                            flow.draining = true;
                            drain_deadline = Some(Instant::now() + self.settings.drain_timeout);
                        }
                    }
                    None => {
                        // Every handle dropped: nobody can acknowledge anymore
                        commands_open = false;
                        flow.draining = true;
                        flow.unacked.clear();
                        drain_deadline.get_or_insert_with(Instant::now);
                    }
                },
                _ = sleep_until_opt(flow.backoff_until) => {
                    debug!(connection = %self.id, level = flow.backoff_level, "Backoff elapsed");
                    flow.end_backoff();
                }
                _ = sleep_until_opt(expiry) => {
                    let expired = flow.expire(Instant::now());
                    debug!(connection = %self.id, expired, "Messages timed out on the broker");
                }
                _ = sleep_until_opt(drain_deadline) => {
                    warn!(connection = %self.id, unacked = flow.unacked.len(), "Drain timeout elapsed");
                    break;
                }
                _ = sleep_until(last_frame + heartbeat_timeout) => {
                    return Err(Error::Timeout(format!(
                        "no frame from {} within {:?}",
                        self.target, heartbeat_timeout
                    )));
                }
            }

            let rdy = flow.rdy();
            if rdy != rdy_sent {
                write_command(writer, &Command::Rdy(rdy)).await?;
                rdy_sent = rdy;
            }

            let now_ready = flow.is_ready();
            if now_ready != ready {
                ready = now_ready;
                self.emit(if ready {
                    ConnectionEventKind::Ready
                } else {
                    ConnectionEventKind::NotReady
                });
            }
        }

        write_command(writer, &Command::Cls).await?;
        let acknowledged = timeout(CLOSE_WAIT_TIMEOUT, async {
            while let Some(frame) = frames.recv().await {
                match frame {
                    Ok(frame) if frame.is_close_wait() => return true,
                    Ok(frame) if frame.is_heartbeat() => {
                        let _ = write_command(writer, &Command::Nop).await;
                    }
                    Ok(Frame::Message(message)) => {
                        let _ = write_command(
                            writer,
                            &Command::Req {
                                id: message.id,
                                timeout_ms: 0,
                            },
                        )
                        .await;
                    }
                    Ok(_) => {}
                    Err(_) => return false,
                }
            }
            false
        })
        .await
        .unwrap_or(false);

        debug!(connection = %self.id, acknowledged, "Sent CLS");
        Ok(true)
    }

    async fn apply_ack(
        &self,
        writer: &mut WriteHalf<ClientStream>,
        flow: &mut FlowControl,
        id: MessageId,
        kind: AckKind,
        msg_timeout: Duration,
    ) -> Result<()> {
        match kind {
            AckKind::Finish => {
                write_command(writer, &Command::Fin(id)).await?;
                flow.responded(&id);
                flow.succeeded();
            }
            AckKind::Touch => {
                write_command(writer, &Command::Touch(id)).await?;
                flow.touched(id, Instant::now() + msg_timeout);
            }
            AckKind::Requeue { delay, backoff } => {
                write_command(
                    writer,
                    &Command::Req {
                        id,
                        timeout_ms: delay.as_millis() as u64,
                    },
                )
                .await?;
                flow.responded(&id);
                if backoff {
                    let delay = flow.start_backoff(
                        Instant::now(),
                        self.settings.backoff_base,
                        self.settings.max_backoff,
                    );
                    info!(connection = %self.id, level = flow.backoff_level, ?delay, "Backing off");
                }
            }
        }
        Ok(())
    }
}

/// Read the next response body during the handshake
async fn expect_response(stream: &mut ClientStream) -> Result<Bytes> {
    loop {
        match read_frame(stream).await? {
            frame if frame.is_heartbeat() => write_command(stream, &Command::Nop).await?,
            Frame::Response(body) => return Ok(body),
            Frame::Error(body) => {
                return Err(ProtocolError::Broker(String::from_utf8_lossy(&body).into_owned()).into())
            }
            Frame::Message(message) => {
                return Err(ProtocolError::UnexpectedResponse(format!(
                    "message {} before subscription",
                    message.id
                ))
                .into())
            }
        }
    }
}

fn unexpected(step: &str, body: &[u8]) -> Error {
    ProtocolError::UnexpectedResponse(format!(
        "{}: {}",
        step,
        String::from_utf8_lossy(body)
    ))
    .into()
}

/// Resolve once a close is requested (or every handle is gone)
async fn wait_for_close(commands: &mut mpsc::UnboundedReceiver<ConnectionCommand>) {
    while let Some(command) = commands.recv().await {
        if matches!(command, ConnectionCommand::Close) {
            return;
        }
    }
}
