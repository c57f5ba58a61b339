//! Managed consumer
//!
//! [`Consumer`] ties everything together: it resolves broker targets, keeps
//! one [`BrokerConnection`] per target, registers every delivered message in
//! the [`InFlightRegistry`], hands deliveries to the registered
//! [`MessageHandler`] and routes acknowledgments back to the connection that
//! delivered the message.
//!
//! # Example
//!
//! ```rust,ignore
//! use quiver_client::{Consumer, ConsumerConfig};
//! use tokio::sync::mpsc;
//!
//! let consumer = Consumer::new();
//! let (tx, mut deliveries) = mpsc::unbounded_channel();
//! consumer.on_message(move |delivery| {
//!     let _ = tx.send(delivery);
//! });
//!
//! let config = ConsumerConfig::builder("events", "archive")
//!     .lookupd(vec!["127.0.0.1:4161".into()])
//!     .max_in_flight(10)
//!     .build();
//! consumer.start(config).await?;
//!
//! while let Some(mut delivery) = deliveries.recv().await {
//!     process(&delivery.payload);
//!     consumer.finish(&mut delivery.token);
//! }
//!
//! consumer.stop().await;
//! ```
//!
//! # Delivery guarantees
//!
//! Delivery is at-least-once. Messages still in flight when their connection
//! drops are released without any wire command; the broker redelivers them
//! after its own timeout. With `finish_immediately` every message is
//! finished on receipt and can no longer be touched or requeued.

use crate::config::ConsumerConfig;
use crate::connection::{
    backoff_delay, AckKind, BrokerConnection, ConnectionEvent, ConnectionEventKind,
    ConnectionHandle, ConnectionId, ConnectionSettings, ConnectionState,
};
use crate::error::{Error, Result};
use crate::message::{AckOutcome, AckToken, Delivery, MessageHandler, Payload};
use crate::registry::{InFlightMessage, InFlightRegistry};
use crate::resolver::{resolver_for, AddressResolver, BrokerTarget};
use crate::status::{ConsumerStatus, StatusEvent, StatusReporter};
use parking_lot::{Mutex, RwLock};
use quiver_protocol::Message;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Extra time granted to connections after the drain timeout on stop
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

// ============================================================================
// Statistics
// ============================================================================

#[derive(Debug, Default)]
struct ConsumerStats {
    delivered: AtomicU64,
    finished: AtomicU64,
    requeued: AtomicU64,
    touched: AtomicU64,
    ignored_acks: AtomicU64,
    auto_finished: AtomicU64,
    connections: AtomicUsize,
}

/// Point-in-time consumer counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConsumerStatsSnapshot {
    pub delivered: u64,
    pub finished: u64,
    pub requeued: u64,
    pub touched: u64,
    pub ignored_acks: u64,
    pub auto_finished: u64,
    pub connections: usize,
    /// Same count as [`Consumer::in_flight`], broker-expired entries included
    pub in_flight: usize,
}

// ============================================================================
// Consumer
// ============================================================================

enum Lifecycle {
    Idle,
    Running {
        shutdown: CancellationToken,
        task: JoinHandle<()>,
    },
    Stopped,
}

/// State shared between the public handle and the coordinator task
struct Shared {
    node_id: RwLock<String>,
    registry: InFlightRegistry,
    status: StatusReporter,
    stats: ConsumerStats,
    handler: RwLock<Option<Arc<dyn MessageHandler>>>,
    lifecycle: Mutex<Lifecycle>,
}

impl Shared {
    fn node_id(&self) -> String {
        self.node_id.read().clone()
    }

    fn handler(&self) -> Option<Arc<dyn MessageHandler>> {
        self.handler.read().clone()
    }
}

/// Managed NSQ consumer. Single use: once stopped it cannot be restarted.
pub struct Consumer {
    shared: Arc<Shared>,
}

impl Default for Consumer {
    fn default() -> Self {
        Self::new()
    }
}

impl Consumer {
    pub fn new() -> Self {
        Self::with_node_id(uuid::Uuid::new_v4().to_string())
    }

    /// Consumer whose ack tokens carry `node_id`
    pub fn with_node_id(node_id: impl Into<String>) -> Self {
        Self {
            shared: Arc::new(Shared {
                node_id: RwLock::new(node_id.into()),
                registry: InFlightRegistry::new(1),
                status: StatusReporter::new(),
                stats: ConsumerStats::default(),
                handler: RwLock::new(None),
                lifecycle: Mutex::new(Lifecycle::Idle),
            }),
        }
    }

    pub fn node_id(&self) -> String {
        self.shared.node_id()
    }

    /// Register the downstream sink, replacing any previous one.
    ///
    /// The handler runs on the coordinator task and should hand the delivery
    /// off (for example into a channel) rather than process it inline.
    pub fn on_message<H: MessageHandler>(&self, handler: H) {
        *self.shared.handler.write() = Some(Arc::new(handler));
    }

    /// Validate `config` and begin resolving and connecting.
    ///
    /// Configuration problems fail before any network activity. Calling
    /// `start` on a running or stopped consumer fails with
    /// [`Error::AlreadyStarted`].
    pub async fn start(&self, config: ConsumerConfig) -> Result<()> {
        let mut lifecycle = self.shared.lifecycle.lock();
        if !matches!(*lifecycle, Lifecycle::Idle) {
            return Err(Error::AlreadyStarted);
        }

        let source = config.validate_for_start()?;
        let resolver = resolver_for(&source, &config)?;
        let settings = Arc::new(ConnectionSettings::from_config(&config)?);

        if let Some(node_id) = &config.node_id {
            *self.shared.node_id.write() = node_id.clone();
        }
        self.shared
            .registry
            .set_capacity(config.max_in_flight as usize);

        info!(
            topic = %config.topic,
            channel = %config.channel,
            max_in_flight = config.max_in_flight,
            source = ?source,
            "Starting consumer"
        );

        let shutdown = CancellationToken::new();
        let coordinator = Coordinator::new(
            self.shared.clone(),
            Arc::new(config),
            settings,
            resolver,
            shutdown.clone(),
        );
        let task = tokio::spawn(coordinator.run());

        *lifecycle = Lifecycle::Running { shutdown, task };
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.shared.lifecycle.lock(), Lifecycle::Running { .. })
    }

    /// Finish a message. Marks the token as responded.
    pub fn finish(&self, token: &mut AckToken) -> AckOutcome {
        self.acknowledge(token, AckKind::Finish)
    }

    /// Reset the broker-side timeout. Refreshes `token.timeout_remaining`.
    pub fn touch(&self, token: &mut AckToken) -> AckOutcome {
        self.acknowledge(token, AckKind::Touch)
    }

    /// Requeue a message for redelivery after `delay`. With `backoff` the
    /// owning connection also pauses delivery for an exponentially growing
    /// period.
    pub fn requeue(&self, token: &mut AckToken, delay: Duration, backoff: bool) -> AckOutcome {
        self.acknowledge(token, AckKind::Requeue { delay, backoff })
    }

    /// Apply an acknowledgment. Unknown, stale, foreign or already answered
    /// tokens are ignored.
    pub fn acknowledge(&self, token: &mut AckToken, kind: AckKind) -> AckOutcome {
        if token.has_responded || token.node_id != *self.shared.node_id.read() {
            return self.ignored(token, kind);
        }

        let key = (token.connection, token.id);
        let responded = match self.shared.registry.respond(&key, kind) {
            Some(responded) => responded,
            None => return self.ignored(token, kind),
        };

        let stats = &self.shared.stats;
        match kind {
            AckKind::Finish => {
                token.has_responded = true;
                stats.finished.fetch_add(1, Ordering::Relaxed);
            }
            AckKind::Requeue { .. } => {
                token.has_responded = true;
                stats.requeued.fetch_add(1, Ordering::Relaxed);
            }
            AckKind::Touch => {
                token.timeout_remaining = responded.time_remaining;
                stats.touched.fetch_add(1, Ordering::Relaxed);
            }
        }

        if responded.dispatched {
            AckOutcome::Applied
        } else {
            AckOutcome::Ignored
        }
    }

    /// Acknowledge through a delivery envelope (`{"_nsq": {...}, ...}`),
    /// writing the updated token back into it.
    pub fn acknowledge_envelope(&self, envelope: &mut Value, kind: AckKind) -> AckOutcome {
        let Some(mut token) = AckToken::from_envelope(envelope) else {
            self.shared.stats.ignored_acks.fetch_add(1, Ordering::Relaxed);
            debug!(?kind, "Ignoring acknowledgment without a valid token");
            return AckOutcome::Ignored;
        };

        let outcome = self.acknowledge(&mut token, kind);
        if outcome.is_applied() {
            token.write_to_envelope(envelope);
        }
        outcome
    }

    fn ignored(&self, token: &AckToken, kind: AckKind) -> AckOutcome {
        self.shared.stats.ignored_acks.fetch_add(1, Ordering::Relaxed);
        debug!(
            connection = %token.connection,
            message_id = %token.id,
            ?kind,
            "Ignoring acknowledgment for unknown message"
        );
        AckOutcome::Ignored
    }

    /// In-flight entry behind a token, if it is still pending
    pub fn lookup(&self, token: &AckToken) -> Option<InFlightMessage> {
        self.shared.registry.lookup(&(token.connection, token.id))
    }

    /// Messages awaiting acknowledgment across all connections.
    ///
    /// Entries whose broker timeout has passed are counted until they are
    /// answered, released with their connection, or pruned under capacity
    /// pressure; the broker may already have requeued them.
    pub fn in_flight(&self) -> usize {
        self.shared.registry.len()
    }

    pub fn status(&self) -> ConsumerStatus {
        self.shared.status.current()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ConsumerStatus> {
        self.shared.status.subscribe()
    }

    pub fn stats(&self) -> ConsumerStatsSnapshot {
        let stats = &self.shared.stats;
        ConsumerStatsSnapshot {
            delivered: stats.delivered.load(Ordering::Relaxed),
            finished: stats.finished.load(Ordering::Relaxed),
            requeued: stats.requeued.load(Ordering::Relaxed),
            touched: stats.touched.load(Ordering::Relaxed),
            ignored_acks: stats.ignored_acks.load(Ordering::Relaxed),
            auto_finished: stats.auto_finished.load(Ordering::Relaxed),
            connections: stats.connections.load(Ordering::Relaxed),
            in_flight: self.shared.registry.len(),
        }
    }

    /// Drain and close every connection, then report `Disconnected`.
    /// Safe to call any number of times.
    pub async fn stop(&self) {
        let previous = std::mem::replace(&mut *self.shared.lifecycle.lock(), Lifecycle::Stopped);

        match previous {
            Lifecycle::Running { shutdown, task } => {
                shutdown.cancel();
                if let Err(e) = task.await {
                    error!(error = %e, "Coordinator task failed");
                    self.shared.registry.clear();
                    self.shared.status.report(StatusEvent::Disconnected);
                }
            }
            Lifecycle::Idle => {
                self.shared.status.report(StatusEvent::Disconnected);
            }
            Lifecycle::Stopped => {}
        }
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        // The coordinator still drains its connections on its own
        if let Lifecycle::Running { shutdown, .. } = &*self.shared.lifecycle.lock() {
            shutdown.cancel();
        }
    }
}

// ============================================================================
// Coordinator
// ============================================================================

struct ConnectionEntry {
    target: BrokerTarget,
    handle: ConnectionHandle,
    state: ConnectionState,
    task: JoinHandle<()>,
}

/// Event loop owning the connection table
struct Coordinator {
    shared: Arc<Shared>,
    config: Arc<ConsumerConfig>,
    settings: Arc<ConnectionSettings>,
    resolver: Arc<dyn AddressResolver>,
    shutdown: CancellationToken,
    events_tx: mpsc::UnboundedSender<ConnectionEvent>,
    events_rx: mpsc::UnboundedReceiver<ConnectionEvent>,
    reconnect_tx: mpsc::UnboundedSender<BrokerTarget>,
    reconnect_rx: mpsc::UnboundedReceiver<BrokerTarget>,
    connections: HashMap<ConnectionId, ConnectionEntry>,
    /// Latest resolved target set
    desired: BTreeSet<BrokerTarget>,
    pending_reconnects: HashSet<BrokerTarget>,
    reconnect_attempts: HashMap<BrokerTarget, u32>,
    next_id: u64,
    stopping: bool,
}

async fn next_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

impl Coordinator {
    fn new(
        shared: Arc<Shared>,
        config: Arc<ConsumerConfig>,
        settings: Arc<ConnectionSettings>,
        resolver: Arc<dyn AddressResolver>,
        shutdown: CancellationToken,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (reconnect_tx, reconnect_rx) = mpsc::unbounded_channel();
        Self {
            shared,
            config,
            settings,
            resolver,
            shutdown,
            events_tx,
            events_rx,
            reconnect_tx,
            reconnect_rx,
            connections: HashMap::new(),
            desired: BTreeSet::new(),
            pending_reconnects: HashSet::new(),
            reconnect_attempts: HashMap::new(),
            next_id: 0,
            stopping: false,
        }
    }

    async fn run(mut self) {
        let shutdown = self.shutdown.clone();

        tokio::select! {
            _ = shutdown.cancelled() => {}
            _ = self.refresh() => {}
        }

        let mut poll = self.resolver.poll_interval().map(|period| {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });

        while !shutdown.is_cancelled() {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                Some(event) = self.events_rx.recv() => self.handle_event(event),
                Some(target) = self.reconnect_rx.recv() => self.reconnect(target),
                _ = next_tick(&mut poll) => self.refresh().await,
            }
        }

        self.drain().await;
    }

    async fn refresh(&mut self) {
        match self.resolver.resolve().await {
            Ok(targets) => self.reconcile(targets),
            Err(e) => {
                warn!(error = %e, "Discovery failed, keeping current connections");
                if self.connections.is_empty() {
                    self.shared.status.report(StatusEvent::Error(e.to_string()));
                }
            }
        }
    }

    /// Open connections for new targets, close the ones no longer resolved
    fn reconcile(&mut self, targets: BTreeSet<BrokerTarget>) {
        let active: HashSet<BrokerTarget> = self
            .connections
            .values()
            .map(|entry| entry.target.clone())
            .collect();

        for target in &targets {
            if !active.contains(target) && !self.pending_reconnects.contains(target) {
                self.open(target.clone());
            }
        }

        for entry in self.connections.values() {
            if !targets.contains(&entry.target) {
                info!(address = %entry.target, connection = %entry.handle.id(), "Broker no longer resolved, closing");
                entry.handle.close();
            }
        }

        self.reconnect_attempts.retain(|target, _| targets.contains(target));
        self.desired = targets;
    }

    fn open(&mut self, target: BrokerTarget) {
        self.next_id += 1;
        let id = ConnectionId::new(self.next_id);
        let (handle, task) = BrokerConnection::spawn(
            id,
            target.clone(),
            self.settings.clone(),
            self.events_tx.clone(),
        );

        self.connections.insert(
            id,
            ConnectionEntry {
                target,
                handle,
                state: ConnectionState::Connecting,
                task,
            },
        );
        self.shared
            .stats
            .connections
            .store(self.connections.len(), Ordering::Relaxed);
    }

    fn schedule_reconnect(&mut self, target: BrokerTarget) {
        if !self.pending_reconnects.insert(target.clone()) {
            return;
        }

        let attempt = self.reconnect_attempts.entry(target.clone()).or_insert(0);
        let delay = backoff_delay(
            *attempt,
            self.config.reconnect_backoff,
            self.config.reconnect_backoff_max,
        );
        *attempt = attempt.saturating_add(1);
        info!(address = %target, ?delay, "Reconnecting");

        let tx = self.reconnect_tx.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let _ = tx.send(target);
                }
            }
        });
    }

    fn reconnect(&mut self, target: BrokerTarget) {
        self.pending_reconnects.remove(&target);
        let connected = self.connections.values().any(|entry| entry.target == target);
        if self.stopping || connected || !self.desired.contains(&target) {
            return;
        }
        self.open(target);
    }

    fn handle_event(&mut self, event: ConnectionEvent) {
        let id = event.connection;
        match event.kind {
            ConnectionEventKind::Ready => {
                if let Some(entry) = self.connections.get_mut(&id) {
                    entry.state = ConnectionState::Ready;
                    self.reconnect_attempts.remove(&entry.target);
                }
                self.update_status();
            }
            ConnectionEventKind::NotReady => {
                if let Some(entry) = self.connections.get_mut(&id) {
                    entry.state = ConnectionState::NotReady;
                }
                self.update_status();
            }
            ConnectionEventKind::Message {
                message,
                msg_timeout,
            } => self.deliver(id, message, msg_timeout),
            ConnectionEventKind::Error(detail) => {
                if let Some(entry) = self.connections.get_mut(&id) {
                    entry.state = ConnectionState::Errored;
                }
                if !self.stopping {
                    self.shared.status.report(StatusEvent::Error(detail));
                }
            }
            ConnectionEventKind::Closed { requested } => self.connection_closed(id, requested),
        }
    }

    fn deliver(&mut self, id: ConnectionId, message: Message, msg_timeout: Duration) {
        let Some(entry) = self.connections.get(&id) else {
            return;
        };
        let handle = entry.handle.clone();

        if self.stopping {
            debug!(connection = %id, message_id = %message.id, "Requeueing message received while stopping");
            handle.send_ack(
                message.id,
                AckKind::Requeue {
                    delay: Duration::ZERO,
                    backoff: false,
                },
            );
            return;
        }

        let finish_immediately = self.config.finish_immediately;
        if finish_immediately {
            handle.send_ack(message.id, AckKind::Finish);
            self.shared
                .stats
                .auto_finished
                .fetch_add(1, Ordering::Relaxed);
        } else if let Err(e) = self.shared.registry.register(InFlightMessage::new(
            handle.downgrade(),
            message.clone(),
            msg_timeout,
        )) {
            error!(connection = %id, message_id = %message.id, error = %e, "Rejecting message");
            handle.send_ack(
                message.id,
                AckKind::Requeue {
                    delay: Duration::ZERO,
                    backoff: false,
                },
            );
            return;
        }

        let max_attempts = self.config.max_attempts;
        if max_attempts > 0 && message.attempts > max_attempts {
            debug!(
                message_id = %message.id,
                attempts = message.attempts,
                max_attempts,
                "Message exceeded max attempts"
            );
        }

        let delivered = self.shared.stats.delivered.fetch_add(1, Ordering::Relaxed) + 1;
        self.shared.status.report(StatusEvent::Ready { delivered });

        let delivery = Delivery {
            token: AckToken {
                id: message.id,
                connection: id,
                node_id: self.shared.node_id(),
                timestamp: message.timestamp,
                attempts: message.attempts,
                timeout_remaining: msg_timeout,
                has_responded: finish_immediately,
            },
            payload: Payload::decode(&message.body),
            body: message.body,
        };

        match self.shared.handler() {
            Some(handler) => handler.handle(delivery),
            None => warn!(
                message_id = %delivery.token.id,
                "No message handler registered, message stays in flight"
            ),
        }
    }

    fn connection_closed(&mut self, id: ConnectionId, requested: bool) {
        let Some(entry) = self.connections.remove(&id) else {
            return;
        };
        self.shared
            .stats
            .connections
            .store(self.connections.len(), Ordering::Relaxed);

        let released = self.shared.registry.release_all_for(id);
        if released > 0 {
            info!(connection = %id, released, "Released in-flight messages, the broker will redeliver them");
        }

        if !self.stopping && self.desired.contains(&entry.target) {
            if requested {
                // Closed by discovery, then resolved again while draining
                let connected = self.connections.values().any(|e| e.target == entry.target);
                if !connected && !self.pending_reconnects.contains(&entry.target) {
                    info!(address = %entry.target, "Broker resolved again, reopening");
                    self.open(entry.target);
                }
            } else {
                self.schedule_reconnect(entry.target);
            }
        }
        self.update_status();
    }

    fn update_status(&self) {
        if self.stopping {
            return;
        }
        let ready = self
            .connections
            .values()
            .any(|entry| entry.state == ConnectionState::Ready);
        let event = if ready {
            StatusEvent::Ready {
                delivered: self.shared.stats.delivered.load(Ordering::Relaxed),
            }
        } else {
            StatusEvent::NotReady
        };
        self.shared.status.report(event);
    }

    /// Close every connection, wait for them (bounded), release what is left
    async fn drain(mut self) {
        self.stopping = true;
        info!(connections = self.connections.len(), "Stopping consumer");

        for entry in self.connections.values() {
            entry.handle.close();
        }

        let deadline = Instant::now() + self.config.drain_timeout + SHUTDOWN_GRACE;
        while !self.connections.is_empty() {
            tokio::select! {
                event = self.events_rx.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => break,
                },
                _ = sleep_until(deadline) => {
                    warn!(remaining = self.connections.len(), "Connections did not close in time, aborting");
                    for (id, entry) in self.connections.drain() {
                        entry.task.abort();
                        self.shared.registry.release_all_for(id);
                    }
                    break;
                }
            }
        }

        let released = self.shared.registry.clear();
        if released > 0 {
            debug!(released, "Cleared in-flight registry");
        }
        self.shared.stats.connections.store(0, Ordering::Relaxed);
        self.shared.status.report(StatusEvent::Disconnected);
        info!("Consumer stopped");
    }
}
