//! Process-wide index of messages awaiting acknowledgment
//!
//! Entries are keyed by `(ConnectionId, MessageId)` because broker message
//! ids are only unique per connection. All mutations happen under one lock,
//! and the matching wire command is queued to the owning connection while
//! that lock is held, so at most one FIN or REQ is ever sent per entry and
//! commands for the same message keep their order.

use crate::connection::{AckKind, ConnectionId, WeakConnectionHandle};
use crate::error::{Error, Result};
use parking_lot::Mutex;
use quiver_protocol::{Message, MessageId};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

pub type InFlightKey = (ConnectionId, MessageId);

/// A delivered message that has not been finished or requeued yet
#[derive(Debug, Clone)]
pub struct InFlightMessage {
    pub connection: ConnectionId,
    pub message: Message,
    pub received_at: Instant,
    /// When the broker will consider the message timed out
    pub deadline: Instant,
    pub msg_timeout: Duration,
    owner: WeakConnectionHandle,
}

impl InFlightMessage {
    pub fn new(owner: WeakConnectionHandle, message: Message, msg_timeout: Duration) -> Self {
        let received_at = Instant::now();
        Self {
            connection: owner.id(),
            message,
            received_at,
            deadline: received_at + msg_timeout,
            msg_timeout,
            owner,
        }
    }

    pub fn key(&self) -> InFlightKey {
        (self.connection, self.message.id)
    }

    /// Time left before the broker redelivers
    pub fn time_remaining(&self, now: Instant) -> Duration {
        self.deadline.saturating_duration_since(now)
    }
}

/// What an applied acknowledgment did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Responded {
    /// The command reached the owning connection
    pub dispatched: bool,
    /// Remaining broker-side timeout after the acknowledgment
    pub time_remaining: Duration,
}

#[derive(Debug, Default)]
struct RegistryState {
    entries: HashMap<InFlightKey, InFlightMessage>,
    per_connection: HashMap<ConnectionId, usize>,
    capacity: usize,
}

impl RegistryState {
    fn remove(&mut self, key: &InFlightKey) -> Option<InFlightMessage> {
        let entry = self.entries.remove(key)?;
        if let Some(count) = self.per_connection.get_mut(&key.0) {
            *count -= 1;
            if *count == 0 {
                self.per_connection.remove(&key.0);
            }
        }
        Some(entry)
    }

    fn count_for(&self, connection: ConnectionId) -> usize {
        self.per_connection.get(&connection).copied().unwrap_or(0)
    }
}

/// Concurrent in-flight message index
#[derive(Debug)]
pub struct InFlightRegistry {
    state: Mutex<RegistryState>,
}

impl InFlightRegistry {
    /// `capacity` is the per-connection limit (the consumer's `max_in_flight`)
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(RegistryState {
                capacity,
                ..Default::default()
            }),
        }
    }

    pub fn set_capacity(&self, capacity: usize) {
        self.state.lock().capacity = capacity;
    }

    /// Track a delivered message.
    ///
    /// Entries of the same connection whose broker deadline has passed are
    /// dropped first; if the connection is still at capacity the message is
    /// rejected with [`Error::CapacityExceeded`]. A redelivery of an id the
    /// connection already holds replaces the stale entry.
    pub fn register(&self, entry: InFlightMessage) -> Result<()> {
        let key = entry.key();
        let mut state = self.state.lock();

        if state.entries.contains_key(&key) {
            debug!(connection = %key.0, message_id = %key.1, "Replacing redelivered message");
            state.entries.insert(key, entry);
            return Ok(());
        }

        if state.count_for(key.0) >= state.capacity {
            let now = Instant::now();
            let expired: Vec<InFlightKey> = state
                .entries
                .iter()
                .filter(|(k, e)| k.0 == key.0 && e.deadline <= now)
                .map(|(k, _)| *k)
                .collect();
            for stale in &expired {
                state.remove(stale);
            }
            if !expired.is_empty() {
                debug!(connection = %key.0, expired = expired.len(), "Dropped timed out entries");
            }
        }

        if state.count_for(key.0) >= state.capacity {
            return Err(Error::CapacityExceeded {
                connection: key.0,
                limit: state.capacity,
            });
        }

        *state.per_connection.entry(key.0).or_insert(0) += 1;
        state.entries.insert(key, entry);
        Ok(())
    }

    pub fn lookup(&self, key: &InFlightKey) -> Option<InFlightMessage> {
        self.state.lock().entries.get(key).cloned()
    }

    /// Drop an entry without acknowledging it. Idempotent.
    pub fn remove(&self, key: &InFlightKey) -> Option<InFlightMessage> {
        self.state.lock().remove(key)
    }

    /// Apply an acknowledgment atomically.
    ///
    /// Finish and requeue remove the entry, touch extends its deadline. The
    /// wire command is queued to the owning connection before the lock is
    /// released. Returns `None` when the key is unknown.
    pub fn respond(&self, key: &InFlightKey, kind: AckKind) -> Option<Responded> {
        let mut state = self.state.lock();
        let now = Instant::now();

        let (owner, time_remaining) = match kind {
            AckKind::Touch => {
                let entry = state.entries.get_mut(key)?;
                entry.deadline = now + entry.msg_timeout;
                (entry.owner.clone(), entry.msg_timeout)
            }
            AckKind::Finish | AckKind::Requeue { .. } => {
                let entry = state.remove(key)?;
                (entry.owner, entry.deadline.saturating_duration_since(now))
            }
        };

        let dispatched = owner
            .upgrade()
            .map(|handle| handle.send_ack(key.1, kind))
            .unwrap_or(false);
        if !dispatched {
            warn!(connection = %key.0, message_id = %key.1, "Owning connection is gone, acknowledgment dropped");
        }

        Some(Responded {
            dispatched,
            time_remaining,
        })
    }

    /// Drop every entry of a connection that went away
    pub fn release_all_for(&self, connection: ConnectionId) -> usize {
        let mut state = self.state.lock();
        let before = state.entries.len();
        state.entries.retain(|key, _| key.0 != connection);
        state.per_connection.remove(&connection);
        before - state.entries.len()
    }

    pub fn clear(&self) -> usize {
        let mut state = self.state.lock();
        let released = state.entries.len();
        state.entries.clear();
        state.per_connection.clear();
        released
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn len_for(&self, connection: ConnectionId) -> usize {
        self.state.lock().count_for(connection)
    }
}
