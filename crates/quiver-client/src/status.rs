//! Consumer status for host UIs

use serde::Serialize;
use std::fmt;
use tokio::sync::watch;

/// Aggregate consumer status
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "detail", rename_all = "snake_case")]
pub enum ConsumerStatus {
    NotReady,
    /// At least one connection is ready; carries messages delivered since start
    Ready(u64),
    Disconnected,
    ConnectionError(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusFill {
    Green,
    Red,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusShape {
    Ring,
}

/// Rendering of a status badge
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusDisplay {
    pub fill: StatusFill,
    pub shape: StatusShape,
    pub text: String,
}

impl ConsumerStatus {
    pub fn display(&self) -> StatusDisplay {
        let (fill, text) = match self {
            ConsumerStatus::NotReady => (StatusFill::Red, "Not Ready".to_string()),
            ConsumerStatus::Ready(count) => (StatusFill::Green, format!("Ready ({})", count)),
            ConsumerStatus::Disconnected => (StatusFill::Red, "Disconnected".to_string()),
            ConsumerStatus::ConnectionError(detail) => (StatusFill::Red, detail.clone()),
        };
        StatusDisplay {
            fill,
            shape: StatusShape::Ring,
            text,
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, ConsumerStatus::Ready(_))
    }
}

impl fmt::Display for ConsumerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display().text)
    }
}

/// Events the coordinator reports
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusEvent {
    Ready { delivered: u64 },
    NotReady,
    Disconnected,
    Error(String),
}

/// Maps coordinator events to a [`ConsumerStatus`] and publishes changes.
///
/// `NotReady` does not replace a `ConnectionError`: a failed connection
/// keeps its error visible until something becomes ready again or the
/// consumer stops.
#[derive(Debug)]
pub struct StatusReporter {
    tx: watch::Sender<ConsumerStatus>,
}

impl Default for StatusReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusReporter {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ConsumerStatus::NotReady);
        Self { tx }
    }

    /// Pure event → status mapping
    pub fn derive(event: &StatusEvent) -> ConsumerStatus {
        match event {
            StatusEvent::Ready { delivered } => ConsumerStatus::Ready(*delivered),
            StatusEvent::NotReady => ConsumerStatus::NotReady,
            StatusEvent::Disconnected => ConsumerStatus::Disconnected,
            StatusEvent::Error(detail) => ConsumerStatus::ConnectionError(detail.clone()),
        }
    }

    /// Apply an event; returns whether the published status changed
    pub fn report(&self, event: StatusEvent) -> bool {
        let next = Self::derive(&event);
        self.tx.send_if_modified(|current| {
            let sticky_error = matches!(current, ConsumerStatus::ConnectionError(_))
                && next == ConsumerStatus::NotReady;
            if sticky_error || *current == next {
                return false;
            }
            *current = next;
            true
        })
    }

    pub fn current(&self) -> ConsumerStatus {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConsumerStatus> {
        self.tx.subscribe()
    }
}
