use crate::connection::ConnectionId;
use quiver_protocol::ProtocolError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Consumer already started")]
    AlreadyStarted,

    #[error("Discovery unavailable: {0}")]
    DiscoveryUnavailable(String),

    #[error("Connection error to {address}: {reason}")]
    ConnectionError { address: String, reason: String },

    #[error("In-flight capacity exceeded on connection {connection} (limit: {limit})")]
    CapacityExceeded {
        connection: ConnectionId,
        limit: usize,
    },

    #[error("Protocol error: {0}")]
    ProtocolError(#[from] ProtocolError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("TLS error: {0}")]
    TlsError(String),
}

impl Error {
    /// Whether a fresh connection attempt could succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::ConnectionError { .. }
                | Error::IoError(_)
                | Error::Timeout(_)
                | Error::DiscoveryUnavailable(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_transient() {
        assert!(Error::Timeout("heartbeat".into()).is_transient());
        assert!(Error::ConnectionError {
            address: "127.0.0.1:4150".into(),
            reason: "refused".into()
        }
        .is_transient());
        assert!(!Error::ConfigurationError("bad".into()).is_transient());
        assert!(!Error::AlreadyStarted.is_transient());
        assert!(!Error::ProtocolError(ProtocolError::Broker("E_BAD_TOPIC".into())).is_transient());
    }

    #[test]
    fn test_display() {
        let err = Error::CapacityExceeded {
            connection: ConnectionId::new(3),
            limit: 1,
        };
        assert_eq!(
            err.to_string(),
            "In-flight capacity exceeded on connection 3 (limit: 1)"
        );
    }
}
