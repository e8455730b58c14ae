//! Client error taxonomy

use hopwire_proto::{EndpointRef, ProtocolError, RemoteFault};
use hopwire_transport::TransportError;
use std::time::Duration;
use thiserror::Error;

/// Boxed error returned by external collaborators
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Retry classification of a [`ClientError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The endpoint or its connection is unusable; eligible for failover
    Transport,
    /// No response within the call deadline; never retried automatically
    Timeout,
    /// The server or the caller rejected the call; never retried
    Application,
    /// Every candidate endpoint failed
    Exhaustion,
}

/// One abandoned endpoint during connection establishment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedAttempt {
    pub endpoint: EndpointRef,
    pub reason: String,
}

/// Client errors
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Communication error with {endpoint}: {source}")]
    Communication {
        endpoint: EndpointRef,
        #[source]
        source: TransportError,
    },

    #[error("Handshake with {endpoint} failed: {reason}")]
    Handshake { endpoint: EndpointRef, reason: String },

    #[error("Instance for {0} is closed")]
    InstanceClosed(EndpointRef),

    #[error("Not connected to any server")]
    NotConnected,

    #[error("Call to {method} timed out after {timeout:?}")]
    Timeout { method: String, timeout: Duration },

    #[error("{0}")]
    Remote(RemoteFault),

    #[error("Component error in {method}: {source}")]
    Component {
        method: String,
        #[source]
        source: RemoteFault,
    },

    #[error("Undeclared failure in {method}: {source}")]
    Unchecked {
        method: String,
        #[source]
        source: RemoteFault,
    },

    #[error("{}", exhausted_message(.attempts))]
    Exhausted { attempts: Vec<FailedAttempt> },

    #[error("Connection is closed")]
    ConnectionClosed,

    #[error("Failed to encode call to {method}: {source}")]
    Encoding {
        method: String,
        #[source]
        source: TransportError,
    },

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

fn exhausted_message(attempts: &[FailedAttempt]) -> String {
    if attempts.is_empty() {
        return "No server endpoints to connect to".to_string();
    }
    let detail = attempts
        .iter()
        .map(|a| format!("{} ({})", a.endpoint, a.reason))
        .collect::<Vec<_>>()
        .join(", ");
    format!("Unable to connect to any of the servers: {}", detail)
}

impl ClientError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ClientError::Communication { .. }
            | ClientError::Handshake { .. }
            | ClientError::InstanceClosed(_)
            | ClientError::NotConnected => ErrorKind::Transport,
            ClientError::Timeout { .. } => ErrorKind::Timeout,
            ClientError::Exhausted { .. } => ErrorKind::Exhaustion,
            ClientError::Remote(_)
            | ClientError::Component { .. }
            | ClientError::Unchecked { .. }
            | ClientError::ConnectionClosed
            | ClientError::Encoding { .. }
            | ClientError::Protocol(_) => ErrorKind::Application,
        }
    }

    /// Whether this error should trigger endpoint abandonment or failover
    pub fn is_connection_class(&self) -> bool {
        self.kind() == ErrorKind::Transport
    }

    /// The server fault behind this error, if any
    pub fn remote_fault(&self) -> Option<&RemoteFault> {
        match self {
            ClientError::Remote(fault)
            | ClientError::Component { source: fault, .. }
            | ClientError::Unchecked { source: fault, .. } => Some(fault),
            _ => None,
        }
    }
}
