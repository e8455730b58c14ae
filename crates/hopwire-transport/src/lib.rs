//! Channel abstraction for hopwire connections
//!
//! A [`Channel`] moves whole [`WireMessage`]s over one socket. Writes may be
//! issued concurrently and are serialized internally so frames never
//! interleave; reads are performed by a single dedicated reader.
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │      ServerInstance (hopwire-client)        │
//! └─────────────────────────────────────────────┘
//!                      │ Channel / ChannelFactory
//!                      ↓
//! ┌──────────────────────┬──────────────────────┐
//! │ FramedChannel<Tcp>   │ FramedChannel<Duplex>│
//! │ (TcpChannelFactory)  │ (test utilities)     │
//! └──────────────────────┴──────────────────────┘
//! ```

pub mod config;
pub mod framed;
pub mod tcp;

pub use config::TcpChannelConfig;
pub use framed::FramedChannel;
pub use tcp::TcpChannelFactory;

use async_trait::async_trait;
use hopwire_proto::{CodecError, EndpointRef, WireMessage};
use std::fmt::Debug;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;

/// Transport-level errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Timeout")]
    Timeout,

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Codec error: {0}")]
    CodecError(#[from] CodecError),
}

impl TransportError {
    /// No message arrived within the read deadline; the channel is still usable
    pub fn is_timeout(&self) -> bool {
        matches!(self, TransportError::Timeout)
    }
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Message transport over one socket
#[async_trait]
pub trait Channel: Send + Sync + Debug {
    /// Serialize and send a message, completing once it is flushed
    async fn write(&self, message: WireMessage) -> TransportResult<()>;

    /// Receive the next message
    ///
    /// Fails with [`TransportError::Timeout`] if nothing arrives within the
    /// configured read timeout, and with [`TransportError::ConnectionClosed`]
    /// once the channel is closed locally or by the peer. Must not be called
    /// concurrently.
    async fn read(&self) -> TransportResult<WireMessage>;

    /// Cheap local state check
    fn is_open(&self) -> bool;

    /// Close the channel, interrupting any in-flight read. Idempotent.
    async fn close(&self);

    /// Peer address, when the underlying stream has one
    fn remote_address(&self) -> Option<SocketAddr>;

    /// Local socket address, when the underlying stream has one
    fn local_address(&self) -> Option<SocketAddr>;
}

/// Opens channels to endpoints
#[async_trait]
pub trait ChannelFactory: Send + Sync + Debug {
    async fn open(&self, endpoint: &EndpointRef) -> TransportResult<Arc<dyn Channel>>;
}
