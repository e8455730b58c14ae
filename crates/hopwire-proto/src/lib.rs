//! Hopwire Protocol Definitions
//!
//! This crate defines the wire types shared by the client transport and the
//! simulated servers used in tests: endpoint addressing, the handshake payload,
//! the invocation envelope and its argument model, and the length-prefixed codec.

pub mod auth;
pub mod codec;
pub mod endpoint;
pub mod messages;
pub mod properties;
pub mod value;

pub use codec::{CodecError, WireCodec};
pub use endpoint::{ConnectionUrl, EndpointRef, DEFAULT_PORT, URL_SCHEME};
pub use messages::*;
pub use auth::LogonResult;
pub use properties::Properties;
pub use value::Value;

use thiserror::Error;

/// Protocol version
pub const PROTOCOL_VERSION: u32 = 1;

/// Marker every compatible server puts in its handshake
pub const VERSION_MARKER: &str = "HOPWIRE";

/// Maximum frame size (16MB)
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Protocol-level errors that are independent of any transport
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Invalid connection URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Incompatible handshake: {0}")]
    IncompatibleHandshake(String),

    #[error("Unexpected value type: expected {expected}, found {found}")]
    ValueType {
        expected: &'static str,
        found: &'static str,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),
}
