//! Protocol message types

use crate::value::Value;
use crate::{ProtocolError, PROTOCOL_VERSION, VERSION_MARKER};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Fault type every service may declare for internal server errors
pub const COMPONENT_FAULT: &str = "ComponentError";

/// Top-level frame payload
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum WireMessage {
    /// First message on every channel, server to client
    Handshake(HandshakeMessage),
    /// Client to server method call
    Request {
        request_id: u64,
        envelope: InvocationEnvelope,
    },
    /// Server to client result for a `Request`
    Response { request_id: u64, reply: Reply },
}

/// Authentication mechanism negotiated by the server
///
/// Variant order is part of the wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuthType {
    UserPassword,
    Token,
    Kerberos,
}

impl fmt::Display for AuthType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthType::UserPassword => write!(f, "user-password"),
            AuthType::Token => write!(f, "token"),
            AuthType::Kerberos => write!(f, "kerberos"),
        }
    }
}

/// Server greeting sent before any other traffic on a channel
///
/// Field order is part of the wire format.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HandshakeMessage {
    pub protocol_version: u32,
    pub version_marker: String,
    pub auth_type: AuthType,
    pub server_version: String,
    pub cryption_parameters: Option<Vec<u8>>,
}

impl HandshakeMessage {
    /// A handshake for the protocol version this crate speaks
    pub fn new(auth_type: AuthType, server_version: impl Into<String>) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            version_marker: VERSION_MARKER.to_string(),
            auth_type,
            server_version: server_version.into(),
            cryption_parameters: None,
        }
    }

    /// Reject servers that speak a different protocol
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.version_marker != VERSION_MARKER {
            return Err(ProtocolError::IncompatibleHandshake(format!(
                "unknown version marker '{}'",
                self.version_marker
            )));
        }
        if self.protocol_version != PROTOCOL_VERSION {
            return Err(ProtocolError::IncompatibleHandshake(format!(
                "server speaks protocol {}, client speaks {}",
                self.protocol_version, PROTOCOL_VERSION
            )));
        }
        Ok(())
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        Ok(bincode::deserialize(payload)?)
    }
}

/// One remote method call
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InvocationEnvelope {
    pub target_interface: String,
    pub method_name: String,
    pub args: Vec<Value>,
}

impl InvocationEnvelope {
    pub fn new(
        target_interface: impl Into<String>,
        method_name: impl Into<String>,
        args: Vec<Value>,
    ) -> Self {
        Self {
            target_interface: target_interface.into(),
            method_name: method_name.into(),
            args,
        }
    }
}

/// Outcome of a remote call
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Reply {
    Ok(Value),
    Fault(RemoteFault),
}

/// Broad classification of a server-side failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FaultKind {
    /// Business error declared by the invoked method
    Application,
    /// Internal server component error
    Component,
    /// Server gave up waiting on a dependency
    Timeout,
    /// Unexpected server failure
    System,
}

/// Failure reported by the server for one call
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RemoteFault {
    pub kind: FaultKind,
    pub type_name: String,
    pub message: String,
}

impl RemoteFault {
    pub fn new(kind: FaultKind, type_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            type_name: type_name.into(),
            message: message.into(),
        }
    }

    pub fn application(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(FaultKind::Application, type_name, message)
    }
}

impl fmt::Display for RemoteFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.type_name, self.message)
    }
}

impl std::error::Error for RemoteFault {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Criteria {
        table: String,
        limit: Option<u32>,
    }

    #[test]
    fn test_envelope_roundtrip_mixed_arguments() {
        let mut map = BTreeMap::new();
        map.insert("fetchSize".to_string(), Value::Int(512));

        let criteria = Criteria {
            table: "orders".into(),
            limit: Some(10),
        };
        let envelope = InvocationEnvelope::new(
            "QueryService",
            "execute",
            vec![
                Value::Int(-42),
                Value::Bool(true),
                Value::Float(2.5),
                Value::Null,
                Value::Str("select 1".into()),
                Value::Bytes(vec![0, 255, 7]),
                Value::List(vec![Value::Int(1), Value::Str("two".into())]),
                Value::Map(map),
                Value::object(&criteria).unwrap(),
            ],
        );

        let bytes = bincode::serialize(&envelope).unwrap();
        let decoded: InvocationEnvelope = bincode::deserialize(&bytes).unwrap();

        assert_eq!(decoded.target_interface, envelope.target_interface);
        assert_eq!(decoded.method_name, envelope.method_name);
        assert_eq!(decoded.args, envelope.args);
        assert_eq!(decoded.args[8].decode::<Criteria>().unwrap(), criteria);
    }

    #[test]
    fn test_envelope_roundtrip_no_arguments() {
        let envelope = InvocationEnvelope::new("AuthService", "ping", vec![]);
        let bytes = bincode::serialize(&envelope).unwrap();
        let decoded: InvocationEnvelope = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded, envelope);
    }

    /// Bytes captured from a server running protocol version 1
    const CAPTURED_HANDSHAKE: &[u8] = &[
        // protocol_version: u32 = 1
        0x01, 0x00, 0x00, 0x00,
        // version_marker: "HOPWIRE"
        0x07, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x48, 0x4F, 0x50, 0x57, 0x49, 0x52, 0x45,
        // auth_type: Kerberos
        0x02, 0x00, 0x00, 0x00,
        // server_version: "8.4.1"
        0x05, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x38, 0x2E, 0x34, 0x2E, 0x31,
        // cryption_parameters: Some([1, 2, 3])
        0x01,
        0x03, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x01, 0x02, 0x03,
    ];

    #[test]
    fn test_captured_handshake_still_decodes() {
        let handshake = HandshakeMessage::decode(CAPTURED_HANDSHAKE).unwrap();
        assert_eq!(handshake.auth_type, AuthType::Kerberos);
        assert_eq!(handshake.server_version, "8.4.1");
        assert_eq!(handshake.cryption_parameters, Some(vec![1, 2, 3]));
        assert!(handshake.validate().is_ok());
    }

    #[test]
    fn test_handshake_encoding_is_stable() {
        let mut handshake = HandshakeMessage::new(AuthType::Kerberos, "8.4.1");
        handshake.cryption_parameters = Some(vec![1, 2, 3]);
        assert_eq!(handshake.encode().unwrap(), CAPTURED_HANDSHAKE);
    }

    #[test]
    fn test_handshake_validation() {
        let mut handshake = HandshakeMessage::new(AuthType::UserPassword, "9.0");
        assert!(handshake.validate().is_ok());

        handshake.protocol_version = PROTOCOL_VERSION + 1;
        assert!(matches!(
            handshake.validate(),
            Err(ProtocolError::IncompatibleHandshake(_))
        ));

        let mut foreign = HandshakeMessage::new(AuthType::Token, "9.0");
        foreign.version_marker = "SOMETHING-ELSE".into();
        assert!(foreign.validate().is_err());
    }

    #[test]
    fn test_response_serialization() {
        let msg = WireMessage::Response {
            request_id: 9,
            reply: Reply::Fault(RemoteFault::application("LogonException", "bad password")),
        };
        let serialized = bincode::serialize(&msg).unwrap();
        let deserialized: WireMessage = bincode::deserialize(&serialized).unwrap();
        assert_eq!(msg, deserialized);
    }
}
