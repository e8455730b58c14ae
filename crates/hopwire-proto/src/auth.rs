//! Well-known authentication service
//!
//! Every server exposes this interface. The client transport uses it for
//! logon, re-authentication, liveness pings and logoff.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Interface name carried in [`crate::InvocationEnvelope::target_interface`]
pub const AUTH_SERVICE: &str = "AuthService";

/// `logon(Properties) -> LogonResult`
pub const LOGON: &str = "logon";
/// `authenticateAgain(Properties) -> LogonResult`
pub const AUTHENTICATE_AGAIN: &str = "authenticateAgain";
/// `ping() -> ()`
pub const PING: &str = "ping";
/// `logoff() -> ()`
pub const LOGOFF: &str = "logoff";

/// Fault type raised by the server for rejected credentials
pub const LOGON_FAULT: &str = "LogonException";

/// Session established by a successful logon
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogonResult {
    pub session_id: String,
    pub user_name: String,
    pub cluster_name: Option<String>,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl LogonResult {
    pub fn new(session_id: impl Into<String>, user_name: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            user_name: user_name.into(),
            cluster_name: None,
            properties: BTreeMap::new(),
        }
    }
}
