//! Client configuration

use hopwire_proto::properties::{AUTO_FAILOVER, FAILOVER_PING_INTERVAL};
use hopwire_proto::Properties;
use hopwire_transport::config::duration_ms;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default number of read attempts while waiting for a server handshake
pub const HANDSHAKE_RETRIES: u32 = 3;

/// Per-instance configuration, shared by every instance an
/// [`crate::InstanceFactory`] creates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstanceConfig {
    /// Timed-out handshake reads tolerated before giving up on an endpoint
    pub handshake_retries: u32,
    /// Pause between timed-out handshake reads
    #[serde(with = "duration_ms")]
    pub handshake_retry_delay: Duration,
    /// Deadline for each remote call's response
    #[serde(with = "duration_ms")]
    pub call_timeout: Duration,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            handshake_retries: HANDSHAKE_RETRIES,
            handshake_retry_delay: Duration::from_millis(100),
            call_timeout: Duration::from_secs(30),
        }
    }
}

/// Per-connection configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Transparently reconnect and retry once on connection-class failures
    pub failover: bool,
    /// Background liveness ping period while failover is enabled
    #[serde(with = "duration_ms")]
    pub ping_interval: Duration,
    /// Send a best-effort logoff when the connection is closed
    pub logoff_on_close: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            failover: false,
            ping_interval: Duration::from_secs(1),
            logoff_on_close: true,
        }
    }
}

impl ConnectionConfig {
    /// Override settings from connection properties
    ///
    /// Recognizes `autoFailover` and `failOverPingInterval` (milliseconds).
    /// Unparseable values are ignored.
    pub fn with_properties(mut self, properties: &Properties) -> Self {
        if let Some(failover) = properties.get_bool(AUTO_FAILOVER) {
            self.failover = failover;
        }
        if let Some(millis) = properties.get_u64(FAILOVER_PING_INTERVAL) {
            self.ping_interval = Duration::from_millis(millis);
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ConnectionConfig::default();
        assert!(!config.failover);
        assert!(config.logoff_on_close);
        assert_eq!(InstanceConfig::default().handshake_retries, HANDSHAKE_RETRIES);
    }

    #[test]
    fn test_with_properties() {
        let props = Properties::new()
            .with(AUTO_FAILOVER, "true")
            .with(FAILOVER_PING_INTERVAL, "250");
        let config = ConnectionConfig::default().with_properties(&props);
        assert!(config.failover);
        assert_eq!(config.ping_interval, Duration::from_millis(250));

        let ignored = ConnectionConfig::default()
            .with_properties(&Properties::new().with(AUTO_FAILOVER, "maybe"));
        assert!(!ignored.failover);
    }

    #[test]
    fn test_deserialize_partial() {
        let config: InstanceConfig =
            serde_json::from_str(r#"{"call_timeout": 1500, "handshake_retries": 5}"#).unwrap();
        assert_eq!(config.call_timeout, Duration::from_millis(1500));
        assert_eq!(config.handshake_retries, 5);
        assert_eq!(config.handshake_retry_delay, Duration::from_millis(100));
    }
}
