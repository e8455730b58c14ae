//! Channel configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for [`crate::TcpChannelFactory`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TcpChannelConfig {
    /// Deadline for establishing the TCP connection
    #[serde(with = "duration_ms")]
    pub connect_timeout: Duration,
    /// Deadline for each `Channel::read`
    #[serde(with = "duration_ms")]
    pub read_timeout: Duration,
    /// Disable Nagle's algorithm
    pub nodelay: bool,
}

impl Default for TcpChannelConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(1),
            nodelay: true,
        }
    }
}

/// Helper module for serializing Duration as milliseconds
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
