//! Connection properties bag

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Login user name
pub const USER: &str = "user";
/// Login password
pub const PASSWORD: &str = "password";
/// Injected during connection setup: local host name
pub const CLIENT_HOST_NAME: &str = "clientHostName";
/// Injected during connection setup: local IP address
pub const CLIENT_IP_ADDRESS: &str = "clientIpAddress";
/// `true` enables transparent failover
pub const AUTO_FAILOVER: &str = "autoFailover";
/// Background ping interval in milliseconds
pub const FAILOVER_PING_INTERVAL: &str = "failOverPingInterval";

/// String key/value properties sent with logon
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Properties(BTreeMap<String, String>);

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.0.insert(key.into(), value.into())
    }

    /// Insert only if the key is absent
    pub fn set_default(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.entry(key.into()).or_insert_with(|| value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.0.remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Parse a boolean property, `None` when absent or unparseable
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key)
            .and_then(|v| v.trim().to_ascii_lowercase().parse().ok())
    }

    /// Parse an unsigned integer property, `None` when absent or unparseable
    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.get(key).and_then(|v| v.trim().parse().ok())
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Properties {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}
