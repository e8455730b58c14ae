//! Server discovery
//!
//! Turns a connection URL into the ordered list of endpoints a
//! [`crate::Connection`] tries. Order is always the URL order.

use hopwire_proto::{ConnectionUrl, EndpointRef, ProtocolError};
use std::fmt::Debug;

/// Source of candidate endpoints
///
/// The advisory hooks let an external registry track endpoint health; the
/// connection never relies on them for its own retry decisions.
pub trait ServerDiscovery: Send + Sync + Debug {
    /// Candidates in trial order
    fn known_hosts(&self) -> Vec<EndpointRef>;

    /// A logon on `endpoint` succeeded
    fn connection_successful(&self, _endpoint: &EndpointRef) {}

    /// `endpoint` failed with a connection-class error
    fn mark_bad(&self, _endpoint: &EndpointRef) {}
}

/// Discovery backed by a static connection URL
#[derive(Debug, Clone)]
pub struct UrlDiscovery {
    url: ConnectionUrl,
}

impl UrlDiscovery {
    pub fn new(url: ConnectionUrl) -> Self {
        Self { url }
    }

    pub fn from_url(url: &str) -> Result<Self, ProtocolError> {
        Ok(Self::new(ConnectionUrl::parse(url)?))
    }

    /// Parse `url` into its endpoints, preserving order
    pub fn resolve(url: &str) -> Result<Vec<EndpointRef>, ProtocolError> {
        Ok(ConnectionUrl::parse(url)?.endpoints().to_vec())
    }

    pub fn url(&self) -> &ConnectionUrl {
        &self.url
    }
}

impl ServerDiscovery for UrlDiscovery {
    fn known_hosts(&self) -> Vec<EndpointRef> {
        self.url.endpoints().to_vec()
    }
}
