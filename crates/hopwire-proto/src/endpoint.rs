//! Endpoint addressing and connection URL parsing
//!
//! A connection URL names one logical server reachable through one or more
//! physical endpoints:
//!
//! - `hopwire://db1.example.com:31000`
//! - `hopwire://db1:31000,db2:31000,db3:31001`
//! - `hopwire://[::1]:31000,10.0.0.7/path?user=admin`
//! - `db1:31000,db2:31000` (scheme is optional)
//!
//! Endpoint order in the URL is the trial order.

use crate::ProtocolError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// URL scheme accepted by [`ConnectionUrl::parse`]
pub const URL_SCHEME: &str = "hopwire";

/// Port used when an endpoint in the URL omits one
pub const DEFAULT_PORT: u16 = 31000;

/// One physical server process
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EndpointRef {
    host: String,
    port: u16,
}

impl EndpointRef {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// `host:port` form suitable for `tokio::net::lookup_host`
    pub fn authority(&self) -> String {
        self.to_string()
    }

    /// Parse a single `host[:port]` entry
    fn parse_entry(entry: &str, url: &str) -> Result<Self, ProtocolError> {
        let invalid = |reason: String| ProtocolError::InvalidUrl {
            url: url.to_string(),
            reason,
        };

        // Bracketed IPv6 literal, e.g. [::1]:31000
        if let Some(rest) = entry.strip_prefix('[') {
            let close = rest
                .find(']')
                .ok_or_else(|| invalid(format!("unterminated IPv6 literal in '{}'", entry)))?;
            let host = &rest[..close];
            if host.is_empty() {
                return Err(invalid(format!("empty host in '{}'", entry)));
            }
            let port = match &rest[close + 1..] {
                "" => DEFAULT_PORT,
                tail => {
                    let port_str = tail
                        .strip_prefix(':')
                        .ok_or_else(|| invalid(format!("unexpected '{}' after host", tail)))?;
                    parse_port(port_str).map_err(invalid)?
                }
            };
            return Ok(Self::new(host, port));
        }

        let (host, port) = match entry.rfind(':') {
            Some(colon_pos) => {
                let host = &entry[..colon_pos];
                if host.contains(':') {
                    return Err(invalid(format!(
                        "IPv6 address '{}' must be written in brackets",
                        entry
                    )));
                }
                (host, parse_port(&entry[colon_pos + 1..]).map_err(invalid)?)
            }
            None => (entry, DEFAULT_PORT),
        };

        if host.is_empty() {
            return Err(invalid(format!("empty host in '{}'", entry)));
        }

        Ok(Self::new(host, port))
    }
}

fn parse_port(port_str: &str) -> Result<u16, String> {
    match port_str.parse::<u16>() {
        Ok(0) | Err(_) => Err(format!("invalid port '{}'", port_str)),
        Ok(port) => Ok(port),
    }
}

impl fmt::Display for EndpointRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Parsed connection URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionUrl {
    endpoints: Vec<EndpointRef>,
    path: Option<String>,
    properties: Vec<(String, String)>,
}

impl ConnectionUrl {
    /// Parse a connection URL, preserving endpoint order
    pub fn parse(url: &str) -> Result<Self, ProtocolError> {
        let invalid = |reason: &str| ProtocolError::InvalidUrl {
            url: url.to_string(),
            reason: reason.to_string(),
        };

        let trimmed = url.trim();
        let rest = match trimmed.split_once("://") {
            Some((scheme, rest)) if scheme.eq_ignore_ascii_case(URL_SCHEME) => rest,
            Some((scheme, _)) => {
                return Err(invalid(&format!("unsupported scheme '{}'", scheme)));
            }
            None => trimmed,
        };

        let (rest, query) = match rest.split_once('?') {
            Some((rest, query)) => (rest, Some(query)),
            None => (rest, None),
        };

        let (hosts, path) = match rest.find('/') {
            Some(slash) => {
                let path = rest[slash + 1..].trim_matches('/');
                (
                    &rest[..slash],
                    (!path.is_empty()).then(|| path.to_string()),
                )
            }
            None => (rest, None),
        };

        let endpoints = hosts
            .split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(|entry| EndpointRef::parse_entry(entry, url))
            .collect::<Result<Vec<_>, _>>()?;

        if endpoints.is_empty() {
            return Err(invalid("no host:port entries"));
        }

        let properties = query
            .map(|query| {
                query
                    .split('&')
                    .filter(|pair| !pair.is_empty())
                    .map(|pair| match pair.split_once('=') {
                        Some((k, v)) => (k.to_string(), v.to_string()),
                        None => (pair.to_string(), String::new()),
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            endpoints,
            path,
            properties,
        })
    }

    /// Endpoints in trial order
    pub fn endpoints(&self) -> &[EndpointRef] {
        &self.endpoints
    }

    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    /// `key=value` pairs from the query string, in URL order
    pub fn properties(&self) -> &[(String, String)] {
        &self.properties
    }
}

impl std::str::FromStr for ConnectionUrl {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
