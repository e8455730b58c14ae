//! Hopwire client transport
//!
//! Resilient client side of the hopwire RPC protocol:
//!
//! - [`ServerInstance`]: one handshaken connection to one endpoint
//! - [`InstanceFactory`]: pools instances by endpoint and reports session lifecycle
//! - [`ServerDiscovery`] / [`UrlDiscovery`]: candidate endpoints in trial order
//! - [`Connection`]: the long-lived handle callers hold, with transparent failover
//!
//! # Example
//!
//! ```ignore
//! use hopwire_client::{Connection, ConnectionConfig, InstanceConfig, InstanceFactory};
//! use hopwire_proto::{properties, Properties};
//! use hopwire_transport::TcpChannelFactory;
//! use std::sync::Arc;
//!
//! let factory = Arc::new(InstanceFactory::new(
//!     Arc::new(TcpChannelFactory::default()),
//!     InstanceConfig::default(),
//! ));
//! let mut props = Properties::new()
//!     .with(properties::USER, "alice")
//!     .with(properties::AUTO_FAILOVER, "true");
//! let connection = Connection::connect(
//!     "hopwire://db1:31000,db2:31000",
//!     &mut props,
//!     factory,
//!     ConnectionConfig::default(),
//! )
//! .await?;
//! ```

pub mod auth;
pub mod config;
pub mod connection;
pub mod discovery;
pub mod error;
pub mod factory;
pub mod instance;
pub mod pending;
pub mod service;

pub use auth::AuthService;
pub use config::{ConnectionConfig, InstanceConfig, HANDSHAKE_RETRIES};
pub use connection::Connection;
pub use discovery::{ServerDiscovery, UrlDiscovery};
pub use error::{BoxError, ClientError, ErrorKind, FailedAttempt};
pub use factory::{InstanceFactory, LifecycleListener};
pub use instance::ServerInstance;
pub use service::{translate_fault, Invoker, MethodDescriptor, RemoteService, ServiceClient};
