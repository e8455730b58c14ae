//! Remote service invocation
//!
//! Remote interfaces are plain Rust structs wrapping a [`ServiceClient`].
//! Each method packages its arguments into an
//! [`InvocationEnvelope`](hopwire_proto::InvocationEnvelope) through an
//! [`Invoker`], which is either a single [`crate::ServerInstance`] or a
//! [`crate::Connection`] that adds failover on top.
//!
//! ```ignore
//! #[derive(Clone)]
//! pub struct EchoService {
//!     client: ServiceClient,
//! }
//!
//! static ECHO: MethodDescriptor = MethodDescriptor::new("Echo", "echo", &[]);
//!
//! impl RemoteService for EchoService {
//!     const INTERFACE: &'static str = "Echo";
//!
//!     fn bind(client: ServiceClient) -> Self {
//!         Self { client }
//!     }
//! }
//!
//! impl EchoService {
//!     pub async fn echo(&self, text: &str) -> Result<String, ClientError> {
//!         Ok(self.client.call(&ECHO, vec![text.into()]).await?.into_string()?)
//!     }
//! }
//! ```

use crate::error::ClientError;
use async_trait::async_trait;
use hopwire_proto::{FaultKind, RemoteFault, Value, COMPONENT_FAULT};
use serde::de::DeserializeOwned;
use std::fmt;
use std::sync::Arc;

/// Static description of one remote method
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodDescriptor {
    pub interface: &'static str,
    pub name: &'static str,
    /// Fault type names the method declares
    pub faults: &'static [&'static str],
}

impl MethodDescriptor {
    pub const fn new(
        interface: &'static str,
        name: &'static str,
        faults: &'static [&'static str],
    ) -> Self {
        Self {
            interface,
            name,
            faults,
        }
    }

    pub fn declares(&self, fault_type: &str) -> bool {
        self.faults.iter().any(|declared| *declared == fault_type)
    }
}

impl fmt::Display for MethodDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.interface, self.name)
    }
}

/// Executes remote calls
#[async_trait]
pub trait Invoker: Send + Sync {
    async fn invoke(
        &self,
        method: &MethodDescriptor,
        args: Vec<Value>,
    ) -> Result<Value, ClientError>;
}

/// A typed client stub for one remote interface
pub trait RemoteService: Clone + Send + Sync + 'static {
    /// Interface name used in the envelope
    const INTERFACE: &'static str;

    fn bind(client: ServiceClient) -> Self;
}

/// Untyped dispatcher shared by typed stubs
#[derive(Clone)]
pub struct ServiceClient {
    interface: &'static str,
    invoker: Arc<dyn Invoker>,
}

impl ServiceClient {
    pub fn new(interface: &'static str, invoker: Arc<dyn Invoker>) -> Self {
        Self { interface, invoker }
    }

    pub fn interface(&self) -> &'static str {
        self.interface
    }

    /// Invoke `method` and return the raw result value
    pub async fn call(
        &self,
        method: &MethodDescriptor,
        args: Vec<Value>,
    ) -> Result<Value, ClientError> {
        debug_assert_eq!(method.interface, self.interface);
        self.invoker.invoke(method, args).await
    }

    /// Invoke `method` and decode an object result
    pub async fn call_decode<T: DeserializeOwned>(
        &self,
        method: &MethodDescriptor,
        args: Vec<Value>,
    ) -> Result<T, ClientError> {
        Ok(self.call(method, args).await?.decode()?)
    }
}

impl fmt::Debug for ServiceClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceClient")
            .field("interface", &self.interface)
            .finish()
    }
}

/// Map a server fault onto the error surface `method` declares
///
/// - a declared fault type is returned as-is
/// - a bare timeout or system failure becomes [`ClientError::Component`]
///   when the method declares [`COMPONENT_FAULT`]
/// - anything else becomes [`ClientError::Unchecked`] with the fault as cause
pub fn translate_fault(fault: RemoteFault, method: &MethodDescriptor) -> ClientError {
    if method.declares(&fault.type_name) {
        return ClientError::Remote(fault);
    }

    let bare_failure = matches!(fault.kind, FaultKind::Timeout | FaultKind::System);
    if bare_failure && method.declares(COMPONENT_FAULT) {
        return ClientError::Component {
            method: method.to_string(),
            source: fault,
        };
    }

    ClientError::Unchecked {
        method: method.to_string(),
        source: fault,
    }
}
