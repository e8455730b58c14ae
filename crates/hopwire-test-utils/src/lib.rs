//! In-process simulated hopwire servers
//!
//! [`MemoryCluster`] is a [`ChannelFactory`] whose endpoints are served by
//! tasks in the same process. Each opened channel is a
//! [`FramedChannel`] over [`tokio::io::duplex`], so client code exercises the
//! real wire codec. Servers can be killed, revived and told to misbehave.
//!
//! Every simulated server implements the authentication service plus a small
//! `Echo` interface:
//!
//! | method | behaviour |
//! |---|---|
//! | `Echo.echo(x)` | returns `x` |
//! | `Echo.whoami()` | returns the server's `host:port` |
//! | `Echo.fail(msg)` | application fault of type [`ECHO_FAULT`] |
//! | `Echo.crash()` | system fault |

use async_trait::async_trait;
use dashmap::DashMap;
use hopwire_proto::auth::{
    AUTHENTICATE_AGAIN, AUTH_SERVICE, LOGOFF, LOGON, LOGON_FAULT, PING,
};
use hopwire_proto::properties::USER;
use hopwire_proto::{
    AuthType, EndpointRef, FaultKind, HandshakeMessage, InvocationEnvelope, LogonResult,
    Properties, RemoteFault, Reply, Value, WireMessage,
};
use hopwire_transport::{Channel, ChannelFactory, FramedChannel, TransportError, TransportResult};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::DuplexStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Interface name of the simulated echo service
pub const ECHO_INTERFACE: &str = "Echo";
/// Fault type raised by `Echo.fail`
pub const ECHO_FAULT: &str = "EchoException";
/// Logon with this user name is rejected with [`LOGON_FAULT`]
pub const REJECTED_USER: &str = "rejected";
/// Cluster name reported in every [`LogonResult`]
pub const CLUSTER_NAME: &str = "memory";

const PIPE_CAPACITY: usize = 64 * 1024;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug)]
struct NodeState {
    endpoint: EndpointRef,
    handshake: HandshakeMessage,
    up: AtomicBool,
    silent: AtomicBool,
    unresponsive: AtomicBool,
    drop_next: AtomicUsize,
    connections: AtomicUsize,
    requests: DashMap<String, usize>,
    last_logon: Mutex<Option<Properties>>,
    shutdown: Mutex<CancellationToken>,
}

impl NodeState {
    fn new(endpoint: EndpointRef, handshake: HandshakeMessage) -> Self {
        Self {
            endpoint,
            handshake,
            up: AtomicBool::new(true),
            silent: AtomicBool::new(false),
            unresponsive: AtomicBool::new(false),
            drop_next: AtomicUsize::new(0),
            connections: AtomicUsize::new(0),
            requests: DashMap::new(),
            last_logon: Mutex::new(None),
            shutdown: Mutex::new(CancellationToken::new()),
        }
    }

    /// Cut every live connection; later connections get a fresh token
    fn disconnect_all(&self) {
        let mut token = lock(&self.shutdown);
        token.cancel();
        *token = CancellationToken::new();
    }

    fn take_drop(&self) -> bool {
        self.drop_next
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }

    fn record(&self, envelope: &InvocationEnvelope) {
        let key = format!("{}.{}", envelope.target_interface, envelope.method_name);
        *self.requests.entry(key).or_insert(0) += 1;
    }

    fn dispatch(&self, envelope: &InvocationEnvelope) -> Reply {
        let args = &envelope.args;
        match (
            envelope.target_interface.as_str(),
            envelope.method_name.as_str(),
        ) {
            (AUTH_SERVICE, LOGON) | (AUTH_SERVICE, AUTHENTICATE_AGAIN) => self.logon(args),
            (AUTH_SERVICE, PING) | (AUTH_SERVICE, LOGOFF) => Reply::Ok(Value::Null),
            (ECHO_INTERFACE, "echo") => Reply::Ok(args.first().cloned().unwrap_or_default()),
            (ECHO_INTERFACE, "whoami") => Reply::Ok(Value::Str(self.endpoint.to_string())),
            (ECHO_INTERFACE, "fail") => {
                let message = args
                    .first()
                    .and_then(|v| v.as_str().ok())
                    .unwrap_or("requested failure");
                Reply::Fault(RemoteFault::application(ECHO_FAULT, message))
            }
            (ECHO_INTERFACE, "crash") => Reply::Fault(RemoteFault::new(
                FaultKind::System,
                "ServerCrash",
                "simulated crash",
            )),
            (interface, method) => Reply::Fault(RemoteFault::new(
                FaultKind::System,
                "NoSuchMethod",
                format!("{}.{} is not implemented", interface, method),
            )),
        }
    }

    fn logon(&self, args: &[Value]) -> Reply {
        let properties = match args.first().map(Value::decode::<Properties>) {
            Some(Ok(properties)) => properties,
            Some(Err(e)) => return system_fault(e),
            None => return system_fault("missing logon properties"),
        };

        let user = properties.get(USER).unwrap_or("anonymous").to_string();
        *lock(&self.last_logon) = Some(properties);

        if user == REJECTED_USER {
            return Reply::Fault(RemoteFault::application(
                LOGON_FAULT,
                format!("invalid credentials for {}", user),
            ));
        }

        let mut result = LogonResult::new(uuid::Uuid::new_v4().to_string(), user);
        result.cluster_name = Some(CLUSTER_NAME.to_string());
        match Value::object(&result) {
            Ok(value) => Reply::Ok(value),
            Err(e) => system_fault(e),
        }
    }
}

fn system_fault(reason: impl ToString) -> Reply {
    Reply::Fault(RemoteFault::new(
        FaultKind::System,
        "ServerError",
        reason.to_string(),
    ))
}

/// A set of simulated servers addressable by [`EndpointRef`]
#[derive(Debug, Clone)]
pub struct MemoryCluster {
    nodes: Arc<DashMap<EndpointRef, Arc<NodeState>>>,
    read_timeout: Duration,
}

impl Default for MemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self {
            nodes: Arc::new(DashMap::new()),
            read_timeout: Duration::from_millis(100),
        }
    }

    /// Client-side read timeout of opened channels
    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    /// Start a server that sends a standard handshake
    pub fn add_server(&self, host: &str, port: u16) -> EndpointRef {
        self.add_server_with_handshake(
            host,
            port,
            HandshakeMessage::new(AuthType::UserPassword, "memory-1.0"),
        )
    }

    pub fn add_server_with_handshake(
        &self,
        host: &str,
        port: u16,
        handshake: HandshakeMessage,
    ) -> EndpointRef {
        let endpoint = EndpointRef::new(host, port);
        self.nodes.insert(
            endpoint.clone(),
            Arc::new(NodeState::new(endpoint.clone(), handshake)),
        );
        endpoint
    }

    /// Comma-separated `host:port` list for a connection URL
    pub fn url(&self, endpoints: &[EndpointRef]) -> String {
        let hosts: Vec<String> = endpoints.iter().map(ToString::to_string).collect();
        format!("hopwire://{}", hosts.join(","))
    }

    fn node(&self, endpoint: &EndpointRef) -> Option<Arc<NodeState>> {
        self.nodes.get(endpoint).map(|node| node.clone())
    }

    /// Refuse new connections and cut live ones
    pub fn kill(&self, endpoint: &EndpointRef) {
        if let Some(node) = self.node(endpoint) {
            debug!("Killing simulated server {}", endpoint);
            node.up.store(false, Ordering::Release);
            node.disconnect_all();
        }
    }

    /// Accept connections again after [`MemoryCluster::kill`]
    pub fn revive(&self, endpoint: &EndpointRef) {
        if let Some(node) = self.node(endpoint) {
            node.up.store(true, Ordering::Release);
        }
    }

    /// Cut live connections but keep accepting new ones
    pub fn disconnect_all(&self, endpoint: &EndpointRef) {
        if let Some(node) = self.node(endpoint) {
            node.disconnect_all();
        }
    }

    /// Drop the connection instead of answering the next `count` requests
    pub fn drop_next_requests(&self, endpoint: &EndpointRef, count: usize) {
        if let Some(node) = self.node(endpoint) {
            node.drop_next.store(count, Ordering::Release);
        }
    }

    /// Read requests but never answer them
    pub fn set_unresponsive(&self, endpoint: &EndpointRef, unresponsive: bool) {
        if let Some(node) = self.node(endpoint) {
            node.unresponsive.store(unresponsive, Ordering::Release);
        }
    }

    /// Accept connections but never send a handshake
    pub fn set_silent(&self, endpoint: &EndpointRef, silent: bool) {
        if let Some(node) = self.node(endpoint) {
            node.silent.store(silent, Ordering::Release);
        }
    }

    /// Channels opened to `endpoint` so far
    pub fn connection_count(&self, endpoint: &EndpointRef) -> usize {
        self.node(endpoint)
            .map_or(0, |node| node.connections.load(Ordering::Acquire))
    }

    /// Requests received by `endpoint` for `interface.method`
    pub fn request_count(&self, endpoint: &EndpointRef, interface: &str, method: &str) -> usize {
        let key = format!("{}.{}", interface, method);
        self.node(endpoint)
            .and_then(|node| node.requests.get(&key).map(|count| *count))
            .unwrap_or(0)
    }

    /// Properties sent with the most recent logon on `endpoint`
    pub fn last_logon_properties(&self, endpoint: &EndpointRef) -> Option<Properties> {
        self.node(endpoint)
            .and_then(|node| lock(&node.last_logon).clone())
    }
}

#[async_trait]
impl ChannelFactory for MemoryCluster {
    async fn open(&self, endpoint: &EndpointRef) -> TransportResult<Arc<dyn Channel>> {
        let node = self
            .node(endpoint)
            .filter(|node| node.up.load(Ordering::Acquire))
            .ok_or_else(|| {
                TransportError::ConnectionError(format!("Connection refused: {}", endpoint))
            })?;

        node.connections.fetch_add(1, Ordering::AcqRel);
        let shutdown = lock(&node.shutdown).clone();
        let (client, server) = tokio::io::duplex(PIPE_CAPACITY);
        tokio::spawn(serve(node, FramedChannel::new(server, None), shutdown));

        Ok(Arc::new(FramedChannel::new(
            client,
            Some(self.read_timeout),
        )))
    }
}

async fn serve(
    node: Arc<NodeState>,
    channel: FramedChannel<DuplexStream>,
    shutdown: CancellationToken,
) {
    if !node.silent.load(Ordering::Acquire)
        && channel
            .write(WireMessage::Handshake(node.handshake.clone()))
            .await
            .is_err()
    {
        return;
    }

    loop {
        let message = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            message = channel.read() => message,
        };

        let (request_id, envelope) = match message {
            Ok(WireMessage::Request {
                request_id,
                envelope,
            }) => (request_id, envelope),
            Ok(_) => continue,
            Err(_) => break,
        };

        node.record(&envelope);
        if node.take_drop() {
            debug!(
                "{} dropping connection on {}.{}",
                node.endpoint, envelope.target_interface, envelope.method_name
            );
            break;
        }
        if node.unresponsive.load(Ordering::Acquire) {
            continue;
        }

        let reply = node.dispatch(&envelope);
        if channel
            .write(WireMessage::Response { request_id, reply })
            .await
            .is_err()
        {
            break;
        }
    }

    channel.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_handshake_then_echo() {
        let cluster = MemoryCluster::new();
        let endpoint = cluster.add_server("a", 1);

        let channel = cluster.open(&endpoint).await.unwrap();
        assert!(matches!(
            channel.read().await.unwrap(),
            WireMessage::Handshake(_)
        ));

        channel
            .write(WireMessage::Request {
                request_id: 9,
                envelope: InvocationEnvelope::new(ECHO_INTERFACE, "echo", vec![Value::Int(4)]),
            })
            .await
            .unwrap();
        assert_eq!(
            channel.read().await.unwrap(),
            WireMessage::Response {
                request_id: 9,
                reply: Reply::Ok(Value::Int(4)),
            }
        );
        assert_eq!(cluster.request_count(&endpoint, ECHO_INTERFACE, "echo"), 1);
    }

    #[tokio::test]
    async fn test_killed_server_refuses_and_disconnects() {
        let cluster = MemoryCluster::new();
        let endpoint = cluster.add_server("a", 1);

        let channel = cluster.open(&endpoint).await.unwrap();
        let _ = channel.read().await.unwrap();
        cluster.kill(&endpoint);

        loop {
            match channel.read().await {
                Err(TransportError::Timeout) => continue,
                Err(_) => break,
                Ok(other) => panic!("Unexpected message {:?}", other),
            }
        }
        assert!(cluster.open(&endpoint).await.is_err());

        cluster.revive(&endpoint);
        assert!(cluster.open(&endpoint).await.is_ok());
        assert_eq!(cluster.connection_count(&endpoint), 2);
    }
}
