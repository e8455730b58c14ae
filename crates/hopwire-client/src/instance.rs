//! One live, handshaken connection to one endpoint

use crate::auth::AuthService;
use crate::config::InstanceConfig;
use crate::error::ClientError;
use crate::pending::PendingCalls;
use crate::service::{translate_fault, Invoker, MethodDescriptor, RemoteService, ServiceClient};
use async_trait::async_trait;
use dashmap::DashMap;
use hopwire_proto::{
    EndpointRef, HandshakeMessage, InvocationEnvelope, Reply, Value, WireMessage,
};
use hopwire_transport::{Channel, ChannelFactory, TransportError};
use std::any::{Any, TypeId};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// A physical connection to one server
///
/// Created only after the server's handshake has been received and
/// validated. Once closed, by I/O failure or explicitly, an instance is
/// never reopened.
pub struct ServerInstance {
    endpoint: EndpointRef,
    channel: Arc<dyn Channel>,
    handshake: HandshakeMessage,
    config: InstanceConfig,
    open: Arc<AtomicBool>,
    pending: PendingCalls,
    services: DashMap<TypeId, Box<dyn Any + Send + Sync>>,
    ping_lock: Mutex<()>,
    reader: JoinHandle<()>,
    this: Weak<ServerInstance>,
}

impl ServerInstance {
    /// Open a channel to `endpoint` and complete the handshake
    pub async fn connect(
        endpoint: EndpointRef,
        channels: &dyn ChannelFactory,
        config: InstanceConfig,
    ) -> Result<Arc<Self>, ClientError> {
        debug!("Opening channel to {}", endpoint);
        let channel = channels
            .open(&endpoint)
            .await
            .map_err(|source| ClientError::Communication {
                endpoint: endpoint.clone(),
                source,
            })?;

        let handshake = match await_handshake(&endpoint, channel.as_ref(), &config).await {
            Ok(handshake) => handshake,
            Err(e) => {
                channel.close().await;
                return Err(e);
            }
        };

        info!(
            "Connected to {} (server {}, auth {})",
            endpoint, handshake.server_version, handshake.auth_type
        );

        let open = Arc::new(AtomicBool::new(true));
        let pending = PendingCalls::new();
        let reader = tokio::spawn(read_loop(
            endpoint.clone(),
            channel.clone(),
            pending.clone(),
            open.clone(),
        ));

        Ok(Arc::new_cyclic(|this| Self {
            endpoint,
            channel,
            handshake,
            config,
            open,
            pending,
            services: DashMap::new(),
            ping_lock: Mutex::new(()),
            reader,
            this: this.clone(),
        }))
    }

    pub fn endpoint(&self) -> &EndpointRef {
        &self.endpoint
    }

    /// The validated server handshake
    pub fn handshake(&self) -> &HandshakeMessage {
        &self.handshake
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub fn local_address(&self) -> Option<SocketAddr> {
        self.channel.local_address()
    }

    pub fn remote_address(&self) -> Option<SocketAddr> {
        self.channel.remote_address()
    }

    /// Number of calls currently awaiting a reply
    pub fn pending_calls(&self) -> usize {
        self.pending.count()
    }

    /// Typed proxy for a remote interface, cached per interface type
    pub fn get_service<S: RemoteService>(&self) -> S {
        let key = TypeId::of::<S>();
        if let Some(cached) = self.services.get(&key) {
            if let Some(service) = cached.downcast_ref::<S>() {
                return service.clone();
            }
        }

        let invoker = Arc::new(InstanceInvoker {
            instance: self.this.clone(),
            endpoint: self.endpoint.clone(),
        });
        let service = S::bind(ServiceClient::new(S::INTERFACE, invoker));
        self.services.insert(key, Box::new(service.clone()));
        service
    }

    /// Liveness probe
    ///
    /// Concurrent pings on the same instance are serialized.
    pub async fn ping(&self) -> Result<(), ClientError> {
        let _guard = self.ping_lock.lock().await;
        trace!("Pinging {}", self.endpoint);
        self.get_service::<AuthService>().ping().await
    }

    /// Close the channel and fail every pending call. Idempotent.
    pub async fn close(&self) {
        if !self.open.swap(false, Ordering::AcqRel) {
            return;
        }
        debug!("Closing instance for {}", self.endpoint);
        self.pending.fail_all();
        self.channel.close().await;
    }

    async fn call(&self, method: &MethodDescriptor, args: Vec<Value>) -> Result<Value, ClientError> {
        if !self.is_open() {
            return Err(ClientError::InstanceClosed(self.endpoint.clone()));
        }

        let request_id = self.pending.next_id();
        let reply = self.pending.register(request_id);

        // The reader may have failed everything between the check above and
        // the registration.
        if !self.is_open() {
            self.pending.cancel(request_id);
            return Err(ClientError::InstanceClosed(self.endpoint.clone()));
        }

        trace!(request_id, "Calling {} on {}", method, self.endpoint);
        let message = WireMessage::Request {
            request_id,
            envelope: InvocationEnvelope::new(method.interface, method.name, args),
        };

        let write = tokio::time::timeout(self.config.call_timeout, self.channel.write(message));
        let written = match write.await {
            Ok(result) => result,
            Err(_) => {
                // A partially written frame leaves the stream unusable
                self.pending.cancel(request_id);
                warn!(
                    request_id,
                    "Write of {} to {} stalled for {:?}, closing",
                    method,
                    self.endpoint,
                    self.config.call_timeout
                );
                self.close().await;
                return Err(ClientError::Communication {
                    endpoint: self.endpoint.clone(),
                    source: TransportError::Timeout,
                });
            }
        };

        if let Err(source) = written {
            self.pending.cancel(request_id);
            if self.channel.is_open() {
                return Err(ClientError::Encoding {
                    method: method.to_string(),
                    source,
                });
            }
            warn!("Write to {} failed: {}", self.endpoint, source);
            self.close().await;
            return Err(ClientError::Communication {
                endpoint: self.endpoint.clone(),
                source,
            });
        }

        match tokio::time::timeout(self.config.call_timeout, reply).await {
            Ok(Ok(Reply::Ok(value))) => Ok(value),
            Ok(Ok(Reply::Fault(fault))) => Err(translate_fault(fault, method)),
            Ok(Err(_)) => Err(ClientError::Communication {
                endpoint: self.endpoint.clone(),
                source: TransportError::ConnectionClosed,
            }),
            Err(_) => {
                self.pending.cancel(request_id);
                warn!(
                    request_id,
                    "Call {} on {} timed out after {:?}",
                    method,
                    self.endpoint,
                    self.config.call_timeout
                );
                Err(ClientError::Timeout {
                    method: method.to_string(),
                    timeout: self.config.call_timeout,
                })
            }
        }
    }
}

#[async_trait]
impl Invoker for ServerInstance {
    async fn invoke(
        &self,
        method: &MethodDescriptor,
        args: Vec<Value>,
    ) -> Result<Value, ClientError> {
        self.call(method, args).await
    }
}

impl Drop for ServerInstance {
    fn drop(&mut self) {
        self.open.store(false, Ordering::Release);
        self.reader.abort();
    }
}

impl fmt::Debug for ServerInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerInstance")
            .field("endpoint", &self.endpoint)
            .field("open", &self.is_open())
            .field("server_version", &self.handshake.server_version)
            .finish()
    }
}

/// Invoker held by cached proxies; a weak handle so proxies do not keep
/// their instance alive
struct InstanceInvoker {
    instance: Weak<ServerInstance>,
    endpoint: EndpointRef,
}

#[async_trait]
impl Invoker for InstanceInvoker {
    async fn invoke(
        &self,
        method: &MethodDescriptor,
        args: Vec<Value>,
    ) -> Result<Value, ClientError> {
        match self.instance.upgrade() {
            Some(instance) => instance.call(method, args).await,
            None => Err(ClientError::InstanceClosed(self.endpoint.clone())),
        }
    }
}

async fn await_handshake(
    endpoint: &EndpointRef,
    channel: &dyn Channel,
    config: &InstanceConfig,
) -> Result<HandshakeMessage, ClientError> {
    for attempt in 1..=config.handshake_retries {
        match channel.read().await {
            Ok(WireMessage::Handshake(handshake)) => {
                handshake
                    .validate()
                    .map_err(|e| ClientError::Handshake {
                        endpoint: endpoint.clone(),
                        reason: e.to_string(),
                    })?;
                return Ok(handshake);
            }
            Ok(other) => {
                return Err(ClientError::Handshake {
                    endpoint: endpoint.clone(),
                    reason: format!("expected handshake, received {:?}", other),
                });
            }
            Err(e) if e.is_timeout() => {
                debug!(
                    "Handshake from {} timed out (attempt {}/{})",
                    endpoint, attempt, config.handshake_retries
                );
                if attempt < config.handshake_retries {
                    tokio::time::sleep(config.handshake_retry_delay).await;
                }
            }
            Err(source) => {
                return Err(ClientError::Communication {
                    endpoint: endpoint.clone(),
                    source,
                });
            }
        }
    }

    Err(ClientError::Communication {
        endpoint: endpoint.clone(),
        source: TransportError::IoError(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            format!(
                "no handshake after {} attempts",
                config.handshake_retries
            ),
        )),
    })
}

async fn read_loop(
    endpoint: EndpointRef,
    channel: Arc<dyn Channel>,
    pending: PendingCalls,
    open: Arc<AtomicBool>,
) {
    loop {
        match channel.read().await {
            Ok(WireMessage::Response { request_id, reply }) => {
                trace!(request_id, "Response from {}", endpoint);
                pending.respond(request_id, reply);
            }
            Ok(other) => {
                warn!("Ignoring unexpected message from {}: {:?}", endpoint, other);
            }
            // Idle connection
            Err(e) if e.is_timeout() => {}
            Err(e) => {
                if open.load(Ordering::Acquire) {
                    warn!("Connection to {} lost: {}", endpoint, e);
                } else {
                    debug!("Reader for {} stopped: {}", endpoint, e);
                }
                break;
            }
        }
    }

    open.store(false, Ordering::Release);
    pending.fail_all();
    channel.close().await;
}
