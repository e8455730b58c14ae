//! Logical client connection with transparent failover
//!
//! A [`Connection`] owns at most one current [`ServerInstance`]. Service
//! calls go through the current instance; when failover is enabled, a
//! connection-class failure triggers one reconnect to the next candidate
//! endpoint followed by a single retry of the failed call.
//!
//! ```text
//!   caller ──► Connection ──► current ServerInstance ──► Channel
//!                  │  ▲
//!                  │  └─ failover: next candidate (wrapping), logon, retry once
//!                  └──── ping task: periodic liveness probe, same failover path
//! ```

use crate::auth::AuthService;
use crate::config::ConnectionConfig;
use crate::discovery::{ServerDiscovery, UrlDiscovery};
use crate::error::{ClientError, ErrorKind, FailedAttempt};
use crate::factory::InstanceFactory;
use crate::instance::ServerInstance;
use crate::service::{Invoker, MethodDescriptor, RemoteService, ServiceClient};
use async_trait::async_trait;
use hopwire_proto::properties::{CLIENT_HOST_NAME, CLIENT_IP_ADDRESS};
use hopwire_proto::{ConnectionUrl, EndpointRef, LogonResult, Properties, Value};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

#[derive(Default)]
struct ConnectionState {
    current: Option<Arc<ServerInstance>>,
    /// Position of `current` in the discovery order
    current_index: usize,
    logon: Option<LogonResult>,
}

struct ConnectionInner {
    id: Uuid,
    discovery: Arc<dyn ServerDiscovery>,
    factory: Arc<InstanceFactory>,
    config: ConnectionConfig,
    properties: RwLock<Properties>,
    /// Guards the current instance; failover holds it for the whole reconnect
    state: Mutex<ConnectionState>,
    closed: AtomicBool,
    pinger: Mutex<Option<JoinHandle<()>>>,
}

/// Caller-facing handle to a server cluster
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    /// Connect to the first endpoint in `url` that accepts a logon
    ///
    /// Query parameters in the URL fill in properties the caller did not set.
    /// On success `properties` gains the client host name and IP address.
    pub async fn connect(
        url: &str,
        properties: &mut Properties,
        factory: Arc<InstanceFactory>,
        config: ConnectionConfig,
    ) -> Result<Self, ClientError> {
        let url = ConnectionUrl::parse(url)?;
        let mut merged = properties.clone();
        for (key, value) in url.properties() {
            merged.set_default(key.clone(), value.clone());
        }
        let config = config.with_properties(&merged);
        let discovery = Arc::new(UrlDiscovery::new(url));
        let connection = Self::connect_with_discovery(discovery, &mut merged, factory, config).await?;
        *properties = merged;
        Ok(connection)
    }

    /// Connect using an arbitrary endpoint source
    pub async fn connect_with_discovery(
        discovery: Arc<dyn ServerDiscovery>,
        properties: &mut Properties,
        factory: Arc<InstanceFactory>,
        config: ConnectionConfig,
    ) -> Result<Self, ClientError> {
        let mut outbound = properties.clone();
        outbound.set(CLIENT_HOST_NAME, local_host_name());

        let inner = Arc::new(ConnectionInner {
            id: Uuid::new_v4(),
            discovery,
            factory,
            config,
            properties: RwLock::new(outbound),
            state: Mutex::new(ConnectionState::default()),
            closed: AtomicBool::new(false),
            pinger: Mutex::new(None),
        });

        {
            let mut state = inner.state.lock().await;
            inner.establish(&mut state, 0, false).await?;
        }
        *properties = inner.properties.read().await.clone();

        if inner.config.failover && !inner.config.ping_interval.is_zero() {
            let pinger = spawn_pinger(Arc::downgrade(&inner), inner.config.ping_interval);
            *inner.pinger.lock().await = Some(pinger);
        }

        Ok(Self { inner })
    }

    /// Identifier used in log output
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    /// Typed proxy whose calls fail over on connection-class errors
    pub fn get_service<S: RemoteService>(&self) -> S {
        S::bind(ServiceClient::new(S::INTERFACE, self.inner.clone()))
    }

    /// Re-run the logon with the current properties
    ///
    /// Picks up credentials changed through [`Connection::set_property`]
    /// without giving up the connection's identity.
    pub async fn authenticate(&self) -> Result<LogonResult, ClientError> {
        let inner = &self.inner;
        let instance = inner.current_or_recover().await?;
        let properties = inner.properties.read().await.clone();

        let logon = match instance
            .get_service::<AuthService>()
            .authenticate_again(&properties)
            .await
        {
            Ok(logon) => logon,
            Err(e) if e.is_connection_class() && inner.config.failover => {
                // The reconnect performs a fresh logon with the same properties
                inner.fail_over(Some(&instance)).await?;
                return inner.state.lock().await.logon.clone().ok_or(ClientError::NotConnected);
            }
            Err(e) => return Err(e),
        };

        let mut state = inner.state.lock().await;
        let still_current = state
            .current
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, &instance));
        if !still_current {
            // A concurrent failover replaced the instance; its logon wins
            drop(state);
            inner.factory.disconnected(&instance, &logon.session_id).await;
            return inner.state.lock().await.logon.clone().ok_or(ClientError::NotConnected);
        }

        let previous = state.logon.replace(logon.clone());
        inner.factory.connected(&instance, &logon.session_id).await;
        if let Some(previous) = previous {
            if previous.session_id != logon.session_id {
                inner.factory.disconnected(&instance, &previous.session_id).await;
            }
        }
        info!(connection = %inner.id, "Re-authenticated as {}", logon.user_name);
        Ok(logon)
    }

    /// True when both connections currently talk to the same endpoint
    pub async fn is_same_instance(&self, other: &Connection) -> bool {
        if Arc::ptr_eq(&self.inner, &other.inner) {
            return true;
        }
        match (self.current_endpoint().await, other.current_endpoint().await) {
            (Some(mine), Some(theirs)) => mine == theirs,
            _ => false,
        }
    }

    pub async fn current_endpoint(&self) -> Option<EndpointRef> {
        let state = self.inner.state.lock().await;
        state.current.as_ref().map(|i| i.endpoint().clone())
    }

    pub async fn logon_result(&self) -> Option<LogonResult> {
        self.inner.state.lock().await.logon.clone()
    }

    pub async fn session_id(&self) -> Option<String> {
        self.logon_result().await.map(|logon| logon.session_id)
    }

    /// Probe the current instance, failing over once if it is dead
    pub async fn ping(&self) -> Result<(), ClientError> {
        self.inner.ping().await
    }

    /// Snapshot of the outbound properties
    pub async fn properties(&self) -> Properties {
        self.inner.properties.read().await.clone()
    }

    /// Change an outbound property; takes effect on the next logon
    pub async fn set_property(&self, key: impl Into<String>, value: impl Into<String>) {
        self.inner.properties.write().await.set(key, value);
    }

    pub fn is_open(&self) -> bool {
        !self.inner.is_closed()
    }

    /// Log off, release the current instance and stop the ping task.
    /// Idempotent.
    pub async fn close(&self) {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(pinger) = inner.pinger.lock().await.take() {
            pinger.abort();
        }

        let (instance, logon) = {
            let mut state = inner.state.lock().await;
            (state.current.take(), state.logon.take())
        };

        if let Some(instance) = instance {
            if inner.config.logoff_on_close && instance.is_open() {
                if let Err(e) = instance.get_service::<AuthService>().logoff().await {
                    debug!(connection = %inner.id, "Logoff from {} failed: {}", instance.endpoint(), e);
                }
            }
            let session_id = logon.map(|logon| logon.session_id).unwrap_or_default();
            inner.factory.disconnected(&instance, &session_id).await;
        }
        info!(connection = %inner.id, "Connection closed");
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("closed", &self.inner.is_closed())
            .finish()
    }
}

impl ConnectionInner {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    async fn current(&self) -> Result<Option<Arc<ServerInstance>>, ClientError> {
        if self.is_closed() {
            return Err(ClientError::ConnectionClosed);
        }
        Ok(self.state.lock().await.current.clone())
    }

    /// The current instance, reconnecting first if a previous failover left
    /// the connection without one
    async fn current_or_recover(&self) -> Result<Arc<ServerInstance>, ClientError> {
        match self.current().await? {
            Some(instance) => Ok(instance),
            None if self.config.failover => self.fail_over(None).await,
            None => Err(ClientError::NotConnected),
        }
    }

    /// Walk the candidates and make the first successful logon current
    ///
    /// Without `wrap` the walk covers `start..n`; with `wrap` it covers all
    /// `n` candidates beginning at `start`.
    async fn establish(
        &self,
        state: &mut ConnectionState,
        start: usize,
        wrap: bool,
    ) -> Result<(), ClientError> {
        let hosts = self.discovery.known_hosts();
        let count = hosts.len();
        let order: Vec<usize> = if wrap {
            (0..count).map(|offset| (start + offset) % count).collect()
        } else {
            (start..count).collect()
        };

        let mut attempts = Vec::with_capacity(order.len());
        for index in order {
            let endpoint = &hosts[index];
            match self.logon_at(endpoint).await {
                Ok((instance, logon)) => {
                    self.discovery.connection_successful(endpoint);
                    self.factory.connected(&instance, &logon.session_id).await;
                    info!(
                        connection = %self.id,
                        "Logged on to {} as {} (session {})",
                        endpoint, logon.user_name, logon.session_id
                    );
                    state.current = Some(instance);
                    state.current_index = index;
                    state.logon = Some(logon);
                    return Ok(());
                }
                Err(e) if e.is_connection_class() => {
                    warn!(connection = %self.id, "Abandoning {}: {}", endpoint, e);
                    self.discovery.mark_bad(endpoint);
                    attempts.push(FailedAttempt {
                        endpoint: endpoint.clone(),
                        reason: e.to_string(),
                    });
                }
                Err(e) => return Err(e),
            }
        }

        let err = ClientError::Exhausted { attempts };
        error!(connection = %self.id, "{}", err);
        Err(err)
    }

    async fn logon_at(
        &self,
        endpoint: &EndpointRef,
    ) -> Result<(Arc<ServerInstance>, LogonResult), ClientError> {
        let instance = self.factory.get_server_instance(endpoint).await?;

        let properties = {
            let mut properties = self.properties.write().await;
            let ip = instance
                .local_address()
                .map(|addr| addr.ip())
                .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));
            properties.set(CLIENT_IP_ADDRESS, ip.to_string());
            properties.clone()
        };

        match instance.get_service::<AuthService>().logon(&properties).await {
            Ok(logon) => Ok((instance, logon)),
            Err(e) => {
                self.factory.release(&instance).await;
                Err(e)
            }
        }
    }

    /// Replace `failed` with a freshly logged-on instance
    ///
    /// If another task already replaced it, the refreshed current instance is
    /// returned without reconnecting.
    async fn fail_over(
        &self,
        failed: Option<&Arc<ServerInstance>>,
    ) -> Result<Arc<ServerInstance>, ClientError> {
        let mut state = self.state.lock().await;
        if self.is_closed() {
            return Err(ClientError::ConnectionClosed);
        }

        if let Some(current) = &state.current {
            let already_replaced = failed.map_or(true, |failed| !Arc::ptr_eq(failed, current));
            if already_replaced && current.is_open() {
                debug!(connection = %self.id, "Instance already replaced by {}", current.endpoint());
                return Ok(current.clone());
            }
        }

        let dead = state.current.take();
        let session_id = state.logon.take().map(|logon| logon.session_id);
        if let Some(dead) = &dead {
            info!(connection = %self.id, "Failing over from {}", dead.endpoint());
            self.discovery.mark_bad(dead.endpoint());
            dead.close().await;
            self.factory
                .disconnected(dead, session_id.as_deref().unwrap_or_default())
                .await;
        }

        let start = state.current_index + 1;
        self.establish(&mut state, start, true).await?;
        state.current.clone().ok_or(ClientError::NotConnected)
    }

    async fn ping(&self) -> Result<(), ClientError> {
        let instance = self.current_or_recover().await?;
        match instance.ping().await {
            Err(e) if is_dead_instance(&e) && self.config.failover && !self.is_closed() => {
                warn!(connection = %self.id, "Ping to {} failed: {}", instance.endpoint(), e);
                self.fail_over(Some(&instance)).await?.ping().await
            }
            result => result,
        }
    }
}

#[async_trait]
impl Invoker for ConnectionInner {
    async fn invoke(
        &self,
        method: &MethodDescriptor,
        args: Vec<Value>,
    ) -> Result<Value, ClientError> {
        let current = self.current().await?;
        let result = match &current {
            Some(instance) => instance.invoke(method, args.clone()).await,
            None => Err(ClientError::NotConnected),
        };

        match result {
            Err(e) if e.is_connection_class() && self.config.failover && !self.is_closed() => {
                info!(connection = %self.id, "Call {} failed ({}), retrying after failover", method, e);
                let instance = self.fail_over(current.as_ref()).await?;
                instance.invoke(method, args).await
            }
            result => result,
        }
    }
}

impl Drop for ConnectionInner {
    fn drop(&mut self) {
        if let Some(pinger) = self.pinger.get_mut().take() {
            pinger.abort();
        }

        // Dropped without close: give the session back to the pool
        let state = self.state.get_mut();
        let Some(instance) = state.current.take() else {
            return;
        };
        let session_id = state.logon.take().map(|logon| logon.session_id).unwrap_or_default();
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(connection = %self.id, "Dropped outside a runtime, session {} stays registered", session_id);
            return;
        };
        debug!(connection = %self.id, "Dropped without close, releasing session {}", session_id);
        let factory = self.factory.clone();
        runtime.spawn(async move {
            factory.disconnected(&instance, &session_id).await;
        });
    }
}

/// A ping timeout is as good as an I/O failure for declaring an instance dead
fn is_dead_instance(err: &ClientError) -> bool {
    matches!(err.kind(), ErrorKind::Transport | ErrorKind::Timeout)
}

fn spawn_pinger(inner: Weak<ConnectionInner>, period: std::time::Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let Some(inner) = inner.upgrade() else {
                break;
            };
            if inner.is_closed() {
                break;
            }
            match inner.ping().await {
                Ok(()) => trace!(connection = %inner.id, "Ping ok"),
                Err(ClientError::ConnectionClosed) => break,
                Err(e) => error!(connection = %inner.id, "Liveness check failed: {}", e),
            }
        }
    })
}

fn local_host_name() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}
