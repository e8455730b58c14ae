//! Instance factory
//!
//! Creates [`ServerInstance`]s and pools them by endpoint so connections to
//! the same server share one socket. Each pooled instance tracks the logon
//! sessions registered on it; an instance is evicted and closed once its
//! last session disconnects.

use crate::config::InstanceConfig;
use crate::error::{BoxError, ClientError};
use crate::instance::ServerInstance;
use async_trait::async_trait;
use hopwire_proto::EndpointRef;
use hopwire_transport::ChannelFactory;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

/// Observer of logon session lifecycle, e.g. a cluster registry
///
/// Failures are logged and never reach the connection that triggered the
/// notification.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LifecycleListener: Send + Sync {
    async fn on_connected(&self, endpoint: &EndpointRef, session_id: &str)
        -> Result<(), BoxError>;

    async fn on_disconnected(
        &self,
        endpoint: &EndpointRef,
        session_id: &str,
    ) -> Result<(), BoxError>;
}

struct PoolEntry {
    instance: Arc<ServerInstance>,
    sessions: HashSet<String>,
}

impl PoolEntry {
    fn new(instance: Arc<ServerInstance>) -> Self {
        Self {
            instance,
            sessions: HashSet::new(),
        }
    }
}

/// Endpoint to instance pool
pub struct InstanceFactory {
    channels: Arc<dyn ChannelFactory>,
    config: InstanceConfig,
    pool: Mutex<HashMap<EndpointRef, PoolEntry>>,
    listeners: RwLock<Vec<Arc<dyn LifecycleListener>>>,
}

impl InstanceFactory {
    pub fn new(channels: Arc<dyn ChannelFactory>, config: InstanceConfig) -> Self {
        Self {
            channels,
            config,
            pool: Mutex::new(HashMap::new()),
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &InstanceConfig {
        &self.config
    }

    pub async fn add_listener(&self, listener: Arc<dyn LifecycleListener>) {
        self.listeners.write().await.push(listener);
    }

    /// Return the pooled open instance for `endpoint`, or connect a new one
    pub async fn get_server_instance(
        &self,
        endpoint: &EndpointRef,
    ) -> Result<Arc<ServerInstance>, ClientError> {
        let stale = {
            let mut pool = self.pool.lock().await;
            if let Some(entry) = pool.get(endpoint) {
                if entry.instance.is_open() {
                    debug!("Reusing pooled instance for {}", endpoint);
                    return Ok(entry.instance.clone());
                }
            }
            pool.remove(endpoint)
        };
        if let Some(stale) = stale {
            debug!("Discarding closed pooled instance for {}", endpoint);
            stale.instance.close().await;
        }

        // Connect without holding the pool lock
        let instance =
            ServerInstance::connect(endpoint.clone(), self.channels.as_ref(), self.config.clone())
                .await?;

        let mut pool = self.pool.lock().await;
        if let Some(entry) = pool.get(endpoint) {
            if entry.instance.is_open() {
                // Lost a race with a concurrent connect to the same endpoint
                let existing = entry.instance.clone();
                drop(pool);
                instance.close().await;
                return Ok(existing);
            }
        }
        let replaced = pool.insert(endpoint.clone(), PoolEntry::new(instance.clone()));
        drop(pool);

        if let Some(replaced) = replaced {
            replaced.instance.close().await;
        }
        Ok(instance)
    }

    /// Register a logon session on `instance` and notify listeners
    pub async fn connected(&self, instance: &Arc<ServerInstance>, session_id: &str) {
        {
            let mut pool = self.pool.lock().await;
            let entry = pool
                .entry(instance.endpoint().clone())
                .or_insert_with(|| PoolEntry::new(instance.clone()));
            if Arc::ptr_eq(&entry.instance, instance) {
                entry.sessions.insert(session_id.to_string());
            }
        }

        for listener in self.listeners.read().await.iter() {
            if let Err(e) = listener.on_connected(instance.endpoint(), session_id).await {
                warn!(
                    "Lifecycle listener failed on connect to {}: {}",
                    instance.endpoint(),
                    e
                );
            }
        }
    }

    /// Remove a logon session from `instance` and notify listeners
    ///
    /// The instance is evicted and closed once no sessions remain on it, or
    /// right away if it is already closed.
    pub async fn disconnected(&self, instance: &Arc<ServerInstance>, session_id: &str) {
        let evict = {
            let mut pool = self.pool.lock().await;
            let remaining = match pool.get_mut(instance.endpoint()) {
                Some(entry) if Arc::ptr_eq(&entry.instance, instance) => {
                    entry.sessions.remove(session_id);
                    Some(entry.sessions.len())
                }
                _ => None,
            };
            match remaining {
                Some(0) => {
                    pool.remove(instance.endpoint());
                    true
                }
                Some(_) if !instance.is_open() => {
                    pool.remove(instance.endpoint());
                    true
                }
                Some(_) => false,
                // Not pooled (already replaced), nobody else can reach it
                None => true,
            }
        };
        if evict {
            debug!("Evicting instance for {}", instance.endpoint());
            instance.close().await;
        }

        for listener in self.listeners.read().await.iter() {
            if let Err(e) = listener.on_disconnected(instance.endpoint(), session_id).await {
                warn!(
                    "Lifecycle listener failed on disconnect from {}: {}",
                    instance.endpoint(),
                    e
                );
            }
        }
    }

    /// Give back an instance whose logon failed
    pub async fn release(&self, instance: &Arc<ServerInstance>) {
        let evict = {
            let mut pool = self.pool.lock().await;
            let unused = pool
                .get(instance.endpoint())
                .filter(|entry| Arc::ptr_eq(&entry.instance, instance))
                .map(|entry| entry.sessions.is_empty());
            match unused {
                Some(true) => {
                    pool.remove(instance.endpoint());
                    true
                }
                Some(false) => false,
                None => true,
            }
        };
        if evict {
            instance.close().await;
        }
    }

    /// Number of pooled instances
    pub async fn pooled_count(&self) -> usize {
        self.pool.lock().await.len()
    }

    /// Sessions registered on the pooled instance for `endpoint`
    pub async fn session_count(&self, endpoint: &EndpointRef) -> usize {
        self.pool
            .lock()
            .await
            .get(endpoint)
            .map_or(0, |entry| entry.sessions.len())
    }

    /// Close every pooled instance
    pub async fn shutdown(&self) {
        let entries: Vec<_> = self.pool.lock().await.drain().collect();
        for (endpoint, entry) in entries {
            debug!("Closing pooled instance for {}", endpoint);
            entry.instance.close().await;
        }
    }
}

impl fmt::Debug for InstanceFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceFactory")
            .field("channels", &self.channels)
            .field("config", &self.config)
            .finish()
    }
}
