//! Shared fixtures for connection-level tests

#![allow(dead_code)]

use hopwire_client::{
    ClientError, Connection, ConnectionConfig, InstanceConfig, InstanceFactory, MethodDescriptor,
    RemoteService, ServiceClient,
};
use hopwire_proto::properties::{AUTO_FAILOVER, USER};
use hopwire_proto::{EndpointRef, Properties};
use hopwire_test_utils::{MemoryCluster, ECHO_FAULT, ECHO_INTERFACE};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

static ECHO: MethodDescriptor = MethodDescriptor::new(ECHO_INTERFACE, "echo", &[]);
static WHOAMI: MethodDescriptor = MethodDescriptor::new(ECHO_INTERFACE, "whoami", &[]);
static FAIL: MethodDescriptor = MethodDescriptor::new(ECHO_INTERFACE, "fail", &[ECHO_FAULT]);

/// Typed stub for the simulated `Echo` interface
#[derive(Debug, Clone)]
pub struct EchoService {
    client: ServiceClient,
}

impl RemoteService for EchoService {
    const INTERFACE: &'static str = ECHO_INTERFACE;

    fn bind(client: ServiceClient) -> Self {
        Self { client }
    }
}

impl EchoService {
    pub async fn echo(&self, text: &str) -> Result<String, ClientError> {
        Ok(self.client.call(&ECHO, vec![text.into()]).await?.into_string()?)
    }

    /// `host:port` of the server that answered
    pub async fn whoami(&self) -> Result<String, ClientError> {
        Ok(self.client.call(&WHOAMI, vec![]).await?.into_string()?)
    }

    pub async fn fail(&self, message: &str) -> Result<(), ClientError> {
        self.client.call(&FAIL, vec![message.into()]).await.map(|_| ())
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("hopwire_client=debug")
        .with_test_writer()
        .try_init();
}

pub fn instance_config() -> InstanceConfig {
    InstanceConfig {
        handshake_retry_delay: Duration::from_millis(10),
        call_timeout: Duration::from_millis(500),
        ..InstanceConfig::default()
    }
}

/// Connection settings with the background ping disabled
pub fn quiet_config() -> ConnectionConfig {
    ConnectionConfig {
        ping_interval: Duration::ZERO,
        ..ConnectionConfig::default()
    }
}

pub struct Harness {
    pub cluster: MemoryCluster,
    pub endpoints: Vec<EndpointRef>,
    pub factory: Arc<InstanceFactory>,
}

impl Harness {
    /// Servers named `s0`, `s1`, ... on ports 1, 2, ...
    pub fn new(servers: usize) -> Self {
        init_tracing();
        let cluster = MemoryCluster::new();
        let endpoints = (0..servers)
            .map(|i| cluster.add_server(&format!("s{}", i), (i + 1) as u16))
            .collect();
        let factory = Arc::new(InstanceFactory::new(
            Arc::new(cluster.clone()),
            instance_config(),
        ));
        Self {
            cluster,
            endpoints,
            factory,
        }
    }

    pub fn url(&self) -> String {
        self.cluster.url(&self.endpoints)
    }

    pub async fn connect(
        &self,
        failover: bool,
        config: ConnectionConfig,
    ) -> Result<Connection, ClientError> {
        self.connect_to(&self.url(), failover, config).await
    }

    pub async fn connect_to(
        &self,
        url: &str,
        failover: bool,
        config: ConnectionConfig,
    ) -> Result<Connection, ClientError> {
        let mut props = Properties::new()
            .with(USER, "alice")
            .with(AUTO_FAILOVER, failover.to_string());
        Connection::connect(url, &mut props, self.factory.clone(), config).await
    }
}

/// Poll `condition` until it holds or `limit` elapses
pub async fn eventually<F, Fut>(limit: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition().await
}
