//! TCP channel factory

use crate::{Channel, ChannelFactory, FramedChannel, TcpChannelConfig, TransportError, TransportResult};
use async_trait::async_trait;
use hopwire_proto::EndpointRef;
use std::sync::Arc;
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// Opens plain TCP channels
#[derive(Debug, Clone, Default)]
pub struct TcpChannelFactory {
    config: TcpChannelConfig,
}

impl TcpChannelFactory {
    pub fn new(config: TcpChannelConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TcpChannelConfig {
        &self.config
    }
}

#[async_trait]
impl ChannelFactory for TcpChannelFactory {
    async fn open(&self, endpoint: &EndpointRef) -> TransportResult<Arc<dyn Channel>> {
        debug!("Connecting to {}", endpoint);

        let stream = tokio::time::timeout(
            self.config.connect_timeout,
            TcpStream::connect(endpoint.authority()),
        )
        .await
        .map_err(|_| {
            TransportError::ConnectionError(format!(
                "Timed out after {:?} connecting to {}",
                self.config.connect_timeout, endpoint
            ))
        })?
        .map_err(|e| {
            TransportError::ConnectionError(format!("Failed to connect to {}: {}", endpoint, e))
        })?;

        if let Err(e) = stream.set_nodelay(self.config.nodelay) {
            warn!("Failed to set TCP_NODELAY on {}: {}", endpoint, e);
        }

        let local_addr = stream.local_addr().ok();
        let remote_addr = stream.peer_addr().ok();
        debug!("Connected to {} ({:?} -> {:?})", endpoint, local_addr, remote_addr);

        let channel = FramedChannel::new(stream, Some(self.config.read_timeout))
            .with_addresses(local_addr, remote_addr);

        Ok(Arc::new(channel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hopwire_proto::{AuthType, HandshakeMessage, WireMessage};
    use std::time::Duration;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_tcp_channel_roundtrip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let channel = FramedChannel::new(stream, None);
            channel
                .write(WireMessage::Handshake(HandshakeMessage::new(
                    AuthType::UserPassword,
                    "test",
                )))
                .await
                .unwrap();
            channel.read().await.unwrap()
        });

        let factory = TcpChannelFactory::default();
        let channel = factory
            .open(&EndpointRef::new("127.0.0.1", port))
            .await
            .unwrap();

        assert_eq!(channel.remote_address().unwrap().port(), port);
        assert!(channel.local_address().is_some());

        match channel.read().await.unwrap() {
            WireMessage::Handshake(handshake) => assert_eq!(handshake.server_version, "test"),
            other => panic!("Expected handshake, got {:?}", other),
        }

        let ping = WireMessage::Request {
            request_id: 1,
            envelope: hopwire_proto::InvocationEnvelope::new("AuthService", "ping", vec![]),
        };
        channel.write(ping.clone()).await.unwrap();
        assert_eq!(server.await.unwrap(), ping);

        channel.close().await;
        assert!(!channel.is_open());
    }

    #[tokio::test]
    async fn test_connection_refused() {
        // Reserve a port, then release it so nothing is listening
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let factory = TcpChannelFactory::new(TcpChannelConfig {
            connect_timeout: Duration::from_secs(2),
            ..Default::default()
        });
        let result = factory.open(&EndpointRef::new("127.0.0.1", port)).await;

        match result {
            Err(TransportError::ConnectionError(msg)) => {
                assert!(msg.contains(&format!("127.0.0.1:{}", port)));
            }
            other => panic!("Expected connection error, got {:?}", other.map(|_| ())),
        }
    }
}
