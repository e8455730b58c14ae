//! Length-prefixed message channel over any async byte stream

use crate::{Channel, TransportError, TransportResult};
use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use hopwire_proto::{CodecError, WireCodec, WireMessage};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// [`Channel`] implementation over a [`Framed`] stream using [`WireCodec`]
pub struct FramedChannel<S> {
    writer: Mutex<SplitSink<Framed<S, WireCodec>, WireMessage>>,
    reader: Mutex<SplitStream<Framed<S, WireCodec>>>,
    read_timeout: Option<Duration>,
    shutdown: CancellationToken,
    open: AtomicBool,
    remote_addr: Option<SocketAddr>,
    local_addr: Option<SocketAddr>,
}

impl<S> FramedChannel<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    /// Wrap a stream; `read_timeout` of `None` waits indefinitely
    pub fn new(stream: S, read_timeout: Option<Duration>) -> Self {
        let (writer, reader) = Framed::new(stream, WireCodec).split();
        Self {
            writer: Mutex::new(writer),
            reader: Mutex::new(reader),
            read_timeout,
            shutdown: CancellationToken::new(),
            open: AtomicBool::new(true),
            remote_addr: None,
            local_addr: None,
        }
    }

    /// Record the socket addresses of the underlying stream
    pub fn with_addresses(
        mut self,
        local_addr: Option<SocketAddr>,
        remote_addr: Option<SocketAddr>,
    ) -> Self {
        self.local_addr = local_addr;
        self.remote_addr = remote_addr;
        self
    }

    fn mark_closed(&self) {
        if self.open.swap(false, Ordering::AcqRel) {
            debug!("Channel to {:?} closed", self.remote_addr);
        }
        self.shutdown.cancel();
    }

    fn map_codec_error(&self, err: CodecError) -> TransportError {
        match err {
            CodecError::Io(e) => {
                self.mark_closed();
                TransportError::IoError(e)
            }
            // A corrupt frame leaves the stream position undefined
            CodecError::SerializationError(_) | CodecError::MessageTooLarge(_) => {
                self.mark_closed();
                TransportError::CodecError(err)
            }
        }
    }
}

#[async_trait]
impl<S> Channel for FramedChannel<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    async fn write(&self, message: WireMessage) -> TransportResult<()> {
        if !self.is_open() {
            return Err(TransportError::ConnectionClosed);
        }

        let mut writer = self.writer.lock().await;
        trace!("Writing message to {:?}", self.remote_addr);
        tokio::select! {
            _ = self.shutdown.cancelled() => Err(TransportError::ConnectionClosed),
            result = writer.send(message) => result.map_err(|e| match e {
                // Encoding fails before any byte reaches the stream
                CodecError::SerializationError(_) | CodecError::MessageTooLarge(_) => {
                    TransportError::CodecError(e)
                }
                CodecError::Io(_) => self.map_codec_error(e),
            }),
        }
    }

    async fn read(&self) -> TransportResult<WireMessage> {
        if !self.is_open() {
            return Err(TransportError::ConnectionClosed);
        }

        let mut reader = self.reader.try_lock().map_err(|_| {
            TransportError::ProtocolError("concurrent read on a single-reader channel".to_string())
        })?;

        let next = async {
            match self.read_timeout {
                Some(deadline) => tokio::time::timeout(deadline, reader.next())
                    .await
                    .map_err(|_| TransportError::Timeout),
                None => Ok(reader.next().await),
            }
        };

        tokio::select! {
            _ = self.shutdown.cancelled() => Err(TransportError::ConnectionClosed),
            result = next => match result? {
                Some(Ok(message)) => Ok(message),
                Some(Err(e)) => Err(self.map_codec_error(e)),
                None => {
                    self.mark_closed();
                    Err(TransportError::ConnectionClosed)
                }
            },
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    async fn close(&self) {
        let was_open = self.is_open();
        self.mark_closed();
        if !was_open {
            return;
        }

        let mut writer = self.writer.lock().await;
        if let Err(e) = tokio::time::timeout(Duration::from_secs(1), writer.close()).await {
            debug!("Timed out flushing channel on close: {}", e);
        }
    }

    fn remote_address(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    fn local_address(&self) -> Option<SocketAddr> {
        self.local_addr
    }
}

impl<S> fmt::Debug for FramedChannel<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FramedChannel")
            .field("remote_addr", &self.remote_addr)
            .field("local_addr", &self.local_addr)
            .field("read_timeout", &self.read_timeout)
            .field("open", &self.open.load(Ordering::Relaxed))
            .finish()
    }
}
