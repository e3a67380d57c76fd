//! Line-delimited JSON over TCP.
//!
//! Every client keeps one connection to a relay hub
//! ([`RelayServer`](crate::transport::relay_server::RelayServer)), which
//! writes each line it receives to every connection, the sender included.
//! The hub keeps no history, so delivery handles are local counters and
//! deleting a message does nothing.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_util::codec::Framed;
use tracing::{debug, info, instrument, trace, warn};

use crate::core::codec::{Framing, LineCodec};
use crate::core::packet::DeliveryHandle;
use crate::error::{ProtocolError, Result};
use crate::transport::{RawMessage, Transport, INBOUND_CHANNEL_CAPACITY};

type LineSink = SplitSink<Framed<TcpStream, LineCodec>, Bytes>;

pub struct TcpTransport {
    address: String,
    sink: Mutex<Option<LineSink>>,
    next_handle: Arc<AtomicU64>,
}

impl TcpTransport {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            sink: Mutex::new(None),
            next_handle: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }
}

impl std::fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpTransport")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn name(&self) -> &str {
        "tcp"
    }

    fn framing(&self) -> Framing {
        Framing::Line
    }

    #[instrument(skip(self), fields(address = %self.address))]
    async fn connect(&self) -> Result<mpsc::Receiver<RawMessage>> {
        let stream = TcpStream::connect(&self.address).await?;
        stream.set_nodelay(true)?;
        info!("connected to relay hub");

        let (sink, mut lines) = Framed::new(stream, LineCodec::new()).split();
        *self.sink.lock().await = Some(sink);

        let (tx, rx) = mpsc::channel(INBOUND_CHANNEL_CAPACITY);
        let next_handle = Arc::clone(&self.next_handle);
        tokio::spawn(async move {
            while let Some(line) = lines.next().await {
                match line {
                    Ok(body) => {
                        let message = RawMessage {
                            handle: DeliveryHandle(next_handle.fetch_add(1, Ordering::Relaxed)),
                            body,
                        };
                        if tx.send(message).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "relay connection failed");
                        break;
                    }
                }
            }
            debug!("relay hub stream ended");
        });

        Ok(rx)
    }

    async fn send_raw(&self, message: Bytes) -> Result<DeliveryHandle> {
        let body = Framing::Line.unwrap(&message)?;
        let line = message.slice_ref(body);

        let mut sink = self.sink.lock().await;
        let sink = sink.as_mut().ok_or(ProtocolError::ConnectionClosed)?;
        sink.send(line).await?;

        let handle = DeliveryHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        trace!(%handle, "line sent");
        Ok(handle)
    }

    async fn delete_message(&self, handle: DeliveryHandle) -> Result<()> {
        trace!(%handle, "relay hub keeps no history, nothing to delete");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if let Some(mut sink) = self.sink.lock().await.take() {
            sink.close().await?;
        }
        Ok(())
    }
}
