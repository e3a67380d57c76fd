//! In-process relay.
//!
//! [`MemoryRelay`] behaves like a single chat channel: every posted message
//! gets a fresh id, is retained until deleted, and is delivered to every
//! connected endpoint including the one that posted it.

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use crate::core::codec::Framing;
use crate::core::packet::{DeliveryHandle, Packet};
use crate::error::{ProtocolError, Result};
use crate::transport::{RawMessage, Transport, INBOUND_CHANNEL_CAPACITY};

const FANOUT_CAPACITY: usize = 4096;

#[derive(Debug)]
struct RelayState {
    next_id: AtomicU64,
    retained: Mutex<BTreeMap<DeliveryHandle, Bytes>>,
    deletions: AtomicU64,
    fail_sends: AtomicBool,
    fanout: broadcast::Sender<RawMessage>,
}

/// Shared relay. Clones refer to the same channel.
#[derive(Debug, Clone)]
pub struct MemoryRelay {
    state: Arc<RelayState>,
    framing: Framing,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self::with_framing(Framing::Fenced)
    }

    pub fn with_framing(framing: Framing) -> Self {
        let (fanout, _) = broadcast::channel(FANOUT_CAPACITY);
        Self {
            state: Arc::new(RelayState {
                next_id: AtomicU64::new(1),
                retained: Mutex::new(BTreeMap::new()),
                deletions: AtomicU64::new(0),
                fail_sends: AtomicBool::new(false),
                fanout,
            }),
            framing,
        }
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }

    /// A transport attached to this relay.
    pub fn endpoint(&self) -> Arc<MemoryTransport> {
        Arc::new(MemoryTransport {
            relay: self.clone(),
        })
    }

    /// Make every following post fail until switched back.
    pub fn fail_sends(&self, fail: bool) {
        self.state.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Post a framed message as if some outside host had sent it.
    pub fn post(&self, message: Bytes) -> Result<DeliveryHandle> {
        if self.state.fail_sends.load(Ordering::SeqCst) {
            return Err(ProtocolError::TransportError("relay rejected the post".into()));
        }
        let handle = DeliveryHandle(self.state.next_id.fetch_add(1, Ordering::SeqCst));
        self.retained().insert(handle, message.clone());
        // No receivers is fine, the message is still retained
        let _ = self.state.fanout.send(RawMessage {
            handle,
            body: message,
        });
        Ok(handle)
    }

    /// Encode and post a packet.
    pub fn post_packet(&self, packet: &Packet) -> Result<DeliveryHandle> {
        self.post(self.framing.wrap(&packet.encode()?))
    }

    /// Deliver a retained message a second time, as a relay that duplicates
    /// would.
    pub fn redeliver(&self, handle: DeliveryHandle) -> Result<()> {
        let body = self
            .retained()
            .get(&handle)
            .cloned()
            .ok_or(ProtocolError::MessageNotFound(handle.0))?;
        let _ = self.state.fanout.send(RawMessage { handle, body });
        Ok(())
    }

    pub fn delete(&self, handle: DeliveryHandle) -> Result<()> {
        match self.retained().remove(&handle) {
            Some(_) => {
                self.state.deletions.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            None => Err(ProtocolError::MessageNotFound(handle.0)),
        }
    }

    /// Messages still on the relay, oldest first.
    pub fn messages(&self) -> Vec<(DeliveryHandle, Bytes)> {
        self.retained()
            .iter()
            .map(|(handle, body)| (*handle, body.clone()))
            .collect()
    }

    /// Retained messages that decode as packets.
    pub fn packets(&self) -> Vec<Packet> {
        self.messages()
            .into_iter()
            .filter_map(|(handle, body)| {
                let inner = self.framing.unwrap(&body).ok()?;
                Packet::decode(inner).ok().map(|p| p.with_delivery(handle))
            })
            .collect()
    }

    /// Data payloads of retained packets, for assertions.
    pub fn data_of(&self, op: crate::core::opcode::OpCode) -> Vec<Value> {
        self.packets()
            .into_iter()
            .filter(|p| p.op() == op)
            .map(|p| p.data().clone())
            .collect()
    }

    pub fn deletions(&self) -> u64 {
        self.state.deletions.load(Ordering::SeqCst)
    }

    fn retained(&self) -> std::sync::MutexGuard<'_, BTreeMap<DeliveryHandle, Bytes>> {
        self.state.retained.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for MemoryRelay {
    fn default() -> Self {
        Self::new()
    }
}

/// One host's connection to a [`MemoryRelay`].
#[derive(Debug)]
pub struct MemoryTransport {
    relay: MemoryRelay,
}

impl MemoryTransport {
    pub fn relay(&self) -> &MemoryRelay {
        &self.relay
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn name(&self) -> &str {
        "memory"
    }

    fn framing(&self) -> Framing {
        self.relay.framing
    }

    async fn connect(&self) -> Result<mpsc::Receiver<RawMessage>> {
        let mut fanout = self.relay.state.fanout.subscribe();
        let (tx, rx) = mpsc::channel(INBOUND_CHANNEL_CAPACITY);

        tokio::spawn(async move {
            loop {
                match fanout.recv().await {
                    Ok(message) => {
                        if tx.send(message).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "memory relay endpoint lagged, messages lost");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!("memory relay endpoint closed");
        });

        Ok(rx)
    }

    async fn send_raw(&self, message: Bytes) -> Result<DeliveryHandle> {
        self.relay.post(message)
    }

    async fn delete_message(&self, handle: DeliveryHandle) -> Result<()> {
        self.relay.delete(handle)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::core::opcode::OpCode;

    #[tokio::test]
    async fn test_post_reaches_every_endpoint() {
        let relay = MemoryRelay::new();
        let a = relay.endpoint();
        let b = relay.endpoint();
        let mut rx_a = a.connect().await.unwrap();
        let mut rx_b = b.connect().await.unwrap();

        let packet = Packet::builder(OpCode::Data).author("a").data("hi").build();
        let handle = a.send_raw(a.encode(&packet).unwrap()).await.unwrap();

        for rx in [&mut rx_a, &mut rx_b] {
            let raw = rx.recv().await.unwrap();
            assert_eq!(raw.handle, handle);
            let decoded = a.decode(&raw).unwrap();
            assert_eq!(decoded.seq(), packet.seq());
            assert_eq!(decoded.delivery(), Some(handle));
        }
    }

    #[tokio::test]
    async fn test_delete_unknown_message_fails() {
        let relay = MemoryRelay::new();
        let endpoint = relay.endpoint();
        let handle = relay.post(Bytes::from_static(b"hello")).unwrap();

        endpoint.delete_message(handle).await.unwrap();
        assert!(matches!(
            endpoint.delete_message(handle).await,
            Err(ProtocolError::MessageNotFound(_))
        ));
        assert_eq!(relay.deletions(), 1);
        assert!(relay.messages().is_empty());
    }

    #[tokio::test]
    async fn test_failing_relay_rejects_posts() {
        let relay = MemoryRelay::new();
        relay.fail_sends(true);
        let endpoint = relay.endpoint();
        assert!(endpoint.send_raw(Bytes::from_static(b"x")).await.is_err());
        relay.fail_sends(false);
        assert!(endpoint.send_raw(Bytes::from_static(b"x")).await.is_ok());
    }
}
