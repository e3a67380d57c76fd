//! # Transport Layer
//!
//! A [`Transport`] is the relay-specific half of a client. It posts encoded
//! packets to the relay, streams every relay message back, and deletes
//! messages once their packets expire.
//!
//! ## Backends
//! - **Memory**: in-process chat-channel relay ([`memory`]), for tests and demos
//! - **TCP**: line-delimited JSON through a relay hub ([`tcp`], [`relay_server`])
//!
//! [`backend::open`] picks a backend from configuration.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::core::codec::Framing;
use crate::core::packet::{DeliveryHandle, Packet};
use crate::error::Result;

pub mod backend;
pub mod memory;
pub mod relay_server;
pub mod tcp;

/// Capacity of the channel a transport feeds relay messages into
pub const INBOUND_CHANNEL_CAPACITY: usize = 1024;

/// One message as the relay delivered it.
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub handle: DeliveryHandle,
    pub body: Bytes,
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn framing(&self) -> Framing;

    /// Connect to the relay. Every message the relay carries from now on,
    /// including this transport's own posts, arrives on the receiver.
    async fn connect(&self) -> Result<mpsc::Receiver<RawMessage>>;

    /// Post an already framed message.
    async fn send_raw(&self, message: Bytes) -> Result<DeliveryHandle>;

    /// Remove a message from the relay.
    async fn delete_message(&self, handle: DeliveryHandle) -> Result<()>;

    fn encode(&self, packet: &Packet) -> Result<Bytes> {
        Ok(self.framing().wrap(&packet.encode()?))
    }

    fn decode(&self, raw: &RawMessage) -> Result<Packet> {
        let body = self.framing().unwrap(&raw.body)?;
        Ok(Packet::decode(body)?.with_delivery(raw.handle))
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
