//! # Packets
//!
//! A [`Packet`] is the envelope every host exchanges over the relay. It is
//! immutable once built: routing, payload and expiry are fixed by the
//! [`PacketBuilder`], and only relay bookkeeping (the delivery handle and the
//! owning client) is attached afterwards.
//!
//! Packets built by a client, or decoded by its reader task, carry a
//! non-owning [`ClientId`] so that `send`, `respond`, `ack` and `collect` can
//! reach the client without the packet keeping it alive.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::{MAX_PAYLOAD_SIZE, MIN_PAYLOAD_LEN};
use crate::core::opcode::OpCode;
use crate::core::sequence::SequenceAllocator;
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::client::Client;
use crate::protocol::context::{self, ClientId};
use crate::utils::host::local_hostname;
use crate::utils::time::{now_secs, until};

/// Relay-assigned identifier of the message a packet travelled in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeliveryHandle(pub u64);

impl fmt::Display for DeliveryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub struct Packet {
    seq: u64,
    op: OpCode,
    author: String,
    recipient: Option<String>,
    data: Value,
    ttl: Option<u64>,
    timestamp: u64,
    delivery: Option<DeliveryHandle>,
    context: Option<ClientId>,
    // Shared by clones so collection happens once per packet
    collected: Arc<AtomicBool>,
}

impl Packet {
    pub fn builder(op: OpCode) -> PacketBuilder {
        PacketBuilder::new(op)
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn op(&self) -> OpCode {
        self.op
    }

    pub fn author(&self) -> &str {
        &self.author
    }

    /// `None` means the packet is a broadcast.
    pub fn recipient(&self) -> Option<&str> {
        self.recipient.as_deref()
    }

    pub fn data(&self) -> &Value {
        &self.data
    }

    pub fn ttl(&self) -> Option<u64> {
        self.ttl
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn delivery(&self) -> Option<DeliveryHandle> {
        self.delivery
    }

    pub fn context(&self) -> Option<ClientId> {
        self.context
    }

    /// True iff the packet has a ttl at all.
    pub fn expires(&self) -> bool {
        self.ttl.is_some()
    }

    /// True iff a ttl is set and `timestamp + ttl` has been reached.
    pub fn expired(&self) -> bool {
        self.expired_at(now_secs())
    }

    pub fn expired_at(&self, now: u64) -> bool {
        self.ttl
            .is_some_and(|ttl| now >= self.timestamp.saturating_add(ttl))
    }

    /// Epoch second at which the packet expires, if it ever does.
    pub fn deadline(&self) -> Option<u64> {
        self.ttl.map(|ttl| self.timestamp.saturating_add(ttl))
    }

    pub fn is_broadcast(&self) -> bool {
        self.recipient.is_none()
    }

    /// Broadcasts are addressed to every host.
    pub fn addressed_to(&self, host: &str) -> bool {
        self.recipient.as_deref().map_or(true, |r| r == host)
    }

    pub fn is_collected(&self) -> bool {
        self.collected.load(Ordering::SeqCst)
    }

    pub fn with_context(mut self, id: ClientId) -> Self {
        self.context = Some(id);
        self
    }

    pub fn with_delivery(mut self, handle: DeliveryHandle) -> Self {
        self.delivery = Some(handle);
        self
    }

    /// Decode a packet from its JSON body.
    ///
    /// The body must be at least [`MIN_PAYLOAD_LEN`] bytes and carry every
    /// wire field (`op`, `d`, `f`, `t`, `ts`, `ttl`, `s`). `t` and `ttl` may
    /// be null but not absent.
    pub fn decode(body: &[u8]) -> Result<Self> {
        if body.len() < MIN_PAYLOAD_LEN {
            return Err(ProtocolError::InvalidPacket(
                constants::ERR_PAYLOAD_TOO_SHORT.into(),
            ));
        }
        if body.len() > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::OversizedPacket(body.len()));
        }
        let text = std::str::from_utf8(body)
            .map_err(|_| ProtocolError::InvalidPacket(constants::ERR_NOT_UTF8.into()))?;
        let wire: WirePacket = serde_json::from_str(text)
            .map_err(|e| ProtocolError::InvalidPacket(e.to_string()))?;
        Self::from_wire(wire)
    }

    /// Encode for sending. The wire timestamp is the current time, not the
    /// timestamp the packet was built with.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let bytes = serde_json::to_vec(&self.wire(now_secs()))?;
        if bytes.len() > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::OversizedPacket(bytes.len()));
        }
        Ok(bytes)
    }

    /// Wire form keeping the stored timestamp, used inside stack snapshots.
    pub fn to_wire_value(&self) -> Result<Value> {
        Ok(serde_json::to_value(self.wire(self.timestamp))?)
    }

    pub fn from_wire_value(value: Value) -> Result<Self> {
        let wire: WirePacket = serde_json::from_value(value)
            .map_err(|e| ProtocolError::InvalidPacket(e.to_string()))?;
        Self::from_wire(wire)
    }

    fn wire(&self, ts: u64) -> WirePacket {
        WirePacket {
            op: self.op.code(),
            d: self.data.clone(),
            f: self.author.clone(),
            t: self.recipient.clone(),
            ts,
            ttl: self.ttl,
            s: self.seq,
        }
    }

    fn from_wire(wire: WirePacket) -> Result<Self> {
        Ok(Self {
            seq: wire.s,
            op: OpCode::try_from(wire.op)?,
            author: wire.f,
            recipient: wire.t,
            data: wire.d,
            ttl: wire.ttl,
            timestamp: wire.ts,
            delivery: None,
            context: None,
            collected: Arc::new(AtomicBool::new(false)),
        })
    }

    fn client(&self) -> Result<Client> {
        self.context
            .and_then(context::resolve)
            .ok_or(ProtocolError::ClientGone)
    }

    /// Hand the packet to the owning client's transport.
    ///
    /// Transport failures are reported on the `error` broadcast tag and
    /// yield `Ok(None)`; only a missing client is returned as an error.
    pub async fn send(&self) -> Result<Option<DeliveryHandle>> {
        let client = self.client()?;
        Ok(client.transmit(self).await)
    }

    /// Build a reply addressed to this packet's author. The reply gets a fresh
    /// seq when it is built.
    pub fn response(&self, op: OpCode, data: impl Into<Value>, ttl: Option<u64>) -> PacketBuilder {
        let builder = PacketBuilder::new(op)
            .to(self.author.clone())
            .data(data)
            .ttl(ttl);
        match self.context {
            Some(id) => builder.context(id),
            None => builder,
        }
    }

    /// Build and send a reply addressed to this packet's author.
    pub async fn respond(
        &self,
        op: OpCode,
        data: impl Into<Value>,
        ttl: Option<u64>,
    ) -> Result<Packet> {
        let client = self.client()?;
        Ok(client.send_packet(self.response(op, data, ttl)).await)
    }

    /// Acknowledge this packet. The Ack echoes this packet's seq so the
    /// sender can correlate it.
    pub async fn ack(&self, data: impl Into<Value>) -> Result<Packet> {
        let client = self.client()?;
        let builder = PacketBuilder::new(OpCode::Ack)
            .to(self.author.clone())
            .data(data)
            .seq(self.seq);
        Ok(client.send_packet(builder).await)
    }

    /// Delete the relay message once the packet has expired.
    ///
    /// Only the first call on a packet (or any clone of it) does anything.
    /// Deletion failures are logged and counted, never returned.
    pub async fn collect(&self) {
        let Some(deadline) = self.deadline() else {
            return;
        };
        if self.collected.swap(true, Ordering::SeqCst) {
            return;
        }

        tokio::time::sleep(until(deadline)).await;

        let Some(handle) = self.delivery else {
            debug!(seq = self.seq, "no relay message to collect");
            return;
        };
        let Some(client) = self.context.and_then(context::resolve) else {
            debug!(seq = self.seq, "client gone before collection");
            return;
        };

        match client.transport().delete_message(handle).await {
            Ok(()) => {
                client.metrics().packet_collected();
                debug!(seq = self.seq, %handle, "collected expired packet");
            }
            Err(e) => {
                client.metrics().collect_failed();
                warn!(seq = self.seq, %handle, error = %e, "failed to clean up packet");
            }
        }
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<Packet seq={} op={} from={:?} to={:?}",
            self.seq, self.op, self.author, self.recipient
        )?;
        if let Some(ttl) = self.ttl {
            write!(f, " ttl={ttl}")?;
        }
        f.write_str(">")
    }
}

/// Builder for [`Packet`].
///
/// Unset fields get defaults at [`build`](Self::build): the author is the
/// local hostname, the timestamp is now, and the seq is taken from the
/// process allocator. Packets sent through a client are bound to that
/// client's hostname and allocator instead.
#[derive(Debug, Clone)]
pub struct PacketBuilder {
    op: OpCode,
    author: Option<String>,
    recipient: Option<String>,
    data: Value,
    ttl: Option<u64>,
    timestamp: Option<u64>,
    seq: Option<u64>,
    allocator: Option<Arc<SequenceAllocator>>,
    context: Option<ClientId>,
}

impl PacketBuilder {
    pub fn new(op: OpCode) -> Self {
        Self {
            op,
            author: None,
            recipient: None,
            data: Value::Null,
            ttl: None,
            timestamp: None,
            seq: None,
            allocator: None,
            context: None,
        }
    }

    /// Start from a raw op code, failing with `InvalidOpCode` if unknown.
    pub fn from_raw_op(op: i64) -> Result<Self> {
        Ok(Self::new(OpCode::try_from(op)?))
    }

    pub fn op(&self) -> OpCode {
        self.op
    }

    pub fn author(mut self, author: impl Into<String>) -> Self {
        self.author = Some(author.into());
        self
    }

    /// Address the packet to a single host.
    pub fn to(mut self, host: impl Into<String>) -> Self {
        self.recipient = Some(host.into());
        self
    }

    pub fn recipient(mut self, recipient: Option<String>) -> Self {
        self.recipient = recipient;
        self
    }

    pub fn data(mut self, data: impl Into<Value>) -> Self {
        self.data = data.into();
        self
    }

    pub fn ttl(mut self, ttl: impl Into<Option<u64>>) -> Self {
        self.ttl = ttl.into();
        self
    }

    pub fn timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Carry an explicit seq instead of allocating one.
    pub fn seq(mut self, seq: u64) -> Self {
        self.seq = Some(seq);
        self
    }

    pub fn allocator(mut self, allocator: Arc<SequenceAllocator>) -> Self {
        self.allocator = Some(allocator);
        self
    }

    pub fn context(mut self, id: ClientId) -> Self {
        self.context = Some(id);
        self
    }

    /// Fill in whatever the caller left unset from the sending client.
    pub(crate) fn bind(mut self, hostname: &str, allocator: &Arc<SequenceAllocator>, id: ClientId) -> Self {
        if self.author.is_none() {
            self.author = Some(hostname.to_string());
        }
        if self.allocator.is_none() {
            self.allocator = Some(Arc::clone(allocator));
        }
        self.context = Some(id);
        self
    }

    pub fn build(self) -> Packet {
        let seq = match self.seq {
            Some(seq) => seq,
            None => self
                .allocator
                .unwrap_or_else(SequenceAllocator::process)
                .next(),
        };

        Packet {
            seq,
            op: self.op,
            author: self
                .author
                .unwrap_or_else(|| local_hostname().to_string()),
            recipient: self.recipient,
            data: self.data,
            ttl: self.ttl,
            timestamp: self.timestamp.unwrap_or_else(now_secs),
            delivery: None,
            context: self.context,
            collected: Arc::new(AtomicBool::new(false)),
        }
    }
}

/// JSON object exchanged over the relay. Field order is the wire order.
#[derive(Debug, Serialize, Deserialize)]
struct WirePacket {
    op: i64,
    d: Value,
    f: String,
    #[serde(deserialize_with = "nullable")]
    t: Option<String>,
    #[serde(with = "timestamp_serde")]
    ts: u64,
    #[serde(deserialize_with = "nullable")]
    ttl: Option<u64>,
    s: u64,
}

/// Required field whose value may be null.
fn nullable<'de, D, T>(deserializer: D) -> std::result::Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer)
}

/// Timestamps travel as decimal strings; integers are accepted on input.
mod timestamp_serde {
    use super::*;
    use serde::de::Error;

    pub fn serialize<S>(ts: &u64, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&ts.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> std::result::Result<u64, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Value::deserialize(deserializer)? {
            Value::String(s) => s
                .trim()
                .parse::<u64>()
                .map_err(|_| D::Error::custom(constants::ERR_BAD_TIMESTAMP)),
            Value::Number(n) => n
                .as_u64()
                .ok_or_else(|| D::Error::custom(constants::ERR_BAD_TIMESTAMP)),
            _ => Err(D::Error::custom(constants::ERR_BAD_TIMESTAMP)),
        }
    }
}
