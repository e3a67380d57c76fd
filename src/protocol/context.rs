//! Non-owning references to clients.
//!
//! Packets and services refer to their client by [`ClientId`]. The id is
//! resolved through a process-wide table of weak references, so neither can
//! keep a client alive or form a reference cycle with it.

use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};

use crate::core::packet::{Packet, PacketBuilder};
use crate::error::{ProtocolError, Result};
use crate::protocol::client::{Client, ClientInner};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

static CLIENTS: Lazy<RwLock<HashMap<ClientId, Weak<ClientInner>>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(u64);

impl ClientId {
    pub(crate) fn next() -> Self {
        ClientId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

pub(crate) fn register(id: ClientId, inner: &Arc<ClientInner>) {
    CLIENTS
        .write()
        .unwrap_or_else(|e| e.into_inner())
        .insert(id, Arc::downgrade(inner));
}

pub(crate) fn unregister(id: ClientId) {
    CLIENTS
        .write()
        .unwrap_or_else(|e| e.into_inner())
        .remove(&id);
}

/// Look up a live client.
pub fn resolve(id: ClientId) -> Option<Client> {
    CLIENTS
        .read()
        .unwrap_or_else(|e| e.into_inner())
        .get(&id)
        .and_then(Weak::upgrade)
        .map(Client::from_inner)
}

/// What services hold instead of the client itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientHandle {
    id: ClientId,
}

impl ClientHandle {
    pub(crate) fn new(id: ClientId) -> Self {
        Self { id }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn upgrade(&self) -> Result<Client> {
        resolve(self.id).ok_or(ProtocolError::ClientGone)
    }

    pub fn is_alive(&self) -> bool {
        resolve(self.id).is_some_and(|client| client.is_alive())
    }

    pub async fn send_packet(&self, builder: PacketBuilder) -> Result<Packet> {
        let client = self.upgrade()?;
        Ok(client.send_packet(builder).await)
    }

    pub async fn send_packet_with_ack<F, Fut>(&self, builder: PacketBuilder, on_ack: F) -> Result<Packet>
    where
        F: FnOnce(Packet) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let client = self.upgrade()?;
        client.send_packet_with_ack(builder, on_ack).await
    }
}
