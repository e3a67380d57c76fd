//! Built-in service that logs every packet dispatched to the client.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::info;

use crate::core::packet::Packet;
use crate::protocol::context::ClientHandle;
use crate::protocol::registry::{tags, Handler, ListenerKey};
use crate::service::Service;

#[derive(Debug)]
pub struct PacketLog {
    handle: ClientHandle,
    seen: AtomicU64,
}

impl PacketLog {
    pub fn new(handle: ClientHandle) -> Self {
        Self {
            handle,
            seen: AtomicU64::new(0),
        }
    }

    /// Factory for [`ServiceSet`](crate::service::ServiceSet) and
    /// [`ClientBuilder::service`](crate::protocol::client::ClientBuilder::service).
    pub fn factory(handle: ClientHandle) -> Arc<dyn Service> {
        Arc::new(Self::new(handle))
    }

    pub fn seen(&self) -> u64 {
        self.seen.load(Ordering::Relaxed)
    }

    fn record(&self, packet: &Packet) {
        let seen = self.seen.fetch_add(1, Ordering::Relaxed) + 1;
        info!(
            client = %self.handle.id(),
            seen,
            op = %packet.op(),
            from = %packet.author(),
            data = %packet.data(),
            "{packet}"
        );
    }
}

impl Service for PacketLog {
    fn name(&self) -> &str {
        "packet-log"
    }

    fn listeners(self: Arc<Self>) -> Vec<(ListenerKey, Handler)> {
        let packets = {
            let this = Arc::clone(&self);
            Handler::packet(move |packet: Packet| {
                this.record(&packet);
                async { Ok(()) }
            })
        };
        let alive = Handler::signal(move || {
            let members = self
                .handle
                .upgrade()
                .map(|client| client.members())
                .unwrap_or_default();
            info!(?members, "joined network");
            async { Ok(()) }
        });
        vec![
            (ListenerKey::Any, packets),
            (ListenerKey::tag(tags::ALIVE), alive),
        ]
    }
}
