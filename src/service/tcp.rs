//! TCP server capability for services.
//!
//! A [`TcpServer`] is an ordinary [`Service`]: it listens for the `starting`
//! tag, binds its address and hands every accepted connection to a
//! [`ConnectionHandler`]. The accept loop and each connection run as client
//! tasks, so they stop when the client shuts down.

use async_trait::async_trait;
use once_cell::sync::OnceCell;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, instrument, warn};

use crate::error::Result;
use crate::protocol::context::ClientHandle;
use crate::protocol::registry::{tags, Handler, ListenerKey};
use crate::service::Service;

/// Address a [`TcpServer`] binds unless told otherwise
pub const DEFAULT_ADDRESS: &str = "127.0.0.1:1234";

/// Pause after a failed accept before trying again
pub const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

#[async_trait]
pub trait ConnectionHandler: Send + Sync + 'static {
    async fn on_connection(&self, stream: TcpStream, peer: SocketAddr) -> Result<()>;
}

pub struct TcpServer<H> {
    handle: ClientHandle,
    handler: Arc<H>,
    address: String,
    bound: OnceCell<SocketAddr>,
}

impl<H: ConnectionHandler> TcpServer<H> {
    pub fn new(handle: ClientHandle, handler: H) -> Self {
        Self {
            handle,
            handler: Arc::new(handler),
            address: DEFAULT_ADDRESS.to_string(),
            bound: OnceCell::new(),
        }
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// The bound address, once serving.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.bound.get().copied()
    }

    pub fn handler(&self) -> &Arc<H> {
        &self.handler
    }

    /// Accept connections until the client goes away.
    #[instrument(skip(self), fields(address = %self.address))]
    pub async fn serve(self: Arc<Self>) -> Result<()> {
        let listener = TcpListener::bind(&self.address).await?;
        let addr = listener.local_addr()?;
        // Only the first serve call records its address
        let _ = self.bound.set(addr);
        info!(%addr, "tcp service listening");

        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    if self.accept_failed(e).await {
                        continue;
                    }
                    debug!("client gone, closing tcp service");
                    return Ok(());
                }
            };

            let Ok(client) = self.handle.upgrade() else {
                debug!("client gone, closing tcp service");
                return Ok(());
            };

            debug!(%peer, "accepted connection");
            let handler = Arc::clone(&self.handler);
            client.spawn("tcp-connection", async move {
                if let Err(e) = handler.on_connection(stream, peer).await {
                    warn!(%peer, error = %e, "connection handler failed");
                }
            });
        }
    }
}

impl<H> TcpServer<H> {
    /// Back off after an accept error. False once the client is gone.
    async fn accept_failed(&self, e: std::io::Error) -> bool {
        error!(error = %e, "Error accepting connection");
        if self.handle.upgrade().is_err() {
            return false;
        }
        tokio::time::sleep(ACCEPT_BACKOFF).await;
        true
    }
}

impl<H: ConnectionHandler> Service for TcpServer<H> {
    fn name(&self) -> &str {
        "tcp-server"
    }

    fn listeners(self: Arc<Self>) -> Vec<(ListenerKey, Handler)> {
        let on_starting = Handler::signal(move || Arc::clone(&self).serve());
        vec![(ListenerKey::tag(tags::STARTING), on_starting)]
    }
}
