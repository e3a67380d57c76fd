//! TCP relay hub.
//!
//! Accepts any number of [`TcpTransport`](crate::transport::tcp::TcpTransport)
//! connections and writes every line it receives to all of them, the sender
//! included. Lines are relayed as-is; the hub never parses packets.

use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};

use crate::core::codec::LineCodec;
use crate::error::Result;

const FANOUT_CAPACITY: usize = 4096;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

pub struct RelayServer {
    listener: TcpListener,
    fanout: broadcast::Sender<bytes::Bytes>,
}

impl RelayServer {
    pub async fn bind(address: &str) -> Result<Self> {
        let listener = TcpListener::bind(address).await?;
        let (fanout, _) = broadcast::channel(FANOUT_CAPACITY);
        Ok(Self { listener, fanout })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until Ctrl-C.
    pub async fn run_until_ctrl_c(self) -> Result<()> {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);

        tokio::spawn(async move {
            if let Ok(()) = tokio::signal::ctrl_c().await {
                info!("Received CTRL+C signal, shutting down");
                let _ = shutdown_tx.send(()).await;
            }
        });

        self.run(shutdown_rx).await
    }

    /// Serve until a message arrives on `shutdown_rx` or every sender is
    /// dropped.
    #[instrument(skip_all, fields(address = ?self.listener.local_addr().ok()))]
    pub async fn run(self, mut shutdown_rx: mpsc::Receiver<()>) -> Result<()> {
        info!("relay hub listening");
        let token = CancellationToken::new();
        let connections = TaskTracker::new();

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!(connections = connections.len(), "Shutting down relay hub. Waiting for connections to close...");
                    token.cancel();
                    connections.close();

                    if tokio::time::timeout(SHUTDOWN_GRACE, connections.wait()).await.is_err() {
                        warn!("Shutdown timeout reached, forcing exit");
                    } else {
                        info!("All connections closed, shutting down");
                    }
                    return Ok(());
                }

                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            // Subscribe before reading so the sender sees its own first line
                            let outbound = self.fanout.subscribe();
                            let inbound = self.fanout.clone();
                            let token = token.clone();
                            connections.spawn(async move {
                                relay_connection(stream, peer, inbound, outbound, token).await;
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Error accepting connection");
                        }
                    }
                }
            }
        }
    }
}

async fn relay_connection(
    stream: TcpStream,
    peer: SocketAddr,
    inbound: broadcast::Sender<bytes::Bytes>,
    mut outbound: broadcast::Receiver<bytes::Bytes>,
    token: CancellationToken,
) {
    debug!(%peer, "host connected");
    if let Err(e) = stream.set_nodelay(true) {
        debug!(%peer, error = %e, "could not disable nagle");
    }
    let (mut sink, mut lines) = Framed::new(stream, LineCodec::new()).split();

    loop {
        tokio::select! {
            _ = token.cancelled() => break,

            line = lines.next() => match line {
                Some(Ok(line)) => {
                    // At least this connection is subscribed
                    let _ = inbound.send(line);
                }
                Some(Err(e)) => {
                    warn!(%peer, error = %e, "dropping connection");
                    break;
                }
                None => break,
            },

            relayed = outbound.recv() => match relayed {
                Ok(line) => {
                    if let Err(e) = sink.send(line).await {
                        debug!(%peer, error = %e, "write failed");
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(%peer, skipped, "host lagged, lines lost");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    let _ = sink.close().await;
    debug!(%peer, "host disconnected");
}
