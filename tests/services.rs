//! Services loaded into a client

#![allow(clippy::expect_used, clippy::unwrap_used)]

use async_trait::async_trait;
use once_cell::sync::OnceCell;
use relaynet::config::DiscoveryConfig;
use relaynet::service::tcp::{ConnectionHandler, TcpServer};
use relaynet::{
    tags, Client, ClientHandle, Handler, ListenerKey, MemoryRelay, OpCode, Packet, Service,
    State,
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

fn discovery() -> DiscoveryConfig {
    DiscoveryConfig {
        max_steps: 1,
        ..DiscoveryConfig::default()
    }
}

/// Answers every Data packet addressed to it with "pong".
struct Pinger {
    handle: ClientHandle,
    answered: AtomicUsize,
}

impl Service for Pinger {
    fn name(&self) -> &str {
        "pinger"
    }

    fn listeners(self: Arc<Self>) -> Vec<(ListenerKey, Handler)> {
        let on_data = Handler::packet(move |packet: Packet| {
            let this = Arc::clone(&self);
            async move {
                this.answered.fetch_add(1, Ordering::SeqCst);
                this.handle
                    .send_packet(packet.response(OpCode::Data, "pong", Some(30)))
                    .await?;
                Ok(())
            }
        });
        vec![(ListenerKey::Op(OpCode::Data), on_data)]
    }
}

#[tokio::test(start_paused = true)]
async fn test_service_answers_through_handle() {
    let relay = MemoryRelay::new();
    let pinger: Arc<OnceCell<Arc<Pinger>>> = Arc::new(OnceCell::new());

    let slot = Arc::clone(&pinger);
    let alpha = Client::builder(relay.endpoint())
        .hostname("alpha")
        .discovery(discovery())
        .service(move |handle| {
            let service = Arc::new(Pinger {
                handle,
                answered: AtomicUsize::new(0),
            });
            let _ = slot.set(Arc::clone(&service));
            service as Arc<dyn Service>
        })
        .build()
        .unwrap();
    let beta = Client::builder(relay.endpoint())
        .hostname("beta")
        .discovery(discovery())
        .build()
        .unwrap();

    alpha.start().await.unwrap();
    beta.start().await.unwrap();
    assert_eq!(alpha.services().len(), 1);
    assert_eq!(alpha.services()[0].name(), "pinger");

    let pongs = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&pongs);
    beta.listeners()
        .register(
            OpCode::Data,
            Handler::packet(move |packet: Packet| {
                let seen = Arc::clone(&seen);
                async move {
                    assert_eq!(packet.author(), "alpha");
                    assert_eq!(packet.recipient(), Some("beta"));
                    seen.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
        )
        .unwrap();

    beta.send_packet(beta.packet(OpCode::Data).to("alpha").data("ping"))
        .await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(pinger.get().unwrap().answered.load(Ordering::SeqCst), 1);
    assert_eq!(pongs.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_lifecycle_tags_in_order() {
    let relay = MemoryRelay::new();
    let order = Arc::new(std::sync::Mutex::new(Vec::new()));

    let mut builder = Client::builder(relay.endpoint())
        .hostname("alpha")
        .discovery(discovery());
    for tag in [tags::STARTING, tags::CONNECTED, tags::ALIVE] {
        let order = Arc::clone(&order);
        builder = builder.listener(
            ListenerKey::tag(tag),
            Handler::signal(move || {
                order.lock().unwrap().push(tag);
                async { Ok(()) }
            }),
        );
    }
    let alpha = builder.build().unwrap();

    alpha.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(
        *order.lock().unwrap(),
        vec![tags::STARTING, tags::CONNECTED, tags::ALIVE]
    );
}

struct Echo;

#[async_trait]
impl ConnectionHandler for Echo {
    async fn on_connection(&self, mut stream: TcpStream, _peer: SocketAddr) -> relaynet::Result<()> {
        let mut buf = [0u8; 64];
        let n = stream.read(&mut buf).await?;
        stream.write_all(&buf[..n]).await?;
        Ok(())
    }
}

#[tokio::test]
async fn test_tcp_server_runs_while_client_lives() {
    let relay = MemoryRelay::new();
    let server: Arc<OnceCell<Arc<TcpServer<Echo>>>> = Arc::new(OnceCell::new());

    let slot = Arc::clone(&server);
    let alpha = Client::builder(relay.endpoint())
        .hostname("alpha")
        .discovery(discovery())
        .service(move |handle| {
            let service = Arc::new(TcpServer::new(handle, Echo).with_address("127.0.0.1:0"));
            let _ = slot.set(Arc::clone(&service));
            service as Arc<dyn Service>
        })
        .build()
        .unwrap();

    alpha.start().await.unwrap();
    assert_eq!(alpha.state(), State::Alive);

    let server = server.get().unwrap();
    let addr = server.local_addr().expect("server should be bound by now");

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(b"hello").await.unwrap();
    let mut buf = [0u8; 5];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hello");

    alpha.shutdown().await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(TcpStream::connect(addr).await.is_err());
}
