// Client scenarios over the in-process relay. Time is paused, so discovery
// timeouts and packet expiry elapse instantly once every task is idle.
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::DiscoveryConfig;
use crate::core::opcode::OpCode;
use crate::core::packet::Packet;
use crate::error::ProtocolError;
use crate::protocol::client::{Client, State};
use crate::protocol::network::StackSnapshot;
use crate::protocol::registry::{tags, Handler, ListenerKey};
use crate::transport::memory::MemoryRelay;

fn quick() -> DiscoveryConfig {
    DiscoveryConfig {
        max_steps: 2,
        ..DiscoveryConfig::default()
    }
}

fn client(relay: &MemoryRelay, host: &str) -> Client {
    Client::builder(relay.endpoint())
        .hostname(host)
        .discovery(quick())
        .build()
        .unwrap()
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

fn counter() -> (Arc<AtomicUsize>, Handler) {
    let hits = Arc::new(AtomicUsize::new(0));
    let inner = Arc::clone(&hits);
    let handler = Handler::new(move |_| {
        let inner = Arc::clone(&inner);
        async move {
            inner.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    });
    (hits, handler)
}

/// Start a client in the background and wait until it is discovering.
async fn start_in_background(client: &Client) -> tokio::task::JoinHandle<crate::error::Result<()>> {
    let task = tokio::spawn({
        let client = client.clone();
        async move { client.start().await }
    });
    client.wait_for_state(State::Discovery).await.unwrap();
    task
}

#[tokio::test(start_paused = true)]
async fn test_lone_host_founds_network() {
    let relay = MemoryRelay::new();
    let (alive_signals, on_alive) = counter();
    let alpha = Client::builder(relay.endpoint())
        .hostname("alpha")
        .discovery(quick())
        .listener(ListenerKey::tag(tags::ALIVE), on_alive)
        .build()
        .unwrap();

    alpha.start().await.unwrap();
    settle().await;

    assert_eq!(alpha.state(), State::Alive);
    assert_eq!(alpha.members(), vec!["alpha"]);
    assert!(relay.data_of(OpCode::Sync).is_empty());
    assert_eq!(relay.data_of(OpCode::Alive).len(), 1);
    assert_eq!(alive_signals.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_two_node_bootstrap() {
    let relay = MemoryRelay::new();
    let alpha = client(&relay, "alpha");
    let beta = client(&relay, "beta");

    alpha.start().await.unwrap();
    beta.start().await.unwrap();
    settle().await;

    assert_eq!(beta.state(), State::Alive);
    assert_eq!(beta.members(), vec!["alpha", "beta"]);
    assert_eq!(alpha.members(), vec!["alpha", "beta"]);

    let hellos: Vec<Packet> = relay
        .packets()
        .into_iter()
        .filter(|p| p.op() == OpCode::Hello)
        .collect();
    assert_eq!(hellos.len(), 1);
    assert_eq!(hellos[0].author(), "alpha");
    assert_eq!(hellos[0].recipient(), Some("beta"));
    let snapshot = StackSnapshot::from_value(hellos[0].data()).unwrap();
    assert_eq!(snapshot.members, vec!["alpha"]);
}

#[tokio::test(start_paused = true)]
async fn test_only_head_greets() {
    let relay = MemoryRelay::new();
    let alpha = client(&relay, "alpha");
    let beta = client(&relay, "beta");
    let gamma = client(&relay, "gamma");

    alpha.start().await.unwrap();
    beta.start().await.unwrap();
    gamma.start().await.unwrap();
    settle().await;

    let expected = vec!["alpha", "beta", "gamma"];
    assert_eq!(alpha.members(), expected);
    assert_eq!(beta.members(), expected);
    assert_eq!(gamma.members(), expected);

    let greeters: Vec<String> = relay
        .packets()
        .into_iter()
        .filter(|p| p.op() == OpCode::Hello)
        .map(|p| p.author().to_string())
        .collect();
    assert_eq!(greeters, vec!["alpha", "beta"]);
    assert_eq!(gamma.head().as_deref(), Some("gamma"));
}

#[tokio::test(start_paused = true)]
async fn test_backlog_replayed_on_timeout() {
    let relay = MemoryRelay::new();
    let beta = client(&relay, "beta");
    let discovering = start_in_background(&beta).await;

    relay
        .post_packet(&Packet::builder(OpCode::Alive).author("gamma").ttl(60).build())
        .unwrap();
    relay
        .post_packet(&Packet::builder(OpCode::Data).author("delta").data("hi").build())
        .unwrap();
    settle().await;
    assert_eq!(beta.backlog_len(), 2);

    discovering.await.unwrap().unwrap();
    settle().await;

    assert_eq!(beta.state(), State::Alive);
    assert_eq!(beta.members(), vec!["gamma", "beta"]);
    assert_eq!(beta.metrics().snapshot().packets_backlogged, 2);

    let syncs = relay.data_of(OpCode::Sync);
    assert_eq!(syncs.len(), 1);
    let snapshot = StackSnapshot::from_value(&syncs[0]).unwrap();
    assert_eq!(snapshot.members, vec!["gamma", "beta"]);
}

#[tokio::test(start_paused = true)]
async fn test_sync_replaces_stack_during_discovery() {
    let relay = MemoryRelay::new();
    let beta = client(&relay, "beta");
    let discovering = start_in_background(&beta).await;

    relay
        .post_packet(
            &Packet::builder(OpCode::Sync)
                .author("omega")
                .data(json!({"s": ["omega", "sigma"], "b": []}))
                .build(),
        )
        .unwrap();

    discovering.await.unwrap().unwrap();
    assert_eq!(beta.state(), State::Alive);
    assert_eq!(beta.members(), vec!["omega", "sigma", "beta"]);
    assert_eq!(beta.backlog_len(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_sync_ignored_while_alive() {
    let relay = MemoryRelay::new();
    let alpha = client(&relay, "alpha");
    alpha.start().await.unwrap();

    relay
        .post_packet(
            &Packet::builder(OpCode::Sync)
                .author("omega")
                .data(json!({"members": ["omega"], "backlog": []}))
                .build(),
        )
        .unwrap();
    settle().await;

    assert_eq!(alpha.members(), vec!["alpha"]);
}

#[tokio::test(start_paused = true)]
async fn test_dead_removes_member_and_passes_head() {
    let relay = MemoryRelay::new();
    let alpha = client(&relay, "alpha");
    let beta = client(&relay, "beta");
    let gamma = client(&relay, "gamma");
    alpha.start().await.unwrap();
    beta.start().await.unwrap();
    gamma.start().await.unwrap();
    settle().await;
    assert_eq!(alpha.head().as_deref(), Some("gamma"));

    gamma.shutdown().await;
    settle().await;

    assert_eq!(gamma.state(), State::Dead);
    assert_eq!(alpha.members(), vec!["alpha", "beta"]);
    assert_eq!(beta.members(), vec!["alpha", "beta"]);
    assert_eq!(alpha.head().as_deref(), Some("beta"));

    let delta = client(&relay, "delta");
    delta.start().await.unwrap();
    settle().await;

    assert_eq!(delta.members(), vec!["alpha", "beta", "delta"]);
    let last_hello = relay
        .packets()
        .into_iter()
        .filter(|p| p.op() == OpCode::Hello)
        .last()
        .unwrap();
    assert_eq!(last_hello.author(), "beta");
    assert_eq!(last_hello.recipient(), Some("delta"));
}

#[tokio::test(start_paused = true)]
async fn test_dead_naming_local_host_ignored() {
    let relay = MemoryRelay::new();
    let alpha = client(&relay, "alpha");
    alpha.start().await.unwrap();

    relay
        .post_packet(&Packet::builder(OpCode::Dead).author("beta").data("alpha").build())
        .unwrap();
    settle().await;

    assert_eq!(alpha.state(), State::Alive);
    assert_eq!(alpha.members(), vec!["alpha"]);
    assert_eq!(alpha.head().as_deref(), Some("alpha"));

    let gamma = client(&relay, "gamma");
    gamma.start().await.unwrap();
    settle().await;

    assert_eq!(relay.data_of(OpCode::Hello).len(), 1);
    assert_eq!(gamma.members(), vec!["alpha", "gamma"]);
    assert_eq!(alpha.members(), vec!["alpha", "gamma"]);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_announces_departure_once() {
    let relay = MemoryRelay::new();
    let alpha = client(&relay, "alpha");
    alpha.start().await.unwrap();

    alpha.shutdown().await;
    alpha.shutdown().await;

    assert_eq!(alpha.state(), State::Dead);
    assert_eq!(relay.data_of(OpCode::Dead), vec![json!("alpha")]);
}

#[tokio::test(start_paused = true)]
async fn test_start_requires_dead_state() {
    let relay = MemoryRelay::new();
    let alpha = client(&relay, "alpha");
    alpha.start().await.unwrap();

    assert!(matches!(
        alpha.start().await,
        Err(ProtocolError::InvalidState { found: "Alive", .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn test_discover_twice_fails() {
    let relay = MemoryRelay::new();
    let beta = client(&relay, "beta");
    let discovering = start_in_background(&beta).await;

    assert!(matches!(
        beta.discover().await,
        Err(ProtocolError::InvalidState { found: "Discovery", .. })
    ));

    discovering.await.unwrap().unwrap();
    assert_eq!(beta.state(), State::Alive);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_during_discovery_ends_it() {
    let relay = MemoryRelay::new();
    let beta = client(&relay, "beta");
    let discovering = start_in_background(&beta).await;

    beta.shutdown().await;

    assert!(matches!(
        discovering.await.unwrap(),
        Err(ProtocolError::ConnectionClosed)
    ));
    assert_eq!(beta.state(), State::Dead);
}

#[tokio::test(start_paused = true)]
async fn test_echo_and_misaddressed_packets_dropped() {
    let relay = MemoryRelay::new();
    let alpha = client(&relay, "alpha");
    alpha.start().await.unwrap();

    let (hits, handler) = counter();
    alpha.listeners().register(ListenerKey::Any, handler).unwrap();

    alpha
        .send_packet(alpha.packet(OpCode::Data).data("to everyone"))
        .await;
    relay
        .post_packet(&Packet::builder(OpCode::Data).author("zeta").to("someone-else").build())
        .unwrap();
    settle().await;
    assert_eq!(hits.load(Ordering::SeqCst), 0);

    relay
        .post_packet(&Packet::builder(OpCode::Data).author("zeta").build())
        .unwrap();
    relay
        .post_packet(&Packet::builder(OpCode::Data).author("zeta").to("alpha").build())
        .unwrap();
    settle().await;
    assert_eq!(hits.load(Ordering::SeqCst), 2);
    assert_eq!(alpha.metrics().snapshot().packets_dispatched, 2);
}

#[tokio::test(start_paused = true)]
async fn test_op_listener_only_sees_its_op() {
    let relay = MemoryRelay::new();
    let alpha = client(&relay, "alpha");
    alpha.start().await.unwrap();

    let (hits, handler) = counter();
    alpha.listeners().register(OpCode::Heartbeat, handler).unwrap();

    relay
        .post_packet(&Packet::builder(OpCode::Data).author("zeta").build())
        .unwrap();
    relay
        .post_packet(&Packet::builder(OpCode::Heartbeat).author("zeta").build())
        .unwrap();
    settle().await;

    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_packets_dropped_unless_running() {
    let relay = MemoryRelay::new();
    let alpha = client(&relay, "alpha");
    let (hits, handler) = counter();
    alpha.listeners().register(ListenerKey::Any, handler).unwrap();

    alpha
        .on_packet(Packet::builder(OpCode::Data).author("zeta").build())
        .await;
    settle().await;

    let metrics = alpha.metrics().snapshot();
    assert_eq!(metrics.packets_received, 1);
    assert_eq!(metrics.packets_dropped, 1);
    assert_eq!(hits.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn test_listeners_not_dispatched_during_discovery() {
    let relay = MemoryRelay::new();
    let beta = client(&relay, "beta");
    let (hits, handler) = counter();
    beta.listeners().register(ListenerKey::Any, handler).unwrap();

    let discovering = start_in_background(&beta).await;
    relay
        .post_packet(&Packet::builder(OpCode::Data).author("zeta").build())
        .unwrap();
    discovering.await.unwrap().unwrap();
    settle().await;

    assert_eq!(hits.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn test_ack_callback_runs_at_most_once() {
    let relay = MemoryRelay::new();
    let alpha = client(&relay, "alpha");
    let beta = client(&relay, "beta");
    alpha.start().await.unwrap();
    beta.start().await.unwrap();

    beta.listeners()
        .register(
            OpCode::Data,
            Handler::packet(|packet: Packet| async move { packet.ack("pong").await.map(|_| ()) }),
        )
        .unwrap();

    let acked = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&acked);
    let sent = alpha
        .send_packet_with_ack(alpha.packet(OpCode::Data).to("beta").data("ping"), move |ack| {
            assert_eq!(ack.data(), &json!("pong"));
            seen.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }
        })
        .await
        .unwrap();
    settle().await;
    assert_eq!(acked.load(Ordering::SeqCst), 1);

    let ack = relay
        .packets()
        .into_iter()
        .find(|p| p.op() == OpCode::Ack)
        .unwrap();
    assert_eq!(ack.seq(), sent.seq());
    relay.redeliver(ack.delivery().unwrap()).unwrap();
    settle().await;

    assert_eq!(acked.load(Ordering::SeqCst), 1);
    assert_eq!(alpha.listeners().count(&ListenerKey::Op(OpCode::Ack)), 0);
}

#[tokio::test(start_paused = true)]
async fn test_unrelated_ack_keeps_waiting() {
    let relay = MemoryRelay::new();
    let alpha = client(&relay, "alpha");
    alpha.start().await.unwrap();

    let acked = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&acked);
    let sent = alpha
        .send_packet_with_ack(alpha.packet(OpCode::Data).to("beta"), move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }
        })
        .await
        .unwrap();

    relay
        .post_packet(
            &Packet::builder(OpCode::Ack)
                .author("beta")
                .to("alpha")
                .seq(sent.seq() + 1_000_000)
                .build(),
        )
        .unwrap();
    settle().await;
    assert_eq!(acked.load(Ordering::SeqCst), 0);
    assert_eq!(alpha.listeners().count(&ListenerKey::Op(OpCode::Ack)), 1);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_collect_deletes_once() {
    let relay = MemoryRelay::new();
    let alpha = client(&relay, "alpha");
    relay
        .post_packet(&Packet::builder(OpCode::Data).author("zeta").ttl(2).build())
        .unwrap();

    let packet = relay.packets().pop().unwrap().with_context(alpha.id());
    let copy = packet.clone();
    tokio::join!(packet.collect(), copy.collect(), packet.collect());

    assert_eq!(relay.deletions(), 1);
    assert!(relay.messages().is_empty());
    let metrics = alpha.metrics().snapshot();
    assert_eq!(metrics.packets_collected, 1);
    assert_eq!(metrics.collect_failures, 0);
}

#[tokio::test(start_paused = true)]
async fn test_own_expiring_packets_are_collected() {
    let relay = MemoryRelay::new();
    let alpha = client(&relay, "alpha");
    alpha.start().await.unwrap();

    let sent = alpha
        .send_packet(alpha.packet(OpCode::Data).data("short lived").ttl(5))
        .await;
    let handle = sent.delivery().unwrap();
    settle().await;
    assert!(relay.messages().iter().any(|(h, _)| *h == handle));

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(!relay.messages().iter().any(|(h, _)| *h == handle));
}

#[tokio::test(start_paused = true)]
async fn test_redelivered_packet_collected_once() {
    let relay = MemoryRelay::new();
    let alpha = client(&relay, "alpha");
    alpha.start().await.unwrap();

    let sent = alpha
        .send_packet(alpha.packet(OpCode::Data).data("twice").ttl(5))
        .await;
    let handle = sent.delivery().unwrap();
    settle().await;
    relay.redeliver(handle).unwrap();
    settle().await;

    tokio::time::sleep(Duration::from_secs(10)).await;

    assert!(!relay.messages().iter().any(|(h, _)| *h == handle));
    assert_eq!(relay.deletions(), 1);
    let metrics = alpha.metrics().snapshot();
    assert_eq!(metrics.packets_collected, 1);
    assert_eq!(metrics.collect_failures, 0);
}

#[tokio::test(start_paused = true)]
async fn test_send_failure_reported_on_error_tag() {
    let relay = MemoryRelay::new();
    let alpha = client(&relay, "alpha");
    alpha.start().await.unwrap();

    let errors = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&errors);
    alpha
        .listeners()
        .register(
            ListenerKey::tag(tags::ERROR),
            Handler::error(move |error| {
                let seen = Arc::clone(&seen);
                async move {
                    assert!(matches!(*error, ProtocolError::TransportError(_)));
                    seen.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
        )
        .unwrap();

    relay.fail_sends(true);
    let sent = alpha.send_packet(alpha.packet(OpCode::Data)).await;
    settle().await;

    assert!(sent.delivery().is_none());
    assert_eq!(errors.load(Ordering::SeqCst), 1);
    assert_eq!(alpha.metrics().snapshot().send_failures, 1);
}

#[tokio::test(start_paused = true)]
async fn test_failing_listener_does_not_stop_client() {
    let relay = MemoryRelay::new();
    let alpha = client(&relay, "alpha");
    alpha.start().await.unwrap();

    alpha
        .listeners()
        .register(
            OpCode::Data,
            Handler::packet(|_| async { Err::<(), _>(ProtocolError::Handler("boom".into())) }),
        )
        .unwrap();
    let (hits, handler) = counter();
    alpha.listeners().register(OpCode::Data, handler).unwrap();

    relay
        .post_packet(&Packet::builder(OpCode::Data).author("zeta").build())
        .unwrap();
    settle().await;

    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert_eq!(alpha.metrics().snapshot().handler_failures, 1);
    assert_eq!(alpha.state(), State::Alive);
}

#[tokio::test(start_paused = true)]
async fn test_invalid_relay_messages_counted() {
    let relay = MemoryRelay::new();
    let alpha = client(&relay, "alpha");
    alpha.start().await.unwrap();

    relay.post(bytes::Bytes::from_static(b"just chatting")).unwrap();
    relay
        .post(bytes::Bytes::from_static(b"```json\n{\"op\": 99, \"f\": \"x\", \"s\": 1}```"))
        .unwrap();
    settle().await;

    assert_eq!(alpha.metrics().snapshot().packets_invalid, 2);
    assert_eq!(alpha.state(), State::Alive);
}

#[tokio::test(start_paused = true)]
async fn test_dropped_client_cannot_be_resolved() {
    let relay = MemoryRelay::new();
    let alpha = client(&relay, "alpha");
    let handle = alpha.handle();
    assert!(handle.upgrade().is_ok());

    drop(alpha);
    assert!(matches!(handle.upgrade(), Err(ProtocolError::ClientGone)));
}
