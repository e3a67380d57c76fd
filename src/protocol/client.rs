//! # Client
//!
//! The client drives one host's membership in a relay network.
//!
//! ## Lifecycle
//! ```text
//! Dead --connect--> Connected --discover--> Discovery --Hello/Sync/timeout--> Alive
//!   ^                                                                          |
//!   +------------------------------- shutdown ---------------------------------+
//! ```
//!
//! Every relay message goes through [`Client::on_packet`], one at a time.
//! Listener fan-out and cleanup of expired packets run as detached tasks that
//! never touch the network stack; the stack only changes inside `on_packet`
//! and the discovery fallback, both under the stack lock.

use serde_json::Value;
use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, info, instrument, trace, warn};

use crate::config::DiscoveryConfig;
use crate::core::opcode::OpCode;
use crate::core::packet::{DeliveryHandle, Packet, PacketBuilder};
use crate::core::sequence::SequenceAllocator;
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::context::{self, ClientHandle, ClientId};
use crate::protocol::network::{NetworkStack, StackSnapshot};
use crate::protocol::registry::{tags, Event, Handler, ListenerKey, ListenerRegistry};
use crate::protocol::tasks::TaskSpawner;
use crate::service::{Service, ServiceSet};
use crate::transport::Transport;
use crate::utils::host::local_hostname;
use crate::utils::metrics::{Metrics, Timer};

/// Client states. The numeric values match the wire-visible enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    Dead = 0,
    Connected = 1,
    Discovery = 2,
    Alive = 3,
    /// Reserved for a graceful leave handshake; never entered.
    Dying = 4,
}

impl State {
    pub fn name(self) -> &'static str {
        match self {
            State::Dead => "Dead",
            State::Connected => "Connected",
            State::Discovery => "Discovery",
            State::Alive => "Alive",
            State::Dying => "Dying",
        }
    }

    /// Whether inbound packets are processed at all.
    pub fn accepts_packets(self) -> bool {
        matches!(self, State::Alive | State::Discovery)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Builder for [`Client`].
pub struct ClientBuilder {
    transport: Arc<dyn Transport>,
    hostname: Option<String>,
    discovery: DiscoveryConfig,
    sequence: Option<Arc<SequenceAllocator>>,
    services: ServiceSet,
    listeners: Vec<(ListenerKey, Handler)>,
}

impl ClientBuilder {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            hostname: None,
            discovery: DiscoveryConfig::default(),
            sequence: None,
            services: ServiceSet::new(),
            listeners: Vec::new(),
        }
    }

    pub fn hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    pub fn discovery(mut self, discovery: DiscoveryConfig) -> Self {
        self.discovery = discovery;
        self
    }

    /// Use a dedicated allocator instead of the process-wide one.
    pub fn sequence(mut self, allocator: Arc<SequenceAllocator>) -> Self {
        self.sequence = Some(allocator);
        self
    }

    pub fn service<F>(mut self, factory: F) -> Self
    where
        F: FnOnce(ClientHandle) -> Arc<dyn Service> + Send + 'static,
    {
        self.services.add(factory);
        self
    }

    pub fn services(mut self, services: ServiceSet) -> Self {
        self.services.merge(services);
        self
    }

    pub fn listener(mut self, key: impl Into<ListenerKey>, handler: Handler) -> Self {
        self.listeners.push((key.into(), handler));
        self
    }

    pub fn build(self) -> Result<Client> {
        let id = ClientId::next();
        let metrics = Arc::new(Metrics::new());
        let (state, _) = watch::channel(State::Dead);

        let inner = Arc::new(ClientInner {
            id,
            hostname: self
                .hostname
                .unwrap_or_else(|| local_hostname().to_string()),
            transport: self.transport,
            discovery: self.discovery,
            sequence: self.sequence.unwrap_or_else(SequenceAllocator::process),
            listeners: ListenerRegistry::new(),
            services: Mutex::new(Vec::new()),
            stack: Mutex::new(NetworkStack::new()),
            collecting: Mutex::new(HashSet::new()),
            state,
            tasks: TaskSpawner::new(Arc::clone(&metrics)),
            metrics,
        });
        context::register(id, &inner);
        let client = Client { inner };

        let loaded = self.services.load(client.handle());
        client.inner.listeners.extend(loaded.listeners)?;
        client.inner.listeners.extend(self.listeners)?;
        *client
            .inner
            .services
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = loaded.services;

        debug!(
            client = %id,
            host = %client.inner.hostname,
            transport = client.inner.transport.name(),
            "client built"
        );
        Ok(client)
    }
}

pub(crate) struct ClientInner {
    id: ClientId,
    hostname: String,
    transport: Arc<dyn Transport>,
    discovery: DiscoveryConfig,
    sequence: Arc<SequenceAllocator>,
    listeners: ListenerRegistry,
    // Held so services live as long as the client
    services: Mutex<Vec<Arc<dyn Service>>>,
    stack: Mutex<NetworkStack>,
    // Relay messages with a cleanup task scheduled; redeliveries share it
    collecting: Mutex<HashSet<DeliveryHandle>>,
    state: watch::Sender<State>,
    tasks: TaskSpawner,
    metrics: Arc<Metrics>,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        context::unregister(self.id);
        self.tasks.shutdown();
    }
}

/// A host on the relay network. Cheap to clone; clones share one client.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

/// What the inbound pipeline has left to do after the stack lock is
/// released.
enum Followup {
    Nothing,
    BecameAlive,
    Greet(Packet, StackSnapshot),
}

impl Client {
    pub fn builder(transport: Arc<dyn Transport>) -> ClientBuilder {
        ClientBuilder::new(transport)
    }

    pub(crate) fn from_inner(inner: Arc<ClientInner>) -> Self {
        Self { inner }
    }

    pub fn id(&self) -> ClientId {
        self.inner.id
    }

    /// A non-owning handle for services and background tasks.
    pub fn handle(&self) -> ClientHandle {
        ClientHandle::new(self.inner.id)
    }

    pub fn hostname(&self) -> &str {
        &self.inner.hostname
    }

    pub fn state(&self) -> State {
        *self.inner.state.borrow()
    }

    pub fn is_alive(&self) -> bool {
        self.state() == State::Alive
    }

    pub fn subscribe_state(&self) -> watch::Receiver<State> {
        self.inner.state.subscribe()
    }

    pub async fn wait_for_state(&self, state: State) -> Result<()> {
        let mut rx = self.subscribe_state();
        rx.wait_for(|current| *current == state)
            .await
            .map(|_| ())
            .map_err(|_| ProtocolError::ClientGone)
    }

    pub fn members(&self) -> Vec<String> {
        self.lock_stack().members().to_vec()
    }

    pub fn head(&self) -> Option<String> {
        self.lock_stack().head().map(str::to_string)
    }

    pub fn backlog_len(&self) -> usize {
        self.lock_stack().backlog().len()
    }

    pub fn snapshot(&self) -> Result<StackSnapshot> {
        self.lock_stack().into_raw()
    }

    pub fn discovery_config(&self) -> &DiscoveryConfig {
        &self.inner.discovery
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.inner.metrics
    }

    pub fn listeners(&self) -> &ListenerRegistry {
        &self.inner.listeners
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.inner.transport
    }

    pub fn services(&self) -> Vec<Arc<dyn Service>> {
        self.inner
            .services
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Start a packet from this host.
    pub fn packet(&self, op: OpCode) -> PacketBuilder {
        self.bind(PacketBuilder::new(op))
    }

    fn bind(&self, builder: PacketBuilder) -> PacketBuilder {
        builder.bind(&self.inner.hostname, &self.inner.sequence, self.inner.id)
    }

    /// Run a future as a client task; it is cancelled on shutdown.
    pub fn spawn<F>(&self, name: &'static str, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.inner.tasks.spawn_detached(name, fut);
    }

    /// Dispatch a lifecycle tag. Returns how many listeners were scheduled.
    pub fn broadcast(&self, tag: &'static str) -> usize {
        self.dispatch(&ListenerKey::tag(tag), Event::Signal)
    }

    fn report_error(&self, error: ProtocolError) {
        self.dispatch(&ListenerKey::tag(tags::ERROR), Event::Error(Arc::new(error)));
    }

    fn dispatch(&self, key: &ListenerKey, event: Event) -> usize {
        match self.inner.listeners.dispatch(key, event, &self.inner.tasks) {
            Ok(count) => count,
            Err(e) => {
                warn!(listener = %key, error = %e, "dispatch failed");
                0
            }
        }
    }

    pub(crate) fn lock_stack(&self) -> MutexGuard<'_, NetworkStack> {
        self.inner.stack.lock().unwrap_or_else(|e| {
            warn!("{}", constants::ERR_STACK_LOCK);
            e.into_inner()
        })
    }

    pub(crate) fn set_state(&self, to: State) {
        let from = self.inner.state.send_replace(to);
        if from != to {
            info!(host = %self.inner.hostname, "{from} => {to}");
        }
    }

    /// Connect, announce, and run discovery until the host is Alive.
    #[instrument(skip(self), fields(host = %self.inner.hostname))]
    pub async fn start(&self) -> Result<()> {
        let state = self.state();
        if state != State::Dead {
            return Err(ProtocolError::InvalidState {
                expected: State::Dead.name(),
                found: state.name(),
            });
        }
        if self.inner.tasks.is_cancelled() {
            return Err(ProtocolError::ConnectionClosed);
        }

        self.broadcast(tags::STARTING);

        let mut inbound = self.inner.transport.connect().await?;
        self.set_state(State::Connected);
        self.broadcast(tags::CONNECTED);

        let handle = self.handle();
        self.spawn("reader", async move {
            while let Some(raw) = inbound.recv().await {
                let Ok(client) = handle.upgrade() else {
                    break;
                };
                match client.inner.transport.decode(&raw) {
                    Ok(packet) => client.on_packet(packet.with_context(client.id())).await,
                    Err(e) => {
                        client.inner.metrics.packet_invalid();
                        info!(handle = %raw.handle, error = %e, "dropping invalid relay message");
                    }
                }
            }
            debug!("relay stream ended");
        });

        self.discover().await
    }

    /// Announce this host and wait for the network to answer.
    ///
    /// Sends an Alive packet, then waits in steps of 1, 2, 3, ... seconds for
    /// a Hello or Sync to move the client to Alive. If none arrives the
    /// client starts or resynchronizes the network itself. Fails if
    /// discovery is already running.
    #[instrument(skip(self), fields(host = %self.inner.hostname))]
    pub async fn discover(&self) -> Result<()> {
        let _timer = Timer::start("discovery");
        {
            let _stack = self.lock_stack();
            let state = self.state();
            match state {
                State::Connected | State::Alive => self.set_state(State::Discovery),
                State::Discovery => {
                    warn!("{}", constants::ERR_ALREADY_DISCOVERING);
                    return Err(ProtocolError::InvalidState {
                        expected: State::Connected.name(),
                        found: state.name(),
                    });
                }
                _ => {
                    return Err(ProtocolError::InvalidState {
                        expected: State::Connected.name(),
                        found: state.name(),
                    })
                }
            }
        }

        let discovery = &self.inner.discovery;
        info!("beginning discovery");
        self.send_packet(self.packet(OpCode::Alive).ttl(discovery.alive_ttl))
            .await;
        let sync = self.packet(OpCode::Sync).ttl(discovery.sync_ttl);

        let mut state_rx = self.subscribe_state();
        let cancelled = self.inner.tasks.token().clone();
        for step in discovery.steps() {
            tokio::select! {
                biased;
                _ = cancelled.cancelled() => return Err(ProtocolError::ConnectionClosed),
                left = left_discovery(&mut state_rx, step) => {
                    if left {
                        debug!(state = %self.state(), "discovery answered");
                        return Ok(());
                    }
                    trace!(step = step.as_secs(), "still discovering");
                }
            }
        }

        self.fallback(sync).await
    }

    /// Discovery timed out: found a network alone, or replay what was heard
    /// and force everyone onto this host's view.
    async fn fallback(&self, sync: PacketBuilder) -> Result<()> {
        let host = self.inner.hostname.clone();
        let resync = {
            let mut stack = self.lock_stack();
            if self.state() != State::Discovery {
                return Ok(());
            }
            info!(backlog = stack.backlog().len(), "discovery timed out");

            let resync = if stack.backlog().is_empty() {
                stack.reset([host.as_str()]);
                None
            } else {
                stack.replay_backlog();
                stack.push_member(&host);
                Some(stack.into_raw()?)
            };
            self.set_state(State::Alive);
            resync
        };

        if let Some(snapshot) = resync {
            self.send_packet(sync.data(snapshot.to_value()?)).await;
        }
        self.broadcast(tags::ALIVE);
        Ok(())
    }

    /// Process one inbound packet.
    ///
    /// Packets are ignored unless the client is Alive or discovering. Packets
    /// this host authored are never dispatched, but those with a ttl get
    /// their relay message collected once expired. Packets addressed to some
    /// other host are dropped. While Alive the rest fan out to listeners for
    /// their op code and to wildcard listeners, then drive membership.
    pub async fn on_packet(&self, packet: Packet) {
        let inner = &self.inner;
        inner.metrics.packet_received();

        let state = self.state();
        if !state.accepts_packets() {
            inner.metrics.packet_dropped();
            trace!(%packet, %state, "not processing packets");
            return;
        }

        let authored = packet.author() == inner.hostname;
        if authored && packet.expires() {
            self.schedule_collect(packet.clone());
        }

        if authored || !packet.addressed_to(&inner.hostname) {
            inner.metrics.packet_dropped();
            trace!(%packet, "echo or misaddressed packet");
            return;
        }

        if state == State::Alive {
            let key = ListenerKey::Op(packet.op());
            if self.dispatch(&key, Event::Packet(packet.clone())) > 0 {
                inner.metrics.packet_dispatched();
            }
        }

        match self.classify(&packet) {
            Followup::Nothing => {}
            Followup::BecameAlive => {
                self.broadcast(tags::ALIVE);
            }
            Followup::Greet(joiner, snapshot) => match snapshot.to_value() {
                Ok(data) => {
                    info!(joiner = %joiner.author(), "greeting new host");
                    let reply = joiner.response(OpCode::Hello, data, Some(inner.discovery.hello_ttl));
                    self.send_packet(reply).await;
                }
                Err(e) => warn!(error = %e, "failed to encode network stack"),
            },
        }
    }

    /// Collect an own packet once per relay message, however often the relay
    /// delivers it.
    fn schedule_collect(&self, packet: Packet) {
        let Some(handle) = packet.delivery() else {
            trace!(%packet, "no relay message to collect");
            return;
        };
        let fresh = self
            .inner
            .collecting
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(handle);
        if !fresh {
            trace!(%packet, %handle, "collection already scheduled");
            return;
        }

        let client = self.handle();
        self.spawn("collect", async move {
            packet.collect().await;
            if let Ok(client) = client.upgrade() {
                client
                    .inner
                    .collecting
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&handle);
            }
        });
    }

    fn classify(&self, packet: &Packet) -> Followup {
        let host = self.inner.hostname.as_str();
        let mut stack = self.lock_stack();

        match self.state() {
            State::Discovery => match packet.op() {
                OpCode::Hello => match StackSnapshot::from_value(packet.data()) {
                    Ok(snapshot) => {
                        info!(from = %packet.author(), "joining network");
                        stack.from_data(snapshot, host);
                        self.set_state(State::Alive);
                        Followup::BecameAlive
                    }
                    Err(e) => {
                        warn!(%packet, error = %e, "ignoring malformed Hello");
                        Followup::Nothing
                    }
                },
                OpCode::Sync => match StackSnapshot::from_value(packet.data()) {
                    Ok(snapshot) => {
                        info!(from = %packet.author(), "being force synced into the network");
                        stack.replace(snapshot, host);
                        self.set_state(State::Alive);
                        Followup::BecameAlive
                    }
                    Err(e) => {
                        warn!(%packet, error = %e, "ignoring malformed Sync");
                        Followup::Nothing
                    }
                },
                _ => {
                    info!(%packet, "discovering, queued non initializing packet");
                    stack.queue(packet.clone());
                    self.inner.metrics.packet_backlogged();
                    Followup::Nothing
                }
            },
            State::Alive => match packet.op() {
                OpCode::Alive => {
                    let greeting = if stack.is_head(host) {
                        match stack.into_raw() {
                            Ok(snapshot) => Followup::Greet(packet.clone(), snapshot),
                            Err(e) => {
                                warn!(error = %e, "failed to snapshot network stack");
                                Followup::Nothing
                            }
                        }
                    } else {
                        Followup::Nothing
                    };
                    if stack.push_member(packet.author()) {
                        debug!(joiner = %packet.author(), members = ?stack.members(), "host joined");
                    }
                    greeting
                }
                OpCode::Dead => {
                    match packet.data().as_str() {
                        Some(gone) if gone == host => {
                            warn!(from = %packet.author(), "ignoring Dead packet naming this host");
                        }
                        Some(gone) => {
                            if stack.remove(gone) {
                                info!(host = %gone, "host left the network");
                            }
                        }
                        None => warn!(%packet, "Dead packet without a hostname"),
                    }
                    Followup::Nothing
                }
                OpCode::Heartbeat | OpCode::Hello => Followup::Nothing,
                op => {
                    debug!(%op, %packet, "no protocol action for op code");
                    Followup::Nothing
                }
            },
            _ => Followup::Nothing,
        }
    }

    /// Encode and post a packet. Failures are counted, logged and reported
    /// on the `error` tag; the caller only sees `None`.
    pub async fn transmit(&self, packet: &Packet) -> Option<DeliveryHandle> {
        let transport = &self.inner.transport;
        let result = match transport.encode(packet) {
            Ok(message) => transport.send_raw(message).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(handle) => {
                self.inner.metrics.packet_sent();
                trace!(%packet, %handle, "sent");
                Some(handle)
            }
            Err(e) => {
                self.inner.metrics.send_failed();
                warn!(%packet, error = %e, "failed to send packet");
                self.report_error(e);
                None
            }
        }
    }

    /// Build a packet from this host and send it. The returned packet
    /// carries its relay handle when the send went through.
    pub async fn send_packet(&self, builder: PacketBuilder) -> Packet {
        let packet = self.bind(builder).build();
        match self.transmit(&packet).await {
            Some(handle) => packet.with_delivery(handle),
            None => packet,
        }
    }

    /// Like [`send_packet`](Self::send_packet), and run `on_ack` for the
    /// first Ack that echoes the packet's seq. Later Acks with the same seq
    /// are ignored.
    pub async fn send_packet_with_ack<F, Fut>(&self, builder: PacketBuilder, on_ack: F) -> Result<Packet>
    where
        F: FnOnce(Packet) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let packet = self.bind(builder).build();
        let seq = packet.seq();
        let callback = Arc::new(Mutex::new(Some(on_ack)));
        let handle = self.handle();

        self.inner
            .listeners
            .register_with(ListenerKey::Op(OpCode::Ack), move |id| {
                Handler::packet(move |ack: Packet| {
                    let callback = Arc::clone(&callback);
                    async move {
                        if ack.seq() != seq {
                            return Ok(());
                        }
                        let client = handle.upgrade()?;
                        if !client
                            .inner
                            .listeners
                            .unregister(&ListenerKey::Op(OpCode::Ack), id)?
                        {
                            return Ok(());
                        }
                        let on_ack = callback.lock().unwrap_or_else(|e| e.into_inner()).take();
                        match on_ack {
                            Some(on_ack) => on_ack(ack).await,
                            None => Ok(()),
                        }
                    }
                })
            })?;

        Ok(match self.transmit(&packet).await {
            Some(handle) => packet.with_delivery(handle),
            None => packet,
        })
    }

    /// Leave the network.
    ///
    /// Cancels every client task, makes one best-effort attempt to post a
    /// Dead packet, closes the transport and forces the state to Dead. A
    /// client that is already Dead is left alone.
    #[instrument(skip(self), fields(host = %self.inner.hostname))]
    pub async fn shutdown(&self) {
        if self.state() == State::Dead {
            return;
        }
        info!("shutting down");
        self.inner.tasks.shutdown();

        let transport = &self.inner.transport;
        let dead = self
            .packet(OpCode::Dead)
            .data(Value::String(self.inner.hostname.clone()))
            .ttl(self.inner.discovery.dead_ttl)
            .build();
        let posted = match transport.encode(&dead) {
            Ok(message) => transport.send_raw(message).await.map(|_| ()),
            Err(e) => Err(e),
        };
        if let Err(e) = posted {
            debug!(error = %e, "could not announce departure");
        }

        if let Err(e) = transport.close().await {
            debug!(error = %e, "transport close failed");
        }

        self.set_state(State::Dead);
        self.inner.metrics.log_metrics();
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.inner.id)
            .field("hostname", &self.inner.hostname)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

async fn left_discovery(rx: &mut watch::Receiver<State>, step: Duration) -> bool {
    matches!(
        timeout(step, rx.wait_for(|state| *state != State::Discovery)).await,
        Ok(Ok(_))
    )
}
