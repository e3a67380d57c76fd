//! # relaynet
//!
//! Ad-hoc virtual networks of hosts over an arbitrary message relay.
//!
//! Hosts never talk to each other directly. Every host posts JSON packets to
//! a shared relay (a chat channel, a TCP hub, an in-process bus) and reads
//! every packet the relay carries. On top of that the client keeps an
//! ordered member list, treats the newest member as head, bootstraps joiners
//! and cleans up expired packets.
//!
//! ```no_run
//! use relaynet::{Client, MemoryRelay, OpCode};
//!
//! # async fn run() -> relaynet::Result<()> {
//! let relay = MemoryRelay::new();
//! let client = Client::builder(relay.endpoint()).hostname("alpha").build()?;
//! client.start().await?;
//! client.send_packet(client.packet(OpCode::Data).data("hello")).await;
//! client.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod protocol;
pub mod service;
pub mod transport;
pub mod utils;

pub use crate::config::Config;
pub use crate::core::opcode::OpCode;
pub use crate::core::packet::{DeliveryHandle, Packet, PacketBuilder};
pub use crate::error::{ProtocolError, Result};
pub use crate::protocol::client::{Client, ClientBuilder, State};
pub use crate::protocol::context::{ClientHandle, ClientId};
pub use crate::protocol::network::{NetworkStack, StackSnapshot};
pub use crate::protocol::registry::{tags, Event, Handler, ListenerKey, ListenerRegistry};
pub use crate::service::{Service, ServiceSet};
pub use crate::transport::memory::MemoryRelay;
pub use crate::transport::Transport;
