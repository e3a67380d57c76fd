//! # Protocol Engine
//!
//! Membership and message handling for one host.
//!
//! ## Components
//! - **Client**: Lifecycle state machine, discovery and inbound filtering
//! - **Network**: Ordered member list plus the discovery backlog
//! - **Registry**: Listeners keyed by op code, wildcard or lifecycle tag
//! - **Tasks**: Cancellable fire-and-forget tasks owned by a client
//! - **Context**: Weak client lookup for packets and services
//!
//! ## Discovery
//! ```text
//! joiner                      relay                      head
//!   |--- Alive (broadcast) ----->|------------------------->|
//!   |<---------------------------|<---- Hello (to joiner) --|
//!   |  Alive, members = [head, ..., joiner]                 |
//! ```
//! Without an answer the joiner either founds a network of its own or, if it
//! overheard traffic, replays it and forces its view on everyone with Sync.

pub mod client;
pub mod context;
pub mod network;
pub mod registry;
pub mod tasks;

#[cfg(test)]
mod tests;
