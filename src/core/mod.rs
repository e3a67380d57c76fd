//! # Core Protocol Components
//!
//! The packet data model and its wire representation.
//!
//! This module provides the foundation of the relay protocol: the closed set of
//! op codes, the process-wide sequence allocator, the packet envelope itself,
//! and the framings used to carry packets over a relay.
//!
//! ## Components
//! - **OpCode**: The closed set of packet kinds
//! - **Sequence**: Monotonic, task-safe sequence number allocation
//! - **Packet**: Addressed, time-limited message envelope
//! - **Codec**: Fenced (chat relays) and line (TCP) framings
//!
//! ## Wire Format
//! ```text
//! {"op": int, "d": any, "f": string, "t": string|null, "ts": "epoch-seconds", "ttl": int|null, "s": int}
//! ```
//!
//! ## Limits
//! - Minimum payload size: 13 bytes (shorter bodies cannot hold a packet)
//! - Maximum payload size: 1 MiB

pub mod codec;
pub mod opcode;
pub mod packet;
pub mod sequence;
