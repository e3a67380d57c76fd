//! # Error Types
//!
//! Error handling for the relay network protocol.
//!
//! This module defines every error variant that can surface while building,
//! sending, receiving or collecting packets, and while configuring a client.
//!
//! ## Error Categories
//! - **Packet Errors**: Unknown op codes, malformed or truncated payloads
//! - **Transport Errors**: Relay I/O failures, missing relay messages
//! - **State Errors**: Operations issued in the wrong client state
//! - **Configuration Errors**: Missing or invalid settings
//!
//! Most of these are recoverable: an invalid inbound packet is dropped and
//! logged, a failed send is reported on the `error` broadcast tag, and only
//! configuration errors are fatal at startup.
//!
//! ## Example Usage
//! ```rust
//! use relaynet::core::packet::Packet;
//! use relaynet::error::ProtocolError;
//! use tracing::{info, warn};
//!
//! match Packet::decode(b"{}") {
//!     Ok(packet) => info!(seq = packet.seq(), "decoded"),
//!     Err(ProtocolError::InvalidPacket(reason)) => warn!(%reason, "dropping packet"),
//!     Err(e) => warn!(error = %e, "unexpected error"),
//! }
//! ```

use std::io;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Registry-related error messages
    pub const ERR_REGISTRY_WRITE_LOCK: &str = "Failed to acquire write lock on listener registry";
    pub const ERR_REGISTRY_READ_LOCK: &str = "Failed to acquire read lock on listener registry";

    /// Packet validation errors
    pub const ERR_PAYLOAD_TOO_SHORT: &str = "Payload shorter than the minimum packet size";
    pub const ERR_MISSING_FENCE: &str = "Message is not wrapped in a json code fence";
    pub const ERR_NOT_UTF8: &str = "Payload is not valid UTF-8";
    pub const ERR_BAD_TIMESTAMP: &str = "Timestamp is not an integer epoch";

    /// Stack errors
    pub const ERR_STACK_LOCK: &str = "Network stack lock poisoned";

    /// Client errors
    pub const ERR_ALREADY_DISCOVERING: &str = "Discovery already in progress";
}

/// ProtocolError is the primary error type for all protocol operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid op code: {0}")]
    InvalidOpCode(i64),

    #[error("Invalid packet: {0}")]
    InvalidPacket(String),

    #[error("Packet too large: {0} bytes")]
    OversizedPacket(usize),

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Relay message {0} not found")]
    MessageNotFound(u64),

    #[error("Invalid client state: expected {expected}, found {found}")]
    InvalidState {
        expected: &'static str,
        found: &'static str,
    },

    #[error("Client context no longer exists")]
    ClientGone,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Backend not supported: {0}")]
    UnsupportedBackend(String),

    #[error("Handler failed: {0}")]
    Handler(String),

    #[error("Lock poisoned: {0}")]
    LockPoisoned(&'static str),

    #[error("Custom error: {0}")]
    Custom(String),
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;
