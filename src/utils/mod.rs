//! # Utility Modules
//!
//! Supporting utilities shared by the protocol, transports and binary.
//!
//! ## Components
//! - **Logging**: Structured logging setup (tracing-subscriber)
//! - **Metrics**: Thread-safe per-client counters
//! - **Time**: Epoch-second timestamps and expiry deadlines
//! - **Host**: Local hostname detection

pub mod host;
pub mod logging;
pub mod metrics;
pub mod time;
