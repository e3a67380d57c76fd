//! Backend selection from configuration.

use std::sync::Arc;
use tracing::info;

use crate::config::Config;
use crate::error::{ProtocolError, Result};
use crate::transport::memory::MemoryRelay;
use crate::transport::tcp::TcpTransport;
use crate::transport::Transport;

/// Build the transport named by `app.backend`.
///
/// `memory` gives an endpoint on a fresh in-process relay, which is only
/// useful for trying a configuration out. `tcp` needs an `address`.
pub fn open(config: &Config) -> Result<Arc<dyn Transport>> {
    let backend = config.app.backend.as_str();
    let transport: Arc<dyn Transport> = match backend {
        "memory" => MemoryRelay::new().endpoint(),
        "tcp" => Arc::new(TcpTransport::new(config.require_str("address")?)),
        other => return Err(ProtocolError::UnsupportedBackend(other.to_string())),
    };
    info!(backend, "opened transport");
    Ok(transport)
}
