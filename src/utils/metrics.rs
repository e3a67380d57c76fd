//! Observability and Metrics
//!
//! Per-client counters for the inbound pipeline, outbound sends and relay
//! cleanup. Every counter is an atomic so handler and cleanup tasks can
//! record into the same collector without locking.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, info};

/// Metrics collector owned by one client
#[derive(Debug)]
pub struct Metrics {
    /// Packets decoded from the relay
    pub packets_received: AtomicU64,
    /// Packets fanned out to at least the dispatch stage
    pub packets_dispatched: AtomicU64,
    /// Packets dropped by the state, echo or address filters
    pub packets_dropped: AtomicU64,
    /// Packets queued to the backlog during discovery
    pub packets_backlogged: AtomicU64,
    /// Relay messages that failed to decode
    pub packets_invalid: AtomicU64,
    /// Packets handed to the transport successfully
    pub packets_sent: AtomicU64,
    /// Transport send failures
    pub send_failures: AtomicU64,
    /// Handlers that returned an error or panicked
    pub handler_failures: AtomicU64,
    /// Relay messages deleted after expiry
    pub packets_collected: AtomicU64,
    /// Relay deletions that failed
    pub collect_failures: AtomicU64,
    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            packets_received: AtomicU64::new(0),
            packets_dispatched: AtomicU64::new(0),
            packets_dropped: AtomicU64::new(0),
            packets_backlogged: AtomicU64::new(0),
            packets_invalid: AtomicU64::new(0),
            packets_sent: AtomicU64::new(0),
            send_failures: AtomicU64::new(0),
            handler_failures: AtomicU64::new(0),
            packets_collected: AtomicU64::new(0),
            collect_failures: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn packet_received(&self) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn packet_dispatched(&self) {
        self.packets_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn packet_dropped(&self) {
        self.packets_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn packet_backlogged(&self) {
        self.packets_backlogged.fetch_add(1, Ordering::Relaxed);
    }

    pub fn packet_invalid(&self) {
        self.packets_invalid.fetch_add(1, Ordering::Relaxed);
    }

    pub fn packet_sent(&self) {
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn send_failed(&self) {
        self.send_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn handler_failed(&self) {
        self.handler_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn packet_collected(&self) {
        self.packets_collected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn collect_failed(&self) {
        self.collect_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            packets_received: self.packets_received.load(Ordering::Relaxed),
            packets_dispatched: self.packets_dispatched.load(Ordering::Relaxed),
            packets_dropped: self.packets_dropped.load(Ordering::Relaxed),
            packets_backlogged: self.packets_backlogged.load(Ordering::Relaxed),
            packets_invalid: self.packets_invalid.load(Ordering::Relaxed),
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
            packets_collected: self.packets_collected.load(Ordering::Relaxed),
            collect_failures: self.collect_failures.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    /// Log current metrics
    pub fn log_metrics(&self) {
        let snapshot = self.snapshot();
        info!(
            packets_received = snapshot.packets_received,
            packets_dispatched = snapshot.packets_dispatched,
            packets_dropped = snapshot.packets_dropped,
            packets_backlogged = snapshot.packets_backlogged,
            packets_invalid = snapshot.packets_invalid,
            packets_sent = snapshot.packets_sent,
            send_failures = snapshot.send_failures,
            handler_failures = snapshot.handler_failures,
            packets_collected = snapshot.packets_collected,
            collect_failures = snapshot.collect_failures,
            uptime_seconds = snapshot.uptime_seconds,
            "Client metrics snapshot"
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub packets_received: u64,
    pub packets_dispatched: u64,
    pub packets_dropped: u64,
    pub packets_backlogged: u64,
    pub packets_invalid: u64,
    pub packets_sent: u64,
    pub send_failures: u64,
    pub handler_failures: u64,
    pub packets_collected: u64,
    pub collect_failures: u64,
    pub uptime_seconds: u64,
}

/// Timer for measuring operation duration
pub struct Timer {
    start: Instant,
    operation: &'static str,
}

impl Timer {
    /// Start timing an operation
    pub fn start(operation: &'static str) -> Self {
        Self {
            start: Instant::now(),
            operation,
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        let duration = self.start.elapsed();
        debug!(
            operation = self.operation,
            duration_ms = duration.as_millis(),
            "Operation completed"
        );
    }
}
