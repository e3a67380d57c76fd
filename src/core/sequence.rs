//! Sequence number allocation.
//!
//! Every locally constructed packet takes the next value from a
//! [`SequenceAllocator`]. Values are never reused for the lifetime of the
//! allocator, and allocation is safe from any thread or task.

use once_cell::sync::Lazy;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// The allocator shared by every client in this process unless one is injected.
static PROCESS_ALLOCATOR: Lazy<Arc<SequenceAllocator>> =
    Lazy::new(|| Arc::new(SequenceAllocator::new()));

/// Monotonic sequence number allocator.
#[derive(Debug)]
pub struct SequenceAllocator {
    next: AtomicU64,
}

impl SequenceAllocator {
    /// Create an allocator whose first value is 1.
    ///
    /// Zero is never handed out so that it can't be mistaken for "unset" by
    /// peers that treat a falsy seq as missing.
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    pub fn starting_at(first: u64) -> Self {
        Self {
            next: AtomicU64::new(first),
        }
    }

    /// The process-wide allocator.
    pub fn process() -> Arc<SequenceAllocator> {
        Arc::clone(&PROCESS_ALLOCATOR)
    }

    /// Take the next sequence number.
    pub fn next(&self) -> u64 {
        self.next.fetch_add(1, Ordering::SeqCst)
    }

    /// The value the next call to [`next`](Self::next) will return.
    pub fn peek(&self) -> u64 {
        self.next.load(Ordering::SeqCst)
    }
}

impl Default for SequenceAllocator {
    fn default() -> Self {
        Self::new()
    }
}
