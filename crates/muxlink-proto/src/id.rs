//! Frame id allocation.

use std::sync::atomic::{AtomicU32, Ordering};

/// Monotonic 32-bit id source. Ids run 1, 2, ... 2^32-1 and wrap back to 1;
/// zero is never produced because it marks an unassigned id on the wire.
#[derive(Debug)]
pub struct IdGenerator {
    next: AtomicU32,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self {
            next: AtomicU32::new(1),
        }
    }

    /// Start the sequence at an arbitrary point. Zero is bumped to one.
    pub fn starting_at(first: u32) -> Self {
        Self {
            next: AtomicU32::new(if first == 0 { 1 } else { first }),
        }
    }

    /// Allocate the next id, skipping zero on wrap.
    pub fn next_id(&self) -> u32 {
        loop {
            let current = self.next.load(Ordering::Relaxed);
            let id = if current == 0 { 1 } else { current };
            let following = id.wrapping_add(1);
            if self
                .next
                .compare_exchange_weak(current, following, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                return id;
            }
        }
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}
