//! Logical port allocator for the TCP edge: tracks which ports in a
//! configured range are in use, independent of whether anything has
//! actually bound them yet (spec.md §4.5). Random-then-linear probing is
//! adapted from the random-bind-attempt loop in `create_listener`
//! (other_examples' bore server) — here it probes a plain `HashSet<u16>`
//! rather than attempting real binds, since `TcpEdgeServer` (spec.md §4.8)
//! owns the actual `listen()` call and releases the port back on bind
//! failure.

use mip_core::{TunnelError, TunnelResult};
use rand::Rng;
use std::collections::HashSet;
use tokio::sync::Mutex;

/// Up to this many random probes are attempted before falling back to a
/// linear scan (spec.md §4.5).
const RANDOM_PROBES: u32 = 10;

pub struct PortPool {
    min: u16,
    max: u16,
    used: Mutex<HashSet<u16>>,
}

impl PortPool {
    /// `min..=max` must be non-empty; the caller (config validation)
    /// guarantees `min <= max`.
    pub fn new(min: u16, max: u16) -> Self {
        Self {
            min,
            max,
            used: Mutex::new(HashSet::new()),
        }
    }

    fn capacity(&self) -> usize {
        self.max as usize - self.min as usize + 1
    }

    /// Allocate and reserve a free port, or `PortPoolExhausted` if the pool
    /// is full.
    pub async fn allocate(&self) -> TunnelResult<u16> {
        let mut used = self.used.lock().await;
        if used.len() >= self.capacity() {
            return Err(TunnelError::PortPoolExhausted);
        }

        let mut rng = rand::thread_rng();
        for _ in 0..RANDOM_PROBES {
            let candidate = rng.gen_range(self.min..=self.max);
            if used.insert(candidate) {
                return Ok(candidate);
            }
        }

        for candidate in self.min..=self.max {
            if used.insert(candidate) {
                return Ok(candidate);
            }
        }

        // Unreachable given the capacity check above, but guards against a
        // racing shrink of the used-set invariant rather than panicking.
        Err(TunnelError::PortPoolExhausted)
    }

    /// Release `port` back to the pool. Releasing a port that was never
    /// allocated (or already released) is a no-op.
    pub async fn release(&self, port: u16) {
        self.used.lock().await.remove(&port);
    }

    /// Ports still free in the pool.
    pub async fn available(&self) -> usize {
        self.capacity() - self.used.lock().await.len()
    }
}
