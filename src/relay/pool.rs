//! Reusable byte buffers for the non-zero-copy relay path.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Mutex,
};

/// The size of each pooled buffer. Matches the chunk size the kernel-mediated fast path moves
/// per transfer, so both paths behave similarly under small-write workloads.
pub const BUFFER_SIZE: usize = 32 * 1024;

/// A pool of fixed-size byte buffers, safe for use from any number of concurrent callers.
///
/// Buffer contents are not reset between reuses; callers must not assume zeroed memory. Every
/// [`acquire`](Self::acquire) must be matched by exactly one [`release`](Self::release),
/// including on early termination of the copy loop.
pub struct BufferPool {
    free: Mutex<Vec<Box<[u8]>>>,
    acquired: AtomicUsize,
    released: AtomicUsize,
}

impl BufferPool {
    pub const fn new() -> Self {
        Self {
            free: Mutex::new(Vec::new()),
            acquired: AtomicUsize::new(0),
            released: AtomicUsize::new(0),
        }
    }

    /// Gets a buffer, reusing a previously released one when possible. Never blocks waiting for
    /// a buffer: under lock contention a fresh buffer is allocated instead.
    pub fn acquire(&self) -> Box<[u8]> {
        self.acquired.fetch_add(1, Ordering::Relaxed);

        let reused = match self.free.try_lock() {
            Ok(mut free) => free.pop(),
            Err(_) => None,
        };

        reused.unwrap_or_else(|| vec![0u8; BUFFER_SIZE].into_boxed_slice())
    }

    /// Returns a buffer to the pool for reuse. The buffer's contents are left as-is.
    pub fn release(&self, buffer: Box<[u8]>) {
        debug_assert_eq!(buffer.len(), BUFFER_SIZE);
        self.released.fetch_add(1, Ordering::Relaxed);

        if let Ok(mut free) = self.free.lock() {
            free.push(buffer);
        }
    }

    /// Returns the total of acquire and release calls so far.
    pub fn counters(&self) -> (usize, usize) {
        (self.acquired.load(Ordering::Relaxed), self.released.load(Ordering::Relaxed))
    }
}
