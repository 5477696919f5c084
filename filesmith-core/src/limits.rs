use crate::cancel::CancellationToken;
use crate::error::{EngineError, EngineResult};
use parking_lot::{Condvar, Mutex};
use std::time::Duration;

/// Counting semaphore gating all externally-visible operations.
///
/// Sized by `parallel_ops`; callers wait (or get cancelled) here before any
/// disk I/O happens. Waiters poll the cancellation token so a Ctrl-C does
/// not leave a queue of doomed operations behind.
pub struct Semaphore {
    permits: Mutex<usize>,
    available: Condvar,
}

impl Semaphore {
    pub fn new(permits: usize) -> Self {
        Self {
            permits: Mutex::new(permits.max(1)),
            available: Condvar::new(),
        }
    }

    /// Acquire a permit, blocking until one frees up or the token fires.
    pub fn acquire(&self, cancel: &CancellationToken) -> EngineResult<SemaphorePermit<'_>> {
        let mut permits = self.permits.lock();
        loop {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            if *permits > 0 {
                *permits -= 1;
                return Ok(SemaphorePermit { semaphore: self });
            }
            self.available
                .wait_for(&mut permits, Duration::from_millis(50));
        }
    }

    fn release(&self) {
        let mut permits = self.permits.lock();
        *permits += 1;
        self.available.notify_one();
    }
}

/// RAII permit; dropping it returns the slot to the semaphore.
pub struct SemaphorePermit<'a> {
    semaphore: &'a Semaphore,
}

impl Drop for SemaphorePermit<'_> {
    fn drop(&mut self) {
        self.semaphore.release();
    }
}

pub const SLAB_SIZE: usize = 64 * 1024;

/// Pool of 64 KiB slabs reused for file copies and chunked I/O.
pub struct BufferPool {
    slabs: Mutex<Vec<Vec<u8>>>,
    max_pooled: usize,
}

impl BufferPool {
    pub fn new(max_pooled: usize) -> Self {
        Self {
            slabs: Mutex::new(Vec::new()),
            max_pooled,
        }
    }

    /// Take a zeroed slab from the pool, allocating when empty.
    pub fn acquire(&self) -> Vec<u8> {
        let mut slabs = self.slabs.lock();
        slabs.pop().unwrap_or_else(|| vec![0u8; SLAB_SIZE])
    }

    /// Return a slab. Oversized or excess buffers are dropped.
    pub fn release(&self, mut slab: Vec<u8>) {
        if slab.capacity() < SLAB_SIZE {
            return;
        }
        slab.clear();
        slab.resize(SLAB_SIZE, 0);
        let mut slabs = self.slabs.lock();
        if slabs.len() < self.max_pooled {
            slabs.push(slab);
        }
    }
}
