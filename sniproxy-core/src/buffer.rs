//! Fixed-size datagram buffer pool (C2).
//!
//! A thread-safe free-list of `BUFFER_SIZE`-byte buffers. Acquisition never
//! blocks: an empty pool just allocates a fresh buffer rather than making a
//! caller wait. Buffers are handed back with whatever residual bytes they
//! held on their last use — callers must trust the returned length, not
//! zero-termination.

use std::sync::Mutex;

/// Large enough for the biggest UDP datagram (65507 on IPv4, rounded up).
pub const BUFFER_SIZE: usize = 65535;

pub struct BufferPool {
    free: Mutex<Vec<Box<[u8]>>>,
}

impl BufferPool {
    pub fn new() -> Self {
        Self {
            free: Mutex::new(Vec::new()),
        }
    }

    pub fn with_capacity(n: usize) -> Self {
        let mut free = Vec::with_capacity(n);
        for _ in 0..n {
            free.push(vec![0u8; BUFFER_SIZE].into_boxed_slice());
        }
        Self {
            free: Mutex::new(free),
        }
    }

    /// Acquires a buffer, allocating a fresh one if the pool is empty.
    pub fn acquire(&self) -> Box<[u8]> {
        let mut free = self.free.lock().unwrap();
        free.pop()
            .unwrap_or_else(|| vec![0u8; BUFFER_SIZE].into_boxed_slice())
    }

    /// Returns a buffer to the pool for reuse.
    pub fn release(&self, buf: Box<[u8]>) {
        debug_assert_eq!(buf.len(), BUFFER_SIZE);
        self.free.lock().unwrap().push(buf);
    }

    /// Number of buffers currently idle in the pool (for tests/metrics only).
    pub fn idle_count(&self) -> usize {
        self.free.lock().unwrap().len()
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_falls_back_to_fresh_allocation() {
        let pool = BufferPool::new();
        let buf = pool.acquire();
        assert_eq!(buf.len(), BUFFER_SIZE);
    }

    #[test]
    fn release_then_acquire_reuses_buffer() {
        let pool = BufferPool::new();
        let buf = pool.acquire();
        pool.release(buf);
        assert_eq!(pool.idle_count(), 1);
        let _buf = pool.acquire();
        assert_eq!(pool.idle_count(), 0);
    }

    #[test]
    fn buffer_balance_over_many_cycles() {
        // P2 (buffer-balance): acquired == released over a run.
        let pool = BufferPool::new();
        let mut acquired = 0;
        let mut released = 0;
        for _ in 0..1000 {
            let buf = pool.acquire();
            acquired += 1;
            pool.release(buf);
            released += 1;
        }
        assert_eq!(acquired, released);
        assert_eq!(pool.idle_count(), 1);
    }

    #[test]
    fn residual_data_is_not_cleared_on_release() {
        let pool = BufferPool::new();
        let mut buf = pool.acquire();
        buf[0] = 0xAB;
        pool.release(buf);
        let buf = pool.acquire();
        assert_eq!(buf[0], 0xAB);
    }
}
