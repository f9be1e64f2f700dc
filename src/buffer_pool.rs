//! Reusable byte-buffer pool for frame I/O.
//!
//! Buffers that held handshake bytes or ciphertext are wiped before being
//! returned to the pool (spec.md §4.A, §5 "Buffer pool").

use std::sync::Mutex;
use zeroize::Zeroize;

/// A pooled buffer. On drop it is zeroized and handed back to its pool.
pub struct PooledBuffer {
    buf: Vec<u8>,
    pool: std::sync::Weak<BufferPool>,
}

impl PooledBuffer {
    pub fn as_mut_vec(&mut self) -> &mut Vec<u8> {
        &mut self.buf
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        self.buf.zeroize();
        if let Some(pool) = self.pool.upgrade() {
            let mut freed = pool.free.lock().unwrap();
            if freed.len() < pool.max_idle {
                let mut taken = std::mem::take(&mut self.buf);
                taken.clear();
                freed.push(taken);
            }
        }
    }
}

/// Thread-safe pool of reusable byte buffers.
pub struct BufferPool {
    free: Mutex<Vec<Vec<u8>>>,
    max_idle: usize,
}

impl BufferPool {
    pub fn new(max_idle: usize) -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self {
            free: Mutex::new(Vec::new()),
            max_idle,
        })
    }

    /// Check out a buffer with at least `capacity` bytes of backing storage.
    pub fn acquire(self: &std::sync::Arc<Self>, capacity: usize) -> PooledBuffer {
        let mut buf = {
            let mut free = self.free.lock().unwrap();
            free.pop().unwrap_or_default()
        };
        if buf.capacity() < capacity {
            buf.reserve(capacity - buf.capacity());
        }
        PooledBuffer {
            buf,
            pool: std::sync::Arc::downgrade(self),
        }
    }
}
