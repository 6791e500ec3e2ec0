//! Connector byte-buffer pool
//!
//! Every connector hands its connections read buffers from one shared pool.
//! Buffers are `BytesMut` of a fixed capacity, cleared before they go back
//! to the idle store. Built on [`ResourcePool`], so the same capacity rules
//! apply: `0` disables pooling, a negative capacity is unbounded.

use bytes::BytesMut;

use crate::pool::{PoolObjects, ResourcePool};

/// Default buffer size (4KB)
pub const DEFAULT_BUFFER_SIZE: usize = 4096;

/// Default maximum number of cached buffers
pub const DEFAULT_MAX_CACHED: isize = 64;

/// Allocates fixed-capacity buffers for [`ByteBufferPool`]
#[derive(Debug, Clone, Copy)]
pub struct BufferAllocator {
    buffer_size: usize,
}

impl PoolObjects for BufferAllocator {
    type Object = BytesMut;

    fn new_object(&self) -> BytesMut {
        BytesMut::with_capacity(self.buffer_size)
    }

    fn reset(&self, buffer: &mut BytesMut) {
        buffer.clear();
    }
}

/// Buffer pool for reusing I/O buffers
#[derive(Debug)]
pub struct ByteBufferPool {
    pool: ResourcePool<BufferAllocator>,
}

impl ByteBufferPool {
    /// Create a new buffer pool
    pub fn new(buffer_size: usize, max_cached: isize) -> Self {
        Self {
            pool: ResourcePool::new(max_cached, BufferAllocator { buffer_size }),
        }
    }

    /// Get a buffer from the pool
    #[inline]
    pub fn get(&self) -> BytesMut {
        self.pool.acquire()
    }

    /// Return a buffer to the pool
    ///
    /// Buffers that grew or shrank away from the pool's size are dropped.
    #[inline]
    pub fn put(&self, buffer: BytesMut) {
        if buffer.capacity() == self.buffer_size() {
            self.pool.release(buffer);
        }
    }

    /// Size of each buffer
    #[inline]
    pub fn buffer_size(&self) -> usize {
        self.pool.objects().buffer_size
    }

    /// Get number of cached buffers
    #[inline]
    pub fn cached(&self) -> usize {
        self.pool.idle_count()
    }

    /// The underlying resource pool
    pub fn pool(&self) -> &ResourcePool<BufferAllocator> {
        &self.pool
    }
}

impl Default for ByteBufferPool {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_SIZE, DEFAULT_MAX_CACHED)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;

    #[test]
    fn test_buffer_pool() {
        let pool = ByteBufferPool::new(1024, 4);

        let buf1 = pool.get();
        assert_eq!(buf1.capacity(), 1024);

        pool.put(buf1);
        assert_eq!(pool.cached(), 1);

        let buf2 = pool.get();
        assert_eq!(pool.cached(), 0);
        assert_eq!(buf2.capacity(), 1024);
    }

    #[test]
    fn test_buffer_cleared_on_return() {
        let pool = ByteBufferPool::new(64, 4);

        let mut buf = pool.get();
        buf.put_slice(b"leftover");
        pool.put(buf);

        let buf = pool.get();
        assert!(buf.is_empty());
    }

    #[test]
    fn test_resized_buffer_dropped() {
        let pool = ByteBufferPool::new(16, 4);

        let mut buf = pool.get();
        buf.reserve(1024);
        pool.put(buf);
        assert_eq!(pool.cached(), 0);
    }

    #[test]
    fn test_max_cached() {
        let pool = ByteBufferPool::new(32, 2);

        let buffers: Vec<_> = (0..3).map(|_| pool.get()).collect();
        for buf in buffers {
            pool.put(buf);
        }
        assert_eq!(pool.cached(), 2);
    }
}
