//! Buffer pool implementation for efficient buffer reuse
//!
//! Copy loops borrow a fixed-size buffer for the lifetime of one relay
//! direction and hand it back on drop, so steady-state proxying allocates
//! nothing per connection.

use bytes::BytesMut;
use once_cell::sync::Lazy;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, PoisonError};

/// Size of the buffers used by the stream copy loops (16 KiB)
pub const COPY_BUFFER_SIZE: usize = 16 * 1024;

/// Idle buffers retained by the shared copy pool
const COPY_POOL_IDLE: usize = 1024;

static COPY_BUFFERS: Lazy<BufferPool> =
    Lazy::new(|| BufferPool::new(COPY_POOL_IDLE, COPY_BUFFER_SIZE));

/// Process-wide pool of 16 KiB copy buffers
pub fn copy_buffers() -> BufferPool {
    COPY_BUFFERS.clone()
}

/// A pool of reusable byte buffers
///
/// It is thread-safe and cheap to clone; clones share the same idle list.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<BufferPoolInner>,
}

struct BufferPoolInner {
    /// Buffers returned by dropped `PooledBuffer`s
    idle: Mutex<Vec<BytesMut>>,
    /// Maximum number of idle buffers kept around
    max_idle: usize,
    /// Length of every buffer handed out
    buffer_size: usize,
}

/// A buffer borrowed from the pool
///
/// Dereferences to a `buffer_size`-long byte slice. When dropped, the buffer
/// goes back to the pool unless the pool is already holding `max_idle`
/// buffers.
pub struct PooledBuffer {
    buffer: Option<BytesMut>,
    pool: BufferPool,
}

impl BufferPool {
    /// Create a new buffer pool
    ///
    /// # Parameters
    ///
    /// * `max_idle` - Maximum number of returned buffers kept for reuse
    /// * `buffer_size` - Length of each buffer
    pub fn new(max_idle: usize, buffer_size: usize) -> Self {
        Self {
            inner: Arc::new(BufferPoolInner {
                idle: Mutex::new(Vec::new()),
                max_idle,
                buffer_size,
            }),
        }
    }

    /// Borrow a buffer, reusing an idle one when available
    pub fn get(&self) -> PooledBuffer {
        let reused = self
            .inner
            .idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();

        let buffer = reused.unwrap_or_else(|| {
            let mut buffer = BytesMut::with_capacity(self.inner.buffer_size);
            buffer.resize(self.inner.buffer_size, 0);
            buffer
        });

        PooledBuffer {
            buffer: Some(buffer),
            pool: self.clone(),
        }
    }

    /// Length of the buffers handed out by this pool
    pub fn buffer_size(&self) -> usize {
        self.inner.buffer_size
    }

    /// Number of buffers currently waiting for reuse
    pub fn idle(&self) -> usize {
        self.inner
            .idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn release(&self, buffer: BytesMut) {
        if buffer.len() != self.inner.buffer_size {
            return;
        }
        let mut idle = self
            .inner
            .idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if idle.len() < self.inner.max_idle {
            idle.push(buffer);
        }
    }
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.buffer.as_deref().unwrap_or(&[])
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.buffer.as_deref_mut().unwrap_or(&mut [])
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            self.pool.release(buffer);
        }
    }
}
