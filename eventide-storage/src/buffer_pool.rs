//! Bounded pool of reusable write buffers.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use bytes::BytesMut;
use parking_lot::{Condvar, Mutex};

pub const DEFAULT_POOL_SIZE: usize = 16;

/// Buffers that grew past this multiple of their nominal capacity are
/// replaced instead of returned.
const MAX_GROWTH: usize = 4;

#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    buffers: Mutex<Vec<BytesMut>>,
    available: Condvar,
    size: usize,
    buffer_capacity: usize,
}

impl BufferPool {
    pub fn new(size: usize, buffer_capacity: usize) -> Self {
        let size = size.max(1);
        let buffers = (0..size).map(|_| BytesMut::with_capacity(buffer_capacity)).collect();
        Self {
            inner: Arc::new(PoolInner {
                buffers: Mutex::new(buffers),
                available: Condvar::new(),
                size,
                buffer_capacity,
            }),
        }
    }

    /// Takes a buffer, blocking until one is returned if the pool is empty.
    pub fn acquire(&self) -> PooledBuffer {
        let mut buffers = self.inner.buffers.lock();
        loop {
            if let Some(buf) = buffers.pop() {
                return PooledBuffer {
                    buf: Some(buf),
                    pool: Arc::clone(&self.inner),
                };
            }
            self.inner.available.wait(&mut buffers);
        }
    }

    pub fn try_acquire(&self) -> Option<PooledBuffer> {
        self.inner.buffers.lock().pop().map(|buf| PooledBuffer {
            buf: Some(buf),
            pool: Arc::clone(&self.inner),
        })
    }

    pub fn available(&self) -> usize {
        self.inner.buffers.lock().len()
    }

    pub fn size(&self) -> usize {
        self.inner.size
    }

    pub fn buffer_capacity(&self) -> usize {
        self.inner.buffer_capacity
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("size", &self.inner.size)
            .field("buffer_capacity", &self.inner.buffer_capacity)
            .finish()
    }
}

/// A buffer on loan from a [`BufferPool`]. Cleared and returned on drop.
pub struct PooledBuffer {
    buf: Option<BytesMut>,
    pool: Arc<PoolInner>,
}

impl Deref for PooledBuffer {
    type Target = BytesMut;

    fn deref(&self) -> &BytesMut {
        self.buf.as_ref().unwrap_or_else(|| unreachable!("buffer taken before drop"))
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut BytesMut {
        self.buf.as_mut().unwrap_or_else(|| unreachable!("buffer taken before drop"))
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let Some(mut buf) = self.buf.take() else {
            return;
        };
        buf.clear();
        if buf.capacity() > self.pool.buffer_capacity * MAX_GROWTH {
            buf = BytesMut::with_capacity(self.pool.buffer_capacity);
        }
        self.pool.buffers.lock().push(buf);
        self.pool.available.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_buffers_are_cleared_on_return() {
        let pool = BufferPool::new(1, 64);
        {
            let mut buf = pool.acquire();
            buf.put_slice(b"hello");
            assert_eq!(pool.available(), 0);
        }
        assert_eq!(pool.available(), 1);
        assert!(pool.acquire().is_empty());
    }

    #[test]
    fn test_try_acquire_when_exhausted() {
        let pool = BufferPool::new(2, 16);
        let a = pool.acquire();
        let _b = pool.acquire();
        assert!(pool.try_acquire().is_none());
        drop(a);
        assert!(pool.try_acquire().is_some());
    }

    #[test]
    fn test_oversized_buffer_is_replaced() {
        let pool = BufferPool::new(1, 16);
        {
            let mut buf = pool.acquire();
            buf.put_slice(&[0u8; 1024]);
        }
        assert!(pool.acquire().capacity() < 1024);
    }

    #[test]
    fn test_acquire_blocks_until_release() {
        let pool = BufferPool::new(1, 16);
        let held = pool.acquire();

        let waiter = {
            let pool = pool.clone();
            thread::spawn(move || {
                let mut buf = pool.acquire();
                buf.put_u8(1);
                buf.len()
            })
        };
        thread::sleep(Duration::from_millis(50));
        assert!(!waiter.is_finished());

        drop(held);
        assert_eq!(waiter.join().unwrap(), 1);
        assert_eq!(pool.available(), 1);
    }
}
