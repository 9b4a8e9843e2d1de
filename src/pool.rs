//! Reusable chunk buffer pool.

use crossbeam_queue::ArrayQueue;

use crate::buffer::{BufferLayout, LineBuffer};

/// Bounded pool of [`LineBuffer`]s of the same layout.
///
/// Acquiring takes an idle buffer or allocates a fresh one if none is idle. Releasing always succeeds:
/// a buffer returned to a full pool is dropped.
pub struct BufferPool {
    layout: BufferLayout,
    idle: ArrayQueue<LineBuffer>,
}

impl BufferPool {
    /// Creates an empty pool retaining up to `max_retained` idle buffers with the given layout.
    pub fn new(layout: BufferLayout, max_retained: usize) -> Self {
        BufferPool {
            layout,
            idle: ArrayQueue::new(max_retained.max(1)),
        }
    }

    /// Number of idle buffers currently retained.
    pub fn idle(&self) -> usize {
        self.idle.len()
    }

    pub fn acquire(&self) -> LineBuffer {
        match self.idle.pop() {
            Some(buffer) => buffer,
            None => {
                log::debug!(
                    "allocating chunk buffer (capacity: {}, lines: {})",
                    self.layout.capacity,
                    self.layout.max_lines
                );
                LineBuffer::with_layout(self.layout)
            }
        }
    }

    pub fn release(&self, buffer: LineBuffer) {
        if buffer.layout() != self.layout {
            return;
        }
        // dropped if the pool is full
        let _ = self.idle.push(buffer);
    }

    /// Drops all idle buffers giving their memory back. Returns the number of buffers dropped.
    pub fn shrink(&self) -> usize {
        let mut dropped = 0;
        while self.idle.pop().is_some() {
            dropped += 1;
        }

        dropped
    }
}

#[cfg(test)]
mod test {
    use super::BufferPool;
    use crate::buffer::{BufferLayout, LineBuffer};

    fn layout(capacity: usize) -> BufferLayout {
        BufferLayout { capacity, max_lines: 4 }
    }

    #[test]
    fn test_buffer_pool_reuse() {
        let pool = BufferPool::new(layout(64), 2);

        let first = pool.acquire();
        let second = pool.acquire();
        let third = pool.acquire();
        assert_eq!(first.layout(), layout(64));
        assert_eq!(pool.idle(), 0);

        pool.release(first);
        pool.release(second);
        pool.release(third);
        assert_eq!(pool.idle(), 2);

        let _reused = pool.acquire();
        assert_eq!(pool.idle(), 1);
    }

    #[test]
    fn test_buffer_pool_rejects_foreign_buffers() {
        let pool = BufferPool::new(layout(64), 2);
        pool.release(LineBuffer::new(16));
        pool.release(LineBuffer::with_layout(BufferLayout { capacity: 64, max_lines: 8 }));
        assert_eq!(pool.idle(), 0);
    }

    #[test]
    fn test_buffer_pool_shrink() {
        let pool = BufferPool::new(layout(8), 4);
        let buffers: Vec<_> = (0..3).map(|_| pool.acquire()).collect();
        for buffer in buffers {
            pool.release(buffer);
        }

        assert_eq!(pool.shrink(), 3);
        assert_eq!(pool.idle(), 0);
        assert_eq!(pool.acquire().capacity(), 8);
    }
}
