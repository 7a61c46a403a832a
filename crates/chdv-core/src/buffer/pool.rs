use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender, TryRecvError};

/// A pool of reusable fixed-size byte buffers.
///
/// Every buffer handed out has length `buffer_len`, zero-length-checked by
/// the decode paths that fill it. Buffers return to the pool when their
/// [`PooledBuffer`] handle is dropped, so steady-state verification runs
/// without allocation churn.
///
/// # Example
/// ```
/// use chdv_core::BufferPool;
///
/// let pool = BufferPool::new(4096);
/// let buffer = pool.rent();
/// assert_eq!(buffer.len(), 4096);
/// drop(buffer); // returns to pool automatically
/// ```
#[derive(Debug)]
pub struct BufferPool {
    recycler: Sender<Vec<u8>>,
    receiver: Receiver<Vec<u8>>,
    buffer_len: usize,
    metrics: Arc<PoolMetricsInner>,
}

impl BufferPool {
    /// Creates a pool whose buffers are all `buffer_len` bytes long.
    pub fn new(buffer_len: usize) -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self {
            recycler: tx,
            receiver: rx,
            buffer_len,
            metrics: Arc::new(PoolMetricsInner::default()),
        }
    }

    /// Rents a buffer from the pool.
    ///
    /// Returns a recycled buffer if one is idle, otherwise allocates a new
    /// one. Contents are whatever the previous renter left behind; callers
    /// overwrite the full length.
    pub fn rent(&self) -> PooledBuffer {
        let buffer = match self.receiver.try_recv() {
            Ok(buffer) => {
                self.metrics.recycled.fetch_add(1, Ordering::Relaxed);
                buffer
            }
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => {
                self.metrics.created.fetch_add(1, Ordering::Relaxed);
                vec![0u8; self.buffer_len]
            }
        };
        PooledBuffer::new(buffer, self.recycler.clone())
    }

    /// Returns a snapshot of the current pool metrics.
    pub fn metrics(&self) -> PoolMetricsSnapshot {
        PoolMetricsSnapshot {
            created: self.metrics.created.load(Ordering::Relaxed),
            recycled: self.metrics.recycled.load(Ordering::Relaxed),
        }
    }

    /// Returns the length of every buffer in the pool.
    pub fn buffer_len(&self) -> usize {
        self.buffer_len
    }

    /// Number of idle buffers currently parked in the pool.
    pub fn idle(&self) -> usize {
        self.receiver.len()
    }
}

/// A snapshot of buffer pool metrics at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolMetricsSnapshot {
    /// Number of buffers allocated by the pool
    pub created: usize,
    /// Number of rents satisfied from an idle buffer
    pub recycled: usize,
}

#[derive(Debug, Default)]
struct PoolMetricsInner {
    created: AtomicUsize,
    recycled: AtomicUsize,
}

/// A buffer rented from a [`BufferPool`].
///
/// When dropped, the buffer is returned to the pool for reuse. Implements
/// `Deref` and `DerefMut` for transparent slice access.
#[derive(Debug)]
pub struct PooledBuffer {
    buffer: Vec<u8>,
    recycler: Sender<Vec<u8>>,
}

impl PooledBuffer {
    fn new(buffer: Vec<u8>, recycler: Sender<Vec<u8>>) -> Self {
        Self { buffer, recycler }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buffer
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buffer
    }
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.buffer
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.buffer
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let buffer = std::mem::take(&mut self.buffer);
        // Send only fails once the pool itself is gone; let the buffer die.
        let _ = self.recycler.send(buffer);
    }
}
