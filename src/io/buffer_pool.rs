//! Fixed-capacity packet buffer pool
//!
//! Frames read off the TUN device and segments built by the transmit paths
//! live in buffers borrowed from a [`PacketBufferPool`]. All buffers are
//! allocated when the pool is created and recycled through a lock-free
//! `ArrayQueue`; the pool never grows.
//!
//! # Release discipline
//!
//! [`PacketBuffer`] is a move-only handle. It goes back to its pool exactly
//! once, when it is dropped, so a double release cannot be expressed. The only
//! way to lose a buffer is to leak the handle, which starves the pool: the
//! next [`PacketBufferPool::acquire`] waits, throttling whichever producer
//! depends on it.
//!
//! ```text
//! acquire() ──► permit (Semaphore) ──► ArrayQueue::pop ──► PacketBuffer
//!                                                              │ drop
//!               permit released ◄── ArrayQueue::push ◄─────────┘
//! ```
//!
//! # Example
//!
//! ```
//! use tun_interceptor::io::PacketBufferPool;
//!
//! # tokio_test_block_on(async {
//! let pool = PacketBufferPool::new(4, 1500);
//! let mut buf = pool.acquire().await.unwrap();
//! buf.as_mut_full()[..3].copy_from_slice(b"abc");
//! buf.set_len(3);
//! assert_eq!(&buf[..], b"abc");
//! drop(buf);
//! assert_eq!(pool.available(), 4);
//! # });
//! # fn tokio_test_block_on<F: std::future::Future>(f: F) -> F::Output {
//! #     tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(f)
//! # }
//! ```

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_queue::ArrayQueue;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};

/// Size of a frame buffer able to hold any IPv4 packet
pub const MAX_FRAME_SIZE: usize = 65_535;

/// Statistics for the buffer pool
#[derive(Debug, Default)]
pub struct BufferPoolStats {
    /// Buffers handed out
    acquisitions: AtomicU64,
    /// Buffers returned
    releases: AtomicU64,
    /// Acquisitions that had to wait for a release
    waits: AtomicU64,
    /// `try_acquire` calls that found the pool empty
    exhausted: AtomicU64,
}

impl BufferPoolStats {
    /// Get the number of acquisitions
    #[must_use]
    pub fn acquisitions(&self) -> u64 {
        self.acquisitions.load(Ordering::Relaxed)
    }

    /// Get the number of releases
    #[must_use]
    pub fn releases(&self) -> u64 {
        self.releases.load(Ordering::Relaxed)
    }

    /// Get the number of acquisitions that waited
    #[must_use]
    pub fn waits(&self) -> u64 {
        self.waits.load(Ordering::Relaxed)
    }

    /// Get the number of failed non-waiting acquisitions
    #[must_use]
    pub fn exhausted(&self) -> u64 {
        self.exhausted.load(Ordering::Relaxed)
    }

    /// Get a snapshot of all stats
    #[must_use]
    pub fn snapshot(&self) -> BufferPoolStatsSnapshot {
        BufferPoolStatsSnapshot {
            acquisitions: self.acquisitions(),
            releases: self.releases(),
            waits: self.waits(),
            exhausted: self.exhausted(),
        }
    }
}

/// Snapshot of buffer pool statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferPoolStatsSnapshot {
    pub acquisitions: u64,
    pub releases: u64,
    pub waits: u64,
    pub exhausted: u64,
}

impl BufferPoolStatsSnapshot {
    /// Buffers currently held by callers
    #[must_use]
    pub const fn in_use(&self) -> u64 {
        self.acquisitions.saturating_sub(self.releases)
    }
}

struct PoolInner {
    buffers: ArrayQueue<Box<[u8]>>,
    permits: Arc<Semaphore>,
    buffer_size: usize,
    stats: BufferPoolStats,
}

/// A fixed set of equally sized byte buffers.
///
/// Cheap to clone; clones share the same buffers.
#[derive(Clone)]
pub struct PacketBufferPool {
    inner: Arc<PoolInner>,
}

impl PacketBufferPool {
    /// Create a pool holding `capacity` buffers of `buffer_size` bytes each.
    ///
    /// Every buffer is allocated here.
    #[must_use]
    pub fn new(capacity: usize, buffer_size: usize) -> Self {
        let capacity = capacity.max(1);
        let buffers = ArrayQueue::new(capacity);
        for _ in 0..capacity {
            // Queue was sized for exactly `capacity` entries
            let _ = buffers.push(vec![0u8; buffer_size].into_boxed_slice());
        }
        Self {
            inner: Arc::new(PoolInner {
                buffers,
                permits: Arc::new(Semaphore::new(capacity)),
                buffer_size,
                stats: BufferPoolStats::default(),
            }),
        }
    }

    /// Borrow a buffer, waiting for one to be released if the pool is empty.
    ///
    /// Returns `None` once the pool has been closed.
    pub async fn acquire(&self) -> Option<PacketBuffer> {
        let permit = match Arc::clone(&self.inner.permits).try_acquire_owned() {
            Ok(permit) => permit,
            Err(TryAcquireError::Closed) => return None,
            Err(TryAcquireError::NoPermits) => {
                self.inner.stats.waits.fetch_add(1, Ordering::Relaxed);
                Arc::clone(&self.inner.permits).acquire_owned().await.ok()?
            }
        };
        Some(self.take(permit))
    }

    /// Borrow a buffer without waiting.
    ///
    /// Returns `None` if every buffer is in use or the pool is closed.
    #[must_use]
    pub fn try_acquire(&self) -> Option<PacketBuffer> {
        match Arc::clone(&self.inner.permits).try_acquire_owned() {
            Ok(permit) => Some(self.take(permit)),
            Err(_) => {
                self.inner.stats.exhausted.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    fn take(&self, permit: OwnedSemaphorePermit) -> PacketBuffer {
        // A permit guarantees a queued buffer; allocate only if that ever breaks
        let data = self
            .inner
            .buffers
            .pop()
            .unwrap_or_else(|| vec![0u8; self.inner.buffer_size].into_boxed_slice());
        self.inner.stats.acquisitions.fetch_add(1, Ordering::Relaxed);
        PacketBuffer {
            data: Some(data),
            len: 0,
            pool: Arc::clone(&self.inner),
            _permit: permit,
        }
    }

    /// Wake every waiter and refuse further acquisitions.
    ///
    /// Buffers already handed out remain valid and are still recycled.
    pub fn close(&self) {
        self.inner.permits.close();
    }

    /// Whether [`close`](Self::close) has been called
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.permits.is_closed()
    }

    /// Size of each buffer
    #[must_use]
    pub fn buffer_size(&self) -> usize {
        self.inner.buffer_size
    }

    /// Total number of buffers
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.inner.buffers.capacity()
    }

    /// Buffers currently in the pool
    #[must_use]
    pub fn available(&self) -> usize {
        self.inner.buffers.len()
    }

    /// Get pool statistics
    #[must_use]
    pub fn stats(&self) -> &BufferPoolStats {
        &self.inner.stats
    }
}

impl fmt::Debug for PacketBufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketBufferPool")
            .field("capacity", &self.capacity())
            .field("available", &self.available())
            .field("buffer_size", &self.buffer_size())
            .finish()
    }
}

/// A buffer borrowed from a [`PacketBufferPool`].
///
/// Dereferences to the first [`len`](Self::len) bytes. Returned to the pool
/// when dropped.
pub struct PacketBuffer {
    data: Option<Box<[u8]>>,
    len: usize,
    pool: Arc<PoolInner>,
    // Dropped after `Drop::drop` has pushed the buffer back
    _permit: OwnedSemaphorePermit,
}

impl PacketBuffer {
    /// Whole backing storage, regardless of the current length
    pub fn as_mut_full(&mut self) -> &mut [u8] {
        self.data.as_deref_mut().unwrap_or_default()
    }

    /// Set the number of valid bytes, clamped to the capacity
    pub fn set_len(&mut self, len: usize) {
        self.len = len.min(self.capacity());
    }

    /// Number of valid bytes
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Size of the backing storage
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.data.as_ref().map_or(0, |d| d.len())
    }
}

impl Drop for PacketBuffer {
    fn drop(&mut self) {
        if let Some(data) = self.data.take() {
            // Cannot overflow: at most `capacity` buffers exist
            let _ = self.pool.buffers.push(data);
            self.pool.stats.releases.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl Deref for PacketBuffer {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        match self.data.as_deref() {
            Some(data) => &data[..self.len],
            None => &[],
        }
    }
}

impl DerefMut for PacketBuffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        let len = self.len;
        match self.data.as_deref_mut() {
            Some(data) => &mut data[..len],
            None => &mut [],
        }
    }
}

impl AsRef<[u8]> for PacketBuffer {
    fn as_ref(&self) -> &[u8] {
        self
    }
}

impl AsMut<[u8]> for PacketBuffer {
    fn as_mut(&mut self) -> &mut [u8] {
        self
    }
}

impl fmt::Debug for PacketBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketBuffer")
            .field("len", &self.len)
            .field("capacity", &self.capacity())
            .finish()
    }
}
