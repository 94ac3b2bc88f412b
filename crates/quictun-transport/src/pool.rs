//! Bounded pool of reusable byte buffers
//!
//! Borrowing waits when every buffer is out, which throttles the per-stream
//! reader tasks to the pace of the consumer. A borrowed buffer goes back to
//! the pool when the [`PooledBuffer`] is dropped.

use crate::{TransportError, TransportResult};
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::trace;

/// Validity check run on every returned buffer; `false` destroys it
pub type BufferTester = Box<dyn Fn(&[u8]) -> bool + Send + Sync>;

#[derive(Default)]
struct Counters {
    created: AtomicU64,
    borrowed: AtomicU64,
    returned: AtomicU64,
    destroyed: AtomicU64,
    tested: AtomicU64,
}

struct PoolInner {
    buffer_size: usize,
    capacity: usize,
    permits: Arc<Semaphore>,
    idle: Mutex<Vec<(Vec<u8>, Instant)>>,
    tester: Option<BufferTester>,
    idle_timeout: Option<Duration>,
    counters: Counters,
}

impl PoolInner {
    fn take_idle(&self) -> Option<Vec<u8>> {
        let mut idle = match self.idle.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if let Some(timeout) = self.idle_timeout {
            let before = idle.len();
            idle.retain(|(_, since)| since.elapsed() < timeout);
            let expired = (before - idle.len()) as u64;
            if expired > 0 {
                self.counters.destroyed.fetch_add(expired, Ordering::Relaxed);
                trace!("Destroyed {} idle buffers", expired);
            }
        }

        idle.pop().map(|(buf, _)| buf)
    }

    fn give_back(&self, buf: Vec<u8>) {
        if let Some(tester) = &self.tester {
            self.counters.tested.fetch_add(1, Ordering::Relaxed);
            if !tester(&buf) {
                self.counters.destroyed.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }

        self.counters.returned.fetch_add(1, Ordering::Relaxed);
        let mut idle = match self.idle.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        idle.push((buf, Instant::now()));
    }
}

/// Snapshot of the pool counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub borrowed: u64,
    pub created: u64,
    pub returned: u64,
    pub destroyed: u64,
    pub tested: u64,
}

impl fmt::Display for PoolStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Borrowed: {} Created: {} Returned: {} Destroyed: {} Tested: {}",
            self.borrowed, self.created, self.returned, self.destroyed, self.tested
        )
    }
}

/// Shared handle to a buffer pool
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl BufferPool {
    pub fn new(capacity: usize, buffer_size: usize) -> Self {
        Self::build(capacity, buffer_size, None, None)
    }

    /// Pool with a validity test applied on return
    pub fn with_tester(capacity: usize, buffer_size: usize, tester: BufferTester) -> Self {
        Self::build(capacity, buffer_size, Some(tester), None)
    }

    fn build(
        capacity: usize,
        buffer_size: usize,
        tester: Option<BufferTester>,
        idle_timeout: Option<Duration>,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                buffer_size,
                capacity,
                permits: Arc::new(Semaphore::new(capacity)),
                idle: Mutex::new(Vec::with_capacity(capacity)),
                tester,
                idle_timeout,
                counters: Counters::default(),
            }),
        }
    }

    /// Destroy buffers that sat idle longer than `timeout`
    ///
    /// Only valid before the pool is shared.
    pub fn idle_timeout(self, timeout: Option<Duration>) -> Self {
        match Arc::try_unwrap(self.inner) {
            Ok(mut inner) => {
                inner.idle_timeout = timeout;
                Self {
                    inner: Arc::new(inner),
                }
            }
            Err(inner) => Self { inner },
        }
    }

    /// Borrow a buffer, waiting while the pool is at capacity
    ///
    /// Fails only after [`BufferPool::close`].
    pub async fn borrow(&self) -> TransportResult<PooledBuffer> {
        let permit = self
            .inner
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| TransportError::StreamClosed)?;

        let buf = match self.inner.take_idle() {
            Some(buf) => buf,
            None => {
                self.inner.counters.created.fetch_add(1, Ordering::Relaxed);
                vec![0u8; self.inner.buffer_size]
            }
        };
        self.inner.counters.borrowed.fetch_add(1, Ordering::Relaxed);

        Ok(PooledBuffer {
            buf: Some(buf),
            pool: self.inner.clone(),
            _permit: permit,
        })
    }

    /// Wake every waiting borrower with an error; outstanding buffers stay valid
    pub fn close(&self) {
        self.inner.permits.close();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.permits.is_closed()
    }

    /// Number of buffers currently held by borrowers
    pub fn in_use(&self) -> usize {
        self.inner.capacity - self.inner.permits.available_permits()
    }

    pub fn stats(&self) -> PoolStats {
        let c = &self.inner.counters;
        PoolStats {
            borrowed: c.borrowed.load(Ordering::Relaxed),
            created: c.created.load(Ordering::Relaxed),
            returned: c.returned.load(Ordering::Relaxed),
            destroyed: c.destroyed.load(Ordering::Relaxed),
            tested: c.tested.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("capacity", &self.inner.capacity)
            .field("buffer_size", &self.inner.buffer_size)
            .field("stats", &self.stats())
            .finish()
    }
}

/// A buffer exclusively owned by one borrower
///
/// Returned to its pool on drop. The permit is released only after the
/// buffer is back on the idle list.
pub struct PooledBuffer {
    buf: Option<Vec<u8>>,
    pool: Arc<PoolInner>,
    _permit: OwnedSemaphorePermit,
}

impl PooledBuffer {
    /// Explicit return; same as dropping
    pub fn give_back(self) {
        drop(self);
    }
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.buf.as_deref().unwrap_or(&[])
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.buf.as_deref_mut().unwrap_or(&mut [])
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.give_back(buf);
        }
    }
}

impl fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("len", &self.len())
            .finish()
    }
}
