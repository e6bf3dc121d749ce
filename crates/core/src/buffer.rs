use parking_lot::{Mutex, MutexGuard};
use std::sync::{
    Arc,
    atomic::{AtomicU64, AtomicUsize, Ordering},
};

/// Handle to a block of payload memory.
///
/// When dropped, the bytes are given back to the originating pool's budget
/// and the allocation is kept for reuse.
///
/// # Example
/// ```rust
/// use ivalink_core::prelude::BufferPool;
///
/// let pool = BufferPool::with_budget(1024);
/// let lease = pool.try_lease(512).expect("within budget");
/// assert_eq!(lease.len(), 512);
/// assert_eq!(pool.outstanding_bytes(), 512);
/// drop(lease);
/// assert_eq!(pool.outstanding_bytes(), 0);
/// ```
pub struct BufferLease {
    pool: Option<Arc<PoolInner>>,
    buf: Vec<u8>,
    reserved: usize,
}

impl BufferLease {
    /// Wrap memory that does not belong to any pool.
    pub fn detached(buf: Vec<u8>) -> Self {
        Self {
            pool: None,
            buf,
            reserved: 0,
        }
    }

    /// Borrow as an immutable slice.
    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    /// Borrow as a mutable slice.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    /// Current length of the buffer.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

impl Drop for BufferLease {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.recycle(std::mem::take(&mut self.buf), self.reserved);
        }
    }
}

/// Payload allocator with an optional byte budget.
///
/// Output memory for a link is carved from one pool; a lease that would
/// exceed the budget is refused instead of allocated, so callers can run with
/// fewer buffers.
///
/// # Example
/// ```rust
/// use ivalink_core::prelude::BufferPool;
///
/// let pool = BufferPool::with_budget(100);
/// let _a = pool.try_lease(60).expect("first fits");
/// assert!(pool.try_lease(60).is_none());
/// assert_eq!(pool.metrics().refusals(), 1);
/// ```
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
    metrics: BufferPoolMetrics,
}

impl BufferPool {
    /// Pool without a byte budget.
    pub fn unbounded() -> Self {
        Self::with_limits(None, 0)
    }

    /// Pool refusing leases once `bytes` are outstanding.
    pub fn with_budget(bytes: usize) -> Self {
        Self::with_limits(Some(bytes), 0)
    }

    /// Pool with an optional budget and a maximum number of retained free allocations.
    pub fn with_limits(budget: Option<usize>, max_free: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                free: Mutex::new(Vec::with_capacity(max_free)),
                max_free,
                budget,
                outstanding: AtomicUsize::new(0),
            }),
            metrics: BufferPoolMetrics::default(),
        }
    }

    /// Lease `len` zeroed bytes, or `None` when the budget cannot cover them.
    pub fn try_lease(&self, len: usize) -> Option<BufferLease> {
        if !self.inner.reserve(len) {
            self.metrics.count(|c| &c.refused);
            return None;
        }
        let recycled = {
            let mut free = self.inner.free.lock();
            let idx = free.iter().position(|b| b.capacity() >= len);
            idx.map(|idx| free.swap_remove(idx))
        };
        let buf = match recycled {
            Some(mut buf) => {
                self.metrics.count(|c| &c.recycled);
                buf.resize(len, 0);
                buf
            }
            None => {
                self.metrics.count(|c| &c.allocated);
                vec![0; len]
            }
        };
        Some(BufferLease {
            pool: Some(self.inner.clone()),
            buf,
            reserved: len,
        })
    }

    /// Bytes currently leased out.
    pub fn outstanding_bytes(&self) -> usize {
        self.inner.outstanding.load(Ordering::Acquire)
    }

    /// Configured budget, if any.
    pub fn budget(&self) -> Option<usize> {
        self.inner.budget
    }

    /// Lease counters, shared with every clone of this pool.
    pub fn metrics(&self) -> BufferPoolMetrics {
        self.metrics.clone()
    }
}

struct PoolInner {
    free: Mutex<Vec<Vec<u8>>>,
    max_free: usize,
    budget: Option<usize>,
    outstanding: AtomicUsize,
}

impl PoolInner {
    fn reserve(&self, len: usize) -> bool {
        let Some(budget) = self.budget else {
            self.outstanding.fetch_add(len, Ordering::AcqRel);
            return true;
        };
        self.outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                cur.checked_add(len).filter(|next| *next <= budget)
            })
            .is_ok()
    }

    fn recycle(&self, mut buf: Vec<u8>, reserved: usize) {
        self.outstanding.fetch_sub(reserved, Ordering::AcqRel);
        buf.clear();
        let mut free = self.free.lock();
        if free.len() < self.max_free {
            free.push(buf);
        }
    }
}

/// How leases were served since the pool was created.
#[derive(Clone, Default)]
pub struct BufferPoolMetrics(Arc<LeaseCounts>);

#[derive(Default)]
struct LeaseCounts {
    recycled: AtomicU64,
    allocated: AtomicU64,
    refused: AtomicU64,
}

impl BufferPoolMetrics {
    fn count(&self, which: impl Fn(&LeaseCounts) -> &AtomicU64) {
        which(&self.0).fetch_add(1, Ordering::Relaxed);
    }

    /// Leases served from a returned allocation.
    pub fn recycled(&self) -> u64 {
        self.0.recycled.load(Ordering::Relaxed)
    }

    pub fn allocations(&self) -> u64 {
        self.0.allocated.load(Ordering::Relaxed)
    }

    /// Leases turned down because the budget was spent.
    pub fn refusals(&self) -> u64 {
        self.0.refused.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for BufferPoolMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPoolMetrics")
            .field("recycled", &self.recycled())
            .field("allocations", &self.allocations())
            .field("refusals", &self.refusals())
            .finish()
    }
}

/// Shared payload memory.
///
/// Cloning a `Payload` aliases the same bytes; a duplicated frame
/// descriptor is therefore a shallow copy of its original.
///
/// # Example
/// ```rust
/// use ivalink_core::prelude::Payload;
///
/// let a = Payload::from_vec(vec![1, 2, 3]);
/// let b = a.clone();
/// a.lock().as_mut_slice()[0] = 9;
/// assert_eq!(b.lock().as_slice()[0], 9);
/// assert!(a.ptr_eq(&b));
/// ```
#[derive(Clone)]
pub struct Payload(Arc<Mutex<BufferLease>>);

impl Payload {
    /// Wrap a pooled lease.
    pub fn new(lease: BufferLease) -> Self {
        Self(Arc::new(Mutex::new(lease)))
    }

    /// Wrap owned bytes outside any pool.
    pub fn from_vec(buf: Vec<u8>) -> Self {
        Self::new(BufferLease::detached(buf))
    }

    /// Zero-length payload for descriptors whose memory is not allocated.
    pub fn empty() -> Self {
        Self::from_vec(Vec::new())
    }

    /// Lock the bytes for reading or writing.
    pub fn lock(&self) -> MutexGuard<'_, BufferLease> {
        self.0.lock()
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    /// Whether the payload has no bytes.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether both handles alias the same memory.
    pub fn ptr_eq(&self, other: &Payload) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl std::fmt::Debug for Payload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Payload")
            .field("addr", &Arc::as_ptr(&self.0))
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_is_returned_on_drop() {
        let pool = BufferPool::with_budget(300);
        let a = pool.try_lease(100).expect("a");
        let b = pool.try_lease(200).expect("b");
        assert!(pool.try_lease(1).is_none());
        drop(a);
        assert_eq!(pool.outstanding_bytes(), 200);
        let c = pool.try_lease(100).expect("c fits after a returned");
        drop((b, c));
        assert_eq!(pool.outstanding_bytes(), 0);
    }

    #[test]
    fn recycled_allocations_are_reused() {
        let pool = BufferPool::with_limits(None, 2);
        drop(pool.try_lease(64).expect("first"));
        let again = pool.try_lease(32).expect("second");
        assert_eq!(again.len(), 32);
        assert!(again.as_slice().iter().all(|b| *b == 0));
        assert_eq!(pool.metrics().recycled(), 1);
        assert_eq!(pool.metrics().allocations(), 1);
    }

    #[test]
    fn clones_share_lease_counts() {
        let pool = BufferPool::with_budget(32);
        let other = pool.clone();
        let held = other.try_lease(32).expect("fits");
        assert!(pool.try_lease(1).is_none());
        assert_eq!((pool.metrics().allocations(), pool.metrics().refusals()), (1, 1));
        drop(held);
        assert!(other.try_lease(16).is_some());
        assert_eq!(pool.metrics().refusals(), 1);
    }

    #[test]
    fn payload_memory_released_when_last_alias_drops() {
        let pool = BufferPool::with_budget(64);
        let payload = Payload::new(pool.try_lease(64).expect("lease"));
        let alias = payload.clone();
        drop(payload);
        assert_eq!(pool.outstanding_bytes(), 64);
        drop(alias);
        assert_eq!(pool.outstanding_bytes(), 0);
    }
}
