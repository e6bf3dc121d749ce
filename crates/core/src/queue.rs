use crossbeam_queue::ArrayQueue;
use parking_lot::{Condvar, Mutex};
use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

/// Result of attempting to enqueue.
///
/// # Example
/// ```rust
/// use ivalink_core::prelude::{bounded, SendOutcome};
///
/// let (tx, _rx) = bounded::<u8>(1);
/// assert_eq!(tx.send(1), SendOutcome::Ok);
/// assert_eq!(tx.send(2), SendOutcome::Full);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Value was accepted.
    Ok,
    /// Queue is full.
    Full,
    /// Queue is closed.
    Closed,
}

/// Result of attempting to dequeue.
///
/// # Example
/// ```rust
/// use ivalink_core::prelude::{bounded, RecvOutcome};
///
/// let (_tx, rx) = bounded::<u8>(1);
/// assert!(matches!(rx.recv(), RecvOutcome::Empty));
/// ```
#[derive(Debug)]
pub enum RecvOutcome<T> {
    /// Received value.
    Data(T),
    /// Queue has been closed and drained.
    Closed,
    /// Queue currently empty.
    Empty,
}

impl<T> RecvOutcome<T> {
    /// The received value, if any.
    pub fn data(self) -> Option<T> {
        match self {
            RecvOutcome::Data(value) => Some(value),
            RecvOutcome::Closed | RecvOutcome::Empty => None,
        }
    }
}

/// Bounded sender handle.
///
/// A full queue is an ordinary condition, not an error. Use
/// [`BoundedTx::try_send`] to get the refused value back.
#[derive(Clone)]
pub struct BoundedTx<T> {
    inner: Arc<QueueInner<T>>,
}

impl<T> BoundedTx<T> {
    /// Attempt to send without blocking, dropping the value when it is refused.
    pub fn send(&self, value: T) -> SendOutcome {
        match self.try_send(value) {
            Ok(()) => SendOutcome::Ok,
            Err((outcome, _)) => outcome,
        }
    }

    /// Attempt to send without blocking, handing the value back when refused.
    ///
    /// # Example
    /// ```rust
    /// use ivalink_core::prelude::{bounded, SendOutcome};
    ///
    /// let (tx, _rx) = bounded::<u8>(1);
    /// tx.try_send(1).expect("room for one");
    /// let (outcome, value) = tx.try_send(2).unwrap_err();
    /// assert_eq!((outcome, value), (SendOutcome::Full, 2));
    /// ```
    pub fn try_send(&self, value: T) -> Result<(), (SendOutcome, T)> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err((SendOutcome::Closed, value));
        }
        match self.inner.queue.push(value) {
            Ok(()) => {
                self.inner.wake_one();
                Ok(())
            }
            Err(value) => Err((SendOutcome::Full, value)),
        }
    }

    /// Close the queue to further sends and release blocked receivers.
    pub fn close(&self) {
        self.inner.close();
    }

    /// Number of queued values.
    pub fn len(&self) -> usize {
        self.inner.queue.len()
    }

    /// Whether no value is queued.
    pub fn is_empty(&self) -> bool {
        self.inner.queue.is_empty()
    }

    /// Whether the next send would be refused with `Full`.
    pub fn is_full(&self) -> bool {
        self.inner.queue.is_full()
    }

    /// Fixed capacity chosen at construction.
    pub fn capacity(&self) -> usize {
        self.inner.queue.capacity()
    }
}

/// Bounded receiver handle.
///
/// # Example
/// ```rust
/// use ivalink_core::prelude::{bounded, RecvOutcome};
///
/// let (tx, rx) = bounded::<u8>(4);
/// tx.send(3);
/// assert!(matches!(rx.recv_wait(), RecvOutcome::Data(3)));
/// rx.close();
/// assert!(matches!(rx.recv_wait(), RecvOutcome::Closed));
/// ```
#[derive(Clone)]
pub struct BoundedRx<T> {
    inner: Arc<QueueInner<T>>,
}

impl<T> BoundedRx<T> {
    /// Attempt to receive without blocking.
    pub fn recv(&self) -> RecvOutcome<T> {
        match self.inner.queue.pop() {
            Some(value) => RecvOutcome::Data(value),
            None => {
                if self.inner.closed.load(Ordering::Acquire) {
                    RecvOutcome::Closed
                } else {
                    RecvOutcome::Empty
                }
            }
        }
    }

    /// Block until a value arrives or the queue is closed and drained.
    ///
    /// Values queued before `close` are still delivered.
    pub fn recv_wait(&self) -> RecvOutcome<T> {
        loop {
            if let Some(value) = self.inner.queue.pop() {
                return RecvOutcome::Data(value);
            }
            let mut guard = self.inner.lock.lock();
            if !self.inner.queue.is_empty() {
                continue;
            }
            if self.inner.closed.load(Ordering::Acquire) {
                return RecvOutcome::Closed;
            }
            self.inner.ready.wait(&mut guard);
        }
    }

    /// Block for at most `timeout`, returning `Empty` when it elapses.
    pub fn recv_timeout(&self, timeout: Duration) -> RecvOutcome<T> {
        if let Some(value) = self.inner.queue.pop() {
            return RecvOutcome::Data(value);
        }
        let mut guard = self.inner.lock.lock();
        if self.inner.queue.is_empty() && !self.inner.closed.load(Ordering::Acquire) {
            let _ = self.inner.ready.wait_for(&mut guard, timeout);
        }
        drop(guard);
        self.recv()
    }

    /// Pop up to `max` values without blocking.
    pub fn drain_up_to(&self, max: usize) -> Vec<T> {
        let mut out = Vec::with_capacity(max.min(self.inner.queue.len()));
        while out.len() < max {
            match self.inner.queue.pop() {
                Some(value) => out.push(value),
                None => break,
            }
        }
        out
    }

    /// Mark the queue as closed; senders see `Closed` and blocked receivers wake.
    pub fn close(&self) {
        self.inner.close();
    }

    /// Whether the queue has been closed.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Number of queued values.
    pub fn len(&self) -> usize {
        self.inner.queue.len()
    }

    /// Whether no value is queued.
    pub fn is_empty(&self) -> bool {
        self.inner.queue.is_empty()
    }

    /// Whether the queue is at capacity.
    pub fn is_full(&self) -> bool {
        self.inner.queue.is_full()
    }
}

struct QueueInner<T> {
    queue: ArrayQueue<T>,
    closed: AtomicBool,
    lock: Mutex<()>,
    ready: Condvar,
}

impl<T> QueueInner<T> {
    fn wake_one(&self) {
        let _guard = self.lock.lock();
        self.ready.notify_one();
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let _guard = self.lock.lock();
        self.ready.notify_all();
    }
}

/// Create a bounded queue with the given capacity.
///
/// A zero capacity is raised to one.
///
/// # Example
/// ```rust
/// use ivalink_core::prelude::{bounded, RecvOutcome, SendOutcome};
///
/// let (tx, rx) = bounded::<u8>(1);
/// assert_eq!(tx.send(1), SendOutcome::Ok);
/// assert!(matches!(rx.recv(), RecvOutcome::Data(1)));
/// ```
pub fn bounded<T>(capacity: usize) -> (BoundedTx<T>, BoundedRx<T>) {
    let inner = Arc::new(QueueInner {
        queue: ArrayQueue::new(capacity.max(1)),
        closed: AtomicBool::new(false),
        lock: Mutex::new(()),
        ready: Condvar::new(),
    });
    (
        BoundedTx {
            inner: inner.clone(),
        },
        BoundedRx { inner },
    )
}

/// Sender and receiver halves kept together by an owner that both produces and consumes.
pub struct Queue<T> {
    pub tx: BoundedTx<T>,
    pub rx: BoundedRx<T>,
}

impl<T> Queue<T> {
    /// Create a queue holding at most `capacity` values.
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity);
        Self { tx, rx }
    }
}
