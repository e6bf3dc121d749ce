//! The buffer-exchange contract with the stages before and after a link.
//!
//! The previous stage is pulled: the link asks it for full buffers when told
//! new data is available and hands consumed buffers back as empty. The next
//! stage is pushed a notification and pulls finished buffers from the link
//! itself.

/// The stage feeding a link.
///
/// # Example
/// ```rust
/// use ivalink::neighbor::Upstream;
/// use parking_lot::Mutex;
///
/// #[derive(Default)]
/// struct Counter { returned: Mutex<Vec<u32>> }
///
/// impl Upstream<u32> for Counter {
///     fn get_full_buffers(&self) -> Vec<u32> { vec![1, 2] }
///     fn put_empty_buffers(&self, bufs: Vec<u32>) { self.returned.lock().extend(bufs) }
/// }
///
/// let stage = Counter::default();
/// let got = stage.get_full_buffers();
/// stage.put_empty_buffers(got);
/// assert_eq!(stage.returned.lock().len(), 2);
/// ```
pub trait Upstream<T>: Send + Sync {
    /// Take every buffer currently ready for this link.
    fn get_full_buffers(&self) -> Vec<T>;

    /// Give consumed or rejected buffers back.
    fn put_empty_buffers(&self, bufs: Vec<T>);
}

/// The stage fed by a link.
pub trait Downstream: Send + Sync {
    /// Full buffers are waiting to be pulled.
    fn notify_new_data(&self);
}
