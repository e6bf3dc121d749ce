//! Request objects and the fixed pool they circulate through.
//!
//! A request binds input buffers to output buffers for one pass through the
//! worker. Control operations ride the same worker queue as barrier requests
//! so they run exactly after every request queued before them.

use std::time::Instant;

use ivalink_core::prelude::*;
use smallvec::SmallVec;

use crate::LinkError;

/// Regular work or a barrier carrying a control operation.
#[derive(Debug)]
pub(crate) enum RequestKind<B> {
    Regular,
    Barrier(B),
}

#[derive(Debug)]
pub(crate) struct Request<I, O, B> {
    pub(crate) kind: RequestKind<B>,
    pub(crate) ch: ChannelId,
    pub(crate) inputs: SmallVec<[I; 2]>,
    pub(crate) outputs: SmallVec<[O; 2]>,
    pub(crate) submitted: Option<Instant>,
    /// Taken from the barrier reserve rather than the regular pool.
    from_reserve: bool,
}

impl<I, O, B> Request<I, O, B> {
    fn blank(from_reserve: bool) -> Self {
        Self {
            kind: RequestKind::Regular,
            ch: 0,
            inputs: SmallVec::new(),
            outputs: SmallVec::new(),
            submitted: None,
            from_reserve,
        }
    }

    pub(crate) fn is_regular(&self) -> bool {
        matches!(self.kind, RequestKind::Regular)
    }
}

/// Fixed set of request objects: a regular pool for data and a reserve for
/// barriers, so control operations never wait behind a saturated pipeline.
pub(crate) struct RequestPool<I, O, B> {
    regular: Queue<Request<I, O, B>>,
    reserve: Queue<Request<I, O, B>>,
    regular_total: usize,
}

impl<I, O, B> RequestPool<I, O, B> {
    pub(crate) fn new(regular: usize, reserve: usize) -> Self {
        let regular = regular.max(1);
        let reserve = reserve.max(1);
        let pool = Self {
            regular: Queue::new(regular),
            reserve: Queue::new(reserve),
            regular_total: regular,
        };
        for _ in 0..regular {
            pool.regular.tx.send(Request::blank(false));
        }
        for _ in 0..reserve {
            pool.reserve.tx.send(Request::blank(true));
        }
        pool
    }

    /// Total number of request objects, the depth every request queue needs.
    pub(crate) fn capacity(&self) -> usize {
        self.regular_total + self.reserve.tx.capacity()
    }

    pub(crate) fn acquire(&self, ch: ChannelId) -> Option<Request<I, O, B>> {
        let mut req = self.regular.rx.recv().data()?;
        req.ch = ch;
        Some(req)
    }

    /// Barrier requests are sized to never run out.
    ///
    /// # Panics
    /// When the reserve is exhausted, which means barriers are leaking.
    pub(crate) fn acquire_barrier(&self, ch: ChannelId, barrier: B) -> Request<I, O, B> {
        let Some(mut req) = self.reserve.rx.recv().data() else {
            tracing::error!(ch, "barrier request reserve exhausted");
            panic!("{}", LinkError::ResourceExhausted("barrier requests"));
        };
        req.ch = ch;
        req.kind = RequestKind::Barrier(barrier);
        req
    }

    /// Clear `req` and return it to the pool it came from.
    pub(crate) fn release(&self, mut req: Request<I, O, B>) {
        req.kind = RequestKind::Regular;
        req.inputs.clear();
        req.outputs.clear();
        req.submitted = None;
        let home = if req.from_reserve { &self.reserve } else { &self.regular };
        if home.tx.try_send(req).is_err() {
            tracing::error!("request released twice");
        }
    }

    /// Regular requests currently out of the pool.
    pub(crate) fn in_flight(&self) -> usize {
        self.regular_total - self.regular.rx.len()
    }
}
