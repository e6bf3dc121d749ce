//! Output buffer pools: one empty queue per allocation pool and a shared
//! full queue towards the next stage.

use ivalink_core::prelude::*;

/// Empty and full queues for the output buffers of a link.
///
/// A buffer is pinned to the pool named by its `alloc_pool` and always
/// returns there. Every queue is sized to hold the whole population, so puts
/// only fail on a buffer the pools never owned.
pub(crate) struct OutputPools<T> {
    empty: Vec<Queue<T>>,
    full: Queue<T>,
}

impl<T: LinkBuffer> OutputPools<T> {
    /// `sizes[i]` is the population of pool `i`; `full_capacity` bounds the full queue.
    pub(crate) fn new(sizes: &[usize], full_capacity: usize) -> Self {
        Self {
            empty: sizes.iter().map(|n| Queue::new(*n)).collect(),
            full: Queue::new(full_capacity),
        }
    }

    /// Non-blocking: `None` is an ordinary outcome.
    pub(crate) fn get_empty(&self, pool: usize) -> Option<T> {
        self.empty.get(pool)?.rx.recv().data()
    }

    pub(crate) fn put_empty(&self, buf: T) {
        let pool = buf.alloc_pool();
        let tag = buf.tag();
        let refused = match self.empty.get(pool) {
            Some(queue) => queue.tx.try_send(buf).is_err(),
            None => true,
        };
        if refused {
            tracing::error!(pool, tag = tag.0, "empty buffer refused by its pool");
        }
    }

    pub(crate) fn empty_count(&self, pool: usize) -> usize {
        self.empty.get(pool).map_or(0, |q| q.rx.len())
    }

    /// Remove every empty buffer of `pool`.
    pub(crate) fn drain_empty(&self, pool: usize) -> Vec<T> {
        match self.empty.get(pool) {
            Some(queue) => queue.rx.drain_up_to(usize::MAX),
            None => Vec::new(),
        }
    }

    /// Queue finished buffers for the next stage, returning any that do not fit.
    pub(crate) fn put_full(&self, bufs: Vec<T>) -> Vec<T> {
        let mut rejected = Vec::new();
        for buf in bufs {
            if let Err((_, buf)) = self.full.tx.try_send(buf) {
                rejected.push(buf);
            }
        }
        if !rejected.is_empty() {
            tracing::error!(count = rejected.len(), "full queue overflow");
        }
        rejected
    }

    pub(crate) fn get_full(&self, max: usize) -> Vec<T> {
        self.full.rx.drain_up_to(max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bits(pool: usize, tag: u32) -> Bitstream {
        let mut unit = Bitstream::new(0, BufTag(tag), Payload::empty());
        unit.alloc_pool = pool;
        unit
    }

    #[test]
    fn buffers_return_to_their_pinned_pool() {
        let pools = OutputPools::new(&[2, 1], 3);
        pools.put_empty(bits(1, 7));
        pools.put_empty(bits(0, 1));
        assert_eq!(pools.empty_count(1), 1);
        assert_eq!(pools.get_empty(1).map(|b| b.tag), Some(BufTag(7)));
        assert!(pools.get_empty(1).is_none());
        assert!(pools.get_empty(5).is_none());
        assert_eq!(pools.drain_empty(0).len(), 1);
    }

    #[test]
    fn full_queue_keeps_order_and_reports_overflow() {
        let pools = OutputPools::<Bitstream>::new(&[1], 2);
        let rejected = pools.put_full(vec![bits(0, 1), bits(0, 2), bits(0, 3)]);
        assert_eq!(rejected.len(), 1);
        let tags: Vec<_> = pools.get_full(8).iter().map(|b| b.tag).collect();
        assert_eq!(tags, [BufTag(1), BufTag(2)]);
    }
}
