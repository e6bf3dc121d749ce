//! Link counters and request latency.

use std::{
    collections::VecDeque,
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};

use ivalink_core::prelude::ChannelId;
use parking_lot::Mutex;

const DEFAULT_WINDOW: usize = 120;

/// Counters of one channel.
#[derive(Debug, Default)]
pub(crate) struct ChannelCounters {
    received: AtomicU64,
    input_dropped: AtomicU64,
    processed: AtomicU64,
    forwarded: AtomicU64,
    output_dropped: AtomicU64,
}

/// Snapshot of one channel's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ChannelStats {
    pub ch: ChannelId,
    /// Input buffers taken from the previous stage.
    pub received: u64,
    /// Input buffers returned without processing.
    pub input_dropped: u64,
    /// Requests run through the codec.
    pub processed: u64,
    /// Output buffers handed to the next stage.
    pub forwarded: u64,
    /// Finished output buffers discarded by rate control or backpressure.
    pub output_dropped: u64,
}

/// Buffers a channel holds at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ChannelBufferStats {
    pub ch: ChannelId,
    /// Input units waiting in the channel queue.
    pub queued_inputs: usize,
    /// Output buffers not sitting in the empty pool.
    pub outstanding_outputs: usize,
}

/// Counters of a whole link.
#[derive(Debug)]
pub(crate) struct LinkStats {
    channels: Vec<ChannelCounters>,
    invalid_channel: AtomicU64,
    pub(crate) latency: StageTiming,
}

#[derive(Clone, Copy)]
pub(crate) enum Counter {
    Received,
    InputDropped,
    Processed,
    Forwarded,
    OutputDropped,
}

impl LinkStats {
    pub(crate) fn new(channels: usize) -> Self {
        Self {
            channels: (0..channels).map(|_| ChannelCounters::default()).collect(),
            invalid_channel: AtomicU64::new(0),
            latency: StageTiming::default(),
        }
    }

    pub(crate) fn add(&self, ch: ChannelId, counter: Counter, n: u64) {
        let Some(c) = self.channels.get(ch) else {
            self.invalid_channel.fetch_add(n, Ordering::Relaxed);
            return;
        };
        let cell = match counter {
            Counter::Received => &c.received,
            Counter::InputDropped => &c.input_dropped,
            Counter::Processed => &c.processed,
            Counter::Forwarded => &c.forwarded,
            Counter::OutputDropped => &c.output_dropped,
        };
        cell.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn inc(&self, ch: ChannelId, counter: Counter) {
        self.add(ch, counter, 1);
    }

    /// Buffers that named a channel the link does not have.
    pub(crate) fn invalid_channel(&self) -> u64 {
        self.invalid_channel.load(Ordering::Relaxed)
    }

    pub(crate) fn snapshot(&self) -> Vec<ChannelStats> {
        self.channels
            .iter()
            .enumerate()
            .map(|(ch, c)| ChannelStats {
                ch,
                received: c.received.load(Ordering::Relaxed),
                input_dropped: c.input_dropped.load(Ordering::Relaxed),
                processed: c.processed.load(Ordering::Relaxed),
                forwarded: c.forwarded.load(Ordering::Relaxed),
                output_dropped: c.output_dropped.load(Ordering::Relaxed),
            })
            .collect()
    }
}

/// Rolling submit-to-collect latency of requests.
#[derive(Debug, Default)]
pub(crate) struct StageTiming {
    count: AtomicU64,
    window: Mutex<VecDeque<u64>>,
}

impl StageTiming {
    pub(crate) fn record_since(&self, started: Instant) {
        self.record(started.elapsed());
    }

    pub(crate) fn record(&self, dur: Duration) {
        let nanos = dur.as_nanos().min(u64::MAX as u128) as u64;
        self.count.fetch_add(1, Ordering::Relaxed);
        let mut win = self.window.lock();
        win.push_back(nanos);
        while win.len() > DEFAULT_WINDOW {
            win.pop_front();
        }
    }

    pub(crate) fn total_samples(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub(crate) fn avg_millis(&self) -> Option<f64> {
        let win = self.window.lock();
        if win.is_empty() {
            return None;
        }
        let total: u128 = win.iter().map(|n| *n as u128).sum();
        Some(total as f64 / 1_000_000.0 / win.len() as f64)
    }
}
