//! The decode link task: input admission, submit and collect.

use std::{
    collections::VecDeque,
    ops::ControlFlow,
    sync::{Arc, atomic::Ordering, mpsc::Receiver},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use ivalink_codec::prelude::*;

use super::{ChannelState, DecBarrier, DecCommand, DecRequest, DecShared, channel::Admission, worker};
use crate::{
    LinkError,
    config::DecChannelConfig,
    mailbox::{Msg, Reply},
    neighbor::{Downstream, Upstream},
    request::RequestKind,
    skip::FrameSkip,
    stats::{ChannelBufferStats, Counter},
};

/// How long stop waits between checks on a worker that stopped answering.
const STOP_POLL: Duration = Duration::from_millis(100);

enum Submit {
    Sent,
    Skipped,
    /// No request object or no room in the worker queue.
    Blocked,
}

pub(super) struct DecDriver {
    shared: Arc<DecShared>,
    inputs: Vec<VecDeque<Bitstream>>,
    next_start: ChannelId,
    stopped: bool,
    process: BoundedTx<DecRequest>,
    done: BoundedRx<DecRequest>,
    worker: Option<JoinHandle<()>>,
    upstream: Arc<dyn Upstream<Bitstream>>,
    downstream: Arc<dyn Downstream>,
}

impl DecDriver {
    /// Spawn the worker and build the driver around its queues.
    pub(super) fn start(
        shared: Arc<DecShared>,
        upstream: Arc<dyn Upstream<Bitstream>>,
        downstream: Arc<dyn Downstream>,
    ) -> Result<Self, LinkError> {
        let depth = shared.requests.capacity();
        let (process, process_rx) = bounded(depth);
        let (done_tx, done) = bounded(depth);
        let for_worker = shared.clone();
        let worker = thread::Builder::new()
            .name("ivalink-dec-worker".into())
            .spawn(move || worker::run(&for_worker, &process_rx, &done_tx))
            .map_err(|err| {
                tracing::error!(error = %err, "decode worker spawn failed");
                LinkError::ResourceExhausted("threads")
            })?;
        Ok(Self {
            inputs: (0..shared.channels.len()).map(|_| VecDeque::new()).collect(),
            shared,
            next_start: 0,
            stopped: false,
            process,
            done,
            worker: Some(worker),
            upstream,
            downstream,
        })
    }

    pub(super) fn run(mut self, rx: Receiver<Msg<DecCommand>>) {
        while let Ok(msg) = rx.recv() {
            self.shared.mailbox.rearm(&msg);
            let flow = match msg {
                Msg::NewData => {
                    self.on_new_data();
                    ControlFlow::Continue(())
                }
                Msg::ProcessedData => {
                    self.collect();
                    ControlFlow::Continue(())
                }
                Msg::Command(cmd) => self.on_command(cmd),
            };
            if flow.is_break() {
                return;
            }
        }
    }

    fn on_command(&mut self, cmd: DecCommand) -> ControlFlow<()> {
        match cmd {
            DecCommand::CreateChannel { ch, config, reply } => self.create_channel(ch, config, reply),
            DecCommand::DeleteChannel { ch, reply } => self.delete_channel(ch, reply),
            DecCommand::BufferStats { chs, reply } => {
                let _ = reply.send(self.buffer_stats(&chs));
            }
            DecCommand::PrintStats => self.print_statistics(),
            DecCommand::Stop { reply } => {
                self.stop();
                let _ = reply.send(Ok(()));
            }
            DecCommand::Shutdown { reply } => {
                self.stop();
                for ch in 0..self.shared.channels.len() {
                    self.shared.close_channel(ch);
                }
                self.shared.frames.lock().clear();
                let _ = self.shared.out.get_full(usize::MAX);
                tracing::info!(link = "decode", "link deleted");
                let _ = reply.send(Ok(()));
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    fn on_new_data(&mut self) {
        let units = self.upstream.get_full_buffers();
        if self.stopped {
            if !units.is_empty() {
                self.upstream.put_empty_buffers(units);
            }
            return;
        }
        self.queue_inputs(units);
        self.submit();
    }

    /// Sort new units into channel queues, returning the rejected ones at once.
    fn queue_inputs(&mut self, units: Vec<Bitstream>) {
        let mut rejected = Vec::new();
        for unit in units {
            let ch = unit.ch;
            let Ok(channel) = self.shared.channel(ch) else {
                tracing::warn!(ch, "input for unknown channel");
                self.shared.stats.inc(ch, Counter::InputDropped);
                rejected.push(unit);
                continue;
            };
            self.shared.stats.inc(ch, Counter::Received);
            let admission = channel.lock().admit(&unit);
            match admission {
                Admission::Queue => self.inputs[ch].push_back(unit),
                Admission::Drop => {
                    self.shared.stats.inc(ch, Counter::InputDropped);
                    rejected.push(unit);
                }
                Admission::FlushBarrier => {
                    if let Err(unit) = self.inject_flush(unit) {
                        tracing::debug!(ch, "no request for flush marker, returned");
                        self.shared.stats.inc(ch, Counter::InputDropped);
                        rejected.push(unit);
                    }
                }
            }
        }
        if !rejected.is_empty() {
            self.upstream.put_empty_buffers(rejected);
        }
    }

    fn inject_flush(&mut self, unit: Bitstream) -> Result<(), Bitstream> {
        let Some(mut req) = self.shared.requests.acquire(unit.ch) else {
            return Err(unit);
        };
        req.kind = RequestKind::Barrier(DecBarrier::FlushFrame);
        req.inputs.push(unit);
        req.submitted = Some(Instant::now());
        match self.process.try_send(req) {
            Ok(()) => Ok(()),
            Err((_, mut req)) => {
                let unit = req.inputs.pop();
                self.shared.requests.release(req);
                unit.map_or(Ok(()), Err)
            }
        }
    }

    /// Feed the worker round-robin until no channel can make progress.
    fn submit(&mut self) {
        if self.stopped {
            return;
        }
        let count = self.inputs.len();
        loop {
            let mut progress = false;
            for i in 0..count {
                let ch = (self.next_start + i) % count;
                match self.submit_one(ch) {
                    Submit::Sent => progress = true,
                    Submit::Skipped => {}
                    Submit::Blocked => {
                        self.next_start = ch;
                        return;
                    }
                }
            }
            self.next_start = (self.next_start + 1) % count;
            if !progress {
                return;
            }
        }
    }

    fn submit_one(&mut self, ch: ChannelId) -> Submit {
        let Some(front) = self.inputs[ch].front() else {
            return Submit::Skipped;
        };
        if self.process.is_full() {
            return Submit::Blocked;
        }
        let flush = front.flush;
        let (created, need) = {
            let channel = self.shared.channels[ch].lock();
            (channel.is_created(), channel.config.outputs_per_request())
        };
        if !flush && !created {
            return Submit::Skipped;
        }
        if !flush && !self.outputs_available(ch, need) {
            return Submit::Skipped;
        }
        let Some(mut req) = self.shared.requests.acquire(ch) else {
            return Submit::Blocked;
        };
        if flush {
            req.kind = RequestKind::Barrier(DecBarrier::FlushFrame);
        } else {
            while req.outputs.len() < need {
                match self.shared.out.get_empty(ch) {
                    Some(frame) => req.outputs.push(frame),
                    None => break,
                }
            }
            if req.outputs.len() < need {
                self.shared.retry_on_free.store(true, Ordering::Release);
                for frame in req.outputs.drain(..) {
                    self.shared.out.put_empty(frame);
                }
                self.shared.requests.release(req);
                return Submit::Skipped;
            }
            let mut frames = self.shared.frames.lock();
            for frame in &req.outputs {
                frames.acquire(frame.tag);
            }
        }
        if let Some(unit) = self.inputs[ch].pop_front() {
            req.inputs.push(unit);
        }
        req.submitted = Some(Instant::now());
        match self.process.try_send(req) {
            Ok(()) => Submit::Sent,
            Err((_, mut req)) => {
                if let Some(unit) = req.inputs.pop() {
                    self.inputs[ch].push_front(unit);
                }
                let tags: Vec<BufTag> = req.outputs.drain(..).map(|f| f.tag).collect();
                self.shared.release_codec_frames(&tags);
                self.shared.requests.release(req);
                Submit::Blocked
            }
        }
    }

    /// Whether `ch` has `need` empty frames; arms the retry doorbell when not.
    fn outputs_available(&self, ch: ChannelId, need: usize) -> bool {
        if self.shared.out.empty_count(ch) >= need {
            return true;
        }
        self.shared.retry_on_free.store(true, Ordering::Release);
        // A frame freed before the flag was set did not ring.
        self.shared.out.empty_count(ch) >= need
    }

    fn collect(&mut self) {
        let cap = self.shared.limits.batch_cap;
        loop {
            let batch = self.done.drain_up_to(cap);
            if batch.is_empty() {
                break;
            }
            self.collect_batch(batch);
        }
        self.submit();
    }

    fn collect_batch(&mut self, batch: Vec<DecRequest>) {
        let mut consumed = Vec::new();
        let mut forward = Vec::new();
        let mut dropped = Vec::new();
        for mut req in batch {
            let ch = req.ch;
            consumed.extend(req.inputs.drain(..));
            if let Some(started) = req.submitted {
                self.shared.stats.latency.record_since(started);
            }
            if matches!(req.kind, RequestKind::Regular) {
                self.shared.stats.inc(ch, Counter::Processed);
            }
            for frame in req.outputs.drain(..) {
                if self.should_drop_output(ch) {
                    self.shared.stats.inc(ch, Counter::OutputDropped);
                    dropped.push(frame.tag);
                } else {
                    self.shared.stats.inc(ch, Counter::Forwarded);
                    forward.push(frame);
                }
            }
            self.shared.requests.release(req);
        }
        if !dropped.is_empty() {
            tracing::debug!(count = dropped.len(), "decoded frames dropped");
            self.shared.release_frames(&dropped);
        }
        if !forward.is_empty() {
            let rejected = self.shared.out.put_full(forward);
            let tags: Vec<BufTag> = rejected.iter().map(|f| f.tag).collect();
            self.shared.release_frames(&tags);
            self.downstream.notify_new_data();
        }
        if !consumed.is_empty() {
            self.upstream.put_empty_buffers(consumed);
        }
    }

    /// Trick-play rate conversion, then accumulation backpressure.
    fn should_drop_output(&self, ch: ChannelId) -> bool {
        let Some(channel) = self.shared.channels.get(ch) else {
            return false;
        };
        let mut channel = channel.lock();
        if channel.trick_play.should_skip() {
            return true;
        }
        let threshold = self.shared.limits.accumulation_threshold;
        channel.config.skip_on_accumulation
            && threshold < channel.num_out_bufs
            && self.shared.out.empty_count(ch) <= threshold
    }

    fn create_channel(&mut self, ch: ChannelId, config: DecChannelConfig, reply: Reply<()>) {
        let admitted = self.check_create(ch, &config);
        if let Err(err) = admitted {
            tracing::error!(ch, error = %err, "create channel refused");
            let _ = reply.send(Err(err));
            return;
        }
        {
            let mut channel = self.shared.channels[ch].lock();
            channel.trick_play = FrameSkip::new(config.trick_play.input_fps, config.trick_play.output_fps);
            channel.config = config;
            channel.state = ChannelState::CreatePending;
        }
        match self.shared.open_channel(ch) {
            Ok(()) => {
                let _ = reply.send(Ok(()));
            }
            Err(err) => {
                // Roll back through the delete path; the caller hears once it ran.
                let barrier = DecBarrier::ChannelDelete {
                    reply: Some(reply),
                    result: Err(err),
                };
                self.push_barrier(ch, barrier);
            }
        }
    }

    fn check_create(&self, ch: ChannelId, config: &DecChannelConfig) -> Result<(), LinkError> {
        if self.stopped {
            return Err(LinkError::Stopped);
        }
        let channel = self.shared.channel(ch)?;
        if channel.lock().state != ChannelState::NotCreated {
            return Err(LinkError::AlreadyCreated(ch));
        }
        config.validate(ch)
    }

    fn delete_channel(&mut self, ch: ChannelId, reply: Reply<()>) {
        let Ok(channel) = self.shared.channel(ch) else {
            let _ = reply.send(Err(LinkError::InvalidChannel(ch)));
            return;
        };
        {
            let mut channel = channel.lock();
            if channel.state != ChannelState::Created {
                let _ = reply.send(Err(LinkError::NotCreated(ch)));
                return;
            }
            channel.state = ChannelState::DeletePending;
        }
        self.shared.frames.lock().invalidate_channel(ch);
        let queued: Vec<Bitstream> = self.inputs[ch].drain(..).collect();
        if !queued.is_empty() {
            self.shared.stats.add(ch, Counter::InputDropped, queued.len() as u64);
            self.upstream.put_empty_buffers(queued);
        }
        tracing::debug!(ch, "channel delete queued");
        let barrier = DecBarrier::ChannelDelete {
            reply: Some(reply),
            result: Ok(()),
        };
        self.push_barrier(ch, barrier);
    }

    /// Queue `barrier` behind everything already submitted. Once stopped
    /// nothing is in flight and the barrier runs here.
    fn push_barrier(&mut self, ch: ChannelId, barrier: DecBarrier) {
        let req = self.shared.requests.acquire_barrier(ch, barrier);
        if self.stopped {
            worker::run_barrier(&self.shared, req);
            return;
        }
        if let Err((_, req)) = self.process.try_send(req) {
            tracing::error!(ch, "worker queue refused a barrier");
            worker::run_barrier(&self.shared, req);
        }
    }

    fn buffer_stats(&mut self, chs: &[ChannelId]) -> Result<Vec<ChannelBufferStats>, LinkError> {
        if !self.stopped {
            let units = self.upstream.get_full_buffers();
            self.queue_inputs(units);
        }
        chs.iter()
            .map(|&ch| {
                let channel = self.shared.channel(ch)?.lock();
                Ok(ChannelBufferStats {
                    ch,
                    queued_inputs: self.inputs[ch].len(),
                    outstanding_outputs: channel
                        .num_out_bufs
                        .saturating_sub(self.shared.out.empty_count(ch)),
                })
            })
            .collect()
    }

    fn print_statistics(&self) {
        for stats in self.shared.stats.snapshot() {
            let codec = self.shared.codecs[stats.ch].lock().as_ref().map(|d| d.stats().clone());
            tracing::info!(
                link = "decode",
                ch = stats.ch,
                received = stats.received,
                input_dropped = stats.input_dropped,
                processed = stats.processed,
                forwarded = stats.forwarded,
                output_dropped = stats.output_dropped,
                codec_errors = codec.as_ref().map_or(0, |c| c.errors()),
                codec_avg_ms = codec.as_ref().and_then(|c| c.avg_millis()).unwrap_or(0.0),
                "channel statistics"
            );
        }
        let memory = self.shared.memory.metrics();
        tracing::info!(
            link = "decode",
            requests = self.shared.stats.latency.total_samples(),
            latency_avg_ms = self.shared.stats.latency.avg_millis().unwrap_or(0.0),
            invalid_channel = self.shared.stats.invalid_channel(),
            duplicates = self.shared.frames.lock().dups_in_use(),
            memory_allocations = memory.allocations(),
            memory_refusals = memory.refusals(),
            "link statistics"
        );
    }

    /// Let every request in flight finish, then stop the worker and hand
    /// all pending input back.
    fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        while self.shared.requests.in_flight() > 0 {
            match self.done.recv_timeout(STOP_POLL) {
                RecvOutcome::Data(req) => self.collect_batch(vec![req]),
                RecvOutcome::Closed => break,
                RecvOutcome::Empty => {
                    if self.worker.as_ref().is_none_or(|w| w.is_finished()) {
                        tracing::error!(link = "decode", "worker gone with requests in flight");
                        break;
                    }
                }
            }
        }
        self.process.close();
        if let Some(worker) = self.worker.take()
            && worker.join().is_err()
        {
            tracing::error!(link = "decode", "worker panicked");
        }
        // Flush markers may still sit in the done queue.
        let rest = self.done.drain_up_to(usize::MAX);
        if !rest.is_empty() {
            self.collect_batch(rest);
        }
        let mut pending: Vec<Bitstream> = self.inputs.iter_mut().flat_map(|q| q.drain(..)).collect();
        pending.extend(self.upstream.get_full_buffers());
        if !pending.is_empty() {
            self.upstream.put_empty_buffers(pending);
        }
        tracing::info!(link = "decode", "link stopped");
    }
}
