//! The encode link task: rate control at the input, submit and collect.

use std::{
    collections::VecDeque,
    ops::ControlFlow,
    sync::{Arc, mpsc::Receiver},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use ivalink_codec::prelude::*;

use super::{EncBarrier, EncCommand, EncRequest, EncShared, worker};
use crate::{
    LinkError,
    config::CodecSwitchParams,
    mailbox::{Msg, Reply},
    neighbor::{Downstream, Upstream},
    stats::{ChannelBufferStats, Counter},
};

const STOP_POLL: Duration = Duration::from_millis(100);

enum Submit {
    Sent,
    Skipped,
    Blocked,
}

pub(super) struct EncDriver {
    shared: Arc<EncShared>,
    inputs: Vec<VecDeque<Frame>>,
    next_start: ChannelId,
    stopped: bool,
    process: BoundedTx<EncRequest>,
    done: BoundedRx<EncRequest>,
    worker: Option<JoinHandle<()>>,
    upstream: Arc<dyn Upstream<Frame>>,
    downstream: Arc<dyn Downstream>,
}

impl EncDriver {
    pub(super) fn start(
        shared: Arc<EncShared>,
        upstream: Arc<dyn Upstream<Frame>>,
        downstream: Arc<dyn Downstream>,
    ) -> Result<Self, LinkError> {
        let depth = shared.requests.capacity();
        let (process, process_rx) = bounded(depth);
        let (done_tx, done) = bounded(depth);
        let for_worker = shared.clone();
        let worker = thread::Builder::new()
            .name("ivalink-enc-worker".into())
            .spawn(move || worker::run(&for_worker, &process_rx, &done_tx))
            .map_err(|err| {
                tracing::error!(error = %err, "encode worker spawn failed");
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

    pub(super) fn run(mut self, rx: Receiver<Msg<EncCommand>>) {
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

    fn on_command(&mut self, cmd: EncCommand) -> ControlFlow<()> {
        match cmd {
            EncCommand::SwitchCodec { ch, params, reply } => self.switch_codec(ch, params, reply),
            EncCommand::BufferStats { chs, reply } => {
                let _ = reply.send(self.buffer_stats(&chs));
            }
            EncCommand::PrintStats => self.print_statistics(),
            EncCommand::Stop { reply } => {
                self.stop();
                let _ = reply.send(Ok(()));
            }
            EncCommand::Shutdown { reply } => {
                self.stop();
                for ch in 0..self.shared.channels.len() {
                    self.shared.close_codec(ch);
                }
                let _ = self.shared.out.get_full(usize::MAX);
                tracing::info!(link = "encode", "link deleted");
                let _ = reply.send(Ok(()));
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    fn on_new_data(&mut self) {
        let frames = self.upstream.get_full_buffers();
        if self.stopped {
            if !frames.is_empty() {
                self.upstream.put_empty_buffers(frames);
            }
            return;
        }
        self.queue_inputs(frames);
        self.submit();
    }

    fn queue_inputs(&mut self, frames: Vec<Frame>) {
        let mut rejected = Vec::new();
        for frame in frames {
            let ch = frame.ch;
            let Ok(channel) = self.shared.channel(ch) else {
                tracing::warn!(ch, "input for unknown channel");
                self.shared.stats.inc(ch, Counter::InputDropped);
                rejected.push(frame);
                continue;
            };
            self.shared.stats.inc(ch, Counter::Received);
            if channel.lock().admit(&frame) {
                self.inputs[ch].push_back(frame);
            } else {
                self.shared.stats.inc(ch, Counter::InputDropped);
                rejected.push(frame);
            }
        }
        if !rejected.is_empty() {
            self.upstream.put_empty_buffers(rejected);
        }
    }

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
        let (need, pool) = {
            let channel = self.shared.channels[ch].lock();
            (channel.config.inputs_per_request(), channel.pool)
        };
        if self.inputs[ch].len() < need {
            return Submit::Skipped;
        }
        if self.process.is_full() {
            return Submit::Blocked;
        }
        let Some(output) = self.shared.out.get_empty(pool) else {
            self.drop_inputs(ch, need);
            return Submit::Skipped;
        };
        let Some(mut req) = self.shared.requests.acquire(ch) else {
            self.shared.out.put_empty(output);
            return Submit::Blocked;
        };
        self.shared.channels[ch].lock().force_avoid_skip = false;
        req.outputs.push(output);
        req.inputs.extend(self.inputs[ch].drain(..need));
        req.submitted = Some(Instant::now());
        match self.process.try_send(req) {
            Ok(()) => Submit::Sent,
            Err((_, mut req)) => {
                for frame in req.inputs.drain(..).rev() {
                    self.inputs[ch].push_front(frame);
                }
                for unit in req.outputs.drain(..) {
                    self.shared.out.put_empty(unit);
                }
                self.shared.requests.release(req);
                Submit::Blocked
            }
        }
    }

    /// No bitstream buffer for the channel: the oldest picture goes back
    /// and rate control stops dropping until one is submitted again.
    fn drop_inputs(&mut self, ch: ChannelId, need: usize) {
        let dropped: Vec<Frame> = self.inputs[ch].drain(..need).collect();
        tracing::debug!(ch, count = dropped.len(), "no bitstream buffer, input dropped");
        self.shared.stats.add(ch, Counter::InputDropped, dropped.len() as u64);
        self.shared.channels[ch].lock().force_avoid_skip = true;
        self.upstream.put_empty_buffers(dropped);
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

    fn collect_batch(&mut self, batch: Vec<EncRequest>) {
        let mut consumed = Vec::new();
        let mut forward = Vec::new();
        for mut req in batch {
            let ch = req.ch;
            consumed.extend(req.inputs.drain(..));
            if let Some(started) = req.submitted {
                self.shared.stats.latency.record_since(started);
            }
            self.shared.stats.inc(ch, Counter::Processed);
            for unit in req.outputs.drain(..) {
                self.shared.stats.inc(ch, Counter::Forwarded);
                forward.push(unit);
            }
            self.shared.requests.release(req);
        }
        if !forward.is_empty() {
            for unit in self.shared.out.put_full(forward) {
                tracing::error!(ch = unit.ch, tag = unit.tag.0, "full queue refused a bitstream");
                self.shared.out.put_empty(unit);
            }
            self.downstream.notify_new_data();
        }
        if !consumed.is_empty() {
            self.upstream.put_empty_buffers(consumed);
        }
    }

    fn switch_codec(&mut self, ch: ChannelId, params: CodecSwitchParams, reply: Reply<()>) {
        let Ok(channel) = self.shared.channel(ch) else {
            let _ = reply.send(Err(LinkError::InvalidChannel(ch)));
            return;
        };
        // The new codec starts on a field boundary.
        channel.lock().synch_to_bottom_field = params.field_pic_encode;
        tracing::debug!(ch, codec = %params.codec, "codec switch queued");
        let req = self
            .shared
            .requests
            .acquire_barrier(ch, EncBarrier::CodecSwitch { params, reply });
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
            let frames = self.upstream.get_full_buffers();
            self.queue_inputs(frames);
        }
        chs.iter()
            .map(|&ch| {
                let pool = self.shared.channel(ch)?.lock().pool;
                Ok(ChannelBufferStats {
                    ch,
                    queued_inputs: self.inputs[ch].len(),
                    outstanding_outputs: self.shared.pool_sizes[pool]
                        .saturating_sub(self.shared.out.empty_count(pool)),
                })
            })
            .collect()
    }

    fn print_statistics(&self) {
        for stats in self.shared.stats.snapshot() {
            let codec = self.shared.codecs[stats.ch].lock().as_ref().map(|e| e.stats().clone());
            let bitrate = self.shared.channels[stats.ch].lock().pending.target_bitrate;
            tracing::info!(
                link = "encode",
                ch = stats.ch,
                received = stats.received,
                input_dropped = stats.input_dropped,
                processed = stats.processed,
                forwarded = stats.forwarded,
                output_dropped = stats.output_dropped,
                bitrate,
                codec_errors = codec.as_ref().map_or(0, |c| c.errors()),
                codec_avg_ms = codec.as_ref().and_then(|c| c.avg_millis()).unwrap_or(0.0),
                "channel statistics"
            );
        }
        tracing::info!(
            link = "encode",
            requests = self.shared.stats.latency.total_samples(),
            latency_avg_ms = self.shared.stats.latency.avg_millis().unwrap_or(0.0),
            invalid_channel = self.shared.stats.invalid_channel(),
            "link statistics"
        );
    }

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
                        tracing::error!(link = "encode", "worker gone with requests in flight");
                        break;
                    }
                }
            }
        }
        self.process.close();
        if let Some(worker) = self.worker.take()
            && worker.join().is_err()
        {
            tracing::error!(link = "encode", "worker panicked");
        }
        let rest = self.done.drain_up_to(usize::MAX);
        if !rest.is_empty() {
            self.collect_batch(rest);
        }
        let mut pending: Vec<Frame> = self.inputs.iter_mut().flat_map(|q| q.drain(..)).collect();
        pending.extend(self.upstream.get_full_buffers());
        if !pending.is_empty() {
            self.upstream.put_empty_buffers(pending);
        }
        tracing::info!(link = "encode", "link stopped");
    }
}
