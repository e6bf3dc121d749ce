//! The decode link: compressed units in, decoded frames out.

mod channel;
mod driver;
mod frames;
mod worker;

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
};

use ivalink_codec::{decoder::AppMarkerConfig, prelude::*};
use parking_lot::Mutex;

use crate::{
    LinkError,
    config::{CreateState, DecChannelConfig, DecLinkParams, LinkLimits, TrickPlayConfig},
    mailbox::{Mailbox, Reply},
    neighbor::{Downstream, Upstream},
    pool::OutputPools,
    request::{Request, RequestPool},
    stats::{ChannelBufferStats, ChannelStats, LinkStats},
};

pub use channel::ChannelState;
use channel::DecChannel;
use driver::DecDriver;
use frames::{FrameStore, Release};

pub(crate) type DecRequest = Request<Bitstream, Frame, DecBarrier>;

/// Control operations ordered with the frames of a channel.
#[derive(Debug)]
pub(crate) enum DecBarrier {
    /// End-of-stream marker; drains what the codec holds.
    FlushFrame,
    /// Tear the channel down, then answer `reply` with `result`.
    ChannelDelete {
        reply: Option<Reply<()>>,
        result: Result<(), LinkError>,
    },
}

#[derive(Debug)]
pub(crate) enum DecCommand {
    CreateChannel {
        ch: ChannelId,
        config: DecChannelConfig,
        reply: Reply<()>,
    },
    DeleteChannel {
        ch: ChannelId,
        reply: Reply<()>,
    },
    BufferStats {
        chs: Vec<ChannelId>,
        reply: Reply<Vec<ChannelBufferStats>>,
    },
    PrintStats,
    Stop {
        reply: Reply<()>,
    },
    Shutdown {
        reply: Reply<()>,
    },
}

/// State reachable from every thread of a decode link.
pub(crate) struct DecShared {
    pub(crate) limits: LinkLimits,
    pub(crate) frames: Mutex<FrameStore>,
    pub(crate) out: OutputPools<Frame>,
    pub(crate) channels: Vec<Mutex<DecChannel>>,
    pub(crate) codecs: Vec<Mutex<Option<Decoder>>>,
    pub(crate) requests: RequestPool<Bitstream, Frame, DecBarrier>,
    /// A submit pass stopped for lack of output frames.
    pub(crate) retry_on_free: AtomicBool,
    pub(crate) mailbox: Mailbox<DecCommand>,
    pub(crate) stats: LinkStats,
    registry: CodecRegistryHandle,
    memory: BufferPool,
    app_marker: Option<AppMarkerConfig>,
}

impl DecShared {
    pub(crate) fn channel(&self, ch: ChannelId) -> Result<&Mutex<DecChannel>, LinkError> {
        self.channels.get(ch).ok_or(LinkError::InvalidChannel(ch))
    }

    /// Allocate the output frames of `ch` and create its decoder.
    ///
    /// On failure the frames allocated so far stay in the pool; the caller
    /// rolls back through [`DecShared::close_channel`].
    pub(crate) fn open_channel(&self, ch: ChannelId) -> Result<(), LinkError> {
        let config = self.channel(ch)?.lock().config.clone();
        config.validate(ch)?;
        let want = self.limits.resolve_bufs(ch, config.num_bufs_per_channel);
        let layout = config.frame_layout();
        let bytes = layout.data_format.frame_bytes(layout.pitch[0], layout.height);

        let mut allocated = 0;
        {
            let mut frames = self.frames.lock();
            while allocated < want {
                let Some(lease) = self.memory.try_lease(bytes) else {
                    break;
                };
                let mut frame = Frame::new(ch, BufTag(0), Payload::new(lease));
                frame.alloc_pool = ch;
                frame.info = layout;
                self.out.put_empty(frames.insert(frame));
                allocated += 1;
            }
        }
        if allocated == 0 {
            tracing::error!(ch, bytes, "no memory for output frames");
            return Err(LinkError::ResourceAllocationFailed(ch));
        }
        if allocated < want {
            tracing::error!(ch, want, allocated, "output memory exhausted, running with fewer frames");
        }

        let params = config.create_params(ch, allocated);
        let decoder = Decoder::create(&self.registry, params, config.dynamic, self.app_marker)
            .map_err(|err| {
                tracing::error!(ch, codec = %config.codec, error = %err, "decoder create failed");
                LinkError::ResourceAllocationFailed(ch)
            })?;
        *self.codecs[ch].lock() = Some(decoder);

        let mut channel = self.channel(ch)?.lock();
        channel.num_out_bufs = allocated;
        channel.state = ChannelState::Created;
        tracing::info!(
            ch,
            codec = %config.codec,
            width = config.max_width,
            height = config.max_height,
            frames = allocated,
            "decode channel created"
        );
        Ok(())
    }

    /// Delete the decoder of `ch` and free its output frames.
    ///
    /// Frames still held by the next stage are discarded when they come back.
    pub(crate) fn close_channel(&self, ch: ChannelId) {
        let Ok(channel) = self.channel(ch) else {
            return;
        };
        self.frames.lock().invalidate_channel(ch);
        let decoder = self.codecs[ch].lock().take();
        if let Some(mut decoder) = decoder {
            let flushed = decoder.flush_all();
            decoder.delete();
            self.release_codec_frames(&flushed);
        }
        // The engine is gone; whatever it still referenced has no owner left.
        let held = self.frames.lock().codec_held(ch);
        if !held.is_empty() {
            tracing::debug!(ch, count = held.len(), "releasing frames held by the deleted decoder");
            self.release_codec_frames(&held);
        }
        let still_out = {
            let mut frames = self.frames.lock();
            for frame in self.out.drain_empty(ch) {
                frames.remove(frame.tag);
            }
            frames.count(ch)
        };
        let mut channel = channel.lock();
        let was = channel.state;
        channel.state = ChannelState::NotCreated;
        channel.num_out_bufs = 0;
        if was != ChannelState::NotCreated {
            tracing::info!(ch, still_out, "decode channel deleted");
        }
    }

    /// Drop one reference per tag on behalf of the next stage.
    pub(crate) fn release_frames(&self, tags: &[BufTag]) {
        self.release_with(tags, FrameStore::release);
    }

    /// Drop the codec's reference on each tag.
    pub(crate) fn release_codec_frames(&self, tags: &[BufTag]) {
        self.release_with(tags, FrameStore::release_codec);
    }

    /// Frames whose last holder let go return to their empty pool before the
    /// store is unlocked, so a concurrent channel delete drains them.
    fn release_with(&self, tags: &[BufTag], release: fn(&mut FrameStore, BufTag) -> Release) {
        if tags.is_empty() {
            return;
        }
        let mut freed = false;
        {
            let mut frames = self.frames.lock();
            for tag in tags {
                match release(&mut *frames, *tag) {
                    Release::Empty(frame) => {
                        self.out.put_empty(frame);
                        freed = true;
                    }
                    Release::Held | Release::Discarded => {}
                    Release::NotHeld => tracing::warn!(tag = tag.0, "codec freed a frame it does not hold"),
                    Release::Unknown => tracing::warn!(tag = tag.0, "release of an unknown frame"),
                }
            }
        }
        if freed && self.retry_on_free.swap(false, Ordering::AcqRel) {
            self.mailbox.ring_new_data();
        }
    }
}

/// A decode link.
///
/// Compressed units are pulled from the previous stage when
/// [`notify_new_data`](Self::notify_new_data) is called and decoded frames
/// are offered to the next stage through [`get_full_buffers`](Self::get_full_buffers).
/// Frames must come back through [`put_empty_buffers`](Self::put_empty_buffers).
///
/// # Example
/// ```rust
/// use std::sync::Arc;
///
/// use ivalink::prelude::*;
///
/// struct Idle;
/// impl Upstream<Bitstream> for Idle {
///     fn get_full_buffers(&self) -> Vec<Bitstream> { Vec::new() }
///     fn put_empty_buffers(&self, _: Vec<Bitstream>) {}
/// }
/// impl Downstream for Idle {
///     fn notify_new_data(&self) {}
/// }
///
/// let cfg = DecChannelConfig { create_state: CreateState::DoNotCreate, ..DecChannelConfig::default() };
/// let link = DecodeLink::create(
///     DecLinkParams::with_channels(vec![cfg]),
///     CodecRegistry::new().handle(),
///     Arc::new(Idle),
///     Arc::new(Idle),
/// )?;
/// assert_eq!(link.channel_state(0), Some(ChannelState::NotCreated));
/// assert_eq!(link.delete_channel(0), Err(LinkError::NotCreated(0)));
/// link.delete()?;
/// # Ok::<(), LinkError>(())
/// ```
pub struct DecodeLink {
    shared: Arc<DecShared>,
    task: Option<JoinHandle<()>>,
}

impl DecodeLink {
    /// Build the link, create every channel marked for creation and start its threads.
    pub fn create(
        params: DecLinkParams,
        registry: CodecRegistryHandle,
        upstream: Arc<dyn Upstream<Bitstream>>,
        downstream: Arc<dyn Downstream>,
    ) -> Result<Self, LinkError> {
        let limits = params.limits.sanitized();
        limits.check_channels(params.channels.len())?;
        for (ch, cfg) in params.channels.iter().enumerate() {
            cfg.validate(ch)?;
        }
        let count = params.channels.len();
        let per_channel = limits.max_out_bufs_per_channel;
        let total = count * per_channel;
        let (mailbox, rx) = Mailbox::new();
        let memory = match params.memory_budget {
            Some(bytes) => BufferPool::with_budget(bytes),
            None => BufferPool::unbounded(),
        };
        let create: Vec<bool> = params
            .channels
            .iter()
            .map(|c| c.create_state == CreateState::Create)
            .collect();
        let shared = Arc::new(DecShared {
            limits,
            frames: Mutex::new(FrameStore::new(total, limits.max_dup_per_frame)),
            out: OutputPools::new(&vec![per_channel; count], 2 * total),
            channels: params
                .channels
                .into_iter()
                .map(|c| Mutex::new(DecChannel::new(c)))
                .collect(),
            codecs: (0..count).map(|_| Mutex::new(None)).collect(),
            requests: RequestPool::new(total, 2 * limits.max_channels),
            retry_on_free: AtomicBool::new(false),
            mailbox,
            stats: LinkStats::new(count),
            registry,
            memory,
            app_marker: params.app_marker,
        });

        for (ch, _) in create.iter().enumerate().filter(|(_, c)| **c) {
            if let Err(err) = shared.open_channel(ch) {
                for ch in 0..count {
                    shared.close_channel(ch);
                }
                return Err(err);
            }
        }

        let driver = DecDriver::start(shared.clone(), upstream, downstream)?;
        let task = thread::Builder::new()
            .name("ivalink-dec".into())
            .spawn(move || driver.run(rx))
            .map_err(|err| {
                tracing::error!(error = %err, "decode link task spawn failed");
                LinkError::ResourceExhausted("threads")
            })?;
        tracing::info!(link = "decode", channels = count, "link created");
        Ok(Self {
            shared,
            task: Some(task),
        })
    }

    /// The previous stage has full buffers for this link.
    pub fn notify_new_data(&self) {
        self.shared.mailbox.ring_new_data();
    }

    /// Take every decoded frame ready for the next stage.
    pub fn get_full_buffers(&self) -> Vec<Frame> {
        self.shared.out.get_full(usize::MAX)
    }

    /// Return frames the next stage is done with.
    pub fn put_empty_buffers(&self, frames: Vec<Frame>) {
        let tags: Vec<BufTag> = frames.iter().map(|f| f.tag).collect();
        drop(frames);
        self.shared.release_frames(&tags);
    }

    /// Create a channel configured [`DoNotCreate`](crate::config::CreateState::DoNotCreate)
    /// or deleted earlier.
    ///
    /// On failure the channel is rolled back before this returns.
    pub fn create_channel(&self, ch: ChannelId, config: DecChannelConfig) -> Result<(), LinkError> {
        self.shared
            .mailbox
            .call(|reply| DecCommand::CreateChannel { ch, config, reply })
    }

    /// Delete a channel once every frame submitted before this call has been decoded.
    pub fn delete_channel(&self, ch: ChannelId) -> Result<(), LinkError> {
        self.shared
            .mailbox
            .call(|reply| DecCommand::DeleteChannel { ch, reply })
    }

    pub fn enable_channel(&self, ch: ChannelId) -> Result<(), LinkError> {
        self.shared.channel(ch)?.lock().enable();
        tracing::debug!(ch, "decode channel enabled");
        Ok(())
    }

    /// Drop input of `ch` until the first key frame after the next enable.
    pub fn disable_channel(&self, ch: ChannelId) -> Result<(), LinkError> {
        self.shared.channel(ch)?.lock().disable();
        tracing::debug!(ch, "decode channel disabled");
        Ok(())
    }

    /// Change the display rate conversion of `ch`.
    pub fn set_trick_play(&self, ch: ChannelId, trick_play: TrickPlayConfig) -> Result<(), LinkError> {
        if trick_play.input_fps == 0 || trick_play.output_fps == 0 {
            return Err(LinkError::InvalidArg(format!(
                "trick play {}/{} fps",
                trick_play.input_fps, trick_play.output_fps
            )));
        }
        let mut channel = self.shared.channel(ch)?.lock();
        channel.config.trick_play = trick_play;
        channel.trick_play.set_rates(trick_play.input_fps, trick_play.output_fps);
        tracing::debug!(ch, input = trick_play.input_fps, output = trick_play.output_fps, "trick play set");
        Ok(())
    }

    pub fn channel_state(&self, ch: ChannelId) -> Option<ChannelState> {
        self.shared.channels.get(ch).map(|c| c.lock().state)
    }

    /// Queued input units and outstanding output frames of each channel in `chs`.
    pub fn buffer_stats(&self, chs: &[ChannelId]) -> Result<Vec<ChannelBufferStats>, LinkError> {
        let chs = chs.to_vec();
        self.shared
            .mailbox
            .call(|reply| DecCommand::BufferStats { chs, reply })
    }

    pub fn stats(&self) -> Vec<ChannelStats> {
        self.shared.stats.snapshot()
    }

    /// Processing counters of the decoder of `ch`, while it exists.
    pub fn codec_stats(&self, ch: ChannelId) -> Option<CodecStats> {
        self.shared
            .codecs
            .get(ch)?
            .lock()
            .as_ref()
            .map(|d| d.stats().clone())
    }

    /// References held on the original behind `tag`: one for the codec or
    /// the next stage, plus one per live duplicate.
    pub fn frame_refs(&self, tag: BufTag) -> Option<u32> {
        self.shared.frames.lock().refs(tag)
    }

    /// Original frame behind `tag`, following a duplicate to its origin.
    pub fn frame_origin(&self, tag: BufTag) -> Option<BufTag> {
        self.shared.frames.lock().origin(tag)
    }

    /// Bytes of output frame memory currently allocated.
    pub fn output_memory(&self) -> usize {
        self.shared.memory.outstanding_bytes()
    }

    pub fn duplicates_in_use(&self) -> usize {
        self.shared.frames.lock().dups_in_use()
    }

    /// Log per-channel counters and codec timing.
    pub fn print_statistics(&self) -> Result<(), LinkError> {
        self.shared.mailbox.command(DecCommand::PrintStats)
    }

    /// Finish every request in flight and stop accepting input.
    pub fn stop(&self) -> Result<(), LinkError> {
        self.shared.mailbox.call(|reply| DecCommand::Stop { reply })
    }

    /// Stop, then delete every channel and release all frames.
    pub fn delete(mut self) -> Result<(), LinkError> {
        self.teardown_in_place()
    }

    fn teardown_in_place(&mut self) -> Result<(), LinkError> {
        let Some(task) = self.task.take() else {
            return Ok(());
        };
        let result = self.shared.mailbox.call(|reply| DecCommand::Shutdown { reply });
        if task.join().is_err() {
            tracing::error!(link = "decode", "link task panicked");
        }
        result
    }
}

impl Drop for DecodeLink {
    fn drop(&mut self) {
        let _ = self.teardown_in_place();
    }
}
