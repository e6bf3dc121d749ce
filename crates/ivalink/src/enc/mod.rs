//! The encode link: raw frames in, compressed units out.

mod channel;
mod driver;
mod worker;

use std::{
    sync::Arc,
    thread::{self, JoinHandle},
};

use ivalink_codec::prelude::*;
use parking_lot::Mutex;

use crate::{
    LinkError,
    config::{CodecSwitchParams, EncLinkParams, LinkLimits},
    mailbox::{Mailbox, Reply},
    neighbor::{Downstream, Upstream},
    pool::OutputPools,
    request::{Request, RequestPool},
    stats::{ChannelBufferStats, ChannelStats, LinkStats},
};

use channel::EncChannel;
use driver::EncDriver;

pub(crate) type EncRequest = Request<Frame, Bitstream, EncBarrier>;

#[derive(Debug)]
pub(crate) enum EncBarrier {
    /// Replace the channel's encoder once its queued frames are encoded.
    CodecSwitch {
        params: CodecSwitchParams,
        reply: Reply<()>,
    },
}

#[derive(Debug)]
pub(crate) enum EncCommand {
    SwitchCodec {
        ch: ChannelId,
        params: CodecSwitchParams,
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

pub(crate) struct EncShared {
    pub(crate) limits: LinkLimits,
    pub(crate) out: OutputPools<Bitstream>,
    /// Bitstream buffers allocated per pool.
    pub(crate) pool_sizes: Vec<usize>,
    pub(crate) channels: Vec<Mutex<EncChannel>>,
    pub(crate) codecs: Vec<Mutex<Option<Encoder>>>,
    pub(crate) requests: RequestPool<Frame, Bitstream, EncBarrier>,
    pub(crate) mailbox: Mailbox<EncCommand>,
    pub(crate) stats: LinkStats,
    registry: CodecRegistryHandle,
}

impl EncShared {
    pub(crate) fn channel(&self, ch: ChannelId) -> Result<&Mutex<EncChannel>, LinkError> {
        self.channels.get(ch).ok_or(LinkError::InvalidChannel(ch))
    }

    /// Create the encoder of `ch` from its current settings.
    pub(crate) fn open_codec(&self, ch: ChannelId) -> Result<(), LinkError> {
        let config = self.channel(ch)?.lock().config.clone();
        let encoder = Encoder::create(&self.registry, config.create_params(ch), config.initial_dynamic())
            .map_err(|err| {
                tracing::error!(ch, codec = %config.codec, error = %err, "encoder create failed");
                LinkError::from(err)
            })?;
        *self.codecs[ch].lock() = Some(encoder);
        tracing::info!(
            ch,
            codec = %config.codec,
            width = config.input.width,
            height = config.input.height,
            "encode channel created"
        );
        Ok(())
    }

    /// Replace the encoder of `ch`. Runs where no request of the channel is in flight.
    pub(crate) fn switch_codec(&self, ch: ChannelId, params: &CodecSwitchParams) -> Result<(), LinkError> {
        let previous = {
            let mut channel = self.channel(ch)?.lock();
            let previous = channel.config.clone();
            let next = params.apply_to(&previous);
            channel.switch_to(next);
            previous
        };
        if let Some(mut old) = self.codecs[ch].lock().take() {
            old.delete();
        }
        self.open_codec(ch)
            .map_err(|_| LinkError::ResourceAllocationFailed(ch))?;
        tracing::info!(ch, from = %previous.codec, to = %params.codec, "codec switched");
        Ok(())
    }

    pub(crate) fn close_codec(&self, ch: ChannelId) {
        if let Some(mut encoder) = self.codecs.get(ch).and_then(|c| c.lock().take()) {
            encoder.delete();
            tracing::info!(ch, "encode channel deleted");
        }
    }

    /// Record `update` for the fields named by `mask` after validating them
    /// against the channel's codec.
    fn set_dynamic(
        &self,
        ch: ChannelId,
        mask: ConfigMask,
        update: impl FnOnce(&mut EncDynamicParams),
    ) -> Result<(), LinkError> {
        let mut channel = self.channel(ch)?.lock();
        let mut next = channel.pending.clone();
        update(&mut next);
        validate_update(channel.config.codec, mask, &next)?;
        channel.pending = next;
        channel.mask.insert(mask);
        Ok(())
    }
}

/// An encode link.
///
/// Raw frames are pulled from the previous stage on
/// [`notify_new_data`](Self::notify_new_data); compressed units are offered
/// through [`get_full_buffers`](Self::get_full_buffers) and must come back
/// through [`put_empty_buffers`](Self::put_empty_buffers). Run-time settings
/// are validated at once and applied before the channel's next picture.
///
/// # Example
/// ```rust
/// use std::sync::Arc;
///
/// use ivalink::prelude::*;
///
/// struct Fixed;
/// impl EncodeEngine for Fixed {
///     fn control(&mut self, _: &EncControl) -> Result<(), CodecError> { Ok(()) }
///     fn process(&mut self, _: EncodeArgs<'_>) -> EncodeOutArgs {
///         EncodeOutArgs { bytes_generated: 16, ..EncodeOutArgs::default() }
///     }
/// }
///
/// struct Idle;
/// impl Upstream<Frame> for Idle {
///     fn get_full_buffers(&self) -> Vec<Frame> { Vec::new() }
///     fn put_empty_buffers(&self, _: Vec<Frame>) {}
/// }
/// impl Downstream for Idle {
///     fn notify_new_data(&self) {}
/// }
///
/// let registry = CodecRegistry::new();
/// registry.register_encoder(CodecType::H264High, |_: &EncCreateParams, _: &EncDynamicParams| -> Result<Box<dyn EncodeEngine>, CodecError> {
///     Ok(Box::new(Fixed))
/// });
/// let link = EncodeLink::create(
///     EncLinkParams::with_channels(vec![EncChannelConfig::default()]),
///     registry.handle(),
///     Arc::new(Idle),
///     Arc::new(Idle),
/// )?;
/// link.set_bitrate(0, 4_000_000)?;
/// assert!(link.set_bitrate(0, 1_000).is_err());
/// assert_eq!(link.dyn_params(0)?.target_bitrate, 4_000_000);
/// link.delete()?;
/// # Ok::<(), LinkError>(())
/// ```
pub struct EncodeLink {
    shared: Arc<EncShared>,
    task: Option<JoinHandle<()>>,
}

impl EncodeLink {
    /// Build the output pools, create every channel's encoder and start the threads.
    pub fn create(
        params: EncLinkParams,
        registry: CodecRegistryHandle,
        upstream: Arc<dyn Upstream<Frame>>,
        downstream: Arc<dyn Downstream>,
    ) -> Result<Self, LinkError> {
        let limits = params.limits.sanitized();
        limits.check_channels(params.channels.len())?;
        let per_channel = params.bufs_per_channel.clamp(1, limits.max_out_bufs_per_channel);
        let mut classes = Vec::with_capacity(params.channels.len());
        let mut pool_sizes = vec![0usize; ResolutionClass::ALL.len()];
        for (ch, cfg) in params.channels.iter().enumerate() {
            let class = cfg.resolution_class(ch)?;
            pool_sizes[class.index()] += per_channel;
            classes.push(class);
        }
        let total: usize = pool_sizes.iter().sum();

        let memory = match params.memory_budget {
            Some(bytes) => BufferPool::with_budget(bytes),
            None => BufferPool::unbounded(),
        };
        let out = OutputPools::new(&pool_sizes, total);
        let mut tag = 0u32;
        for class in ResolutionClass::ALL {
            let dims = class.max_dims();
            let bytes = (dims.width * dims.height * 3 / 2) as usize;
            for _ in 0..pool_sizes[class.index()] {
                let Some(lease) = memory.try_lease(bytes) else {
                    tracing::error!(?class, bytes, "no memory for bitstream buffers");
                    return Err(LinkError::ResourceExhausted("bitstream memory"));
                };
                let mut unit = Bitstream::new(0, BufTag(tag), Payload::new(lease));
                unit.alloc_pool = class.index();
                unit.fill_len = 0;
                out.put_empty(unit);
                tag += 1;
            }
        }

        let (mailbox, rx) = Mailbox::new();
        let count = params.channels.len();
        let shared = Arc::new(EncShared {
            limits,
            out,
            pool_sizes,
            channels: params
                .channels
                .into_iter()
                .zip(classes)
                .map(|(cfg, class)| Mutex::new(EncChannel::new(cfg, class.index())))
                .collect(),
            codecs: (0..count).map(|_| Mutex::new(None)).collect(),
            requests: RequestPool::new(total, 2 * limits.max_channels),
            mailbox,
            stats: LinkStats::new(count),
            registry,
        });
        // Encoders created so far are released with `shared` on failure.
        for ch in 0..count {
            shared.open_codec(ch)?;
        }

        let driver = EncDriver::start(shared.clone(), upstream, downstream)?;
        let task = thread::Builder::new()
            .name("ivalink-enc".into())
            .spawn(move || driver.run(rx))
            .map_err(|err| {
                tracing::error!(error = %err, "encode link task spawn failed");
                LinkError::ResourceExhausted("threads")
            })?;
        tracing::info!(link = "encode", channels = count, buffers = total, "link created");
        Ok(Self {
            shared,
            task: Some(task),
        })
    }

    pub fn notify_new_data(&self) {
        self.shared.mailbox.ring_new_data();
    }

    /// Take every compressed unit ready for the next stage.
    pub fn get_full_buffers(&self) -> Vec<Bitstream> {
        self.shared.out.get_full(usize::MAX)
    }

    /// Return units the next stage is done with.
    pub fn put_empty_buffers(&self, units: Vec<Bitstream>) {
        for mut unit in units {
            unit.fill_len = 0;
            unit.is_key_frame = false;
            self.shared.out.put_empty(unit);
        }
    }

    /// Target bitrate in bits per second.
    pub fn set_bitrate(&self, ch: ChannelId, bps: u32) -> Result<(), LinkError> {
        self.shared
            .set_dynamic(ch, ConfigMask::BITRATE, |d| d.target_bitrate = bps)
    }

    /// Output frame rate, optionally with a new bitrate. Restarts rate control.
    pub fn set_fps(&self, ch: ChannelId, fps: u32, bitrate: Option<u32>) -> Result<(), LinkError> {
        let mask = match bitrate {
            Some(_) => ConfigMask::FPS | ConfigMask::BITRATE,
            None => ConfigMask::FPS,
        };
        self.shared.set_dynamic(ch, mask, |d| {
            d.target_frame_rate = fps.saturating_mul(1000);
            if let Some(bps) = bitrate {
                d.target_bitrate = bps;
            }
        })?;
        self.shared.channel(ch)?.lock().reset_rate();
        Ok(())
    }

    /// Rate at which the previous stage delivers frames. Restarts rate control.
    pub fn set_input_fps(&self, ch: ChannelId, fps: u32) -> Result<(), LinkError> {
        if fps == 0 {
            return Err(LinkError::InvalidArg("input frame rate 0".into()));
        }
        let mut channel = self.shared.channel(ch)?.lock();
        channel.config.input_frame_rate = fps;
        channel.reset_rate();
        Ok(())
    }

    pub fn set_intra_interval(&self, ch: ChannelId, interval: u32) -> Result<(), LinkError> {
        self.shared
            .set_dynamic(ch, ConfigMask::INTRA_INTERVAL, |d| d.intra_interval = interval)
    }

    /// Make the channel's next picture an IDR.
    pub fn force_idr(&self, ch: ChannelId) -> Result<(), LinkError> {
        self.shared.set_dynamic(ch, ConfigMask::FORCE_IDR, |_| {})
    }

    pub fn set_rate_control(&self, ch: ChannelId, rate_control: RateControl) -> Result<(), LinkError> {
        self.shared
            .set_dynamic(ch, ConfigMask::RATE_CONTROL, |d| d.rate_control = rate_control)
    }

    /// QP range of intra pictures; for MJPEG `init` is the quality factor.
    pub fn set_qp_i(&self, ch: ChannelId, qp: QpRange) -> Result<(), LinkError> {
        self.shared.set_dynamic(ch, ConfigMask::QP_I, |d| d.qp_i = qp)
    }

    pub fn set_qp_p(&self, ch: ChannelId, qp: QpRange) -> Result<(), LinkError> {
        self.shared.set_dynamic(ch, ConfigMask::QP_P, |d| d.qp_p = qp)
    }

    pub fn set_vbr_duration(&self, ch: ChannelId, duration: u32) -> Result<(), LinkError> {
        self.shared
            .set_dynamic(ch, ConfigMask::VBR_DURATION, |d| d.vbr_duration = duration)
    }

    pub fn set_vbr_sensitivity(&self, ch: ChannelId, sensitivity: u32) -> Result<(), LinkError> {
        self.shared
            .set_dynamic(ch, ConfigMask::VBR_SENSITIVITY, |d| d.vbr_sensitivity = sensitivity)
    }

    /// Regions of interest, clipped to the channel's input size.
    pub fn set_roi(&self, ch: ChannelId, mut roi: RoiParams) -> Result<(), LinkError> {
        let input = self.shared.channel(ch)?.lock().config.input;
        if roi.clip_to(input.width, input.height) {
            tracing::warn!(ch, "ROI region count clamped");
        }
        self.shared.set_dynamic(ch, ConfigMask::ROI, |d| d.roi = roi)
    }

    pub fn set_packet_size(&self, ch: ChannelId, bytes: u32) -> Result<(), LinkError> {
        self.shared
            .set_dynamic(ch, ConfigMask::PACKET_SIZE, |d| d.max_packet_size = bytes)
    }

    /// Accept the channel's next frame regardless of rate control.
    pub fn force_dump_frame(&self, ch: ChannelId) -> Result<(), LinkError> {
        self.shared.channel(ch)?.lock().force_dump = true;
        Ok(())
    }

    /// Dynamic parameters the channel's encoder runs with, including
    /// changes not yet applied.
    pub fn dyn_params(&self, ch: ChannelId) -> Result<EncDynamicParams, LinkError> {
        Ok(self.shared.channel(ch)?.lock().pending.clone())
    }

    /// Replace the channel's codec once its queued frames are encoded.
    pub fn switch_codec(&self, ch: ChannelId, params: CodecSwitchParams) -> Result<(), LinkError> {
        self.shared
            .mailbox
            .call(|reply| EncCommand::SwitchCodec { ch, params, reply })
    }

    pub fn enable_channel(&self, ch: ChannelId) -> Result<(), LinkError> {
        self.shared.channel(ch)?.lock().enabled = true;
        tracing::debug!(ch, "encode channel enabled");
        Ok(())
    }

    pub fn disable_channel(&self, ch: ChannelId) -> Result<(), LinkError> {
        self.shared.channel(ch)?.lock().enabled = false;
        tracing::debug!(ch, "encode channel disabled");
        Ok(())
    }

    pub fn codec(&self, ch: ChannelId) -> Option<CodecType> {
        self.shared.codecs.get(ch)?.lock().as_ref().map(|e| e.codec())
    }

    pub fn codec_stats(&self, ch: ChannelId) -> Option<CodecStats> {
        self.shared
            .codecs
            .get(ch)?
            .lock()
            .as_ref()
            .map(|e| e.stats().clone())
    }

    /// Queued input frames and outstanding bitstream buffers of each channel's pool.
    pub fn buffer_stats(&self, chs: &[ChannelId]) -> Result<Vec<ChannelBufferStats>, LinkError> {
        let chs = chs.to_vec();
        self.shared
            .mailbox
            .call(|reply| EncCommand::BufferStats { chs, reply })
    }

    pub fn stats(&self) -> Vec<ChannelStats> {
        self.shared.stats.snapshot()
    }

    pub fn print_statistics(&self) -> Result<(), LinkError> {
        self.shared.mailbox.command(EncCommand::PrintStats)
    }

    pub fn stop(&self) -> Result<(), LinkError> {
        self.shared.mailbox.call(|reply| EncCommand::Stop { reply })
    }

    pub fn delete(mut self) -> Result<(), LinkError> {
        self.teardown_in_place()
    }

    fn teardown_in_place(&mut self) -> Result<(), LinkError> {
        let Some(task) = self.task.take() else {
            return Ok(());
        };
        let result = self.shared.mailbox.call(|reply| EncCommand::Shutdown { reply });
        if task.join().is_err() {
            tracing::error!(link = "encode", "link task panicked");
        }
        result
    }
}

impl Drop for EncodeLink {
    fn drop(&mut self) {
        let _ = self.teardown_in_place();
    }
}
