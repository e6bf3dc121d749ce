//! Decoder instances: a backend engine plus the per-family policy applied to
//! what it reports.

mod h264;
mod jpeg;

use std::{sync::Arc, time::Instant};

use ivalink_core::prelude::*;
use smallvec::SmallVec;

use crate::{
    CodecError, CodecStats, RegistryError,
    engine::{BufIds, DecControl, DecodeArgs, DecodeEngine, DecodeOutArgs, DisplayInfo},
    params::{DecCreateParams, DecDynamicParams},
    registry::CodecRegistryHandle,
};

pub use h264::{H264Decoder, error_bits};
pub use jpeg::{AppMarkerConfig, JpegDecoder, extract_app_marker};

/// A picture the decoder released for display.
#[derive(Debug, Clone, PartialEq)]
pub struct DisplayFrame {
    pub tag: BufTag,
    pub info: DisplayInfo,
    pub meta: Option<Arc<[u8]>>,
}

/// Result of decoding one input unit.
#[derive(Debug, Clone, Default)]
pub struct DecodeOutcome {
    /// Buffers the codec no longer references, in release order.
    pub freed: BufIds,
    /// One entry per output slot of the request; `None` when nothing is displayable.
    pub outputs: SmallVec<[Option<DisplayFrame>; 2]>,
    /// Extended error of the last process call.
    pub extended_error: u32,
}

/// Decoder instance of one channel.
///
/// # Example
/// ```rust
/// use ivalink_codec::prelude::*;
///
/// struct Echo;
/// impl DecodeEngine for Echo {
///     fn control(&mut self, _: &DecControl) -> Result<(), CodecError> { Ok(()) }
///     fn process(&mut self, args: DecodeArgs<'_>) -> DecodeOutArgs {
///         let mut out = DecodeOutArgs::default();
///         out.bytes_consumed = args.input.len();
///         if let Some((tag, _)) = args.output {
///             out.output_ids.push(tag);
///             out.free_ids.push(tag);
///             out.display = Some(DisplayInfo { active_width: 64, active_height: 48, ..Default::default() });
///         }
///         out
///     }
/// }
///
/// let registry = CodecRegistry::new();
/// registry.register_decoder(CodecType::Mjpeg, |_: &DecCreateParams, _: &DecDynamicParams| -> Result<Box<dyn DecodeEngine>, CodecError> {
///     Ok(Box::new(Echo))
/// });
/// let params = DecCreateParams {
///     ch: 0,
///     codec: CodecType::Mjpeg,
///     max: Resolution::new(64, 48),
///     display_delay: 0,
///     process_call_level: ProcessCallLevel::Frame,
///     field_merge: false,
///     num_out_bufs: 2,
///     data_format: DataFormat::Yuv420SemiPlanar,
/// };
/// let mut dec = Decoder::create(&registry.handle(), params, DecDynamicParams::default(), None)?;
/// let out = Frame::new(0, BufTag(1), Payload::from_vec(vec![0; 64 * 48 * 3 / 2]));
/// let outcome = dec.decode(&[0xff, 0xd8], &[out]);
/// assert_eq!(outcome.outputs[0].as_ref().map(|d| d.tag), Some(BufTag(1)));
/// assert_eq!(outcome.freed.as_slice(), &[BufTag(1)]);
/// dec.delete();
/// dec.delete();
/// # Ok::<(), RegistryError>(())
/// ```
pub enum Decoder {
    Jpeg(JpegDecoder),
    H264(H264Decoder),
}

impl Decoder {
    /// Create the engine for `params.codec` and apply the initial dynamic params.
    pub fn create(
        registry: &CodecRegistryHandle,
        params: DecCreateParams,
        dynamic: DecDynamicParams,
        app_marker: Option<AppMarkerConfig>,
    ) -> Result<Self, RegistryError> {
        let mut engine = registry.create_decoder(&params, &dynamic)?;
        if let Err(err) = engine.control(&DecControl::SetParams(dynamic)) {
            engine.delete();
            return Err(err.into());
        }
        let state = DecState::new(engine, params, dynamic);
        Ok(if state.params.codec.is_h264() {
            Decoder::H264(H264Decoder::new(state))
        } else {
            Decoder::Jpeg(JpegDecoder::new(state, app_marker))
        })
    }

    fn state(&self) -> &DecState {
        match self {
            Decoder::Jpeg(d) => &d.state,
            Decoder::H264(d) => &d.state,
        }
    }

    fn state_mut(&mut self) -> &mut DecState {
        match self {
            Decoder::Jpeg(d) => &mut d.state,
            Decoder::H264(d) => &mut d.state,
        }
    }

    pub fn codec(&self) -> CodecType {
        self.state().params.codec
    }

    pub fn params(&self) -> &DecCreateParams {
        &self.state().params
    }

    pub fn dynamic(&self) -> &DecDynamicParams {
        &self.state().dynamic
    }

    /// Output buffers currently referenced by the codec.
    pub fn held(&self) -> usize {
        self.state().bufs_in_codec
    }

    pub fn stats(&self) -> &CodecStats {
        &self.state().stats
    }

    pub fn is_deleted(&self) -> bool {
        self.state().engine.is_none()
    }

    /// Decode `input` into the request's output frames.
    ///
    /// When the instance has been deleted every output is handed back as freed.
    pub fn decode(&mut self, input: &[u8], outputs: &[Frame]) -> DecodeOutcome {
        if self.is_deleted() {
            return DecodeOutcome {
                freed: outputs.iter().map(|f| f.tag).collect(),
                outputs: outputs.iter().map(|_| None).collect(),
                extended_error: 0,
            };
        }
        match self {
            Decoder::Jpeg(d) => d.decode(input, outputs),
            Decoder::H264(d) => d.decode(input, outputs),
        }
    }

    /// Drain every buffer the codec holds. Only H264 instances hold references.
    pub fn flush_all(&mut self) -> BufIds {
        match self {
            Decoder::Jpeg(_) => BufIds::new(),
            Decoder::H264(d) => d.flush_all(),
        }
    }

    /// Forward a control command to the engine.
    pub fn control(&mut self, cmd: &DecControl) -> Result<(), CodecError> {
        self.state_mut().control(cmd)
    }

    /// Replace the dynamic parameters.
    pub fn set_dynamic(&mut self, dynamic: DecDynamicParams) -> Result<(), CodecError> {
        self.state_mut().control(&DecControl::SetParams(dynamic))?;
        self.state_mut().dynamic = dynamic;
        Ok(())
    }

    /// Release the engine. Calling this again is a no-op.
    pub fn delete(&mut self) {
        let state = self.state_mut();
        if let Some(mut engine) = state.engine.take() {
            engine.delete();
            tracing::debug!(ch = state.params.ch, codec = %state.params.codec, "decoder deleted");
        }
        state.prev_out = None;
        state.out_bufs_in_use = false;
    }
}

impl Drop for Decoder {
    fn drop(&mut self) {
        self.delete();
    }
}

/// Bookkeeping shared by every decoder family.
pub(crate) struct DecState {
    engine: Option<Box<dyn DecodeEngine>>,
    pub(crate) params: DecCreateParams,
    pub(crate) dynamic: DecDynamicParams,
    /// Buffer the engine decoded into last, reused while it reports the buffer in use.
    pub(crate) prev_out: Option<(BufTag, Payload)>,
    pub(crate) out_bufs_in_use: bool,
    pub(crate) bufs_in_codec: usize,
    pub(crate) last_error: u32,
    pub(crate) stats: CodecStats,
}

impl DecState {
    fn new(engine: Box<dyn DecodeEngine>, params: DecCreateParams, dynamic: DecDynamicParams) -> Self {
        Self {
            engine: Some(engine),
            params,
            dynamic,
            prev_out: None,
            out_bufs_in_use: false,
            bufs_in_codec: 0,
            last_error: 0,
            stats: CodecStats::default(),
        }
    }

    /// Pick the buffer to decode into for one output slot.
    ///
    /// While the engine still uses the previous buffer, that buffer is reused
    /// and the slot's own frame goes straight back as freed.
    pub(crate) fn begin_slot(&mut self, slot: &Frame, freed: &mut BufIds) -> (BufTag, Payload) {
        let target = match (&self.prev_out, self.out_bufs_in_use) {
            (Some((tag, payload)), true) => {
                freed.push(slot.tag);
                self.bufs_in_codec = self.bufs_in_codec.saturating_sub(1);
                (*tag, payload.clone())
            }
            _ => (slot.tag, slot.payload.clone()),
        };
        self.bufs_in_codec += 1;
        target
    }

    pub(crate) fn process(&mut self, input: &[u8], output: Option<(BufTag, &Payload)>) -> DecodeOutArgs {
        let Some(engine) = self.engine.as_mut() else {
            return DecodeOutArgs {
                failed: true,
                ..DecodeOutArgs::default()
            };
        };
        let draining = output.is_none();
        let started = Instant::now();
        let out = engine.process(DecodeArgs { input, output });
        self.stats.record_process(started.elapsed(), out.failed);
        self.out_bufs_in_use = out.out_bufs_in_use;
        self.last_error = out.extended_error;
        // A failed call is how a drain ends.
        if out.failed && !draining {
            tracing::warn!(
                ch = self.params.ch,
                codec = %self.params.codec,
                extended_error = out.extended_error,
                "decode process failed"
            );
        }
        out
    }

    /// Record the ids the engine freed. An id repeated within `ids` counts once.
    pub(crate) fn release_ids(&mut self, ids: &[BufTag], freed: &mut BufIds) {
        let mut ids = BufIds::from_slice(ids);
        dedupe_ids(&mut ids);
        for id in ids {
            freed.push(id);
            self.bufs_in_codec = self.bufs_in_codec.saturating_sub(1);
        }
    }

    pub(crate) fn control(&mut self, cmd: &DecControl) -> Result<(), CodecError> {
        let engine = self.engine.as_mut().ok_or(CodecError::NotCreated)?;
        engine.control(cmd)
    }
}

/// Drop repeated ids, keeping the first occurrence.
///
/// Some engines report a freed buffer more than once in a single list.
///
/// # Example
/// ```rust
/// use ivalink_codec::{decoder::dedupe_ids, prelude::*};
/// use smallvec::smallvec;
///
/// let mut ids: BufIds = smallvec![BufTag(3), BufTag(1), BufTag(3)];
/// dedupe_ids(&mut ids);
/// assert_eq!(ids.as_slice(), &[BufTag(3), BufTag(1)]);
/// ```
pub fn dedupe_ids(ids: &mut BufIds) {
    let mut seen = BufIds::new();
    ids.retain(|id| {
        if seen.contains(id) {
            false
        } else {
            seen.push(*id);
            true
        }
    });
}

/// Display entry for `out`, if the engine released a picture.
pub(crate) fn displayed(out: &DecodeOutArgs) -> Option<DisplayFrame> {
    let tag = *out.output_ids.first()?;
    let info = out.display?;
    Some(DisplayFrame {
        tag,
        info,
        meta: None,
    })
}

/// Bytes of `input` after the first `consumed`.
pub(crate) fn remaining(input: &[u8], consumed: usize) -> &[u8] {
    input.get(consumed..).unwrap_or(&[])
}
