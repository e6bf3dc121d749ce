//! Encoder instances and the application of run-time parameter changes.

mod h264;
mod jpeg;

use std::time::Instant;

use ivalink_core::prelude::*;

use crate::{
    CodecError, CodecStats, RegistryError,
    engine::{EncControl, EncodeArgs, EncodeEngine, PictureType},
    params::{ConfigMask, EncCreateParams, EncDynamicParams},
    registry::CodecRegistryHandle,
};

pub use h264::H264Encoder;
pub use jpeg::JpegEncoder;

/// Result of encoding one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodeOutcome {
    pub bytes: usize,
    pub key_frame: bool,
    pub picture: PictureType,
}

/// Check the fields named by `mask` against the limits of `codec`.
///
/// # Example
/// ```rust
/// use ivalink_codec::prelude::*;
///
/// let mut dynamic = EncDynamicParams::default();
/// dynamic.qp_i.init = 60;
/// assert!(validate_update(CodecType::H264High, ConfigMask::QP_I, &dynamic).is_err());
/// assert!(validate_update(CodecType::Mjpeg, ConfigMask::QP_I, &dynamic).is_ok());
/// ```
pub fn validate_update(
    codec: CodecType,
    mask: ConfigMask,
    dynamic: &EncDynamicParams,
) -> Result<(), CodecError> {
    if codec.is_h264() {
        h264::validate(mask, dynamic)
    } else {
        jpeg::validate(mask, dynamic)
    }
}

/// Encoder instance of one channel.
///
/// # Example
/// ```rust
/// use ivalink_codec::prelude::*;
///
/// struct Fixed;
/// impl EncodeEngine for Fixed {
///     fn control(&mut self, _: &EncControl) -> Result<(), CodecError> { Ok(()) }
///     fn process(&mut self, args: EncodeArgs<'_>) -> EncodeOutArgs {
///         EncodeOutArgs {
///             bytes_generated: 100,
///             picture: if args.force_idr { PictureType::Idr } else { PictureType::P },
///             ..EncodeOutArgs::default()
///         }
///     }
/// }
///
/// let registry = CodecRegistry::new();
/// registry.register_encoder(CodecType::H264High, |_: &EncCreateParams, _: &EncDynamicParams| -> Result<Box<dyn EncodeEngine>, CodecError> {
///     Ok(Box::new(Fixed))
/// });
/// let mut enc = Encoder::create(&registry.handle(), EncCreateParams::default(), EncDynamicParams::default())?;
/// let input = Frame::new(0, BufTag(0), Payload::from_vec(vec![0; 64]));
/// let output = Payload::from_vec(vec![0; 256]);
///
/// // The first picture of an instance is always an IDR.
/// assert!(enc.encode(&[input.clone()], &output)?.key_frame);
/// assert!(!enc.encode(&[input], &output)?.key_frame);
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub enum Encoder {
    Jpeg(JpegEncoder),
    H264(H264Encoder),
}

impl Encoder {
    /// Create the engine for `params.codec` and apply the initial dynamic params.
    pub fn create(
        registry: &CodecRegistryHandle,
        params: EncCreateParams,
        dynamic: EncDynamicParams,
    ) -> Result<Self, RegistryError> {
        validate_update(params.codec, ConfigMask::ALL, &dynamic)?;
        let mut engine = registry.create_encoder(&params, &dynamic)?;
        if let Err(err) = engine.control(&EncControl::SetParams(Box::new(dynamic.clone()))) {
            engine.delete();
            return Err(err.into());
        }
        tracing::debug!(ch = params.ch, codec = %params.codec, "encoder created");
        let state = EncState {
            engine: Some(engine),
            params,
            dynamic,
            force_idr: true,
            stats: CodecStats::default(),
        };
        Ok(if state.params.codec.is_h264() {
            Encoder::H264(H264Encoder::new(state))
        } else {
            Encoder::Jpeg(JpegEncoder::new(state))
        })
    }

    fn state(&self) -> &EncState {
        match self {
            Encoder::Jpeg(e) => &e.state,
            Encoder::H264(e) => &e.state,
        }
    }

    fn state_mut(&mut self) -> &mut EncState {
        match self {
            Encoder::Jpeg(e) => &mut e.state,
            Encoder::H264(e) => &mut e.state,
        }
    }

    pub fn codec(&self) -> CodecType {
        self.state().params.codec
    }

    pub fn params(&self) -> &EncCreateParams {
        &self.state().params
    }

    /// Dynamic parameters currently applied to the engine.
    pub fn dynamic(&self) -> &EncDynamicParams {
        &self.state().dynamic
    }

    pub fn stats(&self) -> &CodecStats {
        &self.state().stats
    }

    pub fn is_deleted(&self) -> bool {
        self.state().engine.is_none()
    }

    /// Copy the fields named by `mask` from `update` and push them to the engine.
    pub fn apply(&mut self, mask: ConfigMask, update: &EncDynamicParams) -> Result<(), CodecError> {
        if mask.is_empty() {
            return Ok(());
        }
        match self {
            Encoder::Jpeg(e) => e.apply(mask, update),
            Encoder::H264(e) => e.apply(mask, update),
        }
    }

    /// React to a change of the input geometry. The next picture is an IDR.
    pub fn set_input(&mut self, input: Resolution, pitch: u32) -> Result<(), CodecError> {
        let state = self.state_mut();
        if state.dynamic.input == input && state.dynamic.input_pitch == pitch {
            return Ok(());
        }
        tracing::info!(
            ch = state.params.ch,
            width = input.width,
            height = input.height,
            pitch,
            "encoder input resolution changed"
        );
        state.dynamic.input = input;
        state.dynamic.input_pitch = pitch;
        state.force_idr = true;
        state.push_params()
    }

    /// Encode `inputs` (one frame, or two fields) into `output`.
    pub fn encode(&mut self, inputs: &[Frame], output: &Payload) -> Result<EncodeOutcome, CodecError> {
        match self {
            Encoder::Jpeg(e) => e.encode(inputs, output),
            Encoder::H264(e) => e.encode(inputs, output),
        }
    }

    pub fn control(&mut self, cmd: &EncControl) -> Result<(), CodecError> {
        self.state_mut().control(cmd)
    }

    /// Release the engine. Calling this again is a no-op.
    pub fn delete(&mut self) {
        let state = self.state_mut();
        if let Some(mut engine) = state.engine.take() {
            engine.delete();
            tracing::debug!(ch = state.params.ch, codec = %state.params.codec, "encoder deleted");
        }
    }
}

impl Drop for Encoder {
    fn drop(&mut self) {
        self.delete();
    }
}

pub(crate) struct EncState {
    engine: Option<Box<dyn EncodeEngine>>,
    pub(crate) params: EncCreateParams,
    pub(crate) dynamic: EncDynamicParams,
    /// The next picture must be an IDR.
    pub(crate) force_idr: bool,
    pub(crate) stats: CodecStats,
}

impl EncState {
    pub(crate) fn control(&mut self, cmd: &EncControl) -> Result<(), CodecError> {
        let engine = self.engine.as_mut().ok_or(CodecError::NotCreated)?;
        engine.control(cmd)
    }

    pub(crate) fn push_params(&mut self) -> Result<(), CodecError> {
        let cmd = EncControl::SetParams(Box::new(self.dynamic.clone()));
        self.control(&cmd)
    }

    pub(crate) fn process(&mut self, inputs: &[Frame], output: &Payload) -> Result<EncodeOutcome, CodecError> {
        let engine = self.engine.as_mut().ok_or(CodecError::NotCreated)?;
        let force_idr = std::mem::take(&mut self.force_idr);
        let started = Instant::now();
        let out = engine.process(EncodeArgs {
            inputs,
            output,
            force_idr,
        });
        self.stats.record_process(started.elapsed(), out.failed);
        if out.failed {
            tracing::warn!(
                ch = self.params.ch,
                codec = %self.params.codec,
                extended_error = out.extended_error,
                "encode process failed"
            );
            // Retry the IDR on the next picture.
            self.force_idr |= force_idr;
            return Err(CodecError::Process(out.extended_error));
        }
        Ok(EncodeOutcome {
            bytes: out.bytes_generated,
            key_frame: out.picture.is_intra(),
            picture: out.picture,
        })
    }
}
