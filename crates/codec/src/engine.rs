//! The contract a codec backend implements.
//!
//! Buffers are identified by their [`BufTag`]: the link hands the codec an
//! output buffer together with its tag, and the codec reports back which tags
//! it no longer references (`free_ids`) and which tag holds a displayable
//! picture (`output_ids`).

use ivalink_core::prelude::*;
use smallvec::SmallVec;

use crate::{
    CodecError,
    params::{DecCreateParams, DecDynamicParams, EncCreateParams, EncDynamicParams},
};

/// Buffer ids released by one process call.
pub type BufIds = SmallVec<[BufTag; 8]>;

/// Coding type of a picture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PictureType {
    #[default]
    Unknown,
    Idr,
    I,
    P,
    B,
}

impl PictureType {
    pub fn is_intra(self) -> bool {
        matches!(self, PictureType::Idr | PictureType::I)
    }
}

/// Geometry of a picture the decoder wants displayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DisplayInfo {
    pub active_width: u32,
    pub active_height: u32,
    pub start_x: u32,
    pub start_y: u32,
    pub pitch: [u32; 2],
    pub field: FieldId,
    pub picture: PictureType,
}

/// Control commands accepted by a decode engine.
#[derive(Debug, Clone, PartialEq)]
pub enum DecControl {
    GetStatus,
    GetBufInfo,
    GetVersion,
    SetParams(DecDynamicParams),
    /// Enter flush mode: subsequent process calls return held pictures until the codec errors.
    Flush,
    Reset,
}

impl DecControl {
    pub fn name(&self) -> &'static str {
        match self {
            DecControl::GetStatus => "get-status",
            DecControl::GetBufInfo => "get-buf-info",
            DecControl::GetVersion => "get-version",
            DecControl::SetParams(_) => "set-params",
            DecControl::Flush => "flush",
            DecControl::Reset => "reset",
        }
    }
}

/// Inputs to one decode process call.
pub struct DecodeArgs<'a> {
    /// Compressed bytes not yet consumed.
    pub input: &'a [u8],
    /// Buffer the codec may decode into, with its id. `None` while draining in flush mode.
    pub output: Option<(BufTag, &'a Payload)>,
}

/// What a decode process call reports back.
#[derive(Debug, Clone, Default)]
pub struct DecodeOutArgs {
    /// The call itself failed. In flush mode this ends the drain.
    pub failed: bool,
    pub bytes_consumed: usize,
    /// Codec-specific error bits.
    pub extended_error: u32,
    pub free_ids: BufIds,
    pub output_ids: SmallVec<[BufTag; 2]>,
    /// The codec kept the output buffer it was given and will reuse it on the next call.
    pub out_bufs_in_use: bool,
    /// Geometry for `output_ids[0]`.
    pub display: Option<DisplayInfo>,
}

/// A decoder backend instance.
pub trait DecodeEngine: Send {
    fn control(&mut self, cmd: &DecControl) -> Result<(), CodecError>;

    fn process(&mut self, args: DecodeArgs<'_>) -> DecodeOutArgs;

    /// Release backend resources. Called once; the instance is dropped afterwards.
    fn delete(&mut self) {}
}

/// Control commands accepted by an encode engine.
#[derive(Debug, Clone, PartialEq)]
pub enum EncControl {
    GetStatus,
    GetBufInfo,
    SetParams(Box<EncDynamicParams>),
    Reset,
}

impl EncControl {
    pub fn name(&self) -> &'static str {
        match self {
            EncControl::GetStatus => "get-status",
            EncControl::GetBufInfo => "get-buf-info",
            EncControl::SetParams(_) => "set-params",
            EncControl::Reset => "reset",
        }
    }
}

/// Inputs to one encode process call.
pub struct EncodeArgs<'a> {
    /// One frame, or two fields of a field-separated source.
    pub inputs: &'a [Frame],
    pub output: &'a Payload,
    pub force_idr: bool,
}

/// What an encode process call reports back.
#[derive(Debug, Clone, Default)]
pub struct EncodeOutArgs {
    pub failed: bool,
    pub bytes_generated: usize,
    pub extended_error: u32,
    pub picture: PictureType,
}

/// An encoder backend instance.
pub trait EncodeEngine: Send {
    fn control(&mut self, cmd: &EncControl) -> Result<(), CodecError>;

    fn process(&mut self, args: EncodeArgs<'_>) -> EncodeOutArgs;

    fn delete(&mut self) {}
}

/// Creates decode engines.
///
/// Closures with the matching signature implement this trait.
///
/// # Example
/// ```rust
/// use ivalink_codec::prelude::*;
///
/// struct Null;
/// impl DecodeEngine for Null {
///     fn control(&mut self, _: &DecControl) -> Result<(), CodecError> { Ok(()) }
///     fn process(&mut self, _: DecodeArgs<'_>) -> DecodeOutArgs { DecodeOutArgs::default() }
/// }
///
/// let factory = |_: &DecCreateParams, _: &DecDynamicParams| -> Result<Box<dyn DecodeEngine>, CodecError> {
///     Ok(Box::new(Null))
/// };
/// let _: &dyn DecodeEngineFactory = &factory;
/// ```
pub trait DecodeEngineFactory: Send + Sync {
    fn create(
        &self,
        params: &DecCreateParams,
        dynamic: &DecDynamicParams,
    ) -> Result<Box<dyn DecodeEngine>, CodecError>;
}

impl<F> DecodeEngineFactory for F
where
    F: Fn(&DecCreateParams, &DecDynamicParams) -> Result<Box<dyn DecodeEngine>, CodecError>
        + Send
        + Sync,
{
    fn create(
        &self,
        params: &DecCreateParams,
        dynamic: &DecDynamicParams,
    ) -> Result<Box<dyn DecodeEngine>, CodecError> {
        self(params, dynamic)
    }
}

/// Creates encode engines.
pub trait EncodeEngineFactory: Send + Sync {
    fn create(
        &self,
        params: &EncCreateParams,
        dynamic: &EncDynamicParams,
    ) -> Result<Box<dyn EncodeEngine>, CodecError>;
}

impl<F> EncodeEngineFactory for F
where
    F: Fn(&EncCreateParams, &EncDynamicParams) -> Result<Box<dyn EncodeEngine>, CodecError>
        + Send
        + Sync,
{
    fn create(
        &self,
        params: &EncCreateParams,
        dynamic: &EncDynamicParams,
    ) -> Result<Box<dyn EncodeEngine>, CodecError> {
        self(params, dynamic)
    }
}
