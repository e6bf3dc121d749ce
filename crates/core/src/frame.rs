use std::sync::Arc;

use crate::{
    buffer::Payload,
    format::{CodecType, DataFormat, FieldId},
};

/// Logical stream index within a link.
pub type ChannelId = usize;

/// Owner-private identity of a buffer descriptor.
///
/// The stage that allocated a buffer chooses its tags; every other stage
/// passes them through untouched. Codecs use the tag as the buffer id in
/// their free/display reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufTag(pub u32);

/// Anything that moves between link queues.
pub trait LinkBuffer: Send + 'static {
    fn ch(&self) -> ChannelId;
    fn tag(&self) -> BufTag;
    /// Output pool this buffer is pinned to.
    fn alloc_pool(&self) -> usize;
}

/// Geometry and layout of a raw frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FrameInfo {
    pub width: u32,
    pub height: u32,
    /// Line pitch in bytes for luma and chroma.
    pub pitch: [u32; 2],
    pub start_x: u32,
    pub start_y: u32,
    pub data_format: DataFormat,
    pub field: FieldId,
    /// Geometry changed since the previous frame of this channel.
    pub rt_param_update: bool,
}

/// Descriptor of a raw video frame.
///
/// Cloning is shallow: the clone aliases the same payload memory.
///
/// # Example
/// ```rust
/// use ivalink_core::prelude::*;
///
/// let frame = Frame::new(0, BufTag(7), Payload::from_vec(vec![0; 96]));
/// let alias = frame.clone();
/// assert!(alias.payload.ptr_eq(&frame.payload));
/// assert_eq!(alias.tag, BufTag(7));
/// ```
#[derive(Debug, Clone)]
pub struct Frame {
    pub ch: ChannelId,
    pub tag: BufTag,
    pub alloc_pool: usize,
    pub payload: Payload,
    pub info: FrameInfo,
    /// Capture timestamp carried from the source unit.
    pub timestamp: u64,
    /// Application bytes extracted from the source unit (e.g. a JPEG APP segment).
    pub meta: Option<Arc<[u8]>>,
}

impl Frame {
    pub fn new(ch: ChannelId, tag: BufTag, payload: Payload) -> Self {
        Self {
            ch,
            tag,
            alloc_pool: 0,
            payload,
            info: FrameInfo::default(),
            timestamp: 0,
            meta: None,
        }
    }
}

impl LinkBuffer for Frame {
    fn ch(&self) -> ChannelId {
        self.ch
    }

    fn tag(&self) -> BufTag {
        self.tag
    }

    fn alloc_pool(&self) -> usize {
        self.alloc_pool
    }
}

/// Descriptor of a compressed unit.
///
/// # Example
/// ```rust
/// use ivalink_core::prelude::*;
///
/// let unit = Bitstream::new(1, BufTag(0), Payload::from_vec(vec![0xff, 0xd8]))
///     .with_codec(CodecType::Mjpeg)
///     .key_frame(true);
/// assert_eq!(unit.fill_len, 2);
/// assert!(unit.is_key_frame);
/// ```
#[derive(Debug, Clone)]
pub struct Bitstream {
    pub ch: ChannelId,
    pub tag: BufTag,
    pub alloc_pool: usize,
    pub payload: Payload,
    /// Valid bytes at the start of the payload.
    pub fill_len: usize,
    pub codec: CodecType,
    pub is_key_frame: bool,
    /// End-of-stream marker asking the link to flush the channel.
    pub flush: bool,
    pub width: u32,
    pub height: u32,
    pub timestamp: u64,
}

impl Bitstream {
    pub fn new(ch: ChannelId, tag: BufTag, payload: Payload) -> Self {
        let fill_len = payload.len();
        Self {
            ch,
            tag,
            alloc_pool: 0,
            payload,
            fill_len,
            codec: CodecType::H264High,
            is_key_frame: false,
            flush: false,
            width: 0,
            height: 0,
            timestamp: 0,
        }
    }

    pub fn with_codec(mut self, codec: CodecType) -> Self {
        self.codec = codec;
        self
    }

    pub fn key_frame(mut self, key: bool) -> Self {
        self.is_key_frame = key;
        self
    }

    pub fn flush_marker(mut self) -> Self {
        self.flush = true;
        self
    }

    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Copy of the valid bytes.
    pub fn bytes(&self) -> Vec<u8> {
        let lease = self.payload.lock();
        let valid = self.fill_len.min(lease.len());
        lease.as_slice()[..valid].to_vec()
    }
}

impl LinkBuffer for Bitstream {
    fn ch(&self) -> ChannelId {
        self.ch
    }

    fn tag(&self) -> BufTag {
        self.tag
    }

    fn alloc_pool(&self) -> usize {
        self.alloc_pool
    }
}
