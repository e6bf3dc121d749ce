#![doc = include_str!("../README.md")]

pub mod buffer;
pub mod format;
pub mod frame;
pub mod queue;

pub mod prelude {
    pub use crate::{
        buffer::{BufferLease, BufferPool, BufferPoolMetrics, Payload},
        format::{
            CodecType, DataFormat, FieldId, PAD_X, PAD_Y, Resolution, ResolutionClass,
            ScanFormat, align_up, decoded_buffer_dims,
        },
        frame::{BufTag, Bitstream, ChannelId, Frame, FrameInfo, LinkBuffer},
        queue::{BoundedRx, BoundedTx, Queue, RecvOutcome, SendOutcome, bounded},
    };
}
