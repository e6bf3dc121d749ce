#![doc = include_str!("../README.md")]

pub use ivalink_codec as codec;
pub use ivalink_core as core;

pub mod config;
pub mod dec;
pub mod enc;
mod error;
mod mailbox;
pub mod neighbor;
mod pool;
mod request;
pub mod skip;
pub mod stats;

pub use error::LinkError;

pub mod prelude {
    pub use crate::LinkError;
    pub use crate::config::{
        CodecSwitchParams, CreateState, DecChannelConfig, DecLinkParams, EncChannelConfig,
        EncLinkParams, LinkLimits, TrickPlayConfig,
    };
    pub use crate::dec::{ChannelState, DecodeLink};
    pub use crate::enc::EncodeLink;
    pub use crate::neighbor::{Downstream, Upstream};
    pub use crate::skip::FrameSkip;
    pub use crate::stats::{ChannelBufferStats, ChannelStats};
    pub use ivalink_codec::decoder::AppMarkerConfig;
    pub use ivalink_codec::prelude::*;
}
