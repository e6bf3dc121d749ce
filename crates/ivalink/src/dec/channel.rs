//! Decode channel state and input admission.

use ivalink_codec::prelude::*;

use crate::{config::DecChannelConfig, skip::FrameSkip};

/// Lifecycle of a channel's codec and output frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ChannelState {
    NotCreated,
    /// Runtime create in progress on the link task.
    CreatePending,
    Created,
    /// Delete barrier queued; the worker has not reached it yet.
    DeletePending,
}

/// What to do with an input unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Admission {
    Queue,
    Drop,
    /// Flush marker for a channel without a codec: nothing to drain, but it
    /// still travels the worker queue in order.
    FlushBarrier,
}

#[derive(Debug)]
pub(crate) struct DecChannel {
    pub(crate) state: ChannelState,
    pub(crate) enabled: bool,
    /// Set while disabled; cleared by the first key frame after enable.
    skip_until_key: bool,
    pub(crate) trick_play: FrameSkip,
    pub(crate) config: DecChannelConfig,
    pub(crate) num_out_bufs: usize,
}

impl DecChannel {
    pub(crate) fn new(config: DecChannelConfig) -> Self {
        let trick = config.trick_play;
        Self {
            state: ChannelState::NotCreated,
            enabled: true,
            skip_until_key: false,
            trick_play: FrameSkip::new(trick.input_fps, trick.output_fps),
            config,
            num_out_bufs: 0,
        }
    }

    pub(crate) fn is_created(&self) -> bool {
        self.state == ChannelState::Created
    }

    pub(crate) fn disable(&mut self) {
        self.enabled = false;
        self.skip_until_key = true;
    }

    pub(crate) fn enable(&mut self) {
        self.enabled = true;
    }

    pub(crate) fn admit(&mut self, unit: &Bitstream) -> Admission {
        if unit.flush {
            return if self.is_created() {
                Admission::Queue
            } else {
                Admission::FlushBarrier
            };
        }
        if !self.enabled {
            self.skip_until_key = true;
        } else if unit.is_key_frame {
            self.skip_until_key = false;
        }
        let intra_only = self.config.dynamic.decode_frame_type == DecodeFrameType::IOnly;
        if !self.is_created() || self.skip_until_key || (intra_only && !unit.is_key_frame) {
            return Admission::Drop;
        }
        Admission::Queue
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn created() -> DecChannel {
        let mut ch = DecChannel::new(DecChannelConfig::default());
        ch.state = ChannelState::Created;
        ch
    }

    fn unit(key: bool) -> Bitstream {
        Bitstream::new(0, BufTag(0), Payload::from_vec(vec![1])).key_frame(key)
    }

    #[test]
    fn disabled_channel_resumes_on_key_frame() {
        let mut ch = created();
        ch.disable();
        ch.disable();
        assert_eq!(ch.admit(&unit(true)), Admission::Drop);
        ch.enable();
        assert_eq!(ch.admit(&unit(false)), Admission::Drop);
        assert_eq!(ch.admit(&unit(true)), Admission::Queue);
        assert_eq!(ch.admit(&unit(false)), Admission::Queue);
    }

    #[test]
    fn flush_markers_bypass_gating() {
        let mut ch = created();
        ch.disable();
        assert_eq!(ch.admit(&unit(false).flush_marker()), Admission::Queue);
        let mut idle = DecChannel::new(DecChannelConfig::default());
        assert_eq!(idle.admit(&unit(true).flush_marker()), Admission::FlushBarrier);
        assert_eq!(idle.admit(&unit(true)), Admission::Drop);
    }

    #[test]
    fn intra_only_drops_predicted_units() {
        let mut ch = created();
        ch.config.dynamic.decode_frame_type = DecodeFrameType::IOnly;
        assert_eq!(ch.admit(&unit(false)), Admission::Drop);
        assert_eq!(ch.admit(&unit(true)), Admission::Queue);
    }
}
