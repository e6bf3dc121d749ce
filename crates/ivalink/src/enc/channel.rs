//! Encode channel state: frame-rate control, field pairing and pending
//! dynamic parameters.

use ivalink_codec::prelude::*;

use crate::{config::EncChannelConfig, skip::FrameSkip};

#[derive(Debug)]
pub(crate) struct EncChannel {
    pub(crate) config: EncChannelConfig,
    /// Values the next request applies for the bits set in `mask`.
    pub(crate) pending: EncDynamicParams,
    pub(crate) mask: ConfigMask,
    pub(crate) enabled: bool,
    rate: FrameSkip,
    /// Accept the next frame regardless of rate control.
    pub(crate) force_dump: bool,
    /// The last submit had to drop input; do not drop more for rate.
    pub(crate) force_avoid_skip: bool,
    next_field: FieldId,
    /// Accept input again from the field after the next bottom field.
    pub(crate) synch_to_bottom_field: bool,
    /// Output pool of the channel's resolution class.
    pub(crate) pool: usize,
}

impl EncChannel {
    pub(crate) fn new(config: EncChannelConfig, pool: usize) -> Self {
        let pending = config.initial_dynamic();
        let rate = FrameSkip::new(config.input_frame_rate, pending.target_frame_rate / 1000);
        Self {
            config,
            pending,
            mask: ConfigMask::empty(),
            enabled: true,
            rate,
            force_dump: false,
            force_avoid_skip: false,
            next_field: FieldId::Top,
            synch_to_bottom_field: false,
            pool,
        }
    }

    /// Restart rate control from the current input and target rates.
    pub(crate) fn reset_rate(&mut self) {
        self.rate = FrameSkip::new(self.config.input_frame_rate, self.pending.target_frame_rate / 1000);
    }

    fn rate_skip(&mut self) -> bool {
        if self.rate.output_fps() == 0 {
            return true;
        }
        self.rate.should_skip()
    }

    /// Whether `frame` enters the channel queue.
    pub(crate) fn admit(&mut self, frame: &Frame) -> bool {
        if self.config.scan == ScanFormat::Progressive {
            self.next_field = FieldId::Top;
        }
        let mut skip = false;
        if self.force_dump {
            self.force_dump = false;
        } else {
            skip = self.rate_skip() && !self.force_avoid_skip;
        }
        let field = frame.info.field;
        if self.synch_to_bottom_field {
            if field == FieldId::Bottom {
                skip = false;
                self.next_field = FieldId::Top;
                self.synch_to_bottom_field = false;
            } else {
                skip = true;
            }
        }
        if (field == self.next_field || field == FieldId::Frame) && self.enabled && !skip {
            self.next_field = self.next_field.toggled();
            return true;
        }
        if field == self.next_field {
            self.next_field = self.next_field.toggled();
        }
        false
    }

    /// Replace the channel settings after a codec switch.
    pub(crate) fn switch_to(&mut self, config: EncChannelConfig) {
        self.pending = config.initial_dynamic();
        self.mask = ConfigMask::empty();
        self.config = config;
        self.next_field = FieldId::Top;
        self.reset_rate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(field: FieldId) -> Frame {
        let mut f = Frame::new(0, BufTag(0), Payload::empty());
        f.info.field = field;
        f
    }

    #[test]
    fn rate_control_halves_the_input() {
        let mut cfg = EncChannelConfig::default();
        cfg.dynamic.target_frame_rate = 15_000;
        let mut ch = EncChannel::new(cfg, 0);
        let kept = (0..30).filter(|_| ch.admit(&frame(FieldId::Frame))).count();
        assert_eq!(kept, 15);
    }

    #[test]
    fn zero_target_rate_drops_everything_but_forced_dumps() {
        let mut cfg = EncChannelConfig::default();
        cfg.dynamic.target_frame_rate = 0;
        let mut ch = EncChannel::new(cfg, 0);
        assert!(!ch.admit(&frame(FieldId::Frame)));
        ch.force_dump = true;
        assert!(ch.admit(&frame(FieldId::Frame)));
        assert!(!ch.admit(&frame(FieldId::Frame)));
    }

    #[test]
    fn fields_alternate_starting_from_top() {
        let cfg = EncChannelConfig {
            scan: ScanFormat::Interlaced,
            ..EncChannelConfig::default()
        };
        let mut ch = EncChannel::new(cfg, 0);
        assert!(!ch.admit(&frame(FieldId::Bottom)));
        assert!(ch.admit(&frame(FieldId::Top)));
        assert!(!ch.admit(&frame(FieldId::Top)));
        assert!(ch.admit(&frame(FieldId::Bottom)));
    }

    #[test]
    fn bottom_field_sync_resumes_on_the_following_top() {
        let cfg = EncChannelConfig {
            scan: ScanFormat::Interlaced,
            ..EncChannelConfig::default()
        };
        let mut ch = EncChannel::new(cfg, 0);
        ch.synch_to_bottom_field = true;
        assert!(!ch.admit(&frame(FieldId::Top)));
        assert!(!ch.admit(&frame(FieldId::Bottom)));
        assert!(!ch.synch_to_bottom_field);
        assert!(ch.admit(&frame(FieldId::Top)));
    }

    #[test]
    fn disabled_channel_admits_nothing() {
        let mut ch = EncChannel::new(EncChannelConfig::default(), 0);
        ch.enabled = false;
        assert!(!ch.admit(&frame(FieldId::Frame)));
        ch.enabled = true;
        assert!(ch.admit(&frame(FieldId::Frame)));
    }
}
