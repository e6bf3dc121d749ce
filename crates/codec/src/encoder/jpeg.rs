use ivalink_core::prelude::*;

use super::{EncState, EncodeOutcome};
use crate::{
    CodecError,
    params::{ConfigMask, EncDynamicParams, validate_bitrate, validate_quality},
};

/// Settings a JPEG encoder has no use for.
const NOT_APPLICABLE: [ConfigMask; 6] = [
    ConfigMask::INTRA_INTERVAL,
    ConfigMask::RATE_CONTROL,
    ConfigMask::VBR_DURATION,
    ConfigMask::VBR_SENSITIVITY,
    ConfigMask::ROI,
    ConfigMask::PACKET_SIZE,
];

pub(super) fn validate(mask: ConfigMask, dynamic: &EncDynamicParams) -> Result<(), CodecError> {
    if mask.contains(ConfigMask::BITRATE) {
        validate_bitrate(dynamic.target_bitrate)?;
    }
    // -1 lets the codec pick its default quality.
    if mask.contains(ConfigMask::QP_I) && dynamic.qp_i.init != -1 {
        validate_quality(dynamic.qp_i.init)?;
    }
    Ok(())
}

pub struct JpegEncoder {
    pub(crate) state: EncState,
}

impl JpegEncoder {
    pub(crate) fn new(state: EncState) -> Self {
        Self { state }
    }

    pub(crate) fn apply(&mut self, mask: ConfigMask, update: &EncDynamicParams) -> Result<(), CodecError> {
        validate(mask, update)?;
        let ch = self.state.params.ch;
        let d = &mut self.state.dynamic;
        if mask.contains(ConfigMask::BITRATE) {
            d.target_bitrate = update.target_bitrate;
        }
        if mask.contains(ConfigMask::FPS) {
            d.target_frame_rate = update.target_frame_rate;
        }
        if mask.contains(ConfigMask::QP_I) {
            d.qp_i.init = update.qp_i.init;
        }
        if mask.contains(ConfigMask::QP_P) {
            tracing::warn!(ch, "P-frame QP does not apply to MJPEG, ignored");
        }
        for unused in NOT_APPLICABLE {
            if mask.contains(unused) {
                tracing::debug!(ch, mask = ?unused, "setting ignored by MJPEG encoder");
            }
        }
        self.state.push_params()
    }

    /// Every JPEG picture is a key frame.
    pub(crate) fn encode(&mut self, inputs: &[Frame], output: &Payload) -> Result<EncodeOutcome, CodecError> {
        let mut outcome = self.state.process(inputs, output)?;
        outcome.key_frame = true;
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        encoder::Encoder,
        engine::{EncControl, EncodeArgs, EncodeEngine, EncodeOutArgs},
        params::EncCreateParams,
        registry::CodecRegistry,
    };

    struct Flaky {
        calls: u32,
    }

    impl EncodeEngine for Flaky {
        fn control(&mut self, _: &EncControl) -> Result<(), CodecError> {
            Ok(())
        }

        fn process(&mut self, _: EncodeArgs<'_>) -> EncodeOutArgs {
            self.calls += 1;
            EncodeOutArgs {
                failed: self.calls == 2,
                extended_error: if self.calls == 2 { 0x40 } else { 0 },
                bytes_generated: 1000,
                ..EncodeOutArgs::default()
            }
        }
    }

    fn encoder() -> Encoder {
        let registry = CodecRegistry::new();
        registry.register_encoder(
            CodecType::Mjpeg,
            |_: &EncCreateParams, _: &EncDynamicParams| -> Result<Box<dyn EncodeEngine>, CodecError> {
                Ok(Box::new(Flaky { calls: 0 }))
            },
        );
        let params = EncCreateParams {
            codec: CodecType::Mjpeg,
            ..EncCreateParams::default()
        };
        let mut dynamic = EncDynamicParams::default();
        dynamic.qp_i.init = 50;
        Encoder::create(&registry.handle(), params, dynamic).expect("create")
    }

    #[test]
    fn quality_is_carried_in_qp_i_init() {
        let mut enc = encoder();
        let mut update = EncDynamicParams::default();
        update.qp_i.init = 80;
        enc.apply(ConfigMask::QP_I, &update).expect("quality 80");
        assert_eq!(enc.dynamic().qp_i.init, 80);
        update.qp_i.init = 98;
        assert!(enc.apply(ConfigMask::QP_I, &update).is_err());
    }

    #[test]
    fn p_frame_qp_is_accepted_but_ignored() {
        let mut enc = encoder();
        let update = EncDynamicParams {
            qp_p: crate::params::QpRange { min: 1, max: 2, init: 1 },
            ..EncDynamicParams::default()
        };
        enc.apply(ConfigMask::QP_P, &update).expect("warn only");
        assert_eq!(enc.dynamic().qp_p, crate::params::QpRange::default());
    }

    #[test]
    fn pictures_are_key_frames_and_failures_surface() {
        let mut enc = encoder();
        let input = Frame::new(0, BufTag(0), Payload::from_vec(vec![0; 8]));
        let output = Payload::from_vec(vec![0; 8]);
        assert!(enc.encode(std::slice::from_ref(&input), &output).expect("first").key_frame);
        assert_eq!(
            enc.encode(std::slice::from_ref(&input), &output),
            Err(CodecError::Process(0x40))
        );
        assert_eq!(enc.stats().errors(), 1);
    }
}
