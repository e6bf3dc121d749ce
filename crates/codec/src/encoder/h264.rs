use ivalink_core::prelude::*;

use super::{EncState, EncodeOutcome};
use crate::{
    CodecError,
    params::{ConfigMask, EncDynamicParams, validate_bitrate},
};

pub(super) fn validate(mask: ConfigMask, dynamic: &EncDynamicParams) -> Result<(), CodecError> {
    if mask.contains(ConfigMask::BITRATE) {
        validate_bitrate(dynamic.target_bitrate)?;
    }
    if mask.contains(ConfigMask::QP_I) {
        dynamic.qp_i.validate_h264("qp_i")?;
    }
    if mask.contains(ConfigMask::QP_P) {
        dynamic.qp_p.validate_h264("qp_p")?;
    }
    Ok(())
}

pub struct H264Encoder {
    pub(crate) state: EncState,
}

impl H264Encoder {
    pub(crate) fn new(state: EncState) -> Self {
        Self { state }
    }

    pub(crate) fn apply(&mut self, mask: ConfigMask, update: &EncDynamicParams) -> Result<(), CodecError> {
        validate(mask, update)?;
        let d = &mut self.state.dynamic;
        if mask.contains(ConfigMask::BITRATE) {
            d.target_bitrate = update.target_bitrate;
        }
        if mask.contains(ConfigMask::FPS) {
            d.target_frame_rate = update.target_frame_rate;
        }
        if mask.contains(ConfigMask::INTRA_INTERVAL) {
            d.intra_interval = update.intra_interval;
        }
        if mask.contains(ConfigMask::QP_I) {
            d.qp_i = update.qp_i;
        }
        if mask.contains(ConfigMask::QP_P) {
            d.qp_p = update.qp_p;
        }
        if mask.contains(ConfigMask::RATE_CONTROL) {
            d.rate_control = update.rate_control;
        }
        if mask.contains(ConfigMask::VBR_DURATION) {
            d.vbr_duration = update.vbr_duration;
        }
        if mask.contains(ConfigMask::VBR_SENSITIVITY) {
            d.vbr_sensitivity = update.vbr_sensitivity;
        }
        if mask.contains(ConfigMask::ROI) {
            d.roi = update.roi.clone();
        }
        if mask.contains(ConfigMask::PACKET_SIZE) {
            d.max_packet_size = update.max_packet_size;
        }
        if mask.contains(ConfigMask::FORCE_IDR) {
            self.state.force_idr = true;
        }
        tracing::debug!(ch = self.state.params.ch, ?mask, "h264 encoder params applied");
        self.state.push_params()
    }

    pub(crate) fn encode(&mut self, inputs: &[Frame], output: &Payload) -> Result<EncodeOutcome, CodecError> {
        self.state.process(inputs, output)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;
    use crate::{
        encoder::Encoder,
        engine::{EncControl, EncodeArgs, EncodeEngine, EncodeOutArgs, PictureType},
        params::{EncCreateParams, QpRange},
        registry::CodecRegistry,
    };

    struct Recording {
        applied: Arc<Mutex<Vec<EncDynamicParams>>>,
    }

    impl EncodeEngine for Recording {
        fn control(&mut self, cmd: &EncControl) -> Result<(), CodecError> {
            if let EncControl::SetParams(p) = cmd {
                self.applied.lock().push((**p).clone());
            }
            Ok(())
        }

        fn process(&mut self, args: EncodeArgs<'_>) -> EncodeOutArgs {
            EncodeOutArgs {
                bytes_generated: 10,
                picture: if args.force_idr { PictureType::Idr } else { PictureType::P },
                ..EncodeOutArgs::default()
            }
        }
    }

    fn encoder() -> (Encoder, Arc<Mutex<Vec<EncDynamicParams>>>) {
        let applied = Arc::new(Mutex::new(Vec::new()));
        let registry = CodecRegistry::new();
        let log = applied.clone();
        registry.register_encoder(
            CodecType::H264High,
            move |_: &EncCreateParams, _: &EncDynamicParams| -> Result<Box<dyn EncodeEngine>, CodecError> {
                Ok(Box::new(Recording { applied: log.clone() }))
            },
        );
        let enc = Encoder::create(&registry.handle(), EncCreateParams::default(), EncDynamicParams::default())
            .expect("create");
        (enc, applied)
    }

    #[test]
    fn only_masked_fields_are_applied() {
        let (mut enc, applied) = encoder();
        let update = EncDynamicParams {
            target_bitrate: 512_000,
            intra_interval: 5,
            ..EncDynamicParams::default()
        };
        enc.apply(ConfigMask::BITRATE, &update).expect("apply");
        assert_eq!(enc.dynamic().target_bitrate, 512_000);
        assert_eq!(enc.dynamic().intra_interval, 30);
        assert_eq!(applied.lock().len(), 2);
    }

    #[test]
    fn invalid_qp_leaves_params_untouched() {
        let (mut enc, _) = encoder();
        let update = EncDynamicParams {
            qp_p: QpRange { min: 0, max: 60, init: 20 },
            ..EncDynamicParams::default()
        };
        assert!(enc.apply(ConfigMask::QP_P, &update).is_err());
        assert_eq!(enc.dynamic().qp_p, QpRange::default());
    }

    #[test]
    fn force_idr_applies_to_next_picture_only() {
        let (mut enc, _) = encoder();
        let input = Frame::new(0, BufTag(0), Payload::from_vec(vec![0; 8]));
        let output = Payload::from_vec(vec![0; 8]);
        enc.encode(std::slice::from_ref(&input), &output).expect("idr");
        enc.apply(ConfigMask::FORCE_IDR, &EncDynamicParams::default()).expect("apply");
        assert!(enc.encode(std::slice::from_ref(&input), &output).expect("forced").key_frame);
        assert!(!enc.encode(std::slice::from_ref(&input), &output).expect("p").key_frame);
    }

    #[test]
    fn resolution_change_forces_idr() {
        let (mut enc, applied) = encoder();
        let input = Frame::new(0, BufTag(0), Payload::from_vec(vec![0; 8]));
        let output = Payload::from_vec(vec![0; 8]);
        enc.encode(std::slice::from_ref(&input), &output).expect("idr");
        enc.set_input(Resolution::new(1280, 720), 1280).expect("resize");
        assert_eq!(applied.lock().last().map(|p| p.input), Some(Resolution::new(1280, 720)));
        assert!(enc.encode(std::slice::from_ref(&input), &output).expect("idr").key_frame);
    }
}
