use std::sync::Arc;

use ivalink_core::prelude::*;

use super::{DecState, DecodeOutcome, displayed, remaining};

/// Which APP segment to lift out of each MJPEG unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AppMarkerConfig {
    /// Second byte of the marker, `0xE4` for APP4.
    pub tag: u8,
    /// Longer segments are ignored.
    pub max_len: usize,
}

impl Default for AppMarkerConfig {
    fn default() -> Self {
        Self {
            tag: 0xE4,
            max_len: 4096,
        }
    }
}

/// Return the payload of the APP segment that directly follows SOI.
///
/// # Example
/// ```rust
/// use ivalink_codec::decoder::{AppMarkerConfig, extract_app_marker};
///
/// let unit = [0xff, 0xd8, 0xff, 0xe4, 0x00, 0x05, b'a', b'b', b'c', 0xff, 0xdb];
/// let meta = extract_app_marker(&unit, &AppMarkerConfig::default()).expect("APP4 present");
/// assert_eq!(&meta[..], b"abc");
/// ```
pub fn extract_app_marker(unit: &[u8], cfg: &AppMarkerConfig) -> Option<Arc<[u8]>> {
    let [0xff, 0xd8, 0xff, tag, hi, lo, ..] = *unit else {
        return None;
    };
    if tag != cfg.tag {
        return None;
    }
    let mut len = ((usize::from(hi) << 8) + usize::from(lo)).saturating_sub(2);
    if len > cfg.max_len {
        len = 0;
    }
    let body = unit.get(6..)?;
    let body = &body[..len.min(body.len())];
    (!body.is_empty()).then(|| Arc::from(body))
}

pub struct JpegDecoder {
    pub(crate) state: DecState,
    app_marker: Option<AppMarkerConfig>,
}

impl JpegDecoder {
    pub(crate) fn new(state: DecState, app_marker: Option<AppMarkerConfig>) -> Self {
        Self { state, app_marker }
    }

    pub(crate) fn decode(&mut self, input: &[u8], outputs: &[Frame]) -> DecodeOutcome {
        let mut outcome = DecodeOutcome::default();
        let meta = self
            .app_marker
            .as_ref()
            .and_then(|cfg| extract_app_marker(input, cfg));
        let mut offset = 0usize;

        for slot in outputs {
            let (tag, payload) = self.state.begin_slot(slot, &mut outcome.freed);
            let out = self
                .state
                .process(remaining(input, offset), Some((tag, &payload)));
            offset += out.bytes_consumed;
            self.state.prev_out = Some((tag, payload));

            let shown = if out.failed {
                None
            } else {
                displayed(&out).map(|mut frame| {
                    if frame.tag == tag {
                        frame.meta = meta.clone();
                    }
                    frame
                })
            };
            outcome.outputs.push(shown);
            self.state.release_ids(&out.free_ids, &mut outcome.freed);
        }

        outcome.extended_error = self.state.last_error;
        outcome
    }
}

#[cfg(test)]
mod tests {
    use smallvec::smallvec;

    use super::*;
    use crate::{
        CodecError,
        engine::{DecControl, DecodeArgs, DecodeEngine, DecodeOutArgs, DisplayInfo},
        params::{DecCreateParams, DecDynamicParams, ProcessCallLevel},
    };

    struct Whole {
        fail: bool,
    }

    impl DecodeEngine for Whole {
        fn control(&mut self, _: &DecControl) -> Result<(), CodecError> {
            Ok(())
        }

        fn process(&mut self, args: DecodeArgs<'_>) -> DecodeOutArgs {
            let mut out = DecodeOutArgs {
                failed: self.fail,
                bytes_consumed: args.input.len(),
                ..DecodeOutArgs::default()
            };
            if let Some((tag, _)) = args.output {
                out.free_ids = smallvec![tag];
                out.output_ids = smallvec![tag];
                out.display = Some(DisplayInfo::default());
            }
            out
        }
    }

    /// Reports its output buffer twice in the freed list.
    struct Repeating;

    impl DecodeEngine for Repeating {
        fn control(&mut self, _: &DecControl) -> Result<(), CodecError> {
            Ok(())
        }

        fn process(&mut self, args: DecodeArgs<'_>) -> DecodeOutArgs {
            let mut out = DecodeOutArgs {
                bytes_consumed: args.input.len(),
                ..DecodeOutArgs::default()
            };
            if let Some((tag, _)) = args.output {
                out.free_ids = smallvec![tag, tag];
            }
            out
        }
    }

    fn params() -> DecCreateParams {
        DecCreateParams {
            ch: 2,
            codec: CodecType::Mjpeg,
            max: Resolution::new(32, 32),
            display_delay: 0,
            process_call_level: ProcessCallLevel::Frame,
            field_merge: false,
            num_out_bufs: 4,
            data_format: DataFormat::Yuv422Interleaved,
        }
    }

    fn decoder(fail: bool, app_marker: Option<AppMarkerConfig>) -> JpegDecoder {
        let state = DecState::new(Box::new(Whole { fail }), params(), DecDynamicParams::default());
        JpegDecoder::new(state, app_marker)
    }

    fn frame(tag: u32) -> Frame {
        Frame::new(2, BufTag(tag), Payload::from_vec(vec![0; 8]))
    }

    const UNIT: [u8; 9] = [0xff, 0xd8, 0xff, 0xe4, 0x00, 0x03, 0x42, 0xff, 0xd9];

    #[test]
    fn marker_is_attached_to_displayed_frame() {
        let mut dec = decoder(false, Some(AppMarkerConfig::default()));
        let outcome = dec.decode(&UNIT, &[frame(9)]);
        let shown = outcome.outputs[0].as_ref().expect("displayed");
        assert_eq!(shown.meta.as_deref(), Some(&[0x42][..]));
        assert_eq!(outcome.freed.as_slice(), &[BufTag(9)]);
    }

    #[test]
    fn marker_extraction_is_opt_in() {
        let mut dec = decoder(false, None);
        let outcome = dec.decode(&UNIT, &[frame(1)]);
        assert!(outcome.outputs[0].as_ref().expect("displayed").meta.is_none());
    }

    #[test]
    fn oversized_or_foreign_markers_are_ignored() {
        let small = AppMarkerConfig { tag: 0xE4, max_len: 0 };
        assert!(extract_app_marker(&UNIT, &small).is_none());
        let other = AppMarkerConfig { tag: 0xE1, max_len: 64 };
        assert!(extract_app_marker(&UNIT, &other).is_none());
        assert!(extract_app_marker(&UNIT[..4], &AppMarkerConfig::default()).is_none());
    }

    #[test]
    fn failed_unit_releases_without_display() {
        let mut dec = decoder(true, None);
        let outcome = dec.decode(&UNIT, &[frame(4)]);
        assert_eq!(outcome.outputs.as_slice(), &[None]);
        assert_eq!(outcome.freed.as_slice(), &[BufTag(4)]);
        assert_eq!(dec.state.stats.errors(), 1);
    }

    #[test]
    fn repeated_free_ids_release_once() {
        let state = DecState::new(Box::new(Repeating), params(), DecDynamicParams::default());
        let mut dec = JpegDecoder::new(state, None);
        let outcome = dec.decode(&UNIT, &[frame(6)]);
        assert_eq!(outcome.freed.as_slice(), &[BufTag(6)]);
        assert_eq!(dec.state.bufs_in_codec, 0);
    }
}
