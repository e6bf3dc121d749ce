//! H264 decode policy: IDR gating, error recovery through flush and reset,
//! and forced drains when the codec holds too many output buffers.

use ivalink_core::prelude::*;

use super::{DecState, DecodeOutcome, displayed, remaining};
use crate::engine::{BufIds, DecControl};

/// Extended error bits reported by H264 engines, as bit positions.
pub mod error_bits {
    /// Parameter problem the codec recovered from on its own.
    pub const INVALIDPARAM_IGNORE: u32 = 7;
    pub const STREAM_END: u32 = 18;
    pub const PICSIZECHANGE: u32 = 20;
    pub const UNSUPPRESOLUTION: u32 = 21;
    pub const NUMREF_FRAMES: u32 = 22;
    pub const DATA_SYNC: u32 = 24;
    pub const DISPLAYWIDTH: u32 = 29;
    pub const GAPSINFRAMENUM: u32 = 31;

    /// Whether `bit` is set in `err`.
    pub const fn is_set(err: u32, bit: u32) -> bool {
        err & (1 << bit) != 0
    }

    /// Errors after which held pictures must be drained.
    ///
    /// ```rust
    /// use ivalink_codec::decoder::error_bits::*;
    ///
    /// assert!(needs_flush(1 << DATA_SYNC));
    /// assert!(!needs_flush(1 << GAPSINFRAMENUM));
    /// ```
    pub const fn needs_flush(err: u32) -> bool {
        is_set(err, STREAM_END)
            || is_set(err, PICSIZECHANGE)
            || is_set(err, UNSUPPRESOLUTION)
            || is_set(err, NUMREF_FRAMES)
            || is_set(err, DATA_SYNC)
            || is_set(err, DISPLAYWIDTH)
    }

    /// Errors after which the instance must be reset.
    pub const fn needs_reset(err: u32) -> bool {
        is_set(err, DATA_SYNC) || is_set(err, NUMREF_FRAMES) || is_set(err, UNSUPPRESOLUTION)
    }
}

use error_bits::{GAPSINFRAMENUM, INVALIDPARAM_IGNORE, PICSIZECHANGE, is_set};

/// Upper bound on process calls while draining in flush mode.
const MAX_DRAIN_CALLS: usize = 64;

pub struct H264Decoder {
    pub(crate) state: DecState,
    first_idr_found: bool,
}

impl H264Decoder {
    pub(crate) fn new(state: DecState) -> Self {
        Self {
            state,
            first_idr_found: false,
        }
    }

    /// An intra picture has been decoded since create.
    pub fn first_idr_found(&self) -> bool {
        self.first_idr_found
    }

    pub(crate) fn decode(&mut self, input: &[u8], outputs: &[Frame]) -> DecodeOutcome {
        let mut outcome = DecodeOutcome::default();
        let mut offset = 0usize;

        for slot in outputs {
            let slot_start = offset;
            let (tag, payload) = self.state.begin_slot(slot, &mut outcome.freed);
            let mut out = self
                .state
                .process(remaining(input, offset), Some((tag, &payload)));
            offset += out.bytes_consumed;
            self.state.prev_out = Some((tag, payload.clone()));

            let err = out.extended_error;
            let ignorable = is_set(err, INVALIDPARAM_IGNORE);
            if !ignorable && out.display.is_some_and(|d| d.picture.is_intra()) {
                self.first_idr_found = true;
            }

            let mut display = true;
            let fatal = out.failed && !is_set(err, GAPSINFRAMENUM) && !ignorable;
            if fatal || !self.first_idr_found {
                display = false;
                let mut ids = out.free_ids.clone();
                if is_set(err, PICSIZECHANGE) {
                    // The current buffer is decoded into again below.
                    ids.retain(|id| *id != tag);
                }
                self.state.release_ids(&ids, &mut outcome.freed);
                let reset = self.flush(err, false, &mut outcome.freed);

                if is_set(err, PICSIZECHANGE) {
                    tracing::debug!(ch = self.state.params.ch, "picture size change, re-decoding");
                    let from = if reset { slot_start } else { offset };
                    out = self
                        .state
                        .process(remaining(input, from), Some((tag, &payload)));
                    offset = from + out.bytes_consumed;
                    self.state.prev_out = Some((tag, payload.clone()));
                    display = true;
                }
            }

            if display {
                outcome.outputs.push(displayed(&out));
                self.state.release_ids(&out.free_ids, &mut outcome.freed);
            } else {
                outcome.outputs.push(None);
            }

            if self.state.bufs_in_codec + 1 >= self.state.params.num_out_bufs {
                tracing::debug!(
                    ch = self.state.params.ch,
                    held = self.state.bufs_in_codec,
                    "codec holds all output buffers, draining"
                );
                self.flush(err, true, &mut outcome.freed);
            }
        }

        outcome.extended_error = self.state.last_error;
        outcome
    }

    /// Drain every held picture and reset when the last error asks for it.
    pub(crate) fn flush_all(&mut self) -> BufIds {
        let mut freed = BufIds::new();
        let err = self.state.last_error;
        self.flush(err, true, &mut freed);
        freed
    }

    /// Flush when `err` calls for it or `hard` is set, then reset if needed.
    /// Returns whether a reset happened.
    fn flush(&mut self, err: u32, hard: bool, freed: &mut BufIds) -> bool {
        if hard || error_bits::needs_flush(err) {
            self.drain(freed);
        }
        if !error_bits::needs_reset(err) {
            return false;
        }
        match self.state.control(&DecControl::Reset) {
            Ok(()) => {
                self.state.stats.inc_reset();
                self.state.prev_out = None;
                self.state.out_bufs_in_use = false;
                tracing::info!(ch = self.state.params.ch, extended_error = err, "decoder reset");
                true
            }
            Err(e) => {
                tracing::warn!(ch = self.state.params.ch, error = %e, "decoder reset failed");
                false
            }
        }
    }

    fn drain(&mut self, freed: &mut BufIds) {
        if let Err(e) = self.state.control(&DecControl::Flush) {
            tracing::warn!(ch = self.state.params.ch, error = %e, "decoder flush failed");
            return;
        }
        self.state.stats.inc_flush();
        for _ in 0..MAX_DRAIN_CALLS {
            let out = self.state.process(&[], None);
            self.state.release_ids(&out.free_ids, freed);
            if out.failed {
                break;
            }
        }
        self.state.prev_out = None;
        self.state.out_bufs_in_use = false;
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::VecDeque, sync::Arc};

    use parking_lot::Mutex;
    use smallvec::smallvec;

    use super::*;
    use crate::{
        CodecError,
        engine::{DecodeArgs, DecodeEngine, DecodeOutArgs, DisplayInfo, PictureType},
        params::{DecCreateParams, DecDynamicParams, ProcessCallLevel},
    };

    #[derive(Default)]
    struct Log {
        controls: Vec<&'static str>,
        inputs: Vec<usize>,
    }

    struct Scripted {
        script: VecDeque<DecodeOutArgs>,
        log: Arc<Mutex<Log>>,
    }

    impl DecodeEngine for Scripted {
        fn control(&mut self, cmd: &DecControl) -> Result<(), CodecError> {
            self.log.lock().controls.push(cmd.name());
            Ok(())
        }

        fn process(&mut self, args: DecodeArgs<'_>) -> DecodeOutArgs {
            self.log.lock().inputs.push(args.input.len());
            self.script.pop_front().unwrap_or(DecodeOutArgs {
                failed: true,
                ..DecodeOutArgs::default()
            })
        }
    }

    fn decoder(script: Vec<DecodeOutArgs>, num_out_bufs: usize) -> (H264Decoder, Arc<Mutex<Log>>) {
        let log = Arc::new(Mutex::new(Log::default()));
        let engine = Scripted {
            script: script.into(),
            log: log.clone(),
        };
        let params = DecCreateParams {
            ch: 0,
            codec: CodecType::H264High,
            max: Resolution::new(64, 48),
            display_delay: 0,
            process_call_level: ProcessCallLevel::Frame,
            field_merge: false,
            num_out_bufs,
            data_format: DataFormat::Yuv420SemiPlanar,
        };
        let state = DecState::new(Box::new(engine), params, DecDynamicParams::default());
        (H264Decoder::new(state), log)
    }

    fn shown(tag: u32, picture: PictureType, consumed: usize) -> DecodeOutArgs {
        DecodeOutArgs {
            bytes_consumed: consumed,
            free_ids: smallvec![BufTag(tag)],
            output_ids: smallvec![BufTag(tag)],
            display: Some(DisplayInfo {
                active_width: 64,
                active_height: 48,
                picture,
                ..DisplayInfo::default()
            }),
            ..DecodeOutArgs::default()
        }
    }

    fn frame(tag: u32) -> Frame {
        Frame::new(0, BufTag(tag), Payload::from_vec(vec![0; 16]))
    }

    #[test]
    fn pictures_before_first_idr_are_not_displayed() {
        let (mut dec, _) = decoder(vec![shown(1, PictureType::P, 10), shown(2, PictureType::Idr, 10)], 8);
        let first = dec.decode(&[0; 10], &[frame(1)]);
        assert_eq!(first.outputs.as_slice(), &[None]);
        assert_eq!(first.freed.as_slice(), &[BufTag(1)]);

        let second = dec.decode(&[0; 10], &[frame(2)]);
        assert_eq!(second.outputs[0].as_ref().map(|d| d.tag), Some(BufTag(2)));
        assert!(dec.first_idr_found());
    }

    #[test]
    fn repeated_free_ids_are_released_once() {
        let mut out = shown(3, PictureType::Idr, 4);
        out.free_ids = smallvec![BufTag(3), BufTag(3)];
        let (mut dec, _) = decoder(vec![out], 8);
        let outcome = dec.decode(&[0; 4], &[frame(3)]);
        assert_eq!(outcome.freed.as_slice(), &[BufTag(3)]);
        assert_eq!(dec.state.bufs_in_codec, 0);
    }

    #[test]
    fn data_sync_error_flushes_then_resets() {
        let idr = shown(1, PictureType::Idr, 4);
        let broken = DecodeOutArgs {
            failed: true,
            extended_error: 1 << error_bits::DATA_SYNC,
            ..DecodeOutArgs::default()
        };
        let drained = DecodeOutArgs {
            free_ids: smallvec![BufTag(2)],
            ..DecodeOutArgs::default()
        };
        let (mut dec, log) = decoder(vec![idr, broken, drained], 8);
        dec.decode(&[0; 4], &[frame(1)]);
        let outcome = dec.decode(&[0; 4], &[frame(2)]);

        assert_eq!(outcome.outputs.as_slice(), &[None]);
        assert_eq!(outcome.freed.as_slice(), &[BufTag(2)]);
        assert_eq!(log.lock().controls, vec!["flush", "reset"]);
        assert_eq!(dec.state.stats.resets(), 1);
    }

    #[test]
    fn gaps_in_frame_num_still_displays() {
        let idr = shown(1, PictureType::Idr, 4);
        let mut gap = shown(2, PictureType::P, 4);
        gap.failed = true;
        gap.extended_error = 1 << error_bits::GAPSINFRAMENUM;
        let (mut dec, log) = decoder(vec![idr, gap], 8);
        dec.decode(&[0; 4], &[frame(1)]);
        let outcome = dec.decode(&[0; 4], &[frame(2)]);
        assert_eq!(outcome.outputs[0].as_ref().map(|d| d.tag), Some(BufTag(2)));
        assert!(log.lock().controls.is_empty());
    }

    #[test]
    fn held_buffers_force_a_hard_flush() {
        let held = |tag| DecodeOutArgs {
            bytes_consumed: 4,
            output_ids: smallvec![BufTag(tag)],
            display: Some(DisplayInfo {
                picture: PictureType::Idr,
                ..DisplayInfo::default()
            }),
            ..DecodeOutArgs::default()
        };
        let drained = DecodeOutArgs {
            free_ids: smallvec![BufTag(1), BufTag(2)],
            ..DecodeOutArgs::default()
        };
        let (mut dec, log) = decoder(vec![held(1), held(2), drained], 3);
        let first = dec.decode(&[0; 4], &[frame(1)]);
        assert!(first.freed.is_empty());
        let second = dec.decode(&[0; 4], &[frame(2)]);
        assert_eq!(second.freed.as_slice(), &[BufTag(1), BufTag(2)]);
        assert_eq!(log.lock().controls, vec!["flush"]);
        assert_eq!(dec.state.bufs_in_codec, 0);
    }

    #[test]
    fn picture_size_change_redecodes_remaining_bytes() {
        let idr = shown(1, PictureType::Idr, 4);
        let resized = DecodeOutArgs {
            failed: true,
            bytes_consumed: 3,
            extended_error: 1 << error_bits::PICSIZECHANGE,
            free_ids: smallvec![BufTag(2)],
            ..DecodeOutArgs::default()
        };
        let drained = DecodeOutArgs::default();
        let end = DecodeOutArgs {
            failed: true,
            ..DecodeOutArgs::default()
        };
        let retry = shown(2, PictureType::Idr, 7);
        let (mut dec, log) = decoder(vec![idr, resized, drained, end, retry], 8);
        dec.decode(&[0; 4], &[frame(1)]);
        let outcome = dec.decode(&[0; 10], &[frame(2)]);

        assert_eq!(outcome.outputs[0].as_ref().map(|d| d.tag), Some(BufTag(2)));
        assert_eq!(outcome.freed.as_slice(), &[BufTag(2)]);
        let log = log.lock();
        assert_eq!(log.controls, vec!["flush"]);
        // idr, resized, two drain calls, then the retry on the 7 bytes left.
        assert_eq!(log.inputs, vec![4, 10, 0, 0, 7]);
    }

    #[test]
    fn flush_all_releases_held_pictures() {
        let held = DecodeOutArgs {
            bytes_consumed: 4,
            out_bufs_in_use: true,
            display: Some(DisplayInfo {
                picture: PictureType::Idr,
                ..DisplayInfo::default()
            }),
            ..DecodeOutArgs::default()
        };
        let drained = DecodeOutArgs {
            free_ids: smallvec![BufTag(5)],
            ..DecodeOutArgs::default()
        };
        let (mut dec, _) = decoder(vec![held, drained], 8);
        dec.decode(&[0; 4], &[frame(5)]);
        assert_eq!(dec.state.bufs_in_codec, 1);
        assert_eq!(dec.flush_all().as_slice(), &[BufTag(5)]);
        assert!(dec.state.prev_out.is_none());
    }
}
