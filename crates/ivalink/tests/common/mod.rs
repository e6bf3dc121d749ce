#![allow(dead_code)]

use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use ivalink::prelude::*;
use parking_lot::Mutex;
use smallvec::smallvec;

/// Previous stage: hands out queued buffers and records what comes back.
pub struct Source<T> {
    pending: Mutex<VecDeque<T>>,
    returned: Mutex<Vec<T>>,
}

impl<T> Default for Source<T> {
    fn default() -> Self {
        Self {
            pending: Mutex::new(VecDeque::new()),
            returned: Mutex::new(Vec::new()),
        }
    }
}

impl<T> Source<T> {
    pub fn push(&self, bufs: impl IntoIterator<Item = T>) {
        self.pending.lock().extend(bufs);
    }

    pub fn returned(&self) -> usize {
        self.returned.lock().len()
    }
}

impl<T: Send> Upstream<T> for Source<T> {
    fn get_full_buffers(&self) -> Vec<T> {
        self.pending.lock().drain(..).collect()
    }

    fn put_empty_buffers(&self, bufs: Vec<T>) {
        self.returned.lock().extend(bufs);
    }
}

#[derive(Default)]
pub struct Sink {
    pub notified: AtomicUsize,
}

impl Downstream for Sink {
    fn notify_new_data(&self) {
        self.notified.fetch_add(1, Ordering::Relaxed);
    }
}

pub fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(2));
    }
}

/// Compressed unit; `I` as first byte marks an intra picture.
pub fn unit(ch: ChannelId, n: u32, key: bool) -> Bitstream {
    let body = if key { b"I-unit".to_vec() } else { b"P-unit".to_vec() };
    Bitstream::new(ch, BufTag(n), Payload::from_vec(body))
        .key_frame(key)
        .with_timestamp(u64::from(n))
}

pub fn raw_frame(ch: ChannelId, n: u32) -> Frame {
    let mut frame = Frame::new(ch, BufTag(n), Payload::from_vec(vec![0; 64]));
    frame.info.field = FieldId::Frame;
    frame.timestamp = u64::from(n);
    frame
}

/// Decodes every unit into the buffer it was given and displays it at once.
pub struct Immediate;

impl DecodeEngine for Immediate {
    fn control(&mut self, _: &DecControl) -> Result<(), CodecError> {
        Ok(())
    }

    fn process(&mut self, args: DecodeArgs<'_>) -> DecodeOutArgs {
        let Some((tag, _)) = args.output else {
            // Nothing held: the drain ends at once.
            return DecodeOutArgs {
                failed: true,
                ..DecodeOutArgs::default()
            };
        };
        let picture = match args.input.first() {
            Some(b'I') => PictureType::Idr,
            _ => PictureType::P,
        };
        DecodeOutArgs {
            bytes_consumed: args.input.len(),
            free_ids: smallvec![tag],
            output_ids: smallvec![tag],
            display: Some(DisplayInfo {
                active_width: 352,
                active_height: 288,
                picture,
                ..DisplayInfo::default()
            }),
            ..DecodeOutArgs::default()
        }
    }
}

/// Keeps decoding into the first buffer it was given and never frees it.
pub struct Reusing;

impl DecodeEngine for Reusing {
    fn control(&mut self, _: &DecControl) -> Result<(), CodecError> {
        Ok(())
    }

    fn process(&mut self, args: DecodeArgs<'_>) -> DecodeOutArgs {
        let Some((tag, _)) = args.output else {
            return DecodeOutArgs {
                failed: true,
                ..DecodeOutArgs::default()
            };
        };
        DecodeOutArgs {
            bytes_consumed: args.input.len(),
            output_ids: smallvec![tag],
            out_bufs_in_use: true,
            display: Some(DisplayInfo::default()),
            ..DecodeOutArgs::default()
        }
    }
}

pub fn decode_registry() -> CodecRegistry {
    let registry = CodecRegistry::new();
    registry.register_decoder(
        CodecType::H264High,
        |_: &DecCreateParams, _: &DecDynamicParams| -> Result<Box<dyn DecodeEngine>, CodecError> {
            Ok(Box::new(Immediate))
        },
    );
    registry
}

pub fn dec_channel(codec: CodecType, bufs: i32) -> DecChannelConfig {
    DecChannelConfig {
        codec,
        max_width: 352,
        max_height: 288,
        num_bufs_per_channel: bufs,
        ..DecChannelConfig::default()
    }
}

/// Fixed-size pictures; records every parameter set it is given.
pub struct Recording {
    pub applied: Arc<Mutex<Vec<EncDynamicParams>>>,
}

impl EncodeEngine for Recording {
    fn control(&mut self, cmd: &EncControl) -> Result<(), CodecError> {
        if let EncControl::SetParams(params) = cmd {
            self.applied.lock().push((**params).clone());
        }
        Ok(())
    }

    fn process(&mut self, args: EncodeArgs<'_>) -> EncodeOutArgs {
        EncodeOutArgs {
            bytes_generated: 16,
            picture: if args.force_idr { PictureType::Idr } else { PictureType::P },
            ..EncodeOutArgs::default()
        }
    }
}

pub fn encode_registry(codecs: &[CodecType]) -> (CodecRegistry, Arc<Mutex<Vec<EncDynamicParams>>>) {
    let applied = Arc::new(Mutex::new(Vec::new()));
    let registry = CodecRegistry::new();
    for codec in codecs {
        let log = applied.clone();
        registry.register_encoder(
            *codec,
            move |_: &EncCreateParams, _: &EncDynamicParams| -> Result<Box<dyn EncodeEngine>, CodecError> {
                Ok(Box::new(Recording { applied: log.clone() }))
            },
        );
    }
    (registry, applied)
}

pub fn enc_channel() -> EncChannelConfig {
    EncChannelConfig {
        input: Resolution::new(352, 288),
        pitch: 352,
        ..EncChannelConfig::default()
    }
}
