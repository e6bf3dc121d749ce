#![doc = include_str!("../README.md")]

use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use ivalink_core::prelude::CodecType;
use parking_lot::Mutex;

pub mod decoder;
pub mod encoder;
pub mod engine;
pub mod params;
pub mod registry;

/// Errors emitted by codecs and parameter validation.
///
/// # Example
/// ```rust
/// use ivalink_codec::CodecError;
///
/// let err = CodecError::InvalidParam {
///     name: "bitrate",
///     reason: "below 16 kbit/s".into(),
/// };
/// assert!(err.to_string().contains("bitrate"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// The backend refused to create an instance.
    #[error("codec create failed: {0}")]
    Create(String),
    /// A control call (flush, reset, set-params, ...) failed.
    #[error("codec control {command} failed: {reason}")]
    Control {
        command: &'static str,
        reason: String,
    },
    /// A process call reported failure.
    #[error("codec process failed, extended error {0:#x}")]
    Process(u32),
    /// Process was invoked on an instance that has already been deleted.
    #[error("codec instance not created")]
    NotCreated,
    /// No backend handles the requested codec type.
    #[error("unsupported codec {0}")]
    Unsupported(CodecType),
    /// A parameter was outside the accepted range.
    #[error("invalid parameter {name}: {reason}")]
    InvalidParam { name: &'static str, reason: String },
}

/// Errors surfaced by the registry.
///
/// # Example
/// ```rust
/// use ivalink_codec::RegistryError;
/// use ivalink_core::prelude::CodecType;
///
/// let err = RegistryError::NotFound(CodecType::Mjpeg);
/// assert!(matches!(err, RegistryError::NotFound(_)));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// No factory registered for the requested codec type.
    #[error("codec not registered for {0}")]
    NotFound(CodecType),
    /// Factory failed while creating the engine.
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Per-instance processing counters.
///
/// Cloned handles share the same counters, so a link can keep one for
/// statistics while the codec wrapper updates it.
///
/// # Example
/// ```rust
/// use ivalink_codec::CodecStats;
/// use std::time::Duration;
///
/// let stats = CodecStats::default();
/// stats.record_process(Duration::from_millis(4), false);
/// stats.inc_flush();
/// assert_eq!(stats.processed(), 1);
/// assert_eq!(stats.flushes(), 1);
/// assert!(stats.avg_millis().is_some());
/// ```
#[derive(Debug, Clone, Default)]
pub struct CodecStats {
    processed: Arc<AtomicU64>,
    errors: Arc<AtomicU64>,
    flushes: Arc<AtomicU64>,
    resets: Arc<AtomicU64>,
    last_nanos: Arc<AtomicU64>,
    window: Arc<Mutex<WindowState>>,
}

#[derive(Debug)]
struct WindowState {
    samples: VecDeque<(Instant, u64)>,
    max: usize,
}

impl Default for WindowState {
    fn default() -> Self {
        Self {
            samples: VecDeque::new(),
            max: DEFAULT_WINDOW,
        }
    }
}

const DEFAULT_WINDOW: usize = 120;

impl CodecStats {
    /// Record one process call and whether the codec reported an error.
    pub fn record_process(&self, dur: Duration, failed: bool) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        if failed {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }
        let nanos = dur.as_nanos().min(u64::MAX as u128) as u64;
        self.last_nanos.store(nanos, Ordering::Relaxed);
        let mut win = self.window.lock();
        win.samples.push_back((Instant::now(), nanos));
        while win.samples.len() > win.max {
            win.samples.pop_front();
        }
    }

    pub fn inc_flush(&self) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_reset(&self) {
        self.resets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    pub fn flushes(&self) -> u64 {
        self.flushes.load(Ordering::Relaxed)
    }

    pub fn resets(&self) -> u64 {
        self.resets.load(Ordering::Relaxed)
    }

    /// Average process time in milliseconds over the rolling window.
    pub fn avg_millis(&self) -> Option<f64> {
        let win = self.window.lock();
        let count = win.samples.len();
        if count == 0 {
            return None;
        }
        let total: u128 = win.samples.iter().map(|(_, n)| *n as u128).sum();
        Some(total as f64 / 1_000_000.0 / count as f64)
    }

    /// Last process duration in milliseconds.
    pub fn last_millis(&self) -> Option<f64> {
        match self.last_nanos.load(Ordering::Relaxed) {
            0 => None,
            last => Some(last as f64 / 1_000_000.0),
        }
    }

    /// Clear all counters and the timing window.
    pub fn reset(&self) {
        self.processed.store(0, Ordering::Relaxed);
        self.errors.store(0, Ordering::Relaxed);
        self.flushes.store(0, Ordering::Relaxed);
        self.resets.store(0, Ordering::Relaxed);
        self.last_nanos.store(0, Ordering::Relaxed);
        self.window.lock().samples.clear();
    }
}

pub mod prelude {
    pub use crate::{
        CodecError, CodecStats, RegistryError,
        decoder::{DecodeOutcome, Decoder, DisplayFrame},
        encoder::{EncodeOutcome, Encoder, validate_update},
        engine::{
            BufIds, DecControl, DecodeArgs, DecodeEngine, DecodeEngineFactory, DecodeOutArgs,
            DisplayInfo, EncControl, EncodeArgs, EncodeEngine, EncodeEngineFactory,
            EncodeOutArgs, PictureType,
        },
        params::{
            ConfigMask, DecCreateParams, DecDynamicParams, DecodeFrameType, EncCreateParams,
            EncDynamicParams, MIN_TARGET_BITRATE, ProcessCallLevel, QpRange, RateControl,
            RoiParams, RoiRegion,
        },
        registry::{CodecRegistry, CodecRegistryHandle},
    };
    pub use ivalink_core::prelude::*;
}
