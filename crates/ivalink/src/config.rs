//! Link configuration: limits, per-channel settings and their defaults.

use ivalink_codec::{decoder::AppMarkerConfig, prelude::*};

use crate::LinkError;

/// Default number of channels a link accepts.
pub const DEFAULT_MAX_CHANNELS: usize = 8;
/// Default cap on output frames allocated per decode channel.
pub const DEFAULT_MAX_OUT_BUFS_PER_CHANNEL: usize = 16;
/// Output frames per channel when the configuration leaves it unset.
pub const DEFAULT_BUFS_PER_CHANNEL: usize = 4;
/// Default number of live duplicates per original frame.
pub const DEFAULT_MAX_DUP_PER_FRAME: u32 = 4;
/// Default number of empty frames below which decoded output is dropped.
pub const DEFAULT_ACCUMULATION_THRESHOLD: usize = 2;
/// Default cap on buffers moved per collect batch.
pub const DEFAULT_BATCH_CAP: usize = 63;

/// Capacity limits shared by both link kinds.
///
/// # Example
/// ```rust
/// use ivalink::config::LinkLimits;
///
/// let limits = LinkLimits { max_channels: 0, batch_cap: 0, ..LinkLimits::default() }.sanitized();
/// assert_eq!(limits.max_channels, 1);
/// assert_eq!(limits.batch_cap, 1);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct LinkLimits {
    pub max_channels: usize,
    pub max_out_bufs_per_channel: usize,
    pub default_bufs_per_channel: usize,
    pub max_dup_per_frame: u32,
    pub accumulation_threshold: usize,
    pub batch_cap: usize,
}

impl Default for LinkLimits {
    fn default() -> Self {
        Self {
            max_channels: DEFAULT_MAX_CHANNELS,
            max_out_bufs_per_channel: DEFAULT_MAX_OUT_BUFS_PER_CHANNEL,
            default_bufs_per_channel: DEFAULT_BUFS_PER_CHANNEL,
            max_dup_per_frame: DEFAULT_MAX_DUP_PER_FRAME,
            accumulation_threshold: DEFAULT_ACCUMULATION_THRESHOLD,
            batch_cap: DEFAULT_BATCH_CAP,
        }
    }
}

impl LinkLimits {
    pub fn sanitized(self) -> Self {
        let max_out = self.max_out_bufs_per_channel.max(1);
        Self {
            max_channels: self.max_channels.max(1),
            max_out_bufs_per_channel: max_out,
            default_bufs_per_channel: self.default_bufs_per_channel.clamp(1, max_out),
            max_dup_per_frame: self.max_dup_per_frame.max(1),
            accumulation_threshold: self.accumulation_threshold,
            batch_cap: self.batch_cap.max(1),
        }
    }

    /// Output frame count for a channel asking for `requested`.
    ///
    /// Zero or negative picks the default; anything above the cap is clamped.
    pub fn resolve_bufs(&self, ch: ChannelId, requested: i32) -> usize {
        if requested <= 0 {
            return self.default_bufs_per_channel;
        }
        let requested = requested as usize;
        if requested > self.max_out_bufs_per_channel {
            tracing::warn!(
                ch,
                requested,
                max = self.max_out_bufs_per_channel,
                "output buffer count clamped"
            );
            return self.max_out_bufs_per_channel;
        }
        requested
    }

    pub(crate) fn check_channels(&self, count: usize) -> Result<(), LinkError> {
        if count == 0 || count > self.max_channels {
            return Err(LinkError::InvalidArg(format!(
                "{count} channels, expected 1..={}",
                self.max_channels
            )));
        }
        Ok(())
    }
}

/// Whether a channel's codec is created together with the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum CreateState {
    /// Left for a later create-channel command.
    DoNotCreate,
    #[default]
    Create,
}

/// Display rate conversion for a decode channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TrickPlayConfig {
    pub input_fps: u32,
    pub output_fps: u32,
}

impl Default for TrickPlayConfig {
    fn default() -> Self {
        Self {
            input_fps: 30,
            output_fps: 30,
        }
    }
}

/// Settings of one decode channel.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct DecChannelConfig {
    pub codec: CodecType,
    pub max_width: u32,
    pub max_height: u32,
    /// Zero or negative selects [`LinkLimits::default_bufs_per_channel`].
    pub num_bufs_per_channel: i32,
    pub create_state: CreateState,
    pub display_delay: i32,
    pub process_call_level: ProcessCallLevel,
    pub field_merge_decode: bool,
    pub dynamic: DecDynamicParams,
    /// Drop decoded frames while the next stage holds all but a few of them.
    pub skip_on_accumulation: bool,
    pub trick_play: TrickPlayConfig,
}

impl Default for DecChannelConfig {
    fn default() -> Self {
        Self {
            codec: CodecType::H264High,
            max_width: 1920,
            max_height: 1080,
            num_bufs_per_channel: 0,
            create_state: CreateState::Create,
            display_delay: -1,
            process_call_level: ProcessCallLevel::Frame,
            field_merge_decode: false,
            dynamic: DecDynamicParams::default(),
            skip_on_accumulation: false,
            trick_play: TrickPlayConfig::default(),
        }
    }
}

impl DecChannelConfig {
    pub fn max(&self) -> Resolution {
        Resolution::new(self.max_width, self.max_height)
    }

    pub(crate) fn validate(&self, ch: ChannelId) -> Result<(), LinkError> {
        if self.max().class().is_none() {
            return Err(LinkError::InvalidArg(format!(
                "channel {ch}: {}x{} matches no resolution class",
                self.max_width, self.max_height
            )));
        }
        Ok(())
    }

    pub(crate) fn create_params(&self, ch: ChannelId, num_out_bufs: usize) -> DecCreateParams {
        DecCreateParams {
            ch,
            codec: self.codec,
            max: self.max(),
            display_delay: self.display_delay,
            process_call_level: self.process_call_level,
            field_merge: self.field_merge_decode,
            num_out_bufs,
            data_format: DataFormat::Yuv420SemiPlanar,
        }
    }

    /// Output slots one request of this channel binds.
    pub fn outputs_per_request(&self) -> usize {
        if self.field_merge_decode && self.process_call_level == ProcessCallLevel::Field {
            2
        } else {
            1
        }
    }

    /// Geometry of the output frames allocated for this channel.
    pub fn frame_layout(&self) -> FrameInfo {
        let dims = decoded_buffer_dims(self.codec, self.max());
        let pitch = align_up(dims.width, 16);
        FrameInfo {
            width: dims.width,
            height: dims.height,
            pitch: [pitch, pitch],
            data_format: DataFormat::Yuv420SemiPlanar,
            field: FieldId::Frame,
            ..FrameInfo::default()
        }
    }
}

/// Settings of a decode link.
///
/// # Example
/// ```rust
/// use ivalink::config::{DecChannelConfig, DecLinkParams};
///
/// let params = DecLinkParams::with_channels(vec![DecChannelConfig::default(); 2]);
/// assert_eq!(params.channels.len(), 2);
/// assert!(params.memory_budget.is_none());
/// ```
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct DecLinkParams {
    pub channels: Vec<DecChannelConfig>,
    pub limits: LinkLimits,
    /// Bytes available for output frames across all channels.
    pub memory_budget: Option<usize>,
    /// Lift an APP segment out of MJPEG units into frame metadata.
    pub app_marker: Option<AppMarkerConfig>,
}

impl DecLinkParams {
    pub fn with_channels(channels: Vec<DecChannelConfig>) -> Self {
        Self {
            channels,
            ..Self::default()
        }
    }
}

/// Settings of one encode channel.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct EncChannelConfig {
    pub codec: CodecType,
    /// Size of the frames the previous stage delivers.
    pub input: Resolution,
    pub pitch: u32,
    pub scan: ScanFormat,
    pub input_frame_rate: u32,
    /// Both fields of an interlaced source arrive in one buffer.
    pub field_merge_encode: bool,
    /// Encode each field as its own picture.
    pub field_pic_encode: bool,
    pub max_bitrate: u32,
    pub dynamic: EncDynamicParams,
}

impl Default for EncChannelConfig {
    fn default() -> Self {
        Self {
            codec: CodecType::H264High,
            input: Resolution::new(1920, 1080),
            pitch: 1920,
            scan: ScanFormat::Progressive,
            input_frame_rate: 30,
            field_merge_encode: false,
            field_pic_encode: false,
            max_bitrate: 10_000_000,
            dynamic: EncDynamicParams::default(),
        }
    }
}

impl EncChannelConfig {
    pub(crate) fn create_params(&self, ch: ChannelId) -> EncCreateParams {
        EncCreateParams {
            ch,
            codec: self.codec,
            max: self.input,
            scan: self.scan,
            data_format: DataFormat::Yuv420SemiPlanar,
            field_merge_encode: self.field_merge_encode,
            field_pic_encode: self.field_pic_encode,
            max_bitrate: self.max_bitrate,
        }
    }

    /// Dynamic parameters with the input geometry filled in from the channel.
    pub(crate) fn initial_dynamic(&self) -> EncDynamicParams {
        EncDynamicParams {
            input: self.input,
            input_pitch: self.pitch,
            ..self.dynamic.clone()
        }
    }

    /// Input frames one request binds: separately delivered fields of an
    /// interlaced source are encoded as one frame picture.
    pub fn inputs_per_request(&self) -> usize {
        if self.scan == ScanFormat::Interlaced && !self.field_merge_encode && !self.field_pic_encode {
            2
        } else {
            1
        }
    }

    pub(crate) fn resolution_class(&self, ch: ChannelId) -> Result<ResolutionClass, LinkError> {
        self.input.class().ok_or_else(|| {
            LinkError::InvalidArg(format!(
                "channel {ch}: {}x{} matches no resolution class",
                self.input.width, self.input.height
            ))
        })
    }
}

/// New codec of an encode channel.
///
/// The input geometry stays with the channel: moving to field-picture
/// encoding halves the input height of a progressive source, moving away
/// from it doubles the height of an interlaced one.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CodecSwitchParams {
    pub codec: CodecType,
    pub field_pic_encode: bool,
    pub max_bitrate: u32,
    pub dynamic: EncDynamicParams,
}

impl CodecSwitchParams {
    /// Channel settings after switching `current` to these params.
    pub fn apply_to(&self, current: &EncChannelConfig) -> EncChannelConfig {
        let mut next = EncChannelConfig {
            codec: self.codec,
            field_pic_encode: self.field_pic_encode,
            max_bitrate: self.max_bitrate,
            dynamic: self.dynamic.clone(),
            ..current.clone()
        };
        match (self.field_pic_encode, current.scan) {
            (true, ScanFormat::Progressive) => next.input.height /= 2,
            (false, ScanFormat::Interlaced) => next.input.height *= 2,
            _ => {}
        }
        next.scan = if self.field_pic_encode {
            ScanFormat::Interlaced
        } else {
            ScanFormat::Progressive
        };
        next
    }
}

/// Settings of an encode link.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct EncLinkParams {
    pub channels: Vec<EncChannelConfig>,
    pub limits: LinkLimits,
    /// Output bitstream buffers contributed by each channel to its class pool.
    pub bufs_per_channel: usize,
    pub memory_budget: Option<usize>,
}

impl Default for EncLinkParams {
    fn default() -> Self {
        Self {
            channels: Vec::new(),
            limits: LinkLimits::default(),
            bufs_per_channel: DEFAULT_BUFS_PER_CHANNEL,
            memory_budget: None,
        }
    }
}

impl EncLinkParams {
    pub fn with_channels(channels: Vec<EncChannelConfig>) -> Self {
        Self {
            channels,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_count_defaults_and_clamps() {
        let limits = LinkLimits::default();
        assert_eq!(limits.resolve_bufs(0, 0), DEFAULT_BUFS_PER_CHANNEL);
        assert_eq!(limits.resolve_bufs(0, -3), DEFAULT_BUFS_PER_CHANNEL);
        assert_eq!(limits.resolve_bufs(0, 6), 6);
        assert_eq!(limits.resolve_bufs(0, 40), DEFAULT_MAX_OUT_BUFS_PER_CHANNEL);
    }

    #[test]
    fn h264_frames_are_padded_and_pitch_aligned() {
        let cfg = DecChannelConfig {
            max_width: 720,
            max_height: 480,
            ..DecChannelConfig::default()
        };
        let layout = cfg.frame_layout();
        assert_eq!((layout.width, layout.height), (896, 576));
        assert_eq!(layout.pitch, [896, 896]);

        let mjpeg = DecChannelConfig {
            codec: CodecType::Mjpeg,
            max_width: 700,
            max_height: 480,
            ..DecChannelConfig::default()
        };
        assert_eq!(mjpeg.frame_layout().pitch[0], 704);
    }

    #[test]
    fn oversize_channel_is_rejected() {
        let cfg = DecChannelConfig {
            max_width: 8192,
            ..DecChannelConfig::default()
        };
        assert!(matches!(cfg.validate(3), Err(LinkError::InvalidArg(_))));
    }

    #[test]
    fn separate_fields_pair_up_per_request() {
        let mut cfg = EncChannelConfig {
            scan: ScanFormat::Interlaced,
            ..EncChannelConfig::default()
        };
        assert_eq!(cfg.inputs_per_request(), 2);
        cfg.field_pic_encode = true;
        assert_eq!(cfg.inputs_per_request(), 1);
    }

    #[test]
    fn field_picture_switch_halves_a_progressive_source() {
        let current = EncChannelConfig::default();
        let switch = CodecSwitchParams {
            codec: CodecType::H264Main,
            field_pic_encode: true,
            max_bitrate: 4_000_000,
            dynamic: EncDynamicParams::default(),
        };
        let next = switch.apply_to(&current);
        assert_eq!((next.input.height, next.scan), (540, ScanFormat::Interlaced));
        assert_eq!(next.inputs_per_request(), 1);

        let back = CodecSwitchParams { field_pic_encode: false, ..switch }.apply_to(&next);
        assert_eq!((back.input.height, back.scan), (1080, ScanFormat::Progressive));
    }

    #[test]
    fn channel_count_is_bounded() {
        let limits = LinkLimits::default();
        assert!(limits.check_channels(8).is_ok());
        assert!(limits.check_channels(9).is_err());
        assert!(limits.check_channels(0).is_err());
    }
}
