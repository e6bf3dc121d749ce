//! Create-time and run-time parameters for codec instances.

use ivalink_core::prelude::*;
use smallvec::SmallVec;

use crate::CodecError;

/// Lowest target bitrate an encoder accepts, in bits per second.
pub const MIN_TARGET_BITRATE: u32 = 16 * 1024;

/// Upper bound for H264 quantizer values.
pub const H264_MAX_QP: i32 = 51;

/// Accepted MJPEG quality factor range.
pub const MJPEG_QUALITY: std::ops::RangeInclusive<i32> = 2..=97;

/// Most ROI regions an encoder instance tracks.
pub const MAX_ROI_REGIONS: usize = 4;

/// Granularity of one decoder process call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ProcessCallLevel {
    #[default]
    Frame,
    Field,
}

/// Which pictures a decoder reconstructs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DecodeFrameType {
    #[default]
    All,
    IpOnly,
    IOnly,
}

/// Parameters fixed for the lifetime of a decoder instance.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DecCreateParams {
    pub ch: ChannelId,
    pub codec: CodecType,
    pub max: Resolution,
    pub display_delay: i32,
    pub process_call_level: ProcessCallLevel,
    /// Decode both fields of an interlaced picture into one request.
    pub field_merge: bool,
    /// Output frames the link allocated for this instance.
    pub num_out_bufs: usize,
    pub data_format: DataFormat,
}

impl DecCreateParams {
    /// Output slots a single request needs for this configuration.
    pub fn outputs_per_request(&self) -> usize {
        if self.field_merge && self.process_call_level == ProcessCallLevel::Field {
            2
        } else {
            1
        }
    }
}

/// Decoder parameters that may change while running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DecDynamicParams {
    pub decode_frame_type: DecodeFrameType,
    pub target_bitrate: u32,
    pub target_frame_rate: u32,
}

impl Default for DecDynamicParams {
    fn default() -> Self {
        Self {
            decode_frame_type: DecodeFrameType::All,
            target_bitrate: 2_000_000,
            target_frame_rate: 30,
        }
    }
}

/// Encoder rate control mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum RateControl {
    #[default]
    Vbr,
    Cbr,
    Off,
}

/// Quantizer bounds and start value.
///
/// # Example
/// ```rust
/// use ivalink_codec::params::QpRange;
///
/// assert!(QpRange { min: 10, max: 40, init: -1 }.validate_h264("qp-i").is_ok());
/// assert!(QpRange { min: 10, max: 52, init: 28 }.validate_h264("qp-i").is_err());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct QpRange {
    pub min: i32,
    pub max: i32,
    /// Start value, -1 lets the codec choose.
    pub init: i32,
}

impl QpRange {
    pub fn validate_h264(&self, name: &'static str) -> Result<(), CodecError> {
        if self.min > H264_MAX_QP {
            return Err(invalid(name, format!("min {} above {H264_MAX_QP}", self.min)));
        }
        if self.max > H264_MAX_QP {
            return Err(invalid(name, format!("max {} above {H264_MAX_QP}", self.max)));
        }
        if !(-1..=H264_MAX_QP).contains(&self.init) {
            return Err(invalid(name, format!("init {} outside -1..=51", self.init)));
        }
        Ok(())
    }
}

impl Default for QpRange {
    fn default() -> Self {
        Self {
            min: 10,
            max: 36,
            init: -1,
        }
    }
}

/// One region of interest, in luma pixels of the input frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RoiRegion {
    pub start_x: i32,
    pub start_y: i32,
    pub width: i32,
    pub height: i32,
    /// Backend-defined region kind (privacy mask, foreground, ...).
    pub kind: i32,
}

/// Region-of-interest configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RoiParams {
    pub regions: SmallVec<[RoiRegion; MAX_ROI_REGIONS]>,
}

impl RoiParams {
    /// Clip regions to a `width x height` frame.
    ///
    /// Regions beyond [`MAX_ROI_REGIONS`] are dropped. A region that still
    /// falls outside the frame after clipping disables ROI entirely.
    ///
    /// # Example
    /// ```rust
    /// use ivalink_codec::params::{RoiParams, RoiRegion};
    ///
    /// let mut roi = RoiParams::default();
    /// roi.regions.push(RoiRegion { start_x: 600, start_y: 0, width: 100, height: 50, kind: 0 });
    /// roi.clip_to(640, 480);
    /// assert_eq!(roi.regions[0].width, 40);
    /// ```
    pub fn clip_to(&mut self, width: u32, height: u32) -> bool {
        let (w, h) = (width as i32, height as i32);
        let mut truncated = false;
        if self.regions.len() > MAX_ROI_REGIONS {
            self.regions.truncate(MAX_ROI_REGIONS);
            truncated = true;
        }
        let mut out_of_bounds = false;
        for r in self.regions.iter_mut() {
            if r.start_x + r.width > w {
                r.width = w - r.start_x;
            }
            if r.start_y + r.height > h {
                r.height = h - r.start_y;
            }
            let negative = r.start_x < 0
                || r.start_y < 0
                || r.start_x + r.width < 0
                || r.start_y + r.height < 0;
            let beyond = r.start_x >= w || r.start_y >= h || r.width > w || r.height > h;
            out_of_bounds |= negative || beyond;
        }
        if out_of_bounds {
            self.regions.clear();
        }
        truncated
    }
}

/// Parameters fixed for the lifetime of an encoder instance.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct EncCreateParams {
    pub ch: ChannelId,
    pub codec: CodecType,
    pub max: Resolution,
    pub scan: ScanFormat,
    pub data_format: DataFormat,
    /// Both fields of an interlaced source arrive in one buffer.
    pub field_merge_encode: bool,
    /// Encode fields as separate pictures.
    pub field_pic_encode: bool,
    pub max_bitrate: u32,
}

impl Default for EncCreateParams {
    fn default() -> Self {
        Self {
            ch: 0,
            codec: CodecType::H264High,
            max: Resolution::new(1920, 1080),
            scan: ScanFormat::Progressive,
            data_format: DataFormat::Yuv420SemiPlanar,
            field_merge_encode: false,
            field_pic_encode: false,
            max_bitrate: 10_000_000,
        }
    }
}

/// Encoder parameters that may change while running.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct EncDynamicParams {
    pub input: Resolution,
    pub input_pitch: u32,
    pub target_bitrate: u32,
    /// Output frame rate in frames per 1000 seconds.
    pub target_frame_rate: u32,
    pub intra_interval: u32,
    /// For MJPEG instances `init` is the quality factor.
    pub qp_i: QpRange,
    pub qp_p: QpRange,
    pub rate_control: RateControl,
    pub vbr_duration: u32,
    pub vbr_sensitivity: u32,
    pub roi: RoiParams,
    pub max_packet_size: u32,
}

impl Default for EncDynamicParams {
    fn default() -> Self {
        Self {
            input: Resolution::new(1920, 1080),
            input_pitch: 1920,
            target_bitrate: 2_000_000,
            target_frame_rate: 30_000,
            intra_interval: 30,
            qp_i: QpRange::default(),
            qp_p: QpRange::default(),
            rate_control: RateControl::Vbr,
            vbr_duration: 8,
            vbr_sensitivity: 0,
            roi: RoiParams::default(),
            max_packet_size: 0,
        }
    }
}

/// Reject bitrates below [`MIN_TARGET_BITRATE`].
pub fn validate_bitrate(bps: u32) -> Result<(), CodecError> {
    if bps < MIN_TARGET_BITRATE {
        return Err(invalid(
            "target_bitrate",
            format!("{bps} below minimum {MIN_TARGET_BITRATE}"),
        ));
    }
    Ok(())
}

/// Reject MJPEG quality factors outside [`MJPEG_QUALITY`].
pub fn validate_quality(quality: i32) -> Result<(), CodecError> {
    if !MJPEG_QUALITY.contains(&quality) {
        return Err(invalid("quality", format!("{quality} outside 2..=97")));
    }
    Ok(())
}

fn invalid(name: &'static str, reason: String) -> CodecError {
    CodecError::InvalidParam { name, reason }
}

/// Pending dynamic-parameter changes, applied by the worker before the next encode.
///
/// # Example
/// ```rust
/// use ivalink_codec::params::ConfigMask;
///
/// let mut mask = ConfigMask::empty();
/// mask.insert(ConfigMask::BITRATE | ConfigMask::FORCE_IDR);
/// let taken = mask.take();
/// assert!(taken.contains(ConfigMask::FORCE_IDR));
/// assert!(mask.is_empty());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConfigMask(u16);

impl ConfigMask {
    pub const BITRATE: ConfigMask = ConfigMask(1 << 0);
    pub const FPS: ConfigMask = ConfigMask(1 << 1);
    pub const INTRA_INTERVAL: ConfigMask = ConfigMask(1 << 2);
    pub const FORCE_IDR: ConfigMask = ConfigMask(1 << 3);
    pub const QP_I: ConfigMask = ConfigMask(1 << 4);
    pub const QP_P: ConfigMask = ConfigMask(1 << 5);
    pub const RATE_CONTROL: ConfigMask = ConfigMask(1 << 6);
    pub const VBR_DURATION: ConfigMask = ConfigMask(1 << 7);
    pub const VBR_SENSITIVITY: ConfigMask = ConfigMask(1 << 8);
    pub const ROI: ConfigMask = ConfigMask(1 << 9);
    pub const PACKET_SIZE: ConfigMask = ConfigMask(1 << 10);
    pub const ALL: ConfigMask = ConfigMask((1 << 11) - 1);

    pub const fn empty() -> Self {
        ConfigMask(0)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, other: ConfigMask) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: ConfigMask) {
        self.0 |= other.0;
    }

    /// Return the pending bits and clear them.
    pub fn take(&mut self) -> ConfigMask {
        std::mem::take(self)
    }
}

impl std::ops::BitOr for ConfigMask {
    type Output = ConfigMask;

    fn bitor(self, rhs: ConfigMask) -> ConfigMask {
        ConfigMask(self.0 | rhs.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bitrate_floor_is_enforced() {
        assert!(validate_bitrate(MIN_TARGET_BITRATE).is_ok());
        assert!(matches!(
            validate_bitrate(MIN_TARGET_BITRATE - 1),
            Err(CodecError::InvalidParam { name: "target_bitrate", .. })
        ));
    }

    #[test]
    fn h264_qp_bounds() {
        let ok = QpRange { min: 0, max: 51, init: 51 };
        assert!(ok.validate_h264("qp-p").is_ok());
        assert!(QpRange { min: 52, ..ok }.validate_h264("qp-p").is_err());
        assert!(QpRange { init: -2, ..ok }.validate_h264("qp-p").is_err());
    }

    #[test]
    fn mjpeg_quality_bounds() {
        assert!(validate_quality(2).is_ok());
        assert!(validate_quality(97).is_ok());
        assert!(validate_quality(1).is_err());
        assert!(validate_quality(98).is_err());
    }

    #[test]
    fn roi_out_of_frame_disables_all_regions() {
        let mut roi = RoiParams::default();
        roi.regions.push(RoiRegion { start_x: 10, start_y: 10, width: 20, height: 20, kind: 1 });
        roi.regions.push(RoiRegion { start_x: 700, start_y: 0, width: 20, height: 20, kind: 1 });
        roi.clip_to(640, 480);
        assert!(roi.regions.is_empty());
    }

    #[test]
    fn roi_extra_regions_are_truncated() {
        let mut roi = RoiParams::default();
        for i in 0..6 {
            roi.regions.push(RoiRegion { start_x: i * 10, start_y: 0, width: 5, height: 5, kind: 0 });
        }
        assert!(roi.clip_to(640, 480));
        assert_eq!(roi.regions.len(), MAX_ROI_REGIONS);
    }

    #[test]
    fn field_merge_needs_two_outputs_only_at_field_level() {
        let mut p = DecCreateParams {
            ch: 0,
            codec: CodecType::H264High,
            max: Resolution::new(720, 480),
            display_delay: 0,
            process_call_level: ProcessCallLevel::Frame,
            field_merge: true,
            num_out_bufs: 4,
            data_format: DataFormat::Yuv420SemiPlanar,
        };
        assert_eq!(p.outputs_per_request(), 1);
        p.process_call_level = ProcessCallLevel::Field;
        assert_eq!(p.outputs_per_request(), 2);
    }
}
