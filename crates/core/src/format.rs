use std::fmt;

/// Compressed stream family handled by a codec instance.
///
/// # Example
/// ```rust
/// use ivalink_core::prelude::CodecType;
///
/// assert!(CodecType::H264High.is_h264());
/// assert!(!CodecType::Mjpeg.is_h264());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum CodecType {
    Mjpeg,
    H264Baseline,
    H264Main,
    H264High,
}

impl CodecType {
    pub fn is_h264(self) -> bool {
        matches!(
            self,
            CodecType::H264Baseline | CodecType::H264Main | CodecType::H264High
        )
    }

    /// Whether decoded frames of this type carry codec padding around the active region.
    pub fn is_padded(self) -> bool {
        self.is_h264()
    }
}

impl fmt::Display for CodecType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CodecType::Mjpeg => "mjpeg",
            CodecType::H264Baseline => "h264-bp",
            CodecType::H264Main => "h264-mp",
            CodecType::H264High => "h264-hp",
        };
        f.write_str(name)
    }
}

/// Width and height in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Smallest resolution class that fits, if any.
    pub fn class(self) -> Option<ResolutionClass> {
        ResolutionClass::from_dims(self.width, self.height)
    }
}

/// Coarse size bucket used to pool output buffers of similar size.
///
/// Classes are tried in ascending order; the first whose width and height
/// both cover the request wins.
///
/// # Example
/// ```rust
/// use ivalink_core::prelude::ResolutionClass;
///
/// assert_eq!(ResolutionClass::from_dims(352, 288), Some(ResolutionClass::Cif));
/// assert_eq!(ResolutionClass::from_dims(1920, 1080), Some(ResolutionClass::Hd1080));
/// assert_eq!(ResolutionClass::from_dims(8192, 64), None);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ResolutionClass {
    Cif,
    D1,
    Hd720,
    Hd1080,
    Mp4,
    Mp5,
    Mp9,
    Mp16,
}

impl ResolutionClass {
    pub const ALL: [ResolutionClass; 8] = [
        ResolutionClass::Cif,
        ResolutionClass::D1,
        ResolutionClass::Hd720,
        ResolutionClass::Hd1080,
        ResolutionClass::Mp4,
        ResolutionClass::Mp5,
        ResolutionClass::Mp9,
        ResolutionClass::Mp16,
    ];

    pub const fn max_dims(self) -> Resolution {
        match self {
            ResolutionClass::Cif => Resolution::new(368, 288),
            ResolutionClass::D1 => Resolution::new(720, 576),
            ResolutionClass::Hd720 => Resolution::new(1280, 720),
            ResolutionClass::Hd1080 => Resolution::new(1920, 1088),
            ResolutionClass::Mp4 => Resolution::new(2048, 2048),
            ResolutionClass::Mp5 => Resolution::new(2592, 2048),
            ResolutionClass::Mp9 => Resolution::new(3072, 3072),
            ResolutionClass::Mp16 => Resolution::new(4096, 4096),
        }
    }

    pub fn from_dims(width: u32, height: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|class| {
            let max = class.max_dims();
            width <= max.width && height <= max.height
        })
    }

    /// Position in [`ResolutionClass::ALL`].
    pub fn index(self) -> usize {
        self as usize
    }
}

/// Interlacing of a channel's source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ScanFormat {
    #[default]
    Progressive,
    Interlaced,
}

/// Which field a buffer holds.
///
/// # Example
/// ```rust
/// use ivalink_core::prelude::FieldId;
///
/// assert_eq!(FieldId::Top.toggled(), FieldId::Bottom);
/// assert_eq!(FieldId::Frame.toggled(), FieldId::Frame);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum FieldId {
    #[default]
    Top,
    Bottom,
    /// Both fields (progressive frame).
    Frame,
}

impl FieldId {
    pub fn toggled(self) -> Self {
        match self {
            FieldId::Top => FieldId::Bottom,
            FieldId::Bottom => FieldId::Top,
            FieldId::Frame => FieldId::Frame,
        }
    }
}

/// Memory layout of raw frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DataFormat {
    /// Luma plane followed by interleaved chroma at half height.
    #[default]
    Yuv420SemiPlanar,
    Yuv422Interleaved,
}

impl DataFormat {
    /// Bytes needed for `pitch x height` luma lines plus chroma.
    pub fn frame_bytes(self, pitch: u32, height: u32) -> usize {
        let luma = pitch as usize * height as usize;
        match self {
            DataFormat::Yuv420SemiPlanar => luma + luma / 2,
            DataFormat::Yuv422Interleaved => luma,
        }
    }
}

/// Horizontal padding added around H264 reference frames, per side.
pub const PAD_X: u32 = 32;
/// Vertical padding added around H264 reference frames, per side.
pub const PAD_Y: u32 = 24;

/// Round `value` up to a multiple of `align` (a power of two).
pub const fn align_up(value: u32, align: u32) -> u32 {
    (value + align - 1) & !(align - 1)
}

/// Buffer dimensions a decoder needs for a channel of the given maximum size.
///
/// # Example
/// ```rust
/// use ivalink_core::prelude::{decoded_buffer_dims, CodecType, Resolution};
///
/// let padded = decoded_buffer_dims(CodecType::H264High, Resolution::new(1920, 1080));
/// assert_eq!(padded, Resolution::new(2048, 1176));
/// let plain = decoded_buffer_dims(CodecType::Mjpeg, Resolution::new(640, 480));
/// assert_eq!(plain, Resolution::new(640, 480));
/// ```
pub fn decoded_buffer_dims(codec: CodecType, max: Resolution) -> Resolution {
    if codec.is_padded() {
        Resolution::new(
            align_up(max.width + 2 * PAD_X, 128),
            max.height + 4 * PAD_Y,
        )
    } else {
        max
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolution_classes_are_first_fit() {
        assert_eq!(ResolutionClass::from_dims(368, 288), Some(ResolutionClass::Cif));
        assert_eq!(ResolutionClass::from_dims(369, 288), Some(ResolutionClass::D1));
        assert_eq!(ResolutionClass::from_dims(704, 600), Some(ResolutionClass::Hd720));
        assert_eq!(ResolutionClass::from_dims(2592, 1944), Some(ResolutionClass::Mp5));
        assert_eq!(ResolutionClass::from_dims(4096, 4097), None);
    }

    #[test]
    fn pitch_alignment() {
        assert_eq!(align_up(720, 16), 720);
        assert_eq!(align_up(721, 16), 736);
        assert_eq!(align_up(1, 128), 128);
    }

    #[test]
    fn yuv420_frame_size() {
        assert_eq!(DataFormat::Yuv420SemiPlanar.frame_bytes(16, 4), 96);
    }
}
