//! Core types for accelerated encode/decode sessions.

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;

use crate::CodecError;

/// Working dimensions are rounded up to this many pixels.
pub const DIMENSION_ALIGNMENT: u32 = 32;

/// Round `value` up to the next multiple of `multiple`.
#[must_use]
pub fn roundup(value: u32, multiple: u32) -> u32 {
    value.div_ceil(multiple) * multiple
}

/// Padded working size for a logical frame size.
#[must_use]
pub fn padded_dimensions(width: u32, height: u32) -> (u32, u32) {
    (
        roundup(width, DIMENSION_ALIGNMENT),
        roundup(height, DIMENSION_ALIGNMENT),
    )
}

/// Video codec type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Codec {
    /// H.264/AVC codec.
    H264,
    /// H.265/HEVC codec.
    Hevc,
    /// AV1 codec.
    Av1,
}

impl Codec {
    pub const ALL: [Codec; 3] = [Codec::H264, Codec::Hevc, Codec::Av1];

    /// Encoding name as exchanged with clients.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::H264 => "h264",
            Self::Hevc => "h265",
            Self::Av1 => "av1",
        }
    }
}

impl Default for Codec {
    fn default() -> Self {
        Self::H264
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Codec {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "h264" | "avc" => Ok(Self::H264),
            "h265" | "hevc" => Ok(Self::Hevc),
            "av1" => Ok(Self::Av1),
            other => Err(CodecError::configuration(format!(
                "unknown encoding {other:?}"
            ))),
        }
    }
}

/// Pixel format of an image or surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// Packed 32-bit B, G, R, unused.
    Bgrx,
    /// Packed 32-bit B, G, R, alpha.
    Bgra,
    /// Packed 32-bit R, G, B, unused.
    Rgbx,
    /// Packed 32-bit R, G, B, alpha.
    Rgba,
    /// NV12 (YUV 4:2:0, planar Y + interleaved UV).
    Nv12,
    /// YUV 4:4:4, three full-resolution planes.
    Yuv444p,
    /// G, B, R in three full-resolution planes (identity matrix, lossless).
    Gbrp,
}

impl PixelFormat {
    /// Returns the number of bytes per pixel for packed formats,
    /// or an approximation for planar formats.
    #[must_use]
    pub fn bytes_per_pixel(&self) -> f32 {
        match self {
            Self::Bgrx | Self::Bgra | Self::Rgbx | Self::Rgba => 4.0,
            Self::Nv12 => 1.5,
            Self::Yuv444p | Self::Gbrp => 3.0,
        }
    }

    /// Returns true for packed 32-bit RGB formats.
    #[must_use]
    pub fn is_packed_rgb(&self) -> bool {
        matches!(self, Self::Bgrx | Self::Bgra | Self::Rgbx | Self::Rgba)
    }

    /// Returns true if this is a planar format.
    #[must_use]
    pub fn is_planar(&self) -> bool {
        !self.is_packed_rgb()
    }

    /// Number of planes in memory.
    #[must_use]
    pub fn plane_count(&self) -> usize {
        match self {
            Self::Bgrx | Self::Bgra | Self::Rgbx | Self::Rgba => 1,
            Self::Nv12 => 2,
            Self::Yuv444p | Self::Gbrp => 3,
        }
    }

    /// Byte offsets of (blue, green, red) in a packed pixel.
    #[must_use]
    pub fn bgr_offsets(&self) -> Option<[usize; 3]> {
        match self {
            Self::Bgrx | Self::Bgra => Some([0, 1, 2]),
            Self::Rgbx | Self::Rgba => Some([2, 1, 0]),
            _ => None,
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Bgrx => "BGRX",
            Self::Bgra => "BGRA",
            Self::Rgbx => "RGBX",
            Self::Rgba => "RGBA",
            Self::Nv12 => "NV12",
            Self::Yuv444p => "YUV444P",
            Self::Gbrp => "GBRP",
        }
    }
}

impl Default for PixelFormat {
    fn default() -> Self {
        Self::Bgrx
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for PixelFormat {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "BGRX" => Ok(Self::Bgrx),
            "BGRA" => Ok(Self::Bgra),
            "RGBX" => Ok(Self::Rgbx),
            "RGBA" => Ok(Self::Rgba),
            "NV12" => Ok(Self::Nv12),
            "YUV444P" => Ok(Self::Yuv444p),
            "GBRP" => Ok(Self::Gbrp),
            other => Err(CodecError::unsupported_format(other.to_string())),
        }
    }
}

/// Chroma layout the encoder works in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelLayout {
    /// Standard 4:2:0 layout.
    Nv12,
    /// Extended 4:4:4 layout, required for lossless.
    Yuv444p,
}

impl PixelLayout {
    /// Surface format the encoder consumes for this layout.
    ///
    /// Lossless encodes use the identity matrix so the planes carry G, B, R.
    #[must_use]
    pub fn surface_format(&self, lossless: bool) -> PixelFormat {
        match (self, lossless) {
            (Self::Nv12, _) => PixelFormat::Nv12,
            (Self::Yuv444p, false) => PixelFormat::Yuv444p,
            (Self::Yuv444p, true) => PixelFormat::Gbrp,
        }
    }

    /// Layout a decoded surface format belongs to.
    #[must_use]
    pub fn of_surface(format: PixelFormat) -> Option<Self> {
        match format {
            PixelFormat::Nv12 => Some(Self::Nv12),
            PixelFormat::Yuv444p | PixelFormat::Gbrp => Some(Self::Yuv444p),
            _ => None,
        }
    }
}

impl fmt::Display for PixelLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nv12 => f.write_str("NV12"),
            Self::Yuv444p => f.write_str("YUV444P"),
        }
    }
}

/// Encoder preset level controlling the speed/quality tradeoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EncoderPreset {
    /// Fastest encoding, lowest quality (P1).
    Fastest,
    /// Fast encoding (P2).
    Fast,
    /// Medium speed (P4).
    Medium,
    /// Slow encoding, higher quality (P5).
    Slow,
    /// Slowest encoding, highest quality (P7).
    Slowest,
}

impl Default for EncoderPreset {
    fn default() -> Self {
        Self::Medium
    }
}

/// Tuning mode for the encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TuningMode {
    /// High quality encoding.
    HighQuality,
    /// Low latency encoding (good for real-time streaming).
    LowLatency,
    /// Ultra low latency encoding.
    UltraLowLatency,
    /// Lossless encoding.
    Lossless,
}

impl Default for TuningMode {
    fn default() -> Self {
        Self::LowLatency
    }
}

/// A named encoder preset: a preset level combined with a tuning mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
pub enum Preset {
    #[serde(rename = "ull-fast")]
    UltraLowLatencyFast,
    #[serde(rename = "ull")]
    UltraLowLatency,
    #[serde(rename = "ll-fast")]
    LowLatencyFast,
    #[serde(rename = "ll")]
    LowLatency,
    #[serde(rename = "ll-hq")]
    LowLatencyQuality,
    #[serde(rename = "default")]
    Default,
    #[serde(rename = "hq-fast")]
    HighQualityFast,
    #[serde(rename = "hq")]
    HighQuality,
    #[serde(rename = "lossless-fast")]
    LosslessFast,
    #[serde(rename = "lossless")]
    Lossless,
}

struct PresetInfo {
    preset: Preset,
    name: &'static str,
    level: EncoderPreset,
    tuning: TuningMode,
    speed: u8,
    quality: u8,
}

// Declaration order is the ranking tie-breaker.
const PRESETS: [PresetInfo; 10] = [
    PresetInfo { preset: Preset::UltraLowLatencyFast, name: "ull-fast", level: EncoderPreset::Fastest, tuning: TuningMode::UltraLowLatency, speed: 100, quality: 10 },
    PresetInfo { preset: Preset::UltraLowLatency, name: "ull", level: EncoderPreset::Fast, tuning: TuningMode::UltraLowLatency, speed: 90, quality: 25 },
    PresetInfo { preset: Preset::LowLatencyFast, name: "ll-fast", level: EncoderPreset::Fastest, tuning: TuningMode::LowLatency, speed: 80, quality: 30 },
    PresetInfo { preset: Preset::LowLatency, name: "ll", level: EncoderPreset::Medium, tuning: TuningMode::LowLatency, speed: 70, quality: 45 },
    PresetInfo { preset: Preset::LowLatencyQuality, name: "ll-hq", level: EncoderPreset::Slow, tuning: TuningMode::LowLatency, speed: 60, quality: 60 },
    PresetInfo { preset: Preset::Default, name: "default", level: EncoderPreset::Medium, tuning: TuningMode::HighQuality, speed: 50, quality: 50 },
    PresetInfo { preset: Preset::HighQualityFast, name: "hq-fast", level: EncoderPreset::Slow, tuning: TuningMode::HighQuality, speed: 40, quality: 70 },
    PresetInfo { preset: Preset::HighQuality, name: "hq", level: EncoderPreset::Slowest, tuning: TuningMode::HighQuality, speed: 20, quality: 85 },
    PresetInfo { preset: Preset::LosslessFast, name: "lossless-fast", level: EncoderPreset::Fastest, tuning: TuningMode::Lossless, speed: 40, quality: 100 },
    PresetInfo { preset: Preset::Lossless, name: "lossless", level: EncoderPreset::Slowest, tuning: TuningMode::Lossless, speed: 0, quality: 100 },
];

impl Preset {
    /// Every preset in declaration order.
    pub fn all() -> impl Iterator<Item = Preset> {
        PRESETS.iter().map(|p| p.preset)
    }

    fn info(&self) -> &'static PresetInfo {
        // The table is indexed by discriminant.
        &PRESETS[*self as usize]
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.info().name
    }

    /// Nominal encode speed, 0-100.
    #[must_use]
    pub fn speed(&self) -> u8 {
        self.info().speed
    }

    /// Nominal output quality, 0-100.
    #[must_use]
    pub fn quality(&self) -> u8 {
        self.info().quality
    }

    #[must_use]
    pub fn level(&self) -> EncoderPreset {
        self.info().level
    }

    #[must_use]
    pub fn tuning(&self) -> TuningMode {
        self.info().tuning
    }

    #[must_use]
    pub fn is_lossless(&self) -> bool {
        self.info().tuning == TuningMode::Lossless
    }

    /// Position in the declaration order.
    #[must_use]
    pub fn ordinal(&self) -> usize {
        *self as usize
    }
}

impl fmt::Display for Preset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Preset {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        PRESETS
            .iter()
            .find(|p| p.name == wanted)
            .map(|p| p.preset)
            .ok_or_else(|| CodecError::configuration(format!("unknown preset {s:?}")))
    }
}

/// Encoder profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Profile {
    H264Baseline,
    H264Main,
    H264High,
    H264High444,
    HevcMain,
    HevcMain444,
    Av1Main,
}

impl Profile {
    #[must_use]
    pub fn codec(&self) -> Codec {
        match self {
            Self::H264Baseline | Self::H264Main | Self::H264High | Self::H264High444 => Codec::H264,
            Self::HevcMain | Self::HevcMain444 => Codec::Hevc,
            Self::Av1Main => Codec::Av1,
        }
    }

    #[must_use]
    pub fn supports_yuv444(&self) -> bool {
        matches!(self, Self::H264High444 | Self::HevcMain444)
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::H264Baseline => "baseline",
            Self::H264Main => "main",
            Self::H264High => "high",
            Self::H264High444 => "high444",
            Self::HevcMain => "main",
            Self::HevcMain444 => "main444",
            Self::Av1Main => "main",
        }
    }

    /// Profiles usable for a codec and layout, best first.
    #[must_use]
    pub fn preferences(codec: Codec, layout: PixelLayout) -> &'static [Profile] {
        match (codec, layout) {
            (Codec::H264, PixelLayout::Yuv444p) => &[Self::H264High444],
            (Codec::H264, PixelLayout::Nv12) => &[Self::H264High, Self::H264Main, Self::H264Baseline],
            (Codec::Hevc, PixelLayout::Yuv444p) => &[Self::HevcMain444],
            (Codec::Hevc, PixelLayout::Nv12) => &[Self::HevcMain],
            (Codec::Av1, PixelLayout::Yuv444p) => &[],
            (Codec::Av1, PixelLayout::Nv12) => &[Self::Av1Main],
        }
    }
}

impl fmt::Display for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Downscaling ratio applied before encoding.
///
/// Only [`Scaling::new`] builds one, so the denominator is never zero:
///
/// ```compile_fail
/// let broken = accelcodec::Scaling { num: 1, den: 0 };
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Scaling {
    num: u32,
    den: u32,
}

impl Scaling {
    pub const NONE: Scaling = Scaling { num: 1, den: 1 };

    /// Create a scaling ratio; only downscaling is accepted.
    pub fn new(num: u32, den: u32) -> Result<Self, CodecError> {
        if num == 0 || den == 0 || num > den {
            return Err(CodecError::configuration(format!(
                "invalid scaling ratio {num}/{den}"
            )));
        }
        Ok(Self { num, den })
    }

    /// The ratio as `(numerator, denominator)`.
    #[must_use]
    pub fn ratio(&self) -> (u32, u32) {
        (self.num, self.den)
    }

    #[must_use]
    pub fn is_identity(&self) -> bool {
        self.num == self.den
    }

    /// Scaled size, rounded down to even values of at least 2.
    #[must_use]
    pub fn apply(&self, width: u32, height: u32) -> (u32, u32) {
        if self.is_identity() {
            return (width, height);
        }
        let scale = |v: u32| ((u64::from(v) * u64::from(self.num) / u64::from(self.den)) as u32 & !1).max(2);
        (scale(width), scale(height))
    }
}

impl Default for Scaling {
    fn default() -> Self {
        Self::NONE
    }
}

/// Parameters for initialising an encode session.
#[derive(Debug, Clone)]
pub struct EncodeParams {
    /// Logical frame width in pixels.
    pub width: u32,
    /// Logical frame height in pixels.
    pub height: u32,
    /// Colorspace of the images handed to `process`.
    pub colorspace: PixelFormat,
    /// Codec to produce.
    pub codec: Codec,
    /// Target quality, 0-100.
    pub quality: u8,
    /// Target speed, 0-100.
    pub speed: u8,
    /// Downscaling ratio.
    pub scaling: Scaling,
    /// Preferred device ordinal.
    pub device: Option<u32>,
}

impl Default for EncodeParams {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            colorspace: PixelFormat::Bgrx,
            codec: Codec::H264,
            quality: 50,
            speed: 50,
            scaling: Scaling::NONE,
            device: None,
        }
    }
}

impl EncodeParams {
    /// Create encode parameters for the given dimensions.
    #[must_use]
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            ..Default::default()
        }
    }

    #[must_use]
    pub fn colorspace(mut self, colorspace: PixelFormat) -> Self {
        self.colorspace = colorspace;
        self
    }

    #[must_use]
    pub fn codec(mut self, codec: Codec) -> Self {
        self.codec = codec;
        self
    }

    #[must_use]
    pub fn quality(mut self, quality: u8) -> Self {
        self.quality = quality.min(100);
        self
    }

    #[must_use]
    pub fn speed(mut self, speed: u8) -> Self {
        self.speed = speed.min(100);
        self
    }

    #[must_use]
    pub fn scaling(mut self, scaling: Scaling) -> Self {
        self.scaling = scaling;
        self
    }

    /// Prefer a device ordinal.
    #[must_use]
    pub fn device(mut self, device: u32) -> Self {
        self.device = Some(device);
        self
    }
}

/// Parameters for initialising a decode session.
#[derive(Debug, Clone)]
pub struct DecodeParams {
    pub codec: Codec,
    pub width: u32,
    pub height: u32,
    /// Layout the stream is expected to carry.
    pub layout: PixelLayout,
    /// Preferred device ordinal.
    pub device: Option<u32>,
}

impl DecodeParams {
    #[must_use]
    pub fn new(codec: Codec, width: u32, height: u32) -> Self {
        Self {
            codec,
            width,
            height,
            layout: PixelLayout::Nv12,
            device: None,
        }
    }

    #[must_use]
    pub fn layout(mut self, layout: PixelLayout) -> Self {
        self.layout = layout;
        self
    }

    #[must_use]
    pub fn device(mut self, device: u32) -> Self {
        self.device = Some(device);
        self
    }
}
