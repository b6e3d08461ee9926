//! Encoder configuration negotiation.
//!
//! Picks the chroma layout, lossless mode, preset and profile for a session
//! from its speed/quality targets and what the device reports. Presets are
//! ranked by a weighted distance to the targets; ties keep declaration order.

use tracing::debug;

use crate::config::AccelConfig;
use crate::driver::CodecCaps;
use crate::error::{CodecError, Result};
use crate::registry::FeatureFlags;
use crate::types::{Codec, PixelFormat, PixelLayout, Preset, Profile};

/// Ranking units the current preset may trail the best candidate by and
/// still be kept.
pub const PRESET_HYSTERESIS: u32 = 8;

const SPEED_WEIGHT: u32 = 2;
const QUALITY_WEIGHT: u32 = 3;

/// What a device declares for one codec, after the module probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeclaredSupport {
    pub nv12: bool,
    pub yuv444: bool,
    pub lossless: bool,
    pub presets: Vec<Preset>,
    pub profiles: Vec<Profile>,
}

impl DeclaredSupport {
    /// Device capabilities narrowed by the probe results, once the probe ran.
    #[must_use]
    pub fn from_caps(caps: &CodecCaps, flags: FeatureFlags) -> Self {
        let yuv444 = caps.supports_layout(PixelLayout::Yuv444p) && (!flags.probed || flags.yuv444);
        Self {
            nv12: caps.supports_layout(PixelLayout::Nv12),
            yuv444,
            lossless: yuv444 && caps.lossless && (!flags.probed || flags.lossless),
            presets: caps.presets.clone(),
            profiles: caps.profiles.clone(),
        }
    }
}

/// Inputs of one negotiation.
#[derive(Debug, Clone)]
pub struct NegotiationRequest {
    pub codec: Codec,
    pub speed: u8,
    pub quality: u8,
    pub colorspace: PixelFormat,
    pub support: DeclaredSupport,
    /// The session downscales before encoding.
    pub scaling: bool,
    /// Preset currently in use, for hysteresis.
    pub current: Option<Preset>,
}

/// Outcome of a negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Negotiated {
    pub layout: PixelLayout,
    pub lossless: bool,
    pub preset: Preset,
    pub profile: Profile,
}

impl Negotiated {
    /// Surface format the encoder consumes.
    #[must_use]
    pub fn surface_format(&self) -> PixelFormat {
        self.layout.surface_format(self.lossless)
    }
}

/// Distance of a preset from the speed/quality targets.
#[must_use]
pub fn preset_distance(preset: Preset, speed: u8, quality: u8) -> u32 {
    SPEED_WEIGHT * u32::from(preset.speed().abs_diff(speed))
        + QUALITY_WEIGHT * u32::from(preset.quality().abs_diff(quality))
}

#[derive(Debug, Clone)]
pub struct PresetNegotiator {
    yuv444_threshold: u8,
    lossless_threshold: u8,
    preset_override: Option<Preset>,
}

impl Default for PresetNegotiator {
    fn default() -> Self {
        Self::new(&AccelConfig::default())
    }
}

impl PresetNegotiator {
    #[must_use]
    pub fn new(config: &AccelConfig) -> Self {
        Self {
            yuv444_threshold: config.yuv444_threshold,
            lossless_threshold: config.lossless_threshold,
            preset_override: config.preset_override,
        }
    }

    #[must_use]
    pub fn lossless_threshold(&self) -> u8 {
        self.lossless_threshold
    }

    /// Presets compatible with the lossless mode, best first.
    ///
    /// The operator override, if compatible, always comes first.
    #[must_use]
    pub fn rank(&self, speed: u8, quality: u8, lossless: bool) -> Vec<(Preset, u32)> {
        let mut ranked: Vec<(Preset, u32)> = Preset::all()
            .filter(|p| p.is_lossless() == lossless)
            .map(|p| (p, preset_distance(p, speed, quality)))
            .collect();
        ranked.sort_by_key(|&(_, distance)| distance);
        if let Some(wanted) = self.preset_override {
            if let Some(pos) = ranked.iter().position(|&(p, _)| p == wanted) {
                let entry = ranked.remove(pos);
                ranked.insert(0, entry);
            }
        }
        ranked
    }

    pub fn negotiate(&self, request: &NegotiationRequest) -> Result<Negotiated> {
        if !request.colorspace.is_packed_rgb() {
            return Err(CodecError::unsupported_format(format!(
                "cannot encode from {}",
                request.colorspace
            )));
        }
        let support = &request.support;
        let extended = support.yuv444 && !request.scaling && request.quality >= self.yuv444_threshold;

        let mut layouts = Vec::with_capacity(2);
        if extended {
            layouts.push(PixelLayout::Yuv444p);
        }
        if support.nv12 {
            layouts.push(PixelLayout::Nv12);
        }
        if layouts.is_empty() {
            return Err(CodecError::unsupported_format(format!(
                "{} supports neither NV12 nor YUV444P here",
                request.codec
            )));
        }

        for layout in layouts {
            let Some(profile) = Profile::preferences(request.codec, layout)
                .iter()
                .copied()
                .find(|p| support.profiles.contains(p))
            else {
                debug!("no {} profile for {}", request.codec, layout);
                continue;
            };
            let wants_lossless = layout == PixelLayout::Yuv444p
                && support.lossless
                && request.quality >= self.lossless_threshold;
            let (preset, lossless) = match self.pick_preset(request, wants_lossless) {
                Ok(preset) => (preset, wants_lossless),
                Err(CodecError::NoMatchingPreset { .. }) if wants_lossless => {
                    debug!("no lossless {} preset, using the best lossy one", request.codec);
                    (self.pick_preset(request, false)?, false)
                }
                Err(err) => return Err(err),
            };
            let negotiated = Negotiated {
                layout,
                lossless,
                preset,
                profile,
            };
            debug!(
                "negotiated {} {} profile {} preset {}{} for speed {} quality {}",
                request.codec,
                layout,
                profile,
                preset,
                if lossless { " (lossless)" } else { "" },
                request.speed,
                request.quality
            );
            return Ok(negotiated);
        }
        Err(CodecError::unsupported_format(format!(
            "no {} profile available for any layout",
            request.codec
        )))
    }

    fn pick_preset(&self, request: &NegotiationRequest, lossless: bool) -> Result<Preset> {
        let available = |p: &Preset| request.support.presets.contains(p);
        let ranked = self.rank(request.speed, request.quality, lossless);
        let (best, best_distance) = ranked
            .iter()
            .copied()
            .find(|(p, _)| available(p))
            .ok_or(CodecError::NoMatchingPreset { codec: request.codec })?;
        if self.preset_override == Some(best) {
            return Ok(best);
        }
        if let Some(current) = request.current {
            if current != best && current.is_lossless() == lossless && available(&current) {
                let distance = preset_distance(current, request.speed, request.quality);
                if distance <= best_distance + PRESET_HYSTERESIS {
                    return Ok(current);
                }
            }
        }
        Ok(best)
    }
}
