//! One-time module probe.
//!
//! [`init_module`] checks that the installed driver speaks a recent enough
//! API, enumerates devices and runs short throwaway encode sessions to find
//! out whether the extended 4:4:4 layout and lossless mode really work. The
//! outcome is stored as feature flags inside the registry and read by every
//! later negotiation. A failed version check is fatal: the caller is expected
//! to fall back to software codecs.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::{CodecError, Result};
use crate::failure::{translate, FailureClass, Operation};
use crate::image::ImageWrapper;
use crate::registry::{DeviceRegistry, FeatureFlags};
use crate::session::EncodeSession;
use crate::types::{Codec, EncodeParams, PixelFormat, PixelLayout};

const PROBE_SIZE: u32 = 64;

/// What the probe found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeReport {
    pub api_version: (u32, u32),
    pub devices: usize,
    /// Codec the throwaway sessions used.
    pub codec: Option<Codec>,
    pub flags: FeatureFlags,
}

/// Probe once per registry. Later calls return the stored flags.
pub fn init_module(registry: &Arc<DeviceRegistry>) -> Result<ProbeReport> {
    let api_version = check_version(registry)?;
    let flags = registry.feature_flags();
    if flags.probed {
        return Ok(ProbeReport {
            api_version,
            devices: registry.enumerate()?.len(),
            codec: None,
            flags,
        });
    }
    run(registry, api_version)
}

/// Probe again, replacing the stored flags.
pub fn reprobe(registry: &Arc<DeviceRegistry>) -> Result<ProbeReport> {
    let api_version = check_version(registry)?;
    run(registry, api_version)
}

fn check_version(registry: &DeviceRegistry) -> Result<(u32, u32)> {
    let driver = registry.driver();
    let version = driver
        .api_version()
        .map_err(|s| translate(s, Operation::Enumerate))?;
    let required = driver.required_api_version();
    if version < required {
        let err = CodecError::LicenseOrVersion(format!(
            "{} API {}.{} is older than the required {}.{}",
            driver.name(),
            version.0,
            version.1,
            required.0,
            required.1
        ));
        warn!("{}", err);
        return Err(err);
    }
    Ok(version)
}

fn run(registry: &Arc<DeviceRegistry>, api_version: (u32, u32)) -> Result<ProbeReport> {
    let devices = registry.enumerate()?.len();
    if devices == 0 {
        return Err(CodecError::NoDevice("no usable device found".into()));
    }
    // Probe against what the devices declare, not against earlier results.
    registry.set_feature_flags(FeatureFlags::default());

    let mut report = ProbeReport {
        api_version,
        devices,
        codec: None,
        flags: FeatureFlags {
            probed: true,
            yuv444: false,
            lossless: false,
        },
    };
    let config = registry.config();
    let extended_quality = config
        .yuv444_threshold
        .min(config.lossless_threshold.saturating_sub(1));

    for codec in Codec::ALL {
        match try_encode(registry, codec, 100) {
            Ok((layout, lossless)) => {
                report.codec = Some(codec);
                report.flags.lossless = lossless;
                report.flags.yuv444 = layout == PixelLayout::Yuv444p;
            }
            Err(err) if err.class() == FailureClass::Fatal => return Err(err),
            Err(err) => {
                debug!("{} probe failed: {}", codec, err);
                continue;
            }
        }
        if !report.flags.yuv444 {
            match try_encode(registry, codec, extended_quality) {
                Ok((layout, _)) => report.flags.yuv444 = layout == PixelLayout::Yuv444p,
                Err(err) if err.class() == FailureClass::Fatal => return Err(err),
                Err(err) => debug!("{} 4:4:4 probe failed: {}", codec, err),
            }
        }
        break;
    }

    if report.codec.is_none() {
        warn!("no codec could encode a probe frame, extended features disabled");
    }
    registry.set_feature_flags(report.flags);
    info!(
        "module probe: API {}.{}, {} device(s), YUV444 {}, lossless {}",
        api_version.0,
        api_version.1,
        devices,
        if report.flags.yuv444 { "yes" } else { "no" },
        if report.flags.lossless { "yes" } else { "no" }
    );
    Ok(report)
}

/// Encode one frame at `quality` and report what was negotiated.
fn try_encode(registry: &Arc<DeviceRegistry>, codec: Codec, quality: u8) -> Result<(PixelLayout, bool)> {
    let mut session = EncodeSession::new(Arc::clone(registry));
    session.init(
        EncodeParams::new(PROBE_SIZE, PROBE_SIZE)
            .codec(codec)
            .colorspace(PixelFormat::Bgrx)
            .quality(quality),
    )?;
    let stride = PROBE_SIZE as usize * 4;
    let image = ImageWrapper::packed(
        PROBE_SIZE,
        PROBE_SIZE,
        PixelFormat::Bgrx,
        stride,
        vec![0x80; stride * PROBE_SIZE as usize],
    )?;
    let frame = session.process(&image)?;
    let negotiated = session
        .negotiated()
        .ok_or_else(|| CodecError::protocol("probe", "session lost its configuration"))?;
    session.close();
    if frame.data.is_empty() {
        return Err(CodecError::protocol("probe", "encoder produced no data"));
    }
    Ok((negotiated.layout, negotiated.lossless))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AccelConfig;
    use crate::driver::emulated::{EmulatedDevice, EmulatedDriver};

    fn registry(driver: EmulatedDriver) -> Arc<DeviceRegistry> {
        Arc::new(DeviceRegistry::new(Arc::new(driver), AccelConfig::default()))
    }

    #[test]
    fn test_probe_full_support() {
        let driver = EmulatedDriver::new(vec![EmulatedDevice::new("a")]);
        let reg = registry(driver.clone());
        let report = init_module(&reg).unwrap();
        assert_eq!(report.codec, Some(Codec::H264));
        assert!(report.flags.probed && report.flags.yuv444 && report.flags.lossless);
        assert_eq!(reg.feature_flags(), report.flags);
        assert_eq!(driver.stats().contexts, 0);
        assert_eq!(driver.stats().encoders, 0);
    }

    #[test]
    fn test_probe_downgrades() {
        let reg = registry(EmulatedDriver::new(vec![EmulatedDevice::new("a").without_lossless()]));
        let flags = init_module(&reg).unwrap().flags;
        assert!(flags.yuv444);
        assert!(!flags.lossless);

        let reg = registry(EmulatedDriver::new(vec![EmulatedDevice::new("a").without_yuv444()]));
        let flags = init_module(&reg).unwrap().flags;
        assert!(flags.probed);
        assert!(!flags.yuv444 && !flags.lossless);
    }

    #[test]
    fn test_old_driver_is_fatal() {
        let reg = registry(EmulatedDriver::new(vec![EmulatedDevice::new("a")]).with_api_version(11, 4));
        let err = init_module(&reg).unwrap_err();
        assert_eq!(err.class(), FailureClass::Fatal);
        assert!(!reg.feature_flags().probed);
    }

    #[test]
    fn test_probe_runs_once() {
        let driver = EmulatedDriver::new(vec![EmulatedDevice::new("a")]);
        let reg = registry(driver.clone());
        init_module(&reg).unwrap();
        let encoded = driver.stats().encoded_frames;
        let again = init_module(&reg).unwrap();
        assert_eq!(driver.stats().encoded_frames, encoded);
        assert!(again.flags.lossless);
        reprobe(&reg).unwrap();
        assert!(driver.stats().encoded_frames > encoded);
    }

    #[test]
    fn test_no_devices() {
        let reg = registry(EmulatedDriver::new(Vec::new()));
        assert!(matches!(init_module(&reg), Err(CodecError::NoDevice(_))));
    }
}
