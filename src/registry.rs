//! Device enumeration, capability cache and load balancing.
//!
//! Encoder contexts are capped per device, so new sessions are steered away
//! from devices that are saturated or that failed recently. Every counter is
//! an atomic: the numbers are read opportunistically for scoring and no lock
//! is held while a device is selected.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, RwLock};
use std::time::Instant;

use lazy_static::lazy_static;
use tracing::{debug, info, warn};

use crate::config::AccelConfig;
use crate::driver::{CodecCaps, DeviceProperties, Driver};
use crate::error::{CodecError, Result};
use crate::failure::{translate, Operation};
use crate::types::Codec;

/// Failure timestamps remembered per device.
const FAILURE_RING: usize = 16;

/// Devices below this compute capability are never used.
const MIN_COMPUTE: (u32, u32) = (2, 0);

const CONTEXT_WEIGHT: u64 = 100;
const FAILURE_WEIGHT: u64 = 50;
const COOLDOWN_PENALTY: u64 = 1000;

lazy_static! {
    static ref GLOBAL: RwLock<Option<Arc<DeviceRegistry>>> = RwLock::new(None);
}

/// Install `registry` as the process-wide instance.
pub fn install_global(registry: Arc<DeviceRegistry>) {
    let mut slot = GLOBAL.write().unwrap_or_else(|e| e.into_inner());
    *slot = Some(registry);
}

/// The process-wide registry, if one was installed.
pub fn global() -> Option<Arc<DeviceRegistry>> {
    GLOBAL.read().unwrap_or_else(|e| e.into_inner()).clone()
}

/// Process-wide capability flags set by the module probe.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeatureFlags {
    /// The probe ran to completion.
    pub probed: bool,
    pub yuv444: bool,
    pub lossless: bool,
}

#[derive(Debug, Default)]
struct AtomicFlags {
    probed: AtomicBool,
    yuv444: AtomicBool,
    lossless: AtomicBool,
}

#[derive(Debug)]
struct DeviceLoad {
    open_contexts: AtomicU32,
    /// Milliseconds since the registry epoch, plus one; zero is empty.
    failures: [AtomicU64; FAILURE_RING],
    cursor: AtomicUsize,
    last_failure: AtomicU64,
    /// Failures since the last success on the device.
    streak: AtomicU32,
}

impl Default for DeviceLoad {
    fn default() -> Self {
        Self {
            open_contexts: AtomicU32::new(0),
            failures: std::array::from_fn(|_| AtomicU64::new(0)),
            cursor: AtomicUsize::new(0),
            last_failure: AtomicU64::new(0),
            streak: AtomicU32::new(0),
        }
    }
}

/// An enumerated, eligible device.
#[derive(Debug)]
pub struct Device {
    pub properties: DeviceProperties,
    load: DeviceLoad,
}

impl Device {
    #[must_use]
    pub fn ordinal(&self) -> u32 {
        self.properties.ordinal
    }

    #[must_use]
    pub fn open_contexts(&self) -> u32 {
        self.load.open_contexts.load(Ordering::Relaxed)
    }
}

/// Enumerated devices plus their load counters and cached capabilities.
pub struct DeviceRegistry {
    driver: Arc<dyn Driver>,
    config: AccelConfig,
    epoch: Instant,
    devices: OnceLock<Vec<Device>>,
    caps: RwLock<HashMap<(u32, Codec), Option<CodecCaps>>>,
    flags: AtomicFlags,
}

impl std::fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceRegistry")
            .field("driver", &self.driver.name())
            .field("devices", &self.devices.get().map(Vec::len))
            .finish_non_exhaustive()
    }
}

impl DeviceRegistry {
    pub fn new(driver: Arc<dyn Driver>, config: AccelConfig) -> Self {
        Self {
            driver,
            config,
            epoch: Instant::now(),
            devices: OnceLock::new(),
            caps: RwLock::new(HashMap::new()),
            flags: AtomicFlags::default(),
        }
    }

    #[must_use]
    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }

    #[must_use]
    pub fn config(&self) -> &AccelConfig {
        &self.config
    }

    /// Enumerate devices once; later calls return the cached list.
    pub fn enumerate(&self) -> Result<&[Device]> {
        if let Some(devices) = self.devices.get() {
            return Ok(devices);
        }
        let devices = self.scan()?;
        // A concurrent caller may have won the race; both lists are equal.
        let _ = self.devices.set(devices);
        Ok(self.devices.get().map(Vec::as_slice).unwrap_or_default())
    }

    fn scan(&self) -> Result<Vec<Device>> {
        let count = self
            .driver
            .device_count()
            .map_err(|s| translate(s, Operation::Enumerate))?;
        let mut devices = Vec::new();
        for ordinal in 0..count {
            let properties = self
                .driver
                .device_properties(ordinal)
                .map_err(|s| translate(s, Operation::Enumerate))?;
            let label = properties.to_string();
            if !self.config.ignore_blacklist {
                if let Some(entry) = self.config.blacklist.iter().find(|b| label.contains(b.as_str())) {
                    warn!("device {} ({}) is blacklisted by {:?}, skipping", ordinal, label, entry);
                    continue;
                }
            }
            if !properties.can_map_host_memory {
                info!("device {} ({}) cannot map host memory, skipping", ordinal, label);
                continue;
            }
            if properties.compute_capability < MIN_COMPUTE {
                info!(
                    "device {} ({}) has compute capability {}.{}, skipping",
                    ordinal, label, properties.compute_capability.0, properties.compute_capability.1
                );
                continue;
            }
            debug!("device {}: {} with {} MB", ordinal, label, properties.total_memory >> 20);
            devices.push(Device {
                properties,
                load: DeviceLoad::default(),
            });
        }
        info!("{} usable device(s) found", devices.len());
        Ok(devices)
    }

    /// The enumerated device with this ordinal.
    pub fn device(&self, ordinal: u32) -> Result<&Device> {
        self.enumerate()?
            .iter()
            .find(|d| d.ordinal() == ordinal)
            .ok_or_else(|| CodecError::NoDevice(format!("device {ordinal} is not available")))
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64 + 1
    }

    fn is_cooling(&self, device: &Device, now: u64) -> bool {
        let last = device.load.last_failure.load(Ordering::Relaxed);
        last != 0 && now.saturating_sub(last) < self.config.cooldown_ms
    }

    /// Lower is better.
    fn score(&self, device: &Device, now: u64) -> u64 {
        let cap = u64::from(self.config.max_contexts_per_device.max(1));
        let contexts = u64::from(device.open_contexts()) * CONTEXT_WEIGHT / cap;
        let window = self.config.failure_window_ms;
        let recent = device
            .load
            .failures
            .iter()
            .map(|f| f.load(Ordering::Relaxed))
            .filter(|&t| t != 0 && now.saturating_sub(t) < window)
            .count() as u64;
        let cooling = self.is_cooling(device, now);
        let used_percent = self
            .driver
            .memory_info(device.ordinal())
            .map(|m| 100 - u64::from(m.free_percent().min(100)))
            .unwrap_or(0);
        contexts + recent * FAILURE_WEIGHT + if cooling { COOLDOWN_PENALTY } else { 0 } + used_percent / 2
    }

    /// Pick a device for a new session.
    ///
    /// The preferred ordinal (or the configured one) wins when it meets
    /// `min_capability`, then the configured device name, then the device
    /// with the lowest load score.
    pub fn select_device(&self, preferred: Option<u32>, min_capability: (u32, u32)) -> Result<u32> {
        let eligible: Vec<&Device> = self
            .enumerate()?
            .iter()
            .filter(|d| d.properties.compute_capability >= min_capability)
            .collect();
        if eligible.is_empty() {
            return Err(CodecError::NoDevice(format!(
                "no device with compute capability {}.{} or better",
                min_capability.0, min_capability.1
            )));
        }

        if let Some(id) = preferred.or(self.config.device_id) {
            if eligible.iter().any(|d| d.ordinal() == id) {
                return Ok(id);
            }
            debug!("preferred device {} is not eligible", id);
        }
        if let Some(name) = &self.config.device_name {
            if let Some(d) = eligible.iter().find(|d| d.properties.name.contains(name.as_str())) {
                return Ok(d.ordinal());
            }
        }

        let now = self.now_ms();
        let best = eligible
            .iter()
            .map(|d| (self.score(d, now), d.ordinal()))
            .min()
            .map(|(score, ordinal)| {
                debug!("selected device {} with load score {}", ordinal, score);
                ordinal
            });
        best.ok_or_else(|| CodecError::NoDevice("no eligible device".into()))
    }

    /// Load score of a device, for diagnostics.
    pub fn load_score(&self, ordinal: u32) -> Result<u64> {
        let device = self.device(ordinal)?;
        Ok(self.score(device, self.now_ms()))
    }

    /// Note a successful operation on a device.
    ///
    /// Ends the device's failure streak. Recorded failures keep counting
    /// until they leave the failure window, and the cool-down runs its course.
    pub fn record_success(&self, ordinal: u32) {
        if let Ok(device) = self.device(ordinal) {
            let streak = device.load.streak.swap(0, Ordering::Relaxed);
            if streak > 0 {
                debug!("device {} recovered after {} failure(s)", ordinal, streak);
            }
        }
    }

    /// Remember a failure on a device.
    pub fn record_failure(&self, ordinal: u32) {
        if let Ok(device) = self.device(ordinal) {
            let now = self.now_ms();
            let slot = device.load.cursor.fetch_add(1, Ordering::Relaxed) % FAILURE_RING;
            device.load.failures[slot].store(now, Ordering::Relaxed);
            device.load.last_failure.store(now, Ordering::Relaxed);
            let streak = device.load.streak.fetch_add(1, Ordering::Relaxed) + 1;
            debug!("recorded failure on device {} ({} in a row)", ordinal, streak);
        }
    }

    /// Failures on a device since its last success.
    pub fn failure_streak(&self, ordinal: u32) -> Result<u32> {
        Ok(self.device(ordinal)?.load.streak.load(Ordering::Relaxed))
    }

    /// Whether a device is inside the cool-down after its last failure.
    pub fn cooling_down(&self, ordinal: u32) -> Result<bool> {
        let device = self.device(ordinal)?;
        Ok(self.is_cooling(device, self.now_ms()))
    }

    /// Failures recorded on a device inside the failure window.
    pub fn recent_failures(&self, ordinal: u32) -> Result<usize> {
        let device = self.device(ordinal)?;
        let now = self.now_ms();
        Ok(device
            .load
            .failures
            .iter()
            .map(|f| f.load(Ordering::Relaxed))
            .filter(|&t| t != 0 && now.saturating_sub(t) < self.config.failure_window_ms)
            .count())
    }

    pub fn open_contexts(&self, ordinal: u32) -> Result<u32> {
        Ok(self.device(ordinal)?.open_contexts())
    }

    pub(crate) fn context_opened(&self, ordinal: u32) {
        if let Ok(device) = self.device(ordinal) {
            device.load.open_contexts.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn context_closed(&self, ordinal: u32) {
        if let Ok(device) = self.device(ordinal) {
            let _ = device.load.open_contexts.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                n.checked_sub(1)
            });
        }
    }

    /// Capabilities of a device for a codec, probed on first use.
    pub fn codec_caps(&self, ordinal: u32, codec: Codec) -> Result<Option<CodecCaps>> {
        if let Some(caps) = self
            .caps
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&(ordinal, codec))
        {
            return Ok(caps.clone());
        }
        self.device(ordinal)?;
        let caps = self
            .driver
            .codec_caps(ordinal, codec)
            .map_err(|s| translate(s, Operation::QueryCaps))?;
        debug!(
            "device {} {}: {}",
            ordinal,
            codec,
            caps.as_ref()
                .map(|c| format!("{}x{} max, layouts {:?}, lossless {}", c.max_width, c.max_height, c.layouts, c.lossless))
                .unwrap_or_else(|| "unsupported".into())
        );
        self.caps
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert((ordinal, codec), caps.clone());
        Ok(caps)
    }

    #[must_use]
    pub fn feature_flags(&self) -> FeatureFlags {
        FeatureFlags {
            probed: self.flags.probed.load(Ordering::Acquire),
            yuv444: self.flags.yuv444.load(Ordering::Relaxed),
            lossless: self.flags.lossless.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn set_feature_flags(&self, flags: FeatureFlags) {
        self.flags.yuv444.store(flags.yuv444, Ordering::Relaxed);
        self.flags.lossless.store(flags.lossless, Ordering::Relaxed);
        self.flags.probed.store(flags.probed, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::emulated::{EmulatedDevice, EmulatedDriver};

    fn registry(devices: Vec<EmulatedDevice>, config: AccelConfig) -> DeviceRegistry {
        DeviceRegistry::new(Arc::new(EmulatedDriver::new(devices)), config)
    }

    #[test]
    fn test_enumerate_filters() {
        let config = AccelConfig {
            blacklist: vec!["0000:02".into()],
            ..Default::default()
        };
        let reg = registry(
            vec![
                EmulatedDevice::new("good"),
                EmulatedDevice::new("listed").pci_bus_id("0000:02:00.0"),
                EmulatedDevice::new("old").compute_capability(1, 3),
                EmulatedDevice::new("nomap").can_map_host_memory(false),
            ],
            config,
        );
        let ordinals: Vec<u32> = reg.enumerate().unwrap().iter().map(Device::ordinal).collect();
        assert_eq!(ordinals, vec![0]);
        // Cached
        assert_eq!(reg.enumerate().unwrap().len(), 1);
    }

    #[test]
    fn test_ignore_blacklist() {
        let config = AccelConfig {
            blacklist: vec!["listed".into()],
            ignore_blacklist: true,
            ..Default::default()
        };
        let reg = registry(vec![EmulatedDevice::new("listed")], config);
        assert_eq!(reg.enumerate().unwrap().len(), 1);
    }

    #[test]
    fn test_preferred_device() {
        let reg = registry(
            vec![EmulatedDevice::new("a"), EmulatedDevice::new("b").compute_capability(5, 0)],
            AccelConfig::default(),
        );
        assert_eq!(reg.select_device(Some(1), (3, 0)).unwrap(), 1);
        // Preferred device below the minimum falls back to another one
        assert_eq!(reg.select_device(Some(1), (6, 0)).unwrap(), 0);
        assert!(matches!(reg.select_device(None, (9, 0)), Err(CodecError::NoDevice(_))));
    }

    #[test]
    fn test_preferred_name() {
        let config = AccelConfig {
            device_name: Some("Quadro".into()),
            ..Default::default()
        };
        let reg = registry(vec![EmulatedDevice::new("GeForce"), EmulatedDevice::new("Quadro RTX")], config);
        assert_eq!(reg.select_device(None, (3, 0)).unwrap(), 1);
    }

    #[test]
    fn test_failure_history() {
        let reg = registry(vec![EmulatedDevice::new("a")], AccelConfig::default());
        for _ in 0..FAILURE_RING + 4 {
            reg.record_failure(0);
        }
        assert_eq!(reg.recent_failures(0).unwrap(), FAILURE_RING);
        assert_eq!(reg.failure_streak(0).unwrap(), FAILURE_RING as u32 + 4);
        reg.record_success(0);
        assert_eq!(reg.failure_streak(0).unwrap(), 0);
        assert_eq!(reg.recent_failures(0).unwrap(), FAILURE_RING);
        assert!(reg.cooling_down(0).unwrap());
    }

    #[test]
    fn test_failures_age_out() {
        let config = AccelConfig {
            failure_window_ms: 300,
            cooldown_ms: 20,
            ..Default::default()
        };
        let reg = registry(vec![EmulatedDevice::new("a")], config);
        let idle = reg.load_score(0).unwrap();
        reg.record_failure(0);
        assert!(reg.cooling_down(0).unwrap());
        assert!(reg.load_score(0).unwrap() >= idle + COOLDOWN_PENALTY + FAILURE_WEIGHT);

        std::thread::sleep(std::time::Duration::from_millis(40));
        assert!(!reg.cooling_down(0).unwrap());
        assert_eq!(reg.recent_failures(0).unwrap(), 1);

        std::thread::sleep(std::time::Duration::from_millis(300));
        assert_eq!(reg.recent_failures(0).unwrap(), 0);
        assert_eq!(reg.load_score(0).unwrap(), idle);
    }

    #[test]
    fn test_context_counter_never_underflows() {
        let reg = registry(vec![EmulatedDevice::new("a")], AccelConfig::default());
        reg.context_closed(0);
        assert_eq!(reg.open_contexts(0).unwrap(), 0);
        reg.context_opened(0);
        assert_eq!(reg.open_contexts(0).unwrap(), 1);
    }

    #[test]
    fn test_caps_cached() {
        let reg = registry(vec![EmulatedDevice::new("a").without_codec(Codec::Av1)], AccelConfig::default());
        assert!(reg.codec_caps(0, Codec::H264).unwrap().is_some());
        assert!(reg.codec_caps(0, Codec::Av1).unwrap().is_none());
        assert!(reg.codec_caps(5, Codec::H264).is_err());
    }
}
