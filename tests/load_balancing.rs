//! Device selection across several emulated accelerators.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use accelcodec::driver::emulated::{EmulatedDevice, EmulatedDriver};
use accelcodec::{AccelConfig, CodecError, DeviceRegistry, EncodeParams, EncodeSession, FailureClass, ImageWrapper, PixelFormat};

const GIB: u64 = 1 << 30;

fn two_devices() -> (EmulatedDriver, Arc<DeviceRegistry>) {
    let driver = EmulatedDriver::new(vec![EmulatedDevice::new("gpu0"), EmulatedDevice::new("gpu1")]);
    let registry = Arc::new(DeviceRegistry::new(Arc::new(driver.clone()), AccelConfig::default()));
    (driver, registry)
}

fn open(registry: &Arc<DeviceRegistry>) -> EncodeSession {
    let mut session = EncodeSession::new(Arc::clone(registry));
    session.init(EncodeParams::new(64, 48)).unwrap();
    session
}

#[test]
fn test_sessions_alternate_between_idle_devices() {
    let (driver, registry) = two_devices();
    let sessions: Vec<_> = (0..4).map(|_| open(&registry)).collect();
    let devices: Vec<_> = sessions.iter().map(|s| s.device().unwrap()).collect();
    assert_eq!(devices, vec![0, 1, 0, 1]);
    assert_eq!(driver.contexts_on(0), 2);
    assert_eq!(registry.open_contexts(1).unwrap(), 2);

    drop(sessions);
    assert_eq!(driver.contexts_on(0) + driver.contexts_on(1), 0);
    assert_eq!(registry.open_contexts(0).unwrap(), 0);
}

#[test]
fn test_recent_failure_steers_away() {
    let (_driver, registry) = two_devices();
    registry.record_failure(0);
    assert_eq!(registry.recent_failures(0).unwrap(), 1);
    assert!(registry.load_score(0).unwrap() > registry.load_score(1).unwrap());

    let first = open(&registry);
    let second = open(&registry);
    assert_eq!(first.device(), Some(1));
    assert_eq!(second.device(), Some(1));

    // A success ends the streak but the failure keeps counting.
    registry.record_success(0);
    assert_eq!(registry.failure_streak(0).unwrap(), 0);
    assert_eq!(registry.recent_failures(0).unwrap(), 1);
    assert_eq!(open(&registry).device(), Some(1));
}

#[test]
fn test_cooldown_survives_other_sessions() {
    let (_driver, registry) = two_devices();
    let mut healthy = open(&registry);
    assert_eq!(healthy.device(), Some(0));
    let others: Vec<_> = (0..3).map(|_| open(&registry)).collect();
    assert_eq!(others.iter().filter(|s| s.device() == Some(1)).count(), 2);

    registry.record_failure(0);
    assert_eq!(registry.select_device(None, (3, 0)).unwrap(), 1);

    // Frames from a healthy session on the failed device.
    let stride = 64 * 4;
    for i in 0..3u8 {
        let image = ImageWrapper::packed(64, 48, PixelFormat::Bgrx, stride, vec![i; stride * 48]).unwrap();
        healthy.process(&image).unwrap();
    }
    assert!(registry.cooling_down(0).unwrap());
    assert_eq!(registry.recent_failures(0).unwrap(), 1);
    assert_eq!(registry.select_device(None, (3, 0)).unwrap(), 1);
}

#[test]
fn test_cooldown_and_window_expire() {
    let driver = EmulatedDriver::new(vec![EmulatedDevice::new("gpu0"), EmulatedDevice::new("gpu1")]);
    let config = AccelConfig {
        failure_window_ms: 300,
        cooldown_ms: 30,
        ..AccelConfig::default()
    };
    let registry = Arc::new(DeviceRegistry::new(Arc::new(driver), config));
    let idle = registry.load_score(0).unwrap();
    registry.record_failure(0);
    assert!(registry.cooling_down(0).unwrap());
    assert_eq!(registry.select_device(None, (3, 0)).unwrap(), 1);

    // Past the cool-down the failure still counts inside the window.
    thread::sleep(Duration::from_millis(60));
    assert!(!registry.cooling_down(0).unwrap());
    assert_eq!(registry.recent_failures(0).unwrap(), 1);
    assert!(registry.load_score(0).unwrap() > registry.load_score(1).unwrap());
    assert_eq!(registry.select_device(None, (3, 0)).unwrap(), 1);

    // Past the window the device is as good as new.
    thread::sleep(Duration::from_millis(300));
    assert_eq!(registry.recent_failures(0).unwrap(), 0);
    assert_eq!(registry.load_score(0).unwrap(), idle);
    assert_eq!(registry.select_device(None, (3, 0)).unwrap(), 0);
}

#[test]
fn test_low_memory_device_is_avoided() {
    let (driver, registry) = two_devices();
    driver.set_free_memory(0, GIB / 2);
    for _ in 0..3 {
        assert_eq!(open(&registry).device(), Some(1));
    }
}

#[test]
fn test_preferred_device_reports_exhaustion() {
    let driver = EmulatedDriver::new(vec![
        EmulatedDevice::new("small").max_contexts(1),
        EmulatedDevice::new("big"),
    ]);
    let registry = Arc::new(DeviceRegistry::new(Arc::new(driver.clone()), AccelConfig::default()));

    let mut first = EncodeSession::new(Arc::clone(&registry));
    first.init(EncodeParams::new(64, 48).device(0)).unwrap();
    assert_eq!(first.device(), Some(0));

    let mut second = EncodeSession::new(Arc::clone(&registry));
    let err = second.init(EncodeParams::new(64, 48).device(0)).unwrap_err();
    assert!(matches!(err, CodecError::ContextExhausted { device: 0 }), "{err}");
    assert_eq!(err.class(), FailureClass::Transient);
    assert_eq!(registry.open_contexts(0).unwrap(), 1);
    assert_eq!(driver.contexts_on(0), 1);

    // Without a preference the session lands on the other device.
    second.init(EncodeParams::new(64, 48)).unwrap();
    assert_eq!(second.device(), Some(1));
}

#[test]
fn test_configured_device_wins() {
    let driver = EmulatedDriver::new(vec![EmulatedDevice::new("gpu0"), EmulatedDevice::new("gpu1")]);
    let config = AccelConfig {
        device_id: Some(1),
        ..AccelConfig::default()
    };
    let registry = Arc::new(DeviceRegistry::new(Arc::new(driver), config));
    assert_eq!(open(&registry).device(), Some(1));
    assert_eq!(open(&registry).device(), Some(1));
}

#[test]
fn test_concurrent_sessions() {
    let (driver, registry) = two_devices();
    let handles: Vec<_> = (0..4u8)
        .map(|n| {
            let registry = Arc::clone(&registry);
            thread::spawn(move || {
                let mut session = EncodeSession::new(registry);
                session.init(EncodeParams::new(64, 48)).unwrap();
                let stride = 64 * 4;
                for i in 0..5u8 {
                    let data = vec![n.wrapping_mul(31).wrapping_add(i); stride * 48];
                    let image = ImageWrapper::packed(64, 48, PixelFormat::Bgrx, stride, data).unwrap();
                    let frame = session.process(&image).unwrap();
                    assert_eq!(frame.metadata.keyframe, i == 0);
                }
                session.info().frames
            })
        })
        .collect();

    let frames: u64 = handles.into_iter().map(|h| h.join().unwrap()).sum();
    assert_eq!(frames, 20);
    let stats = driver.stats();
    assert_eq!(stats.contexts, 0);
    assert_eq!(stats.encoded_frames, 20);
    assert_eq!(registry.open_contexts(0).unwrap() + registry.open_contexts(1).unwrap(), 0);
}
