//! End-to-end encode/decode scenarios on the emulated accelerator.

use std::sync::Arc;

use accelcodec::driver::emulated::{EmulatedDevice, EmulatedDriver, EmulatedStats, FaultPoint};
use accelcodec::driver::status::{
    CUDA_ERROR_NOT_READY, CUDA_ERROR_NO_DEVICE, CUDA_ERROR_OUT_OF_MEMORY, NV_ENC_ERR_GENERIC, NV_ENC_ERR_LOCK_BUSY,
    NV_ENC_ERR_OUT_OF_MEMORY, NV_ENC_ERR_RESOURCE_REGISTER_FAILED,
};
use accelcodec::driver::NativeStatus;
use accelcodec::{
    AccelConfig, Codec, CodecError, DecodeParams, DecodeSession, DeviceRegistry, EncodeParams, EncodeSession,
    FailureClass, ImageWrapper, PixelFormat, PixelLayout, Preset, SessionState,
};

fn setup() -> (EmulatedDriver, Arc<DeviceRegistry>) {
    let driver = EmulatedDriver::new(vec![EmulatedDevice::new("gpu0")]);
    let registry = Arc::new(DeviceRegistry::new(Arc::new(driver.clone()), AccelConfig::default()));
    (driver, registry)
}

/// A BGRX gradient that changes with `seed`.
fn gradient(width: u32, height: u32, seed: u8) -> ImageWrapper {
    let stride = width as usize * 4;
    let mut data = vec![0u8; stride * height as usize];
    for y in 0..height as usize {
        for x in 0..width as usize {
            let o = y * stride + x * 4;
            data[o] = (x as u8).wrapping_mul(3).wrapping_add(seed);
            data[o + 1] = (y as u8).wrapping_mul(5);
            data[o + 2] = (x as u8 ^ y as u8).wrapping_add(seed.wrapping_mul(7));
            data[o + 3] = 255;
        }
    }
    ImageWrapper::packed(width, height, PixelFormat::Bgrx, stride, data).unwrap()
}

fn assert_no_live_objects(stats: &EmulatedStats) {
    assert_eq!(stats.contexts, 0, "{stats:?}");
    assert_eq!(stats.host_allocations, 0, "{stats:?}");
    assert_eq!(stats.device_allocations, 0, "{stats:?}");
    assert_eq!(stats.encoders, 0, "{stats:?}");
    assert_eq!(stats.bitstreams, 0, "{stats:?}");
    assert_eq!(stats.registrations, 0, "{stats:?}");
    assert_eq!(stats.mapped_inputs, 0, "{stats:?}");
    assert_eq!(stats.decoders, 0, "{stats:?}");
    assert_eq!(stats.leaked_registrations, 0, "{stats:?}");
    assert_eq!(stats.leaked_on_context_destroy, 0, "{stats:?}");
}

#[test]
fn test_lossless_round_trip_is_exact() {
    let (_driver, registry) = setup();
    let mut encoder = EncodeSession::new(Arc::clone(&registry));
    encoder.init(EncodeParams::new(64, 48).quality(100)).unwrap();
    let negotiated = encoder.negotiated().unwrap();
    assert!(negotiated.lossless);
    assert_eq!(negotiated.layout, PixelLayout::Yuv444p);

    let mut decoder = DecodeSession::new(Arc::clone(&registry));
    decoder
        .init(DecodeParams::new(Codec::H264, 64, 48).layout(PixelLayout::Yuv444p))
        .unwrap();

    for seed in 0..3u8 {
        let source = gradient(64, 48, seed * 40);
        let frame = encoder.process(&source).unwrap();
        assert!(frame.metadata.lossless);
        assert_eq!(frame.metadata.quality, 100);
        assert_eq!(frame.metadata.client_options().get("lossless"), Some(&serde_json::json!(true)));

        let image = decoder.process(&frame.data).unwrap().expect("a decoded picture");
        assert_eq!((image.width(), image.height()), (64, 48));
        let bgrx = image.to_bgrx().unwrap();
        assert_eq!(bgrx.plane(0).unwrap().0, source.plane(0).unwrap().0, "frame {seed}");
    }
    assert_eq!(decoder.info().frames, 3);
    assert_eq!(decoder.info().failures, 0);
}

#[test]
fn test_close_is_idempotent() {
    let (driver, registry) = setup();
    let mut encoder = EncodeSession::new(Arc::clone(&registry));
    encoder.init(EncodeParams::new(64, 48)).unwrap();
    encoder.process(&gradient(64, 48, 0)).unwrap();

    encoder.close();
    encoder.close();
    assert_eq!(encoder.state(), SessionState::Closed);
    assert!(matches!(encoder.process(&gradient(64, 48, 0)), Err(CodecError::SessionClosed)));
    assert!(matches!(encoder.reconfigure(80, 50), Err(CodecError::SessionClosed)));
    assert!(matches!(encoder.init(EncodeParams::new(64, 48)), Err(CodecError::SessionClosed)));
    assert_eq!(registry.open_contexts(0).unwrap(), 0);
    assert_no_live_objects(&driver.stats());
}

#[test]
fn test_dimensions_are_padded() {
    let (_driver, registry) = setup();
    let mut encoder = EncodeSession::new(registry);
    encoder.init(EncodeParams::new(1920, 1080)).unwrap();

    assert_eq!(encoder.working_dimensions(), Some((1920, 1088)));
    let info = encoder.info();
    assert_eq!(info.encoded_size, (1920, 1080));
    assert_eq!(info.layout, Some(PixelLayout::Nv12));
    assert_eq!(info.preset, Some(Preset::Default));
    assert!(!info.lossless);

    let (host_pitch, input_pitch) = encoder.pitches().unwrap();
    assert!(host_pitch >= 1920 * 4);
    assert!(input_pitch >= 1920);

    let frame = encoder.process(&gradient(1920, 1080, 1)).unwrap();
    assert!(frame.metadata.keyframe);
    assert!(!frame.data.is_empty());
    assert_eq!(frame.metadata.scaled_size, None);
}

#[test]
fn test_reconfigure_to_lossless_keeps_buffers() {
    let (driver, registry) = setup();
    let mut encoder = EncodeSession::new(registry);
    encoder.init(EncodeParams::new(64, 48)).unwrap();
    encoder.process(&gradient(64, 48, 0)).unwrap();
    encoder.process(&gradient(64, 48, 1)).unwrap();

    let pitches = encoder.pitches();
    let allocations = driver.stats().device_allocations;
    encoder.reconfigure(100, 50).unwrap();

    let negotiated = encoder.negotiated().unwrap();
    assert!(negotiated.lossless);
    assert_eq!(negotiated.layout, PixelLayout::Yuv444p);
    assert_eq!(encoder.params().quality, 100);
    assert_eq!(encoder.pitches(), pitches);
    let stats = driver.stats();
    assert_eq!(stats.device_allocations, allocations);
    assert_eq!(stats.encoders, 1);
    assert_eq!(stats.contexts, 1);
    assert_eq!(encoder.info().reinits, 0);

    let frame = encoder.process(&gradient(64, 48, 2)).unwrap();
    assert!(frame.metadata.keyframe);
    assert!(frame.metadata.lossless);
}

#[test]
fn test_bad_input_yields_nothing() {
    let (_driver, registry) = setup();
    let mut encoder = EncodeSession::new(Arc::clone(&registry));
    encoder.init(EncodeParams::new(64, 48)).unwrap();
    let frame = encoder.process(&gradient(64, 48, 0)).unwrap();

    let mut decoder = DecodeSession::new(registry);
    decoder.init(DecodeParams::new(Codec::H264, 64, 48)).unwrap();
    assert!(decoder.process(&[]).unwrap().is_none());
    let truncated = &frame.data[..frame.data.len() / 2];
    assert!(decoder.process(truncated).unwrap().is_none());
    assert!(decoder.process(b"\x00\x00\x00\x01garbage").unwrap().is_none());

    let info = decoder.info();
    assert_eq!(info.frames, 0);
    assert_eq!(info.failures, 2);
    assert_eq!(info.reinits, 0);
    assert_eq!(decoder.state(), SessionState::Ready);

    // A keyframe still decodes after the rejected input.
    assert!(decoder.process(&frame.data).unwrap().is_some());
}

#[test]
fn test_decoded_images_outlive_slot_reuse() {
    let (driver, registry) = setup();
    let mut encoder = EncodeSession::new(Arc::clone(&registry));
    encoder.init(EncodeParams::new(64, 48)).unwrap();
    let frames: Vec<_> = (0..3u8)
        .map(|seed| encoder.process(&gradient(64, 48, seed * 60)).unwrap())
        .collect();

    let mut decoder = DecodeSession::new(Arc::clone(&registry));
    decoder.init(DecodeParams::new(Codec::H264, 64, 48)).unwrap();
    let first = decoder.process(&frames[0].data).unwrap().unwrap();
    let luma = first.plane(0).unwrap();
    let second = decoder.process(&frames[1].data).unwrap().unwrap();
    assert!(!first.is_detached());
    assert_eq!(decoder.info().attached_images, 2);

    // Two output surfaces: the third picture lands in the first one's slot.
    let third = decoder.process(&frames[2].data).unwrap().unwrap();
    assert_eq!(third.slot(), first.slot());
    assert!(first.is_detached());
    assert_eq!(first.plane(0).unwrap(), luma);
    assert_ne!(third.plane(0).unwrap(), luma);

    drop(decoder);
    assert!(second.is_detached() && third.is_detached());
    assert!(second.to_bgrx().is_ok());
    assert_eq!(first.plane(0).unwrap(), luma);
    drop(encoder);
    assert_no_live_objects(&driver.stats());

    first.release();
    assert!(first.is_released());
    assert!(first.plane(0).is_err());
}

#[test]
fn test_driver_fault_reinitialises_once() {
    let (driver, registry) = setup();
    let mut encoder = EncodeSession::new(registry);
    encoder.init(EncodeParams::new(64, 48)).unwrap();
    assert!(encoder.process(&gradient(64, 48, 0)).unwrap().metadata.keyframe);
    assert!(!encoder.process(&gradient(64, 48, 1)).unwrap().metadata.keyframe);

    driver.inject_fault(FaultPoint::Encode, NativeStatus::Nvenc(NV_ENC_ERR_GENERIC), 1);
    let frame = encoder.process(&gradient(64, 48, 2)).unwrap();
    assert!(frame.metadata.keyframe);
    let info = encoder.info();
    assert_eq!(info.reinits, 1);
    assert_eq!(info.state, SessionState::Ready);
    let stats = driver.stats();
    assert_eq!((stats.contexts, stats.encoders, stats.registrations), (1, 1, 1));
    assert_eq!(stats.leaked_registrations, 0);

    // A fault that survives the retry is reported, but only one reinit runs.
    driver.inject_fault(FaultPoint::Encode, NativeStatus::Nvenc(NV_ENC_ERR_GENERIC), 2);
    let err = encoder.process(&gradient(64, 48, 3)).unwrap_err();
    assert_eq!(err.class(), FailureClass::Reinit);
    assert_eq!(encoder.info().reinits, 2);
    assert!(encoder.process(&gradient(64, 48, 4)).is_ok());
}

#[test]
fn test_failed_reinit_closes_session() {
    let (driver, registry) = setup();
    let mut encoder = EncodeSession::new(registry);
    encoder.init(EncodeParams::new(64, 48)).unwrap();
    encoder.process(&gradient(64, 48, 0)).unwrap();

    driver.inject_fault(FaultPoint::Encode, NativeStatus::Nvenc(NV_ENC_ERR_GENERIC), 1);
    driver.inject_fault(FaultPoint::CreateContext, NativeStatus::Cuda(CUDA_ERROR_NO_DEVICE), 1);
    assert!(encoder.process(&gradient(64, 48, 1)).is_err());
    assert_eq!(encoder.state(), SessionState::Closed);
    assert!(matches!(encoder.process(&gradient(64, 48, 2)), Err(CodecError::SessionClosed)));
    assert_no_live_objects(&driver.stats());
}

#[test]
fn test_transient_failure_is_recorded() {
    let (driver, registry) = setup();
    let mut encoder = EncodeSession::new(Arc::clone(&registry));
    encoder.init(EncodeParams::new(64, 48)).unwrap();
    encoder.process(&gradient(64, 48, 0)).unwrap();

    driver.inject_fault(FaultPoint::LockBitstream, NativeStatus::Nvenc(NV_ENC_ERR_LOCK_BUSY), 1);
    let err = encoder.process(&gradient(64, 48, 1)).unwrap_err();
    assert!(matches!(err, CodecError::Busy { .. }));
    assert!(err.is_transient());
    let info = encoder.info();
    assert_eq!(info.transient_failures, 1);
    assert_eq!(info.reinits, 0);
    assert_eq!(info.state, SessionState::Ready);
    assert_eq!(registry.recent_failures(0).unwrap(), 1);
    assert_eq!(driver.stats().mapped_inputs, 0);

    assert_eq!(registry.failure_streak(0).unwrap(), 1);
    assert!(registry.cooling_down(0).unwrap());

    // A success ends the streak; the failure stays on record for its window.
    encoder.process(&gradient(64, 48, 2)).unwrap();
    assert_eq!(registry.failure_streak(0).unwrap(), 0);
    assert_eq!(registry.recent_failures(0).unwrap(), 1);
}

#[test]
fn test_failed_init_leaks_nothing() {
    let faults = [
        (FaultPoint::AllocHost, NativeStatus::Cuda(CUDA_ERROR_OUT_OF_MEMORY)),
        (FaultPoint::AllocDevice, NativeStatus::Cuda(CUDA_ERROR_OUT_OF_MEMORY)),
        (FaultPoint::OpenEncoder, NativeStatus::Nvenc(NV_ENC_ERR_OUT_OF_MEMORY)),
        (FaultPoint::InitializeEncoder, NativeStatus::Nvenc(NV_ENC_ERR_GENERIC)),
        (FaultPoint::Register, NativeStatus::Nvenc(NV_ENC_ERR_RESOURCE_REGISTER_FAILED)),
    ];
    for (point, status) in faults {
        let (driver, registry) = setup();
        let mut encoder = EncodeSession::new(Arc::clone(&registry));
        driver.inject_fault(point, status, 1);
        assert!(encoder.init(EncodeParams::new(64, 48)).is_err(), "{point:?}");
        assert_eq!(encoder.state(), SessionState::Uninitialized, "{point:?}");
        assert_eq!(registry.open_contexts(0).unwrap(), 0, "{point:?}");
        assert_no_live_objects(&driver.stats());

        // The same session can be initialised once the fault is gone.
        encoder.init(EncodeParams::new(64, 48)).unwrap();
        encoder.process(&gradient(64, 48, 0)).unwrap();
        encoder.close();
        assert_no_live_objects(&driver.stats());
    }
}

#[test]
fn test_layout_switch_is_followed_by_decoder() {
    let (_driver, registry) = setup();
    let mut encoder = EncodeSession::new(Arc::clone(&registry));
    encoder.init(EncodeParams::new(64, 48).quality(90).speed(30)).unwrap();
    assert_eq!(encoder.negotiated().unwrap().layout, PixelLayout::Yuv444p);
    let frame = encoder.process(&gradient(64, 48, 0)).unwrap();

    let mut decoder = DecodeSession::new(registry);
    decoder.init(DecodeParams::new(Codec::H264, 64, 48)).unwrap();
    let image = decoder.process(&frame.data).unwrap().unwrap();
    assert_eq!(decoder.layout(), PixelLayout::Yuv444p);
    assert_eq!(image.pixel_format(), PixelFormat::Yuv444p);
}

#[test]
fn test_decoder_transient_failures_are_recorded() {
    let (driver, registry) = setup();
    let mut encoder = EncodeSession::new(Arc::clone(&registry));
    encoder.init(EncodeParams::new(64, 48)).unwrap();
    let frame = encoder.process(&gradient(64, 48, 0)).unwrap();
    drop(encoder);

    let mut decoder = DecodeSession::new(Arc::clone(&registry));
    driver.inject_fault(FaultPoint::OpenDecoder, NativeStatus::Cuda(CUDA_ERROR_OUT_OF_MEMORY), 1);
    let err = decoder.init(DecodeParams::new(Codec::H264, 64, 48)).unwrap_err();
    assert!(err.is_transient(), "{err}");
    assert_eq!(decoder.state(), SessionState::Uninitialized);
    assert_eq!(registry.recent_failures(0).unwrap(), 1);
    assert_no_live_objects(&driver.stats());

    driver.inject_fault(FaultPoint::CreateContext, NativeStatus::Cuda(CUDA_ERROR_OUT_OF_MEMORY), 1);
    let err = decoder.init(DecodeParams::new(Codec::H264, 64, 48)).unwrap_err();
    assert!(matches!(err, CodecError::ContextExhausted { device: 0 }), "{err}");
    assert_eq!(registry.recent_failures(0).unwrap(), 2);
    assert_eq!(registry.failure_streak(0).unwrap(), 2);

    decoder.init(DecodeParams::new(Codec::H264, 64, 48)).unwrap();
    driver.inject_fault(FaultPoint::Decode, NativeStatus::Cuda(CUDA_ERROR_NOT_READY), 1);
    let err = decoder.process(&frame.data).unwrap_err();
    assert!(matches!(err, CodecError::Busy { .. }), "{err}");
    assert_eq!(registry.recent_failures(0).unwrap(), 3);
    assert_eq!(decoder.state(), SessionState::Ready);

    assert!(decoder.process(&frame.data).unwrap().is_some());
    assert_eq!(registry.failure_streak(0).unwrap(), 0);
    assert_eq!(registry.recent_failures(0).unwrap(), 3);
}
