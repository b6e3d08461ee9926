//! Encode sessions.

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tracing::{debug, info, warn};

use super::{damp_quality, EncodedFrame, FrameMetadata, SessionState};
use crate::buffer::{BufferManager, InputPath};
use crate::context::SessionContext;
use crate::csc::CscSession;
use crate::driver::{BitstreamHandle, CodecCaps, EncoderHandle, EncoderSettings, PictureParams};
use crate::error::{CodecError, Result};
use crate::failure::{retry_after_reinit, translate, translate_for_device, FailureClass, Operation, Reinitialize};
use crate::image::ImageSource;
use crate::negotiate::{DeclaredSupport, Negotiated, NegotiationRequest, PresetNegotiator};
use crate::registry::DeviceRegistry;
use crate::types::{padded_dimensions, Codec, EncodeParams, PixelFormat, PixelLayout, Preset, Profile};

/// Statistics of an encode session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodeInfo {
    pub state: SessionState,
    pub device: Option<u32>,
    pub codec: Codec,
    pub width: u32,
    pub height: u32,
    /// Padded working size.
    pub working_size: (u32, u32),
    pub encoded_size: (u32, u32),
    pub layout: Option<PixelLayout>,
    pub profile: Option<Profile>,
    pub preset: Option<Preset>,
    pub lossless: bool,
    pub input_path: Option<InputPath>,
    pub quality: u8,
    pub speed: u8,
    pub frames: u64,
    pub keyframes: u64,
    pub bytes: u64,
    pub reinits: u64,
    pub transient_failures: u64,
}

/// Buffers and encoder of one session, living on `Active::context`.
#[derive(Debug)]
struct Pipeline {
    buffers: BufferManager,
    caps: CodecCaps,
    negotiated: Negotiated,
    csc: Option<CscSession>,
    encoder: Option<EncoderHandle>,
    bitstream: Option<BitstreamHandle>,
    encoded: (u32, u32),
}

impl Pipeline {
    fn settings(&self, params: &EncodeParams, quality: u8) -> EncoderSettings {
        EncoderSettings {
            codec: params.codec,
            profile: self.negotiated.profile,
            preset: self.negotiated.preset,
            width: self.encoded.0,
            height: self.encoded.1,
            input_format: self.input_format(params.colorspace),
            lossless: self.negotiated.lossless,
            quality: if self.negotiated.lossless { 100 } else { quality },
        }
    }

    fn input_format(&self, colorspace: PixelFormat) -> PixelFormat {
        match self.buffers.path() {
            InputPath::Direct => colorspace,
            InputPath::Converted => self.negotiated.surface_format(),
        }
    }

    /// Open, configure and register the encoder. `ctx` must be current.
    fn open_codec(&mut self, ctx: &SessionContext, params: &EncodeParams, quality: u8) -> Result<()> {
        let handle = ctx.ensure_current()?;
        let driver = ctx.driver();
        let encoder = driver
            .open_encoder(handle, params.codec)
            .map_err(|s| translate_for_device(ctx.device(), s, Operation::OpenEncoder))?;
        self.encoder = Some(encoder);
        let settings = self.settings(params, quality);
        driver
            .initialize_encoder(handle, encoder, &settings)
            .map_err(|s| translate(s, Operation::InitializeEncoder))?;
        self.bitstream = Some(
            driver
                .create_bitstream(handle, encoder)
                .map_err(|s| translate(s, Operation::CreateBitstream))?,
        );
        self.buffers.register_with_codec(ctx, encoder, settings.input_format)?;
        self.csc = match self.buffers.path() {
            InputPath::Direct => None,
            InputPath::Converted => Some(CscSession::new(
                params.colorspace,
                (params.width, params.height),
                self.negotiated.surface_format(),
                self.encoded,
            )?),
        };
        Ok(())
    }

    /// Flush and destroy the encoder, keeping the buffers. `ctx` must be
    /// current.
    fn close_codec(&mut self, ctx: &SessionContext, flush: bool) {
        let Ok(handle) = ctx.ensure_current() else {
            return;
        };
        let driver = ctx.driver();
        let Some(encoder) = self.encoder.take() else {
            return;
        };
        if flush && self.bitstream.is_some() {
            if let Err(status) = driver.end_of_stream(handle, encoder) {
                debug!("flushing encoder: {}", translate(status, Operation::Encode));
            }
        }
        if let Err(err) = self.buffers.unregister(ctx) {
            warn!("unregistering encoder input: {}", err);
        }
        if let Some(bitstream) = self.bitstream.take() {
            if let Err(status) = driver.destroy_bitstream(handle, encoder, bitstream) {
                debug!("destroying bitstream: {}", translate(status, Operation::DestroyEncoder));
            }
        }
        if let Err(status) = driver.destroy_encoder(handle, encoder) {
            warn!("destroying encoder: {}", translate(status, Operation::DestroyEncoder));
        }
        self.csc = None;
    }
}

/// Everything created on the accelerator for one encoder instance.
#[derive(Debug)]
struct Active {
    context: SessionContext,
    pipeline: Pipeline,
}

impl Active {
    /// Release everything in reverse order of creation.
    fn teardown(mut self, flush: bool) {
        match self.context.acquire() {
            Ok(_guard) => {
                self.pipeline.close_codec(&self.context, flush);
                if let Err(err) = self.pipeline.buffers.free(&self.context) {
                    warn!("freeing encoder buffers: {}", err);
                }
            }
            Err(err) => warn!("cannot make context current for teardown: {}", err),
        }
        self.context.close();
    }
}

/// A hardware encode session.
///
/// Not meant to be shared between threads; move it to the thread that
/// encodes.
#[derive(Debug)]
pub struct EncodeSession {
    registry: Arc<DeviceRegistry>,
    negotiator: PresetNegotiator,
    quality_step: u8,
    params: EncodeParams,
    state: SessionState,
    active: Option<Active>,
    force_keyframe: bool,
    first_frame: Option<Instant>,
    frames: u64,
    keyframes: u64,
    bytes: u64,
    reinits: u64,
    transient_failures: u64,
}

impl EncodeSession {
    #[must_use]
    pub fn new(registry: Arc<DeviceRegistry>) -> Self {
        let config = registry.config();
        Self {
            negotiator: PresetNegotiator::new(config),
            quality_step: config.quality_step,
            registry,
            params: EncodeParams::default(),
            state: SessionState::Uninitialized,
            active: None,
            force_keyframe: true,
            first_frame: None,
            frames: 0,
            keyframes: 0,
            bytes: 0,
            reinits: 0,
            transient_failures: 0,
        }
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Set up the session. Only legal on a new session.
    pub fn init(&mut self, params: EncodeParams) -> Result<()> {
        match self.state {
            SessionState::Uninitialized => {}
            SessionState::Closed => return Err(CodecError::SessionClosed),
            other => {
                return Err(CodecError::InvalidState {
                    expected: SessionState::Uninitialized.name(),
                    actual: other.name(),
                })
            }
        }
        self.params = params;
        self.state = SessionState::Initializing;
        match self.build(None) {
            Ok(active) => {
                let pipeline = &active.pipeline;
                let (pw, ph) = pipeline.buffers.dimensions();
                info!(
                    "encoder ready on device {}: {} {}x{} ({}x{} working) {} {} preset {}{}",
                    active.context.device(),
                    self.params.codec,
                    self.params.width,
                    self.params.height,
                    pw,
                    ph,
                    pipeline.negotiated.layout,
                    pipeline.negotiated.profile,
                    pipeline.negotiated.preset,
                    if pipeline.negotiated.lossless { " lossless" } else { "" }
                );
                self.active = Some(active);
                self.state = SessionState::Ready;
                Ok(())
            }
            Err(err) => {
                self.state = SessionState::Uninitialized;
                Err(err)
            }
        }
    }

    /// Create context, buffers and encoder for the current parameters.
    fn build(&mut self, current: Option<Preset>) -> Result<Active> {
        let params = self.params.clone();
        if params.width == 0 || params.height == 0 {
            return Err(CodecError::InvalidDimensions {
                width: params.width,
                height: params.height,
            });
        }
        let config = self.registry.config();
        let device = self.registry.select_device(params.device, config.min_compute)?;
        let caps = self
            .registry
            .codec_caps(device, params.codec)?
            .ok_or(CodecError::UnsupportedCodec(params.codec))?;

        let padded = padded_dimensions(params.width, params.height);
        let encoded = params.scaling.apply(params.width, params.height);
        if !caps.fits(encoded.0, encoded.1) || !caps.fits(padded.0, padded.1) {
            return Err(CodecError::InvalidDimensions {
                width: params.width,
                height: params.height,
            });
        }
        let scaling = !params.scaling.is_identity();
        let negotiated = self.negotiator.negotiate(&NegotiationRequest {
            codec: params.codec,
            speed: params.speed,
            quality: params.quality,
            colorspace: params.colorspace,
            support: DeclaredSupport::from_caps(&caps, self.registry.feature_flags()),
            scaling,
            current,
        })?;

        let driver = self.registry.driver();
        let path = match (driver.supports_csc(), caps.rgb_input && !scaling) {
            (_, true) => InputPath::Direct,
            (true, false) => InputPath::Converted,
            (false, false) => {
                return Err(CodecError::configuration(format!(
                    "{} cannot encode {} input{} without a conversion kernel",
                    driver.name(),
                    params.colorspace,
                    if scaling { " with scaling" } else { "" }
                )))
            }
        };

        let context = match SessionContext::create(Arc::clone(&self.registry), device) {
            Ok(context) => context,
            Err(err) => {
                if err.is_transient() {
                    self.registry.record_failure(device);
                }
                return Err(err);
            }
        };
        let buffers = {
            let _guard = context.acquire()?;
            BufferManager::allocate(&context, padded.0, padded.1, params.colorspace, path)?
        };

        let mut active = Active {
            context,
            pipeline: Pipeline {
                buffers,
                caps,
                negotiated,
                csc: None,
                encoder: None,
                bitstream: None,
                encoded,
            },
        };
        let opened = match active.context.acquire() {
            Ok(_guard) => active.pipeline.open_codec(&active.context, &params, params.quality),
            Err(err) => Err(err),
        };
        match opened {
            Ok(()) => {
                self.force_keyframe = true;
                Ok(active)
            }
            Err(err) => {
                if err.is_transient() {
                    self.registry.record_failure(device);
                }
                active.teardown(false);
                Err(err)
            }
        }
    }

    fn check_ready(&self) -> Result<()> {
        match self.state {
            SessionState::Ready => Ok(()),
            SessionState::Closed => Err(CodecError::SessionClosed),
            other => Err(CodecError::InvalidState {
                expected: SessionState::Ready.name(),
                actual: other.name(),
            }),
        }
    }

    /// Encode one image.
    ///
    /// A failure that needs a fresh encoder re-initialises the session and
    /// retries once; the retried frame is a keyframe.
    pub fn process(&mut self, image: &dyn ImageSource) -> Result<EncodedFrame> {
        retry_after_reinit(self, "encode", |session| session.process_once(image))
    }

    fn process_once(&mut self, image: &dyn ImageSource) -> Result<EncodedFrame> {
        self.check_ready()?;
        if (image.width(), image.height()) != (self.params.width, self.params.height) {
            return Err(CodecError::invalid_image(format!(
                "{}x{} image for a {}x{} session",
                image.width(),
                image.height(),
                self.params.width,
                self.params.height
            )));
        }
        self.state = SessionState::Encoding;
        let result = self.encode_frame(image);
        self.state = SessionState::Ready;

        let device = self.device();
        match &result {
            Ok(_) => {
                if let Some(device) = device {
                    self.registry.record_success(device);
                }
            }
            Err(err) if err.class() == FailureClass::Transient => {
                self.transient_failures += 1;
                debug!("transient encode failure: {}", err);
                if let Some(device) = device {
                    self.registry.record_failure(device);
                }
            }
            Err(_) => {}
        }
        result
    }

    fn encode_frame(&mut self, image: &dyn ImageSource) -> Result<EncodedFrame> {
        let active = self.active.as_mut().ok_or(CodecError::SessionClosed)?;
        let Active { context, pipeline } = active;
        let encoder = pipeline.encoder.ok_or(CodecError::SessionClosed)?;
        let bitstream = pipeline.bitstream.ok_or(CodecError::SessionClosed)?;
        let driver = Arc::clone(context.driver());

        let now = Instant::now();
        let pts = self
            .first_frame
            .map_or(0, |first| now.duration_since(first).as_millis() as u64);
        let force_idr = self.force_keyframe;

        let guard = context.acquire()?;
        let ctx = guard.handle();
        pipeline.buffers.upload(context, image)?;
        if let Some(csc) = &pipeline.csc {
            let (_, rows) = pipeline.buffers.dimensions();
            csc.convert(
                context,
                &pipeline.buffers.device_buffer()?,
                &pipeline.buffers.planar_buffer()?,
                rows,
            )?;
        }

        let mapped = pipeline.buffers.map_for_codec(context)?;
        let input = mapped
            .handle()
            .ok_or_else(|| CodecError::protocol("encode picture", "input not mapped"))?;
        driver
            .encode_picture(
                ctx,
                encoder,
                &PictureParams {
                    input,
                    bitstream,
                    pts,
                    force_idr,
                },
            )
            .map_err(|s| translate(s, Operation::Encode))?;

        let locked = driver
            .lock_bitstream(ctx, encoder, bitstream)
            .map_err(|s| translate(s, Operation::LockBitstream))?;
        let data = if locked.data.is_null() || locked.len == 0 {
            Bytes::new()
        } else {
            // SAFETY: the driver keeps the locked bitstream valid until unlock.
            Bytes::copy_from_slice(unsafe { std::slice::from_raw_parts(locked.data, locked.len) })
        };
        let keyframe = locked.keyframe;
        driver
            .unlock_bitstream(ctx, encoder, bitstream)
            .map_err(|s| translate(s, Operation::UnlockBitstream))?;
        mapped.unmap()?;
        drop(guard);

        if self.first_frame.is_none() {
            self.first_frame = Some(now);
        }
        self.force_keyframe = false;
        let lossless = pipeline.negotiated.lossless;
        let metadata = FrameMetadata {
            frame: self.frames,
            pts,
            speed: self.params.speed,
            quality: if lossless { 100 } else { self.params.quality },
            scaled_size: (!self.params.scaling.is_identity()).then_some(pipeline.encoded),
            lossless,
            keyframe,
        };
        self.frames += 1;
        self.bytes += data.len() as u64;
        if keyframe {
            self.keyframes += 1;
        }
        Ok(EncodedFrame { data, metadata })
    }

    /// Move the speed/quality targets.
    ///
    /// Quality moves at most `quality_step` per call except across the
    /// lossless threshold. A change of layout or lossless mode rebuilds the
    /// encoder on the same buffers; anything else reconfigures it in place.
    ///
    /// A failure that needs a fresh encoder re-initialises the session. Any
    /// other failure is returned with the previous targets still in effect,
    /// or with the session closed if the previous encoder cannot be restored.
    pub fn reconfigure(&mut self, quality: u8, speed: u8) -> Result<()> {
        self.check_ready()?;
        let quality = damp_quality(
            self.params.quality,
            quality.min(100),
            self.quality_step,
            self.negotiator.lossless_threshold(),
        );
        let speed = speed.min(100);
        let active = self.active.as_mut().ok_or(CodecError::SessionClosed)?;
        let Active { context, pipeline } = active;
        let previous = pipeline.negotiated;
        let negotiated = self.negotiator.negotiate(&NegotiationRequest {
            codec: self.params.codec,
            speed,
            quality,
            colorspace: self.params.colorspace,
            support: DeclaredSupport::from_caps(&pipeline.caps, self.registry.feature_flags()),
            scaling: !self.params.scaling.is_identity(),
            current: Some(previous.preset),
        })?;
        let previous_targets = (self.params.quality, self.params.speed);
        let targets_changed = (quality, speed) != previous_targets;
        self.params.quality = quality;
        self.params.speed = speed;

        let rebuild = negotiated.layout != previous.layout
            || negotiated.lossless != previous.lossless
            || negotiated.profile != previous.profile;
        let result = {
            let guard = context.acquire()?;
            if rebuild {
                info!(
                    "switching encoder from {}{} to {}{}",
                    previous.layout,
                    if previous.lossless { " lossless" } else { "" },
                    negotiated.layout,
                    if negotiated.lossless { " lossless" } else { "" }
                );
                pipeline.close_codec(context, true);
                pipeline.negotiated = negotiated;
                self.force_keyframe = true;
                pipeline.open_codec(context, &self.params, quality)
            } else if negotiated != previous || targets_changed {
                pipeline.negotiated = negotiated;
                let settings = pipeline.settings(&self.params, quality);
                match pipeline.encoder {
                    Some(encoder) => context
                        .driver()
                        .reconfigure_encoder(guard.handle(), encoder, &settings)
                        .map_err(|s| translate(s, Operation::ReconfigureEncoder)),
                    None => Err(CodecError::SessionClosed),
                }
            } else {
                Ok(())
            }
        };

        let err = match result {
            Ok(()) => {
                debug!(
                    "reconfigured to quality {} speed {}: preset {}",
                    quality, speed, negotiated.preset
                );
                return Ok(());
            }
            Err(err) if err.class() == FailureClass::Reinit => {
                warn!("reconfigure failed: {}, re-initialising", err);
                return self.reinitialize();
            }
            Err(err) => err,
        };

        warn!("reconfigure to quality {} speed {} failed: {}", quality, speed, err);
        (self.params.quality, self.params.speed) = previous_targets;
        if err.is_transient() {
            self.registry.record_failure(context.device());
        }
        if !rebuild {
            // The encoder rejected the change and keeps its settings.
            pipeline.negotiated = previous;
            return Err(err);
        }

        let restored = match context.acquire() {
            Ok(_guard) => {
                pipeline.close_codec(context, false);
                pipeline.negotiated = previous;
                pipeline.open_codec(context, &self.params, self.params.quality)
            }
            Err(acquire_err) => Err(acquire_err),
        };
        if let Err(restore_err) = restored {
            warn!("restoring the previous encoder failed: {}, closing session", restore_err);
            self.close();
        }
        Err(err)
    }

    /// Flush the encoder and release everything. Safe to call repeatedly.
    pub fn close(&mut self) {
        if let Some(active) = self.active.take() {
            debug!("closing encoder on device {}", active.context.device());
            active.teardown(true);
        }
        self.state = SessionState::Closed;
    }

    #[must_use]
    pub fn params(&self) -> &EncodeParams {
        &self.params
    }

    fn pipeline(&self) -> Option<&Pipeline> {
        self.active.as_ref().map(|a| &a.pipeline)
    }

    /// Padded working dimensions.
    #[must_use]
    pub fn working_dimensions(&self) -> Option<(u32, u32)> {
        self.pipeline().map(|p| p.buffers.dimensions())
    }

    #[must_use]
    pub fn negotiated(&self) -> Option<Negotiated> {
        self.pipeline().map(|p| p.negotiated)
    }

    #[must_use]
    pub fn input_path(&self) -> Option<InputPath> {
        self.pipeline().map(|p| p.buffers.path())
    }

    #[must_use]
    pub fn device(&self) -> Option<u32> {
        self.active.as_ref().map(|a| a.context.device())
    }

    /// Pitches of the host buffer and of the buffer the encoder reads.
    #[must_use]
    pub fn pitches(&self) -> Option<(usize, usize)> {
        self.pipeline()
            .map(|p| (p.buffers.host_pitch(), p.buffers.input_pitch()))
    }

    #[must_use]
    pub fn info(&self) -> EncodeInfo {
        let pipeline = self.pipeline();
        EncodeInfo {
            state: self.state,
            device: self.device(),
            codec: self.params.codec,
            width: self.params.width,
            height: self.params.height,
            working_size: self.working_dimensions().unwrap_or_default(),
            encoded_size: pipeline.map(|p| p.encoded).unwrap_or_default(),
            layout: pipeline.map(|p| p.negotiated.layout),
            profile: pipeline.map(|p| p.negotiated.profile),
            preset: pipeline.map(|p| p.negotiated.preset),
            lossless: pipeline.is_some_and(|p| p.negotiated.lossless),
            input_path: self.input_path(),
            quality: self.params.quality,
            speed: self.params.speed,
            frames: self.frames,
            keyframes: self.keyframes,
            bytes: self.bytes,
            reinits: self.reinits,
            transient_failures: self.transient_failures,
        }
    }
}

impl Reinitialize for EncodeSession {
    fn reinitialize(&mut self) -> Result<()> {
        if self.state == SessionState::Closed {
            return Err(CodecError::SessionClosed);
        }
        let current = self.negotiated().map(|n| n.preset);
        if let Some(active) = self.active.take() {
            active.teardown(false);
        }
        self.reinits += 1;
        self.state = SessionState::Initializing;
        match self.build(current) {
            Ok(active) => {
                self.active = Some(active);
                self.state = SessionState::Ready;
                Ok(())
            }
            Err(err) => {
                warn!("re-initialising encoder failed: {}", err);
                self.state = SessionState::Closed;
                Err(err)
            }
        }
    }
}

impl Drop for EncodeSession {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AccelConfig;
    use crate::driver::emulated::{EmulatedDevice, EmulatedDriver, FaultPoint};
    use crate::driver::status::{NV_ENC_ERR_INVALID_PARAM, NV_ENC_ERR_UNSUPPORTED_PARAM};
    use crate::driver::NativeStatus;
    use crate::image::ImageWrapper;

    fn session() -> (EmulatedDriver, EncodeSession) {
        let driver = EmulatedDriver::new(vec![EmulatedDevice::new("a")]);
        let registry = Arc::new(DeviceRegistry::new(Arc::new(driver.clone()), AccelConfig::default()));
        (driver, EncodeSession::new(registry))
    }

    fn image(w: u32, h: u32) -> ImageWrapper {
        ImageWrapper::packed(w, h, PixelFormat::Bgrx, (w * 4) as usize, vec![128; (w * h * 4) as usize]).unwrap()
    }

    #[test]
    fn test_process_before_init() {
        let (_, mut session) = session();
        let err = session.process(&image(64, 64)).unwrap_err();
        assert!(matches!(err, CodecError::InvalidState { expected: "ready", .. }));
    }

    #[test]
    fn test_first_frame_is_keyframe() {
        let (_, mut session) = session();
        session.init(EncodeParams::new(64, 48)).unwrap();
        let first = session.process(&image(64, 48)).unwrap();
        let second = session.process(&image(64, 48)).unwrap();
        assert!(first.metadata.keyframe);
        assert!(!second.metadata.keyframe);
        assert_eq!(first.metadata.frame, 0);
        assert_eq!(first.metadata.pts, 0);
        assert_eq!(second.metadata.frame, 1);
        assert_eq!(session.info().frames, 2);
    }

    #[test]
    fn test_wrong_image_size() {
        let (_, mut session) = session();
        session.init(EncodeParams::new(64, 48)).unwrap();
        assert!(matches!(session.process(&image(32, 48)), Err(CodecError::InvalidImage(_))));
        assert_eq!(session.state(), SessionState::Ready);
    }

    #[test]
    fn test_init_twice() {
        let (_, mut session) = session();
        session.init(EncodeParams::new(64, 48)).unwrap();
        assert!(matches!(
            session.init(EncodeParams::new(64, 48)),
            Err(CodecError::InvalidState { .. })
        ));
    }

    #[test]
    fn test_unsupported_codec() {
        let driver = EmulatedDriver::new(vec![EmulatedDevice::new("a").without_codec(Codec::Av1)]);
        let registry = Arc::new(DeviceRegistry::new(Arc::new(driver.clone()), AccelConfig::default()));
        let mut session = EncodeSession::new(registry);
        let err = session.init(EncodeParams::new(64, 48).codec(Codec::Av1)).unwrap_err();
        assert!(matches!(err, CodecError::UnsupportedCodec(Codec::Av1)));
        assert_eq!(session.state(), SessionState::Uninitialized);
        assert_eq!(driver.stats().contexts, 0);
    }

    #[test]
    fn test_reconfigure_in_place_is_damped() {
        let (_, mut session) = session();
        session.init(EncodeParams::new(64, 48).quality(40)).unwrap();
        session.reconfigure(80, 50).unwrap();
        assert_eq!(session.params().quality, 50);
        assert_eq!(session.negotiated().unwrap().layout, PixelLayout::Nv12);
    }

    #[test]
    fn test_failed_rebuild_restores_previous_encoder() {
        let (driver, mut session) = session();
        session.init(EncodeParams::new(64, 48)).unwrap();
        session.process(&image(64, 48)).unwrap();

        driver.inject_fault(FaultPoint::InitializeEncoder, NativeStatus::Nvenc(NV_ENC_ERR_UNSUPPORTED_PARAM), 1);
        let err = session.reconfigure(100, 50).unwrap_err();
        assert_eq!(err.class(), FailureClass::Configuration);
        assert_eq!(session.state(), SessionState::Ready);
        assert_eq!(session.params().quality, 50);
        let negotiated = session.negotiated().unwrap();
        assert!(!negotiated.lossless);
        assert_eq!(negotiated.layout, PixelLayout::Nv12);
        assert_eq!(session.info().reinits, 0);
        let stats = driver.stats();
        assert_eq!((stats.encoders, stats.registrations, stats.bitstreams), (1, 1, 1));

        let frame = session.process(&image(64, 48)).unwrap();
        assert!(frame.metadata.keyframe);
        assert!(!frame.metadata.lossless);
    }

    #[test]
    fn test_failed_restore_closes_session() {
        let (driver, mut session) = session();
        session.init(EncodeParams::new(64, 48)).unwrap();
        driver.inject_fault(FaultPoint::InitializeEncoder, NativeStatus::Nvenc(NV_ENC_ERR_UNSUPPORTED_PARAM), 2);
        let err = session.reconfigure(100, 50).unwrap_err();
        assert_eq!(err.class(), FailureClass::Configuration);
        assert_eq!(session.state(), SessionState::Closed);
        let stats = driver.stats();
        assert_eq!((stats.contexts, stats.encoders, stats.device_allocations), (0, 0, 0));
        assert_eq!(stats.leaked_registrations, 0);
    }

    #[test]
    fn test_rejected_reconfigure_keeps_targets() {
        let (driver, mut session) = session();
        session.init(EncodeParams::new(64, 48).quality(40)).unwrap();
        session.process(&image(64, 48)).unwrap();
        let before = session.negotiated();

        driver.inject_fault(FaultPoint::Reconfigure, NativeStatus::Nvenc(NV_ENC_ERR_INVALID_PARAM), 1);
        let err = session.reconfigure(50, 50).unwrap_err();
        assert_eq!(err.class(), FailureClass::Configuration);
        assert_eq!(session.params().quality, 40);
        assert_eq!(session.negotiated(), before);
        assert_eq!(session.state(), SessionState::Ready);
        assert!(!session.process(&image(64, 48)).unwrap().metadata.keyframe);

        session.reconfigure(50, 50).unwrap();
        assert_eq!(session.params().quality, 50);
    }

    #[test]
    fn test_close_flushes_everything() {
        let (driver, mut session) = session();
        session.init(EncodeParams::new(64, 48)).unwrap();
        session.process(&image(64, 48)).unwrap();
        session.close();
        session.close();
        let stats = driver.stats();
        assert_eq!(stats.contexts, 0);
        assert_eq!(stats.encoders, 0);
        assert_eq!(stats.device_allocations, 0);
        assert_eq!(stats.host_allocations, 0);
        assert_eq!(stats.leaked_registrations, 0);
        assert_eq!(stats.leaked_on_context_destroy, 0);
        assert!(matches!(session.process(&image(64, 48)), Err(CodecError::SessionClosed)));
    }
}
