//! Decode sessions.

use std::sync::Arc;

use tracing::{debug, info, trace, warn};

use super::SessionState;
use crate::context::SessionContext;
use crate::driver::{DecoderHandle, DecoderSettings};
use crate::error::{CodecError, Result};
use crate::failure::{retry_after_reinit, translate, translate_for_device, FailureClass, Operation, Reinitialize};
use crate::ownership::{DecodedImage, FrameOwnershipTracker};
use crate::registry::DeviceRegistry;
use crate::types::{Codec, DecodeParams, PixelLayout};

/// Statistics of a decode session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeInfo {
    pub state: SessionState,
    pub device: Option<u32>,
    pub codec: Codec,
    pub width: u32,
    pub height: u32,
    /// Layout of the last decoded picture.
    pub layout: PixelLayout,
    pub frames: u64,
    /// Access units that produced no picture.
    pub empty: u64,
    /// Access units the decoder rejected.
    pub failures: u64,
    pub reinits: u64,
    /// Handed-out images still backed by a decoder slot.
    pub attached_images: usize,
}

#[derive(Debug)]
struct Active {
    context: SessionContext,
    decoder: Option<DecoderHandle>,
}

impl Active {
    fn teardown(mut self, tracker: &mut FrameOwnershipTracker) {
        let detached = tracker.reclaim_all();
        if detached > 0 {
            debug!("detached {} retained images before closing the decoder", detached);
        }
        if let Some(decoder) = self.decoder.take() {
            match self.context.acquire() {
                Ok(guard) => {
                    if let Err(status) = self.context.driver().destroy_decoder(guard.handle(), decoder) {
                        warn!("destroying decoder: {}", translate(status, Operation::DestroyDecoder));
                    }
                }
                Err(err) => warn!("cannot make context current for teardown: {}", err),
            }
        }
        self.context.close();
    }
}

/// A hardware decode session.
///
/// Images returned by [`DecodeSession::process`] stay readable after later
/// decodes and after the session closes.
#[derive(Debug)]
pub struct DecodeSession {
    registry: Arc<DeviceRegistry>,
    params: DecodeParams,
    state: SessionState,
    active: Option<Active>,
    tracker: FrameOwnershipTracker,
    layout: PixelLayout,
    layout_warned: bool,
    frames: u64,
    empty: u64,
    failures: u64,
    reinits: u64,
}

impl DecodeSession {
    #[must_use]
    pub fn new(registry: Arc<DeviceRegistry>) -> Self {
        Self {
            registry,
            params: DecodeParams::new(Codec::H264, 0, 0),
            state: SessionState::Uninitialized,
            active: None,
            tracker: FrameOwnershipTracker::new(),
            layout: PixelLayout::Nv12,
            layout_warned: false,
            frames: 0,
            empty: 0,
            failures: 0,
            reinits: 0,
        }
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn init(&mut self, params: DecodeParams) -> Result<()> {
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
        if params.width == 0 || params.height == 0 {
            return Err(CodecError::InvalidDimensions {
                width: params.width,
                height: params.height,
            });
        }
        self.layout = params.layout;
        self.params = params;
        self.state = SessionState::Initializing;
        match self.build() {
            Ok(active) => {
                info!(
                    "decoder ready on device {}: {} {}x{} {}",
                    active.context.device(),
                    self.params.codec,
                    self.params.width,
                    self.params.height,
                    self.params.layout
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

    fn build(&self) -> Result<Active> {
        let config = self.registry.config();
        let device = self.registry.select_device(self.params.device, config.min_compute)?;
        self.open_on(device).inspect_err(|err| {
            if err.is_transient() {
                self.registry.record_failure(device);
            }
        })
    }

    fn open_on(&self, device: u32) -> Result<Active> {
        let config = self.registry.config();
        let context = SessionContext::create(Arc::clone(&self.registry), device)?;
        let settings = DecoderSettings {
            codec: self.params.codec,
            width: self.params.width,
            height: self.params.height,
            layout: self.params.layout,
            output_surfaces: config.decoder_surfaces,
        };
        let decoder = {
            let guard = context.acquire()?;
            context
                .driver()
                .open_decoder(guard.handle(), &settings)
                .map_err(|s| translate_for_device(device, s, Operation::OpenDecoder))?
        };
        Ok(Active {
            context,
            decoder: Some(decoder),
        })
    }

    /// Decode one access unit.
    ///
    /// Returns `Ok(None)` for empty input, for input that yields no picture
    /// and for corrupt input; the latter is counted in [`DecodeInfo`].
    pub fn process(&mut self, data: &[u8]) -> Result<Option<DecodedImage>> {
        retry_after_reinit(self, "decode", |session| session.process_once(data))
    }

    fn process_once(&mut self, data: &[u8]) -> Result<Option<DecodedImage>> {
        match self.state {
            SessionState::Ready => {}
            SessionState::Closed => return Err(CodecError::SessionClosed),
            other => {
                return Err(CodecError::InvalidState {
                    expected: SessionState::Ready.name(),
                    actual: other.name(),
                })
            }
        }
        if data.is_empty() {
            trace!("empty access unit");
            return Ok(None);
        }
        let active = self.active.as_ref().ok_or(CodecError::SessionClosed)?;
        let decoder = active.decoder.ok_or(CodecError::SessionClosed)?;
        let driver = active.context.driver();

        self.state = SessionState::Decoding;
        let decoded = {
            let guard = active.context.acquire();
            guard.and_then(|guard| {
                self.tracker.before_reuse(driver.next_output_slot(decoder));
                driver
                    .decode(guard.handle(), decoder, data, self.frames)
                    .map_err(|s| translate(s, Operation::Decode))
                    .map(|picture| (picture, guard.handle()))
            })
        };
        self.state = SessionState::Ready;

        let (picture, ctx) = match decoded {
            Ok(decoded) => decoded,
            Err(err) if err.class() == FailureClass::DecodeFailure => {
                self.failures += 1;
                if self.failures == 1 {
                    warn!("dropping undecodable access unit: {}", err);
                } else {
                    debug!("dropping undecodable access unit ({} so far): {}", self.failures, err);
                }
                return Ok(None);
            }
            Err(err) => {
                if err.is_transient() {
                    self.registry.record_failure(active.context.device());
                }
                return Err(err);
            }
        };
        let Some(picture) = picture else {
            self.empty += 1;
            trace!("access unit produced no picture");
            return Ok(None);
        };

        if let Some(layout) = PixelLayout::of_surface(picture.layout.format) {
            if layout != self.layout {
                if !self.layout_warned {
                    info!("stream switched from {} to {}", self.layout, layout);
                    self.layout_warned = true;
                } else {
                    debug!("stream switched from {} to {}", self.layout, layout);
                }
                self.layout = layout;
            }
        }
        self.registry.record_success(active.context.device());
        self.frames += 1;
        Ok(Some(self.tracker.track(picture, ctx.0)))
    }

    /// Release the decoder. Retained images are detached first. Safe to call
    /// repeatedly.
    pub fn close(&mut self) {
        if let Some(active) = self.active.take() {
            debug!("closing decoder on device {}", active.context.device());
            active.teardown(&mut self.tracker);
        }
        self.state = SessionState::Closed;
    }

    #[must_use]
    pub fn params(&self) -> &DecodeParams {
        &self.params
    }

    /// Layout of the stream as last observed.
    #[must_use]
    pub fn layout(&self) -> PixelLayout {
        self.layout
    }

    #[must_use]
    pub fn device(&self) -> Option<u32> {
        self.active.as_ref().map(|a| a.context.device())
    }

    #[must_use]
    pub fn info(&self) -> DecodeInfo {
        DecodeInfo {
            state: self.state,
            device: self.device(),
            codec: self.params.codec,
            width: self.params.width,
            height: self.params.height,
            layout: self.layout,
            frames: self.frames,
            empty: self.empty,
            failures: self.failures,
            reinits: self.reinits,
            attached_images: self.tracker.live_observers(),
        }
    }
}

impl Reinitialize for DecodeSession {
    fn reinitialize(&mut self) -> Result<()> {
        if self.state == SessionState::Closed {
            return Err(CodecError::SessionClosed);
        }
        if let Some(active) = self.active.take() {
            active.teardown(&mut self.tracker);
        }
        self.reinits += 1;
        self.state = SessionState::Initializing;
        match self.build() {
            Ok(active) => {
                self.active = Some(active);
                self.state = SessionState::Ready;
                Ok(())
            }
            Err(err) => {
                warn!("re-initialising decoder failed: {}", err);
                self.state = SessionState::Closed;
                Err(err)
            }
        }
    }
}

impl Drop for DecodeSession {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AccelConfig;
    use crate::driver::emulated::{EmulatedDevice, EmulatedDriver};

    fn session() -> (EmulatedDriver, DecodeSession) {
        let driver = EmulatedDriver::new(vec![EmulatedDevice::new("a")]);
        let registry = Arc::new(DeviceRegistry::new(Arc::new(driver.clone()), AccelConfig::default()));
        (driver, DecodeSession::new(registry))
    }

    #[test]
    fn test_empty_input() {
        let (_, mut session) = session();
        session.init(DecodeParams::new(Codec::H264, 64, 48)).unwrap();
        assert!(session.process(&[]).unwrap().is_none());
        let info = session.info();
        assert_eq!((info.frames, info.failures), (0, 0));
    }

    #[test]
    fn test_garbage_is_counted() {
        let (_, mut session) = session();
        session.init(DecodeParams::new(Codec::H264, 64, 48)).unwrap();
        assert!(session.process(b"definitely not a bitstream").unwrap().is_none());
        assert!(session.process(&[0xff; 3]).unwrap().is_none());
        let info = session.info();
        assert_eq!(info.frames, 0);
        assert_eq!(info.failures, 2);
        assert_eq!(info.reinits, 0);
        assert_eq!(session.state(), SessionState::Ready);
    }

    #[test]
    fn test_yuv444_needs_support() {
        let (_, mut session) = session();
        let err = session
            .init(DecodeParams::new(Codec::Av1, 64, 48).layout(PixelLayout::Yuv444p))
            .unwrap_err();
        assert_eq!(err.class(), FailureClass::Configuration);
        assert_eq!(session.state(), SessionState::Uninitialized);
    }

    #[test]
    fn test_close_releases_decoder() {
        let (driver, mut session) = session();
        session.init(DecodeParams::new(Codec::Hevc, 64, 48)).unwrap();
        assert_eq!(driver.stats().decoders, 1);
        session.close();
        session.close();
        let stats = driver.stats();
        assert_eq!(stats.decoders, 0);
        assert_eq!(stats.contexts, 0);
        assert!(matches!(session.process(&[1]), Err(CodecError::SessionClosed)));
    }
}
