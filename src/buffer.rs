//! Encoder input buffers and the registration protocol.
//!
//! Each encode session owns a pinned host buffer the caller's pixels are
//! copied into, a pitched device buffer they are uploaded to and, when the
//! session converts on the device, a planar buffer the encoder reads. The
//! buffer the encoder reads is registered once and then mapped around every
//! single submission. Host and device pitches are chosen independently.
//!
//! Every operation here requires the session context to be current.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::context::SessionContext;
use crate::driver::{
    ContextHandle, DevicePitched, Driver, EncoderHandle, HostAllocation, MappedInputHandle,
    RegisterDesc, RegistrationHandle,
};
use crate::error::{CodecError, Result};
use crate::failure::{translate, Operation};
use crate::image::ImageSource;
use crate::types::{roundup, PixelFormat};

/// Host buffer rows are padded to this many bytes.
pub const HOST_PITCH_ALIGNMENT: u32 = 16;

/// How pixels reach the encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputPath {
    /// The encoder reads the uploaded packed RGB buffer itself.
    Direct,
    /// A conversion kernel writes a planar buffer the encoder reads.
    Converted,
}

#[derive(Debug, Clone, Copy)]
struct Registration {
    encoder: EncoderHandle,
    handle: RegistrationHandle,
    format: PixelFormat,
}

/// Buffers of one encode session, sized to the padded working dimensions.
#[derive(Debug)]
pub struct BufferManager {
    driver: Arc<dyn Driver>,
    width: u32,
    height: u32,
    source: PixelFormat,
    path: InputPath,
    host: Option<HostAllocation>,
    host_pitch: usize,
    device: Option<DevicePitched>,
    planar: Option<DevicePitched>,
    registration: Option<Registration>,
}

impl BufferManager {
    /// Reserve buffers for `width`x`height` (already padded) input.
    ///
    /// On the converted path the planar buffer holds three full planes so
    /// that switching between 4:2:0 and 4:4:4 never reallocates.
    pub fn allocate(
        ctx: &SessionContext,
        width: u32,
        height: u32,
        source: PixelFormat,
        path: InputPath,
    ) -> Result<Self> {
        let handle = ctx.ensure_current()?;
        if !source.is_packed_rgb() {
            return Err(CodecError::unsupported_format(format!("cannot upload {source}")));
        }
        let mut buffers = Self {
            driver: Arc::clone(ctx.driver()),
            width,
            height,
            source,
            path,
            host: None,
            host_pitch: roundup(width * 4, HOST_PITCH_ALIGNMENT) as usize,
            device: None,
            planar: None,
            registration: None,
        };
        if let Err(err) = buffers.reserve(handle) {
            buffers.release(handle);
            return Err(err);
        }
        debug!(
            "allocated {}x{} buffers: host pitch {}, device pitch {}{}",
            width,
            height,
            buffers.host_pitch,
            buffers.device_pitch(),
            buffers
                .planar
                .map(|p| format!(", planar pitch {}", p.pitch))
                .unwrap_or_default()
        );
        Ok(buffers)
    }

    fn reserve(&mut self, ctx: ContextHandle) -> Result<()> {
        let (w, h) = (self.width as usize, self.height as usize);
        self.host = Some(
            self.driver
                .alloc_host(ctx, self.host_pitch * h)
                .map_err(|s| translate(s, Operation::AllocHost))?,
        );
        self.device = Some(
            self.driver
                .alloc_pitched(ctx, w * 4, h)
                .map_err(|s| translate(s, Operation::AllocDevice))?,
        );
        if self.path == InputPath::Converted {
            self.planar = Some(
                self.driver
                    .alloc_pitched(ctx, w, h * 3)
                    .map_err(|s| translate(s, Operation::AllocDevice))?,
            );
        }
        Ok(())
    }

    #[must_use]
    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    #[must_use]
    pub fn path(&self) -> InputPath {
        self.path
    }

    #[must_use]
    pub fn source_format(&self) -> PixelFormat {
        self.source
    }

    #[must_use]
    pub fn host_pitch(&self) -> usize {
        self.host_pitch
    }

    #[must_use]
    pub fn device_pitch(&self) -> usize {
        self.device.map_or(0, |d| d.pitch)
    }

    /// The uploaded packed RGB buffer.
    pub fn device_buffer(&self) -> Result<DevicePitched> {
        self.device.ok_or(CodecError::SessionClosed)
    }

    /// The planar buffer conversion writes into.
    pub fn planar_buffer(&self) -> Result<DevicePitched> {
        self.planar
            .ok_or_else(|| CodecError::protocol("colorspace conversion", "no planar buffer on the direct path"))
    }

    /// Pitch of the buffer the encoder reads.
    #[must_use]
    pub fn input_pitch(&self) -> usize {
        match self.path {
            InputPath::Direct => self.device_pitch(),
            InputPath::Converted => self.planar.map_or(0, |p| p.pitch),
        }
    }

    #[must_use]
    pub fn is_registered(&self) -> bool {
        self.registration.is_some()
    }

    /// Copy the image into the host buffer, then to the device.
    ///
    /// Rows are copied one by one unless the image stride matches the host
    /// pitch exactly.
    pub fn upload(&mut self, ctx: &SessionContext, image: &dyn ImageSource) -> Result<()> {
        let handle = ctx.ensure_current()?;
        let (w, h) = (image.width(), image.height());
        if w > self.width || h > self.height {
            return Err(CodecError::invalid_image(format!(
                "{w}x{h} image does not fit {}x{} buffers",
                self.width, self.height
            )));
        }
        if image.pixel_format() != self.source {
            return Err(CodecError::invalid_image(format!(
                "expected {} pixels, got {}",
                self.source,
                image.pixel_format()
            )));
        }
        let row = w as usize * 4;
        let rows = h as usize;
        let (pixels, stride) = (image.pixels(), image.rowstride());
        if stride < row || pixels.len() < stride * (rows - 1) + row {
            return Err(CodecError::invalid_image(format!(
                "{} bytes with stride {stride} cannot hold {w}x{h}",
                pixels.len()
            )));
        }

        let host_pitch = self.host_pitch;
        let host = self.host.as_mut().ok_or(CodecError::SessionClosed)?;
        let dst = host.as_mut_slice();
        if stride == host_pitch {
            let len = stride * (rows - 1) + row;
            dst[..len].copy_from_slice(&pixels[..len]);
        } else {
            for y in 0..rows {
                dst[y * host_pitch..y * host_pitch + row].copy_from_slice(&pixels[y * stride..y * stride + row]);
            }
        }

        let device = self.device.ok_or(CodecError::SessionClosed)?;
        let host = self.host.as_ref().ok_or(CodecError::SessionClosed)?;
        self.driver
            .copy_to_device(handle, host, host_pitch, &device, row, rows)
            .map_err(|s| translate(s, Operation::Upload))
    }

    /// Register the encoder input buffer with `encoder`.
    ///
    /// `format` is the surface format the encoder was initialised with.
    pub fn register_with_codec(&mut self, ctx: &SessionContext, encoder: EncoderHandle, format: PixelFormat) -> Result<()> {
        let handle = ctx.ensure_current()?;
        if self.registration.is_some() {
            return Err(CodecError::protocol("register resource", "input buffer is already registered"));
        }
        let buffer = match self.path {
            InputPath::Direct => self.device_buffer()?,
            InputPath::Converted => self.planar_buffer()?,
        };
        let desc = RegisterDesc {
            buffer,
            width: self.width,
            height: self.height,
            format,
            plane_rows: self.height,
        };
        let registration = self
            .driver
            .register_resource(handle, encoder, &desc)
            .map_err(|s| translate(s, Operation::Register))?;
        self.registration = Some(Registration {
            encoder,
            handle: registration,
            format,
        });
        Ok(())
    }

    /// Undo [`BufferManager::register_with_codec`]; no-op when unregistered.
    pub fn unregister(&mut self, ctx: &SessionContext) -> Result<()> {
        let handle = ctx.ensure_current()?;
        let Some(registration) = self.registration.take() else {
            return Ok(());
        };
        self.driver
            .unregister_resource(handle, registration.encoder, registration.handle)
            .map_err(|s| translate(s, Operation::Unregister))
    }

    /// Map the registered buffer for one submission.
    pub fn map_for_codec(&self, ctx: &SessionContext) -> Result<MappedInput> {
        let handle = ctx.ensure_current()?;
        let registration = self
            .registration
            .ok_or_else(|| CodecError::protocol("map input", "input buffer is not registered"))?;
        let mapped = self
            .driver
            .map_resource(handle, registration.encoder, registration.handle)
            .map_err(|s| translate(s, Operation::Map))?;
        Ok(MappedInput {
            driver: Arc::clone(&self.driver),
            ctx: handle,
            encoder: registration.encoder,
            mapped: Some(mapped),
            format: registration.format,
        })
    }

    /// Release everything in reverse order of acquisition. Idempotent.
    pub fn free(&mut self, ctx: &SessionContext) -> Result<()> {
        let handle = ctx.ensure_current()?;
        if let Err(err) = self.unregister(ctx) {
            warn!("unregistering input buffer: {}", err);
        }
        self.release(handle);
        Ok(())
    }

    fn release(&mut self, ctx: ContextHandle) {
        for buffer in [self.planar.take(), self.device.take()].into_iter().flatten() {
            if let Err(status) = self.driver.free_device(ctx, buffer) {
                warn!("freeing device buffer: {}", translate(status, Operation::Free));
            }
        }
        if let Some(host) = self.host.take() {
            if let Err(status) = self.driver.free_host(ctx, host) {
                warn!("freeing host buffer: {}", translate(status, Operation::Free));
            }
        }
    }
}

impl Drop for BufferManager {
    fn drop(&mut self) {
        if self.host.is_some() || self.device.is_some() || self.planar.is_some() {
            warn!("encoder buffers dropped without being freed");
        }
    }
}

/// A mapped encoder input; unmapped on drop.
#[derive(Debug)]
pub struct MappedInput {
    driver: Arc<dyn Driver>,
    ctx: ContextHandle,
    encoder: EncoderHandle,
    mapped: Option<MappedInputHandle>,
    format: PixelFormat,
}

impl MappedInput {
    #[must_use]
    pub fn handle(&self) -> Option<MappedInputHandle> {
        self.mapped
    }

    #[must_use]
    pub fn format(&self) -> PixelFormat {
        self.format
    }

    /// Unmap now and report the result.
    pub fn unmap(mut self) -> Result<()> {
        match self.mapped.take() {
            Some(mapped) => self
                .driver
                .unmap_resource(self.ctx, self.encoder, mapped)
                .map_err(|s| translate(s, Operation::Unmap)),
            None => Ok(()),
        }
    }
}

impl Drop for MappedInput {
    fn drop(&mut self) {
        if let Some(mapped) = self.mapped.take() {
            if let Err(status) = self.driver.unmap_resource(self.ctx, self.encoder, mapped) {
                warn!("unmapping encoder input: {}", translate(status, Operation::Unmap));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AccelConfig;
    use crate::driver::emulated::{EmulatedDevice, EmulatedDriver};
    use crate::image::ImageWrapper;
    use crate::registry::DeviceRegistry;

    fn context() -> (EmulatedDriver, SessionContext) {
        let driver = EmulatedDriver::new(vec![EmulatedDevice::new("a")]);
        let registry = Arc::new(DeviceRegistry::new(Arc::new(driver.clone()), AccelConfig::default()));
        (driver, SessionContext::create(registry, 0).unwrap())
    }

    #[test]
    fn test_needs_current_context() {
        let (_, ctx) = context();
        let err = BufferManager::allocate(&ctx, 64, 32, PixelFormat::Bgrx, InputPath::Direct).unwrap_err();
        assert!(matches!(err, CodecError::ContextNotCurrent(_)));
    }

    #[test]
    fn test_pitches() {
        let (driver, ctx) = context();
        let _guard = ctx.acquire().unwrap();
        let mut buffers = BufferManager::allocate(&ctx, 100, 32, PixelFormat::Bgrx, InputPath::Converted).unwrap();
        assert_eq!(buffers.host_pitch(), 400);
        assert!(buffers.device_pitch() >= 400);
        assert!(buffers.input_pitch() >= 100);
        assert_eq!(driver.stats().device_allocations, 2);
        buffers.free(&ctx).unwrap();
        buffers.free(&ctx).unwrap();
        let stats = driver.stats();
        assert_eq!(stats.device_allocations, 0);
        assert_eq!(stats.host_allocations, 0);
    }

    #[test]
    fn test_upload_with_mismatched_stride() {
        let (_, ctx) = context();
        let _guard = ctx.acquire().unwrap();
        let mut buffers = BufferManager::allocate(&ctx, 32, 32, PixelFormat::Bgrx, InputPath::Direct).unwrap();
        let image = ImageWrapper::packed(30, 20, PixelFormat::Bgrx, 30 * 4 + 8, vec![9u8; (30 * 4 + 8) * 20]).unwrap();
        buffers.upload(&ctx, &image).unwrap();
        let big = ImageWrapper::packed(40, 20, PixelFormat::Bgrx, 160, vec![0u8; 160 * 20]).unwrap();
        assert!(matches!(buffers.upload(&ctx, &big), Err(CodecError::InvalidImage(_))));
        let rgba = ImageWrapper::packed(30, 20, PixelFormat::Rgba, 120, vec![0u8; 120 * 20]).unwrap();
        assert!(buffers.upload(&ctx, &rgba).is_err());
        buffers.free(&ctx).unwrap();
    }

    #[test]
    fn test_map_requires_registration() {
        let (_, ctx) = context();
        let _guard = ctx.acquire().unwrap();
        let mut buffers = BufferManager::allocate(&ctx, 32, 32, PixelFormat::Bgrx, InputPath::Direct).unwrap();
        assert!(matches!(buffers.map_for_codec(&ctx), Err(CodecError::Protocol { .. })));
        buffers.free(&ctx).unwrap();
    }
}
