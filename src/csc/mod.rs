//! Colorspace conversion on the device.
//!
//! A [`CscSession`] converts packed RGB in one pitched device buffer into
//! NV12, YUV444P or GBRP planes in another, optionally downscaling with a box
//! filter. [`convert_image`] wraps a whole upload-convert-download round trip
//! and falls back to the CPU kernels when the driver has no conversion kernel.

use tracing::{debug, trace};

use crate::context::SessionContext;
use crate::driver::{CscJob, DevicePitched, SurfaceLayout};
use crate::error::{CodecError, Result};
use crate::failure::{translate, Operation};
use crate::image::{ImageSource, ImageWrapper};
use crate::types::PixelFormat;

pub mod kernels;

/// A fixed source-to-destination conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CscSession {
    src_format: PixelFormat,
    src_width: u32,
    src_height: u32,
    dst_format: PixelFormat,
    dst_width: u32,
    dst_height: u32,
}

impl CscSession {
    pub fn new(
        src_format: PixelFormat,
        (src_width, src_height): (u32, u32),
        dst_format: PixelFormat,
        (dst_width, dst_height): (u32, u32),
    ) -> Result<Self> {
        if !src_format.is_packed_rgb() {
            return Err(CodecError::unsupported_format(format!("cannot convert from {src_format}")));
        }
        if !matches!(dst_format, PixelFormat::Nv12 | PixelFormat::Yuv444p | PixelFormat::Gbrp) {
            return Err(CodecError::unsupported_format(format!("cannot convert to {dst_format}")));
        }
        if dst_width == 0 || dst_height == 0 || dst_width > src_width || dst_height > src_height {
            return Err(CodecError::InvalidDimensions {
                width: dst_width,
                height: dst_height,
            });
        }
        Ok(Self {
            src_format,
            src_width,
            src_height,
            dst_format,
            dst_width,
            dst_height,
        })
    }

    #[must_use]
    pub fn dst_format(&self) -> PixelFormat {
        self.dst_format
    }

    #[must_use]
    pub fn dst_dimensions(&self) -> (u32, u32) {
        (self.dst_width, self.dst_height)
    }

    #[must_use]
    pub fn is_scaling(&self) -> bool {
        (self.src_width, self.src_height) != (self.dst_width, self.dst_height)
    }

    /// Run the conversion. Destination planes sit `plane_rows` rows apart.
    ///
    /// The context must be current.
    pub fn convert(&self, ctx: &SessionContext, src: &DevicePitched, dst: &DevicePitched, plane_rows: u32) -> Result<()> {
        let handle = ctx.ensure_current()?;
        if !ctx.driver().supports_csc() {
            return Err(CodecError::configuration("driver has no conversion kernel"));
        }
        let job = CscJob {
            src: *src,
            src_format: self.src_format,
            src_width: self.src_width,
            src_height: self.src_height,
            dst: *dst,
            dst_format: self.dst_format,
            dst_width: self.dst_width,
            dst_height: self.dst_height,
            plane_rows,
        };
        trace!("csc {:?}", job);
        ctx.driver()
            .launch_csc(handle, &job)
            .map_err(|s| translate(s, Operation::Convert))
    }
}

/// Convert a packed image into a three-plane (or NV12 two-plane) image.
///
/// The context must be current.
pub fn convert_image(
    ctx: &SessionContext,
    image: &dyn ImageSource,
    dst_format: PixelFormat,
    dst_dimensions: (u32, u32),
) -> Result<ImageWrapper> {
    let handle = ctx.ensure_current()?;
    let (w, h) = (image.width(), image.height());
    let csc = CscSession::new(image.pixel_format(), (w, h), dst_format, dst_dimensions)?;
    let (dw, dh) = dst_dimensions;

    let planes = if ctx.driver().supports_csc() {
        let driver = ctx.driver();
        let src_row = w as usize * 4;
        let mut host = driver
            .alloc_host(handle, src_row * h as usize)
            .map_err(|s| translate(s, Operation::AllocHost))?;
        let result = (|| {
            let stride = image.rowstride();
            let pixels = image.pixels();
            if pixels.len() < stride * (h as usize - 1) + src_row {
                return Err(CodecError::invalid_image("image data shorter than its dimensions"));
            }
            for (y, row) in host.as_mut_slice().chunks_exact_mut(src_row).enumerate() {
                row.copy_from_slice(&pixels[y * stride..y * stride + src_row]);
            }
            let src = driver
                .alloc_pitched(handle, src_row, h as usize)
                .map_err(|s| translate(s, Operation::AllocDevice))?;
            let dst = match driver.alloc_pitched(handle, dw as usize, dh as usize * 3) {
                Ok(dst) => dst,
                Err(status) => {
                    let _ = driver.free_device(handle, src);
                    return Err(translate(status, Operation::AllocDevice));
                }
            };
            let converted = driver
                .copy_to_device(handle, &host, src_row, &src, src_row, h as usize)
                .map_err(|s| translate(s, Operation::Upload))
                .and_then(|()| csc.convert(ctx, &src, &dst, dh))
                .and_then(|()| {
                    let mut out = vec![0u8; dst.pitch * dh as usize * 3];
                    driver
                        .copy_to_host(handle, &dst, &mut out, dst.pitch, dst.pitch, dh as usize * 3)
                        .map_err(|s| translate(s, Operation::Download))?;
                    Ok((out, dst.pitch))
                });
            for buffer in [dst, src] {
                if let Err(status) = driver.free_device(handle, buffer) {
                    debug!("freeing conversion buffer: {}", translate(status, Operation::Free));
                }
            }
            converted
        })();
        if let Err(status) = driver.free_host(handle, host) {
            debug!("freeing conversion host buffer: {}", translate(status, Operation::Free));
        }
        let (data, pitch) = result?;
        split_planes(&data, pitch, dst_format, dw, dh)?
    } else {
        let pitch = dw as usize;
        let mut data = vec![0u8; pitch * dh as usize * 3];
        let src = kernels::PackedRgb {
            data: image.pixels(),
            stride: image.rowstride(),
            format: image.pixel_format(),
            width: w,
            height: h,
        };
        let mut dst = kernels::PlanarTarget {
            data: &mut data,
            pitch,
            format: dst_format,
            width: dw,
            height: dh,
            plane_rows: dh,
        };
        kernels::convert_to_planar(&src, &mut dst)?;
        split_planes(&data, pitch, dst_format, dw, dh)?
    };

    let strides = planes.iter().map(|(_, stride)| *stride).collect();
    let planes = planes.into_iter().map(|(plane, _)| plane).collect();
    Ok(ImageWrapper::planar(dw, dh, dst_format, planes, strides)?.with_timestamp(image.timestamp_ms()))
}

/// Cut stacked planes (each `height` rows apart) into tight owned planes.
fn split_planes(data: &[u8], pitch: usize, format: PixelFormat, width: u32, height: u32) -> Result<Vec<(Vec<u8>, usize)>> {
    let layout = SurfaceLayout::planar(format, width, height, pitch);
    if data.len() < layout.byte_len() {
        return Err(CodecError::protocol("colorspace conversion", "converted image is truncated"));
    }
    let (w, h) = (width as usize, height as usize);
    let extents: Vec<(usize, usize)> = match format {
        PixelFormat::Nv12 => vec![(w, h), (w.next_multiple_of(2), h.div_ceil(2))],
        _ => vec![(w, h); 3],
    };
    Ok(extents
        .into_iter()
        .enumerate()
        .map(|(i, (row, rows))| {
            let mut plane = Vec::with_capacity(row * rows);
            for y in 0..rows {
                let start = layout.offsets[i] + y * layout.strides[i];
                plane.extend_from_slice(&data[start..start + row]);
            }
            (plane, row)
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::AccelConfig;
    use crate::driver::emulated::{EmulatedDevice, EmulatedDriver};
    use crate::registry::DeviceRegistry;

    fn context() -> (EmulatedDriver, SessionContext) {
        let driver = EmulatedDriver::new(vec![EmulatedDevice::new("a")]);
        let registry = Arc::new(DeviceRegistry::new(Arc::new(driver.clone()), AccelConfig::default()));
        (driver, SessionContext::create(registry, 0).unwrap())
    }

    fn checker(w: u32, h: u32) -> ImageWrapper {
        let mut data = vec![0u8; (w * h * 4) as usize];
        for (i, px) in data.chunks_mut(4).enumerate() {
            let on = (i % w as usize + i / w as usize) % 2 == 0;
            px.copy_from_slice(if on { &[10, 200, 30, 0] } else { &[250, 5, 120, 0] });
        }
        ImageWrapper::packed(w, h, PixelFormat::Bgrx, (w * 4) as usize, data).unwrap()
    }

    #[test]
    fn test_session_validation() {
        assert!(CscSession::new(PixelFormat::Nv12, (8, 8), PixelFormat::Gbrp, (8, 8)).is_err());
        assert!(CscSession::new(PixelFormat::Bgrx, (8, 8), PixelFormat::Bgra, (8, 8)).is_err());
        assert!(CscSession::new(PixelFormat::Bgrx, (8, 8), PixelFormat::Nv12, (16, 8)).is_err());
        assert!(CscSession::new(PixelFormat::Bgrx, (8, 8), PixelFormat::Nv12, (4, 4)).unwrap().is_scaling());
    }

    #[test]
    fn test_convert_image_gbrp() {
        let (driver, ctx) = context();
        let _guard = ctx.acquire().unwrap();
        let image = checker(6, 4);
        let out = convert_image(&ctx, &image, PixelFormat::Gbrp, (6, 4)).unwrap();
        assert_eq!(out.planes().len(), 3);
        let (g, _) = out.plane(0).unwrap();
        let (r, _) = out.plane(2).unwrap();
        assert_eq!((g[0], r[0]), (200, 30));
        assert_eq!((g[1], r[1]), (5, 120));
        let stats = driver.stats();
        assert_eq!(stats.device_allocations, 0);
        assert_eq!(stats.host_allocations, 0);
    }

    #[test]
    fn test_convert_image_plane_strides() {
        let (driver, ctx) = context();
        let _guard = ctx.acquire().unwrap();
        let image = checker(6, 5);

        let nv12 = convert_image(&ctx, &image, PixelFormat::Nv12, (6, 5)).unwrap();
        let planes = nv12.planes();
        assert_eq!(planes.len(), 2);
        assert_eq!((planes[0].0.len(), planes[0].1), (30, 6));
        assert_eq!((planes[1].0.len(), planes[1].1), (18, 6));

        let yuv = convert_image(&ctx, &image, PixelFormat::Yuv444p, (6, 5)).unwrap();
        let planes = yuv.planes();
        assert_eq!(planes.len(), 3);
        assert!(planes.iter().all(|(plane, stride)| plane.len() == 30 && *stride == 6));
        // Both checker colors map to distinct luma values
        assert_ne!(planes[0].0[0], planes[0].0[1]);

        let stats = driver.stats();
        assert_eq!((stats.device_allocations, stats.host_allocations), (0, 0));
    }

    #[test]
    fn test_convert_image_downscale() {
        let (_, ctx) = context();
        let _guard = ctx.acquire().unwrap();
        let out = convert_image(&ctx, &checker(8, 8), PixelFormat::Nv12, (4, 4)).unwrap();
        assert_eq!((out.width(), out.height()), (4, 4));
        let (y, stride) = out.plane(0).unwrap();
        assert_eq!(stride, 4);
        // Every 2x2 block averages the same two colors
        assert!(y.iter().all(|&v| v == y[0]));
    }
}
