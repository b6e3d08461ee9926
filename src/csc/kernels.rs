//! CPU colorspace kernels (BT.601 limited range and the identity matrix).
//!
//! These back the emulated device's conversion launches and decoded-image
//! readback. All buffers are addressed through explicit strides; planar
//! destinations stack their planes `plane_rows` rows apart.

use crate::driver::SurfaceLayout;
use crate::error::{CodecError, Result};
use crate::types::PixelFormat;

/// A packed RGB source.
#[derive(Debug, Clone, Copy)]
pub struct PackedRgb<'a> {
    pub data: &'a [u8],
    pub stride: usize,
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
}

/// A planar destination.
#[derive(Debug)]
pub struct PlanarTarget<'a> {
    pub data: &'a mut [u8],
    pub pitch: usize,
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    pub plane_rows: u32,
}

#[inline]
fn clamp_u8(v: i32) -> u8 {
    v.clamp(0, 255) as u8
}

#[inline]
pub fn rgb_to_y(r: i32, g: i32, b: i32) -> u8 {
    clamp_u8(((66 * r + 129 * g + 25 * b + 128) >> 8) + 16)
}

#[inline]
pub fn rgb_to_u(r: i32, g: i32, b: i32) -> u8 {
    clamp_u8(((-38 * r - 74 * g + 112 * b + 128) >> 8) + 128)
}

#[inline]
pub fn rgb_to_v(r: i32, g: i32, b: i32) -> u8 {
    clamp_u8(((112 * r - 94 * g - 18 * b + 128) >> 8) + 128)
}

/// BT.601 limited range back to RGB.
#[inline]
pub fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = i32::from(y) - 16;
    let d = i32::from(u) - 128;
    let e = i32::from(v) - 128;
    [
        clamp_u8((298 * c + 409 * e + 128) >> 8),
        clamp_u8((298 * c - 100 * d - 208 * e + 128) >> 8),
        clamp_u8((298 * c + 516 * d + 128) >> 8),
    ]
}

/// Box-filter the source down to `width`x`height` RGB triplets.
fn resample(src: &PackedRgb<'_>, width: u32, height: u32) -> Result<Vec<[u8; 3]>> {
    let [bo, go, ro] = src
        .format
        .bgr_offsets()
        .ok_or_else(|| CodecError::unsupported_format(format!("{} is not packed RGB", src.format)))?;
    let (sw, sh) = (src.width as usize, src.height as usize);
    let (dw, dh) = (width as usize, height as usize);
    if dw == 0 || dh == 0 || dw > sw || dh > sh {
        return Err(CodecError::InvalidDimensions { width, height });
    }
    let needed = src.stride * (sh - 1) + sw * 4;
    if src.stride < sw * 4 || src.data.len() < needed {
        return Err(CodecError::invalid_image(format!(
            "{} bytes with stride {} cannot hold {}x{}",
            src.data.len(),
            src.stride,
            sw,
            sh
        )));
    }

    let span = |d: usize, dn: usize, sn: usize| {
        let start = d * sn / dn;
        let end = ((d + 1) * sn / dn).max(start + 1);
        start..end
    };

    let mut out = Vec::with_capacity(dw * dh);
    for dy in 0..dh {
        let rows = span(dy, dh, sh);
        for dx in 0..dw {
            let cols = span(dx, dw, sw);
            let (mut r, mut g, mut b, mut n) = (0u32, 0u32, 0u32, 0u32);
            for sy in rows.clone() {
                let row = &src.data[sy * src.stride..];
                for sx in cols.clone() {
                    let px = &row[sx * 4..sx * 4 + 4];
                    r += u32::from(px[ro]);
                    g += u32::from(px[go]);
                    b += u32::from(px[bo]);
                    n += 1;
                }
            }
            out.push([
                ((r + n / 2) / n) as u8,
                ((g + n / 2) / n) as u8,
                ((b + n / 2) / n) as u8,
            ]);
        }
    }
    Ok(out)
}

/// Convert (and downscale) packed RGB into a planar surface.
pub fn convert_to_planar(src: &PackedRgb<'_>, dst: &mut PlanarTarget<'_>) -> Result<()> {
    let (w, h) = (dst.width as usize, dst.height as usize);
    let pitch = dst.pitch;
    let plane = pitch * dst.plane_rows as usize;
    if pitch < w || (dst.plane_rows as usize) < h {
        return Err(CodecError::protocol(
            "colorspace conversion",
            format!("pitch {pitch} / plane rows {} too small for {w}x{h}", dst.plane_rows),
        ));
    }
    let planes = dst.format.plane_count();
    if dst.data.len() < plane * planes.saturating_sub(1) + pitch * h {
        return Err(CodecError::protocol("colorspace conversion", "destination too small"));
    }

    let rgb = resample(src, dst.width, dst.height)?;
    let at = |x: usize, y: usize| rgb[y * w + x];

    match dst.format {
        PixelFormat::Gbrp => {
            for y in 0..h {
                for x in 0..w {
                    let [r, g, b] = at(x, y);
                    let i = y * pitch + x;
                    dst.data[i] = g;
                    dst.data[plane + i] = b;
                    dst.data[2 * plane + i] = r;
                }
            }
        }
        PixelFormat::Yuv444p => {
            for y in 0..h {
                for x in 0..w {
                    let [r, g, b] = at(x, y).map(i32::from);
                    let i = y * pitch + x;
                    dst.data[i] = rgb_to_y(r, g, b);
                    dst.data[plane + i] = rgb_to_u(r, g, b);
                    dst.data[2 * plane + i] = rgb_to_v(r, g, b);
                }
            }
        }
        PixelFormat::Nv12 => {
            for y in 0..h {
                for x in 0..w {
                    let [r, g, b] = at(x, y).map(i32::from);
                    dst.data[y * pitch + x] = rgb_to_y(r, g, b);
                }
            }
            // Chroma subsampled 2x2
            for y in (0..h).step_by(2) {
                for x in (0..w).step_by(2) {
                    let (mut r, mut g, mut b) = (0i32, 0i32, 0i32);
                    for dy in 0..2 {
                        for dx in 0..2 {
                            let [pr, pg, pb] = at((x + dx).min(w - 1), (y + dy).min(h - 1));
                            r += i32::from(pr);
                            g += i32::from(pg);
                            b += i32::from(pb);
                        }
                    }
                    let (r, g, b) = (r / 4, g / 4, b / 4);
                    let i = plane + (y / 2) * pitch + (x / 2) * 2;
                    dst.data[i] = rgb_to_u(r, g, b);
                    if i + 1 < dst.data.len() {
                        dst.data[i + 1] = rgb_to_v(r, g, b);
                    }
                }
            }
        }
        other => {
            return Err(CodecError::unsupported_format(format!(
                "cannot convert into {other}"
            )))
        }
    }
    Ok(())
}

/// Convert a planar surface back to packed BGRX.
pub fn planar_to_bgrx(src: &[u8], layout: &SurfaceLayout, dst: &mut [u8], dst_stride: usize) -> Result<()> {
    let (w, h) = (layout.width as usize, layout.height as usize);
    if dst_stride < w * 4 || dst.len() < dst_stride * h.saturating_sub(1) + w * 4 {
        return Err(CodecError::invalid_image("BGRX destination too small"));
    }
    if src.len() < layout.byte_len() {
        return Err(CodecError::invalid_image("surface smaller than its layout"));
    }
    let sample = |plane: usize, x: usize, y: usize| src[layout.offsets[plane] + y * layout.strides[plane] + x];

    for y in 0..h {
        for x in 0..w {
            let [r, g, b] = match layout.format {
                PixelFormat::Gbrp => [sample(2, x, y), sample(0, x, y), sample(1, x, y)],
                PixelFormat::Yuv444p => yuv_to_rgb(sample(0, x, y), sample(1, x, y), sample(2, x, y)),
                PixelFormat::Nv12 => {
                    let cx = (x / 2) * 2;
                    yuv_to_rgb(sample(0, x, y), sample(1, cx, y / 2), sample(1, cx + 1, y / 2))
                }
                other => {
                    return Err(CodecError::unsupported_format(format!(
                        "cannot read back {other}"
                    )))
                }
            };
            let o = y * dst_stride + x * 4;
            dst[o..o + 4].copy_from_slice(&[b, g, r, 255]);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient(w: usize, h: usize, stride: usize) -> Vec<u8> {
        let mut data = vec![0u8; stride * h];
        for y in 0..h {
            for x in 0..w {
                let o = y * stride + x * 4;
                data[o] = (x * 7 + y) as u8;
                data[o + 1] = (y * 5 + 3) as u8;
                data[o + 2] = (x * 11 + y * 13) as u8;
                data[o + 3] = 0;
            }
        }
        data
    }

    fn convert(src: &[u8], stride: usize, w: u32, h: u32, format: PixelFormat, pitch: usize) -> Vec<u8> {
        let mut out = vec![0u8; pitch * h as usize * 3];
        let mut dst = PlanarTarget { data: &mut out, pitch, format, width: w, height: h, plane_rows: h };
        let src = PackedRgb { data: src, stride, format: PixelFormat::Bgrx, width: w, height: h };
        convert_to_planar(&src, &mut dst).unwrap();
        out
    }

    #[test]
    fn test_red_to_y() {
        // Y for pure red is around 82 in BT.601
        let y = rgb_to_y(255, 0, 0);
        assert!(y > 60 && y < 100);
        assert_eq!(rgb_to_y(0, 0, 0), 16);
        assert_eq!(rgb_to_y(255, 255, 255), 235);
    }

    #[test]
    fn test_gbrp_round_trip_is_exact() {
        let (w, h, stride, pitch) = (13usize, 7usize, 13 * 4 + 12, 32usize);
        let src = gradient(w, h, stride);
        let planes = convert(&src, stride, w as u32, h as u32, PixelFormat::Gbrp, pitch);
        let layout = SurfaceLayout::planar(PixelFormat::Gbrp, w as u32, h as u32, pitch);
        let mut back = vec![0u8; w * 4 * h];
        planar_to_bgrx(&planes, &layout, &mut back, w * 4).unwrap();
        for y in 0..h {
            for x in 0..w {
                let s = &src[y * stride + x * 4..y * stride + x * 4 + 3];
                let d = &back[(y * w + x) * 4..(y * w + x) * 4 + 3];
                assert_eq!(s, d, "pixel {x},{y}");
            }
        }
    }

    #[test]
    fn test_yuv444_round_trip_is_close() {
        let (w, h) = (8usize, 8usize);
        let src = gradient(w, h, w * 4);
        let planes = convert(&src, w * 4, w as u32, h as u32, PixelFormat::Yuv444p, w);
        let layout = SurfaceLayout::planar(PixelFormat::Yuv444p, w as u32, h as u32, w);
        let mut back = vec![0u8; w * 4 * h];
        planar_to_bgrx(&planes, &layout, &mut back, w * 4).unwrap();
        for (s, d) in src.chunks(4).zip(back.chunks(4)) {
            for c in 0..3 {
                assert!((i32::from(s[c]) - i32::from(d[c])).abs() <= 4);
            }
        }
    }

    #[test]
    fn test_nv12_flat_grey() {
        let (w, h) = (4usize, 4usize);
        let src = vec![128u8; w * h * 4];
        let planes = convert(&src, w * 4, w as u32, h as u32, PixelFormat::Nv12, w);
        assert!(planes[..w * h].iter().all(|&y| y == rgb_to_y(128, 128, 128)));
        assert_eq!(planes[w * h], 128);
        assert_eq!(planes[w * h + 1], 128);
    }

    #[test]
    fn test_downscale_averages() {
        // 4x2 -> 2x1: each output pixel averages a 2x2 block
        let mut src = vec![0u8; 4 * 4 * 2];
        for (i, px) in src.chunks_mut(4).enumerate() {
            px[1] = if i % 2 == 0 { 100 } else { 200 };
        }
        let mut out = vec![0u8; 2 * 3];
        let mut dst = PlanarTarget { data: &mut out, pitch: 2, format: PixelFormat::Gbrp, width: 2, height: 1, plane_rows: 1 };
        let src = PackedRgb { data: &src, stride: 16, format: PixelFormat::Bgrx, width: 4, height: 2 };
        convert_to_planar(&src, &mut dst).unwrap();
        assert_eq!(&out[..2], &[150, 150]);
    }

    #[test]
    fn test_short_source_rejected() {
        let src = vec![0u8; 10];
        let mut out = vec![0u8; 64];
        let mut dst = PlanarTarget { data: &mut out, pitch: 4, format: PixelFormat::Gbrp, width: 4, height: 4, plane_rows: 4 };
        let src = PackedRgb { data: &src, stride: 16, format: PixelFormat::Bgrx, width: 4, height: 4 };
        assert!(convert_to_planar(&src, &mut dst).is_err());
    }
}
