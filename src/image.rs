//! Images handed to and returned from codec sessions.

use crate::error::{CodecError, Result};
use crate::types::PixelFormat;

/// Trait for types that can provide image pixels to an encoder.
///
/// Packed formats expose a single plane; planar formats expose one slice per
/// plane, each with its own row stride.
pub trait ImageSource: Send {
    /// Returns the image width in pixels.
    fn width(&self) -> u32;

    /// Returns the image height in pixels.
    fn height(&self) -> u32;

    /// Returns the pixel format of the image.
    fn pixel_format(&self) -> PixelFormat;

    /// Returns the pixel data of the first plane.
    fn pixels(&self) -> &[u8];

    /// Returns the row stride of the first plane in bytes.
    fn rowstride(&self) -> usize;

    /// Returns every plane as `(data, stride)`.
    fn planes(&self) -> Vec<(&[u8], usize)> {
        vec![(self.pixels(), self.rowstride())]
    }

    /// Returns the capture timestamp in milliseconds.
    fn timestamp_ms(&self) -> u64;
}

/// An owned image, either packed or planar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageWrapper {
    width: u32,
    height: u32,
    format: PixelFormat,
    planes: Vec<Vec<u8>>,
    strides: Vec<usize>,
    timestamp_ms: u64,
}

impl ImageWrapper {
    /// Wrap packed 32-bit pixels.
    pub fn packed(
        width: u32,
        height: u32,
        format: PixelFormat,
        rowstride: usize,
        data: Vec<u8>,
    ) -> Result<Self> {
        if !format.is_packed_rgb() {
            return Err(CodecError::unsupported_format(format!("{format} is not a packed format")));
        }
        let image = Self {
            width,
            height,
            format,
            planes: vec![data],
            strides: vec![rowstride],
            timestamp_ms: 0,
        };
        image.validate()?;
        Ok(image)
    }

    /// Wrap planar pixels, one buffer and stride per plane.
    pub fn planar(
        width: u32,
        height: u32,
        format: PixelFormat,
        planes: Vec<Vec<u8>>,
        strides: Vec<usize>,
    ) -> Result<Self> {
        if !format.is_planar() {
            return Err(CodecError::unsupported_format(format!("{format} is not a planar format")));
        }
        let image = Self {
            width,
            height,
            format,
            planes,
            strides,
            timestamp_ms: 0,
        };
        image.validate()?;
        Ok(image)
    }

    /// Set the capture timestamp.
    #[must_use]
    pub fn with_timestamp(mut self, timestamp_ms: u64) -> Self {
        self.timestamp_ms = timestamp_ms;
        self
    }

    /// Bytes per row and rows of plane `index`.
    fn plane_extent(&self, index: usize) -> (usize, usize) {
        let (w, h) = (self.width as usize, self.height as usize);
        match (self.format, index) {
            (f, _) if f.is_packed_rgb() => (w * 4, h),
            (PixelFormat::Nv12, 1) => (w.next_multiple_of(2), h.div_ceil(2)),
            _ => (w, h),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(CodecError::InvalidDimensions {
                width: self.width,
                height: self.height,
            });
        }
        let count = self.format.plane_count();
        if self.planes.len() != count || self.strides.len() != count {
            return Err(CodecError::invalid_image(format!(
                "{} needs {} planes, got {}",
                self.format,
                count,
                self.planes.len()
            )));
        }
        for (i, (plane, &stride)) in self.planes.iter().zip(&self.strides).enumerate() {
            let (row, rows) = self.plane_extent(i);
            if stride < row || plane.len() < stride * (rows - 1) + row {
                return Err(CodecError::invalid_image(format!(
                    "plane {i}: {} bytes with stride {stride} cannot hold {rows} rows of {row} bytes",
                    plane.len()
                )));
            }
        }
        Ok(())
    }

    /// Plane `index` and its stride.
    #[must_use]
    pub fn plane(&self, index: usize) -> Option<(&[u8], usize)> {
        Some((self.planes.get(index)?.as_slice(), *self.strides.get(index)?))
    }

    /// Pixel bytes of a packed image at `(x, y)`.
    #[must_use]
    pub fn pixel(&self, x: u32, y: u32) -> Option<&[u8]> {
        if !self.format.is_packed_rgb() || x >= self.width || y >= self.height {
            return None;
        }
        let o = y as usize * self.strides[0] + x as usize * 4;
        self.planes[0].get(o..o + 4)
    }

    /// Consume the image and return its planes.
    #[must_use]
    pub fn into_planes(self) -> Vec<Vec<u8>> {
        self.planes
    }
}

impl ImageSource for ImageWrapper {
    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn pixel_format(&self) -> PixelFormat {
        self.format
    }

    fn pixels(&self) -> &[u8] {
        &self.planes[0]
    }

    fn rowstride(&self) -> usize {
        self.strides[0]
    }

    fn planes(&self) -> Vec<(&[u8], usize)> {
        self.planes
            .iter()
            .map(Vec::as_slice)
            .zip(self.strides.iter().copied())
            .collect()
    }

    fn timestamp_ms(&self) -> u64 {
        self.timestamp_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packed_validation() {
        assert!(ImageWrapper::packed(4, 2, PixelFormat::Bgrx, 16, vec![0; 32]).is_ok());
        // Last row does not need the padding
        assert!(ImageWrapper::packed(4, 2, PixelFormat::Bgrx, 20, vec![0; 36]).is_ok());
        assert!(ImageWrapper::packed(4, 2, PixelFormat::Bgrx, 12, vec![0; 32]).is_err());
        assert!(ImageWrapper::packed(4, 2, PixelFormat::Bgrx, 16, vec![0; 31]).is_err());
        assert!(ImageWrapper::packed(4, 2, PixelFormat::Nv12, 16, vec![0; 32]).is_err());
        assert!(matches!(
            ImageWrapper::packed(0, 2, PixelFormat::Bgrx, 16, vec![0; 32]),
            Err(CodecError::InvalidDimensions { .. })
        ));
    }

    #[test]
    fn test_planar_planes() {
        let image = ImageWrapper::planar(
            3,
            3,
            PixelFormat::Nv12,
            vec![vec![1; 9], vec![2; 8]],
            vec![3, 4],
        )
        .unwrap();
        assert_eq!(image.planes().len(), 2);
        assert_eq!(image.plane(1), Some((&[2u8; 8][..], 4)));
        assert!(ImageWrapper::planar(3, 3, PixelFormat::Gbrp, vec![vec![0; 9]], vec![3]).is_err());
    }

    #[test]
    fn test_pixel_access() {
        let mut data = vec![0u8; 32];
        data[20..24].copy_from_slice(&[1, 2, 3, 4]);
        let image = ImageWrapper::packed(4, 2, PixelFormat::Bgrx, 16, data)
            .unwrap()
            .with_timestamp(9);
        assert_eq!(image.pixel(1, 1), Some(&[1u8, 2, 3, 4][..]));
        assert_eq!(image.pixel(4, 0), None);
        assert_eq!(image.timestamp_ms(), 9);
    }
}
