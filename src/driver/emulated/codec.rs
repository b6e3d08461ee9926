//! Bitstream format of the emulated encoder.
//!
//! Each access unit carries a fixed header followed by a PackBits-compressed
//! payload. Keyframes carry the quantised planes; inter frames carry the XOR
//! against the previous reconstruction, so the decoder needs the whole chain
//! since the last keyframe. A checksum over the payload catches corruption.

use crate::types::{Codec, PixelFormat};

const MAGIC: &[u8; 4] = b"AXV1";
const HEADER_LEN: usize = 4 + 4 + 4 + 4 + 8 + 4 + 4;

const FLAG_KEYFRAME: u8 = 1;
const FLAG_LOSSLESS: u8 = 2;

/// Header of one encoded picture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub codec: Codec,
    pub format: PixelFormat,
    pub keyframe: bool,
    pub lossless: bool,
    pub shift: u8,
    pub width: u32,
    pub height: u32,
    pub frame: u32,
    pub pts: u64,
}

fn codec_id(codec: Codec) -> u8 {
    match codec {
        Codec::H264 => 1,
        Codec::Hevc => 2,
        Codec::Av1 => 3,
    }
}

fn codec_from_id(id: u8) -> Option<Codec> {
    match id {
        1 => Some(Codec::H264),
        2 => Some(Codec::Hevc),
        3 => Some(Codec::Av1),
        _ => None,
    }
}

fn format_id(format: PixelFormat) -> u8 {
    match format {
        PixelFormat::Nv12 => 1,
        PixelFormat::Yuv444p => 2,
        PixelFormat::Gbrp => 3,
        _ => 0,
    }
}

fn format_from_id(id: u8) -> Option<PixelFormat> {
    match id {
        1 => Some(PixelFormat::Nv12),
        2 => Some(PixelFormat::Yuv444p),
        3 => Some(PixelFormat::Gbrp),
        _ => None,
    }
}

/// Bytes of tightly packed planes for a surface format.
#[must_use]
pub fn tight_len(format: PixelFormat, width: u32, height: u32) -> usize {
    let (w, h) = (width as usize, height as usize);
    match format {
        PixelFormat::Nv12 => w * h + w.next_multiple_of(2) * h.div_ceil(2),
        _ => w * h * 3,
    }
}

/// Quantisation step for a quality target; 0 keeps every bit.
#[must_use]
pub fn quant_shift(quality: u8, lossless: bool) -> u8 {
    if lossless {
        return 0;
    }
    match quality {
        90..=u8::MAX => 0,
        70..=89 => 1,
        40..=69 => 2,
        20..=39 => 3,
        _ => 4,
    }
}

fn fnv1a(data: &[u8]) -> u32 {
    data.iter().fold(0x811c_9dc5u32, |hash, &b| {
        (hash ^ u32::from(b)).wrapping_mul(0x0100_0193)
    })
}

/// PackBits run-length encoding.
#[must_use]
pub fn rle_encode(data: &[u8]) -> Vec<u8> {
    let n = data.len();
    let mut out = Vec::with_capacity(n / 2 + 16);
    let mut i = 0;
    while i < n {
        let mut run = 1;
        while i + run < n && run < 128 && data[i + run] == data[i] {
            run += 1;
        }
        if run >= 3 {
            out.push((257 - run) as u8);
            out.push(data[i]);
            i += run;
            continue;
        }
        let start = i;
        let mut len = 0;
        while i < n && len < 128 {
            let mut r = 1;
            while i + r < n && r < 3 && data[i + r] == data[i] {
                r += 1;
            }
            if r >= 3 {
                break;
            }
            i += 1;
            len += 1;
        }
        out.push((len - 1) as u8);
        out.extend_from_slice(&data[start..start + len]);
    }
    out
}

/// Most bytes one input byte can expand to: a two-byte run of 128.
const MAX_EXPANSION: usize = 64;

/// Inverse of [`rle_encode`]; `None` unless exactly `expected` bytes come out.
#[must_use]
pub fn rle_decode(data: &[u8], expected: usize) -> Option<Vec<u8>> {
    // `expected` comes from an untrusted header.
    if expected > data.len().saturating_mul(MAX_EXPANSION) {
        return None;
    }
    let mut out = Vec::with_capacity(expected);
    let mut i = 0;
    while i < data.len() {
        let header = data[i];
        i += 1;
        match header {
            0..=127 => {
                let len = usize::from(header) + 1;
                out.extend_from_slice(data.get(i..i + len)?);
                i += len;
            }
            128 => {}
            _ => {
                let run = 257 - usize::from(header);
                let value = *data.get(i)?;
                out.resize(out.len() + run, value);
                i += 1;
            }
        }
        if out.len() > expected {
            return None;
        }
    }
    (out.len() == expected).then_some(out)
}

/// One picture handed to [`StreamEncoder::encode`].
#[derive(Debug, Clone, Copy)]
pub struct Picture<'a> {
    pub codec: Codec,
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    pub planes: &'a [u8],
    pub quality: u8,
    pub lossless: bool,
    pub force_idr: bool,
    pub pts: u64,
}

/// Encoder side: keeps the reconstruction of the last picture.
#[derive(Debug, Default)]
pub struct StreamEncoder {
    reference: Option<(FrameHeader, Vec<u8>)>,
    frames: u32,
}

impl StreamEncoder {
    /// Encode tight planes. Returns the access unit and whether it is a keyframe.
    pub fn encode(&mut self, picture: &Picture<'_>) -> (Vec<u8>, bool) {
        let Picture {
            codec,
            format,
            width,
            height,
            planes,
            quality,
            lossless,
            force_idr,
            pts,
        } = *picture;
        let shift = quant_shift(quality, lossless);
        let recon: Vec<u8> = if shift == 0 {
            planes.to_vec()
        } else {
            let bias = 1u8 << (shift - 1);
            planes.iter().map(|&v| ((v >> shift) << shift) | bias).collect()
        };

        let compatible = self.reference.as_ref().is_some_and(|(h, r)| {
            h.format == format && h.width == width && h.height == height && r.len() == recon.len()
        });
        let keyframe = force_idr || !compatible;

        let payload = match (&self.reference, keyframe) {
            (Some((_, prev)), false) => recon.iter().zip(prev).map(|(a, b)| a ^ b).collect(),
            _ => recon.clone(),
        };
        let payload = rle_encode(&payload);

        let header = FrameHeader {
            codec,
            format,
            keyframe,
            lossless,
            shift,
            width,
            height,
            frame: self.frames,
            pts,
        };
        self.frames = self.frames.wrapping_add(1);
        self.reference = Some((header, recon));
        (write_unit(&header, &payload), keyframe)
    }
}

fn write_unit(header: &FrameHeader, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.extend_from_slice(MAGIC);
    let mut flags = 0;
    if header.keyframe {
        flags |= FLAG_KEYFRAME;
    }
    if header.lossless {
        flags |= FLAG_LOSSLESS;
    }
    out.extend_from_slice(&[codec_id(header.codec), format_id(header.format), flags, header.shift]);
    out.extend_from_slice(&(header.width as u16).to_le_bytes());
    out.extend_from_slice(&(header.height as u16).to_le_bytes());
    out.extend_from_slice(&header.frame.to_le_bytes());
    out.extend_from_slice(&header.pts.to_le_bytes());
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(&fnv1a(payload).to_le_bytes());
    out.extend_from_slice(payload);
    out
}

/// Why an access unit was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamError {
    Truncated,
    BadMagic,
    BadHeader,
    Checksum,
    WrongCodec,
    MissingReference,
    Payload,
}

fn parse_header(data: &[u8]) -> Result<(FrameHeader, &[u8]), StreamError> {
    if data.len() < HEADER_LEN {
        return Err(StreamError::Truncated);
    }
    if &data[..4] != MAGIC {
        return Err(StreamError::BadMagic);
    }
    let u16_at = |o: usize| u16::from_le_bytes([data[o], data[o + 1]]);
    let u32_at = |o: usize| u32::from_le_bytes([data[o], data[o + 1], data[o + 2], data[o + 3]]);
    let codec = codec_from_id(data[4]).ok_or(StreamError::BadHeader)?;
    let format = format_from_id(data[5]).ok_or(StreamError::BadHeader)?;
    let flags = data[6];
    let shift = data[7];
    if shift > 7 {
        return Err(StreamError::BadHeader);
    }
    let width = u32::from(u16_at(8));
    let height = u32::from(u16_at(10));
    if width == 0 || height == 0 {
        return Err(StreamError::BadHeader);
    }
    let frame = u32_at(12);
    let mut pts = [0u8; 8];
    pts.copy_from_slice(&data[16..24]);
    let payload_len = u32_at(24) as usize;
    let checksum = u32_at(28);
    let payload = data
        .get(HEADER_LEN..HEADER_LEN + payload_len)
        .ok_or(StreamError::Truncated)?;
    if fnv1a(payload) != checksum {
        return Err(StreamError::Checksum);
    }
    Ok((
        FrameHeader {
            codec,
            format,
            keyframe: flags & FLAG_KEYFRAME != 0,
            lossless: flags & FLAG_LOSSLESS != 0,
            shift,
            width,
            height,
            frame,
            pts: u64::from_le_bytes(pts),
        },
        payload,
    ))
}

/// Decoder side: keeps the last reconstructed picture.
#[derive(Debug)]
pub struct StreamDecoder {
    codec: Codec,
    reference: Option<(FrameHeader, Vec<u8>)>,
}

impl StreamDecoder {
    #[must_use]
    pub fn new(codec: Codec) -> Self {
        Self { codec, reference: None }
    }

    /// Decode one access unit into tight planes.
    pub fn decode(&mut self, data: &[u8]) -> Result<(FrameHeader, &[u8]), StreamError> {
        let (header, payload) = parse_header(data)?;
        if header.codec != self.codec {
            return Err(StreamError::WrongCodec);
        }
        let expected = tight_len(header.format, header.width, header.height);
        let mut planes = rle_decode(payload, expected).ok_or(StreamError::Payload)?;
        if !header.keyframe {
            let (prev_header, prev) = self.reference.as_ref().ok_or(StreamError::MissingReference)?;
            if prev_header.format != header.format
                || prev_header.width != header.width
                || prev_header.height != header.height
            {
                return Err(StreamError::MissingReference);
            }
            planes.iter_mut().zip(prev).for_each(|(a, b)| *a ^= b);
        }
        self.reference = Some((header, planes));
        let (header, planes) = self.reference.as_ref().ok_or(StreamError::MissingReference)?;
        Ok((*header, planes.as_slice()))
    }

    /// Forget the reference picture after a failure.
    pub fn reset(&mut self) {
        self.reference = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rle() {
        let samples: [&[u8]; 5] = [
            &[],
            &[1],
            &[5, 5, 5, 5, 5, 5, 1, 2, 3, 3, 3, 4],
            &[7; 300],
            &[1, 2, 1, 2, 1, 2, 9, 9],
        ];
        for s in samples {
            assert_eq!(rle_decode(&rle_encode(s), s.len()).as_deref(), Some(s));
        }
        assert!(rle_encode(&[0u8; 1000]).len() < 20);
        assert_eq!(rle_decode(&[3, 1], 4), None);
    }

    #[test]
    fn test_rle_rejects_impossible_lengths() {
        assert_eq!(rle_decode(&[129, 7], usize::MAX), None);
        assert_eq!(rle_decode(&[], 1 << 40), None);
        assert_eq!(rle_decode(&[129, 7], 129), None);
        // A maximal run is exactly at the bound.
        assert_eq!(rle_decode(&[129, 7], 128), Some(vec![7; 128]));
    }

    fn planes(w: u32, h: u32, seed: u8) -> Vec<u8> {
        (0..tight_len(PixelFormat::Gbrp, w, h))
            .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
            .collect()
    }

    fn gbrp(width: u32, height: u32, planes: &[u8], force_idr: bool, pts: u64) -> Picture<'_> {
        Picture {
            codec: Codec::H264,
            format: PixelFormat::Gbrp,
            width,
            height,
            planes,
            quality: 100,
            lossless: true,
            force_idr,
            pts,
        }
    }

    #[test]
    fn test_lossless_chain() {
        let mut enc = StreamEncoder::default();
        let mut dec = StreamDecoder::new(Codec::H264);
        for (i, seed) in [0u8, 1, 1, 9].into_iter().enumerate() {
            let input = planes(16, 8, seed);
            let (unit, key) = enc.encode(&gbrp(16, 8, &input, false, i as u64));
            assert_eq!(key, i == 0);
            let (header, out) = dec.decode(&unit).unwrap();
            assert_eq!(header.pts, i as u64);
            assert_eq!(out, input.as_slice());
        }
    }

    #[test]
    fn test_lossy_quantises() {
        let mut enc = StreamEncoder::default();
        let mut dec = StreamDecoder::new(Codec::Hevc);
        let input = planes(8, 8, 3);
        let (unit, _) = enc.encode(&Picture {
            codec: Codec::Hevc,
            format: PixelFormat::Yuv444p,
            quality: 30,
            lossless: false,
            force_idr: true,
            ..gbrp(8, 8, &input, false, 0)
        });
        let (header, out) = dec.decode(&unit).unwrap();
        assert_eq!(header.shift, 3);
        for (a, b) in input.iter().zip(out) {
            assert!((i32::from(*a) - i32::from(*b)).abs() <= 8);
        }
    }

    #[test]
    fn test_corruption_detected() {
        let mut enc = StreamEncoder::default();
        let grey = vec![16u8; tight_len(PixelFormat::Nv12, 8, 8)];
        let (mut unit, _) = enc.encode(&Picture {
            format: PixelFormat::Nv12,
            quality: 50,
            lossless: false,
            ..gbrp(8, 8, &grey, true, 0)
        });
        let last = unit.len() - 1;
        unit[last] ^= 0xff;
        let mut dec = StreamDecoder::new(Codec::H264);
        assert_eq!(dec.decode(&unit).unwrap_err(), StreamError::Checksum);
        assert_eq!(dec.decode(b"garbage").unwrap_err(), StreamError::Truncated);
        assert_eq!(dec.decode(&[0u8; 64]).unwrap_err(), StreamError::BadMagic);
    }

    #[test]
    fn test_inter_frame_needs_reference() {
        let mut enc = StreamEncoder::default();
        let input = planes(8, 4, 0);
        let _ = enc.encode(&gbrp(8, 4, &input, false, 0));
        let (inter, key) = enc.encode(&gbrp(8, 4, &input, false, 1));
        assert!(!key);
        let mut dec = StreamDecoder::new(Codec::H264);
        assert_eq!(dec.decode(&inter).unwrap_err(), StreamError::MissingReference);
    }
}
