//! Codec sessions.
//!
//! A session owns one accelerator context plus everything created on it and
//! moves through `Uninitialized -> Initializing -> Ready -> Encoding/Decoding
//! -> Ready`. `Closed` is final; closing is safe from any state and more than
//! once.

use std::fmt;

use bytes::Bytes;
use serde_json::{json, Map, Value};

mod decoder;
mod encoder;

pub use decoder::{DecodeInfo, DecodeSession};
pub use encoder::{EncodeInfo, EncodeSession};

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Uninitialized,
    Initializing,
    Ready,
    Encoding,
    Decoding,
    Closed,
}

impl SessionState {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Initializing => "initializing",
            Self::Ready => "ready",
            Self::Encoding => "encoding",
            Self::Decoding => "decoding",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Per-frame attributes carried next to the compressed payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameMetadata {
    /// Index of the frame within the session, from 0.
    pub frame: u64,
    /// Milliseconds since the session's first frame.
    pub pts: u64,
    pub speed: u8,
    /// Quality actually delivered.
    pub quality: u8,
    /// Encoded size when the session downscales.
    pub scaled_size: Option<(u32, u32)>,
    pub lossless: bool,
    pub keyframe: bool,
}

impl FrameMetadata {
    /// Attribute map embedded by the protocol layer.
    #[must_use]
    pub fn client_options(&self) -> Map<String, Value> {
        let mut options = Map::new();
        options.insert("frame".into(), json!(self.frame));
        options.insert("pts".into(), json!(self.pts));
        options.insert("speed".into(), json!(self.speed));
        options.insert("quality".into(), json!(self.quality));
        if let Some((w, h)) = self.scaled_size {
            options.insert("scaled_size".into(), json!([w, h]));
        }
        if self.lossless {
            options.insert("lossless".into(), json!(true));
        }
        options
    }
}

/// Output of one encode.
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    pub data: Bytes,
    pub metadata: FrameMetadata,
}

/// Quality to apply next when moving from `current` toward `target`.
///
/// Changes are limited to `step` per call, except that entering or leaving
/// the lossless band (at or above `lossless_threshold`) happens at once.
#[must_use]
pub fn damp_quality(current: u8, target: u8, step: u8, lossless_threshold: u8) -> u8 {
    if (current >= lossless_threshold) != (target >= lossless_threshold) {
        return target;
    }
    if target > current {
        target.min(current.saturating_add(step))
    } else {
        target.max(current.saturating_sub(step))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_damp_quality() {
        assert_eq!(damp_quality(50, 90, 10, 100), 60);
        assert_eq!(damp_quality(50, 45, 10, 100), 45);
        assert_eq!(damp_quality(50, 10, 10, 100), 40);
        // Into and out of the lossless band at once
        assert_eq!(damp_quality(50, 100, 10, 100), 100);
        assert_eq!(damp_quality(100, 40, 10, 100), 40);
        assert_eq!(damp_quality(60, 60, 10, 100), 60);
    }

    #[test]
    fn test_client_options() {
        let metadata = FrameMetadata {
            frame: 3,
            pts: 40,
            speed: 50,
            quality: 80,
            scaled_size: Some((960, 540)),
            lossless: false,
            keyframe: false,
        };
        let options = metadata.client_options();
        assert_eq!(options["frame"], json!(3));
        assert_eq!(options["scaled_size"], json!([960, 540]));
        assert!(!options.contains_key("lossless"));

        let lossless = FrameMetadata {
            scaled_size: None,
            lossless: true,
            ..metadata
        };
        let options = lossless.client_options();
        assert!(!options.contains_key("scaled_size"));
        assert_eq!(options["lossless"], json!(true));
    }
}
