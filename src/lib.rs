//! Accelerated video codec sessions for remote display.
//!
//! This crate manages hardware encode and decode sessions on accelerator
//! devices for a remote-display server: it picks a device, owns one context
//! per session, registers the upload buffers with the encoder, negotiates
//! pixel layout, preset and profile from speed/quality targets, and keeps
//! decoded frames valid for as long as callers hold them.
//!
//! Backends:
//!
//! - **Emulated** (always built): an in-process accelerator that follows the
//!   same call protocol as the hardware. Used by the tests and by
//!   `accel-info` when no GPU is present.
//! - **NVIDIA NVENC/NVDEC** (`nvidia` feature): CUDA driver API, NVENC and
//!   NVDEC.
//!
//! # Quick Start (Encoding)
//!
//! ```ignore
//! use std::sync::Arc;
//! use accelcodec::{AccelConfig, DeviceRegistry, EncodeParams, EncodeSession};
//!
//! let driver = accelcodec::driver::hardware_driver().expect("no GPU");
//! let registry = Arc::new(DeviceRegistry::new(driver, AccelConfig::load()?));
//! accelcodec::init_module(&registry)?;
//!
//! let mut session = EncodeSession::new(registry);
//! session.init(EncodeParams::new(1920, 1080).quality(80).speed(50))?;
//! let frame = session.process(&image)?;
//! // frame.data is the compressed access unit,
//! // frame.metadata.client_options() the attributes sent along with it
//! ```
//!
//! # Quick Start (Decoding)
//!
//! ```ignore
//! use accelcodec::{Codec, DecodeParams, DecodeSession};
//!
//! let mut session = DecodeSession::new(registry);
//! session.init(DecodeParams::new(Codec::H264, 1920, 1080))?;
//! if let Some(image) = session.process(&packet)? {
//!     let bgrx = image.to_bgrx()?;
//! }
//! ```
//!
//! # Feature Flags
//!
//! - `nvidia` - Enable the NVIDIA NVENC/NVDEC backend (requires CUDA)

pub mod buffer;
pub mod config;
pub mod context;
pub mod csc;
pub mod driver;
mod error;
pub mod failure;
pub mod image;
pub mod negotiate;
pub mod ownership;
pub mod probe;
pub mod registry;
pub mod session;
mod types;

pub use config::{AccelConfig, ConfigError};
pub use context::SessionContext;
pub use error::{CodecError, Result};
pub use failure::FailureClass;
pub use image::{ImageSource, ImageWrapper};
pub use negotiate::{Negotiated, PresetNegotiator};
pub use ownership::{DecodedImage, FrameOwnershipTracker};
pub use probe::{init_module, reprobe, ProbeReport};
pub use registry::{DeviceRegistry, FeatureFlags};
pub use session::{
    damp_quality, DecodeInfo, DecodeSession, EncodeInfo, EncodeSession, EncodedFrame, FrameMetadata,
    SessionState,
};
pub use types::{
    padded_dimensions, roundup, Codec, DecodeParams, EncodeParams, EncoderPreset, PixelFormat,
    PixelLayout, Preset, Profile, Scaling, TuningMode, DIMENSION_ALIGNMENT,
};
