//! Error types for accelerated codec sessions.

use thiserror::Error;

use crate::failure::FailureClass;
use crate::types::Codec;

/// Errors raised by devices, contexts, buffers and codec sessions.
///
/// Native status codes never appear here: the driver layer translates them
/// through [`crate::failure::translate`] and only symbolic names survive in
/// the messages.
#[derive(Debug, Clone, Error)]
pub enum CodecError {
    /// The device has no room for another context or encoder session.
    #[error("device {device} has no free context slots")]
    ContextExhausted { device: u32 },

    /// The device ran out of memory or launch resources.
    #[error("out of device resources during {op}: {detail}")]
    OutOfResources { op: &'static str, detail: String },

    /// A non-blocking resource was busy.
    #[error("resource busy during {op}")]
    Busy { op: &'static str },

    /// The driver is in a state only a fresh session can recover from.
    #[error("driver fault during {op}: {detail}")]
    DriverFault { op: &'static str, detail: String },

    /// No device satisfies the requested capability.
    #[error("no usable device: {0}")]
    NoDevice(String),

    /// The codec is not available on the selected device.
    #[error("codec {0} is not supported")]
    UnsupportedCodec(Codec),

    /// Neither the standard nor the extended pixel layout is usable.
    #[error("unsupported pixel format: {0}")]
    UnsupportedFormat(String),

    /// No preset survived filtering on the device.
    #[error("no matching preset for {codec}")]
    NoMatchingPreset { codec: Codec },

    /// Frame dimensions outside the device limits.
    #[error("invalid frame dimensions: {width}x{height}")]
    InvalidDimensions { width: u32, height: u32 },

    /// Other configuration rejected by the device.
    #[error("configuration rejected: {0}")]
    Configuration(String),

    /// Operation on a closed session.
    #[error("session is closed")]
    SessionClosed,

    /// Operation not legal in the current session state.
    #[error("invalid session state: expected {expected}, found {actual}")]
    InvalidState {
        expected: &'static str,
        actual: &'static str,
    },

    /// A context-bound operation ran without the context being current.
    #[error("context {0} is not current on this thread")]
    ContextNotCurrent(u64),

    /// A second context was acquired while another is current on this thread.
    #[error("context {current} is already current on this thread")]
    ContextAlreadyCurrent { current: u64 },

    /// The caller handed in an unusable image.
    #[error("invalid image: {0}")]
    InvalidImage(String),

    /// The native API was driven out of order.
    #[error("protocol error during {op}: {detail}")]
    Protocol { op: &'static str, detail: String },

    /// A bitstream could not be decoded.
    #[error("decode failed: {0}")]
    DecodeFailed(String),

    /// The driver rejected the client because of licensing or API version.
    #[error("driver license or version error: {0}")]
    LicenseOrVersion(String),
}

impl CodecError {
    /// Create a Configuration error with a message.
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create an UnsupportedFormat error with a message.
    pub fn unsupported_format(msg: impl Into<String>) -> Self {
        Self::UnsupportedFormat(msg.into())
    }

    /// Create an InvalidImage error with a message.
    pub fn invalid_image(msg: impl Into<String>) -> Self {
        Self::InvalidImage(msg.into())
    }

    /// Create a Protocol error for an operation.
    pub fn protocol(op: &'static str, detail: impl Into<String>) -> Self {
        Self::Protocol {
            op,
            detail: detail.into(),
        }
    }

    /// The recovery class of this error.
    #[must_use]
    pub fn class(&self) -> FailureClass {
        match self {
            Self::ContextExhausted { .. } | Self::OutOfResources { .. } | Self::Busy { .. } => {
                FailureClass::Transient
            }
            Self::DriverFault { .. } => FailureClass::Reinit,
            Self::NoDevice(_)
            | Self::UnsupportedCodec(_)
            | Self::UnsupportedFormat(_)
            | Self::NoMatchingPreset { .. }
            | Self::InvalidDimensions { .. }
            | Self::Configuration(_) => FailureClass::Configuration,
            Self::SessionClosed
            | Self::InvalidState { .. }
            | Self::ContextNotCurrent(_)
            | Self::ContextAlreadyCurrent { .. }
            | Self::InvalidImage(_)
            | Self::Protocol { .. } => FailureClass::Protocol,
            Self::DecodeFailed(_) => FailureClass::DecodeFailure,
            Self::LicenseOrVersion(_) => FailureClass::Fatal,
        }
    }

    /// True for errors worth retrying later with the same parameters.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        self.class() == FailureClass::Transient
    }
}

/// Result alias used throughout the crate.
pub type Result<T, E = CodecError> = std::result::Result<T, E>;
