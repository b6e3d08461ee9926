//! Failure classification and the session retry policy.
//!
//! Native status codes are turned into [`CodecError`] values here and only
//! here. Each error then belongs to one [`FailureClass`], which decides how a
//! session reacts: transient failures are reported to the device registry and
//! returned, reinit failures tear the session down and retry the call once,
//! decode failures become "no frame" and everything else is returned as is.

use tracing::warn;

use crate::driver::status::*;
use crate::error::{CodecError, Result};

/// How a failure should be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureClass {
    /// Out of contexts, memory or launch resources; retry later.
    Transient,
    /// Driver state lost; close, re-init and retry the call once.
    Reinit,
    /// Bad device or unsupported parameters; never retried.
    Configuration,
    /// The caller or the session drove the API out of order.
    Protocol,
    /// A corrupt bitstream; the decoder yields no frame.
    DecodeFailure,
    /// License or driver version mismatch; the module must not be used.
    Fatal,
}

/// Native operation a status code came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Enumerate,
    CreateContext,
    PushContext,
    PopContext,
    DestroyContext,
    AllocHost,
    AllocDevice,
    Free,
    Upload,
    Download,
    Convert,
    OpenEncoder,
    QueryCaps,
    InitializeEncoder,
    ReconfigureEncoder,
    CreateBitstream,
    Register,
    Unregister,
    Map,
    Unmap,
    Encode,
    LockBitstream,
    UnlockBitstream,
    DestroyEncoder,
    OpenDecoder,
    Decode,
    DestroyDecoder,
}

impl Operation {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Enumerate => "enumerate",
            Self::CreateContext => "create context",
            Self::PushContext => "push context",
            Self::PopContext => "pop context",
            Self::DestroyContext => "destroy context",
            Self::AllocHost => "allocate host buffer",
            Self::AllocDevice => "allocate device buffer",
            Self::Free => "free buffer",
            Self::Upload => "upload",
            Self::Download => "download",
            Self::Convert => "colorspace conversion",
            Self::OpenEncoder => "open encoder",
            Self::QueryCaps => "query capabilities",
            Self::InitializeEncoder => "initialize encoder",
            Self::ReconfigureEncoder => "reconfigure encoder",
            Self::CreateBitstream => "create bitstream buffer",
            Self::Register => "register resource",
            Self::Unregister => "unregister resource",
            Self::Map => "map input",
            Self::Unmap => "unmap input",
            Self::Encode => "encode picture",
            Self::LockBitstream => "lock bitstream",
            Self::UnlockBitstream => "unlock bitstream",
            Self::DestroyEncoder => "destroy encoder",
            Self::OpenDecoder => "open decoder",
            Self::Decode => "decode",
            Self::DestroyDecoder => "destroy decoder",
        }
    }
}

/// Translate a native status into a crate error.
#[must_use]
pub fn translate(status: NativeStatus, op: Operation) -> CodecError {
    let detail = status.name().to_string();
    let name = op.name();
    match status {
        NativeStatus::Cuda(code) => match code {
            CUDA_ERROR_OUT_OF_MEMORY | CUDA_ERROR_LAUNCH_OUT_OF_RESOURCES => {
                CodecError::OutOfResources { op: name, detail }
            }
            CUDA_ERROR_CONTEXT_ALREADY_IN_USE | CUDA_ERROR_NOT_READY => CodecError::Busy { op: name },
            CUDA_ERROR_INVALID_VALUE if op == Operation::Decode => CodecError::DecodeFailed(detail),
            CUDA_ERROR_INVALID_VALUE
            | CUDA_ERROR_INVALID_HANDLE
            | CUDA_ERROR_INVALID_CONTEXT
            | CUDA_ERROR_ALREADY_MAPPED
            | CUDA_ERROR_NOT_MAPPED => CodecError::Protocol { op: name, detail },
            CUDA_ERROR_NO_DEVICE | CUDA_ERROR_INVALID_DEVICE => CodecError::NoDevice(detail),
            CUDA_ERROR_NOT_SUPPORTED | CUDA_ERROR_INVALID_IMAGE => CodecError::Configuration(
                format!("{detail} during {name}"),
            ),
            CUDA_ERROR_NO_BINARY_FOR_GPU => CodecError::LicenseOrVersion(detail),
            _ => CodecError::DriverFault { op: name, detail },
        },
        NativeStatus::Nvenc(code) => match code {
            NV_ENC_ERR_OUT_OF_MEMORY => CodecError::OutOfResources { op: name, detail },
            NV_ENC_ERR_LOCK_BUSY | NV_ENC_ERR_ENCODER_BUSY => CodecError::Busy { op: name },
            NV_ENC_ERR_NO_ENCODE_DEVICE
            | NV_ENC_ERR_UNSUPPORTED_DEVICE
            | NV_ENC_ERR_INVALID_ENCODERDEVICE
            | NV_ENC_ERR_INVALID_DEVICE => CodecError::NoDevice(detail),
            NV_ENC_ERR_INVALID_PARAM | NV_ENC_ERR_UNSUPPORTED_PARAM | NV_ENC_ERR_UNIMPLEMENTED => {
                CodecError::Configuration(format!("{detail} during {name}"))
            }
            NV_ENC_ERR_INVALID_PTR
            | NV_ENC_ERR_INVALID_EVENT
            | NV_ENC_ERR_INVALID_CALL
            | NV_ENC_ERR_NOT_ENOUGH_BUFFER
            | NV_ENC_ERR_NEED_MORE_INPUT
            | NV_ENC_ERR_EVENT_NOT_REGISTERD
            | NV_ENC_ERR_RESOURCE_NOT_REGISTERED
            | NV_ENC_ERR_RESOURCE_NOT_MAPPED
            | NV_ENC_ERR_NEED_MORE_OUTPUT => CodecError::Protocol { op: name, detail },
            NV_ENC_ERR_INVALID_VERSION | NV_ENC_ERR_INCOMPATIBLE_CLIENT_KEY => {
                CodecError::LicenseOrVersion(detail)
            }
            _ => CodecError::DriverFault { op: name, detail },
        },
        NativeStatus::Decode(_) => CodecError::DecodeFailed(detail),
    }
}

/// Translate a status from context or encoder-session creation on `device`.
///
/// Running out of memory at that point means the device is full of sessions.
#[must_use]
pub fn translate_for_device(device: u32, status: NativeStatus, op: Operation) -> CodecError {
    match translate(status, op) {
        CodecError::OutOfResources { .. }
            if matches!(op, Operation::CreateContext | Operation::OpenEncoder) =>
        {
            CodecError::ContextExhausted { device }
        }
        other => other,
    }
}

/// A session that can tear itself down and come back with the same parameters.
pub trait Reinitialize {
    fn reinitialize(&mut self) -> Result<()>;
}

/// Run `call`, and on a reinit-class failure re-initialise and retry exactly once.
///
/// A second failure is returned to the caller whatever its class.
pub fn retry_after_reinit<S, T>(
    target: &mut S,
    what: &str,
    mut call: impl FnMut(&mut S) -> Result<T>,
) -> Result<T>
where
    S: Reinitialize,
{
    match call(target) {
        Err(err) if err.class() == FailureClass::Reinit => {
            warn!("{} failed: {}, re-initialising and retrying once", what, err);
            target.reinitialize()?;
            call(target)
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_translate_classes() {
        let cases = [
            (NativeStatus::Nvenc(NV_ENC_ERR_LOCK_BUSY), Operation::LockBitstream, FailureClass::Transient),
            (NativeStatus::Nvenc(NV_ENC_ERR_OUT_OF_MEMORY), Operation::Encode, FailureClass::Transient),
            (NativeStatus::Cuda(CUDA_ERROR_LAUNCH_OUT_OF_RESOURCES), Operation::Convert, FailureClass::Transient),
            (NativeStatus::Nvenc(NV_ENC_ERR_GENERIC), Operation::Encode, FailureClass::Reinit),
            (NativeStatus::Cuda(CUDA_ERROR_ILLEGAL_ADDRESS), Operation::Upload, FailureClass::Reinit),
            (NativeStatus::Nvenc(NV_ENC_ERR_UNSUPPORTED_PARAM), Operation::InitializeEncoder, FailureClass::Configuration),
            (NativeStatus::Cuda(CUDA_ERROR_NO_DEVICE), Operation::Enumerate, FailureClass::Configuration),
            (NativeStatus::Nvenc(NV_ENC_ERR_RESOURCE_NOT_MAPPED), Operation::Encode, FailureClass::Protocol),
            (NativeStatus::Cuda(CUDA_ERROR_INVALID_VALUE), Operation::Upload, FailureClass::Protocol),
            (NativeStatus::Cuda(CUDA_ERROR_INVALID_VALUE), Operation::Decode, FailureClass::DecodeFailure),
            (NativeStatus::Decode(CUVID_DECODE_STATUS_ERROR), Operation::Decode, FailureClass::DecodeFailure),
            (NativeStatus::Nvenc(NV_ENC_ERR_INCOMPATIBLE_CLIENT_KEY), Operation::OpenEncoder, FailureClass::Fatal),
            (NativeStatus::Nvenc(NV_ENC_ERR_INVALID_VERSION), Operation::OpenEncoder, FailureClass::Fatal),
        ];
        for (status, op, class) in cases {
            assert_eq!(translate(status, op).class(), class, "{status} during {op:?}");
        }
    }

    #[test]
    fn test_messages_use_symbolic_names() {
        let err = translate(NativeStatus::Nvenc(NV_ENC_ERR_MAP_FAILED), Operation::Map);
        let msg = err.to_string();
        assert!(msg.contains("NV_ENC_ERR_MAP_FAILED"));
        assert!(!msg.contains("16"));
    }

    #[test]
    fn test_exhaustion_on_creation() {
        let err = translate_for_device(
            3,
            NativeStatus::Cuda(CUDA_ERROR_OUT_OF_MEMORY),
            Operation::CreateContext,
        );
        assert!(matches!(err, CodecError::ContextExhausted { device: 3 }));
        let err = translate_for_device(
            3,
            NativeStatus::Cuda(CUDA_ERROR_OUT_OF_MEMORY),
            Operation::AllocDevice,
        );
        assert!(matches!(err, CodecError::OutOfResources { .. }));
    }

    struct Flaky {
        failures_left: u32,
        reinits: u32,
        fail_with: CodecError,
    }

    impl Reinitialize for Flaky {
        fn reinitialize(&mut self) -> Result<()> {
            self.reinits += 1;
            Ok(())
        }
    }

    impl Flaky {
        fn call(&mut self) -> Result<u32> {
            if self.failures_left > 0 {
                self.failures_left -= 1;
                return Err(self.fail_with.clone());
            }
            Ok(7)
        }
    }

    fn fault() -> CodecError {
        CodecError::DriverFault {
            op: "encode picture",
            detail: "NV_ENC_ERR_GENERIC".into(),
        }
    }

    #[test]
    fn test_retry_once_after_reinit() {
        let mut flaky = Flaky { failures_left: 1, reinits: 0, fail_with: fault() };
        assert_eq!(retry_after_reinit(&mut flaky, "encode", Flaky::call).unwrap(), 7);
        assert_eq!(flaky.reinits, 1);
    }

    #[test]
    fn test_second_failure_propagates() {
        let mut flaky = Flaky { failures_left: 2, reinits: 0, fail_with: fault() };
        let err = retry_after_reinit(&mut flaky, "encode", Flaky::call).unwrap_err();
        assert_eq!(err.class(), FailureClass::Reinit);
        assert_eq!(flaky.reinits, 1);
    }

    #[test]
    fn test_transient_not_retried() {
        let mut flaky = Flaky {
            failures_left: 1,
            reinits: 0,
            fail_with: CodecError::Busy { op: "lock bitstream" },
        };
        assert!(retry_after_reinit(&mut flaky, "encode", Flaky::call).is_err());
        assert_eq!(flaky.reinits, 0);
    }
}
