//! Native status codes returned by the accelerator APIs.
//!
//! The numeric values match the CUDA driver API (`CUresult`), the NVENC API
//! (`NVENCSTATUS`) and the CUVID decode status (`cuvidDecodeStatus`), so the
//! emulated driver and the hardware driver report failures the same way.

use std::fmt;

/// A raw status code tagged with the API that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NativeStatus {
    /// CUDA driver API result.
    Cuda(i32),
    /// NVENC API status.
    Nvenc(i32),
    /// Per-picture decode status.
    Decode(i32),
}

/// Result of a driver call.
pub type DriverResult<T> = Result<T, NativeStatus>;

pub const CUDA_SUCCESS: i32 = 0;
pub const CUDA_ERROR_INVALID_VALUE: i32 = 1;
pub const CUDA_ERROR_OUT_OF_MEMORY: i32 = 2;
pub const CUDA_ERROR_NOT_INITIALIZED: i32 = 3;
pub const CUDA_ERROR_DEINITIALIZED: i32 = 4;
pub const CUDA_ERROR_NO_DEVICE: i32 = 100;
pub const CUDA_ERROR_INVALID_DEVICE: i32 = 101;
pub const CUDA_ERROR_INVALID_IMAGE: i32 = 200;
pub const CUDA_ERROR_INVALID_CONTEXT: i32 = 201;
pub const CUDA_ERROR_MAP_FAILED: i32 = 205;
pub const CUDA_ERROR_UNMAP_FAILED: i32 = 206;
pub const CUDA_ERROR_ALREADY_MAPPED: i32 = 208;
pub const CUDA_ERROR_NO_BINARY_FOR_GPU: i32 = 209;
pub const CUDA_ERROR_NOT_MAPPED: i32 = 211;
pub const CUDA_ERROR_CONTEXT_ALREADY_IN_USE: i32 = 216;
pub const CUDA_ERROR_INVALID_HANDLE: i32 = 400;
pub const CUDA_ERROR_NOT_READY: i32 = 600;
pub const CUDA_ERROR_ILLEGAL_ADDRESS: i32 = 700;
pub const CUDA_ERROR_LAUNCH_OUT_OF_RESOURCES: i32 = 701;
pub const CUDA_ERROR_CONTEXT_IS_DESTROYED: i32 = 709;
pub const CUDA_ERROR_LAUNCH_FAILED: i32 = 719;
pub const CUDA_ERROR_NOT_SUPPORTED: i32 = 801;
pub const CUDA_ERROR_UNKNOWN: i32 = 999;

pub const NV_ENC_SUCCESS: i32 = 0;
pub const NV_ENC_ERR_NO_ENCODE_DEVICE: i32 = 1;
pub const NV_ENC_ERR_UNSUPPORTED_DEVICE: i32 = 2;
pub const NV_ENC_ERR_INVALID_ENCODERDEVICE: i32 = 3;
pub const NV_ENC_ERR_INVALID_DEVICE: i32 = 4;
pub const NV_ENC_ERR_DEVICE_NOT_EXIST: i32 = 5;
pub const NV_ENC_ERR_INVALID_PTR: i32 = 6;
pub const NV_ENC_ERR_INVALID_EVENT: i32 = 7;
pub const NV_ENC_ERR_INVALID_PARAM: i32 = 8;
pub const NV_ENC_ERR_INVALID_CALL: i32 = 9;
pub const NV_ENC_ERR_OUT_OF_MEMORY: i32 = 10;
pub const NV_ENC_ERR_ENCODER_NOT_INITIALIZED: i32 = 11;
pub const NV_ENC_ERR_UNSUPPORTED_PARAM: i32 = 12;
pub const NV_ENC_ERR_LOCK_BUSY: i32 = 13;
pub const NV_ENC_ERR_NOT_ENOUGH_BUFFER: i32 = 14;
pub const NV_ENC_ERR_INVALID_VERSION: i32 = 15;
pub const NV_ENC_ERR_MAP_FAILED: i32 = 16;
pub const NV_ENC_ERR_NEED_MORE_INPUT: i32 = 17;
pub const NV_ENC_ERR_ENCODER_BUSY: i32 = 18;
pub const NV_ENC_ERR_EVENT_NOT_REGISTERD: i32 = 19;
pub const NV_ENC_ERR_GENERIC: i32 = 20;
pub const NV_ENC_ERR_INCOMPATIBLE_CLIENT_KEY: i32 = 21;
pub const NV_ENC_ERR_UNIMPLEMENTED: i32 = 22;
pub const NV_ENC_ERR_RESOURCE_REGISTER_FAILED: i32 = 23;
pub const NV_ENC_ERR_RESOURCE_NOT_REGISTERED: i32 = 24;
pub const NV_ENC_ERR_RESOURCE_NOT_MAPPED: i32 = 25;
pub const NV_ENC_ERR_NEED_MORE_OUTPUT: i32 = 26;

pub const CUVID_DECODE_STATUS_INVALID: i32 = 0;
pub const CUVID_DECODE_STATUS_ERROR: i32 = 8;
pub const CUVID_DECODE_STATUS_ERROR_CONCEALED: i32 = 9;

fn cuda_name(code: i32) -> &'static str {
    match code {
        CUDA_SUCCESS => "CUDA_SUCCESS",
        CUDA_ERROR_INVALID_VALUE => "CUDA_ERROR_INVALID_VALUE",
        CUDA_ERROR_OUT_OF_MEMORY => "CUDA_ERROR_OUT_OF_MEMORY",
        CUDA_ERROR_NOT_INITIALIZED => "CUDA_ERROR_NOT_INITIALIZED",
        CUDA_ERROR_DEINITIALIZED => "CUDA_ERROR_DEINITIALIZED",
        CUDA_ERROR_NO_DEVICE => "CUDA_ERROR_NO_DEVICE",
        CUDA_ERROR_INVALID_DEVICE => "CUDA_ERROR_INVALID_DEVICE",
        CUDA_ERROR_INVALID_IMAGE => "CUDA_ERROR_INVALID_IMAGE",
        CUDA_ERROR_INVALID_CONTEXT => "CUDA_ERROR_INVALID_CONTEXT",
        CUDA_ERROR_MAP_FAILED => "CUDA_ERROR_MAP_FAILED",
        CUDA_ERROR_UNMAP_FAILED => "CUDA_ERROR_UNMAP_FAILED",
        CUDA_ERROR_ALREADY_MAPPED => "CUDA_ERROR_ALREADY_MAPPED",
        CUDA_ERROR_NO_BINARY_FOR_GPU => "CUDA_ERROR_NO_BINARY_FOR_GPU",
        CUDA_ERROR_NOT_MAPPED => "CUDA_ERROR_NOT_MAPPED",
        CUDA_ERROR_CONTEXT_ALREADY_IN_USE => "CUDA_ERROR_CONTEXT_ALREADY_IN_USE",
        CUDA_ERROR_INVALID_HANDLE => "CUDA_ERROR_INVALID_HANDLE",
        CUDA_ERROR_NOT_READY => "CUDA_ERROR_NOT_READY",
        CUDA_ERROR_ILLEGAL_ADDRESS => "CUDA_ERROR_ILLEGAL_ADDRESS",
        CUDA_ERROR_LAUNCH_OUT_OF_RESOURCES => "CUDA_ERROR_LAUNCH_OUT_OF_RESOURCES",
        CUDA_ERROR_CONTEXT_IS_DESTROYED => "CUDA_ERROR_CONTEXT_IS_DESTROYED",
        CUDA_ERROR_LAUNCH_FAILED => "CUDA_ERROR_LAUNCH_FAILED",
        CUDA_ERROR_NOT_SUPPORTED => "CUDA_ERROR_NOT_SUPPORTED",
        _ => "CUDA_ERROR_UNKNOWN",
    }
}

fn nvenc_name(code: i32) -> &'static str {
    match code {
        NV_ENC_SUCCESS => "NV_ENC_SUCCESS",
        NV_ENC_ERR_NO_ENCODE_DEVICE => "NV_ENC_ERR_NO_ENCODE_DEVICE",
        NV_ENC_ERR_UNSUPPORTED_DEVICE => "NV_ENC_ERR_UNSUPPORTED_DEVICE",
        NV_ENC_ERR_INVALID_ENCODERDEVICE => "NV_ENC_ERR_INVALID_ENCODERDEVICE",
        NV_ENC_ERR_INVALID_DEVICE => "NV_ENC_ERR_INVALID_DEVICE",
        NV_ENC_ERR_DEVICE_NOT_EXIST => "NV_ENC_ERR_DEVICE_NOT_EXIST",
        NV_ENC_ERR_INVALID_PTR => "NV_ENC_ERR_INVALID_PTR",
        NV_ENC_ERR_INVALID_EVENT => "NV_ENC_ERR_INVALID_EVENT",
        NV_ENC_ERR_INVALID_PARAM => "NV_ENC_ERR_INVALID_PARAM",
        NV_ENC_ERR_INVALID_CALL => "NV_ENC_ERR_INVALID_CALL",
        NV_ENC_ERR_OUT_OF_MEMORY => "NV_ENC_ERR_OUT_OF_MEMORY",
        NV_ENC_ERR_ENCODER_NOT_INITIALIZED => "NV_ENC_ERR_ENCODER_NOT_INITIALIZED",
        NV_ENC_ERR_UNSUPPORTED_PARAM => "NV_ENC_ERR_UNSUPPORTED_PARAM",
        NV_ENC_ERR_LOCK_BUSY => "NV_ENC_ERR_LOCK_BUSY",
        NV_ENC_ERR_NOT_ENOUGH_BUFFER => "NV_ENC_ERR_NOT_ENOUGH_BUFFER",
        NV_ENC_ERR_INVALID_VERSION => "NV_ENC_ERR_INVALID_VERSION",
        NV_ENC_ERR_MAP_FAILED => "NV_ENC_ERR_MAP_FAILED",
        NV_ENC_ERR_NEED_MORE_INPUT => "NV_ENC_ERR_NEED_MORE_INPUT",
        NV_ENC_ERR_ENCODER_BUSY => "NV_ENC_ERR_ENCODER_BUSY",
        NV_ENC_ERR_EVENT_NOT_REGISTERD => "NV_ENC_ERR_EVENT_NOT_REGISTERD",
        NV_ENC_ERR_GENERIC => "NV_ENC_ERR_GENERIC",
        NV_ENC_ERR_INCOMPATIBLE_CLIENT_KEY => "NV_ENC_ERR_INCOMPATIBLE_CLIENT_KEY",
        NV_ENC_ERR_UNIMPLEMENTED => "NV_ENC_ERR_UNIMPLEMENTED",
        NV_ENC_ERR_RESOURCE_REGISTER_FAILED => "NV_ENC_ERR_RESOURCE_REGISTER_FAILED",
        NV_ENC_ERR_RESOURCE_NOT_REGISTERED => "NV_ENC_ERR_RESOURCE_NOT_REGISTERED",
        NV_ENC_ERR_RESOURCE_NOT_MAPPED => "NV_ENC_ERR_RESOURCE_NOT_MAPPED",
        NV_ENC_ERR_NEED_MORE_OUTPUT => "NV_ENC_ERR_NEED_MORE_OUTPUT",
        _ => "NV_ENC_ERR_UNKNOWN",
    }
}

fn decode_name(code: i32) -> &'static str {
    match code {
        CUVID_DECODE_STATUS_INVALID => "cuvidDecodeStatus_Invalid",
        CUVID_DECODE_STATUS_ERROR => "cuvidDecodeStatus_Error",
        CUVID_DECODE_STATUS_ERROR_CONCEALED => "cuvidDecodeStatus_Error_Concealed",
        _ => "cuvidDecodeStatus_Unknown",
    }
}

impl NativeStatus {
    /// Symbolic name of the status, e.g. `NV_ENC_ERR_LOCK_BUSY`.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match *self {
            Self::Cuda(code) => cuda_name(code),
            Self::Nvenc(code) => nvenc_name(code),
            Self::Decode(code) => decode_name(code),
        }
    }
}

impl fmt::Display for NativeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_names() {
        assert_eq!(
            NativeStatus::Nvenc(NV_ENC_ERR_LOCK_BUSY).name(),
            "NV_ENC_ERR_LOCK_BUSY"
        );
        assert_eq!(
            NativeStatus::Cuda(CUDA_ERROR_CONTEXT_ALREADY_IN_USE).to_string(),
            "CUDA_ERROR_CONTEXT_ALREADY_IN_USE"
        );
        assert_eq!(NativeStatus::Cuda(12345).name(), "CUDA_ERROR_UNKNOWN");
    }
}
