//! NVENC function table and status helpers.
//!
//! The table is loaded once per process. A driver too old for the bindings
//! leaves it empty, which every encoder call reports as
//! `NV_ENC_ERR_INVALID_VERSION`.

use std::ffi::{c_int, c_void};

use cudarc::driver::sys::CUresult;
use lazy_static::lazy_static;
use nvidia_video_codec_sdk::sys::nvEncodeAPI::{
    NvEncodeAPICreateInstance, NvEncodeAPIGetMaxSupportedVersion, GUID, NVENCAPI_MAJOR_VERSION,
    NVENCAPI_MINOR_VERSION, NVENCSTATUS, NV_ENCODE_API_FUNCTION_LIST, NV_ENCODE_API_FUNCTION_LIST_VER,
    NV_ENC_CAPS_PARAM, NV_ENC_CREATE_BITSTREAM_BUFFER, NV_ENC_INITIALIZE_PARAMS, NV_ENC_INPUT_PTR,
    NV_ENC_LOCK_BITSTREAM, NV_ENC_MAP_INPUT_RESOURCE, NV_ENC_OPEN_ENCODE_SESSION_EX_PARAMS,
    NV_ENC_OUTPUT_PTR, NV_ENC_PIC_PARAMS, NV_ENC_PRESET_CONFIG, NV_ENC_RECONFIGURE_PARAMS,
    NV_ENC_REGISTERED_PTR, NV_ENC_REGISTER_RESOURCE, NV_ENC_TUNING_INFO,
};
use tracing::warn;

use crate::driver::status::{DriverResult, NativeStatus, NV_ENC_ERR_INVALID_VERSION};

lazy_static! {
    /// The NVENC entry points, or `None` when the driver cannot provide them.
    pub static ref ENCODE_API: Option<EncodeAPI> = EncodeAPI::load();
}

type OpenEncodeSessionEx = unsafe extern "C" fn(*mut NV_ENC_OPEN_ENCODE_SESSION_EX_PARAMS, *mut *mut c_void) -> NVENCSTATUS;
type InitializeEncoder = unsafe extern "C" fn(*mut c_void, *mut NV_ENC_INITIALIZE_PARAMS) -> NVENCSTATUS;
type DestroyEncoder = unsafe extern "C" fn(*mut c_void) -> NVENCSTATUS;
type GetEncodeGUIDCount = unsafe extern "C" fn(*mut c_void, *mut u32) -> NVENCSTATUS;
type GetEncodeGUIDs = unsafe extern "C" fn(*mut c_void, *mut GUID, u32, *mut u32) -> NVENCSTATUS;
type GetEncodeCaps = unsafe extern "C" fn(*mut c_void, GUID, *mut NV_ENC_CAPS_PARAM, *mut c_int) -> NVENCSTATUS;
type GetEncodeProfileGUIDCount = unsafe extern "C" fn(*mut c_void, GUID, *mut u32) -> NVENCSTATUS;
type GetEncodeProfileGUIDs = unsafe extern "C" fn(*mut c_void, GUID, *mut GUID, u32, *mut u32) -> NVENCSTATUS;
type GetEncodePresetConfigEx = unsafe extern "C" fn(*mut c_void, GUID, GUID, NV_ENC_TUNING_INFO, *mut NV_ENC_PRESET_CONFIG) -> NVENCSTATUS;
type CreateBitstreamBuffer = unsafe extern "C" fn(*mut c_void, *mut NV_ENC_CREATE_BITSTREAM_BUFFER) -> NVENCSTATUS;
type DestroyBitstreamBuffer = unsafe extern "C" fn(*mut c_void, NV_ENC_OUTPUT_PTR) -> NVENCSTATUS;
type EncodePicture = unsafe extern "C" fn(*mut c_void, *mut NV_ENC_PIC_PARAMS) -> NVENCSTATUS;
type LockBitstream = unsafe extern "C" fn(*mut c_void, *mut NV_ENC_LOCK_BITSTREAM) -> NVENCSTATUS;
type UnlockBitstream = unsafe extern "C" fn(*mut c_void, NV_ENC_OUTPUT_PTR) -> NVENCSTATUS;
type MapInputResource = unsafe extern "C" fn(*mut c_void, *mut NV_ENC_MAP_INPUT_RESOURCE) -> NVENCSTATUS;
type UnmapInputResource = unsafe extern "C" fn(*mut c_void, NV_ENC_INPUT_PTR) -> NVENCSTATUS;
type RegisterResource = unsafe extern "C" fn(*mut c_void, *mut NV_ENC_REGISTER_RESOURCE) -> NVENCSTATUS;
type UnregisterResource = unsafe extern "C" fn(*mut c_void, NV_ENC_REGISTERED_PTR) -> NVENCSTATUS;
type ReconfigureEncoder = unsafe extern "C" fn(*mut c_void, *mut NV_ENC_RECONFIGURE_PARAMS) -> NVENCSTATUS;
type GetLastErrorString = unsafe extern "C" fn(*mut c_void) -> *const ::core::ffi::c_char;

/// NVENC API function pointers.
#[derive(Debug, Clone)]
pub struct EncodeAPI {
    /// Highest API version the installed driver supports.
    pub max_version: (u32, u32),
    pub open_encode_session_ex: OpenEncodeSessionEx,
    pub initialize_encoder: InitializeEncoder,
    pub destroy_encoder: DestroyEncoder,
    pub get_encode_guid_count: GetEncodeGUIDCount,
    pub get_encode_guids: GetEncodeGUIDs,
    pub get_encode_caps: GetEncodeCaps,
    pub get_encode_profile_guid_count: GetEncodeProfileGUIDCount,
    pub get_encode_profile_guids: GetEncodeProfileGUIDs,
    pub get_encode_preset_config_ex: GetEncodePresetConfigEx,
    pub create_bitstream_buffer: CreateBitstreamBuffer,
    pub destroy_bitstream_buffer: DestroyBitstreamBuffer,
    pub encode_picture: EncodePicture,
    pub lock_bitstream: LockBitstream,
    pub unlock_bitstream: UnlockBitstream,
    pub map_input_resource: MapInputResource,
    pub unmap_input_resource: UnmapInputResource,
    pub register_resource: RegisterResource,
    pub unregister_resource: UnregisterResource,
    pub reconfigure_encoder: ReconfigureEncoder,
    pub get_last_error_string: GetLastErrorString,
}

impl EncodeAPI {
    fn load() -> Option<Self> {
        let mut version = 0u32;
        if let Err(status) = nvenc(unsafe { NvEncodeAPIGetMaxSupportedVersion(&mut version) }) {
            warn!("cannot query the NVENC version: {}", status);
            return None;
        }
        let max_version = (version >> 4, version & 0b1111);
        if max_version < (NVENCAPI_MAJOR_VERSION, NVENCAPI_MINOR_VERSION) {
            warn!(
                "NVENC driver version {}.{} is older than required {}.{}",
                max_version.0, max_version.1, NVENCAPI_MAJOR_VERSION, NVENCAPI_MINOR_VERSION
            );
            return None;
        }

        let mut list = NV_ENCODE_API_FUNCTION_LIST {
            version: NV_ENCODE_API_FUNCTION_LIST_VER,
            ..Default::default()
        };
        if let Err(status) = nvenc(unsafe { NvEncodeAPICreateInstance(&mut list) }) {
            warn!("cannot create the NVENC API instance: {}", status);
            return None;
        }

        // Every entry must be populated for the table to be usable.
        Some(Self {
            max_version,
            open_encode_session_ex: list.nvEncOpenEncodeSessionEx?,
            initialize_encoder: list.nvEncInitializeEncoder?,
            destroy_encoder: list.nvEncDestroyEncoder?,
            get_encode_guid_count: list.nvEncGetEncodeGUIDCount?,
            get_encode_guids: list.nvEncGetEncodeGUIDs?,
            get_encode_caps: list.nvEncGetEncodeCaps?,
            get_encode_profile_guid_count: list.nvEncGetEncodeProfileGUIDCount?,
            get_encode_profile_guids: list.nvEncGetEncodeProfileGUIDs?,
            get_encode_preset_config_ex: list.nvEncGetEncodePresetConfigEx?,
            create_bitstream_buffer: list.nvEncCreateBitstreamBuffer?,
            destroy_bitstream_buffer: list.nvEncDestroyBitstreamBuffer?,
            encode_picture: list.nvEncEncodePicture?,
            lock_bitstream: list.nvEncLockBitstream?,
            unlock_bitstream: list.nvEncUnlockBitstream?,
            map_input_resource: list.nvEncMapInputResource?,
            unmap_input_resource: list.nvEncUnmapInputResource?,
            register_resource: list.nvEncRegisterResource?,
            unregister_resource: list.nvEncUnregisterResource?,
            reconfigure_encoder: list.nvEncReconfigureEncoder?,
            get_last_error_string: list.nvEncGetLastErrorString?,
        })
    }

    /// Last error reported for an encoder, if the driver recorded one.
    pub fn last_error(&self, encoder: *mut c_void) -> Option<String> {
        if encoder.is_null() {
            return None;
        }
        let msg = unsafe { (self.get_last_error_string)(encoder) };
        if msg.is_null() {
            return None;
        }
        let msg = unsafe { std::ffi::CStr::from_ptr(msg) }.to_string_lossy();
        (!msg.is_empty()).then(|| msg.into_owned())
    }
}

/// The loaded function table.
pub fn encode_api() -> DriverResult<&'static EncodeAPI> {
    ENCODE_API
        .as_ref()
        .ok_or(NativeStatus::Nvenc(NV_ENC_ERR_INVALID_VERSION))
}

pub fn nvenc(status: NVENCSTATUS) -> DriverResult<()> {
    match status {
        NVENCSTATUS::NV_ENC_SUCCESS => Ok(()),
        other => Err(NativeStatus::Nvenc(other as i32)),
    }
}

/// Like [`nvenc`], logging the encoder's own error string on failure.
pub fn nvenc_for(api: &EncodeAPI, encoder: *mut c_void, status: NVENCSTATUS) -> DriverResult<()> {
    nvenc(status).map_err(|err| {
        if let Some(msg) = api.last_error(encoder) {
            tracing::debug!("{}: {}", err, msg);
        }
        err
    })
}

pub fn cuda(result: CUresult) -> DriverResult<()> {
    match result {
        CUresult::CUDA_SUCCESS => Ok(()),
        other => Err(NativeStatus::Cuda(other as i32)),
    }
}
