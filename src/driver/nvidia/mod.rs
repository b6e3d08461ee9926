//! NVIDIA backend: CUDA driver API, NVENC and NVDEC.
//!
//! Native pointers never leave this module. Every handle handed to the
//! sessions is a key into one of the driver's handle tables.
//!
//! The encoder takes packed RGB directly (`rgb_input`). Planar conversion
//! and downscaling run as NVRTC-compiled kernels, loaded per context.

mod api;
mod csc;
mod decode;

use std::collections::HashMap;
use std::ffi::{c_int, c_void, CStr};
use std::ptr::{self, NonNull};
use std::sync::{Mutex, MutexGuard};

use cudarc::driver::sys::{self as cu, CUcontext, CUdevice, CUdevice_attribute};
use nvidia_video_codec_sdk::sys::nvEncodeAPI::*;
use tracing::{debug, info};

use self::api::{cuda, encode_api, nvenc_for, EncodeAPI};
use self::csc::CscKernels;
use self::decode::NvDecoder;
use super::status::{
    CUDA_ERROR_INVALID_CONTEXT, CUDA_ERROR_INVALID_HANDLE, CUDA_ERROR_INVALID_VALUE, CUDA_ERROR_NOT_SUPPORTED,
    NV_ENC_ERR_INVALID_PARAM, NV_ENC_ERR_INVALID_PTR, NV_ENC_ERR_UNSUPPORTED_PARAM,
};
use super::{
    BitstreamHandle, CodecCaps, ContextHandle, CscJob, DecodedPicture, DecoderHandle, DecoderSettings,
    DeviceProperties, DevicePitched, DevicePtr, Driver, DriverResult, EncoderHandle, EncoderSettings,
    HostAllocation, LockedBitstream, MappedInputHandle, MemoryInfo, NativeStatus, PictureParams, RegisterDesc,
    RegistrationHandle,
};
use crate::types::{Codec, EncoderPreset, PixelFormat, PixelLayout, Preset, Profile, TuningMode};

/// CUDA 12.0 / NVENC 12.0 are the oldest APIs the bindings target.
const REQUIRED_API: (u32, u32) = (12, 0);

/// A native pointer stored in a handle table.
#[derive(Debug, Clone, Copy)]
struct Raw(*mut c_void);

// SAFETY: the pointers are opaque driver handles; the driver API allows
// using them from any thread that has the owning context current.
unsafe impl Send for Raw {}

#[derive(Debug)]
struct Encoder {
    session: Raw,
    ctx: u64,
    codec: Codec,
    width: u32,
    height: u32,
    initialized: bool,
}

#[derive(Debug, Clone, Copy)]
struct Registration {
    resource: Raw,
    desc: RegisterDesc,
}

#[derive(Debug, Clone, Copy)]
struct Mapped {
    resource: Raw,
    format: NV_ENC_BUFFER_FORMAT,
    desc: RegisterDesc,
}

#[derive(Debug, Default)]
struct Tables {
    next_id: u64,
    contexts: HashMap<u64, Raw>,
    encoders: HashMap<u64, Encoder>,
    bitstreams: HashMap<u64, Raw>,
    registrations: HashMap<u64, Registration>,
    mapped: HashMap<u64, Mapped>,
    decoders: HashMap<u64, Box<NvDecoder>>,
    kernels: HashMap<u64, CscKernels>,
}

impl Tables {
    fn id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn encoder(&self, ctx: ContextHandle, enc: EncoderHandle) -> DriverResult<&Encoder> {
        match self.encoders.get(&enc.0) {
            Some(encoder) if encoder.ctx == ctx.0 => Ok(encoder),
            _ => Err(NativeStatus::Nvenc(NV_ENC_ERR_INVALID_PTR)),
        }
    }
}

/// The CUDA/NVENC/NVDEC driver.
#[derive(Debug)]
pub struct NvidiaDriver {
    api_version: (u32, u32),
    tables: Mutex<Tables>,
}

impl NvidiaDriver {
    /// Initialise CUDA and load the NVENC entry points.
    pub fn load() -> DriverResult<Self> {
        cuda(unsafe { cu::cuInit(0) })?;
        let mut version: c_int = 0;
        cuda(unsafe { cu::cuDriverGetVersion(&mut version) })?;
        let cuda_version = (version as u32 / 1000, (version as u32 % 1000) / 10);
        // No NVENC table means the driver is too old for the bindings.
        let api_version = encode_api().map(|api| api.max_version).unwrap_or((0, 0));
        info!("CUDA driver {}.{}, codec API {}.{}", cuda_version.0, cuda_version.1, api_version.0, api_version.1);
        Ok(Self {
            api_version,
            tables: Mutex::new(Tables::default()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn device(ordinal: u32) -> DriverResult<CUdevice> {
        let mut device: CUdevice = 0;
        cuda(unsafe { cu::cuDeviceGet(&mut device, ordinal as c_int) })?;
        Ok(device)
    }

    fn attribute(device: CUdevice, attribute: CUdevice_attribute) -> DriverResult<i32> {
        let mut value: c_int = 0;
        cuda(unsafe { cu::cuDeviceGetAttribute(&mut value, attribute, device) })?;
        Ok(value)
    }

    /// Run `f` with the device's primary context current.
    fn with_primary<T>(ordinal: u32, f: impl FnOnce(CUcontext) -> DriverResult<T>) -> DriverResult<T> {
        let device = Self::device(ordinal)?;
        let mut ctx: CUcontext = ptr::null_mut();
        cuda(unsafe { cu::cuDevicePrimaryCtxRetain(&mut ctx, device) })?;
        let result = cuda(unsafe { cu::cuCtxPushCurrent_v2(ctx) }).and_then(|()| {
            let result = f(ctx);
            let mut popped: CUcontext = ptr::null_mut();
            let _ = unsafe { cu::cuCtxPopCurrent_v2(&mut popped) };
            result
        });
        let _ = unsafe { cu::cuDevicePrimaryCtxRelease_v2(device) };
        result
    }

    fn context(&self, ctx: ContextHandle) -> DriverResult<CUcontext> {
        self.lock()
            .contexts
            .get(&ctx.0)
            .map(|raw| raw.0 as CUcontext)
            .ok_or(NativeStatus::Cuda(CUDA_ERROR_INVALID_CONTEXT))
    }
}

fn open_session(api: &EncodeAPI, ctx: CUcontext) -> DriverResult<*mut c_void> {
    let mut params = NV_ENC_OPEN_ENCODE_SESSION_EX_PARAMS {
        version: NV_ENC_OPEN_ENCODE_SESSION_EX_PARAMS_VER,
        deviceType: NV_ENC_DEVICE_TYPE::NV_ENC_DEVICE_TYPE_CUDA,
        apiVersion: NVENCAPI_VERSION,
        device: ctx as *mut c_void,
        ..Default::default()
    };
    let mut session = ptr::null_mut();
    nvenc_for(api, ptr::null_mut(), unsafe { (api.open_encode_session_ex)(&mut params, &mut session) })?;
    Ok(session)
}

fn guid_eq(a: &GUID, b: &GUID) -> bool {
    a.Data1 == b.Data1 && a.Data2 == b.Data2 && a.Data3 == b.Data3 && a.Data4 == b.Data4
}

fn codec_guid(codec: Codec) -> GUID {
    match codec {
        Codec::H264 => NV_ENC_CODEC_H264_GUID,
        Codec::Hevc => NV_ENC_CODEC_HEVC_GUID,
        Codec::Av1 => NV_ENC_CODEC_AV1_GUID,
    }
}

fn preset_guid(level: EncoderPreset) -> GUID {
    match level {
        EncoderPreset::Fastest => NV_ENC_PRESET_P1_GUID,
        EncoderPreset::Fast => NV_ENC_PRESET_P2_GUID,
        EncoderPreset::Medium => NV_ENC_PRESET_P4_GUID,
        EncoderPreset::Slow => NV_ENC_PRESET_P5_GUID,
        EncoderPreset::Slowest => NV_ENC_PRESET_P7_GUID,
    }
}

fn tuning_info(tuning: TuningMode) -> NV_ENC_TUNING_INFO {
    match tuning {
        TuningMode::HighQuality => NV_ENC_TUNING_INFO::NV_ENC_TUNING_INFO_HIGH_QUALITY,
        TuningMode::LowLatency => NV_ENC_TUNING_INFO::NV_ENC_TUNING_INFO_LOW_LATENCY,
        TuningMode::UltraLowLatency => NV_ENC_TUNING_INFO::NV_ENC_TUNING_INFO_ULTRA_LOW_LATENCY,
        TuningMode::Lossless => NV_ENC_TUNING_INFO::NV_ENC_TUNING_INFO_LOSSLESS,
    }
}

fn profile_guid(profile: Profile) -> GUID {
    match profile {
        Profile::H264Baseline => NV_ENC_H264_PROFILE_BASELINE_GUID,
        Profile::H264Main => NV_ENC_H264_PROFILE_MAIN_GUID,
        Profile::H264High => NV_ENC_H264_PROFILE_HIGH_GUID,
        Profile::H264High444 => NV_ENC_H264_PROFILE_HIGH_444_GUID,
        Profile::HevcMain => NV_ENC_HEVC_PROFILE_MAIN_GUID,
        Profile::HevcMain444 => NV_ENC_HEVC_PROFILE_FREXT_GUID,
        Profile::Av1Main => NV_ENC_AV1_PROFILE_MAIN_GUID,
    }
}

fn buffer_format(format: PixelFormat) -> NV_ENC_BUFFER_FORMAT {
    match format {
        // Little-endian word order: B, G, R, A in memory.
        PixelFormat::Bgrx | PixelFormat::Bgra => NV_ENC_BUFFER_FORMAT::NV_ENC_BUFFER_FORMAT_ARGB,
        PixelFormat::Rgbx | PixelFormat::Rgba => NV_ENC_BUFFER_FORMAT::NV_ENC_BUFFER_FORMAT_ABGR,
        PixelFormat::Nv12 => NV_ENC_BUFFER_FORMAT::NV_ENC_BUFFER_FORMAT_NV12,
        PixelFormat::Yuv444p | PixelFormat::Gbrp => NV_ENC_BUFFER_FORMAT::NV_ENC_BUFFER_FORMAT_YUV444,
    }
}

/// Constant QP for a 0-100 quality target.
fn quality_qp(quality: u8, lossless: bool) -> u32 {
    if lossless {
        return 0;
    }
    let quality = u32::from(quality.min(100));
    (51 - quality * 50 / 100).max(1)
}

fn query_caps(api: &EncodeAPI, session: *mut c_void, codec: GUID, cap: NV_ENC_CAPS) -> DriverResult<i32> {
    let mut param = NV_ENC_CAPS_PARAM {
        version: NV_ENC_CAPS_PARAM_VER,
        capsToQuery: cap,
        ..Default::default()
    };
    let mut value: c_int = 0;
    nvenc_for(api, session, unsafe { (api.get_encode_caps)(session, codec, &mut param, &mut value) })?;
    Ok(value)
}

fn supported_codecs(api: &EncodeAPI, session: *mut c_void) -> DriverResult<Vec<GUID>> {
    let mut count = 0u32;
    nvenc_for(api, session, unsafe { (api.get_encode_guid_count)(session, &mut count) })?;
    let mut guids = vec![GUID::default(); count as usize];
    let mut written = 0u32;
    nvenc_for(api, session, unsafe {
        (api.get_encode_guids)(session, guids.as_mut_ptr(), count, &mut written)
    })?;
    guids.truncate(written as usize);
    Ok(guids)
}

fn supported_profiles(api: &EncodeAPI, session: *mut c_void, codec: GUID) -> DriverResult<Vec<GUID>> {
    let mut count = 0u32;
    nvenc_for(api, session, unsafe { (api.get_encode_profile_guid_count)(session, codec, &mut count) })?;
    let mut guids = vec![GUID::default(); count as usize];
    let mut written = 0u32;
    nvenc_for(api, session, unsafe {
        (api.get_encode_profile_guids)(session, codec, guids.as_mut_ptr(), count, &mut written)
    })?;
    guids.truncate(written as usize);
    Ok(guids)
}

fn read_caps(api: &EncodeAPI, session: *mut c_void, codec: Codec) -> DriverResult<Option<CodecCaps>> {
    let guid = codec_guid(codec);
    if !supported_codecs(api, session)?.iter().any(|g| guid_eq(g, &guid)) {
        return Ok(None);
    }
    let cap = |cap| query_caps(api, session, guid, cap);
    let yuv444 = cap(NV_ENC_CAPS::NV_ENC_CAPS_SUPPORT_YUV444_ENCODE)? != 0;
    let lossless = cap(NV_ENC_CAPS::NV_ENC_CAPS_SUPPORT_LOSSLESS_ENCODE)? != 0;

    let native = supported_profiles(api, session, guid)?;
    let profiles: Vec<Profile> = [PixelLayout::Nv12, PixelLayout::Yuv444p]
        .iter()
        .flat_map(|layout| Profile::preferences(codec, *layout).iter().copied())
        .filter(|p| yuv444 || !p.supports_yuv444())
        .filter(|p| native.iter().any(|g| guid_eq(g, &profile_guid(*p))))
        .collect();
    let mut layouts = vec![PixelLayout::Nv12];
    if yuv444 && profiles.iter().any(|p| p.supports_yuv444()) {
        layouts.push(PixelLayout::Yuv444p);
    }

    Ok(Some(CodecCaps {
        codec,
        min_width: cap(NV_ENC_CAPS::NV_ENC_CAPS_WIDTH_MIN)?.max(1) as u32,
        min_height: cap(NV_ENC_CAPS::NV_ENC_CAPS_HEIGHT_MIN)?.max(1) as u32,
        max_width: cap(NV_ENC_CAPS::NV_ENC_CAPS_WIDTH_MAX)?.max(0) as u32,
        max_height: cap(NV_ENC_CAPS::NV_ENC_CAPS_HEIGHT_MAX)?.max(0) as u32,
        layouts,
        lossless,
        rgb_input: true,
        presets: Preset::all().filter(|p| lossless || !p.is_lossless()).collect(),
        profiles,
    }))
}

/// Build the NVENC configuration for `settings`.
fn encoder_config(
    api: &EncodeAPI,
    session: *mut c_void,
    settings: &EncoderSettings,
) -> DriverResult<Box<NV_ENC_CONFIG>> {
    let codec = codec_guid(settings.codec);
    let mut preset_config = NV_ENC_PRESET_CONFIG {
        version: NV_ENC_PRESET_CONFIG_VER,
        presetCfg: NV_ENC_CONFIG {
            version: NV_ENC_CONFIG_VER,
            ..Default::default()
        },
        ..Default::default()
    };
    nvenc_for(api, session, unsafe {
        (api.get_encode_preset_config_ex)(
            session,
            codec,
            preset_guid(settings.preset.level()),
            tuning_info(settings.preset.tuning()),
            &mut preset_config,
        )
    })?;

    let mut config = Box::new(preset_config.presetCfg);
    config.profileGUID = profile_guid(settings.profile);
    config.gopLength = NVENC_INFINITE_GOPLENGTH;
    config.frameIntervalP = 1;
    let qp = quality_qp(settings.quality, settings.lossless);
    config.rcParams.rateControlMode = NV_ENC_PARAMS_RC_MODE::NV_ENC_PARAMS_RC_CONSTQP;
    config.rcParams.constQP = NV_ENC_QP {
        qpInterP: qp,
        qpInterB: qp,
        qpIntra: qp,
    };

    let yuv444 = matches!(settings.input_format, PixelFormat::Yuv444p | PixelFormat::Gbrp);
    // SAFETY: the union member matches the codec GUID.
    unsafe {
        match settings.codec {
            Codec::H264 => {
                let h264 = &mut config.encodeCodecConfig.h264Config;
                h264.idrPeriod = NVENC_INFINITE_GOPLENGTH;
                h264.set_repeatSPSPPS(1);
                if yuv444 {
                    h264.chromaFormatIDC = 3;
                }
                if settings.lossless {
                    h264.set_qpPrimeYZeroTransformBypassFlag(1);
                }
            }
            Codec::Hevc => {
                let hevc = &mut config.encodeCodecConfig.hevcConfig;
                hevc.idrPeriod = NVENC_INFINITE_GOPLENGTH;
                hevc.set_repeatSPSPPS(1);
                if yuv444 {
                    hevc.set_chromaFormatIDC(3);
                }
            }
            Codec::Av1 => {
                if yuv444 {
                    return Err(NativeStatus::Nvenc(NV_ENC_ERR_UNSUPPORTED_PARAM));
                }
                let av1 = &mut config.encodeCodecConfig.av1Config;
                av1.idrPeriod = NVENC_INFINITE_GOPLENGTH;
                av1.set_repeatSeqHdr(1);
            }
        }
    }
    Ok(config)
}

fn init_params(settings: &EncoderSettings, config: &mut NV_ENC_CONFIG) -> NV_ENC_INITIALIZE_PARAMS {
    NV_ENC_INITIALIZE_PARAMS {
        version: NV_ENC_INITIALIZE_PARAMS_VER,
        encodeGUID: codec_guid(settings.codec),
        presetGUID: preset_guid(settings.preset.level()),
        tuningInfo: tuning_info(settings.preset.tuning()),
        encodeWidth: settings.width,
        encodeHeight: settings.height,
        darWidth: settings.width,
        darHeight: settings.height,
        frameRateNum: 60,
        frameRateDen: 1,
        enablePTD: 1,
        encodeConfig: config,
        maxEncodeWidth: settings.width,
        maxEncodeHeight: settings.height,
        ..Default::default()
    }
}

impl Driver for NvidiaDriver {
    fn name(&self) -> &str {
        "nvidia"
    }

    fn api_version(&self) -> DriverResult<(u32, u32)> {
        Ok(self.api_version)
    }

    fn required_api_version(&self) -> (u32, u32) {
        REQUIRED_API
    }

    fn device_count(&self) -> DriverResult<u32> {
        let mut count: c_int = 0;
        cuda(unsafe { cu::cuDeviceGetCount(&mut count) })?;
        Ok(count.max(0) as u32)
    }

    fn device_properties(&self, ordinal: u32) -> DriverResult<DeviceProperties> {
        let device = Self::device(ordinal)?;

        let mut name = [0 as std::ffi::c_char; 256];
        cuda(unsafe { cu::cuDeviceGetName(name.as_mut_ptr(), name.len() as c_int, device) })?;
        let name = unsafe { CStr::from_ptr(name.as_ptr()) }.to_string_lossy().into_owned();

        let mut bus_id = [0 as std::ffi::c_char; 32];
        cuda(unsafe { cu::cuDeviceGetPCIBusId(bus_id.as_mut_ptr(), bus_id.len() as c_int, device) })?;
        let pci_bus_id = unsafe { CStr::from_ptr(bus_id.as_ptr()) }.to_string_lossy().into_owned();

        let mut total_memory = 0usize;
        cuda(unsafe { cu::cuDeviceTotalMem_v2(&mut total_memory, device) })?;

        use CUdevice_attribute::*;
        Ok(DeviceProperties {
            ordinal,
            name,
            pci_bus_id,
            total_memory: total_memory as u64,
            compute_capability: (
                Self::attribute(device, CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MAJOR)? as u32,
                Self::attribute(device, CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MINOR)? as u32,
            ),
            multiprocessors: Self::attribute(device, CU_DEVICE_ATTRIBUTE_MULTIPROCESSOR_COUNT)? as u32,
            can_map_host_memory: Self::attribute(device, CU_DEVICE_ATTRIBUTE_CAN_MAP_HOST_MEMORY)? != 0,
        })
    }

    fn memory_info(&self, ordinal: u32) -> DriverResult<MemoryInfo> {
        Self::with_primary(ordinal, |_| {
            let (mut free, mut total) = (0usize, 0usize);
            cuda(unsafe { cu::cuMemGetInfo_v2(&mut free, &mut total) })?;
            Ok(MemoryInfo {
                free: free as u64,
                total: total as u64,
            })
        })
    }

    fn codec_caps(&self, ordinal: u32, codec: Codec) -> DriverResult<Option<CodecCaps>> {
        let api = encode_api()?;
        Self::with_primary(ordinal, |ctx| {
            let session = open_session(api, ctx)?;
            let caps = read_caps(api, session, codec);
            let _ = unsafe { (api.destroy_encoder)(session) };
            caps
        })
    }

    fn create_context(&self, ordinal: u32) -> DriverResult<ContextHandle> {
        let device = Self::device(ordinal)?;
        let mut ctx: CUcontext = ptr::null_mut();
        cuda(unsafe { cu::cuCtxCreate_v2(&mut ctx, 0, device) })?;
        // cuCtxCreate leaves the new context current.
        let mut popped: CUcontext = ptr::null_mut();
        if let Err(status) = cuda(unsafe { cu::cuCtxPopCurrent_v2(&mut popped) }) {
            let _ = unsafe { cu::cuCtxDestroy_v2(ctx) };
            return Err(status);
        }
        let mut tables = self.lock();
        let id = tables.id();
        tables.contexts.insert(id, Raw(ctx as *mut c_void));
        debug!("created context {} on device {}", id, ordinal);
        Ok(ContextHandle(id))
    }

    fn destroy_context(&self, ctx: ContextHandle) -> DriverResult<()> {
        let mut tables = self.lock();
        let raw = tables
            .contexts
            .remove(&ctx.0)
            .ok_or(NativeStatus::Cuda(CUDA_ERROR_INVALID_CONTEXT))?;
        // Destroying the context unloads its modules.
        tables.kernels.remove(&ctx.0);
        drop(tables);
        cuda(unsafe { cu::cuCtxDestroy_v2(raw.0 as CUcontext) })
    }

    fn push_context(&self, ctx: ContextHandle) -> DriverResult<()> {
        let raw = self.context(ctx)?;
        cuda(unsafe { cu::cuCtxPushCurrent_v2(raw) })
    }

    fn pop_context(&self, ctx: ContextHandle) -> DriverResult<()> {
        let expected = self.context(ctx)?;
        let mut popped: CUcontext = ptr::null_mut();
        cuda(unsafe { cu::cuCtxPopCurrent_v2(&mut popped) })?;
        if popped != expected {
            return Err(NativeStatus::Cuda(CUDA_ERROR_INVALID_CONTEXT));
        }
        Ok(())
    }

    fn alloc_host(&self, ctx: ContextHandle, len: usize) -> DriverResult<HostAllocation> {
        self.context(ctx)?;
        let mut ptr: *mut c_void = ptr::null_mut();
        cuda(unsafe { cu::cuMemAllocHost_v2(&mut ptr, len) })?;
        let ptr = NonNull::new(ptr as *mut u8).ok_or(NativeStatus::Cuda(CUDA_ERROR_INVALID_VALUE))?;
        // SAFETY: cuMemAllocHost returned `len` bytes of page-locked memory.
        Ok(unsafe { HostAllocation::from_raw(ptr, len, ptr.as_ptr() as u64) })
    }

    fn free_host(&self, ctx: ContextHandle, host: HostAllocation) -> DriverResult<()> {
        self.context(ctx)?;
        cuda(unsafe { cu::cuMemFreeHost(host.as_ptr() as *mut c_void) })
    }

    fn alloc_pitched(&self, ctx: ContextHandle, width_bytes: usize, rows: usize) -> DriverResult<DevicePitched> {
        self.context(ctx)?;
        let mut dptr: cu::CUdeviceptr = 0;
        let mut pitch = 0usize;
        cuda(unsafe { cu::cuMemAllocPitch_v2(&mut dptr, &mut pitch, width_bytes, rows, 16) })?;
        Ok(DevicePitched {
            ptr: DevicePtr(dptr),
            pitch,
            width_bytes,
            rows,
        })
    }

    fn free_device(&self, ctx: ContextHandle, buffer: DevicePitched) -> DriverResult<()> {
        self.context(ctx)?;
        cuda(unsafe { cu::cuMemFree_v2(buffer.ptr.0) })
    }

    fn copy_to_device(
        &self,
        ctx: ContextHandle,
        src: &HostAllocation,
        src_pitch: usize,
        dst: &DevicePitched,
        width_bytes: usize,
        rows: usize,
    ) -> DriverResult<()> {
        self.context(ctx)?;
        if src_pitch * rows > src.len() || width_bytes > dst.pitch || rows > dst.rows {
            return Err(NativeStatus::Cuda(CUDA_ERROR_INVALID_VALUE));
        }
        let mut copy = cu::CUDA_MEMCPY2D {
            srcMemoryType: cu::CUmemorytype::CU_MEMORYTYPE_HOST,
            srcHost: src.as_ptr() as *const c_void,
            srcPitch: src_pitch,
            dstMemoryType: cu::CUmemorytype::CU_MEMORYTYPE_DEVICE,
            dstDevice: dst.ptr.0,
            dstPitch: dst.pitch,
            WidthInBytes: width_bytes,
            Height: rows,
            ..unsafe { std::mem::zeroed() }
        };
        cuda(unsafe { cu::cuMemcpy2D_v2(&mut copy) })
    }

    fn copy_to_host(
        &self,
        ctx: ContextHandle,
        src: &DevicePitched,
        dst: &mut [u8],
        dst_pitch: usize,
        width_bytes: usize,
        rows: usize,
    ) -> DriverResult<()> {
        self.context(ctx)?;
        if dst_pitch * rows > dst.len() || width_bytes > src.pitch || rows > src.rows {
            return Err(NativeStatus::Cuda(CUDA_ERROR_INVALID_VALUE));
        }
        let mut copy = cu::CUDA_MEMCPY2D {
            srcMemoryType: cu::CUmemorytype::CU_MEMORYTYPE_DEVICE,
            srcDevice: src.ptr.0,
            srcPitch: src.pitch,
            dstMemoryType: cu::CUmemorytype::CU_MEMORYTYPE_HOST,
            dstHost: dst.as_mut_ptr() as *mut c_void,
            dstPitch: dst_pitch,
            WidthInBytes: width_bytes,
            Height: rows,
            ..unsafe { std::mem::zeroed() }
        };
        cuda(unsafe { cu::cuMemcpy2D_v2(&mut copy) })
    }

    fn supports_csc(&self) -> bool {
        csc::available()
    }

    fn launch_csc(&self, ctx: ContextHandle, job: &CscJob) -> DriverResult<()> {
        self.context(ctx)?;
        let mut tables = self.lock();
        if !tables.kernels.contains_key(&ctx.0) {
            let kernels = CscKernels::load()?;
            debug!("loaded colorspace kernels into context {}", ctx.0);
            tables.kernels.insert(ctx.0, kernels);
        }
        let kernels = tables.kernels.get(&ctx.0).ok_or(NativeStatus::Cuda(CUDA_ERROR_INVALID_CONTEXT))?;
        kernels.launch(job)
    }

    fn open_encoder(&self, ctx: ContextHandle, codec: Codec) -> DriverResult<EncoderHandle> {
        let api = encode_api()?;
        let raw = self.context(ctx)?;
        let session = open_session(api, raw)?;
        let mut tables = self.lock();
        let id = tables.id();
        tables.encoders.insert(
            id,
            Encoder {
                session: Raw(session),
                ctx: ctx.0,
                codec,
                width: 0,
                height: 0,
                initialized: false,
            },
        );
        Ok(EncoderHandle(id))
    }

    fn initialize_encoder(&self, ctx: ContextHandle, enc: EncoderHandle, settings: &EncoderSettings) -> DriverResult<()> {
        let api = encode_api()?;
        let mut tables = self.lock();
        let session = tables.encoder(ctx, enc)?.session.0;
        if tables.encoder(ctx, enc)?.codec != settings.codec {
            return Err(NativeStatus::Nvenc(NV_ENC_ERR_INVALID_PARAM));
        }
        let mut config = encoder_config(api, session, settings)?;
        let mut params = init_params(settings, &mut config);
        nvenc_for(api, session, unsafe { (api.initialize_encoder)(session, &mut params) })?;
        if let Some(encoder) = tables.encoders.get_mut(&enc.0) {
            encoder.width = settings.width;
            encoder.height = settings.height;
            encoder.initialized = true;
        }
        Ok(())
    }

    fn reconfigure_encoder(&self, ctx: ContextHandle, enc: EncoderHandle, settings: &EncoderSettings) -> DriverResult<()> {
        let api = encode_api()?;
        let tables = self.lock();
        let encoder = tables.encoder(ctx, enc)?;
        let session = encoder.session.0;
        if !encoder.initialized || (encoder.width, encoder.height) != (settings.width, settings.height) {
            return Err(NativeStatus::Nvenc(NV_ENC_ERR_INVALID_PARAM));
        }
        let mut config = encoder_config(api, session, settings)?;
        let mut reconfigure = NV_ENC_RECONFIGURE_PARAMS {
            version: NV_ENC_RECONFIGURE_PARAMS_VER,
            reInitEncodeParams: init_params(settings, &mut config),
            ..Default::default()
        };
        reconfigure.set_resetEncoder(1);
        reconfigure.set_forceIDR(1);
        nvenc_for(api, session, unsafe { (api.reconfigure_encoder)(session, &mut reconfigure) })
    }

    fn create_bitstream(&self, ctx: ContextHandle, enc: EncoderHandle) -> DriverResult<BitstreamHandle> {
        let api = encode_api()?;
        let mut tables = self.lock();
        let session = tables.encoder(ctx, enc)?.session.0;
        let mut params = NV_ENC_CREATE_BITSTREAM_BUFFER {
            version: NV_ENC_CREATE_BITSTREAM_BUFFER_VER,
            ..Default::default()
        };
        nvenc_for(api, session, unsafe { (api.create_bitstream_buffer)(session, &mut params) })?;
        let id = tables.id();
        tables.bitstreams.insert(id, Raw(params.bitstreamBuffer));
        Ok(BitstreamHandle(id))
    }

    fn destroy_bitstream(&self, ctx: ContextHandle, enc: EncoderHandle, bitstream: BitstreamHandle) -> DriverResult<()> {
        let api = encode_api()?;
        let mut tables = self.lock();
        let session = tables.encoder(ctx, enc)?.session.0;
        let raw = tables
            .bitstreams
            .remove(&bitstream.0)
            .ok_or(NativeStatus::Nvenc(NV_ENC_ERR_INVALID_PTR))?;
        nvenc_for(api, session, unsafe { (api.destroy_bitstream_buffer)(session, raw.0) })
    }

    fn register_resource(&self, ctx: ContextHandle, enc: EncoderHandle, desc: &RegisterDesc) -> DriverResult<RegistrationHandle> {
        let api = encode_api()?;
        let mut tables = self.lock();
        let session = tables.encoder(ctx, enc)?.session.0;
        let mut params = NV_ENC_REGISTER_RESOURCE {
            version: NV_ENC_REGISTER_RESOURCE_VER,
            resourceType: NV_ENC_INPUT_RESOURCE_TYPE::NV_ENC_INPUT_RESOURCE_TYPE_CUDADEVICEPTR,
            width: desc.width,
            height: desc.height,
            pitch: desc.buffer.pitch as u32,
            resourceToRegister: desc.buffer.ptr.0 as *mut c_void,
            bufferFormat: buffer_format(desc.format),
            bufferUsage: NV_ENC_BUFFER_USAGE::NV_ENC_INPUT_IMAGE,
            ..Default::default()
        };
        nvenc_for(api, session, unsafe { (api.register_resource)(session, &mut params) })?;
        let id = tables.id();
        tables.registrations.insert(
            id,
            Registration {
                resource: Raw(params.registeredResource),
                desc: *desc,
            },
        );
        Ok(RegistrationHandle(id))
    }

    fn unregister_resource(&self, ctx: ContextHandle, enc: EncoderHandle, reg: RegistrationHandle) -> DriverResult<()> {
        let api = encode_api()?;
        let mut tables = self.lock();
        let session = tables.encoder(ctx, enc)?.session.0;
        let registration = tables
            .registrations
            .remove(&reg.0)
            .ok_or(NativeStatus::Nvenc(NV_ENC_ERR_INVALID_PTR))?;
        nvenc_for(api, session, unsafe { (api.unregister_resource)(session, registration.resource.0) })
    }

    fn map_resource(&self, ctx: ContextHandle, enc: EncoderHandle, reg: RegistrationHandle) -> DriverResult<MappedInputHandle> {
        let api = encode_api()?;
        let mut tables = self.lock();
        let session = tables.encoder(ctx, enc)?.session.0;
        let registration = *tables
            .registrations
            .get(&reg.0)
            .ok_or(NativeStatus::Nvenc(NV_ENC_ERR_INVALID_PTR))?;
        let mut params = NV_ENC_MAP_INPUT_RESOURCE {
            version: NV_ENC_MAP_INPUT_RESOURCE_VER,
            registeredResource: registration.resource.0,
            ..Default::default()
        };
        nvenc_for(api, session, unsafe { (api.map_input_resource)(session, &mut params) })?;
        let id = tables.id();
        tables.mapped.insert(
            id,
            Mapped {
                resource: Raw(params.mappedResource),
                format: params.mappedBufferFmt,
                desc: registration.desc,
            },
        );
        Ok(MappedInputHandle(id))
    }

    fn unmap_resource(&self, ctx: ContextHandle, enc: EncoderHandle, mapped: MappedInputHandle) -> DriverResult<()> {
        let api = encode_api()?;
        let mut tables = self.lock();
        let session = tables.encoder(ctx, enc)?.session.0;
        let mapped = tables
            .mapped
            .remove(&mapped.0)
            .ok_or(NativeStatus::Nvenc(NV_ENC_ERR_INVALID_PTR))?;
        nvenc_for(api, session, unsafe { (api.unmap_input_resource)(session, mapped.resource.0) })
    }

    fn encode_picture(&self, ctx: ContextHandle, enc: EncoderHandle, params: &PictureParams) -> DriverResult<()> {
        let api = encode_api()?;
        let tables = self.lock();
        let session = tables.encoder(ctx, enc)?.session.0;
        let mapped = tables
            .mapped
            .get(&params.input.0)
            .ok_or(NativeStatus::Nvenc(NV_ENC_ERR_INVALID_PTR))?;
        let bitstream = tables
            .bitstreams
            .get(&params.bitstream.0)
            .ok_or(NativeStatus::Nvenc(NV_ENC_ERR_INVALID_PTR))?;
        let mut pic = NV_ENC_PIC_PARAMS {
            version: NV_ENC_PIC_PARAMS_VER,
            inputWidth: mapped.desc.width,
            inputHeight: mapped.desc.height,
            inputPitch: mapped.desc.buffer.pitch as u32,
            inputBuffer: mapped.resource.0,
            outputBitstream: bitstream.0,
            bufferFmt: mapped.format,
            pictureStruct: NV_ENC_PIC_STRUCT::NV_ENC_PIC_STRUCT_FRAME,
            inputTimeStamp: params.pts,
            encodePicFlags: if params.force_idr {
                NV_ENC_PIC_FLAGS::NV_ENC_PIC_FLAG_FORCEIDR as u32 | NV_ENC_PIC_FLAGS::NV_ENC_PIC_FLAG_OUTPUT_SPSPPS as u32
            } else {
                0
            },
            ..Default::default()
        };
        nvenc_for(api, session, unsafe { (api.encode_picture)(session, &mut pic) })
    }

    fn end_of_stream(&self, ctx: ContextHandle, enc: EncoderHandle) -> DriverResult<()> {
        let api = encode_api()?;
        let session = self.lock().encoder(ctx, enc)?.session.0;
        let mut pic = NV_ENC_PIC_PARAMS {
            version: NV_ENC_PIC_PARAMS_VER,
            encodePicFlags: NV_ENC_PIC_FLAGS::NV_ENC_PIC_FLAG_EOS as u32,
            ..Default::default()
        };
        nvenc_for(api, session, unsafe { (api.encode_picture)(session, &mut pic) })
    }

    fn lock_bitstream(&self, ctx: ContextHandle, enc: EncoderHandle, bitstream: BitstreamHandle) -> DriverResult<LockedBitstream> {
        let api = encode_api()?;
        let tables = self.lock();
        let session = tables.encoder(ctx, enc)?.session.0;
        let output = tables
            .bitstreams
            .get(&bitstream.0)
            .ok_or(NativeStatus::Nvenc(NV_ENC_ERR_INVALID_PTR))?;
        let mut lock = NV_ENC_LOCK_BITSTREAM {
            version: NV_ENC_LOCK_BITSTREAM_VER,
            outputBitstream: output.0,
            ..Default::default()
        };
        nvenc_for(api, session, unsafe { (api.lock_bitstream)(session, &mut lock) })?;
        Ok(LockedBitstream {
            data: lock.bitstreamBufferPtr as *const u8,
            len: lock.bitstreamSizeInBytes as usize,
            keyframe: matches!(
                lock.pictureType,
                NV_ENC_PIC_TYPE::NV_ENC_PIC_TYPE_IDR | NV_ENC_PIC_TYPE::NV_ENC_PIC_TYPE_I
            ),
            pts: lock.outputTimeStamp,
        })
    }

    fn unlock_bitstream(&self, ctx: ContextHandle, enc: EncoderHandle, bitstream: BitstreamHandle) -> DriverResult<()> {
        let api = encode_api()?;
        let tables = self.lock();
        let session = tables.encoder(ctx, enc)?.session.0;
        let output = tables
            .bitstreams
            .get(&bitstream.0)
            .ok_or(NativeStatus::Nvenc(NV_ENC_ERR_INVALID_PTR))?;
        nvenc_for(api, session, unsafe { (api.unlock_bitstream)(session, output.0) })
    }

    fn destroy_encoder(&self, ctx: ContextHandle, enc: EncoderHandle) -> DriverResult<()> {
        let api = encode_api()?;
        let encoder = {
            let mut tables = self.lock();
            tables.encoder(ctx, enc)?;
            tables
                .encoders
                .remove(&enc.0)
                .ok_or(NativeStatus::Nvenc(NV_ENC_ERR_INVALID_PTR))?
        };
        nvenc_for(api, ptr::null_mut(), unsafe { (api.destroy_encoder)(encoder.session.0) })
    }

    fn open_decoder(&self, ctx: ContextHandle, settings: &DecoderSettings) -> DriverResult<DecoderHandle> {
        self.context(ctx)?;
        if settings.layout == PixelLayout::Yuv444p && settings.codec == Codec::Av1 {
            return Err(NativeStatus::Cuda(CUDA_ERROR_NOT_SUPPORTED));
        }
        let decoder = NvDecoder::open(settings)?;
        let mut tables = self.lock();
        let id = tables.id();
        tables.decoders.insert(id, decoder);
        Ok(DecoderHandle(id))
    }

    fn next_output_slot(&self, dec: DecoderHandle) -> Option<usize> {
        self.lock().decoders.get(&dec.0).map(|d| d.next_slot())
    }

    fn decode(&self, ctx: ContextHandle, dec: DecoderHandle, data: &[u8], pts: u64) -> DriverResult<Option<DecodedPicture>> {
        self.context(ctx)?;
        let mut tables = self.lock();
        let decoder = tables
            .decoders
            .get_mut(&dec.0)
            .ok_or(NativeStatus::Cuda(CUDA_ERROR_INVALID_HANDLE))?;
        decoder.decode(data, pts)
    }

    fn destroy_decoder(&self, ctx: ContextHandle, dec: DecoderHandle) -> DriverResult<()> {
        self.context(ctx)?;
        let decoder = self
            .lock()
            .decoders
            .remove(&dec.0)
            .ok_or(NativeStatus::Cuda(CUDA_ERROR_INVALID_HANDLE))?;
        drop(decoder);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quality_qp() {
        assert_eq!(quality_qp(100, true), 0);
        assert_eq!(quality_qp(100, false), 1);
        assert_eq!(quality_qp(0, false), 51);
        assert!(quality_qp(80, false) < quality_qp(40, false));
    }

    #[test]
    fn test_buffer_formats() {
        assert!(matches!(buffer_format(PixelFormat::Bgrx), NV_ENC_BUFFER_FORMAT::NV_ENC_BUFFER_FORMAT_ARGB));
        assert!(matches!(buffer_format(PixelFormat::Rgba), NV_ENC_BUFFER_FORMAT::NV_ENC_BUFFER_FORMAT_ABGR));
        assert!(matches!(buffer_format(PixelFormat::Gbrp), NV_ENC_BUFFER_FORMAT::NV_ENC_BUFFER_FORMAT_YUV444));
    }

    #[test]
    fn test_profile_guids_match_codec() {
        assert!(guid_eq(&profile_guid(Profile::H264High444), &NV_ENC_H264_PROFILE_HIGH_444_GUID));
        assert!(!guid_eq(&codec_guid(Codec::H264), &codec_guid(Codec::Hevc)));
    }
}
