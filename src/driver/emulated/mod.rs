//! An in-process accelerator.
//!
//! `EmulatedDriver` behaves like a CUDA + NVENC + NVDEC stack closely enough
//! for the session layer to run unchanged on top of it: contexts are capped
//! per device and must be current on the calling thread, device buffers are
//! pitched, encoder inputs go through register, map, encode, lock, unlock,
//! unmap and unregister in that order, and every misuse returns the status
//! code the hardware would. Failures can be injected at named points.

use std::collections::{HashMap, VecDeque};
use std::ptr::NonNull;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::thread::{self, ThreadId};

use tracing::debug;

use crate::csc::kernels::{self, PackedRgb, PlanarTarget};
use crate::types::{roundup, Codec, PixelFormat, PixelLayout, Preset, Profile};

use super::status::*;
use super::{
    BitstreamHandle, CodecCaps, ContextHandle, CscJob, DecodedPicture, DecoderHandle,
    DecoderSettings, DevicePitched, DeviceProperties, DevicePtr, Driver, DriverResult,
    EncoderHandle, EncoderSettings, HostAllocation, LockedBitstream, MappedInputHandle,
    MemoryInfo, NativeStatus, PictureParams, RegisterDesc, RegistrationHandle, SurfaceLayout,
    SurfaceMemory,
};

mod codec;

pub use codec::{rle_decode, rle_encode, tight_len};
use codec::{Picture, StreamDecoder, StreamEncoder, StreamError};

/// Capabilities the emulated encoder advertises for a codec.
#[must_use]
pub fn default_caps(codec: Codec) -> CodecCaps {
    let extended = codec != Codec::Av1;
    CodecCaps {
        codec,
        min_width: 16,
        min_height: 16,
        max_width: 4096,
        max_height: 4096,
        layouts: if extended {
            vec![PixelLayout::Nv12, PixelLayout::Yuv444p]
        } else {
            vec![PixelLayout::Nv12]
        },
        lossless: extended,
        rgb_input: false,
        presets: Preset::all()
            .filter(|p| extended || !p.is_lossless())
            .collect(),
        profiles: match codec {
            Codec::H264 => vec![
                Profile::H264Baseline,
                Profile::H264Main,
                Profile::H264High,
                Profile::H264High444,
            ],
            Codec::Hevc => vec![Profile::HevcMain, Profile::HevcMain444],
            Codec::Av1 => vec![Profile::Av1Main],
        },
    }
}

/// Description of one emulated device.
#[derive(Debug, Clone)]
pub struct EmulatedDevice {
    pub name: String,
    pub pci_bus_id: String,
    pub total_memory: u64,
    pub free_memory: u64,
    pub compute_capability: (u32, u32),
    pub can_map_host_memory: bool,
    /// Contexts that can exist at once before creation fails.
    pub max_contexts: u32,
    /// Device pitches are rounded up to this many bytes.
    pub pitch_alignment: usize,
    pub codecs: Vec<CodecCaps>,
}

impl EmulatedDevice {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pci_bus_id: String::from("0000:01:00.0"),
            total_memory: 8 << 30,
            free_memory: 7 << 30,
            compute_capability: (8, 6),
            can_map_host_memory: true,
            max_contexts: 32,
            pitch_alignment: 512,
            codecs: Codec::ALL.iter().map(|&c| default_caps(c)).collect(),
        }
    }

    #[must_use]
    pub fn pci_bus_id(mut self, id: impl Into<String>) -> Self {
        self.pci_bus_id = id.into();
        self
    }

    #[must_use]
    pub fn memory(mut self, total: u64, free: u64) -> Self {
        self.total_memory = total;
        self.free_memory = free.min(total);
        self
    }

    #[must_use]
    pub fn compute_capability(mut self, major: u32, minor: u32) -> Self {
        self.compute_capability = (major, minor);
        self
    }

    #[must_use]
    pub fn max_contexts(mut self, max: u32) -> Self {
        self.max_contexts = max;
        self
    }

    #[must_use]
    pub fn can_map_host_memory(mut self, can: bool) -> Self {
        self.can_map_host_memory = can;
        self
    }

    /// Drop the 4:4:4 layout and lossless mode from every codec.
    #[must_use]
    pub fn without_yuv444(mut self) -> Self {
        for caps in &mut self.codecs {
            caps.layouts.retain(|l| *l == PixelLayout::Nv12);
            caps.lossless = false;
            caps.presets.retain(|p| !p.is_lossless());
            caps.profiles.retain(|p| !p.supports_yuv444());
        }
        self
    }

    /// Drop lossless mode from every codec.
    #[must_use]
    pub fn without_lossless(mut self) -> Self {
        for caps in &mut self.codecs {
            caps.lossless = false;
            caps.presets.retain(|p| !p.is_lossless());
        }
        self
    }

    /// Let encoders consume packed RGB directly.
    #[must_use]
    pub fn rgb_input(mut self, enabled: bool) -> Self {
        for caps in &mut self.codecs {
            caps.rgb_input = enabled;
        }
        self
    }

    /// Restrict the presets a codec reports.
    #[must_use]
    pub fn presets(mut self, codec: Codec, presets: &[Preset]) -> Self {
        if let Some(caps) = self.codecs.iter_mut().find(|c| c.codec == codec) {
            caps.presets = presets.to_vec();
        }
        self
    }

    /// Remove a codec entirely.
    #[must_use]
    pub fn without_codec(mut self, codec: Codec) -> Self {
        self.codecs.retain(|c| c.codec != codec);
        self
    }

    fn caps(&self, codec: Codec) -> Option<&CodecCaps> {
        self.codecs.iter().find(|c| c.codec == codec)
    }
}

/// Where an injected failure fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultPoint {
    CreateContext,
    AllocHost,
    AllocDevice,
    Upload,
    Convert,
    OpenEncoder,
    InitializeEncoder,
    Reconfigure,
    Register,
    Map,
    Encode,
    LockBitstream,
    OpenDecoder,
    Decode,
}

/// Live object counts, for leak checks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EmulatedStats {
    pub contexts: usize,
    pub host_allocations: usize,
    pub device_allocations: usize,
    pub encoders: usize,
    pub bitstreams: usize,
    pub registrations: usize,
    pub mapped_inputs: usize,
    pub decoders: usize,
    pub encoded_frames: u64,
    pub keyframes: u64,
    pub decoded_frames: u64,
    /// Registrations still alive when their encoder was destroyed.
    pub leaked_registrations: u64,
    /// Objects still alive when their context was destroyed.
    pub leaked_on_context_destroy: u64,
}

#[derive(Debug)]
struct DeviceBuffer {
    ctx: u64,
    ordinal: u32,
    data: Vec<u8>,
    pitch: usize,
    rows: usize,
}

#[derive(Debug)]
struct Registration {
    desc: RegisterDesc,
    mapped: Option<u64>,
}

#[derive(Debug, Default)]
struct Bitstream {
    data: Vec<u8>,
    ready: bool,
    locked: bool,
    keyframe: bool,
    pts: u64,
}

#[derive(Debug)]
struct EncoderState {
    ctx: u64,
    ordinal: u32,
    codec: Codec,
    settings: Option<EncoderSettings>,
    max_size: (u32, u32),
    registrations: HashMap<u64, Registration>,
    mapped: HashMap<u64, u64>,
    bitstreams: HashMap<u64, Bitstream>,
    stream: StreamEncoder,
}

#[derive(Debug)]
struct DecoderState {
    ctx: u64,
    settings: DecoderSettings,
    stream: StreamDecoder,
    slots: Vec<SurfaceMemory>,
    next_slot: usize,
}

#[derive(Debug, Default)]
struct State {
    next_id: u64,
    contexts: HashMap<u64, u32>,
    current: HashMap<ThreadId, Vec<u64>>,
    host: HashMap<u64, usize>,
    device: HashMap<u64, DeviceBuffer>,
    encoders: HashMap<u64, EncoderState>,
    decoders: HashMap<u64, DecoderState>,
    faults: HashMap<FaultPoint, VecDeque<NativeStatus>>,
    free_memory: Vec<u64>,
    encoded_frames: u64,
    keyframes: u64,
    decoded_frames: u64,
    leaked_registrations: u64,
    leaked_on_context_destroy: u64,
}

impl State {
    fn id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn fault(&mut self, point: FaultPoint) -> DriverResult<()> {
        match self.faults.get_mut(&point).and_then(VecDeque::pop_front) {
            Some(status) => {
                debug!("emulated fault at {:?}: {}", point, status);
                Err(status)
            }
            None => Ok(()),
        }
    }

    fn require_current(&self, ctx: ContextHandle) -> DriverResult<()> {
        let top = self
            .current
            .get(&thread::current().id())
            .and_then(|stack| stack.last());
        if top == Some(&ctx.0) && self.contexts.contains_key(&ctx.0) {
            Ok(())
        } else {
            Err(NativeStatus::Cuda(CUDA_ERROR_INVALID_CONTEXT))
        }
    }

    fn contexts_on(&self, ordinal: u32) -> usize {
        self.contexts.values().filter(|&&o| o == ordinal).count()
    }

    fn used_memory(&self, ordinal: u32) -> u64 {
        self.device
            .values()
            .filter(|b| b.ordinal == ordinal)
            .map(|b| b.data.len() as u64)
            .sum()
    }

    fn encoder(&mut self, ctx: ContextHandle, enc: EncoderHandle) -> DriverResult<&mut EncoderState> {
        self.require_current(ctx)?;
        match self.encoders.get_mut(&enc.0) {
            Some(state) if state.ctx == ctx.0 => Ok(state),
            _ => Err(NativeStatus::Nvenc(NV_ENC_ERR_INVALID_PTR)),
        }
    }
}

/// The emulated accelerator. Cheap to clone; clones share state.
#[derive(Debug, Clone)]
pub struct EmulatedDriver {
    devices: Arc<Vec<EmulatedDevice>>,
    state: Arc<Mutex<State>>,
    api_version: (u32, u32),
}

impl Default for EmulatedDriver {
    fn default() -> Self {
        Self::new(vec![EmulatedDevice::new("Emulated Accelerator")])
    }
}

impl EmulatedDriver {
    pub const API_VERSION: (u32, u32) = (12, 2);
    pub const REQUIRED_API_VERSION: (u32, u32) = (12, 0);
    /// Output surfaces per decoder unless the session asks for more.
    pub const OUTPUT_SURFACES: usize = 2;

    #[must_use]
    pub fn new(devices: Vec<EmulatedDevice>) -> Self {
        let state = State {
            free_memory: devices.iter().map(|d| d.free_memory).collect(),
            ..Default::default()
        };
        Self {
            devices: Arc::new(devices),
            state: Arc::new(Mutex::new(state)),
            api_version: Self::API_VERSION,
        }
    }

    /// Pretend the installed driver reports a different API version.
    #[must_use]
    pub fn with_api_version(mut self, major: u32, minor: u32) -> Self {
        self.api_version = (major, minor);
        self
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // A panic while holding the lock leaves plain data behind.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn device(&self, ordinal: u32) -> DriverResult<&EmulatedDevice> {
        self.devices
            .get(ordinal as usize)
            .ok_or(NativeStatus::Cuda(CUDA_ERROR_INVALID_DEVICE))
    }

    /// Make the next `times` calls at `point` fail with `status`.
    pub fn inject_fault(&self, point: FaultPoint, status: NativeStatus, times: usize) {
        let mut state = self.lock();
        let queue = state.faults.entry(point).or_default();
        queue.extend(std::iter::repeat(status).take(times));
    }

    /// Drop every pending injected fault.
    pub fn clear_faults(&self) {
        self.lock().faults.clear();
    }

    /// Change the free memory a device reports.
    pub fn set_free_memory(&self, ordinal: u32, free: u64) {
        if let Some(slot) = self.lock().free_memory.get_mut(ordinal as usize) {
            *slot = free;
        }
    }

    /// Contexts currently open on a device.
    #[must_use]
    pub fn contexts_on(&self, ordinal: u32) -> usize {
        self.lock().contexts_on(ordinal)
    }

    #[must_use]
    pub fn stats(&self) -> EmulatedStats {
        let state = self.lock();
        EmulatedStats {
            contexts: state.contexts.len(),
            host_allocations: state.host.len(),
            device_allocations: state.device.len(),
            encoders: state.encoders.len(),
            bitstreams: state.encoders.values().map(|e| e.bitstreams.len()).sum(),
            registrations: state.encoders.values().map(|e| e.registrations.len()).sum(),
            mapped_inputs: state.encoders.values().map(|e| e.mapped.len()).sum(),
            decoders: state.decoders.len(),
            encoded_frames: state.encoded_frames,
            keyframes: state.keyframes,
            decoded_frames: state.decoded_frames,
            leaked_registrations: state.leaked_registrations,
            leaked_on_context_destroy: state.leaked_on_context_destroy,
        }
    }
}

/// Surface format an encoder stream uses for its settings.
fn stream_format(settings: &EncoderSettings) -> PixelFormat {
    let layout = if settings.profile.supports_yuv444() {
        PixelLayout::Yuv444p
    } else {
        PixelLayout::Nv12
    };
    layout.surface_format(settings.lossless)
}

/// Copy tight planes out of a pitched planar buffer.
fn gather_planes(
    buffer: &DeviceBuffer,
    format: PixelFormat,
    width: u32,
    height: u32,
    plane_rows: u32,
) -> DriverResult<Vec<u8>> {
    let (w, h) = (width as usize, height as usize);
    let plane = buffer.pitch * plane_rows as usize;
    let mut out = Vec::with_capacity(tight_len(format, width, height));
    let planes: Vec<(usize, usize, usize)> = match format {
        PixelFormat::Nv12 => vec![(0, w, h), (plane, w.next_multiple_of(2), h.div_ceil(2))],
        PixelFormat::Yuv444p | PixelFormat::Gbrp => {
            vec![(0, w, h), (plane, w, h), (2 * plane, w, h)]
        }
        _ => return Err(NativeStatus::Nvenc(NV_ENC_ERR_INVALID_PARAM)),
    };
    for (offset, row_bytes, rows) in planes {
        for y in 0..rows {
            let start = offset + y * buffer.pitch;
            let row = buffer
                .data
                .get(start..start + row_bytes)
                .ok_or(NativeStatus::Nvenc(NV_ENC_ERR_INVALID_PARAM))?;
            out.extend_from_slice(row);
        }
    }
    Ok(out)
}

fn stream_error_status(err: StreamError) -> NativeStatus {
    match err {
        StreamError::Truncated | StreamError::BadMagic | StreamError::BadHeader => {
            NativeStatus::Cuda(CUDA_ERROR_INVALID_VALUE)
        }
        StreamError::Checksum | StreamError::Payload => {
            NativeStatus::Decode(CUVID_DECODE_STATUS_ERROR)
        }
        StreamError::WrongCodec | StreamError::MissingReference => {
            NativeStatus::Decode(CUVID_DECODE_STATUS_ERROR_CONCEALED)
        }
    }
}

impl Driver for EmulatedDriver {
    fn name(&self) -> &str {
        "emulated"
    }

    fn api_version(&self) -> DriverResult<(u32, u32)> {
        Ok(self.api_version)
    }

    fn required_api_version(&self) -> (u32, u32) {
        Self::REQUIRED_API_VERSION
    }

    fn device_count(&self) -> DriverResult<u32> {
        Ok(self.devices.len() as u32)
    }

    fn device_properties(&self, ordinal: u32) -> DriverResult<DeviceProperties> {
        let device = self.device(ordinal)?;
        Ok(DeviceProperties {
            ordinal,
            name: device.name.clone(),
            pci_bus_id: device.pci_bus_id.clone(),
            total_memory: device.total_memory,
            compute_capability: device.compute_capability,
            multiprocessors: 16,
            can_map_host_memory: device.can_map_host_memory,
        })
    }

    fn memory_info(&self, ordinal: u32) -> DriverResult<MemoryInfo> {
        let device = self.device(ordinal)?;
        let state = self.lock();
        let free = state
            .free_memory
            .get(ordinal as usize)
            .copied()
            .unwrap_or(device.free_memory)
            .saturating_sub(state.used_memory(ordinal));
        Ok(MemoryInfo {
            free,
            total: device.total_memory,
        })
    }

    fn codec_caps(&self, ordinal: u32, codec: Codec) -> DriverResult<Option<CodecCaps>> {
        Ok(self.device(ordinal)?.caps(codec).cloned())
    }

    fn create_context(&self, ordinal: u32) -> DriverResult<ContextHandle> {
        let device = self.device(ordinal)?;
        let mut state = self.lock();
        state.fault(FaultPoint::CreateContext)?;
        if state.contexts_on(ordinal) >= device.max_contexts as usize {
            return Err(NativeStatus::Cuda(CUDA_ERROR_OUT_OF_MEMORY));
        }
        let id = state.id();
        state.contexts.insert(id, ordinal);
        Ok(ContextHandle(id))
    }

    fn destroy_context(&self, ctx: ContextHandle) -> DriverResult<()> {
        let mut state = self.lock();
        if state.contexts.remove(&ctx.0).is_none() {
            return Err(NativeStatus::Cuda(CUDA_ERROR_INVALID_CONTEXT));
        }
        for stack in state.current.values_mut() {
            stack.retain(|&c| c != ctx.0);
        }
        let before = state.device.len() + state.encoders.len() + state.decoders.len();
        state.device.retain(|_, b| b.ctx != ctx.0);
        state.encoders.retain(|_, e| e.ctx != ctx.0);
        state.decoders.retain(|_, d| d.ctx != ctx.0);
        let after = state.device.len() + state.encoders.len() + state.decoders.len();
        state.leaked_on_context_destroy += (before - after) as u64;
        Ok(())
    }

    fn push_context(&self, ctx: ContextHandle) -> DriverResult<()> {
        let mut state = self.lock();
        if !state.contexts.contains_key(&ctx.0) {
            return Err(NativeStatus::Cuda(CUDA_ERROR_INVALID_CONTEXT));
        }
        state.current.entry(thread::current().id()).or_default().push(ctx.0);
        Ok(())
    }

    fn pop_context(&self, ctx: ContextHandle) -> DriverResult<()> {
        let mut state = self.lock();
        let stack = state.current.entry(thread::current().id()).or_default();
        if stack.last() != Some(&ctx.0) {
            return Err(NativeStatus::Cuda(CUDA_ERROR_INVALID_CONTEXT));
        }
        stack.pop();
        Ok(())
    }

    fn alloc_host(&self, ctx: ContextHandle, len: usize) -> DriverResult<HostAllocation> {
        let mut state = self.lock();
        state.require_current(ctx)?;
        state.fault(FaultPoint::AllocHost)?;
        if len == 0 {
            return Err(NativeStatus::Cuda(CUDA_ERROR_INVALID_VALUE));
        }
        let memory: Box<[u8]> = vec![0u8; len].into_boxed_slice();
        let ptr = NonNull::new(Box::into_raw(memory).cast::<u8>())
            .ok_or(NativeStatus::Cuda(CUDA_ERROR_OUT_OF_MEMORY))?;
        let id = state.id();
        state.host.insert(id, len);
        // SAFETY: the boxed slice is leaked until `free_host` rebuilds it.
        Ok(unsafe { HostAllocation::from_raw(ptr, len, id) })
    }

    fn free_host(&self, ctx: ContextHandle, host: HostAllocation) -> DriverResult<()> {
        let mut state = self.lock();
        state.require_current(ctx)?;
        match state.host.remove(&host.id()) {
            Some(len) if len == host.len() => {
                // SAFETY: pointer and length come from `alloc_host`.
                drop(unsafe {
                    Box::from_raw(std::ptr::slice_from_raw_parts_mut(host.as_ptr(), len))
                });
                Ok(())
            }
            _ => Err(NativeStatus::Cuda(CUDA_ERROR_INVALID_VALUE)),
        }
    }

    fn alloc_pitched(&self, ctx: ContextHandle, width_bytes: usize, rows: usize) -> DriverResult<DevicePitched> {
        let mut state = self.lock();
        state.require_current(ctx)?;
        state.fault(FaultPoint::AllocDevice)?;
        if width_bytes == 0 || rows == 0 {
            return Err(NativeStatus::Cuda(CUDA_ERROR_INVALID_VALUE));
        }
        let ordinal = state.contexts.get(&ctx.0).copied().unwrap_or_default();
        let alignment = self.device(ordinal)?.pitch_alignment.max(1);
        let pitch = width_bytes.next_multiple_of(alignment);
        let size = (pitch * rows) as u64;
        let budget = state
            .free_memory
            .get(ordinal as usize)
            .copied()
            .unwrap_or_default()
            .saturating_sub(state.used_memory(ordinal));
        if size > budget {
            return Err(NativeStatus::Cuda(CUDA_ERROR_OUT_OF_MEMORY));
        }
        let id = state.id();
        state.device.insert(
            id,
            DeviceBuffer {
                ctx: ctx.0,
                ordinal,
                data: vec![0u8; pitch * rows],
                pitch,
                rows,
            },
        );
        Ok(DevicePitched {
            ptr: DevicePtr(id),
            pitch,
            width_bytes,
            rows,
        })
    }

    fn free_device(&self, ctx: ContextHandle, buffer: DevicePitched) -> DriverResult<()> {
        let mut state = self.lock();
        state.require_current(ctx)?;
        match state.device.get(&buffer.ptr.0) {
            Some(b) if b.ctx == ctx.0 => {
                state.device.remove(&buffer.ptr.0);
                Ok(())
            }
            _ => Err(NativeStatus::Cuda(CUDA_ERROR_INVALID_VALUE)),
        }
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
        let mut state = self.lock();
        state.require_current(ctx)?;
        state.fault(FaultPoint::Upload)?;
        let buffer = state
            .device
            .get_mut(&dst.ptr.0)
            .ok_or(NativeStatus::Cuda(CUDA_ERROR_INVALID_VALUE))?;
        let src = src.as_slice();
        if rows == 0
            || width_bytes > src_pitch
            || width_bytes > buffer.pitch
            || rows > buffer.rows
            || src_pitch * (rows - 1) + width_bytes > src.len()
        {
            return Err(NativeStatus::Cuda(CUDA_ERROR_INVALID_VALUE));
        }
        for y in 0..rows {
            let s = &src[y * src_pitch..y * src_pitch + width_bytes];
            buffer.data[y * buffer.pitch..y * buffer.pitch + width_bytes].copy_from_slice(s);
        }
        Ok(())
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
        let state = self.lock();
        state.require_current(ctx)?;
        let buffer = state
            .device
            .get(&src.ptr.0)
            .ok_or(NativeStatus::Cuda(CUDA_ERROR_INVALID_VALUE))?;
        if rows == 0
            || width_bytes > dst_pitch
            || width_bytes > buffer.pitch
            || rows > buffer.rows
            || dst_pitch * (rows - 1) + width_bytes > dst.len()
        {
            return Err(NativeStatus::Cuda(CUDA_ERROR_INVALID_VALUE));
        }
        for y in 0..rows {
            let s = &buffer.data[y * buffer.pitch..y * buffer.pitch + width_bytes];
            dst[y * dst_pitch..y * dst_pitch + width_bytes].copy_from_slice(s);
        }
        Ok(())
    }

    fn supports_csc(&self) -> bool {
        true
    }

    fn launch_csc(&self, ctx: ContextHandle, job: &CscJob) -> DriverResult<()> {
        let mut state = self.lock();
        state.require_current(ctx)?;
        state.fault(FaultPoint::Convert)?;
        if job.src.ptr == job.dst.ptr {
            return Err(NativeStatus::Cuda(CUDA_ERROR_INVALID_VALUE));
        }
        let mut dst = state
            .device
            .remove(&job.dst.ptr.0)
            .ok_or(NativeStatus::Cuda(CUDA_ERROR_INVALID_VALUE))?;
        let result = match state.device.get(&job.src.ptr.0) {
            Some(src) => {
                let packed = PackedRgb {
                    data: &src.data,
                    stride: src.pitch,
                    format: job.src_format,
                    width: job.src_width,
                    height: job.src_height,
                };
                let mut target = PlanarTarget {
                    data: &mut dst.data,
                    pitch: dst.pitch,
                    format: job.dst_format,
                    width: job.dst_width,
                    height: job.dst_height,
                    plane_rows: job.plane_rows,
                };
                kernels::convert_to_planar(&packed, &mut target)
                    .map_err(|_| NativeStatus::Cuda(CUDA_ERROR_INVALID_VALUE))
            }
            None => Err(NativeStatus::Cuda(CUDA_ERROR_INVALID_VALUE)),
        };
        state.device.insert(job.dst.ptr.0, dst);
        result
    }

    fn open_encoder(&self, ctx: ContextHandle, codec: Codec) -> DriverResult<EncoderHandle> {
        let mut state = self.lock();
        state.require_current(ctx)?;
        state.fault(FaultPoint::OpenEncoder)?;
        let ordinal = state.contexts.get(&ctx.0).copied().unwrap_or_default();
        let caps = self
            .device(ordinal)?
            .caps(codec)
            .ok_or(NativeStatus::Nvenc(NV_ENC_ERR_UNSUPPORTED_DEVICE))?;
        let id = state.id();
        state.encoders.insert(
            id,
            EncoderState {
                ctx: ctx.0,
                ordinal,
                codec,
                settings: None,
                max_size: (caps.max_width, caps.max_height),
                registrations: HashMap::new(),
                mapped: HashMap::new(),
                bitstreams: HashMap::new(),
                stream: StreamEncoder::default(),
            },
        );
        Ok(EncoderHandle(id))
    }

    fn initialize_encoder(&self, ctx: ContextHandle, enc: EncoderHandle, settings: &EncoderSettings) -> DriverResult<()> {
        let mut state = self.lock();
        state.fault(FaultPoint::InitializeEncoder)?;
        let encoder = state.encoder(ctx, enc)?;
        if encoder.settings.is_some() {
            return Err(NativeStatus::Nvenc(NV_ENC_ERR_INVALID_CALL));
        }
        let caps = self
            .device(encoder.ordinal)?
            .caps(encoder.codec)
            .ok_or(NativeStatus::Nvenc(NV_ENC_ERR_UNSUPPORTED_DEVICE))?;
        if settings.codec != encoder.codec
            || settings.profile.codec() != encoder.codec
            || !caps.fits(settings.width, settings.height)
            || !caps.has_preset(settings.preset)
        {
            return Err(NativeStatus::Nvenc(NV_ENC_ERR_INVALID_PARAM));
        }
        if !caps.has_profile(settings.profile)
            || (settings.lossless && !caps.lossless)
            || (settings.profile.supports_yuv444() && !caps.supports_layout(PixelLayout::Yuv444p))
            || (settings.lossless && !settings.profile.supports_yuv444())
        {
            return Err(NativeStatus::Nvenc(NV_ENC_ERR_UNSUPPORTED_PARAM));
        }
        if settings.input_format.is_packed_rgb() && !caps.rgb_input {
            return Err(NativeStatus::Nvenc(NV_ENC_ERR_UNSUPPORTED_PARAM));
        }
        encoder.max_size = (settings.width, settings.height);
        encoder.settings = Some(settings.clone());
        Ok(())
    }

    fn reconfigure_encoder(&self, ctx: ContextHandle, enc: EncoderHandle, settings: &EncoderSettings) -> DriverResult<()> {
        let mut state = self.lock();
        state.fault(FaultPoint::Reconfigure)?;
        let encoder = state.encoder(ctx, enc)?;
        let current = encoder
            .settings
            .as_ref()
            .ok_or(NativeStatus::Nvenc(NV_ENC_ERR_ENCODER_NOT_INITIALIZED))?;
        if settings.width > encoder.max_size.0 || settings.height > encoder.max_size.1 {
            return Err(NativeStatus::Nvenc(NV_ENC_ERR_INVALID_PARAM));
        }
        // Profile, chroma layout and input format are fixed for the session.
        if settings.codec != current.codec
            || settings.profile != current.profile
            || settings.lossless != current.lossless
            || settings.input_format != current.input_format
        {
            return Err(NativeStatus::Nvenc(NV_ENC_ERR_UNSUPPORTED_PARAM));
        }
        let caps = self
            .device(encoder.ordinal)?
            .caps(encoder.codec)
            .ok_or(NativeStatus::Nvenc(NV_ENC_ERR_UNSUPPORTED_DEVICE))?;
        if !caps.has_preset(settings.preset) {
            return Err(NativeStatus::Nvenc(NV_ENC_ERR_INVALID_PARAM));
        }
        encoder.settings = Some(settings.clone());
        Ok(())
    }

    fn create_bitstream(&self, ctx: ContextHandle, enc: EncoderHandle) -> DriverResult<BitstreamHandle> {
        let mut state = self.lock();
        let id = state.id();
        let encoder = state.encoder(ctx, enc)?;
        if encoder.settings.is_none() {
            return Err(NativeStatus::Nvenc(NV_ENC_ERR_ENCODER_NOT_INITIALIZED));
        }
        encoder.bitstreams.insert(id, Bitstream::default());
        Ok(BitstreamHandle(id))
    }

    fn destroy_bitstream(&self, ctx: ContextHandle, enc: EncoderHandle, bitstream: BitstreamHandle) -> DriverResult<()> {
        let mut state = self.lock();
        let encoder = state.encoder(ctx, enc)?;
        match encoder.bitstreams.get(&bitstream.0) {
            Some(b) if b.locked => Err(NativeStatus::Nvenc(NV_ENC_ERR_INVALID_CALL)),
            Some(_) => {
                encoder.bitstreams.remove(&bitstream.0);
                Ok(())
            }
            None => Err(NativeStatus::Nvenc(NV_ENC_ERR_INVALID_PTR)),
        }
    }

    fn register_resource(&self, ctx: ContextHandle, enc: EncoderHandle, desc: &RegisterDesc) -> DriverResult<RegistrationHandle> {
        let mut state = self.lock();
        state.fault(FaultPoint::Register)?;
        let id = state.id();
        let buffer = state
            .device
            .get(&desc.buffer.ptr.0)
            .map(|b| (b.pitch, b.rows))
            .ok_or(NativeStatus::Nvenc(NV_ENC_ERR_RESOURCE_REGISTER_FAILED))?;
        let encoder = state.encoder(ctx, enc)?;
        let settings = encoder
            .settings
            .as_ref()
            .ok_or(NativeStatus::Nvenc(NV_ENC_ERR_ENCODER_NOT_INITIALIZED))?;
        if desc.format != settings.input_format {
            return Err(NativeStatus::Nvenc(NV_ENC_ERR_INVALID_PARAM));
        }
        let (row_bytes, rows) = if desc.format.is_packed_rgb() {
            (desc.width as usize * 4, desc.height as usize)
        } else {
            (
                desc.width as usize,
                desc.plane_rows as usize * desc.format.plane_count(),
            )
        };
        if desc.buffer.pitch != buffer.0
            || buffer.0 < row_bytes
            || buffer.1 < rows
            || (desc.format.is_planar() && (desc.plane_rows as usize) < desc.height as usize)
        {
            return Err(NativeStatus::Nvenc(NV_ENC_ERR_INVALID_PARAM));
        }
        encoder.registrations.insert(id, Registration { desc: *desc, mapped: None });
        Ok(RegistrationHandle(id))
    }

    fn unregister_resource(&self, ctx: ContextHandle, enc: EncoderHandle, reg: RegistrationHandle) -> DriverResult<()> {
        let mut state = self.lock();
        let encoder = state.encoder(ctx, enc)?;
        match encoder.registrations.get(&reg.0) {
            None => Err(NativeStatus::Nvenc(NV_ENC_ERR_RESOURCE_NOT_REGISTERED)),
            Some(r) if r.mapped.is_some() => Err(NativeStatus::Nvenc(NV_ENC_ERR_INVALID_CALL)),
            Some(_) => {
                encoder.registrations.remove(&reg.0);
                Ok(())
            }
        }
    }

    fn map_resource(&self, ctx: ContextHandle, enc: EncoderHandle, reg: RegistrationHandle) -> DriverResult<MappedInputHandle> {
        let mut state = self.lock();
        state.fault(FaultPoint::Map)?;
        let id = state.id();
        let encoder = state.encoder(ctx, enc)?;
        let registration = encoder
            .registrations
            .get_mut(&reg.0)
            .ok_or(NativeStatus::Nvenc(NV_ENC_ERR_RESOURCE_NOT_REGISTERED))?;
        if registration.mapped.is_some() {
            return Err(NativeStatus::Nvenc(NV_ENC_ERR_MAP_FAILED));
        }
        registration.mapped = Some(id);
        encoder.mapped.insert(id, reg.0);
        Ok(MappedInputHandle(id))
    }

    fn unmap_resource(&self, ctx: ContextHandle, enc: EncoderHandle, mapped: MappedInputHandle) -> DriverResult<()> {
        let mut state = self.lock();
        let encoder = state.encoder(ctx, enc)?;
        let reg = encoder
            .mapped
            .remove(&mapped.0)
            .ok_or(NativeStatus::Nvenc(NV_ENC_ERR_RESOURCE_NOT_MAPPED))?;
        if let Some(registration) = encoder.registrations.get_mut(&reg) {
            registration.mapped = None;
        }
        Ok(())
    }

    fn encode_picture(&self, ctx: ContextHandle, enc: EncoderHandle, params: &PictureParams) -> DriverResult<()> {
        let mut state = self.lock();
        state.require_current(ctx)?;
        state.fault(FaultPoint::Encode)?;

        let (settings, desc) = {
            let encoder = state.encoder(ctx, enc)?;
            let settings = encoder
                .settings
                .clone()
                .ok_or(NativeStatus::Nvenc(NV_ENC_ERR_ENCODER_NOT_INITIALIZED))?;
            let reg = *encoder
                .mapped
                .get(&params.input.0)
                .ok_or(NativeStatus::Nvenc(NV_ENC_ERR_RESOURCE_NOT_MAPPED))?;
            let desc = encoder
                .registrations
                .get(&reg)
                .map(|r| r.desc)
                .ok_or(NativeStatus::Nvenc(NV_ENC_ERR_RESOURCE_NOT_REGISTERED))?;
            match encoder.bitstreams.get(&params.bitstream.0) {
                None => return Err(NativeStatus::Nvenc(NV_ENC_ERR_INVALID_PTR)),
                Some(b) if b.locked => return Err(NativeStatus::Nvenc(NV_ENC_ERR_LOCK_BUSY)),
                Some(_) => {}
            }
            (settings, desc)
        };

        let format = stream_format(&settings);
        let buffer = state
            .device
            .get(&desc.buffer.ptr.0)
            .ok_or(NativeStatus::Nvenc(NV_ENC_ERR_INVALID_PTR))?;
        let planes = if desc.format.is_packed_rgb() {
            // Internal conversion from packed RGB.
            let pitch = roundup(settings.width, 2) as usize;
            let rows = roundup(settings.height, 2);
            let mut converted = vec![0u8; pitch * rows as usize * 3];
            let packed = PackedRgb {
                data: &buffer.data,
                stride: buffer.pitch,
                format: desc.format,
                width: settings.width,
                height: settings.height,
            };
            let mut target = PlanarTarget {
                data: &mut converted,
                pitch,
                format,
                width: settings.width,
                height: settings.height,
                plane_rows: rows,
            };
            kernels::convert_to_planar(&packed, &mut target)
                .map_err(|_| NativeStatus::Nvenc(NV_ENC_ERR_INVALID_PARAM))?;
            let staged = DeviceBuffer {
                ctx: ctx.0,
                ordinal: buffer.ordinal,
                data: converted,
                pitch,
                rows: rows as usize * 3,
            };
            gather_planes(&staged, format, settings.width, settings.height, rows)?
        } else {
            if desc.format != format {
                return Err(NativeStatus::Nvenc(NV_ENC_ERR_INVALID_PARAM));
            }
            gather_planes(buffer, format, settings.width, settings.height, desc.plane_rows)?
        };

        let encoder = state.encoder(ctx, enc)?;
        let (unit, keyframe) = encoder.stream.encode(&Picture {
            codec: settings.codec,
            format,
            width: settings.width,
            height: settings.height,
            planes: &planes,
            quality: settings.quality,
            lossless: settings.lossless,
            force_idr: params.force_idr,
            pts: params.pts,
        });
        if let Some(bitstream) = encoder.bitstreams.get_mut(&params.bitstream.0) {
            bitstream.data = unit;
            bitstream.ready = true;
            bitstream.keyframe = keyframe;
            bitstream.pts = params.pts;
        }
        state.encoded_frames += 1;
        if keyframe {
            state.keyframes += 1;
        }
        Ok(())
    }

    fn end_of_stream(&self, ctx: ContextHandle, enc: EncoderHandle) -> DriverResult<()> {
        let mut state = self.lock();
        let encoder = state.encoder(ctx, enc)?;
        if encoder.settings.is_none() {
            return Err(NativeStatus::Nvenc(NV_ENC_ERR_ENCODER_NOT_INITIALIZED));
        }
        Ok(())
    }

    fn lock_bitstream(&self, ctx: ContextHandle, enc: EncoderHandle, bitstream: BitstreamHandle) -> DriverResult<LockedBitstream> {
        let mut state = self.lock();
        state.require_current(ctx)?;
        state.fault(FaultPoint::LockBitstream)?;
        let encoder = state.encoder(ctx, enc)?;
        let bitstream = encoder
            .bitstreams
            .get_mut(&bitstream.0)
            .ok_or(NativeStatus::Nvenc(NV_ENC_ERR_INVALID_PTR))?;
        if bitstream.locked {
            return Err(NativeStatus::Nvenc(NV_ENC_ERR_LOCK_BUSY));
        }
        if !bitstream.ready {
            return Err(NativeStatus::Nvenc(NV_ENC_ERR_INVALID_CALL));
        }
        bitstream.locked = true;
        Ok(LockedBitstream {
            data: bitstream.data.as_ptr(),
            len: bitstream.data.len(),
            keyframe: bitstream.keyframe,
            pts: bitstream.pts,
        })
    }

    fn unlock_bitstream(&self, ctx: ContextHandle, enc: EncoderHandle, bitstream: BitstreamHandle) -> DriverResult<()> {
        let mut state = self.lock();
        let encoder = state.encoder(ctx, enc)?;
        let bitstream = encoder
            .bitstreams
            .get_mut(&bitstream.0)
            .ok_or(NativeStatus::Nvenc(NV_ENC_ERR_INVALID_PTR))?;
        if !bitstream.locked {
            return Err(NativeStatus::Nvenc(NV_ENC_ERR_INVALID_CALL));
        }
        bitstream.locked = false;
        bitstream.ready = false;
        Ok(())
    }

    fn destroy_encoder(&self, ctx: ContextHandle, enc: EncoderHandle) -> DriverResult<()> {
        let mut state = self.lock();
        state.encoder(ctx, enc)?;
        if let Some(encoder) = state.encoders.remove(&enc.0) {
            state.leaked_registrations += encoder.registrations.len() as u64;
        }
        Ok(())
    }

    fn open_decoder(&self, ctx: ContextHandle, settings: &DecoderSettings) -> DriverResult<DecoderHandle> {
        let mut state = self.lock();
        state.require_current(ctx)?;
        state.fault(FaultPoint::OpenDecoder)?;
        let ordinal = state.contexts.get(&ctx.0).copied().unwrap_or_default();
        let caps = self
            .device(ordinal)?
            .caps(settings.codec)
            .ok_or(NativeStatus::Cuda(CUDA_ERROR_NOT_SUPPORTED))?;
        if !caps.supports_layout(settings.layout) || !caps.fits(settings.width, settings.height) {
            return Err(NativeStatus::Cuda(CUDA_ERROR_NOT_SUPPORTED));
        }
        let surfaces = settings.output_surfaces.max(1);
        let id = state.id();
        state.decoders.insert(
            id,
            DecoderState {
                ctx: ctx.0,
                settings: settings.clone(),
                stream: StreamDecoder::new(settings.codec),
                slots: (0..surfaces).map(|_| Arc::new(RwLock::new(Vec::new()))).collect(),
                next_slot: 0,
            },
        );
        Ok(DecoderHandle(id))
    }

    fn next_output_slot(&self, dec: DecoderHandle) -> Option<usize> {
        self.lock().decoders.get(&dec.0).map(|d| d.next_slot)
    }

    fn decode(&self, ctx: ContextHandle, dec: DecoderHandle, data: &[u8], pts: u64) -> DriverResult<Option<DecodedPicture>> {
        let mut state = self.lock();
        state.require_current(ctx)?;
        state.fault(FaultPoint::Decode)?;
        let decoder = match state.decoders.get_mut(&dec.0) {
            Some(d) if d.ctx == ctx.0 => d,
            _ => return Err(NativeStatus::Cuda(CUDA_ERROR_INVALID_HANDLE)),
        };
        if data.is_empty() {
            return Ok(None);
        }
        let (header, planes) = match decoder.stream.decode(data) {
            Ok(decoded) => decoded,
            Err(err) => {
                debug!("emulated decoder rejected access unit: {:?}", err);
                decoder.stream.reset();
                return Err(stream_error_status(err));
            }
        };
        if header.width > decoder.settings.width.max(16) * 2 || header.height > decoder.settings.height.max(16) * 2 {
            return Err(NativeStatus::Decode(CUVID_DECODE_STATUS_ERROR));
        }

        // Surfaces carry a pitch wider than the picture, like NVDEC's.
        let pitch = roundup(header.width, 64) as usize;
        let layout = SurfaceLayout::planar(header.format, header.width, header.height, pitch);
        let slot = decoder.next_slot;
        let memory = Arc::clone(&decoder.slots[slot]);
        {
            let mut surface = memory
                .write()
                .map_err(|_| NativeStatus::Cuda(CUDA_ERROR_UNKNOWN))?;
            surface.clear();
            surface.resize(layout.byte_len(), 0);
            let (w, h) = (header.width as usize, header.height as usize);
            let rows: Vec<(usize, usize, usize)> = match header.format {
                PixelFormat::Nv12 => vec![(0, w, h), (1, w.next_multiple_of(2), h.div_ceil(2))],
                _ => vec![(0, w, h), (1, w, h), (2, w, h)],
            };
            let mut src = 0;
            for (plane, row_bytes, count) in rows {
                for y in 0..count {
                    let dst = layout.offsets[plane] + y * layout.strides[plane];
                    surface[dst..dst + row_bytes].copy_from_slice(&planes[src..src + row_bytes]);
                    src += row_bytes;
                }
            }
        }
        decoder.next_slot = (slot + 1) % decoder.slots.len();
        state.decoded_frames += 1;
        Ok(Some(DecodedPicture {
            slot,
            memory,
            layout,
            pts,
        }))
    }

    fn destroy_decoder(&self, ctx: ContextHandle, dec: DecoderHandle) -> DriverResult<()> {
        let mut state = self.lock();
        state.require_current(ctx)?;
        match state.decoders.get(&dec.0) {
            Some(d) if d.ctx == ctx.0 => {
                state.decoders.remove(&dec.0);
                Ok(())
            }
            _ => Err(NativeStatus::Cuda(CUDA_ERROR_INVALID_HANDLE)),
        }
    }
}
