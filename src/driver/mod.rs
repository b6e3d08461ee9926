//! The native accelerator seam.
//!
//! [`Driver`] mirrors the subset of the CUDA driver, NVENC and CUVID APIs the
//! sessions use. Calls return raw [`NativeStatus`] codes; translating them is
//! the job of [`crate::failure`]. Two implementations exist:
//!
//! - [`emulated::EmulatedDriver`]: an in-process accelerator that enforces the
//!   same ordering rules as the hardware, used by tests and the info tool.
//! - `nvidia::NvidiaDriver` (`nvidia` feature): CUDA + NVENC + NVDEC.

use std::fmt;
use std::ptr::NonNull;
use std::sync::{Arc, RwLock};

use crate::types::{Codec, PixelFormat, PixelLayout, Preset, Profile};

pub mod emulated;
#[cfg(feature = "nvidia")]
pub mod nvidia;
pub mod status;

pub use status::{DriverResult, NativeStatus};

macro_rules! handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u64);
    };
}

handle!(
    /// An accelerator context.
    ContextHandle
);
handle!(
    /// An open encoder session.
    EncoderHandle
);
handle!(
    /// An encoder output bitstream buffer.
    BitstreamHandle
);
handle!(
    /// A device buffer registered with an encoder.
    RegistrationHandle
);
handle!(
    /// A registered buffer mapped as encoder input.
    MappedInputHandle
);
handle!(
    /// An open decoder.
    DecoderHandle
);
handle!(
    /// Device memory address.
    DevicePtr
);

/// Static properties of one device.
#[derive(Debug, Clone)]
pub struct DeviceProperties {
    pub ordinal: u32,
    pub name: String,
    pub pci_bus_id: String,
    pub total_memory: u64,
    pub compute_capability: (u32, u32),
    pub multiprocessors: u32,
    pub can_map_host_memory: bool,
}

impl fmt::Display for DeviceProperties {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} @ {}", self.name, self.pci_bus_id)
    }
}

/// Device memory usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryInfo {
    pub free: u64,
    pub total: u64,
}

impl MemoryInfo {
    /// Free memory as a percentage of the total.
    #[must_use]
    pub fn free_percent(&self) -> u32 {
        if self.total == 0 {
            return 0;
        }
        (self.free.saturating_mul(100) / self.total) as u32
    }
}

/// What a device can do with one codec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodecCaps {
    pub codec: Codec,
    pub min_width: u32,
    pub min_height: u32,
    pub max_width: u32,
    pub max_height: u32,
    pub layouts: Vec<PixelLayout>,
    pub lossless: bool,
    /// The encoder accepts packed RGB input and converts internally.
    pub rgb_input: bool,
    pub presets: Vec<Preset>,
    pub profiles: Vec<Profile>,
}

impl CodecCaps {
    #[must_use]
    pub fn supports_layout(&self, layout: PixelLayout) -> bool {
        self.layouts.contains(&layout)
    }

    #[must_use]
    pub fn has_preset(&self, preset: Preset) -> bool {
        self.presets.contains(&preset)
    }

    #[must_use]
    pub fn has_profile(&self, profile: Profile) -> bool {
        self.profiles.contains(&profile)
    }

    #[must_use]
    pub fn fits(&self, width: u32, height: u32) -> bool {
        (self.min_width..=self.max_width).contains(&width)
            && (self.min_height..=self.max_height).contains(&height)
    }
}

/// Pinned host memory returned by [`Driver::alloc_host`].
///
/// Owned exclusively by whoever holds it; it must go back through
/// [`Driver::free_host`] on the driver that allocated it.
#[derive(Debug)]
pub struct HostAllocation {
    ptr: NonNull<u8>,
    len: usize,
    id: u64,
}

// SAFETY: the allocation is plain page-locked memory with a single owner.
unsafe impl Send for HostAllocation {}

impl HostAllocation {
    /// Wrap memory produced by a driver.
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for reads and writes of `len` bytes until the
    /// allocation is handed back to the driver, and nothing else may access it.
    pub unsafe fn from_raw(ptr: NonNull<u8>, len: usize, id: u64) -> Self {
        Self { ptr, len, id }
    }

    #[must_use]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: guaranteed by `from_raw`.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: guaranteed by `from_raw`, and `&mut self` is unique.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

/// A pitched 2D device allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DevicePitched {
    pub ptr: DevicePtr,
    /// Bytes between row starts, at least `width_bytes`.
    pub pitch: usize,
    pub width_bytes: usize,
    pub rows: usize,
}

impl DevicePitched {
    #[must_use]
    pub fn size(&self) -> usize {
        self.pitch * self.rows
    }
}

/// A device-side colorspace conversion (and optional downscale).
#[derive(Debug, Clone, Copy)]
pub struct CscJob {
    pub src: DevicePitched,
    pub src_format: PixelFormat,
    pub src_width: u32,
    pub src_height: u32,
    /// Destination planes stacked vertically with `dst.pitch`, each
    /// `plane_rows` rows apart.
    pub dst: DevicePitched,
    pub dst_format: PixelFormat,
    pub dst_width: u32,
    pub dst_height: u32,
    pub plane_rows: u32,
}

/// Encoder configuration handed to initialize/reconfigure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderSettings {
    pub codec: Codec,
    pub profile: Profile,
    pub preset: Preset,
    /// Encoded picture size.
    pub width: u32,
    pub height: u32,
    /// Format of the registered input surface.
    pub input_format: PixelFormat,
    pub lossless: bool,
    /// Target quality used for rate control, 0-100.
    pub quality: u8,
}

/// Describes a device buffer being registered as encoder input.
#[derive(Debug, Clone, Copy)]
pub struct RegisterDesc {
    pub buffer: DevicePitched,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    /// Rows between planes for planar formats.
    pub plane_rows: u32,
}

/// Per-picture encode parameters.
#[derive(Debug, Clone, Copy)]
pub struct PictureParams {
    pub input: MappedInputHandle,
    pub bitstream: BitstreamHandle,
    pub pts: u64,
    pub force_idr: bool,
}

/// An output bitstream locked for reading.
///
/// `data` stays valid until the matching [`Driver::unlock_bitstream`].
#[derive(Debug)]
pub struct LockedBitstream {
    pub data: *const u8,
    pub len: usize,
    pub keyframe: bool,
    pub pts: u64,
}

/// Decoder configuration.
#[derive(Debug, Clone)]
pub struct DecoderSettings {
    pub codec: Codec,
    pub width: u32,
    pub height: u32,
    pub layout: PixelLayout,
    /// Number of output surfaces cycled through.
    pub output_surfaces: usize,
}

/// Memory behind one decoder output surface.
pub type SurfaceMemory = Arc<RwLock<Vec<u8>>>;

/// How pixels are arranged inside a decoded surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SurfaceLayout {
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    pub strides: Vec<usize>,
    pub offsets: Vec<usize>,
}

impl SurfaceLayout {
    /// Tight planar layout for `format` with the given row pitch.
    #[must_use]
    pub fn planar(format: PixelFormat, width: u32, height: u32, pitch: usize) -> Self {
        let rows = height as usize;
        let (strides, offsets) = match format {
            PixelFormat::Nv12 => (vec![pitch, pitch], vec![0, pitch * rows]),
            PixelFormat::Yuv444p | PixelFormat::Gbrp => (
                vec![pitch; 3],
                vec![0, pitch * rows, 2 * pitch * rows],
            ),
            _ => (vec![pitch], vec![0]),
        };
        Self {
            format,
            width,
            height,
            strides,
            offsets,
        }
    }

    /// Bytes needed to hold every plane.
    #[must_use]
    pub fn byte_len(&self) -> usize {
        let rows = self.height as usize;
        match self.format {
            PixelFormat::Nv12 => self.offsets[1] + self.strides[1] * rows.div_ceil(2),
            PixelFormat::Yuv444p | PixelFormat::Gbrp => self.offsets[2] + self.strides[2] * rows,
            _ => self.strides[0] * rows,
        }
    }
}

/// A decoded picture sitting in one of the decoder's output slots.
#[derive(Debug, Clone)]
pub struct DecodedPicture {
    pub slot: usize,
    pub memory: SurfaceMemory,
    pub layout: SurfaceLayout,
    pub pts: u64,
}

/// The native accelerator API.
///
/// Context-bound calls expect `ctx` to be current on the calling thread.
pub trait Driver: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    /// API version reported by the installed driver.
    fn api_version(&self) -> DriverResult<(u32, u32)>;
    /// Minimum API version this build needs.
    fn required_api_version(&self) -> (u32, u32);

    fn device_count(&self) -> DriverResult<u32>;
    fn device_properties(&self, ordinal: u32) -> DriverResult<DeviceProperties>;
    fn memory_info(&self, ordinal: u32) -> DriverResult<MemoryInfo>;
    /// `None` when the device cannot encode `codec` at all.
    fn codec_caps(&self, ordinal: u32, codec: Codec) -> DriverResult<Option<CodecCaps>>;

    /// Create a context; it is not left current.
    fn create_context(&self, ordinal: u32) -> DriverResult<ContextHandle>;
    fn destroy_context(&self, ctx: ContextHandle) -> DriverResult<()>;
    fn push_context(&self, ctx: ContextHandle) -> DriverResult<()>;
    fn pop_context(&self, ctx: ContextHandle) -> DriverResult<()>;

    fn alloc_host(&self, ctx: ContextHandle, len: usize) -> DriverResult<HostAllocation>;
    fn free_host(&self, ctx: ContextHandle, host: HostAllocation) -> DriverResult<()>;
    fn alloc_pitched(&self, ctx: ContextHandle, width_bytes: usize, rows: usize) -> DriverResult<DevicePitched>;
    fn free_device(&self, ctx: ContextHandle, buffer: DevicePitched) -> DriverResult<()>;
    /// 2D copy of `rows` rows of `width_bytes` from pinned host memory.
    fn copy_to_device(
        &self,
        ctx: ContextHandle,
        src: &HostAllocation,
        src_pitch: usize,
        dst: &DevicePitched,
        width_bytes: usize,
        rows: usize,
    ) -> DriverResult<()>;
    /// 2D copy of `rows` rows of `width_bytes` into host memory.
    fn copy_to_host(
        &self,
        ctx: ContextHandle,
        src: &DevicePitched,
        dst: &mut [u8],
        dst_pitch: usize,
        width_bytes: usize,
        rows: usize,
    ) -> DriverResult<()>;

    /// Whether [`Driver::launch_csc`] is available.
    fn supports_csc(&self) -> bool;
    fn launch_csc(&self, ctx: ContextHandle, job: &CscJob) -> DriverResult<()>;

    fn open_encoder(&self, ctx: ContextHandle, codec: Codec) -> DriverResult<EncoderHandle>;
    fn initialize_encoder(&self, ctx: ContextHandle, enc: EncoderHandle, settings: &EncoderSettings) -> DriverResult<()>;
    fn reconfigure_encoder(&self, ctx: ContextHandle, enc: EncoderHandle, settings: &EncoderSettings) -> DriverResult<()>;
    fn create_bitstream(&self, ctx: ContextHandle, enc: EncoderHandle) -> DriverResult<BitstreamHandle>;
    fn destroy_bitstream(&self, ctx: ContextHandle, enc: EncoderHandle, bitstream: BitstreamHandle) -> DriverResult<()>;
    fn register_resource(&self, ctx: ContextHandle, enc: EncoderHandle, desc: &RegisterDesc) -> DriverResult<RegistrationHandle>;
    fn unregister_resource(&self, ctx: ContextHandle, enc: EncoderHandle, reg: RegistrationHandle) -> DriverResult<()>;
    fn map_resource(&self, ctx: ContextHandle, enc: EncoderHandle, reg: RegistrationHandle) -> DriverResult<MappedInputHandle>;
    fn unmap_resource(&self, ctx: ContextHandle, enc: EncoderHandle, mapped: MappedInputHandle) -> DriverResult<()>;
    fn encode_picture(&self, ctx: ContextHandle, enc: EncoderHandle, params: &PictureParams) -> DriverResult<()>;
    /// Flush the encoder with an end-of-stream picture.
    fn end_of_stream(&self, ctx: ContextHandle, enc: EncoderHandle) -> DriverResult<()>;
    /// Blocking lock of the output bitstream.
    fn lock_bitstream(&self, ctx: ContextHandle, enc: EncoderHandle, bitstream: BitstreamHandle) -> DriverResult<LockedBitstream>;
    fn unlock_bitstream(&self, ctx: ContextHandle, enc: EncoderHandle, bitstream: BitstreamHandle) -> DriverResult<()>;
    fn destroy_encoder(&self, ctx: ContextHandle, enc: EncoderHandle) -> DriverResult<()>;

    fn open_decoder(&self, ctx: ContextHandle, settings: &DecoderSettings) -> DriverResult<DecoderHandle>;
    /// Output slot the next decoded picture will land in, if known.
    fn next_output_slot(&self, dec: DecoderHandle) -> Option<usize>;
    /// Decode one access unit. `Ok(None)` when no picture came out.
    fn decode(&self, ctx: ContextHandle, dec: DecoderHandle, data: &[u8], pts: u64) -> DriverResult<Option<DecodedPicture>>;
    fn destroy_decoder(&self, ctx: ContextHandle, dec: DecoderHandle) -> DriverResult<()>;
}

/// The hardware driver when built in and loadable.
#[cfg(feature = "nvidia")]
pub fn hardware_driver() -> Option<Arc<dyn Driver>> {
    match nvidia::NvidiaDriver::load() {
        Ok(driver) => Some(Arc::new(driver)),
        Err(status) => {
            tracing::warn!("NVIDIA driver unavailable: {}", status);
            None
        }
    }
}

/// The hardware driver when built in and loadable.
#[cfg(not(feature = "nvidia"))]
pub fn hardware_driver() -> Option<Arc<dyn Driver>> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_free_percent() {
        let info = MemoryInfo { free: 3 << 30, total: 4 << 30 };
        assert_eq!(info.free_percent(), 75);
        assert_eq!(MemoryInfo { free: 0, total: 0 }.free_percent(), 0);
    }

    #[test]
    fn test_surface_layout() {
        let nv12 = SurfaceLayout::planar(PixelFormat::Nv12, 64, 33, 128);
        assert_eq!(nv12.offsets, vec![0, 128 * 33]);
        assert_eq!(nv12.byte_len(), 128 * 33 + 128 * 17);
        let gbrp = SurfaceLayout::planar(PixelFormat::Gbrp, 64, 32, 64);
        assert_eq!(gbrp.byte_len(), 64 * 32 * 3);
    }
}
