//! Colorspace conversion kernels, compiled with NVRTC on first use.
//!
//! The kernels mirror the CPU ones in `crate::csc::kernels`: a box filter
//! for downscaling, BT.601 limited range for YUV and the identity matrix for
//! GBRP. NV12 chroma is a second launch over the 2x2 blocks.

use std::ffi::{c_void, CStr, CString};
use std::panic;
use std::ptr;

use cudarc::driver::sys::{self as cu, CUfunction, CUmodule};
use lazy_static::lazy_static;
use tracing::{debug, warn};

use super::api::cuda;
use super::Raw;
use crate::driver::status::{CUDA_ERROR_INVALID_VALUE, CUDA_ERROR_NOT_SUPPORTED};
use crate::driver::{CscJob, DriverResult, NativeStatus};
use crate::types::PixelFormat;

const KERNEL_SOURCE: &str = r#"
__device__ __forceinline__ unsigned char clamp_u8(int v) {
    return (unsigned char)(v < 0 ? 0 : (v > 255 ? 255 : v));
}

__device__ __forceinline__ int span_start(int d, int dn, int sn) {
    return (int)((long long)d * sn / dn);
}

__device__ void box_rgb(const unsigned char* src, unsigned long long pitch, int sw, int sh,
                        int dw, int dh, int dx, int dy, int bo, int go, int ro,
                        int* r, int* g, int* b) {
    int x0 = span_start(dx, dw, sw);
    int x1 = max(span_start(dx + 1, dw, sw), x0 + 1);
    int y0 = span_start(dy, dh, sh);
    int y1 = max(span_start(dy + 1, dh, sh), y0 + 1);
    unsigned int sr = 0, sg = 0, sb = 0, n = 0;
    for (int y = y0; y < y1; ++y) {
        const unsigned char* row = src + y * pitch;
        for (int x = x0; x < x1; ++x) {
            sr += row[x * 4 + ro];
            sg += row[x * 4 + go];
            sb += row[x * 4 + bo];
            ++n;
        }
    }
    *r = (int)((sr + n / 2) / n);
    *g = (int)((sg + n / 2) / n);
    *b = (int)((sb + n / 2) / n);
}

__device__ __forceinline__ unsigned char rgb_y(int r, int g, int b) {
    return clamp_u8(((66 * r + 129 * g + 25 * b + 128) >> 8) + 16);
}
__device__ __forceinline__ unsigned char rgb_u(int r, int g, int b) {
    return clamp_u8(((-38 * r - 74 * g + 112 * b + 128) >> 8) + 128);
}
__device__ __forceinline__ unsigned char rgb_v(int r, int g, int b) {
    return clamp_u8(((112 * r - 94 * g - 18 * b + 128) >> 8) + 128);
}

// format: 0 GBRP, 1 YUV444P, 2 NV12 luma
extern "C" __global__ void packed_to_planar(
    const unsigned char* src, unsigned long long src_pitch, int sw, int sh,
    int bo, int go, int ro,
    unsigned char* dst, unsigned long long dst_pitch, unsigned long long plane,
    int dw, int dh, int format) {
    int x = blockIdx.x * blockDim.x + threadIdx.x;
    int y = blockIdx.y * blockDim.y + threadIdx.y;
    if (x >= dw || y >= dh) return;
    int r, g, b;
    box_rgb(src, src_pitch, sw, sh, dw, dh, x, y, bo, go, ro, &r, &g, &b);
    unsigned long long i = y * dst_pitch + x;
    if (format == 0) {
        dst[i] = (unsigned char)g;
        dst[plane + i] = (unsigned char)b;
        dst[2 * plane + i] = (unsigned char)r;
    } else if (format == 1) {
        dst[i] = rgb_y(r, g, b);
        dst[plane + i] = rgb_u(r, g, b);
        dst[2 * plane + i] = rgb_v(r, g, b);
    } else {
        dst[i] = rgb_y(r, g, b);
    }
}

extern "C" __global__ void nv12_chroma(
    const unsigned char* src, unsigned long long src_pitch, int sw, int sh,
    int bo, int go, int ro,
    unsigned char* dst, unsigned long long dst_pitch, unsigned long long plane,
    int dw, int dh) {
    int cx = blockIdx.x * blockDim.x + threadIdx.x;
    int cy = blockIdx.y * blockDim.y + threadIdx.y;
    int x = cx * 2, y = cy * 2;
    if (x >= dw || y >= dh) return;
    int r = 0, g = 0, b = 0;
    for (int oy = 0; oy < 2; ++oy) {
        for (int ox = 0; ox < 2; ++ox) {
            int pr, pg, pb;
            box_rgb(src, src_pitch, sw, sh, dw, dh, min(x + ox, dw - 1), min(y + oy, dh - 1),
                    bo, go, ro, &pr, &pg, &pb);
            r += pr;
            g += pg;
            b += pb;
        }
    }
    r /= 4;
    g /= 4;
    b /= 4;
    unsigned long long i = plane + cy * dst_pitch + cx * 2;
    dst[i] = rgb_u(r, g, b);
    if ((unsigned long long)x + 1 < dst_pitch) {
        dst[i + 1] = rgb_v(r, g, b);
    }
}
"#;

const LUMA_KERNEL: &CStr = c"packed_to_planar";
const CHROMA_KERNEL: &CStr = c"nv12_chroma";
const BLOCK: u32 = 16;

lazy_static! {
    /// PTX for [`KERNEL_SOURCE`], or `None` when NVRTC is unavailable.
    static ref PTX: Option<CString> = compile();
}

fn compile() -> Option<CString> {
    // cudarc panics when libnvrtc cannot be loaded.
    match panic::catch_unwind(|| cudarc::nvrtc::compile_ptx(KERNEL_SOURCE)) {
        Ok(Ok(ptx)) => match CString::new(ptx.to_src()) {
            Ok(src) => {
                debug!("compiled colorspace kernels");
                Some(src)
            }
            Err(err) => {
                warn!("colorspace kernel PTX: {}", err);
                None
            }
        },
        Ok(Err(err)) => {
            warn!("colorspace kernels failed to compile: {:?}", err);
            None
        }
        Err(_) => {
            warn!("NVRTC is not available, colorspace conversion disabled");
            None
        }
    }
}

pub fn available() -> bool {
    PTX.is_some()
}

/// The conversion kernels loaded into one context. They live until the
/// context is destroyed.
#[derive(Debug)]
pub struct CscKernels {
    _module: Raw,
    luma: Raw,
    chroma: Raw,
}

impl CscKernels {
    /// Load the module into the current context.
    pub fn load() -> DriverResult<Self> {
        let ptx = PTX.as_ref().ok_or(NativeStatus::Cuda(CUDA_ERROR_NOT_SUPPORTED))?;
        let mut module: CUmodule = ptr::null_mut();
        cuda(unsafe { cu::cuModuleLoadData(&mut module, ptx.as_ptr() as *const c_void) })?;
        let function = |name: &CStr| -> DriverResult<Raw> {
            let mut function: CUfunction = ptr::null_mut();
            cuda(unsafe { cu::cuModuleGetFunction(&mut function, module, name.as_ptr()) })?;
            Ok(Raw(function as *mut c_void))
        };
        match function(LUMA_KERNEL).and_then(|luma| Ok((luma, function(CHROMA_KERNEL)?))) {
            Ok((luma, chroma)) => Ok(Self {
                _module: Raw(module as *mut c_void),
                luma,
                chroma,
            }),
            Err(status) => {
                let _ = unsafe { cu::cuModuleUnload(module) };
                Err(status)
            }
        }
    }

    /// Launch the conversion and wait for it. The context must be current.
    pub fn launch(&self, job: &CscJob) -> DriverResult<()> {
        let args = KernelArgs::new(job)?;
        let (gx, gy) = grid(job.dst_width, job.dst_height);
        self.run(self.luma, (gx, gy), &args, true)?;
        if job.dst_format == PixelFormat::Nv12 {
            let (gx, gy) = grid(job.dst_width.div_ceil(2), job.dst_height.div_ceil(2));
            self.run(self.chroma, (gx, gy), &args, false)?;
        }
        cuda(unsafe { cu::cuCtxSynchronize() })
    }

    fn run(&self, function: Raw, (gx, gy): (u32, u32), args: &KernelArgs, with_format: bool) -> DriverResult<()> {
        let mut a = *args;
        let mut params: Vec<*mut c_void> = vec![
            &mut a.src as *mut _ as *mut c_void,
            &mut a.src_pitch as *mut _ as *mut c_void,
            &mut a.src_width as *mut _ as *mut c_void,
            &mut a.src_height as *mut _ as *mut c_void,
            &mut a.offsets[0] as *mut _ as *mut c_void,
            &mut a.offsets[1] as *mut _ as *mut c_void,
            &mut a.offsets[2] as *mut _ as *mut c_void,
            &mut a.dst as *mut _ as *mut c_void,
            &mut a.dst_pitch as *mut _ as *mut c_void,
            &mut a.plane as *mut _ as *mut c_void,
            &mut a.dst_width as *mut _ as *mut c_void,
            &mut a.dst_height as *mut _ as *mut c_void,
        ];
        if with_format {
            params.push(&mut a.format as *mut _ as *mut c_void);
        }
        cuda(unsafe {
            cu::cuLaunchKernel(
                function.0 as CUfunction,
                gx,
                gy,
                1,
                BLOCK,
                BLOCK,
                1,
                0,
                ptr::null_mut(),
                params.as_mut_ptr(),
                ptr::null_mut(),
            )
        })
    }
}

/// Kernel arguments in launch order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct KernelArgs {
    src: u64,
    src_pitch: u64,
    src_width: i32,
    src_height: i32,
    /// Byte offsets of B, G and R within a source pixel.
    offsets: [i32; 3],
    dst: u64,
    dst_pitch: u64,
    plane: u64,
    dst_width: i32,
    dst_height: i32,
    format: i32,
}

impl KernelArgs {
    fn new(job: &CscJob) -> DriverResult<Self> {
        let invalid = NativeStatus::Cuda(CUDA_ERROR_INVALID_VALUE);
        let offsets = job
            .src_format
            .bgr_offsets()
            .ok_or(NativeStatus::Cuda(CUDA_ERROR_NOT_SUPPORTED))?;
        let (format, planes) = match job.dst_format {
            PixelFormat::Gbrp => (0, 3),
            PixelFormat::Yuv444p => (1, 3),
            PixelFormat::Nv12 => (2, 2),
            _ => return Err(NativeStatus::Cuda(CUDA_ERROR_NOT_SUPPORTED)),
        };
        let (sw, sh) = (job.src_width as usize, job.src_height as usize);
        let (dw, dh) = (job.dst_width as usize, job.dst_height as usize);
        if dw == 0 || dh == 0 || dw > sw || dh > sh || job.plane_rows < job.dst_height {
            return Err(invalid);
        }
        if job.src.pitch < sw * 4 || job.src.rows < sh {
            return Err(invalid);
        }
        // NV12 chroma rows only need half the plane, but the buffer is
        // allocated as whole planes.
        if job.dst.pitch < dw || job.dst.rows < job.plane_rows as usize * (planes - 1) + dh {
            return Err(invalid);
        }
        let [bo, go, ro] = offsets;
        Ok(Self {
            src: job.src.ptr.0,
            src_pitch: job.src.pitch as u64,
            src_width: job.src_width as i32,
            src_height: job.src_height as i32,
            offsets: [bo as i32, go as i32, ro as i32],
            dst: job.dst.ptr.0,
            dst_pitch: job.dst.pitch as u64,
            plane: (job.dst.pitch * job.plane_rows as usize) as u64,
            dst_width: job.dst_width as i32,
            dst_height: job.dst_height as i32,
            format,
        })
    }
}

/// Blocks needed to cover `width`x`height` threads.
fn grid(width: u32, height: u32) -> (u32, u32) {
    (width.div_ceil(BLOCK).max(1), height.div_ceil(BLOCK).max(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{DevicePitched, DevicePtr};

    fn job(dst_format: PixelFormat, dst: (u32, u32), dst_rows: usize) -> CscJob {
        CscJob {
            src: DevicePitched {
                ptr: DevicePtr(0x1000),
                pitch: 512,
                width_bytes: 256,
                rows: 48,
            },
            src_format: PixelFormat::Rgbx,
            src_width: 64,
            src_height: 48,
            dst: DevicePitched {
                ptr: DevicePtr(0x8000),
                pitch: 512,
                width_bytes: dst.0 as usize,
                rows: dst_rows,
            },
            dst_format,
            dst_width: dst.0,
            dst_height: dst.1,
            plane_rows: dst.1,
        }
    }

    #[test]
    fn test_grid_covers_picture() {
        assert_eq!(grid(64, 48), (4, 3));
        assert_eq!(grid(65, 1), (5, 1));
        assert_eq!(grid(0, 0), (1, 1));
    }

    #[test]
    fn test_kernel_args() {
        let args = KernelArgs::new(&job(PixelFormat::Nv12, (32, 24), 48)).unwrap();
        assert_eq!(args.offsets, [2, 1, 0]);
        assert_eq!(args.plane, 512 * 24);
        assert_eq!((args.dst_width, args.dst_height, args.format), (32, 24, 2));
        assert_eq!((args.src, args.dst), (0x1000, 0x8000));

        let args = KernelArgs::new(&job(PixelFormat::Gbrp, (64, 48), 144)).unwrap();
        assert_eq!(args.format, 0);
    }

    #[test]
    fn test_kernel_args_rejects_bad_jobs() {
        let invalid = Err(NativeStatus::Cuda(CUDA_ERROR_INVALID_VALUE));
        // Upscaling
        assert_eq!(KernelArgs::new(&job(PixelFormat::Nv12, (128, 48), 96)), invalid);
        // Third plane does not fit
        assert_eq!(KernelArgs::new(&job(PixelFormat::Yuv444p, (64, 48), 100)), invalid);
        let mut bad = job(PixelFormat::Nv12, (32, 24), 48);
        bad.src.pitch = 128;
        assert_eq!(KernelArgs::new(&bad), invalid);
        assert_eq!(
            KernelArgs::new(&job(PixelFormat::Bgra, (64, 48), 48)),
            Err(NativeStatus::Cuda(CUDA_ERROR_NOT_SUPPORTED))
        );
    }

    #[test]
    fn test_kernel_names_match_source() {
        for name in [LUMA_KERNEL, CHROMA_KERNEL] {
            let name = name.to_str().unwrap();
            assert!(KERNEL_SOURCE.contains(&format!("__global__ void {name}(")));
        }
    }
}
