//! NVDEC decoder driven by the CUVID parser.
//!
//! The parser calls back into [`NvDecoder`] through a raw pointer, so the
//! decoder lives in a `Box` and never moves after the parser is created.
//! Display callbacks copy the mapped picture into one of a fixed ring of
//! host surfaces; the ring index is what the ownership tracker sees as the
//! output slot.

use std::ffi::c_void;
use std::ptr;
use std::sync::{Arc, RwLock};

use cudarc::driver::sys::{self as cu, CUresult};
use nvidia_video_codec_sdk::sys::cuviddec::*;
use nvidia_video_codec_sdk::sys::nvcuvid::*;
use tracing::{debug, error, info};

use super::api::cuda;
use crate::driver::status::{DriverResult, NativeStatus, CUDA_ERROR_INVALID_VALUE, CUVID_DECODE_STATUS_ERROR};
use crate::driver::{DecodedPicture, DecoderSettings, SurfaceLayout, SurfaceMemory};
use crate::types::{Codec, PixelFormat, PixelLayout};

fn cuvid_codec(codec: Codec) -> cudaVideoCodec {
    match codec {
        Codec::H264 => cudaVideoCodec::cudaVideoCodec_H264,
        Codec::Hevc => cudaVideoCodec::cudaVideoCodec_HEVC,
        Codec::Av1 => cudaVideoCodec::cudaVideoCodec_AV1,
    }
}

pub(super) struct NvDecoder {
    settings: DecoderSettings,
    parser: CUvideoparser,
    decoder: CUvideodecoder,
    width: u32,
    height: u32,
    format: PixelFormat,
    slots: Vec<SurfaceMemory>,
    next_slot: usize,
    pts: u64,
    output: Option<DecodedPicture>,
    /// First failure reported by a callback during the current parse.
    error: Option<NativeStatus>,
}

// SAFETY: the CUVID handles are only used under the driver's decoder lock,
// with the owning context current.
unsafe impl Send for NvDecoder {}

impl std::fmt::Debug for NvDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NvDecoder")
            .field("codec", &self.settings.codec)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("format", &self.format)
            .field("next_slot", &self.next_slot)
            .finish()
    }
}

impl NvDecoder {
    pub(super) fn open(settings: &DecoderSettings) -> DriverResult<Box<Self>> {
        let slots = settings.output_surfaces.max(1);
        let mut decoder = Box::new(Self {
            settings: settings.clone(),
            parser: ptr::null_mut(),
            decoder: ptr::null_mut(),
            width: settings.width,
            height: settings.height,
            format: settings.layout.surface_format(false),
            slots: (0..slots).map(|_| Arc::new(RwLock::new(Vec::new()))).collect(),
            next_slot: 0,
            pts: 0,
            output: None,
            error: None,
        });

        let mut params: CUVIDPARSERPARAMS = unsafe { std::mem::zeroed() };
        params.CodecType = cuvid_codec(settings.codec);
        params.ulMaxNumDecodeSurfaces = 8;
        params.ulMaxDisplayDelay = 0;
        params.pUserData = decoder.as_mut() as *mut Self as *mut c_void;
        params.pfnSequenceCallback = Some(Self::sequence_callback);
        params.pfnDecodePicture = Some(Self::decode_callback);
        params.pfnDisplayPicture = Some(Self::display_callback);
        cuda(unsafe { cuvidCreateVideoParser(&mut decoder.parser, &mut params) })?;
        Ok(decoder)
    }

    pub(super) fn next_slot(&self) -> usize {
        self.next_slot
    }

    /// Feed one access unit. The owning context must be current.
    pub(super) fn decode(&mut self, data: &[u8], pts: u64) -> DriverResult<Option<DecodedPicture>> {
        self.output = None;
        self.error = None;
        self.pts = pts;

        let mut packet: CUVIDSOURCEDATAPACKET = unsafe { std::mem::zeroed() };
        packet.payload = data.as_ptr();
        packet.payload_size = data.len() as _;
        packet.flags = CUvideopacketflags::CUVID_PKT_TIMESTAMP as _;
        packet.timestamp = pts as _;
        cuda(unsafe { cuvidParseVideoData(self.parser, &mut packet) })?;

        if let Some(status) = self.error.take() {
            return Err(status);
        }
        Ok(self.output.take())
    }

    fn destroy_decoder(&mut self) {
        if !self.decoder.is_null() {
            let _ = unsafe { cuvidDestroyDecoder(self.decoder) };
            self.decoder = ptr::null_mut();
        }
    }

    extern "C" fn sequence_callback(user_data: *mut c_void, video_format: *mut CUVIDEOFORMAT) -> i32 {
        // SAFETY: `user_data` is the boxed decoder that owns the parser.
        let decoder = unsafe { &mut *(user_data as *mut NvDecoder) };
        let format = unsafe { &*video_format };

        let yuv444 = format.chroma_format == cudaVideoChromaFormat::cudaVideoChromaFormat_444;
        let (surface, pixel_format) = if yuv444 {
            (cudaVideoSurfaceFormat::cudaVideoSurfaceFormat_YUV444, PixelFormat::Yuv444p)
        } else {
            (cudaVideoSurfaceFormat::cudaVideoSurfaceFormat_NV12, PixelFormat::Nv12)
        };
        let num_surfaces = (format.min_num_decode_surfaces as u64).max(8);

        let mut create_info: CUVIDDECODECREATEINFO = unsafe { std::mem::zeroed() };
        create_info.ulWidth = format.coded_width as _;
        create_info.ulHeight = format.coded_height as _;
        create_info.ulNumDecodeSurfaces = num_surfaces as _;
        create_info.CodecType = format.codec;
        create_info.ChromaFormat = format.chroma_format;
        create_info.OutputFormat = surface;
        create_info.DeinterlaceMode = cudaVideoDeinterlaceMode::cudaVideoDeinterlaceMode_Weave;
        create_info.ulTargetWidth = format.coded_width as _;
        create_info.ulTargetHeight = format.coded_height as _;
        create_info.ulNumOutputSurfaces = 2;
        create_info.bitDepthMinus8 = format.bit_depth_luma_minus8 as _;

        decoder.destroy_decoder();
        let result = unsafe { cuvidCreateDecoder(&mut decoder.decoder, &mut create_info) };
        if result != CUresult::CUDA_SUCCESS {
            error!("cannot create {} decoder: {:?}", decoder.settings.codec, result);
            decoder.error = Some(NativeStatus::Cuda(result as i32));
            return 0;
        }

        decoder.width = format.coded_width;
        decoder.height = format.coded_height;
        if PixelLayout::of_surface(pixel_format) != PixelLayout::of_surface(decoder.format) {
            info!("{} stream uses {}", decoder.settings.codec, pixel_format);
        }
        decoder.format = pixel_format;
        debug!(
            "{} sequence: {}x{}, {} decode surfaces",
            decoder.settings.codec, format.coded_width, format.coded_height, num_surfaces
        );
        num_surfaces as i32
    }

    extern "C" fn decode_callback(user_data: *mut c_void, pic_params: *mut CUVIDPICPARAMS) -> i32 {
        let decoder = unsafe { &mut *(user_data as *mut NvDecoder) };
        if decoder.decoder.is_null() {
            decoder.error.get_or_insert(NativeStatus::Cuda(CUDA_ERROR_INVALID_VALUE));
            return 0;
        }
        let result = unsafe { cuvidDecodePicture(decoder.decoder, pic_params) };
        if result != CUresult::CUDA_SUCCESS {
            decoder.error.get_or_insert(NativeStatus::Cuda(result as i32));
            return 0;
        }
        1
    }

    extern "C" fn display_callback(user_data: *mut c_void, disp_info: *mut CUVIDPARSERDISPINFO) -> i32 {
        let decoder = unsafe { &mut *(user_data as *mut NvDecoder) };
        if disp_info.is_null() {
            // End of stream.
            return 1;
        }
        let info = unsafe { &*disp_info };
        if decoder.decoder.is_null() || info.picture_index < 0 {
            return 0;
        }
        match decoder.copy_out(info) {
            Ok(picture) => {
                decoder.output = Some(picture);
                1
            }
            Err(status) => {
                decoder.error.get_or_insert(status);
                0
            }
        }
    }

    fn copy_out(&mut self, info: &CUVIDPARSERDISPINFO) -> DriverResult<DecodedPicture> {
        let mut status: CUVIDGETDECODESTATUS = unsafe { std::mem::zeroed() };
        if unsafe { cuvidGetDecodeStatus(self.decoder, info.picture_index, &mut status) } == CUresult::CUDA_SUCCESS {
            let code = status.decodeStatus as i32;
            if code >= CUVID_DECODE_STATUS_ERROR {
                return Err(NativeStatus::Decode(code));
            }
        }

        let mut proc_params: CUVIDPROCPARAMS = unsafe { std::mem::zeroed() };
        proc_params.progressive_frame = info.progressive_frame as i32;
        let mut dev_ptr: u64 = 0;
        let mut pitch: u32 = 0;
        cuda(unsafe {
            cuvidMapVideoFrame64(self.decoder, info.picture_index, &mut dev_ptr, &mut pitch, &mut proc_params)
        })?;

        let width = self.width as usize;
        let height = self.height as usize;
        let rows = match self.format {
            PixelFormat::Yuv444p => height * 3,
            _ => height + height.div_ceil(2),
        };
        let slot = self.next_slot;
        let memory = Arc::clone(&self.slots[slot]);
        let copied = {
            let mut surface = memory.write().unwrap_or_else(|e| e.into_inner());
            surface.resize(width * rows, 0);
            let mut copy = cu::CUDA_MEMCPY2D {
                srcMemoryType: cu::CUmemorytype::CU_MEMORYTYPE_DEVICE,
                srcDevice: dev_ptr,
                srcPitch: pitch as usize,
                dstMemoryType: cu::CUmemorytype::CU_MEMORYTYPE_HOST,
                dstHost: surface.as_mut_ptr() as *mut c_void,
                dstPitch: width,
                WidthInBytes: width,
                Height: rows,
                ..unsafe { std::mem::zeroed() }
            };
            cuda(unsafe { cu::cuMemcpy2D_v2(&mut copy) })
        };
        let _ = unsafe { cuvidUnmapVideoFrame64(self.decoder, dev_ptr) };
        copied?;

        self.next_slot = (slot + 1) % self.slots.len();
        Ok(DecodedPicture {
            slot,
            memory,
            layout: SurfaceLayout::planar(self.format, self.width, self.height, width),
            pts: info.timestamp as u64,
        })
    }
}

impl Drop for NvDecoder {
    fn drop(&mut self) {
        if !self.parser.is_null() {
            let _ = unsafe { cuvidDestroyVideoParser(self.parser) };
            self.parser = ptr::null_mut();
        }
        self.destroy_decoder();
    }
}
