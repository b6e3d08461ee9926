//! Ownership of decoded frames.
//!
//! A decoded picture lives in one of the decoder's output slots and is
//! overwritten when the decoder cycles back to that slot. Callers may keep a
//! [`DecodedImage`] for as long as they like, so the session's
//! [`FrameOwnershipTracker`] keeps a weak handle to every image it handed out,
//! indexed by slot. Right before a slot is reused, every image still alive in
//! it copies its pixels into owned memory and detaches from the slot.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tracing::{debug, trace};

use crate::csc::kernels;
use crate::driver::{DecodedPicture, SurfaceLayout, SurfaceMemory};
use crate::error::{CodecError, Result};
use crate::image::ImageWrapper;
use crate::types::PixelFormat;

/// Stable id of a handed-out image.
pub type ObserverId = u64;

#[derive(Debug)]
enum FrameState {
    /// Still backed by the decoder's output slot.
    Native(SurfaceMemory),
    /// Owns a private copy of the pixels.
    Detached(Vec<u8>),
    Released,
}

#[derive(Debug)]
struct FrameCell {
    state: Mutex<FrameState>,
    layout: SurfaceLayout,
    context: u64,
    slot: usize,
    pts: u64,
}

impl FrameCell {
    fn lock(&self) -> MutexGuard<'_, FrameState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Copy native pixels into owned memory. Returns whether anything changed.
    fn detach(&self) -> Result<bool> {
        let mut state = self.lock();
        let FrameState::Native(memory) = &*state else {
            return Ok(false);
        };
        let copy = {
            let surface = memory
                .read()
                .map_err(|_| CodecError::invalid_image("decoder surface lock poisoned"))?;
            let len = self.layout.byte_len();
            surface
                .get(..len)
                .ok_or_else(|| CodecError::invalid_image("decoder surface smaller than its layout"))?
                .to_vec()
        };
        *state = FrameState::Detached(copy);
        Ok(true)
    }
}

/// A decoded picture handed to the caller.
///
/// Pixels stay valid until [`DecodedImage::release`] even when the decoder
/// reuses the slot the picture came from.
#[derive(Debug)]
pub struct DecodedImage {
    id: ObserverId,
    cell: Arc<FrameCell>,
}

impl DecodedImage {
    #[must_use]
    pub fn id(&self) -> ObserverId {
        self.id
    }

    #[must_use]
    pub fn width(&self) -> u32 {
        self.cell.layout.width
    }

    #[must_use]
    pub fn height(&self) -> u32 {
        self.cell.layout.height
    }

    #[must_use]
    pub fn pixel_format(&self) -> PixelFormat {
        self.cell.layout.format
    }

    #[must_use]
    pub fn layout(&self) -> &SurfaceLayout {
        &self.cell.layout
    }

    #[must_use]
    pub fn pts(&self) -> u64 {
        self.cell.pts
    }

    /// Decoder output slot the picture was produced in.
    #[must_use]
    pub fn slot(&self) -> usize {
        self.cell.slot
    }

    /// Context that owns the native memory.
    #[must_use]
    pub fn context_id(&self) -> u64 {
        self.cell.context
    }

    #[must_use]
    pub fn is_detached(&self) -> bool {
        matches!(*self.cell.lock(), FrameState::Detached(_))
    }

    #[must_use]
    pub fn is_released(&self) -> bool {
        matches!(*self.cell.lock(), FrameState::Released)
    }

    /// Run `f` over the raw planes and their layout.
    pub fn read<R>(&self, f: impl FnOnce(&[u8], &SurfaceLayout) -> R) -> Result<R> {
        let state = self.cell.lock();
        match &*state {
            FrameState::Native(memory) => {
                let surface = memory
                    .read()
                    .map_err(|_| CodecError::invalid_image("decoder surface lock poisoned"))?;
                Ok(f(&surface, &self.cell.layout))
            }
            FrameState::Detached(data) => Ok(f(data, &self.cell.layout)),
            FrameState::Released => Err(CodecError::invalid_image("image was released")),
        }
    }

    /// Take a private copy of the pixels now instead of at slot reuse.
    pub fn clone_pixel_data(&self) -> Result<()> {
        self.cell.detach().map(|_| ())
    }

    /// Tightly packed copy of plane `index`.
    pub fn plane(&self, index: usize) -> Result<Vec<u8>> {
        self.read(|data, layout| {
            let (w, h) = (layout.width as usize, layout.height as usize);
            let (row, rows) = match (layout.format, index) {
                (PixelFormat::Nv12, 1) => (w.next_multiple_of(2), h.div_ceil(2)),
                _ => (w, h),
            };
            let offset = *layout.offsets.get(index)?;
            let stride = *layout.strides.get(index)?;
            let mut plane = Vec::with_capacity(row * rows);
            for y in 0..rows {
                plane.extend_from_slice(data.get(offset + y * stride..offset + y * stride + row)?);
            }
            Some(plane)
        })?
        .ok_or_else(|| CodecError::invalid_image(format!("no plane {index}")))
    }

    /// Convert to a packed BGRX image.
    pub fn to_bgrx(&self) -> Result<ImageWrapper> {
        let stride = self.width() as usize * 4;
        let mut out = vec![0u8; stride * self.height() as usize];
        self.read(|data, layout| kernels::planar_to_bgrx(data, layout, &mut out, stride))??;
        ImageWrapper::packed(self.width(), self.height(), PixelFormat::Bgrx, stride, out)
            .map(|image| image.with_timestamp(self.pts()))
    }

    /// Drop the pixels. Safe to call more than once.
    pub fn release(&self) {
        *self.cell.lock() = FrameState::Released;
    }
}

/// Per-session index of handed-out images by decoder slot.
#[derive(Debug, Default)]
pub struct FrameOwnershipTracker {
    next_id: ObserverId,
    slots: HashMap<usize, Vec<(ObserverId, Weak<FrameCell>)>>,
}

impl FrameOwnershipTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap a decoded picture and start observing it.
    pub fn track(&mut self, picture: DecodedPicture, context: u64) -> DecodedImage {
        self.next_id += 1;
        let id = self.next_id;
        let cell = Arc::new(FrameCell {
            state: Mutex::new(FrameState::Native(picture.memory)),
            layout: picture.layout,
            context,
            slot: picture.slot,
            pts: picture.pts,
        });
        let observers = self.slots.entry(picture.slot).or_default();
        observers.retain(|(_, weak)| weak.strong_count() > 0);
        observers.push((id, Arc::downgrade(&cell)));
        DecodedImage { id, cell }
    }

    /// Detach every live image in `slot`. Returns how many were copied.
    pub fn reclaim_slot(&mut self, slot: usize) -> usize {
        let Some(observers) = self.slots.remove(&slot) else {
            return 0;
        };
        let mut copied = 0;
        for (id, weak) in observers {
            let Some(cell) = weak.upgrade() else {
                continue;
            };
            match cell.detach() {
                Ok(true) => {
                    trace!("detached image {} from slot {}", id, slot);
                    copied += 1;
                }
                Ok(false) => {}
                Err(err) => {
                    debug!("image {} lost its pixels: {}", id, err);
                    *cell.lock() = FrameState::Released;
                }
            }
        }
        copied
    }

    /// Before a decode: detach images in the slot about to be reused, or in
    /// every slot when the driver cannot tell which one.
    pub fn before_reuse(&mut self, slot: Option<usize>) -> usize {
        match slot {
            Some(slot) => self.reclaim_slot(slot),
            None => self.reclaim_all(),
        }
    }

    /// Detach every live image.
    pub fn reclaim_all(&mut self) -> usize {
        let slots: Vec<usize> = self.slots.keys().copied().collect();
        slots.into_iter().map(|slot| self.reclaim_slot(slot)).sum()
    }

    /// Images handed out that are still alive and attached to a slot.
    #[must_use]
    pub fn live_observers(&self) -> usize {
        self.slots
            .values()
            .flatten()
            .filter(|(_, weak)| weak.strong_count() > 0)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::RwLock;

    use super::*;

    fn picture(slot: usize, memory: &SurfaceMemory, fill: u8) -> DecodedPicture {
        let layout = SurfaceLayout::planar(PixelFormat::Gbrp, 4, 2, 4);
        *memory.write().unwrap() = vec![fill; layout.byte_len()];
        DecodedPicture {
            slot,
            memory: Arc::clone(memory),
            layout,
            pts: u64::from(fill),
        }
    }

    #[test]
    fn test_retained_image_survives_reuse() {
        let memory: SurfaceMemory = Arc::new(RwLock::new(Vec::new()));
        let mut tracker = FrameOwnershipTracker::new();
        let first = tracker.track(picture(0, &memory, 7), 1);
        assert!(!first.is_detached());

        assert_eq!(tracker.before_reuse(Some(0)), 1);
        let _second = tracker.track(picture(0, &memory, 9), 1);
        assert!(first.is_detached());
        assert_eq!(first.plane(0).unwrap(), vec![7u8; 8]);
    }

    #[test]
    fn test_other_slots_untouched() {
        let a: SurfaceMemory = Arc::new(RwLock::new(Vec::new()));
        let b: SurfaceMemory = Arc::new(RwLock::new(Vec::new()));
        let mut tracker = FrameOwnershipTracker::new();
        let first = tracker.track(picture(0, &a, 1), 1);
        let second = tracker.track(picture(1, &b, 2), 1);
        tracker.before_reuse(Some(1));
        assert!(!first.is_detached());
        assert!(second.is_detached());
        assert_eq!(tracker.before_reuse(None), 1);
        assert!(first.is_detached());
    }

    #[test]
    fn test_release_is_idempotent() {
        let memory: SurfaceMemory = Arc::new(RwLock::new(Vec::new()));
        let mut tracker = FrameOwnershipTracker::new();
        let image = tracker.track(picture(0, &memory, 3), 1);
        image.release();
        image.release();
        assert!(image.is_released());
        assert!(image.plane(0).is_err());
        // Released images are not copied
        assert_eq!(tracker.reclaim_all(), 0);
    }

    #[test]
    fn test_dropped_images_pruned() {
        let memory: SurfaceMemory = Arc::new(RwLock::new(Vec::new()));
        let mut tracker = FrameOwnershipTracker::new();
        drop(tracker.track(picture(0, &memory, 1), 1));
        let _kept = tracker.track(picture(0, &memory, 2), 1);
        assert_eq!(tracker.live_observers(), 1);
        assert_eq!(tracker.reclaim_slot(0), 1);
        assert_eq!(tracker.live_observers(), 0);
    }

    #[test]
    fn test_to_bgrx() {
        let memory: SurfaceMemory = Arc::new(RwLock::new(Vec::new()));
        let mut tracker = FrameOwnershipTracker::new();
        let image = tracker.track(picture(0, &memory, 5), 1);
        let bgrx = image.to_bgrx().unwrap();
        assert_eq!(bgrx.pixel(0, 0), Some(&[5u8, 5, 5, 255][..]));
    }
}
