//! Per-slot streaming state
//!
//! [`ResourceEntry`] is the payload stored in each cache slot. Its GPU side,
//! [`GpuPayload`], is reference counted: in-flight level loads hold a clone,
//! so eviction poisons it through the `evicted` flag instead of waiting for
//! them. The GPU image is freed when the last clone drops.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use parking_lot::Mutex;

use crate::core::{Error, ResourceId, Result};
use super::asset::{MAX_DETAIL_LEVELS, ResourceMeta};
use super::budget::GpuMemoryBudget;
use super::gpu::{GpuHandle, GpuTransfer, ImageDesc, ViewHandle};

#[derive(Default)]
struct WriteState {
    /// Open upload batches
    open: u32,
    /// Some closed batch reached its slot's target
    release_pending: bool,
}

#[derive(Default)]
struct PublishedView {
    /// Number of coarsest detail levels the view covers
    levels: u8,
    view: Option<ViewHandle>,
}

/// GPU image holding every mip of one resource
pub struct GpuPayload {
    handle: GpuHandle,
    level_count: u8,
    size_bytes: u64,
    /// Bit `d` set once detail level `d` has been uploaded
    loaded_mask: AtomicU32,
    /// Poison flag; set once, never cleared
    evicted: AtomicBool,
    /// A view has been published and the slot may be sampled
    valid: AtomicBool,
    view: Mutex<PublishedView>,
    writers: Mutex<WriteState>,
    gpu: Arc<dyn GpuTransfer>,
    budget: Arc<GpuMemoryBudget>,
}

impl GpuPayload {
    /// Allocate the GPU image and charge it to the budget
    pub fn allocate(
        gpu: Arc<dyn GpuTransfer>,
        budget: Arc<GpuMemoryBudget>,
        desc: &ImageDesc,
    ) -> Result<Arc<Self>> {
        // One bit of `loaded_mask` per level
        if desc.level_count == 0 || desc.level_count > MAX_DETAIL_LEVELS {
            return Err(Error::Streaming(format!(
                "cannot stream an image with {} levels (1..={} supported)",
                desc.level_count, MAX_DETAIL_LEVELS
            )));
        }
        let handle = gpu.allocate(desc)?;
        let size_bytes = gpu.memory_requirements(desc);
        budget.add(size_bytes);

        log::trace!("Allocated {:?}: {} levels, {} bytes", handle, desc.level_count, size_bytes);

        Ok(Arc::new(Self {
            handle,
            level_count: desc.level_count,
            size_bytes,
            loaded_mask: AtomicU32::new(0),
            evicted: AtomicBool::new(false),
            valid: AtomicBool::new(false),
            view: Mutex::new(PublishedView::default()),
            writers: Mutex::new(WriteState::default()),
            gpu,
            budget,
        }))
    }

    pub fn handle(&self) -> GpuHandle {
        self.handle
    }

    pub fn level_count(&self) -> u8 {
        self.level_count
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    pub fn loaded_mask(&self) -> u32 {
        self.loaded_mask.load(Ordering::Acquire)
    }

    pub fn is_evicted(&self) -> bool {
        self.evicted.load(Ordering::Acquire)
    }

    /// A view is published and the payload has not been evicted
    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire) && !self.is_evicted()
    }

    /// Number of contiguous coarse levels the published view covers
    pub fn visible_levels(&self) -> u8 {
        self.view.lock().levels
    }

    pub fn view(&self) -> Option<ViewHandle> {
        self.view.lock().view
    }

    /// Poison the payload and return its bytes to the budget
    ///
    /// Returns true on the first call only.
    pub fn evict(&self) -> bool {
        if self.evicted.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.valid.store(false, Ordering::Release);
        self.budget.remove(self.size_bytes);
        true
    }

    /// Record detail level `detail` as uploaded
    ///
    /// Returns the length of the contiguous run of loaded levels starting at
    /// detail 0.
    pub fn mark_level_loaded(&self, detail: u8) -> u32 {
        let bit = 1u32 << detail;
        let mask = self.loaded_mask.fetch_or(bit, Ordering::AcqRel) | bit;
        mask.trailing_ones()
    }

    /// Publish a view over the `levels` coarsest levels
    ///
    /// Only ever widens the visible range. Returns false when nothing changed
    /// (already covered, or the payload was evicted).
    pub fn publish_view(&self, levels: u8) -> Result<bool> {
        let levels = levels.min(self.level_count);
        let mut published = self.view.lock();
        if self.is_evicted() || levels <= published.levels {
            return Ok(false);
        }

        let mips = (self.level_count - levels)..self.level_count;
        let view = self.gpu.create_view(self.handle, mips)?;
        if let Some(old) = published.view.replace(view) {
            self.gpu.destroy_view(old);
        }
        published.levels = levels;
        self.valid.store(true, Ordering::Release);
        Ok(true)
    }

    /// Open an upload batch, moving the image into its writable state
    pub fn begin_batch(&self) {
        let mut writers = self.writers.lock();
        if writers.open == 0 {
            self.gpu.begin_write(self.handle);
        }
        writers.open += 1;
    }

    /// Close an upload batch
    ///
    /// `release` marks the batch as the one that reached the slot's target.
    /// Batches may close in any order; the image goes back to its readable
    /// state once the last one closes, provided any of them was released.
    pub fn end_batch(&self, release: bool) {
        let mut writers = self.writers.lock();
        writers.open = writers.open.saturating_sub(1);
        writers.release_pending |= release;
        if writers.open == 0 && writers.release_pending {
            writers.release_pending = false;
            self.gpu.end_write(self.handle);
        }
    }
}

impl Drop for GpuPayload {
    fn drop(&mut self) {
        self.evict();
        if let Some(view) = self.view.get_mut().view.take() {
            self.gpu.destroy_view(view);
        }
        self.gpu.free(self.handle);
    }
}

/// Payload of one cache slot
#[derive(Default)]
pub struct ResourceEntry {
    /// Owner of the slot; a loader whose id no longer matches is stale
    pub(super) resource_id: Option<ResourceId>,
    /// Levels wanted by the renderer
    pub(super) requested_levels: u8,
    /// Levels already dispatched for loading
    pub(super) streamed_levels: u8,
    /// Metadata not (yet) usable; renders as fallback
    pub(super) is_invalid: bool,
    /// Metadata or a level failed to load; stays set until the slot is reused
    pub(super) failed: bool,
    pub(super) meta: Option<Arc<ResourceMeta>>,
    pub(super) gpu: Option<Arc<GpuPayload>>,
}

impl ResourceEntry {
    pub fn resource_id(&self) -> Option<ResourceId> {
        self.resource_id
    }

    pub(super) fn is_owned_by(&self, id: ResourceId) -> bool {
        self.resource_id == Some(id)
    }

    /// Whether `payload` is still the GPU payload of this entry
    pub(super) fn holds(&self, payload: &Arc<GpuPayload>) -> bool {
        self.gpu.as_ref().is_some_and(|gpu| Arc::ptr_eq(gpu, payload))
    }

    /// A view is published and may be sampled
    pub fn is_ready(&self) -> bool {
        !self.is_invalid && self.gpu.as_ref().is_some_and(|gpu| gpu.is_valid())
    }

    /// More levels requested than dispatched
    pub(super) fn needs_streaming(&self) -> bool {
        if self.is_invalid {
            return false;
        }
        match &self.meta {
            Some(meta) => self.streamed_levels < self.requested_levels.min(meta.level_count),
            None => false,
        }
    }

    pub fn visible_levels(&self) -> u8 {
        match &self.gpu {
            Some(gpu) if !self.is_invalid && gpu.is_valid() => gpu.visible_levels(),
            _ => 0,
        }
    }
}

impl Drop for ResourceEntry {
    fn drop(&mut self) {
        // Released or stolen: poison in-flight work on the old payload
        if let Some(gpu) = &self.gpu {
            gpu.evict();
        }
    }
}
