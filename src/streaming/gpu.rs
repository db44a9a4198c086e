//! GPU transfer collaborator
//!
//! The cache allocates, fills and views GPU images only through
//! [`GpuTransfer`]. [`HeadlessTransfer`] is a CPU-side implementation that
//! records every upload; the wgpu implementation lives in
//! [`wgpu_backend`](super::wgpu_backend).

use std::collections::HashMap;
use std::ops::Range;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::core::{BoxFuture, Error, Result};
use super::asset::ResourceKind;

/// Opaque handle to a GPU image (texture or buffer)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct GpuHandle(pub u64);

/// Opaque handle to a view over a range of mips of a GPU image
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ViewHandle(pub u64);

/// Opaque handle to a sampler
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SamplerHandle(pub u64);

/// Shape of a GPU image covering every mip of a resource
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImageDesc {
    pub kind: ResourceKind,
    /// Width of mip 0
    pub width: u32,
    /// Height of mip 0 (1 for meshes)
    pub height: u32,
    pub level_count: u8,
    pub bytes_per_texel: u32,
}

impl ImageDesc {
    /// Extent of one mip in texels (`(width, height)`)
    pub fn level_extent(&self, mip: u8) -> (u32, u32) {
        let shift = mip as u32;
        let width = self.width.checked_shr(shift).unwrap_or(0).max(1);
        match self.kind {
            ResourceKind::Texture => (width, self.height.checked_shr(shift).unwrap_or(0).max(1)),
            ResourceKind::Mesh => (width, 1),
        }
    }

    /// Byte size of one mip
    pub fn level_size(&self, mip: u8) -> u64 {
        let (width, height) = self.level_extent(mip);
        width as u64 * height as u64 * self.bytes_per_texel as u64
    }

    /// Byte size of the full mip chain
    pub fn total_size(&self) -> u64 {
        (0..self.level_count).map(|mip| self.level_size(mip)).sum()
    }
}

/// GPU operations the streaming cache depends on
///
/// `upload_immediate` is for small payloads and may complete synchronously;
/// `upload_queued` goes through the transfer queue and resolves once the GPU
/// has consumed the data. Uploads are only valid between `begin_write` and
/// `end_write` on the destination image.
pub trait GpuTransfer: Send + Sync {
    /// Allocate an image with room for every mip
    fn allocate(&self, desc: &ImageDesc) -> Result<GpuHandle>;

    fn free(&self, handle: GpuHandle);

    /// Bytes an image of this shape occupies on the GPU
    fn memory_requirements(&self, desc: &ImageDesc) -> u64;

    /// Transition the image into a writable state
    fn begin_write(&self, handle: GpuHandle);

    /// Transition the image back into a shader-readable state
    fn end_write(&self, handle: GpuHandle);

    fn upload_immediate(&self, dst: GpuHandle, mip: u8, data: &[u8]) -> Result<()>;

    fn upload_queued(&self, dst: GpuHandle, mip: u8, data: Vec<u8>) -> BoxFuture<'static, Result<()>>;

    /// Create a view covering `mips` (mip indices, finest first)
    fn create_view(&self, handle: GpuHandle, mips: Range<u8>) -> Result<ViewHandle>;

    fn destroy_view(&self, view: ViewHandle);
}

// --- Headless implementation ---

/// Which upload path delivered a level
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UploadPath {
    Immediate,
    Queued,
}

/// One recorded upload
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UploadRecord {
    pub mip: u8,
    pub bytes: Vec<u8>,
    pub path: UploadPath,
}

struct HeadlessImage {
    desc: ImageDesc,
    writable: bool,
    uploads: Vec<UploadRecord>,
}

#[derive(Default)]
struct HeadlessState {
    next_id: u64,
    images: HashMap<GpuHandle, HeadlessImage>,
    views: HashMap<ViewHandle, (GpuHandle, Range<u8>)>,
    fail_allocations: bool,
}

impl HeadlessState {
    fn record(&mut self, dst: GpuHandle, mip: u8, bytes: Vec<u8>, path: UploadPath) -> Result<()> {
        let image = self
            .images
            .get_mut(&dst)
            .ok_or_else(|| Error::Gpu(format!("upload to freed image {:?}", dst)))?;

        if !image.writable {
            return Err(Error::Gpu(format!("image {:?} is not in a writable state", dst)));
        }
        if mip >= image.desc.level_count {
            return Err(Error::Gpu(format!("mip {} out of range for {:?}", mip, dst)));
        }
        let expected = image.desc.level_size(mip);
        if bytes.len() as u64 != expected {
            return Err(Error::Gpu(format!(
                "mip {} upload is {} bytes, expected {}", mip, bytes.len(), expected
            )));
        }

        log::trace!("Uploaded mip {} of {:?} ({} bytes, {:?})", mip, dst, bytes.len(), path);
        image.uploads.push(UploadRecord { mip, bytes, path });
        Ok(())
    }
}

/// CPU-side [`GpuTransfer`] that validates and records every operation
///
/// Clones share state, so a test can keep one clone for inspection.
#[derive(Clone, Default)]
pub struct HeadlessTransfer {
    state: Arc<Mutex<HeadlessState>>,
}

impl HeadlessTransfer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent allocations fail
    pub fn set_fail_allocations(&self, fail: bool) {
        self.state.lock().fail_allocations = fail;
    }

    /// Uploads recorded for an image, in completion order
    pub fn uploads(&self, handle: GpuHandle) -> Vec<UploadRecord> {
        self.state
            .lock()
            .images
            .get(&handle)
            .map(|image| image.uploads.clone())
            .unwrap_or_default()
    }

    pub fn is_live(&self, handle: GpuHandle) -> bool {
        self.state.lock().images.contains_key(&handle)
    }

    pub fn is_writable(&self, handle: GpuHandle) -> bool {
        self.state
            .lock()
            .images
            .get(&handle)
            .is_some_and(|image| image.writable)
    }

    /// Mip range covered by a live view
    pub fn view_mips(&self, view: ViewHandle) -> Option<Range<u8>> {
        self.state.lock().views.get(&view).map(|(_, mips)| mips.clone())
    }

    pub fn live_images(&self) -> usize {
        self.state.lock().images.len()
    }

    pub fn live_views(&self) -> usize {
        self.state.lock().views.len()
    }

    /// Bytes held by live images
    pub fn allocated_bytes(&self) -> u64 {
        self.state
            .lock()
            .images
            .values()
            .map(|image| image.desc.total_size())
            .sum()
    }
}

impl GpuTransfer for HeadlessTransfer {
    fn allocate(&self, desc: &ImageDesc) -> Result<GpuHandle> {
        let mut state = self.state.lock();
        if state.fail_allocations {
            return Err(Error::Gpu("out of device memory".into()));
        }
        state.next_id += 1;
        let handle = GpuHandle(state.next_id);
        state.images.insert(handle, HeadlessImage {
            desc: *desc,
            writable: false,
            uploads: Vec::new(),
        });
        Ok(handle)
    }

    fn free(&self, handle: GpuHandle) {
        let mut state = self.state.lock();
        state.images.remove(&handle);
        state.views.retain(|_, (owner, _)| *owner != handle);
    }

    fn memory_requirements(&self, desc: &ImageDesc) -> u64 {
        desc.total_size()
    }

    fn begin_write(&self, handle: GpuHandle) {
        if let Some(image) = self.state.lock().images.get_mut(&handle) {
            image.writable = true;
        }
    }

    fn end_write(&self, handle: GpuHandle) {
        if let Some(image) = self.state.lock().images.get_mut(&handle) {
            image.writable = false;
        }
    }

    fn upload_immediate(&self, dst: GpuHandle, mip: u8, data: &[u8]) -> Result<()> {
        self.state.lock().record(dst, mip, data.to_vec(), UploadPath::Immediate)
    }

    fn upload_queued(&self, dst: GpuHandle, mip: u8, data: Vec<u8>) -> BoxFuture<'static, Result<()>> {
        let state = Arc::clone(&self.state);
        Box::pin(async move {
            // Completes on a later poll, like a real queue submission
            tokio::task::yield_now().await;
            state.lock().record(dst, mip, data, UploadPath::Queued)
        })
    }

    fn create_view(&self, handle: GpuHandle, mips: Range<u8>) -> Result<ViewHandle> {
        let mut state = self.state.lock();
        let image = state
            .images
            .get(&handle)
            .ok_or_else(|| Error::Gpu(format!("view of freed image {:?}", handle)))?;
        if mips.is_empty() || mips.end > image.desc.level_count {
            return Err(Error::Gpu(format!("invalid mip range {:?} for {:?}", mips, handle)));
        }
        state.next_id += 1;
        let view = ViewHandle(state.next_id);
        state.views.insert(view, (handle, mips));
        Ok(view)
    }

    fn destroy_view(&self, view: ViewHandle) {
        self.state.lock().views.remove(&view);
    }
}
