//! wgpu implementations of the GPU collaborators
//!
//! [`WgpuTransfer`] backs textures with mipmapped `wgpu::Texture`s and meshes
//! with one `wgpu::Buffer` holding every level back to back.
//! [`WgpuBindingPublisher`] keeps the indirection table in a storage buffer
//! and the binding list for the renderer to build its bind group from.
//!
//! Queued uploads resolve from `on_submitted_work_done`, which only fires
//! while the device is polled; the render loop does that every frame (or
//! calls [`WgpuTransfer::poll_wait`]).

use std::collections::HashMap;
use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::core::{BoxFuture, Error, Result};
use super::asset::ResourceKind;
use super::bindings::{Binding, BindingPublisher, FrameBindings};
use super::gpu::{GpuHandle, GpuTransfer, ImageDesc, SamplerHandle, ViewHandle};

/// Minimum indirection buffer size (entries)
const MIN_INDIRECTION_ENTRIES: u64 = 256;

/// Texture format for a texel size
pub fn texture_format(bytes_per_texel: u32) -> Result<wgpu::TextureFormat> {
    match bytes_per_texel {
        1 => Ok(wgpu::TextureFormat::R8Unorm),
        2 => Ok(wgpu::TextureFormat::Rg8Unorm),
        4 => Ok(wgpu::TextureFormat::Rgba8Unorm),
        8 => Ok(wgpu::TextureFormat::Rgba16Float),
        16 => Ok(wgpu::TextureFormat::Rgba32Float),
        other => Err(Error::Gpu(format!("no texture format with {} bytes per texel", other))),
    }
}

/// Byte offset of each mesh level plus the total buffer size
///
/// Levels start on `COPY_BUFFER_ALIGNMENT` boundaries.
pub fn mesh_level_layout(desc: &ImageDesc) -> (Vec<u64>, u64) {
    let mut offsets = Vec::with_capacity(desc.level_count as usize);
    let mut cursor = 0u64;
    for mip in 0..desc.level_count {
        offsets.push(cursor);
        cursor = align_up(cursor + desc.level_size(mip), wgpu::COPY_BUFFER_ALIGNMENT);
    }
    (offsets, cursor)
}

fn align_up(value: u64, alignment: u64) -> u64 {
    value.div_ceil(alignment) * alignment
}

fn max_mip_levels(width: u32, height: u32) -> u8 {
    (32 - width.max(height).max(1).leading_zeros()) as u8
}

enum Image {
    Texture {
        texture: wgpu::Texture,
        desc: ImageDesc,
    },
    Buffer {
        buffer: wgpu::Buffer,
        desc: ImageDesc,
        offsets: Vec<u64>,
        size: u64,
    },
}

enum View {
    Texture(wgpu::TextureView),
    Buffer { buffer: wgpu::Buffer, range: Range<u64> },
}

/// [`GpuTransfer`] over a wgpu device
pub struct WgpuTransfer {
    device: wgpu::Device,
    queue: wgpu::Queue,
    images: Mutex<HashMap<GpuHandle, Image>>,
    views: Mutex<HashMap<ViewHandle, View>>,
    samplers: Mutex<HashMap<SamplerHandle, wgpu::Sampler>>,
    next_id: AtomicU64,
}

impl WgpuTransfer {
    pub fn new(device: wgpu::Device, queue: wgpu::Queue) -> Self {
        Self {
            device,
            queue,
            images: Mutex::new(HashMap::new()),
            views: Mutex::new(HashMap::new()),
            samplers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Create a linear sampler shared by streamed textures
    pub fn create_sampler(&self) -> SamplerHandle {
        let sampler = self.device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("streaming_sampler"),
            address_mode_u: wgpu::AddressMode::Repeat,
            address_mode_v: wgpu::AddressMode::Repeat,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            ..Default::default()
        });
        let handle = SamplerHandle(self.next_id());
        self.samplers.lock().insert(handle, sampler);
        handle
    }

    /// Create the 1x1 fallback texture bound for slots that are not ready
    pub fn create_fallback(&self, rgba: [u8; 4]) -> Result<Binding> {
        let desc = ImageDesc {
            kind: ResourceKind::Texture,
            width: 1,
            height: 1,
            level_count: 1,
            bytes_per_texel: 4,
        };
        let handle = self.allocate(&desc)?;
        self.upload_immediate(handle, 0, &rgba)?;
        let view = self.create_view(handle, 0..1)?;
        Ok(Binding {
            view,
            sampler: self.create_sampler(),
        })
    }

    /// Run `f` on the texture view behind a handle
    pub fn with_texture_view<R>(&self, view: ViewHandle, f: impl FnOnce(&wgpu::TextureView) -> R) -> Option<R> {
        match self.views.lock().get(&view) {
            Some(View::Texture(texture_view)) => Some(f(texture_view)),
            _ => None,
        }
    }

    /// Buffer and byte range behind a mesh view
    pub fn buffer_view(&self, view: ViewHandle) -> Option<(wgpu::Buffer, Range<u64>)> {
        match self.views.lock().get(&view) {
            Some(View::Buffer { buffer, range }) => Some((buffer.clone(), range.clone())),
            _ => None,
        }
    }

    /// Block until submitted work is done, firing pending upload callbacks
    pub fn poll_wait(&self) -> Result<()> {
        self.device
            .poll(wgpu::PollType::Wait { submission_index: None, timeout: None })
            .map_err(|e| Error::Gpu(format!("device poll failed: {}", e)))?;
        Ok(())
    }

    pub fn with_sampler<R>(&self, sampler: SamplerHandle, f: impl FnOnce(&wgpu::Sampler) -> R) -> Option<R> {
        self.samplers.lock().get(&sampler).map(f)
    }

    fn write(&self, dst: GpuHandle, mip: u8, data: &[u8]) -> Result<()> {
        let images = self.images.lock();
        let image = images
            .get(&dst)
            .ok_or_else(|| Error::Gpu(format!("upload to freed image {:?}", dst)))?;

        match image {
            Image::Texture { texture, desc } => {
                check_level(desc, mip, data)?;
                let (width, height) = desc.level_extent(mip);
                self.queue.write_texture(
                    wgpu::TexelCopyTextureInfo {
                        texture,
                        mip_level: mip as u32,
                        origin: wgpu::Origin3d::ZERO,
                        aspect: wgpu::TextureAspect::All,
                    },
                    data,
                    wgpu::TexelCopyBufferLayout {
                        offset: 0,
                        bytes_per_row: Some(width * desc.bytes_per_texel),
                        rows_per_image: Some(height),
                    },
                    wgpu::Extent3d {
                        width,
                        height,
                        depth_or_array_layers: 1,
                    },
                );
            }
            Image::Buffer { buffer, desc, offsets, .. } => {
                check_level(desc, mip, data)?;
                let padded = align_up(data.len() as u64, wgpu::COPY_BUFFER_ALIGNMENT) as usize;
                if padded == data.len() {
                    self.queue.write_buffer(buffer, offsets[mip as usize], data);
                } else {
                    let mut bytes = data.to_vec();
                    bytes.resize(padded, 0);
                    self.queue.write_buffer(buffer, offsets[mip as usize], &bytes);
                }
            }
        }

        log::trace!("Queued write of mip {} of {:?} ({} bytes)", mip, dst, data.len());
        Ok(())
    }
}

fn check_level(desc: &ImageDesc, mip: u8, data: &[u8]) -> Result<()> {
    if mip >= desc.level_count {
        return Err(Error::Gpu(format!("mip {} out of range ({} levels)", mip, desc.level_count)));
    }
    let expected = desc.level_size(mip);
    if data.len() as u64 != expected {
        return Err(Error::Gpu(format!(
            "mip {} upload is {} bytes, expected {}", mip, data.len(), expected
        )));
    }
    Ok(())
}

impl GpuTransfer for WgpuTransfer {
    fn allocate(&self, desc: &ImageDesc) -> Result<GpuHandle> {
        let image = match desc.kind {
            ResourceKind::Texture => {
                if desc.level_count > max_mip_levels(desc.width, desc.height) {
                    return Err(Error::Gpu(format!(
                        "{}x{} texture cannot have {} mips", desc.width, desc.height, desc.level_count
                    )));
                }
                let texture = self.device.create_texture(&wgpu::TextureDescriptor {
                    label: Some("streamed_texture"),
                    size: wgpu::Extent3d {
                        width: desc.width,
                        height: desc.height,
                        depth_or_array_layers: 1,
                    },
                    mip_level_count: desc.level_count as u32,
                    sample_count: 1,
                    dimension: wgpu::TextureDimension::D2,
                    format: texture_format(desc.bytes_per_texel)?,
                    usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
                    view_formats: &[],
                });
                Image::Texture { texture, desc: *desc }
            }
            ResourceKind::Mesh => {
                let (offsets, size) = mesh_level_layout(desc);
                let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
                    label: Some("streamed_mesh"),
                    size,
                    usage: wgpu::BufferUsages::STORAGE
                        | wgpu::BufferUsages::VERTEX
                        | wgpu::BufferUsages::COPY_DST,
                    mapped_at_creation: false,
                });
                Image::Buffer { buffer, desc: *desc, offsets, size }
            }
        };

        let handle = GpuHandle(self.next_id());
        self.images.lock().insert(handle, image);
        Ok(handle)
    }

    fn free(&self, handle: GpuHandle) {
        let Some(image) = self.images.lock().remove(&handle) else {
            return;
        };
        match image {
            Image::Texture { texture, .. } => texture.destroy(),
            Image::Buffer { buffer, .. } => buffer.destroy(),
        }
    }

    fn memory_requirements(&self, desc: &ImageDesc) -> u64 {
        match desc.kind {
            ResourceKind::Texture => desc.total_size(),
            ResourceKind::Mesh => mesh_level_layout(desc).1,
        }
    }

    // wgpu tracks resource states itself
    fn begin_write(&self, handle: GpuHandle) {
        log::trace!("Begin write on {:?}", handle);
    }

    fn end_write(&self, handle: GpuHandle) {
        log::trace!("End write on {:?}", handle);
    }

    fn upload_immediate(&self, dst: GpuHandle, mip: u8, data: &[u8]) -> Result<()> {
        self.write(dst, mip, data)
    }

    fn upload_queued(&self, dst: GpuHandle, mip: u8, data: Vec<u8>) -> BoxFuture<'static, Result<()>> {
        if let Err(e) = self.write(dst, mip, &data) {
            return Box::pin(async move { Err(e) });
        }

        let (tx, rx) = tokio::sync::oneshot::channel();
        self.queue.submit(std::iter::empty());
        self.queue.on_submitted_work_done(move || {
            let _ = tx.send(());
        });

        Box::pin(async move {
            rx.await
                .map_err(|_| Error::Gpu("device dropped before upload completed".into()))
        })
    }

    fn create_view(&self, handle: GpuHandle, mips: Range<u8>) -> Result<ViewHandle> {
        let images = self.images.lock();
        let image = images
            .get(&handle)
            .ok_or_else(|| Error::Gpu(format!("view of freed image {:?}", handle)))?;

        let view = match image {
            Image::Texture { texture, desc } => {
                if mips.is_empty() || mips.end > desc.level_count {
                    return Err(Error::Gpu(format!("invalid mip range {:?}", mips)));
                }
                View::Texture(texture.create_view(&wgpu::TextureViewDescriptor {
                    label: Some("streamed_view"),
                    base_mip_level: mips.start as u32,
                    mip_level_count: Some((mips.end - mips.start) as u32),
                    ..Default::default()
                }))
            }
            Image::Buffer { buffer, desc, offsets, size } => {
                if mips.is_empty() || mips.end > desc.level_count {
                    return Err(Error::Gpu(format!("invalid mip range {:?}", mips)));
                }
                let start = offsets[mips.start as usize];
                let end = offsets.get(mips.end as usize).copied().unwrap_or(*size);
                View::Buffer {
                    buffer: buffer.clone(),
                    range: start..end,
                }
            }
        };
        drop(images);

        let handle = ViewHandle(self.next_id());
        self.views.lock().insert(handle, view);
        Ok(handle)
    }

    fn destroy_view(&self, view: ViewHandle) {
        self.views.lock().remove(&view);
    }
}

/// Number of indirection entries to allocate for `needed` entries
pub fn indirection_capacity(needed: u64) -> u64 {
    needed.next_power_of_two().max(MIN_INDIRECTION_ENTRIES)
}

struct PublishedState {
    buffer: wgpu::Buffer,
    /// Capacity in `u32` entries
    capacity: u64,
    bindings: Vec<Binding>,
    /// Bumped on every publish
    generation: u64,
}

/// Publishes the indirection table to a GPU storage buffer
pub struct WgpuBindingPublisher {
    device: wgpu::Device,
    queue: wgpu::Queue,
    state: Mutex<PublishedState>,
}

impl WgpuBindingPublisher {
    pub fn new(device: wgpu::Device, queue: wgpu::Queue) -> Self {
        let capacity = MIN_INDIRECTION_ENTRIES;
        let buffer = Self::create_buffer(&device, capacity);
        Self {
            device,
            queue,
            state: Mutex::new(PublishedState {
                buffer,
                capacity,
                bindings: Vec::new(),
                generation: 0,
            }),
        }
    }

    fn create_buffer(device: &wgpu::Device, capacity: u64) -> wgpu::Buffer {
        device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("streaming_indirection"),
            size: capacity * std::mem::size_of::<u32>() as u64,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        })
    }

    /// Current indirection buffer; replaced when the table outgrows it
    pub fn indirection_buffer(&self) -> wgpu::Buffer {
        self.state.lock().buffer.clone()
    }

    /// Bindings of the last publish (entry 0 is the fallback)
    pub fn bindings(&self) -> Vec<Binding> {
        self.state.lock().bindings.clone()
    }

    /// Changes whenever the bind group must be rebuilt
    pub fn generation(&self) -> u64 {
        self.state.lock().generation
    }
}

impl BindingPublisher for WgpuBindingPublisher {
    fn publish(&self, bindings: &FrameBindings) {
        let mut state = self.state.lock();

        let needed = bindings.indirection.len() as u64;
        if needed > state.capacity {
            let capacity = indirection_capacity(needed);
            log::debug!("Growing indirection buffer from {} to {} entries", state.capacity, capacity);
            state.buffer.destroy();
            state.buffer = Self::create_buffer(&self.device, capacity);
            state.capacity = capacity;
        }

        self.queue.write_buffer(&state.buffer, 0, bytemuck::cast_slice(&bindings.indirection));
        state.bindings.clone_from(&bindings.bindings);
        state.generation += 1;
    }
}
