//! On-demand streaming of GPU resources into bounded GPU memory

pub mod slot_table;
pub mod allocator;
pub mod sweeper;
pub mod budget;
pub mod config;
pub mod asset;
pub mod gpu;
pub mod payload;
pub mod bindings;
pub mod cache;
mod loader;
mod eviction;
pub mod wgpu_backend;

pub use slot_table::{SlotIndex, SlotState, SlotTable, SlotTableStats};
pub use allocator::{AcquireSource, Acquired, AllocParams, DEFAULT_CAPACITY_GRACE_FRAMES};
pub use sweeper::SweepReport;
pub use budget::GpuMemoryBudget;
pub use config::StreamingConfig;
pub use asset::{
    AssetKey, AssetResolver, FileAssetResolver, MemoryAssetResolver,
    ResourceKind, ResourceMeta, write_resource,
    META_VERSION, MAX_DETAIL_LEVELS,
};
pub use gpu::{
    GpuHandle, GpuTransfer, HeadlessTransfer, ImageDesc,
    SamplerHandle, UploadPath, UploadRecord, ViewHandle,
};
pub use payload::{GpuPayload, ResourceEntry};
pub use bindings::{
    Binding, BindingPublisher, FrameBindings, RecordingPublisher,
    logical_to_physical_index,
};
pub use cache::{CacheStats, StreamingBackend, StreamingCache};
pub use wgpu_backend::{WgpuBindingPublisher, WgpuTransfer};
