//! GPU-resident streaming cache
//!
//! Maps resource ids to slots of a [`SlotTable`] and drives each slot from
//! "requested" to "fully streamed": metadata first, then one asynchronous
//! load per detail level, coarsest first in visibility. Once per frame the
//! cache sweeps the table and, if anything changed, publishes a fresh
//! indirection table and binding list.
//!
//! Lock order: id map, then the table locks (see [`slot_table`](super::slot_table)).
//! No lock is held across an await.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use tokio::runtime::Handle;

use crate::core::{ResourceId, Result};
use super::asset::AssetResolver;
use super::bindings::{Binding, BindingPublisher, FrameBindings};
use super::budget::GpuMemoryBudget;
use super::config::StreamingConfig;
use super::gpu::{GpuHandle, GpuTransfer, ViewHandle};
use super::loader::{self, InFlight};
use super::payload::ResourceEntry;
use super::slot_table::{SlotIndex, SlotState, SlotTable, SlotTableStats};

/// External collaborators of the cache
pub struct StreamingBackend {
    pub resolver: Arc<dyn AssetResolver>,
    pub gpu: Arc<dyn GpuTransfer>,
    pub publisher: Arc<dyn BindingPublisher>,
    /// Bound for every slot that is not ready; its sampler is shared by all slots
    pub fallback: Binding,
}

#[derive(Default)]
pub(super) struct Counters {
    pub(super) starvations: AtomicU64,
    pub(super) frames: AtomicU64,
    pub(super) publishes: AtomicU64,
    pub(super) evictions: AtomicU64,
    pub(super) loads_completed: AtomicU64,
    pub(super) loads_abandoned: AtomicU64,
    pub(super) load_failures: AtomicU64,
}

/// Snapshot of cache counters
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub slots: SlotTableStats,
    /// Resources with a slot
    pub resources: usize,
    pub frame: u64,
    pub gpu_bytes_used: u64,
    pub gpu_bytes_budget: u64,
    /// Requests refused because no slot was available
    pub starvations: u64,
    pub frames_swept: u64,
    pub publishes: u64,
    pub evictions: u64,
    pub loads_completed: u64,
    /// Loads discarded because their slot changed hands
    pub loads_abandoned: u64,
    pub load_failures: u64,
    pub in_flight: usize,
}

/// State shared between the cache and its background tasks
pub(super) struct CacheInner {
    pub(super) table: SlotTable<ResourceEntry>,
    pub(super) ids: Mutex<HashMap<ResourceId, SlotIndex>>,
    pub(super) config: RwLock<StreamingConfig>,
    pub(super) budget: Arc<GpuMemoryBudget>,
    pub(super) resolver: Arc<dyn AssetResolver>,
    pub(super) gpu: Arc<dyn GpuTransfer>,
    publisher: Arc<dyn BindingPublisher>,
    fallback: Binding,
    pub(super) runtime: Handle,
    /// Bindings need republishing
    pub(super) changed: AtomicBool,
    pub(super) in_flight: Arc<InFlight>,
    /// Set while requests are being refused, so starvation is logged once
    starving: AtomicBool,
    pub(super) counters: Counters,
}

impl CacheInner {
    fn build_bindings(&self, frame: u64) -> FrameBindings {
        let views = self.table.map_slots(|_, state, entry| {
            if state == SlotState::Free || !entry.is_ready() {
                return None;
            }
            entry.gpu.as_ref().and_then(|gpu| gpu.view())
        });
        FrameBindings::build(frame, self.fallback, &views)
    }
}

/// Streaming cache for GPU resources
///
/// Cheap to share behind an `Arc`; every method takes `&self` and may be
/// called from any thread.
pub struct StreamingCache {
    inner: Arc<CacheInner>,
}

impl StreamingCache {
    /// Create a cache; background work is spawned on `runtime`
    ///
    /// # Arguments
    /// * `config` - Initial configuration, validated before use
    /// * `backend` - Asset resolver, GPU transfer and binding publisher
    /// * `runtime` - Handle of the tokio runtime that runs loads
    pub fn new(config: StreamingConfig, backend: StreamingBackend, runtime: Handle) -> Result<Self> {
        config.validate()?;
        let budget = Arc::new(GpuMemoryBudget::new(config.max_pool_memory_bytes));

        log::info!(
            "Streaming cache created: {} max slots, {} MB GPU budget",
            config.max_entries,
            config.max_pool_memory_bytes / (1024 * 1024)
        );

        Ok(Self {
            inner: Arc::new(CacheInner {
                table: SlotTable::new(),
                ids: Mutex::new(HashMap::new()),
                config: RwLock::new(config),
                budget,
                resolver: backend.resolver,
                gpu: backend.gpu,
                publisher: backend.publisher,
                fallback: backend.fallback,
                runtime,
                changed: AtomicBool::new(false),
                in_flight: Arc::new(InFlight::default()),
                starving: AtomicBool::new(false),
                counters: Counters::default(),
            }),
        })
    }

    /// Slot for a resource, allocating one on first request
    ///
    /// # Arguments
    /// * `id` - Resource to stream
    ///
    /// # Returns
    /// The resource's slot, or [`SlotIndex::INVALID`] when every slot is in
    /// use and none is old enough to reclaim; render the fallback in that case.
    pub fn request_slot(&self, id: ResourceId) -> SlotIndex {
        let inner = &self.inner;
        let mut ids = inner.ids.lock();
        if let Some(&slot) = ids.get(&id) {
            return slot;
        }

        let params = inner.config.read().alloc_params();
        let Some(acquired) = inner.table.find_or_create_slot(&params) else {
            inner.counters.starvations.fetch_add(1, Ordering::Relaxed);
            if !inner.starving.swap(true, Ordering::AcqRel) {
                log::warn!(
                    "Streaming cache starved: all {} slots in use, resource {} falls back",
                    inner.table.len(), id
                );
            }
            return SlotIndex::INVALID;
        };
        inner.starving.store(false, Ordering::Release);

        if let Some(previous) = acquired.previous {
            if let Some(old_id) = previous.resource_id {
                if ids.get(&old_id) == Some(&acquired.index) {
                    ids.remove(&old_id);
                }
                log::debug!("Slot {} reclaimed from resource {}", acquired.index.get(), old_id);
            }
            // Dropping the old entry poisons its in-flight loads
            drop(previous);
        }

        inner.table.with_slot(acquired.index, |entry| {
            entry.resource_id = Some(id);
            entry.is_invalid = true;
        });
        ids.insert(id, acquired.index);
        drop(ids);

        inner.changed.store(true, Ordering::Release);
        loader::spawn_metadata_load(inner, acquired.index, id);
        acquired.index
    }

    /// Mark a slot as used this frame at `detail_level` (0 = coarsest)
    ///
    /// Loading happens on the next [`process_start_of_frame`](Self::process_start_of_frame).
    ///
    /// # Arguments
    /// * `slot` - Slot returned by [`request_slot`](Self::request_slot); invalid slots are ignored
    /// * `detail_level` - Finest detail level wanted this frame
    pub fn indicate_usage(&self, slot: SlotIndex, detail_level: u8) {
        if !self.inner.table.touch(slot) {
            return;
        }
        self.inner.table.with_slot(slot, |entry| {
            if entry.resource_id.is_some() {
                entry.requested_levels = detail_level.saturating_add(1);
            }
        });
    }

    /// Sweep, drive streaming for active slots, and publish bindings if needed
    ///
    /// # Returns
    /// True if bindings were published
    pub fn process_start_of_frame(&self) -> bool {
        let inner = &self.inner;

        let mut pending = Vec::new();
        let report = inner.table.start_frame(|slot, entry| {
            if entry.needs_streaming() {
                pending.push(slot);
            }
        });
        inner.counters.frames.fetch_add(1, Ordering::Relaxed);

        for slot in pending {
            loader::kick_streaming(inner, slot);
        }

        if !inner.changed.swap(false, Ordering::AcqRel) {
            return false;
        }

        let bindings = inner.build_bindings(report.frame);
        inner.publisher.publish(&bindings);
        inner.counters.publishes.fetch_add(1, Ordering::Relaxed);
        log::debug!(
            "Published bindings for frame {}: {} of {} slots ready",
            report.frame,
            bindings.ready_count(),
            bindings.indirection.len() - 1
        );
        true
    }

    /// Drop every slot and resource mapping
    ///
    /// In-flight loads are poisoned and all previously returned slot indices
    /// become invalid.
    pub fn clear(&self) {
        let mut ids = self.inner.ids.lock();
        let resources = ids.len();
        ids.clear();
        let drained = self.inner.table.clear();
        drop(ids);
        drop(drained);

        self.inner.changed.store(true, Ordering::Release);
        log::info!("Streaming cache cleared ({} resources dropped)", resources);
    }

    /// Evict unused resources until GPU usage fits the budget
    ///
    /// # Arguments
    /// * `aggressive` - Evict every unused resource regardless of usage
    ///
    /// # Returns
    /// Number of slots released
    pub fn enforce_budget(&self, aggressive: bool) -> usize {
        self.inner.enforce_budget(aggressive)
    }

    /// Current configuration
    pub fn config(&self) -> StreamingConfig {
        self.inner.config.read().clone()
    }

    /// Replace the configuration
    ///
    /// Takes effect on the next allocation; a smaller table limit stops growth
    /// but never shrinks the table.
    pub fn set_config(&self, config: StreamingConfig) -> Result<()> {
        config.validate()?;
        self.inner.budget.set_budget(config.max_pool_memory_bytes);
        log::info!(
            "Streaming config updated: {} max slots, {} MB GPU budget",
            config.max_entries,
            config.max_pool_memory_bytes / (1024 * 1024)
        );
        *self.inner.config.write() = config;
        Ok(())
    }

    /// Load the configuration from a JSON file and apply it
    ///
    /// # Arguments
    /// * `path` - JSON file written by [`StreamingConfig::save_sync`]
    pub fn reload_config(&self, path: &Path) -> Result<()> {
        let config = StreamingConfig::load_sync(path)?;
        log::info!("Reloading streaming config from {:?}", path);
        self.set_config(config)
    }

    /// Slot currently assigned to a resource
    pub fn slot_for(&self, id: ResourceId) -> Option<SlotIndex> {
        self.inner.ids.lock().get(&id).copied()
    }

    /// Resource occupying a slot
    pub fn resource_at(&self, slot: SlotIndex) -> Option<ResourceId> {
        self.inner.table.with_slot(slot, |entry| entry.resource_id).flatten()
    }

    /// The slot has a published view
    pub fn is_ready(&self, slot: SlotIndex) -> bool {
        self.inner.table.with_slot(slot, |entry| entry.is_ready()).unwrap_or(false)
    }

    /// Number of contiguous coarse levels visible for a slot
    pub fn visible_levels(&self, slot: SlotIndex) -> u8 {
        self.inner.table.with_slot(slot, |entry| entry.visible_levels()).unwrap_or(0)
    }

    /// The slot's resource failed to load and renders as fallback until cleared
    pub fn is_failed(&self, slot: SlotIndex) -> bool {
        self.inner.table.with_slot(slot, |entry| entry.failed).unwrap_or(false)
    }

    /// View currently published for a slot
    pub fn view(&self, slot: SlotIndex) -> Option<ViewHandle> {
        self.inner
            .table
            .with_slot(slot, |entry| entry.gpu.as_ref().and_then(|gpu| gpu.view()))
            .flatten()
    }

    /// GPU image currently backing a slot
    pub fn gpu_handle(&self, slot: SlotIndex) -> Option<GpuHandle> {
        self.inner
            .table
            .with_slot(slot, |entry| entry.gpu.as_ref().map(|gpu| gpu.handle()))
            .flatten()
    }

    /// Outstanding asynchronous steps (metadata loads and level batches)
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.get()
    }

    /// Wait until no asynchronous step is outstanding
    pub async fn flush(&self) {
        self.inner.in_flight.wait_idle().await;
    }

    pub fn budget(&self) -> &GpuMemoryBudget {
        &self.inner.budget
    }

    pub fn current_frame(&self) -> u64 {
        self.inner.table.current_frame()
    }

    pub fn stats(&self) -> CacheStats {
        let inner = &self.inner;
        let counters = &inner.counters;
        CacheStats {
            slots: inner.table.stats(),
            resources: inner.ids.lock().len(),
            frame: inner.table.current_frame(),
            gpu_bytes_used: inner.budget.used(),
            gpu_bytes_budget: inner.budget.budget(),
            starvations: counters.starvations.load(Ordering::Relaxed),
            frames_swept: counters.frames.load(Ordering::Relaxed),
            publishes: counters.publishes.load(Ordering::Relaxed),
            evictions: counters.evictions.load(Ordering::Relaxed),
            loads_completed: counters.loads_completed.load(Ordering::Relaxed),
            loads_abandoned: counters.loads_abandoned.load(Ordering::Relaxed),
            load_failures: counters.load_failures.load(Ordering::Relaxed),
            in_flight: inner.in_flight.get(),
        }
    }
}
