//! Asynchronous metadata and detail-level loading
//!
//! Every continuation re-validates its slot before touching shared state: the
//! entry must still belong to the same resource and hold the same GPU payload,
//! and the payload must not be evicted. Anything else is a stale result and is
//! dropped silently.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::Notify;
use tokio::task::JoinSet;

use crate::core::{Error, ResourceId};
use super::asset::{AssetKey, ResourceMeta};
use super::cache::CacheInner;
use super::payload::GpuPayload;
use super::slot_table::SlotIndex;

/// Number of outstanding asynchronous steps, with a wakeup when it drops to zero
#[derive(Default)]
pub(super) struct InFlight {
    count: AtomicUsize,
    idle: Notify,
}

impl InFlight {
    pub(super) fn get(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Wait until no step is outstanding
    pub(super) async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            // Register before checking, so a wakeup between the two is not lost
            notified.as_mut().enable();
            if self.get() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Counts an outstanding asynchronous step for as long as it lives
pub(super) struct InFlightGuard(Arc<InFlight>);

impl InFlightGuard {
    pub(super) fn new(in_flight: &Arc<InFlight>) -> Self {
        in_flight.count.fetch_add(1, Ordering::AcqRel);
        Self(Arc::clone(in_flight))
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.0.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

/// Levels claimed by one dispatch
struct Batch {
    id: ResourceId,
    meta: Arc<ResourceMeta>,
    payload: Arc<GpuPayload>,
    /// First detail level to load
    from: u8,
    /// One past the last detail level to load
    target: u8,
}

/// Fetch metadata for a freshly assigned slot
pub(super) fn spawn_metadata_load(inner: &Arc<CacheInner>, slot: SlotIndex, id: ResourceId) {
    let guard = InFlightGuard::new(&inner.in_flight);
    let task_inner = Arc::clone(inner);

    inner.runtime.spawn(async move {
        let _guard = guard;
        let inner = task_inner;

        let result = inner
            .resolver
            .read(AssetKey::Metadata(id))
            .await
            .and_then(|bytes| ResourceMeta::from_bytes(&bytes));

        let accepted = inner.table.with_slot(slot, |entry| {
            if !entry.is_owned_by(id) || entry.meta.is_some() {
                return false;
            }
            match result {
                Ok(meta) => {
                    log::trace!("Metadata for {}: {:?}, {} levels", id, meta.kind, meta.level_count);
                    entry.meta = Some(Arc::new(meta));
                    entry.is_invalid = false;
                    true
                }
                Err(e) => {
                    log::warn!("Resource {} failed to load metadata, using fallback: {}", id, e);
                    entry.failed = true;
                    false
                }
            }
        });

        if accepted == Some(true) {
            kick_streaming(&inner, slot);
        }
    });
}

/// Dispatch loads for the levels a slot still needs
///
/// Allocates the GPU image on first need. Does nothing if the slot is not
/// owned, not valid, or already has every requested level in flight.
pub(super) fn kick_streaming(inner: &Arc<CacheInner>, slot: SlotIndex) {
    let plan = inner.table.with_slot(slot, |entry| {
        if !entry.needs_streaming() {
            return None;
        }
        let id = entry.resource_id?;
        let meta = entry.meta.clone()?;
        Some((id, meta, entry.gpu.clone()))
    });
    let Some((id, meta, existing)) = plan.flatten() else {
        return;
    };

    let payload = match existing {
        Some(payload) => payload,
        None => match allocate_payload(inner, &meta) {
            Some(payload) => payload,
            None => {
                inner.table.with_slot(slot, |entry| {
                    if entry.is_owned_by(id) {
                        entry.is_invalid = true;
                        entry.failed = true;
                    }
                });
                return;
            }
        },
    };

    let batch = inner.table.with_slot(slot, |entry| {
        if !entry.is_owned_by(id) || entry.is_invalid {
            return None;
        }
        let payload = Arc::clone(entry.gpu.get_or_insert(payload));
        let from = entry.streamed_levels;
        let target = entry.requested_levels.min(meta.level_count);
        if from >= target || payload.is_evicted() {
            return None;
        }
        entry.streamed_levels = target;
        payload.begin_batch();
        Some(Batch { id, meta: Arc::clone(&meta), payload, from, target })
    });
    let Some(batch) = batch.flatten() else {
        return;
    };

    log::trace!(
        "Streaming {} levels {}..{} into slot {}",
        batch.id, batch.from, batch.target, slot.get()
    );

    let guard = InFlightGuard::new(&inner.in_flight);
    inner.runtime.spawn(stream_batch(Arc::clone(inner), slot, batch, guard));
}

/// Allocate the GPU image, making room under the budget first
fn allocate_payload(inner: &Arc<CacheInner>, meta: &ResourceMeta) -> Option<Arc<GpuPayload>> {
    inner.enforce_budget(false);

    let desc = meta.image_desc();
    match GpuPayload::allocate(Arc::clone(&inner.gpu), Arc::clone(&inner.budget), &desc) {
        Ok(payload) => Some(payload),
        Err(e) => {
            inner.counters.load_failures.fetch_add(1, Ordering::Relaxed);
            log::warn!("GPU allocation of {} bytes failed: {}", desc.total_size(), e);
            None
        }
    }
}

async fn stream_batch(inner: Arc<CacheInner>, slot: SlotIndex, batch: Batch, _guard: InFlightGuard) {
    let mut tasks = JoinSet::new();
    for detail in batch.from..batch.target {
        tasks.spawn(load_level(
            Arc::clone(&inner),
            slot,
            batch.id,
            Arc::clone(&batch.meta),
            Arc::clone(&batch.payload),
            detail,
        ));
    }

    while let Some(result) = tasks.join_next().await {
        if let Err(e) = result {
            log::warn!("Level load task for {} failed: {}", batch.id, e);
        }
    }

    // Only the batch that reached the slot's target may release the write state
    let release = !batch.payload.is_evicted()
        && inner
            .table
            .with_slot(slot, |entry| {
                entry.is_owned_by(batch.id)
                    && entry.holds(&batch.payload)
                    && entry.streamed_levels == batch.target
            })
            .unwrap_or(false);
    batch.payload.end_batch(release);
    drop(batch);
}

/// Whether a continuation for `payload` may still touch `slot`
fn is_current(inner: &CacheInner, slot: SlotIndex, id: ResourceId, payload: &Arc<GpuPayload>) -> bool {
    !payload.is_evicted()
        && inner
            .table
            .with_slot(slot, |entry| entry.is_owned_by(id) && entry.holds(payload))
            .unwrap_or(false)
}

async fn load_level(
    inner: Arc<CacheInner>,
    slot: SlotIndex,
    id: ResourceId,
    meta: Arc<ResourceMeta>,
    payload: Arc<GpuPayload>,
    detail: u8,
) {
    let mip = meta.mip_for_detail(detail);

    let bytes = match inner.resolver.read(AssetKey::Level(id, mip)).await {
        Ok(bytes) => bytes,
        Err(e) => {
            fail_level(&inner, slot, id, &payload, mip, e);
            return;
        }
    };

    if !is_current(&inner, slot, id, &payload) {
        inner.counters.loads_abandoned.fetch_add(1, Ordering::Relaxed);
        return;
    }

    let threshold = inner.config.read().small_upload_threshold;
    let upload = if bytes.len() <= threshold {
        inner.gpu.upload_immediate(payload.handle(), mip, &bytes)
    } else {
        inner.gpu.upload_queued(payload.handle(), mip, bytes).await
    };
    if let Err(e) = upload {
        fail_level(&inner, slot, id, &payload, mip, e);
        return;
    }

    if !is_current(&inner, slot, id, &payload) {
        inner.counters.loads_abandoned.fetch_add(1, Ordering::Relaxed);
        return;
    }

    let run = payload.mark_level_loaded(detail);
    inner.counters.loads_completed.fetch_add(1, Ordering::Relaxed);

    // Only a level that completes the contiguous run can widen the view
    if run > detail as u32 {
        match payload.publish_view(run as u8) {
            Ok(true) => {
                log::trace!("Slot {} now shows {} levels of {}", slot.get(), run, id);
                inner.changed.store(true, Ordering::Release);
            }
            Ok(false) => {}
            Err(e) => log::warn!("Failed to publish view for {}: {}", id, e),
        }
    }
}

/// A level could not be loaded: the slot falls back until it is reused
fn fail_level(
    inner: &CacheInner,
    slot: SlotIndex,
    id: ResourceId,
    payload: &Arc<GpuPayload>,
    mip: u8,
    error: Error,
) {
    if !is_current(inner, slot, id, payload) {
        inner.counters.loads_abandoned.fetch_add(1, Ordering::Relaxed);
        return;
    }

    inner.counters.load_failures.fetch_add(1, Ordering::Relaxed);
    log::warn!("Resource {} mip {} failed to load, using fallback: {}", id, mip, error);

    inner.table.with_slot(slot, |entry| {
        if entry.is_owned_by(id) {
            entry.is_invalid = true;
            entry.failed = true;
        }
    });
    inner.changed.store(true, Ordering::Release);
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use tokio::sync::Semaphore;

    use super::*;
    use crate::core::{BoxFuture, Result};
    use crate::streaming::asset::{AssetResolver, MemoryAssetResolver};
    use crate::streaming::cache::testing::*;
    use crate::streaming::config::StreamingConfig;
    use crate::streaming::gpu::UploadPath;

    /// Resolver that holds back chosen reads until their gate is opened
    struct GatedResolver {
        inner: Arc<MemoryAssetResolver>,
        gates: HashMap<AssetKey, Arc<Semaphore>>,
    }

    impl GatedResolver {
        fn new(inner: Arc<MemoryAssetResolver>) -> Self {
            Self { inner, gates: HashMap::new() }
        }

        fn gate(&mut self, key: AssetKey) -> Arc<Semaphore> {
            Arc::clone(self.gates.entry(key).or_insert_with(|| Arc::new(Semaphore::new(0))))
        }
    }

    impl AssetResolver for GatedResolver {
        fn read(&self, key: AssetKey) -> BoxFuture<'static, Result<Vec<u8>>> {
            let gate = self.gates.get(&key).cloned();
            let read = self.inner.read(key);
            Box::pin(async move {
                if let Some(gate) = gate {
                    let permit = gate
                        .acquire()
                        .await
                        .map_err(|e| Error::Asset(e.to_string()))?;
                    permit.forget();
                }
                read.await
            })
        }
    }

    #[test]
    fn test_in_flight_guard_counts() {
        let in_flight = Arc::new(InFlight::default());
        let a = InFlightGuard::new(&in_flight);
        let b = InFlightGuard::new(&in_flight);
        assert_eq!(in_flight.get(), 2);
        drop(a);
        drop(b);
        assert_eq!(in_flight.get(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_wait_idle_wakes_on_last_guard() {
        let in_flight = Arc::new(InFlight::default());
        in_flight.wait_idle().await;

        let guard = InFlightGuard::new(&in_flight);
        let waiter = {
            let in_flight = Arc::clone(&in_flight);
            tokio::spawn(async move { in_flight.wait_idle().await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        tokio::time::timeout(std::time::Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_no_gap_in_visible_levels() {
        let memory = Arc::new(MemoryAssetResolver::new());
        add_texture(&memory, 1, 16, 4);
        let id = ResourceId::new(1);

        let mut gated = GatedResolver::new(Arc::clone(&memory));
        // Detail d lives in mip 3 - d
        let gates: Vec<Arc<Semaphore>> = (0..4u8).map(|d| gated.gate(AssetKey::Level(id, 3 - d))).collect();
        let (cache, gpu, _publisher) = fixture_with_resolver(StreamingConfig::default(), Arc::new(gated));

        let slot = cache.request_slot(id);
        wait_until(|| cache.in_flight() == 0).await;
        cache.indicate_usage(slot, 3);
        cache.process_start_of_frame();
        let handle = cache.gpu_handle(slot).unwrap();

        // Finest levels first: nothing may become visible yet
        for detail in [3usize, 2, 1] {
            gates[detail].add_permits(1);
            wait_until(|| gpu.uploads(handle).len() == 4 - detail).await;
            assert_eq!(cache.visible_levels(slot), 0);
            assert!(!cache.is_ready(slot));
        }

        // The coarsest level completes the whole chain at once
        gates[0].add_permits(1);
        wait_until(|| cache.visible_levels(slot) == 4).await;
        cache.flush().await;
        assert!(!gpu.is_writable(handle));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_visible_run_grows_with_coarse_levels() {
        let memory = Arc::new(MemoryAssetResolver::new());
        add_texture(&memory, 2, 16, 3);
        let id = ResourceId::new(2);

        let mut gated = GatedResolver::new(Arc::clone(&memory));
        let gates: Vec<Arc<Semaphore>> = (0..3u8).map(|d| gated.gate(AssetKey::Level(id, 2 - d))).collect();
        let (cache, _gpu, _publisher) = fixture_with_resolver(StreamingConfig::default(), Arc::new(gated));

        let slot = cache.request_slot(id);
        wait_until(|| cache.in_flight() == 0).await;
        cache.indicate_usage(slot, 2);
        cache.process_start_of_frame();

        gates[0].add_permits(1);
        wait_until(|| cache.visible_levels(slot) == 1).await;
        assert!(cache.is_ready(slot));

        gates[1].add_permits(1);
        wait_until(|| cache.visible_levels(slot) == 2).await;

        gates[2].add_permits(1);
        wait_until(|| cache.visible_levels(slot) == 3).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stale_write_is_rejected() {
        let memory = Arc::new(MemoryAssetResolver::new());
        add_texture(&memory, 0xA, 8, 1);
        add_texture(&memory, 0xB, 8, 1);
        let a = ResourceId::new(0xA);
        let b = ResourceId::new(0xB);

        let mut gated = GatedResolver::new(Arc::clone(&memory));
        let gate_a = gated.gate(AssetKey::Level(a, 0));
        let config = StreamingConfig {
            entries_to_allocate_at_once: 1,
            max_entries: 1,
            ..Default::default()
        };
        let (cache, gpu, _publisher) = fixture_with_resolver(config, Arc::new(gated));

        // A starts loading and stalls on its only level
        let slot = cache.request_slot(a);
        wait_until(|| cache.in_flight() == 0).await;
        cache.indicate_usage(slot, 0);
        cache.process_start_of_frame();
        let handle_a = cache.gpu_handle(slot).unwrap();

        // A goes cold and is evicted while its read is pending
        cache.process_start_of_frame();
        cache.process_start_of_frame();
        assert_eq!(cache.enforce_budget(true), 1);

        // B lands in the same slot and streams fully
        let slot_b = cache.request_slot(b);
        assert_eq!(slot_b, slot);
        let mut frames = 0;
        while !cache.is_ready(slot_b) {
            cache.indicate_usage(slot_b, 0);
            cache.process_start_of_frame();
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
            frames += 1;
            assert!(frames < 5000, "B never became ready");
        }
        let handle_b = cache.gpu_handle(slot_b).unwrap();
        assert_ne!(handle_a, handle_b);

        // A's late read completes and must be discarded
        gate_a.add_permits(1);
        cache.flush().await;

        assert!(gpu.uploads(handle_a).is_empty());
        assert!(!gpu.is_live(handle_a));
        let uploads_b = gpu.uploads(handle_b);
        assert_eq!(uploads_b.len(), 1);
        assert!(uploads_b[0].bytes.iter().all(|&byte| byte == 0xB));
        assert_eq!(cache.resource_at(slot), Some(b));
        let stats = cache.stats();
        assert_eq!(stats.loads_completed, 1);
        assert!(stats.loads_abandoned >= 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_write_state_released_when_newer_batch_finishes_first() {
        let memory = Arc::new(MemoryAssetResolver::new());
        add_texture(&memory, 5, 16, 5);
        let id = ResourceId::new(5);

        let mut gated = GatedResolver::new(Arc::clone(&memory));
        // Details 0 and 1 live in mips 4 and 3
        let gates: Vec<Arc<Semaphore>> = [4u8, 3].iter().map(|&mip| gated.gate(AssetKey::Level(id, mip))).collect();
        let (cache, gpu, _publisher) = fixture_with_resolver(StreamingConfig::default(), Arc::new(gated));

        let slot = cache.request_slot(id);
        wait_until(|| cache.in_flight() == 0).await;

        // Coarse batch 0..2 stalls on both reads
        cache.indicate_usage(slot, 1);
        cache.process_start_of_frame();
        let handle = cache.gpu_handle(slot).unwrap();

        // Fine batch 2..5 runs to completion while the coarse one is open
        cache.indicate_usage(slot, 4);
        cache.process_start_of_frame();
        wait_until(|| gpu.uploads(handle).len() == 3 && cache.in_flight() == 1).await;
        assert!(gpu.is_writable(handle));
        assert_eq!(cache.visible_levels(slot), 0);

        for gate in &gates {
            gate.add_permits(1);
        }
        cache.flush().await;

        assert_eq!(cache.visible_levels(slot), 5);
        assert_eq!(gpu.uploads(handle).len(), 5);
        assert!(!gpu.is_writable(handle));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stolen_slot_discards_pending_load() {
        let memory = Arc::new(MemoryAssetResolver::new());
        add_texture(&memory, 0xA, 8, 1);
        add_texture(&memory, 0xB, 8, 1);
        let a = ResourceId::new(0xA);
        let b = ResourceId::new(0xB);

        let mut gated = GatedResolver::new(Arc::clone(&memory));
        let gate_a = gated.gate(AssetKey::Level(a, 0));
        let config = StreamingConfig {
            entries_to_allocate_at_once: 1,
            max_entries: 1,
            ..Default::default()
        };
        let (cache, gpu, _publisher) = fixture_with_resolver(config, Arc::new(gated));

        let slot = cache.request_slot(a);
        wait_until(|| cache.in_flight() == 0).await;
        cache.indicate_usage(slot, 0);
        cache.process_start_of_frame();
        let handle_a = cache.gpu_handle(slot).unwrap();

        // A goes cold and ages past the grace period with its read pending
        for _ in 0..4 {
            cache.process_start_of_frame();
        }
        assert_eq!(cache.in_flight(), 1);

        // The table is full, so B steals A's slot
        let slot_b = cache.request_slot(b);
        assert_eq!(slot_b, slot);
        assert_eq!(cache.slot_for(a), None);

        let mut frames = 0;
        while !cache.is_ready(slot_b) {
            cache.indicate_usage(slot_b, 0);
            cache.process_start_of_frame();
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
            frames += 1;
            assert!(frames < 5000, "B never became ready");
        }
        let handle_b = cache.gpu_handle(slot_b).unwrap();
        let view_b = cache.view(slot_b);
        assert!(view_b.is_some());

        gate_a.add_permits(1);
        cache.flush().await;

        assert!(gpu.uploads(handle_a).is_empty());
        assert!(!gpu.is_live(handle_a));
        let uploads_b = gpu.uploads(handle_b);
        assert_eq!(uploads_b.len(), 1);
        assert!(uploads_b[0].bytes.iter().all(|&byte| byte == 0xB));
        assert_eq!(cache.view(slot_b), view_b);
        assert_eq!(cache.resource_at(slot), Some(b));
        assert!(cache.stats().loads_abandoned >= 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_large_levels_take_queued_path() {
        let f = fixture(StreamingConfig {
            small_upload_threshold: 64,
            ..Default::default()
        });
        // 8x8x4: mip 0 is 256 bytes, mip 1 is 64 bytes
        add_texture(&f.resolver, 4, 8, 2);
        let slot = f.cache.request_slot(ResourceId::new(4));

        run_frames_until(
            &f.cache,
            |cache| cache.indicate_usage(slot, 1),
            |cache| cache.visible_levels(slot) == 2,
        )
        .await;

        let uploads = f.gpu.uploads(f.cache.gpu_handle(slot).unwrap());
        let path_of = |mip: u8| uploads.iter().find(|u| u.mip == mip).map(|u| u.path);
        assert_eq!(path_of(0), Some(UploadPath::Queued));
        assert_eq!(path_of(1), Some(UploadPath::Immediate));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_missing_level_marks_slot_failed() {
        let f = fixture(StreamingConfig::default());
        let id = ResourceId::new(6);
        let meta = ResourceMeta::texture(8, 8, 3, 4);
        // Only the finest mip is present
        f.resolver.insert(id, &meta, vec![vec![0; 256]]).unwrap();
        let slot = f.cache.request_slot(id);

        run_frames_until(
            &f.cache,
            |cache| cache.indicate_usage(slot, 2),
            |cache| cache.is_failed(slot),
        )
        .await;

        assert!(!f.cache.is_ready(slot));
        assert!(f.cache.stats().load_failures >= 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_gpu_allocation_failure_falls_back() {
        let f = fixture(StreamingConfig::default());
        add_texture(&f.resolver, 8, 8, 2);
        f.gpu.set_fail_allocations(true);
        let slot = f.cache.request_slot(ResourceId::new(8));

        run_frames_until(
            &f.cache,
            |cache| cache.indicate_usage(slot, 1),
            |cache| cache.is_failed(slot),
        )
        .await;

        assert_eq!(f.cache.budget().used(), 0);
        assert_eq!(f.cache.gpu_handle(slot), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_higher_request_extends_existing_payload() {
        let f = fixture(StreamingConfig::default());
        add_texture(&f.resolver, 9, 16, 5);
        let slot = f.cache.request_slot(ResourceId::new(9));

        run_frames_until(
            &f.cache,
            |cache| cache.indicate_usage(slot, 1),
            |cache| cache.visible_levels(slot) == 2,
        )
        .await;
        let handle = f.cache.gpu_handle(slot).unwrap();

        run_frames_until(
            &f.cache,
            |cache| cache.indicate_usage(slot, 4),
            |cache| cache.visible_levels(slot) == 5,
        )
        .await;

        // Same image, each mip uploaded once
        assert_eq!(f.cache.gpu_handle(slot), Some(handle));
        assert_eq!(f.gpu.uploads(handle).len(), 5);
        assert_eq!(f.gpu.live_images(), 1);
    }
}
