//! Memory budget enforcer
//!
//! Walks the unused list oldest first and releases slots until GPU usage is
//! back under the budget. Resources in use are never evicted, so usage can
//! stay above the budget while everything is hot.

use std::sync::atomic::Ordering;

use super::cache::CacheInner;

impl CacheInner {
    /// Release unused slots until usage fits the budget
    ///
    /// Non-aggressive mode only considers entries holding a live GPU payload
    /// and stops as soon as usage is within budget. Aggressive mode releases
    /// every unused slot. Returns the number of slots released.
    pub(super) fn enforce_budget(&self, aggressive: bool) -> usize {
        if !aggressive && !self.budget.is_over_budget() {
            return 0;
        }

        let mut ids = self.ids.lock();
        let used_before = self.budget.used();
        let mut released = 0;

        for slot in self.table.unused_snapshot() {
            if !aggressive && !self.budget.is_over_budget() {
                break;
            }

            let entry = self.table.release_unused_if(slot, |entry| {
                aggressive || entry.gpu.as_ref().is_some_and(|gpu| !gpu.is_evicted())
            });
            let Some(entry) = entry else {
                continue;
            };

            if let Some(id) = entry.resource_id {
                if ids.get(&id) == Some(&slot) {
                    ids.remove(&id);
                }
            }
            // Dropping the entry poisons the payload and returns its bytes
            drop(entry);
            released += 1;
        }
        drop(ids);

        if released > 0 {
            self.counters.evictions.fetch_add(released as u64, Ordering::Relaxed);
            self.changed.store(true, Ordering::Release);
            log::debug!(
                "Evicted {} unused resources ({} -> {} bytes, budget {})",
                released,
                used_before,
                self.budget.used(),
                self.budget.budget()
            );
        }

        released
    }
}

#[cfg(test)]
mod tests {
    use crate::core::ResourceId;
    use crate::streaming::cache::testing::*;
    use crate::streaming::config::StreamingConfig;
    use crate::streaming::slot_table::SlotIndex;

    /// Stream `ids` to full detail, one texture of `size`² texels each
    async fn stream_all(f: &Fixture, ids: &[u64], size: u32) -> Vec<SlotIndex> {
        for &id in ids {
            add_texture(&f.resolver, id, size, 1);
        }
        let slots: Vec<SlotIndex> = ids.iter().map(|&id| f.cache.request_slot(ResourceId::new(id))).collect();
        run_frames_until(
            &f.cache,
            |cache| {
                for &slot in &slots {
                    cache.indicate_usage(slot, 0);
                }
            },
            |cache| slots.iter().all(|&slot| cache.is_ready(slot)),
        )
        .await;
        slots
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_under_budget_is_noop() {
        let f = fixture(StreamingConfig::default());
        let slots = stream_all(&f, &[1, 2], 8).await;
        f.cache.process_start_of_frame();
        f.cache.process_start_of_frame();

        assert_eq!(f.cache.enforce_budget(false), 0);
        assert!(slots.iter().all(|&slot| f.cache.is_ready(slot)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_eviction_order_is_oldest_first() {
        let f = fixture(StreamingConfig::default());
        // 8x8x4 = 256 bytes each
        let slots = stream_all(&f, &[0xA, 0xB, 0xC], 8).await;
        let [a, b, c] = [slots[0], slots[1], slots[2]];

        // A goes cold first, then B, then C
        f.cache.indicate_usage(b, 0);
        f.cache.indicate_usage(c, 0);
        f.cache.process_start_of_frame();
        f.cache.indicate_usage(c, 0);
        f.cache.process_start_of_frame();
        f.cache.process_start_of_frame();
        f.cache.process_start_of_frame();
        assert_eq!(f.cache.stats().slots.unused, 3);

        // Room for one resource: A and B must go, C stays
        f.cache
            .set_config(StreamingConfig {
                max_pool_memory_bytes: 256,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(f.cache.enforce_budget(false), 2);

        assert_eq!(f.cache.slot_for(ResourceId::new(0xA)), None);
        assert_eq!(f.cache.slot_for(ResourceId::new(0xB)), None);
        assert_eq!(f.cache.slot_for(ResourceId::new(0xC)), Some(c));
        assert!(!f.cache.is_ready(a));
        assert!(!f.cache.is_ready(b));
        assert!(f.cache.is_ready(c));
        assert_eq!(f.cache.budget().used(), 256);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_budget_converges_with_enough_unused() {
        let f = fixture(StreamingConfig::default());
        let ids: Vec<u64> = (1..=6).collect();
        stream_all(&f, &ids, 8).await;

        f.cache.process_start_of_frame();
        f.cache.process_start_of_frame();
        f.cache.process_start_of_frame();

        let budget = 600;
        f.cache
            .set_config(StreamingConfig {
                max_pool_memory_bytes: budget,
                ..Default::default()
            })
            .unwrap();
        f.cache.enforce_budget(false);
        assert!(f.cache.budget().used() <= budget);
        // Stops as soon as usage fits: 2 x 256 bytes remain
        assert_eq!(f.cache.budget().used(), 512);
        assert_eq!(f.cache.stats().resources, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_in_use_resources_are_never_evicted() {
        let f = fixture(StreamingConfig::default());
        let slots = stream_all(&f, &[1, 2], 8).await;

        f.cache
            .set_config(StreamingConfig {
                max_pool_memory_bytes: 1,
                ..Default::default()
            })
            .unwrap();
        for &slot in &slots {
            f.cache.indicate_usage(slot, 0);
        }
        f.cache.process_start_of_frame();

        assert_eq!(f.cache.enforce_budget(false), 0);
        assert_eq!(f.cache.enforce_budget(true), 0);
        assert!(slots.iter().all(|&slot| f.cache.is_ready(slot)));
        assert!(f.cache.budget().is_over_budget());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_aggressive_empties_unused_list() {
        let f = fixture(StreamingConfig::default());
        stream_all(&f, &[1, 2, 3], 8).await;
        // A resource with no payload yet (never used after its request)
        let idle = f.cache.request_slot(ResourceId::new(99));
        f.cache.flush().await;

        for _ in 0..3 {
            f.cache.process_start_of_frame();
        }
        assert_eq!(f.cache.stats().slots.unused, 4);

        assert_eq!(f.cache.enforce_budget(true), 4);
        let stats = f.cache.stats();
        assert_eq!(stats.slots.unused, 0);
        assert_eq!(stats.slots.free, stats.slots.len);
        assert_eq!(stats.resources, 0);
        assert_eq!(stats.gpu_bytes_used, 0);
        assert_eq!(f.cache.resource_at(idle), None);

        f.cache.flush().await;
        assert_eq!(f.gpu.live_images(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_new_allocation_triggers_enforcement() {
        let f = fixture(StreamingConfig {
            max_pool_memory_bytes: 256,
            ..Default::default()
        });
        stream_all(&f, &[1], 8).await;
        f.cache.process_start_of_frame();
        f.cache.process_start_of_frame();

        // Over budget only after the second allocation
        stream_all(&f, &[2], 8).await;
        assert_eq!(f.cache.budget().used(), 512);
        assert!(f.cache.slot_for(ResourceId::new(1)).is_some());

        // The third allocation makes room first, oldest unused resource out
        let third = stream_all(&f, &[3], 8).await[0];
        assert!(f.cache.is_ready(third));
        assert_eq!(f.cache.slot_for(ResourceId::new(1)), None);
        assert!(f.cache.slot_for(ResourceId::new(2)).is_some());
        assert_eq!(f.cache.budget().used(), 512);
        assert_eq!(f.cache.stats().evictions, 1);
    }
}
