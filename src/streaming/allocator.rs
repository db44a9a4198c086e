//! Slot allocator
//!
//! Hands out slot indices in a fixed order of preference: a free slot, then a
//! cold slot stolen from the head of the unused list, then fresh slots from
//! growing the table. Never blocks on anything but the table locks.

use std::sync::atomic::Ordering;

use parking_lot::RwLockUpgradableReadGuard;

use super::slot_table::{Slot, SlotIndex, SlotTable};

/// Frames a cold slot must age before it can be stolen from a full table
pub const DEFAULT_CAPACITY_GRACE_FRAMES: u64 = 2;

/// Parameters for a single allocation
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AllocParams {
    /// Maximum number of slots the table may grow to
    pub max_size: u32,
    /// Slots added per growth step
    pub growth_step: u32,
    /// Age (in frames) past which an unused slot is reclaimed unconditionally
    pub evict_age_threshold: u64,
    /// Age past which an unused slot is reclaimed once the table is full
    pub capacity_grace_frames: u64,
}

impl Default for AllocParams {
    fn default() -> Self {
        Self {
            max_size: 4096,
            growth_step: 64,
            evict_age_threshold: 100,
            capacity_grace_frames: DEFAULT_CAPACITY_GRACE_FRAMES,
        }
    }
}

/// Where an acquired slot came from
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AcquireSource {
    FreeList,
    /// Reclaimed from the unused list; the old tenant is in `previous`
    Stolen,
    Grown,
}

/// A freshly acquired slot
#[derive(Debug)]
pub struct Acquired<T> {
    pub index: SlotIndex,
    /// Payload of the stolen tenant, so the owner can cancel it
    pub previous: Option<T>,
    pub source: AcquireSource,
}

impl<T: Default> SlotTable<T> {
    /// Acquire a slot, or `None` when the table is starved
    ///
    /// The acquired slot is `InUse`, stamped with the current frame, and holds
    /// a default payload.
    ///
    /// # Arguments
    /// * `params` - Size limits and reclaim ages
    ///
    /// # Returns
    /// The slot and, if it was stolen, the previous tenant's payload
    pub fn find_or_create_slot(&self, params: &AllocParams) -> Option<Acquired<T>> {
        let frame = self.current_frame();
        let max_size = params.max_size as usize;

        {
            let slots = self.slots.read();
            if let Some(acquired) = self.reuse_slot(&slots, params, frame) {
                return Some(acquired);
            }
            if slots.len() >= max_size {
                return None;
            }
        }

        let slots = self.slots.upgradable_read();
        // Another allocator may have grown the table while we waited
        if let Some(acquired) = self.reuse_slot(&slots, params, frame) {
            return Some(acquired);
        }
        if slots.len() >= max_size {
            return None;
        }

        let mut slots = RwLockUpgradableReadGuard::upgrade(slots);
        Some(self.grow(&mut slots, params, frame))
    }

    /// Pop the free list, or steal the oldest unused slot if it is old enough
    fn reuse_slot(&self, slots: &[Slot<T>], params: &AllocParams, frame: u64) -> Option<Acquired<T>> {
        let mut lists = self.lists.lock();

        if let Some(index) = lists.pop_free() {
            slots[index as usize].last_touched.store(frame, Ordering::Release);
            return Some(Acquired {
                index: SlotIndex::new(index),
                previous: None,
                source: AcquireSource::FreeList,
            });
        }

        let head = lists.unused_head()?;
        let slot = &slots[head as usize];
        let age = frame.saturating_sub(slot.last_touched.load(Ordering::Acquire));
        let at_capacity = slots.len() >= params.max_size as usize;

        if age > params.evict_age_threshold || (at_capacity && age > params.capacity_grace_frames) {
            lists.unlink_unused(head);
            slot.last_touched.store(frame, Ordering::Release);
            let previous = std::mem::take(&mut *slot.payload.lock());
            log::trace!("Stole slot {} (idle for {} frames)", head, age);
            return Some(Acquired {
                index: SlotIndex::new(head),
                previous: Some(previous),
                source: AcquireSource::Stolen,
            });
        }

        None
    }

    /// Grow by one step; the first new slot is returned, the rest go on the free list
    fn grow(&self, slots: &mut Vec<Slot<T>>, params: &AllocParams, frame: u64) -> Acquired<T> {
        let old_len = slots.len();
        let new_len = (old_len + params.growth_step.max(1) as usize).min(params.max_size as usize);

        let mut lists = self.lists.lock();
        for _ in old_len..new_len {
            slots.push(Slot::new(frame));
            lists.push_slot();
        }
        // Reverse so the lowest index is handed out first
        for index in (old_len + 1..new_len).rev() {
            lists.push_free(index as u32);
        }

        log::debug!("Slot table grew from {} to {} slots", old_len, new_len);

        Acquired {
            index: SlotIndex::new(old_len as u32),
            previous: None,
            source: AcquireSource::Grown,
        }
    }
}
