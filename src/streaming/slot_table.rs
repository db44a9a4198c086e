//! Slot table - growable arena of streaming slots
//!
//! Slots are addressed by [`SlotIndex`] and never move identity when the
//! table grows. Two intrusive lists are threaded through the table as `u32`
//! links: a free list of slots ready for immediate reuse, and an age-ordered
//! unused list of slots that still hold a resource nobody touched recently.
//!
//! Locking follows a fixed order:
//! 1. `slots` (shared for slot access, exclusive only to grow or clear)
//! 2. `lists` (list heads, tails, per-slot links and states)
//! 3. the per-slot payload mutex
//!
//! Closures handed to [`SlotTable::with_slot`] run under (1) and (3) and must
//! not call back into the table.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};

/// Link value marking the end of a list
pub(super) const NIL: u32 = u32::MAX;

/// Index of a slot in the table
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotIndex(u32);

impl SlotIndex {
    /// Sentinel handed out when no slot could be allocated
    pub const INVALID: SlotIndex = SlotIndex(u32::MAX);

    pub fn new(index: u32) -> Self {
        Self(index)
    }

    /// Raw index value
    pub fn get(self) -> u32 {
        self.0
    }

    pub fn is_valid(self) -> bool {
        self.0 != u32::MAX
    }

    pub(crate) fn as_usize(self) -> usize {
        self.0 as usize
    }
}

/// Lifecycle state of a slot
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotState {
    /// On the free list, payload reset
    Free,
    /// On the unused list, payload still materialized
    Unused,
    /// Owned by a live resource, on no list
    InUse,
}

#[derive(Clone, Copy, Debug)]
pub(super) struct Link {
    prev: u32,
    next: u32,
    state: SlotState,
}

impl Link {
    const IN_USE: Link = Link { prev: NIL, next: NIL, state: SlotState::InUse };
}

/// List heads and links, guarded by the list mutex
pub(super) struct SlotLists {
    links: Vec<Link>,
    free_head: u32,
    unused_head: u32,
    unused_tail: u32,
    free_count: usize,
    unused_count: usize,
}

impl SlotLists {
    fn new() -> Self {
        Self {
            links: Vec::new(),
            free_head: NIL,
            unused_head: NIL,
            unused_tail: NIL,
            free_count: 0,
            unused_count: 0,
        }
    }

    pub(super) fn state(&self, index: u32) -> SlotState {
        self.links[index as usize].state
    }

    /// Append a link for a freshly created slot (starts `InUse`)
    pub(super) fn push_slot(&mut self) -> u32 {
        let index = self.links.len() as u32;
        self.links.push(Link::IN_USE);
        index
    }

    pub(super) fn push_free(&mut self, index: u32) {
        debug_assert_eq!(self.state(index), SlotState::InUse);
        self.links[index as usize] = Link {
            prev: NIL,
            next: self.free_head,
            state: SlotState::Free,
        };
        self.free_head = index;
        self.free_count += 1;
    }

    pub(super) fn pop_free(&mut self) -> Option<u32> {
        if self.free_head == NIL {
            return None;
        }
        let index = self.free_head;
        self.free_head = self.links[index as usize].next;
        self.links[index as usize] = Link::IN_USE;
        self.free_count -= 1;
        Some(index)
    }

    pub(super) fn push_unused_tail(&mut self, index: u32) {
        debug_assert_eq!(self.state(index), SlotState::InUse);
        self.links[index as usize] = Link {
            prev: self.unused_tail,
            next: NIL,
            state: SlotState::Unused,
        };
        if self.unused_tail != NIL {
            self.links[self.unused_tail as usize].next = index;
        } else {
            self.unused_head = index;
        }
        self.unused_tail = index;
        self.unused_count += 1;
    }

    /// Remove a slot from the unused list, leaving it `InUse`
    pub(super) fn unlink_unused(&mut self, index: u32) {
        let Link { prev, next, state } = self.links[index as usize];
        debug_assert_eq!(state, SlotState::Unused);

        if prev != NIL {
            self.links[prev as usize].next = next;
        } else {
            self.unused_head = next;
        }
        if next != NIL {
            self.links[next as usize].prev = prev;
        } else {
            self.unused_tail = prev;
        }

        self.links[index as usize] = Link::IN_USE;
        self.unused_count -= 1;
    }

    pub(super) fn unused_head(&self) -> Option<u32> {
        (self.unused_head != NIL).then_some(self.unused_head)
    }

    fn unused_in_order(&self) -> Vec<u32> {
        let mut order = Vec::with_capacity(self.unused_count);
        let mut cursor = self.unused_head;
        while cursor != NIL {
            order.push(cursor);
            cursor = self.links[cursor as usize].next;
        }
        order
    }

    fn reset(&mut self) {
        *self = Self::new();
    }
}

/// Storage for one slot
pub(super) struct Slot<T> {
    /// Frame number of the last touch (allocation or usage)
    pub(super) last_touched: AtomicU64,
    pub(super) payload: Mutex<T>,
}

impl<T: Default> Slot<T> {
    pub(super) fn new(frame: u64) -> Self {
        Self {
            last_touched: AtomicU64::new(frame),
            payload: Mutex::new(T::default()),
        }
    }
}

/// Slot counts by state
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SlotTableStats {
    /// Total slots in the table
    pub len: usize,
    pub free: usize,
    pub unused: usize,
    pub in_use: usize,
}

/// Growable table of slots with free and unused lists
pub struct SlotTable<T> {
    pub(super) slots: RwLock<Vec<Slot<T>>>,
    pub(super) lists: Mutex<SlotLists>,
    /// Monotonic frame counter, advanced by the sweeper
    pub(super) frame: AtomicU64,
}

impl<T: Default> SlotTable<T> {
    /// Create an empty table at frame 0
    pub fn new() -> Self {
        Self {
            slots: RwLock::new(Vec::new()),
            lists: Mutex::new(SlotLists::new()),
            frame: AtomicU64::new(0),
        }
    }

    /// Current frame number
    pub fn current_frame(&self) -> u64 {
        self.frame.load(Ordering::Acquire)
    }

    /// Number of slots the table has grown to
    pub fn len(&self) -> usize {
        self.slots.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stamp a slot as used during the current frame
    ///
    /// Returns false if the index is out of range.
    pub fn touch(&self, index: SlotIndex) -> bool {
        let frame = self.current_frame();
        let slots = self.slots.read();
        match slots.get(index.as_usize()) {
            Some(slot) => {
                slot.last_touched.store(frame, Ordering::Release);
                true
            }
            None => false,
        }
    }

    /// Frame of the last touch of a slot
    pub fn last_touched(&self, index: SlotIndex) -> Option<u64> {
        let slots = self.slots.read();
        slots
            .get(index.as_usize())
            .map(|slot| slot.last_touched.load(Ordering::Acquire))
    }

    /// Current state of a slot
    pub fn state(&self, index: SlotIndex) -> Option<SlotState> {
        let slots = self.slots.read();
        if index.as_usize() >= slots.len() {
            return None;
        }
        Some(self.lists.lock().state(index.get()))
    }

    /// Run `f` on the payload of a slot
    ///
    /// Returns `None` if the index is out of range (e.g. after [`clear`](Self::clear)).
    pub fn with_slot<R>(&self, index: SlotIndex, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let slots = self.slots.read();
        let slot = slots.get(index.as_usize())?;
        let mut payload = slot.payload.lock();
        Some(f(&mut *payload))
    }

    /// Map every slot payload, in index order
    pub fn map_slots<R>(&self, mut f: impl FnMut(SlotIndex, SlotState, &T) -> R) -> Vec<R> {
        let slots = self.slots.read();
        let states: Vec<SlotState> = {
            let lists = self.lists.lock();
            (0..slots.len() as u32).map(|i| lists.state(i)).collect()
        };
        slots
            .iter()
            .zip(states)
            .enumerate()
            .map(|(i, (slot, state))| f(SlotIndex::new(i as u32), state, &*slot.payload.lock()))
            .collect()
    }

    /// Return a slot to the free list, handing back its previous payload
    ///
    /// Returns `None` if the slot is already free or out of range.
    pub fn release(&self, index: SlotIndex) -> Option<T> {
        self.release_if(index, |state, _| state != SlotState::Free)
    }

    /// Release a slot only if it is on the unused list and `pred` accepts its payload
    pub fn release_unused_if(&self, index: SlotIndex, pred: impl FnOnce(&T) -> bool) -> Option<T> {
        self.release_if(index, |state, payload| state == SlotState::Unused && pred(payload))
    }

    fn release_if(&self, index: SlotIndex, pred: impl FnOnce(SlotState, &T) -> bool) -> Option<T> {
        let slots = self.slots.read();
        let slot = slots.get(index.as_usize())?;
        let mut lists = self.lists.lock();
        let mut payload = slot.payload.lock();

        let state = lists.state(index.get());
        if !pred(state, &*payload) {
            return None;
        }

        match state {
            SlotState::Free => return None,
            SlotState::Unused => lists.unlink_unused(index.get()),
            SlotState::InUse => {}
        }
        lists.push_free(index.get());

        Some(std::mem::take(&mut *payload))
    }

    /// Unused slots, oldest first
    pub fn unused_snapshot(&self) -> Vec<SlotIndex> {
        self.lists
            .lock()
            .unused_in_order()
            .into_iter()
            .map(SlotIndex::new)
            .collect()
    }

    /// Drop every slot, returning the payloads that were still held
    ///
    /// All previously issued indices become invalid. The frame counter keeps running.
    pub fn clear(&self) -> Vec<T> {
        let mut slots = self.slots.write();
        let mut lists = self.lists.lock();
        lists.reset();
        slots.drain(..).map(|slot| slot.payload.into_inner()).collect()
    }

    /// Slot counts by state
    pub fn stats(&self) -> SlotTableStats {
        let len = self.slots.read().len();
        let lists = self.lists.lock();
        SlotTableStats {
            len,
            free: lists.free_count,
            unused: lists.unused_count,
            in_use: len - lists.free_count - lists.unused_count,
        }
    }
}

impl<T: Default> Default for SlotTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::allocator::AllocParams;

    fn lists_with(n: usize) -> SlotLists {
        let mut lists = SlotLists::new();
        for _ in 0..n {
            lists.push_slot();
        }
        lists
    }

    #[test]
    fn test_slot_index_sentinel() {
        assert!(!SlotIndex::INVALID.is_valid());
        assert!(SlotIndex::new(0).is_valid());
        assert_eq!(SlotIndex::new(7).get(), 7);
    }

    #[test]
    fn test_free_list_is_lifo() {
        let mut lists = lists_with(3);
        lists.push_free(0);
        lists.push_free(2);

        assert_eq!(lists.free_count, 2);
        assert_eq!(lists.pop_free(), Some(2));
        assert_eq!(lists.pop_free(), Some(0));
        assert_eq!(lists.pop_free(), None);
        assert_eq!(lists.state(0), SlotState::InUse);
    }

    #[test]
    fn test_unused_list_unlink_middle() {
        let mut lists = lists_with(3);
        lists.push_unused_tail(0);
        lists.push_unused_tail(1);
        lists.push_unused_tail(2);

        lists.unlink_unused(1);
        assert_eq!(lists.unused_in_order(), vec![0, 2]);
        assert_eq!(lists.state(1), SlotState::InUse);
        assert_eq!(lists.unused_count, 2);
    }

    #[test]
    fn test_unused_list_unlink_boundaries() {
        let mut lists = lists_with(3);
        lists.push_unused_tail(0);
        lists.push_unused_tail(1);
        lists.push_unused_tail(2);

        lists.unlink_unused(0);
        assert_eq!(lists.unused_head(), Some(1));
        lists.unlink_unused(2);
        assert_eq!(lists.unused_in_order(), vec![1]);
        assert_eq!(lists.unused_tail, 1);

        lists.unlink_unused(1);
        assert_eq!(lists.unused_head(), None);
        assert_eq!(lists.unused_tail, NIL);

        // Reinsert after emptying
        lists.push_unused_tail(2);
        assert_eq!(lists.unused_in_order(), vec![2]);
    }

    #[test]
    fn test_release_moves_to_free_list() {
        let table: SlotTable<u32> = SlotTable::new();
        let params = AllocParams {
            max_size: 4,
            growth_step: 1,
            ..Default::default()
        };
        let acquired = table.find_or_create_slot(&params).unwrap();
        table.with_slot(acquired.index, |v| *v = 42);

        assert_eq!(table.release(acquired.index), Some(42));
        assert_eq!(table.state(acquired.index), Some(SlotState::Free));
        // Payload was reset in place
        assert_eq!(table.with_slot(acquired.index, |v| *v), Some(0));
        // Second release is a no-op
        assert_eq!(table.release(acquired.index), None);
    }

    #[test]
    fn test_release_unused_if_requires_unused() {
        let table: SlotTable<u32> = SlotTable::new();
        let params = AllocParams::default();
        let slot = table.find_or_create_slot(&params).unwrap().index;
        table.with_slot(slot, |v| *v = 9);

        // In use: refused
        assert_eq!(table.release_unused_if(slot, |_| true), None);

        // Go cold
        table.start_frame(|_, _| {});
        table.start_frame(|_, _| {});
        assert_eq!(table.state(slot), Some(SlotState::Unused));

        assert_eq!(table.release_unused_if(slot, |v| *v == 1), None);
        assert_eq!(table.release_unused_if(slot, |v| *v == 9), Some(9));
        assert_eq!(table.stats().unused, 0);
    }

    #[test]
    fn test_clear_invalidates_indices() {
        let table: SlotTable<u32> = SlotTable::new();
        let params = AllocParams::default();
        let slot = table.find_or_create_slot(&params).unwrap().index;
        table.with_slot(slot, |v| *v = 5);

        let drained = table.clear();
        assert!(drained.contains(&5));
        assert!(table.is_empty());
        assert_eq!(table.with_slot(slot, |v| *v), None);
        assert_eq!(table.state(slot), None);
        assert_eq!(table.stats(), SlotTableStats::default());
    }

    #[test]
    fn test_touch_out_of_range() {
        let table: SlotTable<u32> = SlotTable::new();
        assert!(!table.touch(SlotIndex::new(3)));
        assert!(!table.touch(SlotIndex::INVALID));
        assert_eq!(table.last_touched(SlotIndex::new(3)), None);
    }
}
