//! Frame sweeper
//!
//! Runs once per frame. Slots nobody touched since the previous sweep go cold
//! and join the tail of the unused list, which makes them reclaimable one frame
//! later at the earliest. Slots touched again are pulled back out of the
//! unused list and reported to the caller so streaming can continue.

use std::sync::atomic::Ordering;

use super::slot_table::{SlotIndex, SlotState, SlotTable};

/// Outcome of one sweep
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Frame number after the sweep
    pub frame: u64,
    /// Slots that moved into the unused list
    pub went_cold: usize,
    /// Slots pulled back out of the unused list
    pub revived: usize,
    /// Slots reported to the still-active callback
    pub active: usize,
}

impl<T: Default> SlotTable<T> {
    /// Advance the frame counter and reclassify every occupied slot
    ///
    /// A slot counts as touched if its stamp is at or after the frame that was
    /// current when the sweep started. `on_still_active` runs for every touched
    /// slot after the list lock has been released; it must not call back into
    /// the table.
    pub fn start_frame<F>(&self, mut on_still_active: F) -> SweepReport
    where
        F: FnMut(SlotIndex, &mut T),
    {
        let sweep_start = self.frame.fetch_add(1, Ordering::AcqRel);
        let slots = self.slots.read();

        let mut active = Vec::new();
        let mut revived = 0;
        let went_cold = {
            let mut lists = self.lists.lock();
            let mut cold: Vec<(u64, u32)> = Vec::new();

            for (i, slot) in slots.iter().enumerate() {
                let index = i as u32;
                let stamp = slot.last_touched.load(Ordering::Acquire);
                let touched = stamp >= sweep_start;

                match (lists.state(index), touched) {
                    (SlotState::Free, _) | (SlotState::Unused, false) => {}
                    (SlotState::Unused, true) => {
                        lists.unlink_unused(index);
                        revived += 1;
                        active.push(index);
                    }
                    (SlotState::InUse, true) => active.push(index),
                    (SlotState::InUse, false) => cold.push((stamp, index)),
                }
            }

            // Oldest stamp first so the unused list stays age-ordered
            cold.sort_unstable();
            for &(_, index) in &cold {
                lists.push_unused_tail(index);
            }
            cold.len()
        };

        for &index in &active {
            let mut payload = slots[index as usize].payload.lock();
            on_still_active(SlotIndex::new(index), &mut *payload);
        }

        if went_cold > 0 || revived > 0 {
            log::trace!(
                "Frame {}: {} slots went cold, {} revived, {} active",
                sweep_start + 1, went_cold, revived, active.len()
            );
        }

        SweepReport {
            frame: sweep_start + 1,
            went_cold,
            revived,
            active: active.len(),
        }
    }
}
