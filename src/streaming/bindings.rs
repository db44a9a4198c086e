//! Indirection table and descriptor bindings
//!
//! Shaders reference a streamed resource by its logical index (slot + 1).
//! The indirection table maps a logical index to the physical binding to
//! sample, with 0 reserved for the fallback binding.

use parking_lot::Mutex;

use super::gpu::{SamplerHandle, ViewHandle};
use super::slot_table::SlotIndex;

/// A (view, sampler) pair the render pass binds
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Binding {
    pub view: ViewHandle,
    pub sampler: SamplerHandle,
}

/// Everything the render pass needs for one frame
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FrameBindings {
    /// Frame the bindings were built for
    pub frame: u64,
    /// Logical index -> binding index; 0 means fallback
    pub indirection: Vec<u32>,
    /// Entry 0 is the fallback, entry `i + 1` belongs to slot `i`
    pub bindings: Vec<Binding>,
}

impl FrameBindings {
    /// Build the tables from the ready view of each slot, in slot order
    pub fn build(frame: u64, fallback: Binding, slot_views: &[Option<ViewHandle>]) -> Self {
        let mut indirection = Vec::with_capacity(slot_views.len() + 1);
        let mut bindings = Vec::with_capacity(slot_views.len() + 1);
        indirection.push(0);
        bindings.push(fallback);

        for (i, view) in slot_views.iter().enumerate() {
            let logical = logical_to_physical_index(SlotIndex::new(i as u32));
            match view {
                Some(view) => {
                    indirection.push(logical);
                    bindings.push(Binding { view: *view, sampler: fallback.sampler });
                }
                None => {
                    indirection.push(0);
                    bindings.push(fallback);
                }
            }
        }

        Self { frame, indirection, bindings }
    }

    /// Number of slots that resolve to their own view
    pub fn ready_count(&self) -> usize {
        self.indirection.iter().filter(|&&physical| physical != 0).count()
    }
}

/// Logical index of a slot as seen by shaders; 0 for the invalid sentinel
pub fn logical_to_physical_index(slot: SlotIndex) -> u32 {
    if slot.is_valid() {
        slot.get() + 1
    } else {
        0
    }
}

/// Consumer of rebuilt bindings, called at most once per frame
pub trait BindingPublisher: Send + Sync {
    fn publish(&self, bindings: &FrameBindings);
}

/// Publisher that keeps the last published bindings
#[derive(Default)]
pub struct RecordingPublisher {
    last: Mutex<Option<FrameBindings>>,
    count: Mutex<usize>,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last(&self) -> Option<FrameBindings> {
        self.last.lock().clone()
    }

    /// Number of publishes so far
    pub fn count(&self) -> usize {
        *self.count.lock()
    }
}

impl BindingPublisher for RecordingPublisher {
    fn publish(&self, bindings: &FrameBindings) {
        *self.last.lock() = Some(bindings.clone());
        *self.count.lock() += 1;
    }
}
