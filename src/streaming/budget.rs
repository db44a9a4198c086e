//! GPU memory budget tracking for streaming
//!
//! Tracks GPU memory attributed to the streaming cache and provides pressure
//! metrics to guide eviction. All counters are atomic so the budget enforcer
//! can read them without touching the slot table locks.

use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide GPU memory budget
pub struct GpuMemoryBudget {
    /// Maximum GPU memory allowed (bytes)
    budget_bytes: AtomicU64,
    /// Currently used GPU memory (bytes)
    used_bytes: AtomicU64,
}

impl GpuMemoryBudget {
    /// Create a new memory budget
    ///
    /// # Arguments
    /// * `budget_bytes` - Maximum GPU memory in bytes
    pub fn new(budget_bytes: u64) -> Self {
        Self {
            budget_bytes: AtomicU64::new(budget_bytes),
            used_bytes: AtomicU64::new(0),
        }
    }

    /// Change the budget ceiling (used by config hot-reload)
    pub fn set_budget(&self, budget_bytes: u64) {
        self.budget_bytes.store(budget_bytes, Ordering::Release);
    }

    // --- Tracking methods ---

    /// Add GPU memory usage
    pub fn add(&self, bytes: u64) {
        let _ = self.used_bytes.fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
            Some(used.saturating_add(bytes))
        });
    }

    /// Remove GPU memory usage
    pub fn remove(&self, bytes: u64) {
        let _ = self.used_bytes.fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
            Some(used.saturating_sub(bytes))
        });
    }

    // --- Query methods ---

    /// Get current GPU memory usage in bytes
    pub fn used(&self) -> u64 {
        self.used_bytes.load(Ordering::Acquire)
    }

    /// Get the configured ceiling in bytes
    pub fn budget(&self) -> u64 {
        self.budget_bytes.load(Ordering::Acquire)
    }

    /// Get available GPU memory in bytes
    pub fn available(&self) -> u64 {
        self.budget().saturating_sub(self.used())
    }

    /// Get GPU memory pressure (0.0 to 1.0+)
    ///
    /// Values above 0.9 indicate high pressure.
    /// Values above 1.0 indicate over-budget.
    pub fn pressure(&self) -> f32 {
        let budget = self.budget();
        if budget == 0 {
            return 0.0;
        }
        self.used() as f32 / budget as f32
    }

    // --- Decision methods ---

    /// Usage strictly above the ceiling
    pub fn is_over_budget(&self) -> bool {
        self.used() > self.budget()
    }

    /// Returns true if pressure exceeds 0.9 (90% usage)
    pub fn should_evict(&self) -> bool {
        self.pressure() > 0.9
    }

    /// Check if an allocation of `bytes` fits without going over budget
    pub fn can_load(&self, bytes: u64) -> bool {
        self.available() >= bytes
    }
}

impl Default for GpuMemoryBudget {
    fn default() -> Self {
        Self::new(512 * 1024 * 1024)
    }
}
