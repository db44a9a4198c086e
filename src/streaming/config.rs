//! Streaming cache configuration
//!
//! Persisted as JSON and hot-reloadable at runtime through
//! [`StreamingCache::reload_config`](super::StreamingCache::reload_config).

use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::core::{Error, Result};
use super::allocator::{AllocParams, DEFAULT_CAPACITY_GRACE_FRAMES};

/// Configuration for the streaming cache
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    /// Slots added each time the slot table grows
    pub entries_to_allocate_at_once: u32,
    /// Maximum number of slots
    pub max_entries: u32,
    /// Frames after which an unused slot is reclaimed unconditionally
    pub evict_no_question_asked_frame_count: u64,
    /// Frames after which an unused slot is reclaimed when the table is full
    pub capacity_grace_frames: u64,
    /// GPU memory ceiling for streamed resources (bytes)
    pub max_pool_memory_bytes: u64,
    /// Level payloads up to this size take the immediate upload path
    pub small_upload_threshold: usize,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            entries_to_allocate_at_once: 64,
            max_entries: 4096,
            evict_no_question_asked_frame_count: 100,
            capacity_grace_frames: DEFAULT_CAPACITY_GRACE_FRAMES,
            max_pool_memory_bytes: 512 * 1024 * 1024, // 512 MB
            small_upload_threshold: 64 * 1024,       // 64 KB
        }
    }
}

impl StreamingConfig {
    /// Create a new config with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocation parameters derived from this config
    pub fn alloc_params(&self) -> AllocParams {
        AllocParams {
            max_size: self.max_entries,
            growth_step: self.entries_to_allocate_at_once,
            evict_age_threshold: self.evict_no_question_asked_frame_count,
            capacity_grace_frames: self.capacity_grace_frames,
        }
    }

    /// Reject values the allocator cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.entries_to_allocate_at_once == 0 {
            return Err(Error::Config("entries_to_allocate_at_once must be at least 1".into()));
        }
        if self.max_entries == 0 || self.max_entries == u32::MAX {
            return Err(Error::Config(format!(
                "max_entries must be between 1 and {}", u32::MAX - 1
            )));
        }
        Ok(())
    }

    /// Save to file (sync)
    pub fn save_sync(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| Error::Config(e.to_string()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load from file (sync), filling missing fields with defaults
    pub fn load_sync(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&json)
            .map_err(|e| Error::Io(io::Error::new(io::ErrorKind::InvalidData, e.to_string())))?;
        config.validate()?;
        Ok(config)
    }
}
