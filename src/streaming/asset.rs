//! Asset resolver: where streamed bytes come from
//!
//! The cache only knows the [`AssetResolver`] trait. Two implementations ship
//! with the crate: [`FileAssetResolver`] reads an on-disk resource directory
//! (JSON metadata plus one LZ4 blob per mip), and [`MemoryAssetResolver`]
//! serves resources registered in memory.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::core::{BoxFuture, Error, ResourceId, Result};
use super::gpu::ImageDesc;

/// Current version of the metadata format
pub const META_VERSION: u32 = 1;

/// Most detail levels a resource may have (one bit each in the loaded mask)
pub const MAX_DETAIL_LEVELS: u8 = 32;

const META_FILENAME: &str = "meta.json";

/// What kind of GPU object a resource streams into
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// 2D image with a mip chain
    Texture,
    /// Vertex/index buffer with progressively finer levels
    Mesh,
}

/// Resource metadata, fetched before any level data
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceMeta {
    /// Format version for compatibility
    pub version: u32,
    pub kind: ResourceKind,
    /// Width of the finest level (texels, or elements for meshes)
    pub width: u32,
    /// Height of the finest level (1 for meshes)
    pub height: u32,
    /// Number of detail levels
    pub level_count: u8,
    /// Bytes per texel / element
    pub bytes_per_texel: u32,
}

impl ResourceMeta {
    /// Metadata for a mipmapped texture
    pub fn texture(width: u32, height: u32, level_count: u8, bytes_per_texel: u32) -> Self {
        Self {
            version: META_VERSION,
            kind: ResourceKind::Texture,
            width,
            height,
            level_count,
            bytes_per_texel,
        }
    }

    /// Metadata for a mesh whose finest level has `elements` elements
    pub fn mesh(elements: u32, level_count: u8, bytes_per_element: u32) -> Self {
        Self {
            version: META_VERSION,
            kind: ResourceKind::Mesh,
            width: elements,
            height: 1,
            level_count,
            bytes_per_texel: bytes_per_element,
        }
    }

    /// Parse and validate metadata bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let meta: Self = serde_json::from_slice(bytes)
            .map_err(|e| Error::Asset(format!("invalid metadata: {}", e)))?;
        meta.validate()?;
        Ok(meta)
    }

    /// Serialize to bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec_pretty(self).map_err(|e| Error::Asset(e.to_string()))
    }

    /// Reject metadata the cache cannot stream
    pub fn validate(&self) -> Result<()> {
        if self.version != META_VERSION {
            return Err(Error::Asset(format!("unsupported metadata version {}", self.version)));
        }
        if self.level_count == 0 {
            return Err(Error::Asset("resource has no detail levels".into()));
        }
        if self.level_count > MAX_DETAIL_LEVELS {
            return Err(Error::Asset(format!(
                "resource has {} detail levels (max {})", self.level_count, MAX_DETAIL_LEVELS
            )));
        }
        if self.width == 0 || self.height == 0 || self.bytes_per_texel == 0 {
            return Err(Error::Asset("resource has zero extent".into()));
        }
        Ok(())
    }

    /// Mip index for a detail level (detail 0 is the coarsest mip)
    pub fn mip_for_detail(&self, detail: u8) -> u8 {
        self.level_count - 1 - detail
    }

    /// GPU image description for the full mip chain
    pub fn image_desc(&self) -> ImageDesc {
        ImageDesc {
            kind: self.kind,
            width: self.width,
            height: self.height,
            level_count: self.level_count,
            bytes_per_texel: self.bytes_per_texel,
        }
    }

    /// Byte size of one mip
    pub fn level_size(&self, mip: u8) -> u64 {
        self.image_desc().level_size(mip)
    }
}

/// A single readable unit in the asset store
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AssetKey {
    Metadata(ResourceId),
    /// Raw bytes of one mip level
    Level(ResourceId, u8),
}

impl AssetKey {
    pub fn resource(&self) -> ResourceId {
        match *self {
            AssetKey::Metadata(id) | AssetKey::Level(id, _) => id,
        }
    }
}

/// Source of resource bytes
///
/// Reads may be issued from any runtime thread. Late results for cancelled
/// work are simply ignored by the cache, so no cancel API is needed.
pub trait AssetResolver: Send + Sync {
    fn read(&self, key: AssetKey) -> BoxFuture<'static, Result<Vec<u8>>>;
}

// --- File-backed resolver ---

/// Directory holding one resource
pub fn resource_dir(root: &Path, id: ResourceId) -> PathBuf {
    root.join(id.to_string())
}

/// Path of a resource's metadata file
pub fn meta_path(root: &Path, id: ResourceId) -> PathBuf {
    resource_dir(root, id).join(META_FILENAME)
}

/// Path of one compressed mip level
pub fn level_path(root: &Path, id: ResourceId, mip: u8) -> PathBuf {
    resource_dir(root, id).join(format!("level_{}.lz4", mip))
}

/// Write a resource to disk (sync)
///
/// # Arguments
/// * `root` - Asset directory
/// * `id` - Resource id; names the resource's subdirectory
/// * `meta` - Metadata, validated before anything is written
/// * `levels` - Level bytes indexed by mip, finest first
pub fn write_resource(root: &Path, id: ResourceId, meta: &ResourceMeta, levels: &[Vec<u8>]) -> Result<()> {
    meta.validate()?;
    if levels.len() != meta.level_count as usize {
        return Err(Error::Asset(format!(
            "expected {} levels, got {}", meta.level_count, levels.len()
        )));
    }

    std::fs::create_dir_all(resource_dir(root, id))?;
    std::fs::write(meta_path(root, id), meta.to_bytes()?)?;

    for (mip, data) in levels.iter().enumerate() {
        std::fs::write(level_path(root, id, mip as u8), lz4_flex::compress_prepend_size(data))?;
    }

    Ok(())
}

/// Resolver reading resources from a directory tree
///
/// Layout: `<root>/<id>/meta.json` and `<root>/<id>/level_<mip>.lz4`.
pub struct FileAssetResolver {
    root: PathBuf,
}

impl FileAssetResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl AssetResolver for FileAssetResolver {
    fn read(&self, key: AssetKey) -> BoxFuture<'static, Result<Vec<u8>>> {
        let root = self.root.clone();
        Box::pin(async move {
            match key {
                AssetKey::Metadata(id) => Ok(tokio::fs::read(meta_path(&root, id)).await?),
                AssetKey::Level(id, mip) => {
                    let compressed = tokio::fs::read(level_path(&root, id, mip)).await?;
                    lz4_flex::decompress_size_prepended(&compressed).map_err(|e| {
                        Error::Io(io::Error::new(
                            io::ErrorKind::InvalidData,
                            format!("LZ4 decompression failed: {}", e),
                        ))
                    })
                }
            }
        })
    }
}

// --- In-memory resolver ---

struct MemoryResource {
    meta: Vec<u8>,
    /// Indexed by mip
    levels: Vec<Vec<u8>>,
}

/// Resolver serving resources registered in memory
#[derive(Default)]
pub struct MemoryAssetResolver {
    resources: RwLock<HashMap<ResourceId, MemoryResource>>,
    reads: AtomicUsize,
}

impl MemoryAssetResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a resource; `levels` is indexed by mip, finest first
    pub fn insert(&self, id: ResourceId, meta: &ResourceMeta, levels: Vec<Vec<u8>>) -> Result<()> {
        let meta = meta.to_bytes()?;
        self.resources.write().insert(id, MemoryResource { meta, levels });
        Ok(())
    }

    /// Register raw metadata bytes with no levels
    pub fn insert_raw_meta(&self, id: ResourceId, meta: Vec<u8>) {
        self.resources.write().insert(id, MemoryResource { meta, levels: Vec::new() });
    }

    pub fn remove(&self, id: ResourceId) -> bool {
        self.resources.write().remove(&id).is_some()
    }

    /// Number of reads served (including failed ones)
    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::Relaxed)
    }

    fn lookup(&self, key: AssetKey) -> Result<Vec<u8>> {
        let resources = self.resources.read();
        let resource = resources
            .get(&key.resource())
            .ok_or_else(|| Error::Asset(format!("resource {} not found", key.resource())))?;

        match key {
            AssetKey::Metadata(_) => Ok(resource.meta.clone()),
            AssetKey::Level(id, mip) => resource
                .levels
                .get(mip as usize)
                .cloned()
                .ok_or_else(|| Error::Asset(format!("resource {} has no mip {}", id, mip))),
        }
    }
}

impl AssetResolver for MemoryAssetResolver {
    fn read(&self, key: AssetKey) -> BoxFuture<'static, Result<Vec<u8>>> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        let result = self.lookup(key);
        Box::pin(async move { result })
    }
}
