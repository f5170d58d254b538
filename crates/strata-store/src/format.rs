use std::path::Path;
use strata_common::{ChunkPos, DimensionDescriptor, Result, StorageError};
use strata_nbt::Tag;
use strata_world::{
    decode_persisted, encode_persisted, Chunk, FORMAT_VERSION_LEGACY, FORMAT_VERSION_SECTIONED,
};

use crate::descriptor::{DESCRIPTOR_FILE, REGION_DIR};

/// Storage-layout capability, selected once at world-open time from the
/// descriptor's version marker and dispatched as a value, not a class
/// hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorldFormat {
    /// Fixed 0..256 extent, 16 sections, column biomes.
    LegacyFlat,
    /// Explicit min/max height, optional section count, per-section biomes.
    Sectioned,
}

impl WorldFormat {
    pub fn from_version(version: i32) -> Result<Self> {
        match version {
            FORMAT_VERSION_LEGACY => Ok(WorldFormat::LegacyFlat),
            FORMAT_VERSION_SECTIONED => Ok(WorldFormat::Sectioned),
            other => Err(StorageError::CorruptFormat(format!(
                "unknown world format version {}",
                other
            ))),
        }
    }

    pub fn version(&self) -> i32 {
        match self {
            WorldFormat::LegacyFlat => FORMAT_VERSION_LEGACY,
            WorldFormat::Sectioned => FORMAT_VERSION_SECTIONED,
        }
    }

    /// Fresh empty chunk in this format's biome layout.
    pub fn new_chunk(&self, pos: ChunkPos, dim: &DimensionDescriptor) -> Chunk {
        match self {
            WorldFormat::LegacyFlat => Chunk::new(pos, dim.section_count(), false),
            WorldFormat::Sectioned => Chunk::new(pos, dim.section_count(), true),
        }
    }

    /// Reconstructs a chunk from its persisted tag tree. Chunks saved by
    /// the older layout stay readable in a sectioned world.
    pub fn load_chunk(&self, tag: &Tag, pos: ChunkPos, dim: &DimensionDescriptor) -> Result<Chunk> {
        decode_persisted(tag, pos, dim)
    }

    /// Produces the persisted tag tree, stamped with this format's version.
    pub fn save_chunk(&self, chunk: &Chunk) -> Tag {
        encode_persisted(chunk, self.version())
    }

    /// Whether a directory looks like a world of this engine: descriptor
    /// present and a region directory holding nothing but `.mca` files.
    pub fn is_valid_path(&self, world_dir: &Path) -> bool {
        if !world_dir.join(DESCRIPTOR_FILE).is_file() {
            return false;
        }
        let region_dir = world_dir.join(REGION_DIR);
        if !region_dir.is_dir() {
            return false;
        }
        match std::fs::read_dir(&region_dir) {
            Ok(entries) => {
                for entry in entries.flatten() {
                    let name = entry.file_name();
                    let name = name.to_string_lossy();
                    if name.starts_with("r.") && !name.ends_with(".mca") {
                        return false;
                    }
                }
                true
            }
            Err(_) => false,
        }
    }
}
