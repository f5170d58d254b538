use std::collections::HashMap;
use strata_common::{BlockPos, ChunkPos};

use crate::block_entity::BlockEntity;
use crate::palette::{cell_index, PalettedStorage};
use crate::section::Section;
use crate::DEFAULT_CELL;

/// Biome data for one chunk. Legacy worlds carry one value per column;
/// sectioned worlds carry a full 16^3 storage per section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BiomeStore {
    Flat(Box<[u32; 256]>),
    Volumetric(Vec<PalettedStorage>),
}

impl BiomeStore {
    pub fn flat() -> Self {
        BiomeStore::Flat(Box::new([DEFAULT_CELL; 256]))
    }

    pub fn volumetric(section_count: usize) -> Self {
        BiomeStore::Volumetric(
            (0..section_count)
                .map(|_| PalettedStorage::new(DEFAULT_CELL))
                .collect(),
        )
    }

    fn column_index(x: usize, z: usize) -> usize {
        (z << 4) | x
    }
}

/// The unit of loaded world state for one (x, z) column: ordered sections
/// spanning the vertical extent, biome data, and attached block entities.
/// The owning store holds exactly one instance per loaded coordinate.
#[derive(Debug, Clone)]
pub struct Chunk {
    pos: ChunkPos,
    sections: Vec<Section>,
    biomes: BiomeStore,
    block_entities: HashMap<BlockPos, BlockEntity>,
    generated: bool,
    populated: bool,
    dirty: bool,
    changes: u64,
}

impl Chunk {
    pub fn new(pos: ChunkPos, section_count: u32, volumetric_biomes: bool) -> Self {
        let section_count = section_count as usize;
        Chunk {
            pos,
            sections: (0..section_count).map(|_| Section::new()).collect(),
            biomes: if volumetric_biomes {
                BiomeStore::volumetric(section_count)
            } else {
                BiomeStore::flat()
            },
            block_entities: HashMap::new(),
            generated: false,
            populated: false,
            dirty: false,
            changes: 0,
        }
    }

    pub fn from_parts(
        pos: ChunkPos,
        sections: Vec<Section>,
        biomes: BiomeStore,
        block_entities: Vec<BlockEntity>,
        generated: bool,
        populated: bool,
        changes: u64,
    ) -> Self {
        Chunk {
            pos,
            sections,
            biomes,
            block_entities: block_entities
                .into_iter()
                .map(|entity| (entity.pos, entity))
                .collect(),
            generated,
            populated,
            dirty: false,
            changes,
        }
    }

    pub fn pos(&self) -> ChunkPos {
        self.pos
    }

    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    pub fn section_count(&self) -> usize {
        self.sections.len()
    }

    pub fn biomes(&self) -> &BiomeStore {
        &self.biomes
    }

    pub fn is_generated(&self) -> bool {
        self.generated
    }

    pub fn set_generated(&mut self, generated: bool) {
        self.generated = generated;
        self.touch();
    }

    pub fn is_populated(&self) -> bool {
        self.populated
    }

    pub fn set_populated(&mut self, populated: bool) {
        self.populated = populated;
        self.touch();
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Called by the store after a successful save.
    pub fn clear_dirty(&mut self) {
        self.dirty = false;
    }

    /// Change counter used to detect staleness for outbound resync.
    pub fn changes(&self) -> u64 {
        self.changes
    }

    fn touch(&mut self) {
        self.dirty = true;
        self.changes += 1;
    }

    /// Block value at local coordinates; y counts from the chunk bottom.
    pub fn get_block(&self, x: usize, y: usize, z: usize) -> u32 {
        self.sections[y >> 4].get(x, y & 15, z)
    }

    pub fn set_block(&mut self, x: usize, y: usize, z: usize, value: u32) {
        if self.sections[y >> 4].set(x, y & 15, z, value) {
            self.touch();
        }
    }

    /// Column biome for flat stores; volumetric stores read their bottom
    /// cell so legacy callers keep working.
    pub fn get_biome_column(&self, x: usize, z: usize) -> u32 {
        match &self.biomes {
            BiomeStore::Flat(grid) => grid[BiomeStore::column_index(x, z)],
            BiomeStore::Volumetric(storages) => storages[0].get(cell_index(x, z, 0)),
        }
    }

    pub fn set_biome_column(&mut self, x: usize, z: usize, value: u32) {
        match &mut self.biomes {
            BiomeStore::Flat(grid) => {
                let index = BiomeStore::column_index(x, z);
                if grid[index] == value {
                    return;
                }
                grid[index] = value;
            }
            BiomeStore::Volumetric(storages) => {
                // Broadcast down the whole column.
                for storage in storages.iter_mut() {
                    for y in 0..16 {
                        storage.set(cell_index(x, z, y), value);
                    }
                }
            }
        }
        self.touch();
    }

    pub fn get_biome(&self, x: usize, y: usize, z: usize) -> u32 {
        match &self.biomes {
            BiomeStore::Flat(grid) => grid[BiomeStore::column_index(x, z)],
            BiomeStore::Volumetric(storages) => storages[y >> 4].get(cell_index(x, z, y & 15)),
        }
    }

    /// Per-cell biome write; only meaningful for volumetric stores.
    pub fn set_biome(&mut self, x: usize, y: usize, z: usize, value: u32) {
        match &mut self.biomes {
            BiomeStore::Flat(_) => self.set_biome_column(x, z, value),
            BiomeStore::Volumetric(storages) => {
                storages[y >> 4].set(cell_index(x, z, y & 15), value);
                self.touch();
            }
        }
    }

    pub fn block_entity(&self, pos: BlockPos) -> Option<&BlockEntity> {
        self.block_entities.get(&pos)
    }

    pub fn block_entity_mut(&mut self, pos: BlockPos) -> Option<&mut BlockEntity> {
        if self.block_entities.contains_key(&pos) {
            self.touch();
        }
        self.block_entities.get_mut(&pos)
    }

    pub fn add_block_entity(&mut self, entity: BlockEntity) {
        self.block_entities.insert(entity.pos, entity);
        self.touch();
    }

    pub fn remove_block_entity(&mut self, pos: BlockPos) -> Option<BlockEntity> {
        let removed = self.block_entities.remove(&pos);
        if removed.is_some() {
            self.touch();
        }
        removed
    }

    pub fn block_entities(&self) -> impl Iterator<Item = &BlockEntity> {
        self.block_entities.values()
    }

    /// Index of the topmost section holding any non-default cell.
    pub fn highest_non_empty_section(&self) -> Option<usize> {
        self.sections.iter().rposition(|section| !section.is_empty())
    }

    /// Drops redundant derived palette state in every section; memory-only,
    /// so neither the dirty flag nor the change counter moves.
    pub fn compress(&mut self) -> bool {
        let mut shrank = false;
        for section in &mut self.sections {
            shrank |= section.compress();
        }
        if let BiomeStore::Volumetric(storages) = &mut self.biomes {
            for storage in storages.iter_mut() {
                shrank |= storage.compact();
            }
        }
        shrank
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk() -> Chunk {
        Chunk::new(ChunkPos::new(3, -2), 24, false)
    }

    #[test]
    fn test_block_access_spans_sections() {
        let mut chunk = chunk();
        chunk.set_block(5, 0, 5, 10);
        chunk.set_block(5, 17, 5, 11);
        chunk.set_block(5, 383, 5, 12);

        assert_eq!(chunk.get_block(5, 0, 5), 10);
        assert_eq!(chunk.get_block(5, 17, 5), 11);
        assert_eq!(chunk.get_block(5, 383, 5), 12);
        assert_eq!(chunk.highest_non_empty_section(), Some(23));
    }

    #[test]
    fn test_mutation_marks_dirty_and_counts_changes() {
        let mut chunk = chunk();
        assert!(!chunk.is_dirty());
        let before = chunk.changes();

        chunk.set_block(0, 0, 0, 1);
        assert!(chunk.is_dirty());
        assert_eq!(chunk.changes(), before + 1);

        // Writing the same value again is not a change.
        chunk.set_block(0, 0, 0, 1);
        assert_eq!(chunk.changes(), before + 1);

        chunk.clear_dirty();
        assert!(!chunk.is_dirty());
    }

    #[test]
    fn test_empty_chunk_has_no_sections_to_send() {
        assert_eq!(chunk().highest_non_empty_section(), None);
    }

    #[test]
    fn test_block_entity_lifecycle() {
        let mut chunk = chunk();
        let pos = BlockPos::new(50, 70, -30);
        chunk.add_block_entity(BlockEntity::new(pos, "container".to_owned(), true));

        assert!(chunk.block_entity(pos).is_some());
        assert!(chunk.remove_block_entity(pos).is_some());
        assert!(chunk.block_entity(pos).is_none());
        assert!(chunk.remove_block_entity(pos).is_none());
    }

    #[test]
    fn test_volumetric_biome_write() {
        let mut chunk = Chunk::new(ChunkPos::new(0, 0), 4, true);
        chunk.set_biome(3, 40, 3, 6);
        match chunk.biomes() {
            BiomeStore::Volumetric(storages) => {
                assert_eq!(storages[2].get(cell_index(3, 3, 8)), 6);
            }
            BiomeStore::Flat(_) => panic!("expected volumetric store"),
        }
    }

    #[test]
    fn test_compress_reclaims_palette_entries() {
        let mut chunk = chunk();
        chunk.set_block(1, 1, 1, 99);
        chunk.set_block(1, 1, 1, 0);
        let changes = chunk.changes();

        assert!(chunk.compress());
        assert_eq!(chunk.changes(), changes);
        assert!(chunk.is_dirty());
    }
}
