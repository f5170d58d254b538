//! Conversion between a live chunk and its two serialized forms: the
//! persisted tag tree and the paletted wire payload sent to observers.

use bytes::{BufMut, Bytes, BytesMut};
use std::collections::HashMap;
use strata_common::{ChunkPos, DimensionDescriptor, Result, StorageError};
use strata_nbt::Tag;

use crate::block_entity::BlockEntity;
use crate::chunk::{BiomeStore, Chunk};
use crate::encode::{ObfuscationTable, SectionEncoder};
use crate::palette::{cell_index, PalettedStorage, SECTION_VOLUME};
use crate::section::Section;
use crate::{DEFAULT_CELL, FORMAT_VERSION_LEGACY, FORMAT_VERSION_SECTIONED};

/// Finished wire form of one chunk, handed to the observer-facing
/// collaborator through its callback.
#[derive(Debug, Clone)]
pub struct WirePayload {
    pub bytes: Bytes,
    pub sub_chunk_count: u32,
    /// Chunk change counter at encode time, for staleness checks.
    pub changes: u64,
}

/// Encodes the wire payload: block storages up to the clipped subchunk
/// count, one biome storage per written dimension section, one reserved
/// byte, then the spawnable block-entity tags. Reads the chunk, never
/// mutates it.
pub fn encode_wire(
    chunk: &Chunk,
    dim: &DimensionDescriptor,
    encoder: &SectionEncoder,
    obfuscation: Option<&ObfuscationTable>,
) -> Result<WirePayload> {
    let max_sections = dim.max_wire_sections() as usize;
    let sub_chunk_count = match chunk.highest_non_empty_section() {
        Some(highest) => (highest + 1).min(max_sections),
        None => 0,
    };

    let block_bytes = encoder.encode_blocks(&chunk.sections()[..sub_chunk_count], obfuscation)?;
    let biome_bytes = encode_wire_biomes(chunk, max_sections, encoder)?;
    let entity_bytes = encode_spawnable_entities(chunk)?;

    let mut out = BytesMut::with_capacity(
        block_bytes.len() + biome_bytes.len() + 1 + entity_bytes.len(),
    );
    out.put_slice(&block_bytes);
    out.put_slice(&biome_bytes);
    out.put_u8(0); // reserved
    out.put_slice(&entity_bytes);

    Ok(WirePayload {
        bytes: out.freeze(),
        sub_chunk_count: sub_chunk_count as u32,
        changes: chunk.changes(),
    })
}

fn encode_wire_biomes(
    chunk: &Chunk,
    max_sections: usize,
    encoder: &SectionEncoder,
) -> Result<Vec<u8>> {
    match chunk.biomes() {
        BiomeStore::Volumetric(storages) => {
            let written = storages.len().min(max_sections);
            encoder.encode_biomes(&storages[..written])
        }
        BiomeStore::Flat(grid) => {
            // Legacy fallback: broadcast the column grid to all 16 vertical
            // cells once, then emit that same buffer for every subchunk
            // slot. Observers expect one storage per written section.
            let mut cells = vec![DEFAULT_CELL; SECTION_VOLUME];
            for x in 0..16 {
                for z in 0..16 {
                    let biome = grid[(z << 4) | x];
                    for y in 0..16 {
                        cells[cell_index(x, z, y)] = biome;
                    }
                }
            }
            let storage = PalettedStorage::build(DEFAULT_CELL, &cells);
            let mut one = Vec::new();
            storage.write_to(&mut one).map_err(StorageError::Io)?;

            let mut out = Vec::with_capacity(one.len() * max_sections);
            for _ in 0..max_sections {
                out.extend_from_slice(&one);
            }
            Ok(out)
        }
    }
}

fn encode_spawnable_entities(chunk: &Chunk) -> Result<Vec<u8>> {
    let mut spawnable: Vec<&BlockEntity> = chunk
        .block_entities()
        .filter(|entity| entity.spawnable)
        .collect();
    spawnable.sort_by_key(|entity| (entity.pos.x, entity.pos.y, entity.pos.z));

    let mut out = Vec::new();
    for entity in spawnable {
        entity.spawn_tag().write(&mut out, "").map_err(StorageError::Io)?;
    }
    Ok(out)
}

/// Encodes the persisted tag tree. Unlike the wire form this keeps every
/// block entity and the full section list, and carries the format-version
/// marker.
pub fn encode_persisted(chunk: &Chunk, version: i32) -> Tag {
    let mut root = HashMap::new();
    root.insert("xPos".to_string(), Tag::Int(chunk.pos().x));
    root.insert("zPos".to_string(), Tag::Int(chunk.pos().z));
    root.insert("Version".to_string(), Tag::Int(version));
    root.insert(
        "Generated".to_string(),
        Tag::Byte(chunk.is_generated() as i8),
    );
    root.insert(
        "Populated".to_string(),
        Tag::Byte(chunk.is_populated() as i8),
    );
    root.insert("Changes".to_string(), Tag::Long(chunk.changes() as i64));

    let sections: Vec<Tag> = chunk
        .sections()
        .iter()
        .enumerate()
        .map(|(y, section)| {
            let storage = section.storage();
            let mut compound = HashMap::new();
            compound.insert("Y".to_string(), Tag::Byte(y as i8));
            compound.insert("Bits".to_string(), Tag::Byte(storage.width() as i8));
            compound.insert(
                "Palette".to_string(),
                Tag::IntArray(storage.palette().iter().map(|&v| v as i32).collect()),
            );
            compound.insert(
                "BlockStates".to_string(),
                Tag::LongArray(storage.words().iter().map(|&w| w as i64).collect()),
            );
            Tag::Compound(compound)
        })
        .collect();
    root.insert("Sections".to_string(), Tag::List(sections));

    match chunk.biomes() {
        BiomeStore::Flat(grid) => {
            root.insert(
                "Biomes".to_string(),
                Tag::IntArray(grid.iter().map(|&v| v as i32).collect()),
            );
        }
        BiomeStore::Volumetric(storages) => {
            root.insert(
                "BiomeSections".to_string(),
                Tag::List(storages.iter().map(storage_to_tag).collect()),
            );
        }
    }

    let mut entities: Vec<&BlockEntity> = chunk.block_entities().collect();
    entities.sort_by_key(|entity| (entity.pos.x, entity.pos.y, entity.pos.z));
    root.insert(
        "BlockEntities".to_string(),
        Tag::List(entities.iter().map(|entity| entity.to_tag()).collect()),
    );

    Tag::Compound(root)
}

/// Reconstructs a chunk from its persisted tag tree. Any structural
/// defect surfaces as `CorruptFormat`; the caller treats the chunk as
/// absent rather than failing the region.
pub fn decode_persisted(
    tag: &Tag,
    pos: ChunkPos,
    dim: &DimensionDescriptor,
) -> Result<Chunk> {
    let root = tag.try_compound()?;
    let missing = |key: &str| StorageError::CorruptFormat(format!("chunk missing {}", key));

    let version = root
        .get("Version")
        .ok_or_else(|| missing("Version"))?
        .try_int()?;
    if version != FORMAT_VERSION_LEGACY && version != FORMAT_VERSION_SECTIONED {
        return Err(StorageError::CorruptFormat(format!(
            "unknown format version {}",
            version
        )));
    }

    let x = root.get("xPos").ok_or_else(|| missing("xPos"))?.try_int()?;
    let z = root.get("zPos").ok_or_else(|| missing("zPos"))?.try_int()?;
    if x != pos.x || z != pos.z {
        return Err(StorageError::CorruptFormat(format!(
            "chunk stored at ({}, {}) but indexed at {}",
            x, z, pos
        )));
    }

    let section_count = dim.section_count() as usize;
    let mut sections = vec![Section::new(); section_count];
    for entry in root
        .get("Sections")
        .ok_or_else(|| missing("Sections"))?
        .try_list()?
    {
        let compound = entry.try_compound()?;
        let y = compound.get("Y").ok_or_else(|| missing("Y"))?.try_byte()?;
        if y < 0 || y as usize >= section_count {
            return Err(StorageError::CorruptFormat(format!(
                "section index {} outside 0..{}",
                y, section_count
            )));
        }
        let bits = compound
            .get("Bits")
            .ok_or_else(|| missing("Bits"))?
            .try_byte()? as u8;
        let palette: Vec<u32> = compound
            .get("Palette")
            .ok_or_else(|| missing("Palette"))?
            .try_int_array()?
            .iter()
            .map(|&v| v as u32)
            .collect();
        let words: Vec<u64> = compound
            .get("BlockStates")
            .ok_or_else(|| missing("BlockStates"))?
            .try_long_array()?
            .iter()
            .map(|&w| w as u64)
            .collect();
        sections[y as usize] = Section::from_storage(PalettedStorage::from_parts(
            palette, bits, words,
        )?);
    }

    let biomes = decode_biomes(root, version, section_count)?;

    let mut block_entities = Vec::new();
    if let Some(list) = root.get("BlockEntities") {
        for entry in list.try_list()? {
            block_entities.push(BlockEntity::from_tag(entry)?);
        }
    }

    let generated = matches!(root.get("Generated"), Some(Tag::Byte(v)) if *v != 0);
    let populated = matches!(root.get("Populated"), Some(Tag::Byte(v)) if *v != 0);
    let changes = match root.get("Changes") {
        Some(tag) => tag.try_long()? as u64,
        None => 0,
    };

    Ok(Chunk::from_parts(
        pos,
        sections,
        biomes,
        block_entities,
        generated,
        populated,
        changes,
    ))
}

fn decode_biomes(
    root: &HashMap<String, Tag>,
    version: i32,
    section_count: usize,
) -> Result<BiomeStore> {
    if let Some(tag) = root.get("Biomes") {
        let values = tag.try_int_array()?;
        if values.len() != 256 {
            return Err(StorageError::CorruptFormat(format!(
                "biome grid of {} columns",
                values.len()
            )));
        }
        let mut grid = Box::new([DEFAULT_CELL; 256]);
        for (slot, &value) in grid.iter_mut().zip(values) {
            *slot = value as u32;
        }
        return Ok(BiomeStore::Flat(grid));
    }

    if let Some(tag) = root.get("BiomeSections") {
        if version == FORMAT_VERSION_LEGACY {
            return Err(StorageError::CorruptFormat(
                "legacy chunk with sectioned biome data".to_owned(),
            ));
        }
        let list = tag.try_list()?;
        if list.len() > section_count {
            return Err(StorageError::CorruptFormat(format!(
                "{} biome sections for {} chunk sections",
                list.len(),
                section_count
            )));
        }
        let mut storages = Vec::with_capacity(section_count);
        for entry in list {
            storages.push(storage_from_tag(entry)?);
        }
        // Older saves may lack the topmost sections.
        while storages.len() < section_count {
            storages.push(PalettedStorage::new(DEFAULT_CELL));
        }
        return Ok(BiomeStore::Volumetric(storages));
    }

    Err(StorageError::CorruptFormat("chunk missing biome data".to_owned()))
}

fn storage_to_tag(storage: &PalettedStorage) -> Tag {
    let mut compound = HashMap::new();
    compound.insert("Bits".to_string(), Tag::Byte(storage.width() as i8));
    compound.insert(
        "Palette".to_string(),
        Tag::IntArray(storage.palette().iter().map(|&v| v as i32).collect()),
    );
    compound.insert(
        "Cells".to_string(),
        Tag::LongArray(storage.words().iter().map(|&w| w as i64).collect()),
    );
    Tag::Compound(compound)
}

fn storage_from_tag(tag: &Tag) -> Result<PalettedStorage> {
    let compound = tag.try_compound()?;
    let missing = |key: &str| StorageError::CorruptFormat(format!("biome section missing {}", key));

    let bits = compound
        .get("Bits")
        .ok_or_else(|| missing("Bits"))?
        .try_byte()? as u8;
    let palette: Vec<u32> = compound
        .get("Palette")
        .ok_or_else(|| missing("Palette"))?
        .try_int_array()?
        .iter()
        .map(|&v| v as u32)
        .collect();
    let words: Vec<u64> = compound
        .get("Cells")
        .ok_or_else(|| missing("Cells"))?
        .try_long_array()?
        .iter()
        .map(|&w| w as u64)
        .collect();
    PalettedStorage::from_parts(palette, bits, words)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use strata_common::BlockPos;

    fn dimension(min: i32, max: i32) -> DimensionDescriptor {
        DimensionDescriptor {
            name: "overworld".to_owned(),
            id: 0,
            min_height: min,
            max_height: max,
            section_count: None,
        }
    }

    fn populated_chunk(volumetric: bool) -> Chunk {
        let dim = dimension(0, 128);
        let mut chunk = Chunk::new(ChunkPos::new(4, -9), dim.section_count(), volumetric);
        for x in 0..16 {
            for z in 0..16 {
                chunk.set_block(x, 0, z, 1);
                chunk.set_block(x, 1, z, ((x + z) % 23) as u32 + 1);
            }
        }
        chunk.set_block(8, 60, 8, 500);
        chunk.set_biome_column(3, 3, 2);

        let mut container =
            BlockEntity::new(BlockPos::new(70, 1, -140), "container".to_owned(), true);
        container
            .data
            .insert("Count".to_string(), Tag::Int(12));
        chunk.add_block_entity(container);
        chunk.add_block_entity(BlockEntity::new(
            BlockPos::new(71, 1, -140),
            "marker".to_owned(),
            false,
        ));

        chunk.set_generated(true);
        chunk.set_populated(true);
        chunk
    }

    #[test]
    fn test_persisted_round_trip() {
        for volumetric in [false, true] {
            let dim = dimension(0, 128);
            let chunk = populated_chunk(volumetric);
            let tag = encode_persisted(&chunk, FORMAT_VERSION_SECTIONED);

            // Through bytes and back, not just the tag tree.
            let mut bytes = Vec::new();
            tag.write(&mut bytes, "").unwrap();
            let (_, read_tag) = Tag::read(&mut std::io::Cursor::new(bytes)).unwrap();

            let decoded = decode_persisted(&read_tag, chunk.pos(), &dim).unwrap();
            assert_eq!(decoded.sections(), chunk.sections());
            assert_eq!(decoded.biomes(), chunk.biomes());
            assert_eq!(decoded.changes(), chunk.changes());
            assert!(decoded.is_generated());
            assert!(decoded.is_populated());

            let original: Vec<&BlockEntity> = {
                let mut v: Vec<&BlockEntity> = chunk.block_entities().collect();
                v.sort_by_key(|e| (e.pos.x, e.pos.y, e.pos.z));
                v
            };
            let restored: Vec<&BlockEntity> = {
                let mut v: Vec<&BlockEntity> = decoded.block_entities().collect();
                v.sort_by_key(|e| (e.pos.x, e.pos.y, e.pos.z));
                v
            };
            assert_eq!(restored, original);
        }
    }

    #[test]
    fn test_wire_clips_to_dimension_height() {
        // 8 live sections but the dimension only admits 64 >> 4 = 4.
        let dim = dimension(0, 64);
        let mut chunk = Chunk::new(ChunkPos::new(0, 0), 8, false);
        chunk.set_block(0, 8 * 16 - 1, 0, 7);
        assert_eq!(chunk.highest_non_empty_section(), Some(7));

        let encoder = SectionEncoder::new(2).unwrap();
        let payload = encode_wire(&chunk, &dim, &encoder, None).unwrap();
        assert_eq!(payload.sub_chunk_count, 4);
    }

    #[test]
    fn test_wire_encode_is_deterministic() {
        let dim = dimension(0, 128);
        let chunk = populated_chunk(false);
        let encoder = SectionEncoder::new(4).unwrap();

        let first = encode_wire(&chunk, &dim, &encoder, None).unwrap();
        let second = encode_wire(&chunk, &dim, &encoder, None).unwrap();
        assert_eq!(first.bytes, second.bytes);
        assert_eq!(first.sub_chunk_count, second.sub_chunk_count);
    }

    #[test]
    fn test_wire_layout_of_empty_chunk() {
        let dim = dimension(0, 64);
        let chunk = Chunk::new(ChunkPos::new(0, 0), 4, false);
        let encoder = SectionEncoder::new(1).unwrap();

        let payload = encode_wire(&chunk, &dim, &encoder, None).unwrap();
        assert_eq!(payload.sub_chunk_count, 0);

        // No block sections, four identical flat biome storages, the
        // reserved byte, no block entities.
        let mut one = Vec::new();
        PalettedStorage::new(DEFAULT_CELL).write_to(&mut one).unwrap();
        assert_eq!(payload.bytes.len(), one.len() * 4 + 1);
        assert_eq!(&payload.bytes[..one.len()], &one[..]);
        assert_eq!(&payload.bytes[one.len()..one.len() * 2], &one[..]);
        assert_eq!(payload.bytes[one.len() * 4], 0);
    }

    #[test]
    fn test_wire_omits_unspawnable_entities() {
        let dim = dimension(0, 128);
        let chunk = populated_chunk(false);
        let encoder = SectionEncoder::new(2).unwrap();
        let payload = encode_wire(&chunk, &dim, &encoder, None).unwrap();

        let haystack = payload.bytes.as_ref();
        let spawnable = b"container";
        let hidden = b"marker";
        assert!(haystack
            .windows(spawnable.len())
            .any(|window| window == spawnable));
        assert!(!haystack.windows(hidden.len()).any(|window| window == hidden));
    }

    #[test]
    fn test_decode_rejects_unknown_version() {
        let dim = dimension(0, 128);
        let chunk = populated_chunk(false);
        let tag = encode_persisted(&chunk, 12345);
        let result = decode_persisted(&tag, chunk.pos(), &dim);
        assert_matches!(result, Err(StorageError::CorruptFormat(_)));
    }

    #[test]
    fn test_decode_rejects_coordinate_mismatch() {
        let dim = dimension(0, 128);
        let chunk = populated_chunk(false);
        let tag = encode_persisted(&chunk, FORMAT_VERSION_SECTIONED);
        let result = decode_persisted(&tag, ChunkPos::new(99, 99), &dim);
        assert_matches!(result, Err(StorageError::CorruptFormat(_)));
    }

    #[test]
    fn test_legacy_chunk_round_trip() {
        let dim = DimensionDescriptor::legacy_flat("overworld".to_owned(), 0);
        let mut chunk = Chunk::new(ChunkPos::new(1, 1), dim.section_count(), false);
        chunk.set_block(0, 10, 0, 3);
        chunk.set_biome_column(0, 0, 9);

        let tag = encode_persisted(&chunk, FORMAT_VERSION_LEGACY);
        let decoded = decode_persisted(&tag, chunk.pos(), &dim).unwrap();
        assert_eq!(decoded.get_block(0, 10, 0), 3);
        assert_eq!(decoded.get_biome_column(0, 0), 9);
    }

    #[test]
    fn test_flat_biomes_duplicate_one_buffer_per_subchunk() {
        let dim = dimension(0, 96);
        let mut chunk = Chunk::new(ChunkPos::new(0, 0), 6, false);
        chunk.set_biome_column(0, 0, 4);
        chunk.set_biome_column(9, 12, 5);

        let encoder = SectionEncoder::new(2).unwrap();
        let biomes = encode_wire_biomes(&chunk, 6, &encoder).unwrap();
        assert_eq!(biomes.len() % 6, 0);
        let stride = biomes.len() / 6;
        for slot in 1..6 {
            assert_eq!(
                &biomes[slot * stride..(slot + 1) * stride],
                &biomes[..stride]
            );
        }
    }
}
