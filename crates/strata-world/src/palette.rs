use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};
use strata_common::{Result, StorageError};

/// Cells per section edge.
pub const SECTION_EDGE: usize = 16;
/// Cells per section cube.
pub const SECTION_VOLUME: usize = SECTION_EDGE * SECTION_EDGE * SECTION_EDGE;

/// Canonical scan order inside a section: x outer, z middle, y inner.
pub fn cell_index(x: usize, z: usize, y: usize) -> usize {
    (x << 8) | (z << 4) | y
}

/// Smallest index width able to address `palette_len` entries, never 0 so
/// a single-entry palette still decodes uniformly.
pub fn width_for(palette_len: usize) -> u8 {
    if palette_len <= 2 {
        return 1;
    }
    (usize::BITS - (palette_len - 1).leading_zeros()) as u8
}

/// Fixed-length array of small unsigned values packed into u64 words.
/// Values may span a word boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackedArray {
    bits: u8,
    len: usize,
    words: Vec<u64>,
}

impl PackedArray {
    pub fn new(bits: u8, len: usize) -> Self {
        debug_assert!(bits >= 1 && bits <= 32);
        let word_count = (len * bits as usize + 63) / 64;
        PackedArray {
            bits,
            len,
            words: vec![0; word_count],
        }
    }

    pub fn from_words(bits: u8, len: usize, words: Vec<u64>) -> Result<Self> {
        let expected = (len * bits as usize + 63) / 64;
        if bits < 1 || bits > 32 || words.len() != expected {
            return Err(StorageError::CorruptFormat(format!(
                "packed array of width {} needs {} words, found {}",
                bits,
                expected,
                words.len()
            )));
        }
        Ok(PackedArray { bits, len, words })
    }

    pub fn bits(&self) -> u8 {
        self.bits
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn words(&self) -> &[u64] {
        &self.words
    }

    pub fn get(&self, index: usize) -> u32 {
        debug_assert!(index < self.len);
        let bits = self.bits as usize;
        let start_bit = index * bits;
        let start_long = start_bit / 64;
        let start_offset = start_bit % 64;
        let end_long = (start_bit + bits - 1) / 64;
        let mask = (1u64 << bits) - 1;

        let raw = if start_long == end_long {
            self.words[start_long] >> start_offset
        } else {
            (self.words[start_long] >> start_offset)
                | (self.words[end_long] << (64 - start_offset))
        };
        (raw & mask) as u32
    }

    pub fn set(&mut self, index: usize, value: u32) {
        debug_assert!(index < self.len);
        let bits = self.bits as usize;
        let start_bit = index * bits;
        let start_long = start_bit / 64;
        let start_offset = start_bit % 64;
        let end_long = (start_bit + bits - 1) / 64;
        let mask = (1u64 << bits) - 1;
        let value = value as u64 & mask;

        self.words[start_long] &= !(mask << start_offset);
        self.words[start_long] |= value << start_offset;

        if start_long != end_long {
            let spill_mask = mask >> (64 - start_offset);
            self.words[end_long] &= !spill_mask;
            self.words[end_long] |= value >> (64 - start_offset);
        }
    }
}

/// Per-section compact array: a deduplicated value palette (index 0
/// reserved for the default value) plus one packed index per cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PalettedStorage {
    palette: Vec<u32>,
    indices: PackedArray,
}

impl PalettedStorage {
    /// An all-default storage.
    pub fn new(default_value: u32) -> Self {
        PalettedStorage {
            palette: vec![default_value],
            indices: PackedArray::new(1, SECTION_VOLUME),
        }
    }

    /// Builds palette and indices from a full cube of cell values in the
    /// canonical scan order: first sight of a value appends it.
    pub fn build(default_value: u32, cells: &[u32]) -> Self {
        debug_assert_eq!(cells.len(), SECTION_VOLUME);
        let mut palette = vec![default_value];
        for &value in cells {
            if !palette.contains(&value) {
                palette.push(value);
            }
        }

        let mut indices = PackedArray::new(width_for(palette.len()), SECTION_VOLUME);
        for (cell, &value) in cells.iter().enumerate() {
            let index = palette.iter().position(|&v| v == value).unwrap() as u32;
            indices.set(cell, index);
        }
        PalettedStorage { palette, indices }
    }

    pub fn from_parts(palette: Vec<u32>, bits: u8, words: Vec<u64>) -> Result<Self> {
        if palette.is_empty() || palette.len() > SECTION_VOLUME {
            return Err(StorageError::CorruptFormat(format!(
                "palette of {} entries",
                palette.len()
            )));
        }
        let indices = PackedArray::from_words(bits, SECTION_VOLUME, words)?;
        let storage = PalettedStorage { palette, indices };
        storage.check_indices()?;
        Ok(storage)
    }

    fn check_indices(&self) -> Result<()> {
        for cell in 0..SECTION_VOLUME {
            let index = self.indices.get(cell);
            if index as usize >= self.palette.len() {
                return Err(StorageError::CorruptFormat(format!(
                    "palette index {} out of bounds for palette of {}",
                    index,
                    self.palette.len()
                )));
            }
        }
        Ok(())
    }

    pub fn palette(&self) -> &[u32] {
        &self.palette
    }

    pub fn width(&self) -> u8 {
        self.indices.bits()
    }

    pub fn words(&self) -> &[u64] {
        self.indices.words()
    }

    pub fn get(&self, cell: usize) -> u32 {
        self.palette[self.indices.get(cell) as usize]
    }

    pub fn set(&mut self, cell: usize, value: u32) {
        let index = self.index_of(value);
        self.indices.set(cell, index);
    }

    /// Whether every cell currently holds the default value.
    pub fn is_uniform_default(&self) -> bool {
        if self.palette.len() == 1 {
            return true;
        }
        (0..SECTION_VOLUME).all(|cell| self.indices.get(cell) == 0)
    }

    fn index_of(&mut self, value: u32) -> u32 {
        if let Some(index) = self.palette.iter().position(|&v| v == value) {
            return index as u32;
        }

        self.palette.push(value);
        let needed = width_for(self.palette.len());
        if needed > self.indices.bits() {
            let mut widened = PackedArray::new(needed, SECTION_VOLUME);
            for cell in 0..SECTION_VOLUME {
                widened.set(cell, self.indices.get(cell));
            }
            self.indices = widened;
        }
        (self.palette.len() - 1) as u32
    }

    /// Rebuilds palette and index array from the live cells, dropping
    /// entries no cell references and narrowing the index width. Returns
    /// whether anything shrank.
    pub fn compact(&mut self) -> bool {
        let cells: Vec<u32> = (0..SECTION_VOLUME).map(|cell| self.get(cell)).collect();
        let rebuilt = PalettedStorage::build(self.palette[0], &cells);
        if rebuilt.palette.len() < self.palette.len() || rebuilt.width() < self.width() {
            *self = rebuilt;
            return true;
        }
        false
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        self.write_mapped_to(writer, |value| value)
    }

    /// Writes the storage with every palette value passed through `map`;
    /// the packed indices are written untouched.
    pub fn write_mapped_to<W: Write, F>(&self, writer: &mut W, map: F) -> io::Result<()>
    where
        F: Fn(u32) -> u32,
    {
        writer.write_u8(self.indices.bits())?;
        writer.write_u32::<BigEndian>(self.palette.len() as u32)?;
        for &value in &self.palette {
            writer.write_u32::<BigEndian>(map(value))?;
        }
        let words = self.indices.words();
        writer.write_u32::<BigEndian>(words.len() as u32)?;
        for &word in words {
            writer.write_u64::<BigEndian>(word)?;
        }
        Ok(())
    }

    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let bits = reader.read_u8().map_err(StorageError::Io)?;
        let palette_len = reader.read_u32::<BigEndian>().map_err(StorageError::Io)? as usize;
        if palette_len == 0 || palette_len > SECTION_VOLUME {
            return Err(StorageError::CorruptFormat(format!(
                "palette of {} entries",
                palette_len
            )));
        }
        let mut palette = Vec::with_capacity(palette_len);
        for _ in 0..palette_len {
            palette.push(reader.read_u32::<BigEndian>().map_err(StorageError::Io)?);
        }
        let word_count = reader.read_u32::<BigEndian>().map_err(StorageError::Io)? as usize;
        let mut words = Vec::with_capacity(word_count);
        for _ in 0..word_count {
            words.push(reader.read_u64::<BigEndian>().map_err(StorageError::Io)?);
        }
        Self::from_parts(palette, bits, words)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::io::Cursor;

    #[test]
    fn test_width_for_palette_size() {
        assert_eq!(width_for(1), 1);
        assert_eq!(width_for(2), 1);
        assert_eq!(width_for(3), 2);
        assert_eq!(width_for(4), 2);
        assert_eq!(width_for(5), 3);
        assert_eq!(width_for(16), 4);
        // 2^4 = 16 < 17 <= 32 = 2^5
        assert_eq!(width_for(17), 5);
        assert_eq!(width_for(256), 8);
        assert_eq!(width_for(257), 9);
    }

    #[test]
    fn test_packed_array_spans_word_boundary() {
        // Width 5: cell 12 occupies bits 60..65, crossing into word 1.
        let mut packed = PackedArray::new(5, 64);
        packed.set(12, 0b10110);
        assert_eq!(packed.get(12), 0b10110);
        // Neighbours stay untouched.
        assert_eq!(packed.get(11), 0);
        assert_eq!(packed.get(13), 0);

        packed.set(11, 31);
        packed.set(13, 17);
        assert_eq!(packed.get(12), 0b10110);
        assert_eq!(packed.get(11), 31);
        assert_eq!(packed.get(13), 17);
    }

    #[test]
    fn test_packed_array_overwrite_clears_old_bits() {
        let mut packed = PackedArray::new(3, 100);
        packed.set(50, 0b111);
        packed.set(50, 0b001);
        assert_eq!(packed.get(50), 0b001);
    }

    #[test]
    fn test_build_assigns_first_seen_order() {
        let mut cells = vec![0u32; SECTION_VOLUME];
        cells[0] = 7;
        cells[1] = 3;
        cells[2] = 7;
        let storage = PalettedStorage::build(0, &cells);

        assert_eq!(storage.palette(), &[0, 7, 3]);
        assert_eq!(storage.width(), 2);
        assert_eq!(storage.get(0), 7);
        assert_eq!(storage.get(1), 3);
        assert_eq!(storage.get(2), 7);
        assert_eq!(storage.get(3), 0);
    }

    #[test]
    fn test_single_value_palette_still_uses_one_bit() {
        let storage = PalettedStorage::new(0);
        assert_eq!(storage.width(), 1);
        assert_eq!(storage.palette().len(), 1);
    }

    #[test]
    fn test_set_widens_indices() {
        let mut storage = PalettedStorage::new(0);
        for value in 1..=16u32 {
            storage.set(value as usize, value);
        }
        // 17 distinct values -> width 5.
        assert_eq!(storage.palette().len(), 17);
        assert_eq!(storage.width(), 5);
        for value in 1..=16u32 {
            assert_eq!(storage.get(value as usize), value);
        }
        assert_eq!(storage.get(100), 0);
    }

    #[test]
    fn test_compact_drops_unused_entries() {
        let mut storage = PalettedStorage::new(0);
        storage.set(0, 9);
        storage.set(1, 10);
        storage.set(2, 11);
        storage.set(0, 0);
        storage.set(1, 0);
        storage.set(2, 0);

        assert_eq!(storage.palette().len(), 4);
        assert!(storage.compact());
        assert_eq!(storage.palette(), &[0]);
        assert_eq!(storage.width(), 1);
        assert!(!storage.compact());
    }

    #[test]
    fn test_wire_round_trip() {
        let mut cells = vec![0u32; SECTION_VOLUME];
        for (i, cell) in cells.iter_mut().enumerate() {
            *cell = (i % 21) as u32;
        }
        let storage = PalettedStorage::build(0, &cells);

        let mut buffer = Vec::new();
        storage.write_to(&mut buffer).unwrap();
        let decoded = PalettedStorage::read_from(&mut Cursor::new(buffer)).unwrap();

        assert_eq!(decoded, storage);
    }

    #[test]
    fn test_decode_rejects_out_of_range_index() {
        let mut storage = PalettedStorage::new(0);
        storage.set(5, 4);
        let mut buffer = Vec::new();
        storage.write_to(&mut buffer).unwrap();

        // Shrink the palette length from 2 to 1 while an index still
        // references entry 1.
        buffer[4] = 1;
        buffer.drain(5..9);

        let result = PalettedStorage::read_from(&mut Cursor::new(buffer));
        assert_matches!(result, Err(StorageError::CorruptFormat(_)));
    }

    #[test]
    fn test_mapped_write_substitutes_palette_values() {
        let mut storage = PalettedStorage::new(0);
        storage.set(0, 42);

        let mut plain = Vec::new();
        storage.write_to(&mut plain).unwrap();
        let mut mapped = Vec::new();
        storage
            .write_mapped_to(&mut mapped, |v| if v == 42 { 1 } else { v })
            .unwrap();

        // Substitution only touches palette values, never the layout.
        assert_eq!(plain.len(), mapped.len());
        let decoded = PalettedStorage::read_from(&mut Cursor::new(mapped)).unwrap();
        assert_eq!(decoded.get(0), 1);
        assert_eq!(decoded.get(1), 0);
    }
}
