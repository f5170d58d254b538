use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};
use strata_common::Result;

use crate::encode::ObfuscationTable;
use crate::palette::{cell_index, PalettedStorage, SECTION_VOLUME};
use crate::DEFAULT_CELL;

/// One fixed-height 16x16x16 slice of a chunk: a value palette plus packed
/// cell indices, with a cached non-default cell count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    storage: PalettedStorage,
    non_default: u16,
}

impl Section {
    pub fn new() -> Self {
        Section {
            storage: PalettedStorage::new(DEFAULT_CELL),
            non_default: 0,
        }
    }

    pub fn from_storage(storage: PalettedStorage) -> Self {
        let non_default = (0..SECTION_VOLUME)
            .filter(|&cell| storage.get(cell) != DEFAULT_CELL)
            .count() as u16;
        Section {
            storage,
            non_default,
        }
    }

    pub fn get(&self, x: usize, y: usize, z: usize) -> u32 {
        self.storage.get(cell_index(x, z, y))
    }

    /// Returns true when the cell actually changed.
    pub fn set(&mut self, x: usize, y: usize, z: usize, value: u32) -> bool {
        let cell = cell_index(x, z, y);
        let old = self.storage.get(cell);
        if old == value {
            return false;
        }
        self.storage.set(cell, value);
        if old == DEFAULT_CELL {
            self.non_default += 1;
        } else if value == DEFAULT_CELL {
            self.non_default -= 1;
        }
        true
    }

    pub fn is_empty(&self) -> bool {
        self.non_default == 0
    }

    pub fn non_default_count(&self) -> u16 {
        self.non_default
    }

    pub fn storage(&self) -> &PalettedStorage {
        &self.storage
    }

    /// Drops palette entries no cell references and narrows the index
    /// width. Returns whether anything shrank.
    pub fn compress(&mut self) -> bool {
        self.storage.compact()
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_u16::<BigEndian>(self.non_default)?;
        self.storage.write_to(writer)
    }

    /// Obfuscating variant: hidden palette values are written as the
    /// table's stand-in; the live section is not touched.
    pub fn write_obfuscated_to<W: Write>(
        &self,
        writer: &mut W,
        table: &ObfuscationTable,
    ) -> io::Result<()> {
        writer.write_u16::<BigEndian>(self.non_default)?;
        self.storage.write_mapped_to(writer, |value| table.map(value))
    }

    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let non_default = reader.read_u16::<BigEndian>().map_err(strata_common::StorageError::Io)?;
        let storage = PalettedStorage::read_from(reader)?;
        Ok(Section {
            storage,
            non_default,
        })
    }
}

impl Default for Section {
    fn default() -> Self {
        Section::new()
    }
}
