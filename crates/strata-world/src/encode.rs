use rayon::prelude::*;
use rayon::ThreadPool;
use std::collections::HashSet;
use std::io;
use strata_common::{Result, StorageError};

use crate::palette::PalettedStorage;
use crate::section::Section;

/// Pre-sized destination for one block section; exceeds the packed size of
/// any realistic section so encodes never reallocate mid-flight.
pub const SECTION_BUFFER_SIZE: usize = 8192;
/// Pre-sized destination for one biome storage.
pub const BIOME_BUFFER_SIZE: usize = 5120;

/// Per-dimension obfuscation pass: the listed block values are written to
/// the wire as the stand-in value, hiding them from observers without
/// touching live chunk state.
#[derive(Debug, Clone)]
pub struct ObfuscationTable {
    hidden: HashSet<u32>,
    stand_in: u32,
}

impl ObfuscationTable {
    pub fn new(hidden: impl IntoIterator<Item = u32>, stand_in: u32) -> Self {
        ObfuscationTable {
            hidden: hidden.into_iter().collect(),
            stand_in,
        }
    }

    pub fn map(&self, value: u32) -> u32 {
        if self.hidden.contains(&value) {
            self.stand_in
        } else {
            value
        }
    }
}

/// Fans section encoding across a bounded worker pool and joins before
/// returning, concatenating per-section buffers in strict height order.
/// Observers diff successive wire snapshots, so ordering is part of the
/// contract.
pub struct SectionEncoder {
    pool: ThreadPool,
}

impl SectionEncoder {
    pub fn new(worker_budget: usize) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(worker_budget)
            .build()
            .map_err(|e| StorageError::InvalidArgument(format!("worker pool: {}", e)))?;
        Ok(SectionEncoder { pool })
    }

    /// Encodes each block section into its own pre-allocated buffer. The
    /// obfuscating variant is selected once for the whole call, never per
    /// section.
    pub fn encode_blocks(
        &self,
        sections: &[Section],
        obfuscation: Option<&ObfuscationTable>,
    ) -> Result<Vec<u8>> {
        match obfuscation {
            Some(table) => self.encode_each(sections, SECTION_BUFFER_SIZE, |section, buf| {
                section.write_obfuscated_to(buf, table)
            }),
            None => self.encode_each(sections, SECTION_BUFFER_SIZE, |section, buf| {
                section.write_to(buf)
            }),
        }
    }

    /// Encodes one biome storage per written section.
    pub fn encode_biomes(&self, storages: &[PalettedStorage]) -> Result<Vec<u8>> {
        self.encode_each(storages, BIOME_BUFFER_SIZE, |storage, buf| {
            storage.write_to(buf)
        })
    }

    /// The fan-out/join core: buffers are allocated up front on the calling
    /// thread, one encode task runs per item, and the join happens before
    /// concatenation so output order is deterministic.
    fn encode_each<T, F>(&self, items: &[T], buffer_size: usize, encode: F) -> Result<Vec<u8>>
    where
        T: Sync,
        F: Fn(&T, &mut Vec<u8>) -> io::Result<()> + Sync,
    {
        let mut buffers: Vec<Vec<u8>> = items
            .iter()
            .map(|_| Vec::with_capacity(buffer_size))
            .collect();

        self.pool.install(|| {
            buffers
                .par_iter_mut()
                .enumerate()
                .try_for_each(|(i, buffer)| encode(&items[i], buffer))
        })?;

        let total: usize = buffers.iter().map(|buffer| buffer.len()).sum();
        let mut out = Vec::with_capacity(total);
        for buffer in &buffers {
            out.extend_from_slice(buffer);
        }
        Ok(out)
    }
}
