use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use flate2::read::{GzDecoder, ZlibDecoder};
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use strata_common::{RegionPos, Result, StorageError};
use strata_logger::severity::LogSeverity::{Debug, Warning};
use strata_logger::{log, time};

/// Fixed on-disk allocation unit.
pub const SECTOR_SIZE: usize = 4096;
/// The location and timestamp tables occupy the first two sectors.
pub const HEADER_SECTORS: u32 = 2;
const TABLE_ENTRIES: usize = 1024;

pub const COMPRESSION_GZIP: u8 = 1;
pub const COMPRESSION_ZLIB: u8 = 2;

/// The largest payload one table entry can address.
const MAX_SECTORS_PER_CHUNK: usize = 255;

#[derive(Debug, Clone, Copy, Default)]
struct Location {
    /// First sector of the payload, counted from the file start.
    offset: u32,
    /// Allocated run length in sectors; 0 marks the chunk absent.
    count: u8,
}

impl Location {
    fn is_present(&self) -> bool {
        self.count != 0
    }
}

/// One 32x32-chunk area of the world backed by a single sector-allocated
/// file. All access goes through the owning cache's per-region lock; two
/// different regions never contend.
pub struct RegionFile {
    pos: RegionPos,
    path: PathBuf,
    file: File,
    locations: Vec<Location>,
    timestamps: Vec<u32>,
    /// One flag per sector in the file; the header sectors stay used.
    used_sectors: Vec<bool>,
}

impl RegionFile {
    /// Opens (creating if needed) the region file for `pos` inside `dir`.
    /// Malformed table entries are dropped so one bad chunk never takes
    /// the region down.
    pub fn open(dir: &Path, pos: RegionPos) -> Result<Self> {
        let path = dir.join(pos.file_name());
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        let len = file.metadata()?.len();
        let mut region = RegionFile {
            pos,
            path,
            file,
            locations: vec![Location::default(); TABLE_ENTRIES],
            timestamps: vec![0; TABLE_ENTRIES],
            used_sectors: vec![true; HEADER_SECTORS as usize],
        };

        if len < (HEADER_SECTORS as u64) * SECTOR_SIZE as u64 {
            // Fresh or truncated-below-header file: start over with an
            // empty table.
            region.file.set_len((HEADER_SECTORS as u64) * SECTOR_SIZE as u64)?;
            region.write_full_header()?;
            log(format!("Created region file {}", region.pos), Debug);
            return Ok(region);
        }

        region.load_header(len)?;
        Ok(region)
    }

    fn load_header(&mut self, file_len: u64) -> Result<()> {
        let total_sectors = (file_len as usize + SECTOR_SIZE - 1) / SECTOR_SIZE;
        self.used_sectors = vec![false; total_sectors.max(HEADER_SECTORS as usize)];
        self.used_sectors[0] = true;
        self.used_sectors[1] = true;

        self.file.seek(SeekFrom::Start(0))?;
        let mut raw_locations = [0u32; TABLE_ENTRIES];
        for entry in raw_locations.iter_mut() {
            *entry = self.file.read_u32::<BigEndian>()?;
        }
        for stamp in self.timestamps.iter_mut() {
            *stamp = self.file.read_u32::<BigEndian>()?;
        }

        for (index, &raw) in raw_locations.iter().enumerate() {
            let location = Location {
                offset: raw >> 8,
                count: (raw & 0xFF) as u8,
            };
            if !location.is_present() {
                continue;
            }
            if self.claim_run(location).is_err() {
                // Overlapping or out-of-range run: the chunk is treated as
                // absent, not as a region failure.
                log(
                    format!(
                        "Dropping corrupt sector table entry {} in region {}",
                        index, self.pos
                    ),
                    Warning,
                );
                self.write_table_entry(index, Location::default())?;
                continue;
            }
            self.locations[index] = location;
        }
        Ok(())
    }

    /// Marks a run used, failing on overlap or range violations.
    fn claim_run(&mut self, location: Location) -> Result<()> {
        let start = location.offset as usize;
        let end = start + location.count as usize;
        if start < HEADER_SECTORS as usize || end > self.used_sectors.len() {
            return Err(StorageError::CorruptFormat(format!(
                "sector run {}..{} outside region file",
                start, end
            )));
        }
        if self.used_sectors[start..end].iter().any(|&used| used) {
            return Err(StorageError::CorruptFormat(format!(
                "sector run {}..{} overlaps another chunk",
                start, end
            )));
        }
        for sector in start..end {
            self.used_sectors[sector] = true;
        }
        Ok(())
    }

    fn release_run(&mut self, location: Location) {
        let start = location.offset as usize;
        let end = start + location.count as usize;
        for sector in start..end.min(self.used_sectors.len()) {
            self.used_sectors[sector] = false;
        }
    }

    pub fn pos(&self) -> RegionPos {
        self.pos
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Last-modified unix timestamp of a stored chunk, if present.
    pub fn timestamp(&self, local_x: u32, local_z: u32) -> Option<u32> {
        let index = table_index(local_x, local_z);
        if self.locations[index].is_present() {
            Some(self.timestamps[index])
        } else {
            None
        }
    }

    /// Reads and decompresses one chunk payload. A corrupted entry or
    /// payload yields `Ok(None)`: the chunk is absent, the region lives on.
    pub fn read_chunk(&mut self, local_x: u32, local_z: u32) -> Result<Option<Vec<u8>>> {
        let index = table_index(local_x, local_z);
        let location = self.locations[index];
        if !location.is_present() {
            return Ok(None);
        }

        self.file
            .seek(SeekFrom::Start(location.offset as u64 * SECTOR_SIZE as u64))?;
        let length = self.file.read_u32::<BigEndian>()? as usize;
        let available = location.count as usize * SECTOR_SIZE - 4;
        if length == 0 || length > available {
            log(
                format!(
                    "Chunk ({}, {}) in region {} has invalid payload length {}",
                    local_x, local_z, self.pos, length
                ),
                Warning,
            );
            return Ok(None);
        }

        let scheme = self.file.read_u8()?;
        let mut compressed = vec![0u8; length - 1];
        self.file.read_exact(&mut compressed)?;

        match decompress(scheme, &compressed) {
            Ok(payload) => Ok(Some(payload)),
            Err(_) => {
                log(
                    format!(
                        "Chunk ({}, {}) in region {} failed to decompress (scheme {})",
                        local_x, local_z, self.pos, scheme
                    ),
                    Warning,
                );
                Ok(None)
            }
        }
    }

    /// Compresses and stores one chunk payload. The data lands in fresh or
    /// already-owned sectors and is flushed before the table entry moves,
    /// so an interrupted save leaves the previous payload readable.
    pub fn write_chunk(&mut self, local_x: u32, local_z: u32, payload: &[u8]) -> Result<()> {
        let index = table_index(local_x, local_z);

        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(payload)?;
        let compressed = encoder.finish()?;

        let total = 4 + 1 + compressed.len();
        let sectors_needed = (total + SECTOR_SIZE - 1) / SECTOR_SIZE;
        if sectors_needed > MAX_SECTORS_PER_CHUNK {
            return Err(StorageError::InvalidArgument(format!(
                "chunk payload of {} sectors exceeds the region limit",
                sectors_needed
            )));
        }
        let sectors_needed = sectors_needed as u8;

        let old = self.locations[index];
        let new_location;
        if old.is_present() && old.count >= sectors_needed {
            // Reuse in place, freeing any excess sectors of the old run.
            new_location = Location {
                offset: old.offset,
                count: sectors_needed,
            };
            self.write_payload(new_location, &compressed)?;
            self.update_entry(index, new_location)?;
            self.release_run(Location {
                offset: old.offset + sectors_needed as u32,
                count: old.count - sectors_needed,
            });
        } else {
            // Relocate: the old run stays allocated until the new payload
            // and table entry have fully landed.
            let offset = self.allocate_run(sectors_needed);
            new_location = Location {
                offset,
                count: sectors_needed,
            };
            self.write_payload(new_location, &compressed)?;
            self.update_entry(index, new_location)?;
            if old.is_present() {
                self.release_run(old);
            }
        }
        Ok(())
    }

    /// First-fit search over the free-sector bitmap; grows the file when
    /// no existing run is wide enough.
    fn allocate_run(&mut self, count: u8) -> u32 {
        let needed = count as usize;
        let mut run_start = None;
        let mut run_len = 0;
        for sector in HEADER_SECTORS as usize..self.used_sectors.len() {
            if self.used_sectors[sector] {
                run_start = None;
                run_len = 0;
                continue;
            }
            if run_start.is_none() {
                run_start = Some(sector);
            }
            run_len += 1;
            if run_len == needed {
                let start = run_start.unwrap();
                for used in &mut self.used_sectors[start..start + needed] {
                    *used = true;
                }
                return start as u32;
            }
        }

        let start = self.used_sectors.len();
        self.used_sectors.resize(start + needed, true);
        start as u32
    }

    fn write_payload(&mut self, location: Location, compressed: &[u8]) -> Result<()> {
        self.file
            .seek(SeekFrom::Start(location.offset as u64 * SECTOR_SIZE as u64))?;
        self.file
            .write_u32::<BigEndian>((compressed.len() + 1) as u32)?;
        self.file.write_u8(COMPRESSION_ZLIB)?;
        self.file.write_all(compressed)?;

        let written = 4 + 1 + compressed.len();
        let padding = location.count as usize * SECTOR_SIZE - written;
        if padding > 0 {
            self.file.write_all(&vec![0u8; padding])?;
        }
        self.file.sync_data()?;
        Ok(())
    }

    fn update_entry(&mut self, index: usize, location: Location) -> Result<()> {
        self.write_table_entry(index, location)?;
        self.locations[index] = location;

        let stamp = time::unix_timestamp() as u32;
        self.file
            .seek(SeekFrom::Start((SECTOR_SIZE + index * 4) as u64))?;
        self.file.write_u32::<BigEndian>(stamp)?;
        self.timestamps[index] = stamp;
        Ok(())
    }

    fn write_table_entry(&mut self, index: usize, location: Location) -> Result<()> {
        self.file.seek(SeekFrom::Start((index * 4) as u64))?;
        self.file
            .write_u32::<BigEndian>(location.offset << 8 | location.count as u32)?;
        Ok(())
    }

    fn write_full_header(&mut self) -> Result<()> {
        self.file.seek(SeekFrom::Start(0))?;
        let zeros = vec![0u8; HEADER_SECTORS as usize * SECTOR_SIZE];
        self.file.write_all(&zeros)?;
        Ok(())
    }

    /// Flushes buffered writes through to the file system.
    pub fn flush(&mut self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

fn table_index(local_x: u32, local_z: u32) -> usize {
    debug_assert!(local_x < 32 && local_z < 32);
    (local_x + local_z * 32) as usize
}

fn decompress(scheme: u8, compressed: &[u8]) -> Result<Vec<u8>> {
    let mut payload = Vec::new();
    match scheme {
        COMPRESSION_GZIP => {
            GzDecoder::new(compressed).read_to_end(&mut payload)?;
        }
        COMPRESSION_ZLIB => {
            ZlibDecoder::new(compressed).read_to_end(&mut payload)?;
        }
        other => {
            return Err(StorageError::CorruptFormat(format!(
                "unknown compression scheme {}",
                other
            )));
        }
    }
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU32, Ordering};

    static DIR_SEQ: AtomicU32 = AtomicU32::new(0);

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "strata-region-{}-{}-{}",
            tag,
            std::process::id(),
            DIR_SEQ.fetch_add(1, Ordering::Relaxed)
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    /// Bytes that zlib cannot shrink much, to pin sector counts.
    fn noise(len: usize) -> Vec<u8> {
        let mut state = 0x2545f491u32;
        (0..len)
            .map(|_| {
                state = state.wrapping_mul(1664525).wrapping_add(1013904223);
                (state >> 24) as u8
            })
            .collect()
    }

    #[test]
    fn test_read_missing_chunk() {
        let dir = temp_dir("missing");
        let mut region = RegionFile::open(&dir, RegionPos::new(0, 0)).unwrap();
        assert_eq!(region.read_chunk(5, 5).unwrap(), None);
        assert_eq!(region.timestamp(5, 5), None);
    }

    #[test]
    fn test_write_then_read_round_trip() {
        let dir = temp_dir("roundtrip");
        let payload = noise(10_000);
        {
            let mut region = RegionFile::open(&dir, RegionPos::new(1, -1)).unwrap();
            region.write_chunk(3, 7, &payload).unwrap();
            assert_eq!(region.read_chunk(3, 7).unwrap(), Some(payload.clone()));
            assert!(region.timestamp(3, 7).is_some());
        }
        // Survives reopen.
        let mut region = RegionFile::open(&dir, RegionPos::new(1, -1)).unwrap();
        assert_eq!(region.read_chunk(3, 7).unwrap(), Some(payload));
    }

    #[test]
    fn test_shrinking_write_frees_sectors_for_reuse() {
        let dir = temp_dir("reuse");
        let mut region = RegionFile::open(&dir, RegionPos::new(0, 0)).unwrap();

        // ~3 sectors, then shrink to 1.
        region.write_chunk(0, 0, &noise(10_000)).unwrap();
        let grown = std::fs::metadata(region.path()).unwrap().len();
        region.write_chunk(0, 0, &noise(100)).unwrap();

        // A two-sector payload for another chunk fits into the freed run
        // without growing the file.
        region.write_chunk(1, 0, &noise(6_000)).unwrap();
        let after = std::fs::metadata(region.path()).unwrap().len();
        assert_eq!(after, grown);

        assert_eq!(region.read_chunk(0, 0).unwrap(), Some(noise(100)));
        assert_eq!(region.read_chunk(1, 0).unwrap(), Some(noise(6_000)));
    }

    #[test]
    fn test_relocating_write_grows_file_once() {
        let dir = temp_dir("grow");
        let mut region = RegionFile::open(&dir, RegionPos::new(0, 0)).unwrap();

        region.write_chunk(4, 4, &noise(2_000)).unwrap();
        region.write_chunk(4, 4, &noise(9_000)).unwrap();
        assert_eq!(region.read_chunk(4, 4).unwrap(), Some(noise(9_000)));

        // The single-sector run freed by the relocation is reused.
        region.write_chunk(5, 4, &noise(2_000)).unwrap();
        let len = std::fs::metadata(region.path()).unwrap().len();
        region.write_chunk(6, 4, &noise(2_000)).unwrap();
        assert!(std::fs::metadata(region.path()).unwrap().len() > len);
        assert_eq!(region.read_chunk(5, 4).unwrap(), Some(noise(2_000)));
    }

    #[test]
    fn test_corrupt_table_entry_is_treated_as_absent() {
        let dir = temp_dir("corrupt");
        let path;
        {
            let mut region = RegionFile::open(&dir, RegionPos::new(0, 0)).unwrap();
            region.write_chunk(0, 0, &noise(500)).unwrap();
            path = region.path().to_path_buf();
        }

        // Point the entry at a run far beyond the end of the file.
        let mut file = OpenOptions::new().write(true).open(&path).unwrap();
        file.seek(SeekFrom::Start(0)).unwrap();
        file.write_u32::<BigEndian>(9_999 << 8 | 8).unwrap();
        file.sync_all().unwrap();

        let mut region = RegionFile::open(&dir, RegionPos::new(0, 0)).unwrap();
        assert_eq!(region.read_chunk(0, 0).unwrap(), None);
        // The slot is usable again.
        region.write_chunk(0, 0, &noise(300)).unwrap();
        assert_eq!(region.read_chunk(0, 0).unwrap(), Some(noise(300)));
    }

    #[test]
    fn test_overlapping_entries_drop_the_second() {
        let dir = temp_dir("overlap");
        let path;
        {
            let mut region = RegionFile::open(&dir, RegionPos::new(0, 0)).unwrap();
            region.write_chunk(0, 0, &noise(500)).unwrap();
            path = region.path().to_path_buf();
        }

        // Forge a second entry claiming the same sector run.
        let mut file = OpenOptions::new().write(true).open(&path).unwrap();
        file.seek(SeekFrom::Start(4)).unwrap();
        file.write_u32::<BigEndian>(2 << 8 | 1).unwrap();
        file.sync_all().unwrap();

        let mut region = RegionFile::open(&dir, RegionPos::new(0, 0)).unwrap();
        assert!(region.read_chunk(0, 0).unwrap().is_some());
        assert_eq!(region.read_chunk(1, 0).unwrap(), None);
    }

    #[test]
    fn test_gzip_payloads_are_readable() {
        use flate2::write::GzEncoder;

        let dir = temp_dir("gzip");
        let payload = b"legacy gzip chunk payload".to_vec();
        let path;
        {
            let mut region = RegionFile::open(&dir, RegionPos::new(0, 0)).unwrap();
            region.write_chunk(2, 2, b"placeholder").unwrap();
            path = region.path().to_path_buf();
        }

        // Rewrite the stored payload in the older gzip scheme.
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&payload).unwrap();
        let compressed = encoder.finish().unwrap();

        let mut file = OpenOptions::new().write(true).open(&path).unwrap();
        let index = table_index(2, 2) as u64;
        let mut raw = [0u8; 4];
        {
            let mut read_file = File::open(&path).unwrap();
            read_file.seek(SeekFrom::Start(index * 4)).unwrap();
            read_file.read_exact(&mut raw).unwrap();
        }
        let offset = u32::from_be_bytes(raw) >> 8;
        file.seek(SeekFrom::Start(offset as u64 * SECTOR_SIZE as u64))
            .unwrap();
        file.write_u32::<BigEndian>((compressed.len() + 1) as u32)
            .unwrap();
        file.write_u8(COMPRESSION_GZIP).unwrap();
        file.write_all(&compressed).unwrap();
        file.sync_all().unwrap();

        let mut region = RegionFile::open(&dir, RegionPos::new(0, 0)).unwrap();
        assert_eq!(region.read_chunk(2, 2).unwrap(), Some(payload));
    }
}
