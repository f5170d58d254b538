use std::collections::HashMap;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use strata_common::{ChunkPos, Result, StorageError};
use strata_logger::log;
use strata_logger::severity::LogSeverity::{Debug, Warning};
use strata_nbt::Tag;
use strata_region::RegionCache;
use strata_world::{encode_wire, Chunk, ObfuscationTable, SectionEncoder, WirePayload};

use crate::descriptor::{WorldDescriptor, REGION_DIR};
use crate::format::WorldFormat;

/// Workers for the section-encoding fan-out unless the host chooses.
pub const DEFAULT_WORKER_BUDGET: usize = 4;

/// Result of one incremental GC pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepStats {
    pub visited: usize,
    pub compressed: usize,
    /// True when the cursor made it all the way around the loaded set.
    pub completed_lap: bool,
}

/// Owns the loaded-chunk map and drives load/create/save plus the
/// budgeted GC sweep. The map mutex guards structure only; per-chunk
/// locks carry the single-mutator discipline the simulation loop follows.
pub struct ChunkStore {
    world_dir: PathBuf,
    descriptor: WorldDescriptor,
    format: WorldFormat,
    regions: RegionCache,
    encoder: SectionEncoder,
    obfuscation: Option<ObfuscationTable>,
    chunks: Mutex<HashMap<ChunkPos, Arc<RwLock<Chunk>>>>,
    /// Rotating sweep position, persisted across gc_sweep calls.
    gc_cursor: Mutex<usize>,
}

impl ChunkStore {
    pub fn open(world_dir: &Path) -> Result<Self> {
        Self::open_with_workers(world_dir, DEFAULT_WORKER_BUDGET)
    }

    pub fn open_with_workers(world_dir: &Path, worker_budget: usize) -> Result<Self> {
        let descriptor = WorldDescriptor::load(world_dir)?;
        let format = WorldFormat::from_version(descriptor.version)?;
        let region_dir = world_dir.join(REGION_DIR);
        std::fs::create_dir_all(&region_dir)?;

        log(
            format!(
                "Opened world \"{}\" ({:?}, sections {})",
                descriptor.name,
                format,
                descriptor.dimension.section_count()
            ),
            Debug,
        );

        Ok(ChunkStore {
            world_dir: world_dir.to_path_buf(),
            descriptor,
            format,
            regions: RegionCache::new(region_dir),
            encoder: SectionEncoder::new(worker_budget)?,
            obfuscation: None,
            chunks: Mutex::new(HashMap::new()),
            gc_cursor: Mutex::new(0),
        })
    }

    pub fn world_dir(&self) -> &Path {
        &self.world_dir
    }

    pub fn descriptor(&self) -> &WorldDescriptor {
        &self.descriptor
    }

    pub fn format(&self) -> WorldFormat {
        self.format
    }

    /// Per-dimension obfuscation pass applied to every wire encode.
    pub fn set_obfuscation(&mut self, table: Option<ObfuscationTable>) {
        self.obfuscation = table;
    }

    pub fn loaded_count(&self) -> usize {
        self.chunks.lock().unwrap().len()
    }

    pub fn get(&self, x: i32, z: i32) -> Option<Arc<RwLock<Chunk>>> {
        self.chunks
            .lock()
            .unwrap()
            .get(&ChunkPos::new(x, z))
            .map(Arc::clone)
    }

    /// Loads a chunk from its region file, or hands back the live instance
    /// when already loaded. A corrupt payload counts as absent; with
    /// `create` set an empty chunk takes its place.
    pub fn load(&self, x: i32, z: i32, create: bool) -> Result<Option<Arc<RwLock<Chunk>>>> {
        let pos = ChunkPos::new(x, z);
        if let Some(chunk) = self.get(x, z) {
            return Ok(Some(chunk));
        }

        let region = self.regions.get(pos.region())?;
        let payload = region
            .lock()
            .unwrap()
            .read_chunk(pos.local_x(), pos.local_z())?;

        let decoded = match payload {
            Some(bytes) => match self.decode_chunk(&bytes, pos) {
                Ok(chunk) => Some(chunk),
                Err(StorageError::CorruptFormat(msg)) => {
                    log(
                        format!("Chunk {} could not be loaded: {}", pos, msg),
                        Warning,
                    );
                    None
                }
                Err(err) => return Err(err),
            },
            None => None,
        };

        let chunk = match decoded {
            Some(chunk) => chunk,
            None if create => self.format.new_chunk(pos, &self.descriptor.dimension),
            None => return Ok(None),
        };

        let mut chunks = self.chunks.lock().unwrap();
        let entry = chunks
            .entry(pos)
            .or_insert_with(|| Arc::new(RwLock::new(chunk)));
        Ok(Some(Arc::clone(entry)))
    }

    /// Creates (or returns) the chunk at the coordinate; never touches disk
    /// content that failed to decode.
    pub fn create(&self, x: i32, z: i32) -> Result<Arc<RwLock<Chunk>>> {
        Ok(self.load(x, z, true)?.expect("create always yields a chunk"))
    }

    fn decode_chunk(&self, bytes: &[u8], pos: ChunkPos) -> Result<Chunk> {
        let (_, tag) = Tag::read(&mut Cursor::new(bytes))
            .map_err(|e| StorageError::CorruptFormat(format!("unreadable chunk tag: {}", e)))?;
        self.format
            .load_chunk(&tag, pos, &self.descriptor.dimension)
    }

    /// Persists one loaded chunk. The in-memory instance is untouched on
    /// failure; previously saved sectors stay intact until the new payload
    /// has fully landed.
    pub fn save(&self, x: i32, z: i32) -> Result<()> {
        let pos = ChunkPos::new(x, z);
        let chunk = self.get(x, z).ok_or_else(|| {
            StorageError::InvalidArgument(format!("chunk {} is not loaded", pos))
        })?;

        let tag = {
            let guard = chunk.read().unwrap();
            self.format.save_chunk(&guard)
        };
        let mut bytes = Vec::new();
        tag.write(&mut bytes, "")?;

        let region = self.regions.get(pos.region())?;
        region
            .lock()
            .unwrap()
            .write_chunk(pos.local_x(), pos.local_z(), &bytes)?;

        chunk.write().unwrap().clear_dirty();
        Ok(())
    }

    /// Flushes every dirty chunk.
    pub fn save_all(&self) -> Result<()> {
        let dirty: Vec<ChunkPos> = {
            let chunks = self.chunks.lock().unwrap();
            chunks
                .iter()
                .filter(|(_, chunk)| chunk.read().unwrap().is_dirty())
                .map(|(&pos, _)| pos)
                .collect()
        };
        for pos in dirty {
            self.save(pos.x, pos.z)?;
        }
        Ok(())
    }

    /// Evicts a chunk, flushing it first when dirty. Returns whether a
    /// chunk was actually unloaded.
    pub fn unload(&self, x: i32, z: i32) -> Result<bool> {
        let pos = ChunkPos::new(x, z);
        let Some(chunk) = self.get(x, z) else {
            return Ok(false);
        };
        if chunk.read().unwrap().is_dirty() {
            self.save(x, z)?;
        }
        self.chunks.lock().unwrap().remove(&pos);
        Ok(true)
    }

    /// Drains the loaded map and closes every region handle.
    pub fn close(&self) -> Result<()> {
        self.save_all()?;
        self.chunks.lock().unwrap().clear();
        self.regions.close_all()
    }

    /// Wire-encodes a loaded chunk and reports the finished payload to the
    /// observer-facing collaborator.
    pub fn request_chunk<F>(&self, x: i32, z: i32, callback: F) -> Result<()>
    where
        F: FnOnce(&WirePayload),
    {
        let chunk = self.get(x, z).ok_or_else(|| {
            StorageError::InvalidArgument(format!("chunk ({}, {}) is not loaded", x, z))
        })?;

        let payload = {
            let guard = chunk.read().unwrap();
            encode_wire(
                &guard,
                &self.descriptor.dimension,
                &self.encoder,
                self.obfuscation.as_ref(),
            )?
        };
        callback(&payload);
        Ok(())
    }

    /// Incremental GC pass: visits loaded chunks from the saved cursor in
    /// a stable coordinate order, compressing each one that is generated
    /// and populated, and stops after a full lap or once the elapsed time
    /// exceeds the budget. Partial progress is fine; the cursor resumes
    /// next call.
    pub fn gc_sweep(&self, budget: Duration) -> SweepStats {
        let start = Instant::now();
        let loaded: Vec<(ChunkPos, Arc<RwLock<Chunk>>)> = {
            let chunks = self.chunks.lock().unwrap();
            let mut loaded: Vec<_> = chunks
                .iter()
                .map(|(&pos, chunk)| (pos, Arc::clone(chunk)))
                .collect();
            loaded.sort_by_key(|(pos, _)| *pos);
            loaded
        };

        let total = loaded.len();
        let mut cursor = self.gc_cursor.lock().unwrap();
        if total == 0 {
            *cursor = 0;
            return SweepStats {
                visited: 0,
                compressed: 0,
                completed_lap: true,
            };
        }
        if *cursor >= total {
            *cursor = 0;
        }

        let mut visited = 0;
        let mut compressed = 0;
        while visited < total {
            let (_, chunk) = &loaded[(*cursor + visited) % total];
            visited += 1;

            let mut guard = chunk.write().unwrap();
            if guard.is_generated() && guard.is_populated() {
                if guard.compress() {
                    compressed += 1;
                }
                if start.elapsed() >= budget {
                    break;
                }
            }
        }
        *cursor = (*cursor + visited) % total;

        SweepStats {
            visited,
            compressed,
            completed_lap: visited == total,
        }
    }
}
