use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use strata_common::{RegionPos, Result};

use crate::file::RegionFile;

/// Opens and retains region handles keyed by region coordinate. A single
/// most-recently-used slot is checked before the map lock: a simulation
/// loop touching chunks with spatial locality hits the same region almost
/// every time.
pub struct RegionCache {
    dir: PathBuf,
    regions: Mutex<HashMap<RegionPos, Arc<Mutex<RegionFile>>>>,
    last_used: Mutex<Option<(RegionPos, Arc<Mutex<RegionFile>>)>>,
}

impl RegionCache {
    pub fn new(dir: PathBuf) -> Self {
        RegionCache {
            dir,
            regions: Mutex::new(HashMap::new()),
            last_used: Mutex::new(None),
        }
    }

    pub fn dir(&self) -> &PathBuf {
        &self.dir
    }

    /// Returns the handle for `pos`, opening it lazily.
    pub fn get(&self, pos: RegionPos) -> Result<Arc<Mutex<RegionFile>>> {
        {
            let last = self.last_used.lock().unwrap();
            if let Some((last_pos, region)) = last.as_ref() {
                if *last_pos == pos {
                    return Ok(Arc::clone(region));
                }
            }
        }

        let mut regions = self.regions.lock().unwrap();
        let region = match regions.get(&pos) {
            Some(region) => Arc::clone(region),
            None => {
                let opened = Arc::new(Mutex::new(RegionFile::open(&self.dir, pos)?));
                regions.insert(pos, Arc::clone(&opened));
                opened
            }
        };
        *self.last_used.lock().unwrap() = Some((pos, Arc::clone(&region)));
        Ok(region)
    }

    /// Number of currently open region handles.
    pub fn open_count(&self) -> usize {
        self.regions.lock().unwrap().len()
    }

    /// Flushes and releases every open handle.
    pub fn close_all(&self) -> Result<()> {
        *self.last_used.lock().unwrap() = None;
        let mut regions = self.regions.lock().unwrap();
        for (_, region) in regions.drain() {
            region.lock().unwrap().flush()?;
        }
        Ok(())
    }
}
