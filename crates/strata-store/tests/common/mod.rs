use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use strata_common::DimensionDescriptor;
use strata_store::{generate, ChunkStore, WorldDescriptor};

static DIR_SEQ: AtomicU32 = AtomicU32::new(0);

pub fn temp_world_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "strata-integration-{}-{}-{}",
        tag,
        std::process::id(),
        DIR_SEQ.fetch_add(1, Ordering::Relaxed)
    ));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

/// Generates a sectioned world with the given vertical extent and returns
/// its directory.
pub fn sectioned_world(tag: &str, min_height: i32, max_height: i32) -> PathBuf {
    let dir = temp_world_dir(tag);
    let descriptor = WorldDescriptor::sectioned(
        "integration".to_owned(),
        DimensionDescriptor {
            name: "overworld".to_owned(),
            id: 0,
            min_height,
            max_height,
            section_count: None,
        },
    );
    generate(&dir, &descriptor).unwrap();
    dir
}

pub fn legacy_world(tag: &str) -> PathBuf {
    let dir = temp_world_dir(tag);
    generate(&dir, &WorldDescriptor::legacy("legacy".to_owned())).unwrap();
    dir
}

pub fn open_store(dir: &PathBuf) -> ChunkStore {
    ChunkStore::open_with_workers(dir, 2).unwrap()
}
