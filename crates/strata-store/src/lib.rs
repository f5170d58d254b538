//! Top-level orchestration: the loaded-chunk map, load/create/save, the
//! incremental GC sweep, and the world descriptor bootstrap.

pub mod descriptor;
pub mod format;
pub mod store;

pub use descriptor::{generate, WorldDescriptor, DESCRIPTOR_FILE};
pub use format::WorldFormat;
pub use store::{ChunkStore, SweepStats};
