pub mod coords;
pub mod dimension;
pub mod error;

pub use coords::{BlockPos, ChunkPos, RegionPos};
pub use dimension::DimensionDescriptor;
pub use error::{Result, StorageError};
