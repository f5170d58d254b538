//! In-memory chunk model and the codec between live chunks, the persisted
//! tag tree, and the compact paletted wire form sent to observers.

pub mod block_entity;
pub mod chunk;
pub mod codec;
pub mod encode;
pub mod palette;
pub mod section;

pub use block_entity::BlockEntity;
pub use chunk::{BiomeStore, Chunk};
pub use codec::{decode_persisted, encode_persisted, encode_wire, WirePayload};
pub use encode::{ObfuscationTable, SectionEncoder};
pub use palette::{PackedArray, PalettedStorage};
pub use section::Section;

/// Default cell value: air for block storages, the base biome for biome
/// storages. Palette index 0 always maps to it.
pub const DEFAULT_CELL: u32 = 0;

/// Persisted-format marker for the legacy flat-world layout.
pub const FORMAT_VERSION_LEGACY: i32 = 19133;
/// Persisted-format marker for the sectioned layout with explicit extent.
pub const FORMAT_VERSION_SECTIONED: i32 = 19134;
