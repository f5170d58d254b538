//! Sector-allocated region files and the handle cache over them. One
//! region file stores up to 32x32 chunk payloads behind an 8 KiB location
//! and timestamp header.

pub mod cache;
pub mod file;

pub use cache::RegionCache;
pub use file::RegionFile;
