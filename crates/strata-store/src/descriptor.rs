use std::collections::HashMap;
use std::fs::File;
use std::path::Path;
use strata_common::{DimensionDescriptor, Result, StorageError};
use strata_nbt::{Tag, TagFile};
use strata_world::{FORMAT_VERSION_LEGACY, FORMAT_VERSION_SECTIONED};

/// World-level descriptor file inside the world directory.
pub const DESCRIPTOR_FILE: &str = "world.dat";
/// Directory holding the region files.
pub const REGION_DIR: &str = "region";

/// The once-per-world record: name, format-version marker, and the
/// dimension's vertical extent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorldDescriptor {
    pub name: String,
    pub version: i32,
    pub dimension: DimensionDescriptor,
}

impl WorldDescriptor {
    pub fn sectioned(name: String, dimension: DimensionDescriptor) -> Self {
        WorldDescriptor {
            name,
            version: FORMAT_VERSION_SECTIONED,
            dimension,
        }
    }

    pub fn legacy(name: String) -> Self {
        let dimension = DimensionDescriptor::legacy_flat("overworld".to_owned(), 0);
        WorldDescriptor {
            name,
            version: FORMAT_VERSION_LEGACY,
            dimension,
        }
    }

    pub fn to_tag(&self) -> Tag {
        let mut root = HashMap::new();
        root.insert("LevelName".to_string(), Tag::String(self.name.clone()));
        root.insert("version".to_string(), Tag::Int(self.version));
        root.insert(
            "dimensionName".to_string(),
            Tag::String(self.dimension.name.clone()),
        );
        root.insert("dimensionId".to_string(), Tag::Int(self.dimension.id));
        root.insert("minHeight".to_string(), Tag::Int(self.dimension.min_height));
        root.insert("maxHeight".to_string(), Tag::Int(self.dimension.max_height));
        // 0 means "derive from the height".
        root.insert(
            "chunkSectionCount".to_string(),
            Tag::Int(self.dimension.section_count.map(|c| c as i32).unwrap_or(0)),
        );
        Tag::Compound(root)
    }

    pub fn from_tag(tag: &Tag) -> Result<Self> {
        let root = tag.try_compound()?;
        let missing =
            |key: &str| StorageError::CorruptFormat(format!("world descriptor missing {}", key));

        let name = root
            .get("LevelName")
            .ok_or_else(|| missing("LevelName"))?
            .try_string()?
            .to_owned();
        let version = root
            .get("version")
            .ok_or_else(|| missing("version"))?
            .try_int()?;
        let dimension_name = root
            .get("dimensionName")
            .ok_or_else(|| missing("dimensionName"))?
            .try_string()?
            .to_owned();
        let dimension_id = root
            .get("dimensionId")
            .ok_or_else(|| missing("dimensionId"))?
            .try_int()?;
        let min_height = root
            .get("minHeight")
            .ok_or_else(|| missing("minHeight"))?
            .try_int()?;
        let max_height = root
            .get("maxHeight")
            .ok_or_else(|| missing("maxHeight"))?
            .try_int()?;
        let section_count = match root.get("chunkSectionCount") {
            Some(tag) => match tag.try_int()? {
                0 => None,
                count if count > 0 => Some(count as u32),
                count => {
                    return Err(StorageError::CorruptFormat(format!(
                        "negative section count {}",
                        count
                    )))
                }
            },
            None => None,
        };

        Ok(WorldDescriptor {
            name,
            version,
            dimension: DimensionDescriptor {
                name: dimension_name,
                id: dimension_id,
                min_height,
                max_height,
                section_count,
            },
        })
    }

    pub fn save(&self, world_dir: &Path) -> Result<()> {
        let mut file = File::create(world_dir.join(DESCRIPTOR_FILE))?;
        TagFile::new("Data".to_string(), self.to_tag()).write_gzip(&mut file)?;
        Ok(())
    }

    pub fn load(world_dir: &Path) -> Result<Self> {
        let mut file = File::open(world_dir.join(DESCRIPTOR_FILE))?;
        let tag_file = TagFile::read_gzip(&mut file)
            .map_err(|e| StorageError::CorruptFormat(format!("unreadable world descriptor: {}", e)))?;
        Self::from_tag(&tag_file.root)
    }
}

/// One-shot world bootstrap: creates the directory layout and writes the
/// descriptor. Never writes chunk data.
pub fn generate(world_dir: &Path, descriptor: &WorldDescriptor) -> Result<()> {
    std::fs::create_dir_all(world_dir.join(REGION_DIR))?;
    descriptor.save(world_dir)
}
