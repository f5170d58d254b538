use std::collections::HashMap;
use strata_common::{BlockPos, Result, StorageError};
use strata_nbt::Tag;

/// Extra state attached to one block position, owned by the containing
/// chunk. Only spawnable entries are announced to observers; everything is
/// persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockEntity {
    pub pos: BlockPos,
    pub id: String,
    pub spawnable: bool,
    /// Entity-specific payload, excluding the position and id keys.
    pub data: HashMap<String, Tag>,
}

impl BlockEntity {
    pub fn new(pos: BlockPos, id: String, spawnable: bool) -> Self {
        BlockEntity {
            pos,
            id,
            spawnable,
            data: HashMap::new(),
        }
    }

    /// Tag subtree announced to observers.
    pub fn spawn_tag(&self) -> Tag {
        let mut compound = self.data.clone();
        compound.insert("x".to_string(), Tag::Int(self.pos.x));
        compound.insert("y".to_string(), Tag::Int(self.pos.y));
        compound.insert("z".to_string(), Tag::Int(self.pos.z));
        compound.insert("id".to_string(), Tag::String(self.id.clone()));
        Tag::Compound(compound)
    }

    /// Persisted tag subtree; carries the spawnable capability marker.
    pub fn to_tag(&self) -> Tag {
        let mut compound = self.data.clone();
        compound.insert("x".to_string(), Tag::Int(self.pos.x));
        compound.insert("y".to_string(), Tag::Int(self.pos.y));
        compound.insert("z".to_string(), Tag::Int(self.pos.z));
        compound.insert("id".to_string(), Tag::String(self.id.clone()));
        compound.insert("Spawnable".to_string(), Tag::Byte(self.spawnable as i8));
        Tag::Compound(compound)
    }

    pub fn from_tag(tag: &Tag) -> Result<Self> {
        let compound = tag.try_compound()?;
        let missing =
            |key: &str| StorageError::CorruptFormat(format!("block entity missing {}", key));

        let x = compound.get("x").ok_or_else(|| missing("x"))?.try_int()?;
        let y = compound.get("y").ok_or_else(|| missing("y"))?.try_int()?;
        let z = compound.get("z").ok_or_else(|| missing("z"))?.try_int()?;
        let id = compound
            .get("id")
            .ok_or_else(|| missing("id"))?
            .try_string()?
            .to_owned();
        let spawnable = match compound.get("Spawnable") {
            Some(tag) => tag.try_byte()? != 0,
            None => false,
        };

        let mut data = compound.clone();
        data.remove("x");
        data.remove("y");
        data.remove("z");
        data.remove("id");
        data.remove("Spawnable");

        Ok(BlockEntity {
            pos: BlockPos::new(x, y, z),
            id,
            spawnable,
            data,
        })
    }
}
