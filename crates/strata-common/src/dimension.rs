use once_cell::sync::Lazy;

/// World-level record of a dimension's vertical extent, read once at
/// world-open time and used to clip encoding output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DimensionDescriptor {
    pub name: String,
    pub id: i32,
    pub min_height: i32,
    pub max_height: i32,
    /// Explicit section count; defaults to `height() >> 4` when absent.
    pub section_count: Option<u32>,
}

/// Default descriptor for worlds created without one.
pub static OVERWORLD: Lazy<DimensionDescriptor> = Lazy::new(|| DimensionDescriptor {
    name: "overworld".to_owned(),
    id: 0,
    min_height: -64,
    max_height: 320,
    section_count: None,
});

impl DimensionDescriptor {
    /// Vertical extent of the legacy flat-world layout: 0..256, 16 sections,
    /// column biomes only.
    pub fn legacy_flat(name: String, id: i32) -> Self {
        DimensionDescriptor {
            name,
            id,
            min_height: 0,
            max_height: 256,
            section_count: Some(16),
        }
    }

    pub fn height(&self) -> i32 {
        self.max_height - self.min_height
    }

    pub fn section_count(&self) -> u32 {
        match self.section_count {
            Some(count) => count,
            None => (self.height() >> 4) as u32,
        }
    }

    /// Upper bound on subchunks a wire payload may carry.
    pub fn max_wire_sections(&self) -> u32 {
        (self.height() >> 4) as u32
    }
}
