use std::fs;
use std::path::Path;

use serde::Serialize;

use pcd_core::error::{Result, TilerError};
use pcd_core::math::Aabb;

#[derive(Debug, Clone, Serialize)]
pub struct BoundsJson {
    pub min: [f64; 3],
    pub max: [f64; 3],
}

impl BoundsJson {
    pub fn from_aabb(aabb: &Aabb) -> Self {
        Self {
            min: aabb.min,
            max: aabb.max,
        }
    }
}

/// The `cloud.js` sidecar a viewer reads before requesting node files.
#[derive(Debug, Clone, Serialize)]
pub struct CloudDescription {
    pub bounds: BoundsJson,
    pub spacing: f64,
    pub scale: f64,
    pub attributes: Vec<String>,
    pub hierarchy_step_size: u32,
    pub point_format: String,
    pub points: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceEntry {
    pub name: String,
    pub points: u64,
    pub bounds: BoundsJson,
}

/// The `sources.json` sidecar: per input file, its name, point count and
/// bounds, plus the union bounds over all sources.
#[derive(Debug, Clone, Serialize)]
pub struct SourcesDescription {
    pub projection: String,
    pub bounds: BoundsJson,
    pub sources: Vec<SourceEntry>,
}

impl SourcesDescription {
    pub fn new(projection: String, sources: Vec<SourceEntry>) -> Self {
        let mut bounds = Aabb::empty();
        for source in &sources {
            bounds.update_point(source.bounds.min);
            bounds.update_point(source.bounds.max);
        }
        Self {
            projection,
            bounds: BoundsJson::from_aabb(&bounds),
            sources,
        }
    }
}

pub fn write_sources(out_dir: &Path, sources: &SourcesDescription) -> Result<()> {
    let json = serde_json::to_string(sources)
        .map_err(|e| TilerError::Configuration(format!("sources.json serialization: {e}")))?;
    fs::write(out_dir.join("sources.json"), json)?;
    Ok(())
}
