use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, WriteBytesExt};

use pcd_core::error::{Result, TilerError};
use pcd_core::format::RecordCodec;
use pcd_core::math::Aabb;
use pcd_core::octree::NodeKey;
use pcd_core::pointcloud::PointBatch;

use crate::sidecar::CloudDescription;

/// One line of the tree index: a non-empty node, its total record count and
/// its cube.
#[derive(Debug, Clone)]
pub struct IndexEntry {
    pub key: NodeKey,
    pub point_count: u64,
    pub bounds: Aabb,
}

/// Append-only per-node binary storage under `<out_dir>/data`.
///
/// One file per non-empty node, named by the octal key string (root = `r`).
/// Each `store_points` call packs the whole batch into one buffer and lands
/// it with a single write, so a call is atomic with respect to record
/// boundaries. File handles are opened per call and never shared.
pub struct PointsPersistence {
    out_dir: PathBuf,
    data_dir: PathBuf,
    codec: RecordCodec,
}

impl PointsPersistence {
    pub fn new(out_dir: &Path, codec: RecordCodec) -> Result<Self> {
        let data_dir = out_dir.join("data");
        fs::create_dir_all(&data_dir)?;
        Ok(Self {
            out_dir: out_dir.to_path_buf(),
            data_dir,
            codec,
        })
    }

    pub fn out_dir(&self) -> &Path {
        &self.out_dir
    }

    pub fn codec(&self) -> &RecordCodec {
        &self.codec
    }

    fn node_path(&self, key: &NodeKey) -> PathBuf {
        self.data_dir.join(format!("{}.bin", key.file_stem()))
    }

    /// Append a batch to the node's file.
    pub fn store_points(&self, key: &NodeKey, batch: &PointBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut bytes = Vec::with_capacity(batch.len() * self.codec.bytes_per_point());
        self.codec.encode_batch(batch, &mut bytes)?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.node_path(key))?;
        file.write_all(&bytes)?;
        Ok(())
    }

    /// Load the full contents of one node file.
    pub fn load_points(&self, key: &NodeKey) -> Result<PointBatch> {
        let mut bytes = Vec::new();
        File::open(self.node_path(key))?.read_to_end(&mut bytes)?;
        Ok(self.codec.decode_all(&bytes)?)
    }

    /// Write the tree index and the `cloud.js` sidecar. Entries must arrive
    /// in canonical key order; reruns then produce byte-identical output.
    pub fn finalize(&self, entries: &[IndexEntry], cloud: &CloudDescription) -> Result<()> {
        debug_assert!(entries.windows(2).all(|w| w[0].key < w[1].key));

        let index_path = self.out_dir.join("index.bin");
        let mut out = BufWriter::new(File::create(&index_path)?);
        for entry in entries {
            let stem = entry.key.file_stem();
            out.write_u16::<LittleEndian>(stem.len() as u16)?;
            out.write_all(stem.as_bytes())?;
            out.write_u64::<LittleEndian>(entry.point_count)?;
            for axis in 0..3 {
                out.write_f64::<LittleEndian>(entry.bounds.min[axis])?;
            }
            for axis in 0..3 {
                out.write_f64::<LittleEndian>(entry.bounds.max[axis])?;
            }
        }
        out.flush()?;

        let cloud_path = self.out_dir.join("cloud.js");
        let json = serde_json::to_string_pretty(cloud)
            .map_err(|e| TilerError::Configuration(format!("cloud.js serialization: {e}")))?;
        fs::write(&cloud_path, json)?;

        log::info!(
            "finalized store: {} nodes, index at {:?}",
            entries.len(),
            index_path
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sidecar::BoundsJson;
    use pcd_core::pointcloud::{AttributeSchema, Point};

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "pcd-store-test-{}-{}",
            std::process::id(),
            name
        ));
        let _ = fs::remove_dir_all(&dir);
        dir
    }

    fn codec() -> RecordCodec {
        RecordCodec::new(AttributeSchema::position_only(), [0.0; 3], 0.001)
    }

    #[test]
    fn store_appends_and_load_round_trips() {
        let dir = temp_dir("append");
        let store = PointsPersistence::new(&dir, codec()).unwrap();
        let key = NodeKey::root().child(3);

        let mut first = PointBatch::new(AttributeSchema::position_only());
        first.push(Point::from_position([1.0, 2.0, 3.0]));
        let mut second = PointBatch::new(AttributeSchema::position_only());
        second.push(Point::from_position([4.0, 5.0, 6.0]));
        second.push(Point::from_position([7.0, 8.0, 9.0]));

        store.store_points(&key, &first).unwrap();
        store.store_points(&key, &second).unwrap();

        let loaded = store.load_points(&key).unwrap();
        assert_eq!(loaded.len(), 3);
        // Append order preserved.
        assert!((loaded.positions[0][0] - 1.0).abs() < 0.001);
        assert!((loaded.positions[2][2] - 9.0).abs() < 0.001);

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn empty_batch_creates_no_file() {
        let dir = temp_dir("empty");
        let store = PointsPersistence::new(&dir, codec()).unwrap();
        let key = NodeKey::root();
        store
            .store_points(&key, &PointBatch::new(AttributeSchema::position_only()))
            .unwrap();
        assert!(!dir.join("data").join("r.bin").exists());
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn finalize_writes_index_and_cloud_js() {
        let dir = temp_dir("finalize");
        let store = PointsPersistence::new(&dir, codec()).unwrap();
        let bounds = Aabb::new([0.0; 3], [1.0; 3]);
        let entries = vec![
            IndexEntry {
                key: NodeKey::root(),
                point_count: 10,
                bounds,
            },
            IndexEntry {
                key: NodeKey::root().child(2),
                point_count: 4,
                bounds: bounds.octant(2),
            },
        ];
        let cloud = CloudDescription {
            bounds: BoundsJson::from_aabb(&bounds),
            spacing: 0.5,
            scale: 0.001,
            attributes: vec!["POSITION_CARTESIAN".to_string()],
            hierarchy_step_size: 5,
            point_format: "BIN".to_string(),
            points: 14,
        };
        store.finalize(&entries, &cloud).unwrap();

        let index = fs::read(dir.join("index.bin")).unwrap();
        // "r" entry: 2 + 1 + 8 + 48; "r2" entry: 2 + 2 + 8 + 48.
        assert_eq!(index.len(), 59 + 60);
        assert!(dir.join("cloud.js").exists());
        let cloud_text = fs::read_to_string(dir.join("cloud.js")).unwrap();
        assert!(cloud_text.contains("\"hierarchy_step_size\": 5"));

        fs::remove_dir_all(&dir).unwrap();
    }
}
