use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use pcd_core::error::{Result, TilerError};
use pcd_core::format::RecordCodec;
use pcd_core::math::Aabb;
use pcd_core::pointcloud::{AttributeSchema, PointBatch};

use crate::{PointReader, DEFAULT_BATCH_SIZE};

/// Reader for the engine's own binary format. The format is headerless, so
/// the bounds, scale and schema of the original conversion must be supplied;
/// the point count falls out of the file length.
pub struct BinPointReader {
    source_name: String,
    file: BufReader<File>,
    codec: RecordCodec,
    aabb: Aabb,
    num_points: u64,
    batch_size: usize,
}

impl BinPointReader {
    pub fn new(path: &Path, schema: AttributeSchema, aabb: Aabb, scale: f64) -> Result<Self> {
        let source_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        let codec = RecordCodec::new(schema, aabb.min, scale);

        let file = File::open(path)
            .map_err(|e| TilerError::reader(&source_name, format!("open failed: {e}")))?;
        let length = file
            .metadata()
            .map_err(|e| TilerError::reader(&source_name, format!("stat failed: {e}")))?
            .len();
        let record = codec.bytes_per_point() as u64;
        if length % record != 0 {
            return Err(TilerError::reader(
                &source_name,
                format!("file length {length} is not a multiple of the {record}-byte record"),
            ));
        }

        Ok(Self {
            source_name,
            file: BufReader::new(file),
            codec,
            aabb,
            num_points: length / record,
            batch_size: DEFAULT_BATCH_SIZE,
        })
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn source_name(&self) -> &str {
        &self.source_name
    }
}

impl PointReader for BinPointReader {
    fn get_aabb(&self) -> Aabb {
        self.aabb
    }

    fn num_points(&self) -> u64 {
        self.num_points
    }

    fn read_point_batch(&mut self) -> Result<PointBatch> {
        self.codec
            .decode_records(&mut self.file, self.batch_size)
            .map_err(|e| TilerError::reader(&self.source_name, e.to_string()))
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}
