pub mod bin;
pub mod sources;

use pcd_core::error::Result;
use pcd_core::math::Aabb;
use pcd_core::pointcloud::PointBatch;

pub use bin::BinPointReader;
pub use sources::expand_sources;

/// Points handed to the tiler per call.
pub const DEFAULT_BATCH_SIZE: usize = 50_000;

/// Capability the tiling core consumes. Implementations for scan formats
/// (LAS/LAZ/PLY/PTX/XYZ) live outside this workspace; the internal binary
/// format reader below is enough to re-read a conversion.
pub trait PointReader {
    fn get_aabb(&self) -> Aabb;

    fn num_points(&self) -> u64;

    /// An empty batch signals end of stream.
    fn read_point_batch(&mut self) -> Result<PointBatch>;

    fn close(&mut self) -> Result<()>;
}
