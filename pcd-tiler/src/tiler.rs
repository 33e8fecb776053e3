use std::path::Path;
use std::sync::Arc;

use pcd_core::error::{Result, TilerError};
use pcd_core::format::RecordCodec;
use pcd_core::math::Aabb;
use pcd_core::pointcloud::{AttributeSchema, PointBatch};
use pcd_store::{BoundsJson, CloudDescription, IndexEntry, PointsPersistence};

use crate::algorithms::{make_algorithm, AlgorithmKind, TilingAlgorithm};
use crate::cache::PointsCache;
use crate::progress::ProgressReporter;
use crate::sampling::{self, SamplingKind};
use crate::taskgraph::{GraphExecutor, TaskGraph};
use crate::tree::{Octree, TilerParams};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Binary,
}

impl OutputFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputFormat::Binary => "BIN",
        }
    }
}

/// Everything the core recognizes. `spacing == 0` with a positive
/// `diagonal_fraction` derives the spacing from the cubic bounds; both zero
/// means no spacing constraint (capacity-only sampling).
#[derive(Debug, Clone)]
pub struct TilerConfig {
    pub spacing: f64,
    pub diagonal_fraction: f64,
    pub max_depth: u16,
    pub max_points_per_node: usize,
    pub scale: f64,
    pub output_format: OutputFormat,
    pub attributes: AttributeSchema,
    pub quality: SamplingKind,
    pub algorithm: AlgorithmKind,
    /// Worker pool size; 0 means the hardware thread count.
    pub concurrency: usize,
    pub max_memory_usage_mib: usize,
}

impl Default for TilerConfig {
    fn default() -> Self {
        Self {
            spacing: 0.0,
            diagonal_fraction: 200.0,
            max_depth: 20,
            max_points_per_node: 20_000,
            scale: 0.001,
            output_format: OutputFormat::Binary,
            attributes: AttributeSchema::position_only(),
            quality: SamplingKind::MinDistance,
            algorithm: AlgorithmKind::V1,
            concurrency: 0,
            max_memory_usage_mib: 2048,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TilerSummary {
    pub processed: u64,
    pub accepted: u64,
    pub rejected: u64,
}

const LEAF_SPILL_BYTES: u64 = 64 * 1024 * 1024;
const HIERARCHY_STEP_SIZE: u32 = 5;

/// The conversion driver: pulls nothing itself, but takes reader batches,
/// runs one task graph per batch on the worker pool, enforces the memory
/// budget and persists node payloads through the store.
pub struct Tiler {
    octree: Arc<Octree>,
    algorithm: Box<dyn TilingAlgorithm>,
    executor: GraphExecutor,
    cache: Arc<PointsCache>,
    persistence: PointsPersistence,
    progress: Arc<ProgressReporter>,
    params: TilerParams,
    mem_bytes_per_point: u64,
    max_memory_bytes: u64,
    leaf_spill_bytes: u64,
    spacing: f64,
    scale: f64,
    output_format: OutputFormat,
    processed: u64,
    rejected: u64,
}

impl Tiler {
    /// Validates the configuration, promotes the source bounds to a cube and
    /// opens the store. Fails before any point is read.
    pub fn new(
        config: TilerConfig,
        source_bounds: Aabb,
        out_dir: &Path,
        progress: Arc<ProgressReporter>,
    ) -> Result<Self> {
        if source_bounds.is_empty() {
            return Err(TilerError::Configuration(
                "source bounding box is empty".to_string(),
            ));
        }
        for axis in 0..3 {
            if !source_bounds.min[axis].is_finite() || !source_bounds.max[axis].is_finite() {
                return Err(TilerError::Configuration(
                    "source bounding box has non-finite coordinates".to_string(),
                ));
            }
        }
        if !(config.scale.is_finite() && config.scale > 0.0) {
            return Err(TilerError::Configuration(format!(
                "scale must be positive, got {}",
                config.scale
            )));
        }
        if config.max_points_per_node == 0 {
            return Err(TilerError::Configuration(
                "max_points_per_node must be at least 1".to_string(),
            ));
        }

        let mut cubic = source_bounds;
        cubic.make_cubic();

        let spacing = if config.spacing > 0.0 {
            config.spacing
        } else if config.diagonal_fraction > 0.0 {
            let derived = cubic.diagonal() / config.diagonal_fraction;
            log::info!("spacing calculated from diagonal: {derived}");
            derived
        } else {
            0.0
        };
        if !spacing.is_finite() || spacing < 0.0 {
            return Err(TilerError::Configuration(format!(
                "spacing resolved to {spacing}"
            )));
        }

        let concurrency = if config.concurrency > 0 {
            config.concurrency
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        };

        let params = TilerParams {
            spacing,
            max_depth: config.max_depth,
            max_points_per_node: config.max_points_per_node,
            concurrency,
        };

        let octree = Arc::new(Octree::new(
            config.attributes.clone(),
            cubic,
            spacing,
            config.quality,
            config.max_points_per_node,
        ));
        let cache = Arc::new(PointsCache::new());
        let algorithm = make_algorithm(
            config.algorithm,
            Arc::clone(&octree),
            Arc::clone(&cache),
            params,
            Arc::clone(&progress),
        );
        let executor = GraphExecutor::new(concurrency)?;
        let codec = RecordCodec::new(config.attributes.clone(), cubic.min, config.scale);
        let persistence = PointsPersistence::new(out_dir, codec)?;

        progress.register("indexing", 0);
        progress.register("flushing", 0);

        let max_memory_bytes = config.max_memory_usage_mib as u64 * 1024 * 1024;
        Ok(Self {
            mem_bytes_per_point: config.attributes.mem_bytes_per_point() as u64,
            max_memory_bytes,
            leaf_spill_bytes: LEAF_SPILL_BYTES.max(max_memory_bytes / 8),
            octree,
            algorithm,
            executor,
            cache,
            persistence,
            progress,
            params,
            spacing,
            scale: config.scale,
            output_format: config.output_format,
            processed: 0,
            rejected: 0,
        })
    }

    pub fn root_bounds(&self) -> &Aabb {
        self.octree.root_bounds()
    }

    /// Route one batch into the tree. Blocks while the batch's task graph
    /// runs; the first task error surfaces unchanged.
    pub fn add(&mut self, batch: PointBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        self.processed += batch.len() as u64;
        let batch = self.reject_degenerate(batch);
        if batch.is_empty() {
            return Ok(());
        }

        let mut graph = TaskGraph::new();
        let bounds = *self.octree.root_bounds();
        self.algorithm.build_execution_graph(batch, &bounds, &mut graph);
        let result = self.executor.run(graph);
        // Intermediate buffers are dropped between graphs, never during one.
        self.cache.clear();
        result
    }

    /// Drop points the sampler cannot handle, counting them as rejected.
    /// Sampling errors never fail the run.
    fn reject_degenerate(&mut self, batch: PointBatch) -> PointBatch {
        if batch
            .positions
            .iter()
            .all(|&p| sampling::check_position(p).is_ok())
        {
            return batch;
        }
        let mut kept = PointBatch::with_capacity(batch.schema().clone(), batch.len());
        for index in 0..batch.len() {
            match sampling::check_position(batch.positions[index]) {
                Ok(()) => kept.push_from(&batch, index),
                Err(error) => {
                    self.rejected += 1;
                    log::debug!("rejecting point: {error}");
                }
            }
        }
        log::warn!(
            "rejected {} degenerate points in this batch",
            batch.len() - kept.len()
        );
        kept
    }

    /// True once the resident payloads exceed the memory budget; the driver
    /// is expected to call `flush` at the next batch boundary.
    pub fn needs_flush(&self) -> bool {
        self.octree.resident_points() * self.mem_bytes_per_point > self.max_memory_bytes
    }

    /// Spill maximum-depth buckets that grew past the per-node threshold.
    /// Their append order is their acceptance order, so early spilling never
    /// changes file contents.
    pub fn process_store(&mut self) -> Result<()> {
        for (key, node) in self.octree.nodes_sorted() {
            if key.depth() < self.params.max_depth as usize {
                continue;
            }
            let mut state = node.lock().unwrap();
            let bytes = state.node.accepted.len() as u64 * self.mem_bytes_per_point;
            if bytes <= self.leaf_spill_bytes {
                continue;
            }
            let batch = std::mem::replace(
                &mut state.node.accepted,
                PointBatch::new(self.octree.schema().clone()),
            );
            self.persistence.store_points(&key, &batch)?;
            state.node.persisted = true;
            self.octree.sub_resident(batch.len() as u64);
        }
        Ok(())
    }

    /// Serialize every resident payload in canonical key order and drop the
    /// buffers. Topology and sampler state stay; later batches keep
    /// appending to the same node files.
    pub fn flush(&mut self) -> Result<()> {
        let resident = self.octree.resident_points();
        if resident == 0 {
            return Ok(());
        }
        log::info!("flushing {resident} resident points");
        self.progress.add("flushing", resident);

        for (key, node) in self.octree.nodes_sorted() {
            let mut state = node.lock().unwrap();
            if state.node.accepted.is_empty() {
                continue;
            }
            let batch = std::mem::replace(
                &mut state.node.accepted,
                PointBatch::new(self.octree.schema().clone()),
            );
            self.persistence.store_points(&key, &batch)?;
            state.node.persisted = true;
            self.octree.sub_resident(batch.len() as u64);
        }
        Ok(())
    }

    /// Final flush plus emission of the tree index and `cloud.js`.
    pub fn close(mut self) -> Result<TilerSummary> {
        self.flush()?;

        let entries: Vec<IndexEntry> = self
            .octree
            .index_entries()
            .into_iter()
            .map(|(key, point_count, bounds)| IndexEntry {
                key,
                point_count,
                bounds,
            })
            .collect();
        let cloud = CloudDescription {
            bounds: BoundsJson::from_aabb(self.octree.root_bounds()),
            spacing: self.spacing,
            scale: self.scale,
            attributes: self.octree.schema().names(),
            hierarchy_step_size: HIERARCHY_STEP_SIZE,
            point_format: self.output_format.as_str().to_string(),
            points: self.octree.num_accepted(),
        };
        self.persistence.finalize(&entries, &cloud)?;

        Ok(TilerSummary {
            processed: self.processed,
            accepted: self.octree.num_accepted(),
            rejected: self.rejected,
        })
    }

    pub fn num_processed(&self) -> u64 {
        self.processed
    }

    pub fn num_accepted(&self) -> u64 {
        self.octree.num_accepted()
    }

    pub fn num_rejected(&self) -> u64 {
        self.rejected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pcd_core::pointcloud::Point;
    use std::path::PathBuf;

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "pcd-tiler-test-{}-{}",
            std::process::id(),
            name
        ));
        let _ = std::fs::remove_dir_all(&dir);
        dir
    }

    fn small_config() -> TilerConfig {
        TilerConfig {
            spacing: 0.5,
            diagonal_fraction: 0.0,
            max_depth: 5,
            max_points_per_node: 8,
            concurrency: 2,
            ..TilerConfig::default()
        }
    }

    #[test]
    fn rejects_empty_bounds() {
        let dir = temp_dir("empty-bounds");
        let err = Tiler::new(
            small_config(),
            Aabb::empty(),
            &dir,
            Arc::new(ProgressReporter::new()),
        );
        assert!(matches!(err, Err(TilerError::Configuration(_))));
    }

    #[test]
    fn rejects_zero_scale() {
        let dir = temp_dir("zero-scale");
        let config = TilerConfig {
            scale: 0.0,
            ..small_config()
        };
        let err = Tiler::new(
            config,
            Aabb::new([0.0; 3], [1.0; 3]),
            &dir,
            Arc::new(ProgressReporter::new()),
        );
        assert!(matches!(err, Err(TilerError::Configuration(_))));
    }

    #[test]
    fn non_finite_points_are_rejected_not_fatal() {
        let dir = temp_dir("nan-points");
        let mut tiler = Tiler::new(
            small_config(),
            Aabb::new([0.0; 3], [1.0; 3]),
            &dir,
            Arc::new(ProgressReporter::new()),
        )
        .unwrap();

        let mut batch = PointBatch::new(AttributeSchema::position_only());
        batch.push(Point::from_position([0.5, 0.5, 0.5]));
        batch.push(Point::from_position([f64::NAN, 0.5, 0.5]));
        batch.push(Point::from_position([0.25, f64::INFINITY, 0.5]));
        tiler.add(batch).unwrap();

        assert_eq!(tiler.num_processed(), 3);
        assert_eq!(tiler.num_rejected(), 2);
        let summary = tiler.close().unwrap();
        assert_eq!(summary.accepted + summary.rejected, summary.processed);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn accepted_plus_rejected_equals_processed() {
        let dir = temp_dir("accounting");
        let mut tiler = Tiler::new(
            small_config(),
            Aabb::new([0.0; 3], [1.0; 3]),
            &dir,
            Arc::new(ProgressReporter::new()),
        )
        .unwrap();

        let mut batch = PointBatch::new(AttributeSchema::position_only());
        for i in 0..100 {
            let t = i as f64 / 100.0;
            batch.push(Point::from_position([t, (t * 13.0).fract(), 0.5]));
        }
        tiler.add(batch).unwrap();
        let summary = tiler.close().unwrap();
        assert_eq!(summary.processed, 100);
        assert_eq!(summary.accepted + summary.rejected, 100);

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
