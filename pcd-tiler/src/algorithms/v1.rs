use std::sync::{Arc, Mutex};

use pcd_core::math::Aabb;
use pcd_core::octree::NodeKey;
use pcd_core::pointcloud::PointBatch;

use crate::algorithms::{process_node_recursive, TilingAlgorithm};
use crate::cache::PointsCache;
use crate::progress::ProgressReporter;
use crate::taskgraph::TaskGraph;
use crate::tree::{Octree, TilerParams};

/// Version 1 of the tiling algorithm:
///
/// - parallel indexing of root octants, one chunk per worker
/// - a single sequential scatter that groups the batch by root octant,
///   keeping the relative point order stable
/// - root-down recursion, each node dispatched as its own task
///
/// Simpler than V2 and with less scheduling overhead, at the cost of the
/// serialized scatter.
pub struct TilingAlgorithmV1 {
    octree: Arc<Octree>,
    cache: Arc<PointsCache>,
    params: TilerParams,
    progress: Arc<ProgressReporter>,
}

impl TilingAlgorithmV1 {
    pub fn new(
        octree: Arc<Octree>,
        cache: Arc<PointsCache>,
        params: TilerParams,
        progress: Arc<ProgressReporter>,
    ) -> Self {
        Self {
            octree,
            cache,
            params,
            progress,
        }
    }
}

impl TilingAlgorithm for TilingAlgorithmV1 {
    fn build_execution_graph(&self, batch: PointBatch, bounds: &Aabb, graph: &mut TaskGraph) {
        let total = batch.len();
        if total == 0 {
            return;
        }
        let points = self.cache.emplace(batch);
        let bounds = *bounds;

        let chunk_count = self.params.concurrency.min(total).max(1);
        let chunk_len = total.div_ceil(chunk_count);

        // Phase 1: each worker labels its chunk with root octants.
        let octant_labels: Arc<Vec<Mutex<Vec<u8>>>> =
            Arc::new((0..chunk_count).map(|_| Mutex::new(Vec::new())).collect());
        let mut index_tasks = Vec::with_capacity(chunk_count);
        for chunk in 0..chunk_count {
            let start = chunk * chunk_len;
            let end = ((chunk + 1) * chunk_len).min(total);
            let points = Arc::clone(&points);
            let labels = Arc::clone(&octant_labels);
            index_tasks.push(graph.submit(move |_| {
                let mut octants = Vec::with_capacity(end - start);
                for index in start..end {
                    octants.push(bounds.octant_of(points.positions[index]) as u8);
                }
                *labels[chunk].lock().unwrap() = octants;
                Ok(())
            }));
        }

        // Phase 2: one worker merges the labels and scatters the points into
        // a contiguous buffer grouped by root octant, then kicks off the
        // root-down recursion.
        let octree = Arc::clone(&self.octree);
        let cache = Arc::clone(&self.cache);
        let params = self.params;
        let progress = Arc::clone(&self.progress);
        let scatter = graph.submit(move |ctx| {
            let mut by_octant: [Vec<u32>; 8] = std::array::from_fn(|_| Vec::new());
            let mut offset = 0u32;
            for labels in octant_labels.iter() {
                let labels = labels.lock().unwrap();
                for (i, &octant) in labels.iter().enumerate() {
                    by_octant[octant as usize].push(offset + i as u32);
                }
                offset += labels.len() as u32;
            }

            let mut grouped = PointBatch::with_capacity(points.schema().clone(), total);
            for indices in &by_octant {
                for &index in indices {
                    grouped.push_from(&points, index as usize);
                }
            }
            progress.add("indexing", grouped.len() as u64);

            let grouped = cache.emplace(grouped);
            let octree = Arc::clone(&octree);
            let cache = Arc::clone(&cache);
            ctx.spawn(move |ctx| {
                process_node_recursive(ctx, octree, cache, NodeKey::root(), grouped, params)
            });
            Ok(())
        });
        for &index_task in &index_tasks {
            graph.precedes(index_task, scatter);
        }
    }
}
