use std::sync::{Arc, Mutex};

use pcd_core::error::TilerError;
use pcd_core::math::Aabb;
use pcd_core::octree::NodeKey;
use pcd_core::pointcloud::PointBatch;

use crate::algorithms::{filter_node_batch, process_node_recursive, TilingAlgorithm};
use crate::cache::PointsCache;
use crate::progress::ProgressReporter;
use crate::taskgraph::{TaskGraph, TaskHandle};
use crate::tree::{Octree, TilerParams};

type Slot = Mutex<Option<Arc<PointBatch>>>;

/// Version 2 of the tiling algorithm, parallel map/reduce throughout:
///
/// - parallel indexing of every point to its node path at a target depth
///   chosen so at least `concurrency` nodes can be worked on at once
/// - parallel counting-sort scatter into per-node contiguous buffers,
///   without a serial merge step
/// - a reduction over the ancestor levels: one task per occupied ancestor,
///   parent before children, siblings on disjoint prefix regions
/// - independent per-node refinement below the target depth
///
/// Intermediate buffers live in the `PointsCache` across tasks.
pub struct TilingAlgorithmV2 {
    octree: Arc<Octree>,
    cache: Arc<PointsCache>,
    params: TilerParams,
    progress: Arc<ProgressReporter>,
}

impl TilingAlgorithmV2 {
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

/// Smallest depth whose node count covers the desired parallelism,
/// bounded so the task count stays sane.
fn target_depth(desired_parallelism: usize) -> usize {
    let mut depth = 0;
    while 8usize.pow(depth as u32) < desired_parallelism && depth < 4 {
        depth += 1;
    }
    depth
}

/// Base-8 node index of a point at `depth` below `bounds`. The first octant
/// is the most significant digit, so indices sort like key paths and every
/// path prefix owns a contiguous index range.
fn node_index_at_depth(bounds: &Aabb, position: [f64; 3], depth: usize) -> usize {
    let mut aabb = *bounds;
    let mut index = 0;
    for _ in 0..depth {
        let octant = aabb.octant_of(position);
        index = index * 8 + octant;
        aabb = aabb.octant(octant);
    }
    index
}

/// Key of the node with base-8 index `index` at `depth`.
fn key_at(depth: usize, index: usize) -> NodeKey {
    let mut key = NodeKey::root();
    for shift in (0..depth).rev() {
        key = key.child(((index >> (3 * shift)) & 7) as u8);
    }
    key
}

/// Sample one ancestor node from the slot range it owns. Accepted points
/// move into the node; the survivors replace their slot so the next level
/// sees only what remains.
fn ancestor_sample(
    octree: &Arc<Octree>,
    cache: &Arc<PointsCache>,
    slots: &[Slot],
    key: &NodeKey,
    params: &TilerParams,
) -> Result<(), TilerError> {
    // Nothing under this prefix: don't materialize the node.
    if !slots.iter().any(|slot| slot.lock().unwrap().is_some()) {
        return Ok(());
    }
    let node = octree.node(key);
    let mut state = node.lock().unwrap();
    let mut accepted = 0u64;
    for slot in slots {
        let mut slot = slot.lock().unwrap();
        let Some(points) = slot.take() else {
            continue;
        };
        if state.node.accepted_total >= params.max_points_per_node as u64 {
            *slot = Some(points);
            continue;
        }
        let mut kept = PointBatch::with_capacity(points.schema().clone(), points.len());
        accepted += filter_node_batch(&mut state, &points, params, &mut kept);
        if !kept.is_empty() {
            *slot = Some(cache.emplace(kept));
        }
    }
    drop(state);
    octree.record_accepted(accepted);
    Ok(())
}

impl TilingAlgorithm for TilingAlgorithmV2 {
    fn build_execution_graph(&self, batch: PointBatch, bounds: &Aabb, graph: &mut TaskGraph) {
        let total = batch.len();
        if total == 0 {
            return;
        }

        let depth = target_depth(self.params.concurrency).min(self.params.max_depth as usize);
        if depth == 0 {
            // Not enough parallelism to be worth partitioning; a single
            // root-down recursion handles the batch.
            let points = self.cache.emplace(batch);
            let octree = Arc::clone(&self.octree);
            let cache = Arc::clone(&self.cache);
            let params = self.params;
            self.progress.add("indexing", total as u64);
            graph.submit(move |ctx| {
                process_node_recursive(ctx, octree, cache, NodeKey::root(), points, params)
            });
            return;
        }

        let node_count = 8usize.pow(depth as u32);
        let points = self.cache.emplace(batch);
        let bounds = *bounds;

        // Phase 1: label every point with its target-depth node index. Each
        // chunk records, per node, the point indices it contributes, in
        // order; this doubles as the per-chunk count matrix of the
        // counting sort.
        let chunk_count = self.params.concurrency.min(total).max(1);
        let chunk_len = total.div_ceil(chunk_count);
        let labels: Arc<Vec<Mutex<Vec<Vec<u32>>>>> =
            Arc::new((0..chunk_count).map(|_| Mutex::new(Vec::new())).collect());
        let mut index_tasks = Vec::with_capacity(chunk_count);
        for chunk in 0..chunk_count {
            let start = chunk * chunk_len;
            let end = ((chunk + 1) * chunk_len).min(total);
            let points = Arc::clone(&points);
            let labels = Arc::clone(&labels);
            index_tasks.push(graph.submit(move |_| {
                let mut per_node = vec![Vec::new(); node_count];
                for index in start..end {
                    let node = node_index_at_depth(&bounds, points.positions[index], depth);
                    per_node[node].push(index as u32);
                }
                *labels[chunk].lock().unwrap() = per_node;
                Ok(())
            }));
        }

        // Phase 2: parallel scatter. One task per target node gathers its
        // contiguous buffer by walking the chunks in order, which keeps the
        // within-node point order stable.
        let slots: Arc<Vec<Slot>> = Arc::new((0..node_count).map(|_| Mutex::new(None)).collect());
        let mut scatter_tasks = Vec::with_capacity(node_count);
        for node in 0..node_count {
            let points = Arc::clone(&points);
            let labels = Arc::clone(&labels);
            let slots = Arc::clone(&slots);
            let cache = Arc::clone(&self.cache);
            let progress = Arc::clone(&self.progress);
            let handle = graph.submit(move |_| {
                let mut gathered = PointBatch::new(points.schema().clone());
                for chunk_labels in labels.iter() {
                    let chunk_labels = chunk_labels.lock().unwrap();
                    for &index in &chunk_labels[node] {
                        gathered.push_from(&points, index as usize);
                    }
                }
                if !gathered.is_empty() {
                    progress.add("indexing", gathered.len() as u64);
                    *slots[node].lock().unwrap() = Some(cache.emplace(gathered));
                }
                Ok(())
            });
            for &index_task in &index_tasks {
                graph.precedes(index_task, handle);
            }
            scatter_tasks.push(handle);
        }

        // Phase 3: the reduction over ancestor levels. Accepted samples are
        // pulled toward the root level by level; a node at level `l` owns
        // the slot range of its path prefix, so siblings never share data.
        let mut previous_level: Vec<TaskHandle> = Vec::new();
        for level in 0..depth {
            let level_count = 8usize.pow(level as u32);
            let span = node_count / level_count;
            let mut this_level = Vec::with_capacity(level_count);
            for ancestor in 0..level_count {
                let octree = Arc::clone(&self.octree);
                let cache = Arc::clone(&self.cache);
                let slots = Arc::clone(&slots);
                let params = self.params;
                let handle = graph.submit(move |ctx| {
                    if ctx.is_cancelled() {
                        return Ok(());
                    }
                    let key = key_at(level, ancestor);
                    let range = &slots[ancestor * span..(ancestor + 1) * span];
                    ancestor_sample(&octree, &cache, range, &key, &params)
                });
                if level == 0 {
                    for &scatter in &scatter_tasks {
                        graph.precedes(scatter, handle);
                    }
                } else {
                    graph.precedes(previous_level[ancestor / 8], handle);
                }
                this_level.push(handle);
            }
            previous_level = this_level;
        }

        // Phase 4: per-node refinement below the target depth, one
        // independent recursion per occupied node.
        for node in 0..node_count {
            let octree = Arc::clone(&self.octree);
            let cache = Arc::clone(&self.cache);
            let slots = Arc::clone(&slots);
            let params = self.params;
            let handle = graph.submit(move |ctx| {
                let taken = slots[node].lock().unwrap().take();
                let Some(points) = taken else {
                    return Ok(());
                };
                let key = key_at(depth, node);
                process_node_recursive(ctx, octree, cache, key, points, params)
            });
            graph.precedes(previous_level[node / 8], handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampling::SamplingKind;
    use crate::taskgraph::GraphExecutor;
    use pcd_core::pointcloud::{AttributeSchema, Point};

    #[test]
    fn target_depth_covers_parallelism() {
        assert_eq!(target_depth(1), 0);
        assert_eq!(target_depth(2), 1);
        assert_eq!(target_depth(8), 1);
        assert_eq!(target_depth(9), 2);
        assert_eq!(target_depth(64), 2);
        assert_eq!(target_depth(65), 3);
    }

    #[test]
    fn node_index_matches_key_path() {
        let bounds = Aabb::new([0.0; 3], [8.0; 3]);
        let p = [7.9, 0.1, 4.1];
        for depth in 1..=3 {
            let index = node_index_at_depth(&bounds, p, depth);
            let key = key_at(depth, index);
            assert_eq!(key.depth(), depth);
            assert!(key.bounds_in(&bounds).contains(p));
        }
    }

    #[test]
    fn prefix_ranges_partition_slot_indices() {
        // At depth 2 the children of ancestor p at level 1 are exactly
        // indices [8p, 8p+8).
        for ancestor in 0..8usize {
            for child in 0..8usize {
                let index = ancestor * 8 + child;
                let key = key_at(2, index);
                assert_eq!(key.parent().unwrap(), key_at(1, ancestor));
            }
        }
    }

    #[test]
    fn v2_accepts_everything_exactly_once() {
        let bounds = Aabb::new([0.0; 3], [1.0; 3]);
        let octree = Arc::new(Octree::new(
            AttributeSchema::position_only(),
            bounds,
            0.0,
            SamplingKind::MinDistance,
            16,
        ));
        let params = TilerParams {
            spacing: 0.0,
            max_depth: 6,
            max_points_per_node: 16,
            concurrency: 4,
        };
        let cache = Arc::new(PointsCache::new());
        let progress = Arc::new(ProgressReporter::new());
        let algorithm = TilingAlgorithmV2::new(
            Arc::clone(&octree),
            Arc::clone(&cache),
            params,
            progress,
        );

        let mut batch = PointBatch::new(AttributeSchema::position_only());
        let mut value = 0.123f64;
        for _ in 0..500 {
            value = (value * 997.0 + 0.371).fract();
            let x = value;
            value = (value * 997.0 + 0.371).fract();
            let y = value;
            value = (value * 997.0 + 0.371).fract();
            batch.push(Point::from_position([x, y, value]));
        }

        let mut graph = TaskGraph::new();
        algorithm.build_execution_graph(batch, &bounds, &mut graph);
        GraphExecutor::new(params.concurrency)
            .unwrap()
            .run(graph)
            .unwrap();

        assert_eq!(octree.num_accepted(), 500);
        let root = octree.node(&NodeKey::root());
        assert_eq!(root.lock().unwrap().node.accepted_total, 16);
    }
}
