mod v1;
mod v2;

use std::sync::Arc;

use pcd_core::error::TilerError;
use pcd_core::math::Aabb;
use pcd_core::octree::{NodeKey, OctreeNode};
use pcd_core::pointcloud::PointBatch;

use crate::cache::PointsCache;
use crate::progress::ProgressReporter;
use crate::sampling::{Sampler, SamplerState};
use crate::taskgraph::{TaskContext, TaskGraph};
use crate::tree::{NodeState, Octree, TilerParams};

pub use v1::TilingAlgorithmV1;
pub use v2::TilingAlgorithmV2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlgorithmKind {
    V1,
    V2,
}

impl AlgorithmKind {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "v1" => Some(AlgorithmKind::V1),
            "v2" => Some(AlgorithmKind::V2),
            _ => None,
        }
    }
}

/// One strategy = one way of turning a batch into graph tasks. The caller
/// runs the graph and joins.
pub trait TilingAlgorithm: Send + Sync {
    fn build_execution_graph(&self, batch: PointBatch, bounds: &Aabb, graph: &mut TaskGraph);
}

pub fn make_algorithm(
    kind: AlgorithmKind,
    octree: Arc<Octree>,
    cache: Arc<PointsCache>,
    params: TilerParams,
    progress: Arc<ProgressReporter>,
) -> Box<dyn TilingAlgorithm> {
    match kind {
        AlgorithmKind::V1 => Box::new(TilingAlgorithmV1::new(octree, cache, params, progress)),
        AlgorithmKind::V2 => Box::new(TilingAlgorithmV2::new(octree, cache, params, progress)),
    }
}

/// Sample a buffer at one node, routing every non-accepted point into the
/// child octant of its position. Returns the accepted count. At the maximum
/// depth the node buckets unconditionally and the capacity cap does not
/// apply. Monomorphized per strategy; dispatch happens once per node.
fn sample_with<S: Sampler>(
    sampler: &mut S,
    node: &mut OctreeNode,
    points: &PointBatch,
    capacity: u64,
    at_max_depth: bool,
    children: &mut [PointBatch; 8],
) -> u64 {
    let mut accepted = 0;
    for index in 0..points.len() {
        let position = points.positions[index];
        let take =
            at_max_depth || (node.accepted_total < capacity && sampler.accept(position));
        if take {
            if !at_max_depth {
                sampler.commit(position);
            }
            node.accepted.push_from(points, index);
            node.accepted_total += 1;
            accepted += 1;
        } else {
            let octant = node.bounds.octant_of(position);
            children[octant].push_from(points, index);
        }
    }
    accepted
}

/// Like `sample_with`, but non-accepted points stay together in `kept`
/// instead of splitting by octant. Used by V2's ancestor pass, where the
/// surviving points continue toward deeper, already-partitioned nodes.
fn filter_with<S: Sampler>(
    sampler: &mut S,
    node: &mut OctreeNode,
    points: &PointBatch,
    capacity: u64,
    kept: &mut PointBatch,
) -> u64 {
    let mut accepted = 0;
    for index in 0..points.len() {
        let position = points.positions[index];
        if node.accepted_total < capacity && sampler.accept(position) {
            sampler.commit(position);
            node.accepted.push_from(points, index);
            node.accepted_total += 1;
            accepted += 1;
        } else {
            kept.push_from(points, index);
        }
    }
    accepted
}

pub(crate) fn sample_node_batch(
    state: &mut NodeState,
    points: &PointBatch,
    params: &TilerParams,
) -> ([PointBatch; 8], u64) {
    let at_max_depth = state.node.key.depth() >= params.max_depth as usize;
    let capacity = params.max_points_per_node as u64;
    let mut children: [PointBatch; 8] =
        std::array::from_fn(|_| PointBatch::new(points.schema().clone()));

    let NodeState { node, sampler } = state;
    let accepted = match sampler {
        SamplerState::Random(s) => {
            sample_with(s, node, points, capacity, at_max_depth, &mut children)
        }
        SamplerState::Grid(s) => {
            sample_with(s, node, points, capacity, at_max_depth, &mut children)
        }
        SamplerState::MinDist(s) => {
            sample_with(s, node, points, capacity, at_max_depth, &mut children)
        }
    };

    (children, accepted)
}

pub(crate) fn filter_node_batch(
    state: &mut NodeState,
    points: &PointBatch,
    params: &TilerParams,
    kept: &mut PointBatch,
) -> u64 {
    let capacity = params.max_points_per_node as u64;
    let NodeState { node, sampler } = state;
    match sampler {
        SamplerState::Random(s) => filter_with(s, node, points, capacity, kept),
        SamplerState::Grid(s) => filter_with(s, node, points, capacity, kept),
        SamplerState::MinDist(s) => filter_with(s, node, points, capacity, kept),
    }
}

/// Root-down recursion shared by V1 (from the root) and V2 (below the
/// target depth). Each node is handled by exactly one task per batch; the
/// recursion into children is dispatched as immediately-ready tasks.
pub(crate) fn process_node_recursive(
    ctx: &TaskContext,
    octree: Arc<Octree>,
    cache: Arc<PointsCache>,
    key: NodeKey,
    points: Arc<PointBatch>,
    params: TilerParams,
) -> Result<(), TilerError> {
    if ctx.is_cancelled() || points.is_empty() {
        return Ok(());
    }

    let node = octree.node(&key);
    let (children, accepted) = {
        let mut state = node.lock().unwrap();
        sample_node_batch(&mut state, &points, &params)
    };
    octree.record_accepted(accepted);

    for (octant, child_points) in children.into_iter().enumerate() {
        if child_points.is_empty() {
            continue;
        }
        if ctx.is_cancelled() {
            return Ok(());
        }
        let child_key = key.child(octant as u8);
        let child_points = cache.emplace(child_points);
        let octree = Arc::clone(&octree);
        let cache = Arc::clone(&cache);
        ctx.spawn(move |ctx| {
            process_node_recursive(ctx, octree, cache, child_key, child_points, params)
        });
    }
    Ok(())
}
