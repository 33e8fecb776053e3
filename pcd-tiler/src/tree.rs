use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use rustc_hash::FxHashMap;

use pcd_core::math::Aabb;
use pcd_core::octree::{NodeKey, OctreeNode};
use pcd_core::pointcloud::AttributeSchema;

use crate::sampling::{SamplerState, SamplingKind};

/// Resolved meta parameters shared by the driver and the algorithms.
#[derive(Debug, Clone, Copy)]
pub struct TilerParams {
    pub spacing: f64,
    pub max_depth: u16,
    pub max_points_per_node: usize,
    pub concurrency: usize,
}

/// A node plus its live sampler. The sampler survives flushes so acceptance
/// decisions never depend on flush timing.
pub struct NodeState {
    pub node: OctreeNode,
    pub sampler: SamplerState,
}

/// Arena of octree nodes keyed by path. Children are arena entries, never
/// owning references, so growth cannot invalidate anything. Each entry sits
/// behind its own mutex; algorithm tasks lock disjoint nodes concurrently
/// and the map lock is only held for lookups and inserts.
pub struct Octree {
    schema: AttributeSchema,
    root_bounds: Aabb,
    spacing: f64,
    kind: SamplingKind,
    capacity: usize,
    nodes: Mutex<FxHashMap<NodeKey, Arc<Mutex<NodeState>>>>,
    resident_points: AtomicU64,
    accepted_points: AtomicU64,
}

impl Octree {
    pub fn new(
        schema: AttributeSchema,
        root_bounds: Aabb,
        spacing: f64,
        kind: SamplingKind,
        capacity: usize,
    ) -> Self {
        let tree = Self {
            schema,
            root_bounds,
            spacing,
            kind,
            capacity,
            nodes: Mutex::new(FxHashMap::default()),
            resident_points: AtomicU64::new(0),
            accepted_points: AtomicU64::new(0),
        };
        // The root exists before ingestion starts.
        tree.node(&NodeKey::root());
        tree
    }

    pub fn schema(&self) -> &AttributeSchema {
        &self.schema
    }

    pub fn root_bounds(&self) -> &Aabb {
        &self.root_bounds
    }

    /// Spacing halves with each depth increase.
    pub fn spacing_at_depth(&self, depth: usize) -> f64 {
        self.spacing / 2f64.powi(depth as i32)
    }

    /// Fetch a node, materializing it (and its ancestor chain) on first use.
    pub fn node(&self, key: &NodeKey) -> Arc<Mutex<NodeState>> {
        let (entry, created) = {
            let mut nodes = self.nodes.lock().unwrap();
            match nodes.get(key) {
                Some(existing) => (Arc::clone(existing), false),
                None => {
                    let bounds = key.bounds_in(&self.root_bounds);
                    let sampler = SamplerState::prepare(
                        self.kind,
                        key,
                        &bounds,
                        self.spacing_at_depth(key.depth()),
                        self.capacity,
                    );
                    let state = Arc::new(Mutex::new(NodeState {
                        node: OctreeNode::new(key.clone(), bounds, self.schema.clone()),
                        sampler,
                    }));
                    nodes.insert(key.clone(), Arc::clone(&state));
                    (state, true)
                }
            }
        };

        if created {
            if let Some(parent_key) = key.parent() {
                let octant = key.octants().last().unwrap() as usize;
                let parent = self.node(&parent_key);
                parent.lock().unwrap().node.children[octant] = true;
            }
        }
        entry
    }

    pub fn contains(&self, key: &NodeKey) -> bool {
        self.nodes.lock().unwrap().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.nodes.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.lock().unwrap().is_empty()
    }

    pub fn record_accepted(&self, count: u64) {
        self.resident_points.fetch_add(count, Ordering::Relaxed);
        self.accepted_points.fetch_add(count, Ordering::Relaxed);
    }

    pub fn sub_resident(&self, count: u64) {
        self.resident_points.fetch_sub(count, Ordering::Relaxed);
    }

    pub fn resident_points(&self) -> u64 {
        self.resident_points.load(Ordering::Relaxed)
    }

    pub fn num_accepted(&self) -> u64 {
        self.accepted_points.load(Ordering::Relaxed)
    }

    /// All nodes in canonical key order (parents before descendants).
    pub fn nodes_sorted(&self) -> Vec<(NodeKey, Arc<Mutex<NodeState>>)> {
        let nodes = self.nodes.lock().unwrap();
        let mut entries: Vec<_> = nodes
            .iter()
            .map(|(key, state)| (key.clone(), Arc::clone(state)))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    /// Non-empty nodes in canonical order, for the final index.
    pub fn index_entries(&self) -> Vec<(NodeKey, u64, Aabb)> {
        self.nodes_sorted()
            .into_iter()
            .filter_map(|(key, state)| {
                let state = state.lock().unwrap();
                if state.node.accepted_total == 0 {
                    return None;
                }
                Some((key, state.node.accepted_total, state.node.bounds))
            })
            .collect()
    }
}
