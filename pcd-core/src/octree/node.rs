use crate::math::Aabb;
use crate::octree::key::NodeKey;
use crate::pointcloud::{AttributeSchema, PointBatch};

/// One octree node: its cube, the LOD sample accepted at this level and the
/// materialization flags of its children. Children live in the arena keyed
/// by `key.child(i)`; the node itself never owns them.
#[derive(Debug)]
pub struct OctreeNode {
    pub key: NodeKey,
    pub bounds: Aabb,
    /// Points accepted at this level since the last flush.
    pub accepted: PointBatch,
    pub children: [bool; 8],
    /// Set once any payload of this node has been written to the store.
    pub persisted: bool,
    /// Total accepted across the whole run, surviving flushes.
    pub accepted_total: u64,
}

impl OctreeNode {
    pub fn new(key: NodeKey, bounds: Aabb, schema: AttributeSchema) -> Self {
        Self {
            key,
            bounds,
            accepted: PointBatch::new(schema),
            children: [false; 8],
            persisted: false,
            accepted_total: 0,
        }
    }

    pub fn has_children(&self) -> bool {
        self.children.iter().any(|&c| c)
    }

    pub fn is_leaf(&self) -> bool {
        !self.has_children()
    }
}

/// Per-node payloads handed to the persistence layer.
pub type NodeData = Vec<(NodeKey, PointBatch)>;
