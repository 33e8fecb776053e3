use std::hash::Hasher;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rustc_hash::{FxHashMap, FxHashSet, FxHasher};

use pcd_core::error::TilerError;
use pcd_core::math::Aabb;
use pcd_core::octree::NodeKey;

/// A point with non-finite coordinates cannot be indexed or distance-tested.
/// The caller rejects and counts it; the error is never fatal to the run.
pub fn check_position(position: [f64; 3]) -> Result<(), TilerError> {
    if position.iter().all(|c| c.is_finite()) {
        Ok(())
    } else {
        Err(TilerError::Sampling(format!(
            "non-finite coordinates {position:?}"
        )))
    }
}

/// Which LOD sampling policy the run uses, selected once from `quality`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplingKind {
    RandomSorted,
    GridCentered,
    MinDistance,
}

impl SamplingKind {
    pub fn from_quality(quality: &str) -> Option<Self> {
        match quality.to_ascii_lowercase().as_str() {
            "random" => Some(SamplingKind::RandomSorted),
            "grid" => Some(SamplingKind::GridCentered),
            "min-distance" | "default" => Some(SamplingKind::MinDistance),
            _ => None,
        }
    }
}

/// Per-candidate decision capability. `accept` answers whether the point may
/// stay at the node; `commit` records an accepted point. The split matters:
/// capacity checks happen between the two.
pub trait Sampler {
    fn accept(&mut self, position: [f64; 3]) -> bool;
    fn commit(&mut self, position: [f64; 3]);
}

/// Accepts with probability proportional to the node's remaining capacity.
/// Density-preserving, not spatially uniform. The per-node rng is seeded
/// from a stable hash of the node key, so acceptance does not depend on
/// batch boundaries or flush timing.
pub struct RandomSorted {
    rng: ChaCha8Rng,
    capacity: usize,
    accepted: usize,
}

impl RandomSorted {
    fn new(key: &NodeKey, capacity: usize) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(key_seed(key)),
            capacity,
            accepted: 0,
        }
    }
}

impl Sampler for RandomSorted {
    fn accept(&mut self, _position: [f64; 3]) -> bool {
        if self.capacity == 0 {
            return true;
        }
        let remaining = self.capacity.saturating_sub(self.accepted);
        let probability = remaining as f64 / self.capacity as f64;
        self.rng.gen::<f64>() < probability
    }

    fn commit(&mut self, _position: [f64; 3]) {
        self.accepted += 1;
    }
}

/// Uniform grid over the node's cube with cell side = spacing; the first
/// candidate per cell wins. Deterministic given input order.
pub struct GridCentered {
    origin: [f64; 3],
    cell_size: f64,
    occupied: FxHashSet<(u32, u32, u32)>,
}

impl GridCentered {
    fn new(bounds: &Aabb, spacing: f64) -> Self {
        Self {
            origin: bounds.min,
            cell_size: spacing,
            occupied: FxHashSet::default(),
        }
    }

    fn cell_of(&self, position: [f64; 3]) -> (u32, u32, u32) {
        let cell = |axis: usize| {
            ((position[axis] - self.origin[axis]) / self.cell_size)
                .floor()
                .max(0.0) as u32
        };
        (cell(0), cell(1), cell(2))
    }
}

impl Sampler for GridCentered {
    fn accept(&mut self, position: [f64; 3]) -> bool {
        if self.cell_size <= 0.0 {
            return true;
        }
        !self.occupied.contains(&self.cell_of(position))
    }

    fn commit(&mut self, position: [f64; 3]) {
        if self.cell_size <= 0.0 {
            return;
        }
        let cell = self.cell_of(position);
        self.occupied.insert(cell);
    }
}

/// Accepts a candidate iff it is at least `spacing` away from every point
/// already accepted at the node. A spatial hash keyed by
/// `floor(position / spacing)` bounds each query to 27 buckets.
pub struct MinDistance {
    spacing: f64,
    buckets: FxHashMap<(i64, i64, i64), Vec<[f64; 3]>>,
}

impl MinDistance {
    fn new(spacing: f64) -> Self {
        Self {
            spacing,
            buckets: FxHashMap::default(),
        }
    }

    fn bucket_of(&self, position: [f64; 3]) -> (i64, i64, i64) {
        (
            (position[0] / self.spacing).floor() as i64,
            (position[1] / self.spacing).floor() as i64,
            (position[2] / self.spacing).floor() as i64,
        )
    }
}

impl Sampler for MinDistance {
    fn accept(&mut self, position: [f64; 3]) -> bool {
        if self.spacing <= 0.0 {
            return true;
        }
        let (bx, by, bz) = self.bucket_of(position);
        let limit = self.spacing * self.spacing;
        for dx in -1..=1 {
            for dy in -1..=1 {
                for dz in -1..=1 {
                    let Some(bucket) = self.buckets.get(&(bx + dx, by + dy, bz + dz)) else {
                        continue;
                    };
                    for q in bucket {
                        let d2 = (position[0] - q[0]).powi(2)
                            + (position[1] - q[1]).powi(2)
                            + (position[2] - q[2]).powi(2);
                        if d2 < limit {
                            return false;
                        }
                    }
                }
            }
        }
        true
    }

    fn commit(&mut self, position: [f64; 3]) {
        if self.spacing <= 0.0 {
            return;
        }
        let bucket = self.bucket_of(position);
        self.buckets.entry(bucket).or_default().push(position);
    }
}

/// The per-node sampler. Lives in the node arena and survives flushes, which
/// keeps acceptance independent of flush timing.
pub enum SamplerState {
    Random(RandomSorted),
    Grid(GridCentered),
    MinDist(MinDistance),
}

impl SamplerState {
    pub fn prepare(
        kind: SamplingKind,
        key: &NodeKey,
        bounds: &Aabb,
        spacing: f64,
        capacity: usize,
    ) -> Self {
        match kind {
            SamplingKind::RandomSorted => SamplerState::Random(RandomSorted::new(key, capacity)),
            SamplingKind::GridCentered => SamplerState::Grid(GridCentered::new(bounds, spacing)),
            SamplingKind::MinDistance => SamplerState::MinDist(MinDistance::new(spacing)),
        }
    }
}

fn key_seed(key: &NodeKey) -> u64 {
    let mut hasher = FxHasher::default();
    hasher.write_usize(key.depth());
    for octant in key.octants() {
        hasher.write_u8(octant);
    }
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_position_flags_non_finite_coordinates() {
        assert!(check_position([0.0, 1.0, -2.0]).is_ok());
        for bad in [
            [f64::NAN, 0.0, 0.0],
            [0.0, f64::INFINITY, 0.0],
            [0.0, 0.0, f64::NEG_INFINITY],
        ] {
            let error = check_position(bad).unwrap_err();
            assert!(matches!(error, TilerError::Sampling(_)));
        }
    }

    #[test]
    fn min_distance_line_accepts_every_tenth_point() {
        // Dyadic coordinates keep every pairwise distance exact: the step is
        // 1/128 and the spacing ten steps, so index 10k sits at exactly the
        // spacing from index 10(k-1) and distance == spacing is accepted.
        let step = 1.0 / 128.0;
        let mut sampler = MinDistance::new(10.0 * step);
        let mut accepted = Vec::new();
        for i in 0..=100 {
            let p = [i as f64 * step, 0.0, 0.0];
            if sampler.accept(p) {
                sampler.commit(p);
                accepted.push(i);
            }
        }
        assert_eq!(accepted, vec![0, 10, 20, 30, 40, 50, 60, 70, 80, 90, 100]);
    }

    #[test]
    fn min_distance_rejects_duplicate_positions() {
        let mut sampler = MinDistance::new(0.5);
        let p = [1.0, 1.0, 1.0];
        assert!(sampler.accept(p));
        sampler.commit(p);
        assert!(!sampler.accept(p));
    }

    #[test]
    fn min_distance_zero_spacing_accepts_everything() {
        let mut sampler = MinDistance::new(0.0);
        let p = [1.0, 1.0, 1.0];
        for _ in 0..10 {
            assert!(sampler.accept(p));
            sampler.commit(p);
        }
    }

    #[test]
    fn grid_keeps_first_candidate_per_cell() {
        let bounds = Aabb::new([0.0; 3], [1.0; 3]);
        let mut sampler = GridCentered::new(&bounds, 0.5);
        let a = [0.1, 0.1, 0.1];
        let b = [0.2, 0.2, 0.2]; // same cell as a
        let c = [0.8, 0.1, 0.1]; // different cell
        assert!(sampler.accept(a));
        sampler.commit(a);
        assert!(!sampler.accept(b));
        assert!(sampler.accept(c));
    }

    #[test]
    fn random_sorted_is_deterministic_per_node() {
        let key = NodeKey::root().child(5);
        let mut a = RandomSorted::new(&key, 100);
        let mut b = RandomSorted::new(&key, 100);
        for _ in 0..1000 {
            let p = [0.0; 3];
            let decision_a = a.accept(p);
            let decision_b = b.accept(p);
            assert_eq!(decision_a, decision_b);
            if decision_a {
                a.commit(p);
                b.commit(p);
            }
        }
    }

    #[test]
    fn random_sorted_probability_decays_with_fill() {
        let key = NodeKey::root();
        let mut sampler = RandomSorted::new(&key, 10);
        for _ in 0..10 {
            sampler.commit([0.0; 3]);
        }
        // Remaining capacity is zero, so nothing can be accepted.
        for _ in 0..100 {
            assert!(!sampler.accept([0.0; 3]));
        }
    }
}
