use std::sync::{Arc, Mutex};

use pcd_core::pointcloud::PointBatch;

/// Thread-safe append-only arena for the intermediate per-node buffers the
/// tiling algorithms pass between tasks.
///
/// `emplace` is serialized; the returned handle stays valid for as long as
/// any task holds it, and `clear` drops only the cache's own handles. The
/// driver clears between graph runs, never while one is executing.
#[derive(Default)]
pub struct PointsCache {
    slots: Mutex<Vec<Arc<PointBatch>>>,
}

impl PointsCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn emplace(&self, batch: PointBatch) -> Arc<PointBatch> {
        let handle = Arc::new(batch);
        let mut slots = self.slots.lock().unwrap();
        slots.push(Arc::clone(&handle));
        handle
    }

    pub fn len(&self) -> usize {
        self.slots.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().unwrap().is_empty()
    }

    pub fn clear(&self) {
        self.slots.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pcd_core::pointcloud::{AttributeSchema, Point};

    #[test]
    fn handles_survive_clear() {
        let cache = PointsCache::new();
        let mut batch = PointBatch::new(AttributeSchema::position_only());
        batch.push(Point::from_position([1.0, 2.0, 3.0]));

        let handle = cache.emplace(batch);
        assert_eq!(cache.len(), 1);
        cache.clear();
        assert!(cache.is_empty());
        // The outstanding handle still reads its buffer.
        assert_eq!(handle.len(), 1);
        assert_eq!(handle.positions[0], [1.0, 2.0, 3.0]);
    }

    #[test]
    fn concurrent_emplace_keeps_every_buffer() {
        let cache = Arc::new(PointsCache::new());
        std::thread::scope(|scope| {
            for _ in 0..8 {
                let cache = Arc::clone(&cache);
                scope.spawn(move || {
                    for _ in 0..100 {
                        cache.emplace(PointBatch::new(AttributeSchema::position_only()));
                    }
                });
            }
        });
        assert_eq!(cache.len(), 800);
    }
}
