use crate::math::Aabb;
use crate::pointcloud::point::{AttributeSchema, Point, PointAttribute};

/// Columnar buffer of points sharing one attribute schema.
///
/// Only the columns named by the schema are populated; `positions` is always
/// present. An empty batch returned by a reader signals end of stream.
#[derive(Debug, Clone)]
pub struct PointBatch {
    schema: AttributeSchema,
    pub positions: Vec<[f64; 3]>,
    pub colors: Vec<[u8; 4]>,
    pub intensities: Vec<u16>,
    pub classifications: Vec<u8>,
    pub normals: Vec<[i8; 2]>,
}

impl PointBatch {
    pub fn new(schema: AttributeSchema) -> Self {
        Self {
            schema,
            positions: Vec::new(),
            colors: Vec::new(),
            intensities: Vec::new(),
            classifications: Vec::new(),
            normals: Vec::new(),
        }
    }

    pub fn with_capacity(schema: AttributeSchema, capacity: usize) -> Self {
        let mut batch = Self::new(schema);
        batch.positions.reserve(capacity);
        if batch.schema.has_color() {
            batch.colors.reserve(capacity);
        }
        if batch.schema.has(PointAttribute::Intensity) {
            batch.intensities.reserve(capacity);
        }
        if batch.schema.has(PointAttribute::Classification) {
            batch.classifications.reserve(capacity);
        }
        if batch.schema.has(PointAttribute::NormalOct16) {
            batch.normals.reserve(capacity);
        }
        batch
    }

    pub fn schema(&self) -> &AttributeSchema {
        &self.schema
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn push(&mut self, point: Point) {
        self.positions.push(point.position);
        if self.schema.has_color() {
            self.colors.push(point.color);
        }
        if self.schema.has(PointAttribute::Intensity) {
            self.intensities.push(point.intensity);
        }
        if self.schema.has(PointAttribute::Classification) {
            self.classifications.push(point.classification);
        }
        if self.schema.has(PointAttribute::NormalOct16) {
            self.normals.push(point.normal);
        }
    }

    pub fn get(&self, index: usize) -> Point {
        Point {
            position: self.positions[index],
            color: self.colors.get(index).copied().unwrap_or_default(),
            intensity: self.intensities.get(index).copied().unwrap_or_default(),
            classification: self
                .classifications
                .get(index)
                .copied()
                .unwrap_or_default(),
            normal: self.normals.get(index).copied().unwrap_or_default(),
        }
    }

    /// Copy one record out of another batch with the same schema.
    pub fn push_from(&mut self, other: &PointBatch, index: usize) {
        debug_assert_eq!(self.schema, other.schema);
        self.positions.push(other.positions[index]);
        if self.schema.has_color() {
            self.colors.push(other.colors[index]);
        }
        if self.schema.has(PointAttribute::Intensity) {
            self.intensities.push(other.intensities[index]);
        }
        if self.schema.has(PointAttribute::Classification) {
            self.classifications.push(other.classifications[index]);
        }
        if self.schema.has(PointAttribute::NormalOct16) {
            self.normals.push(other.normals[index]);
        }
    }

    /// Move all records of `other` onto the end of this batch.
    pub fn append(&mut self, other: &mut PointBatch) {
        debug_assert_eq!(self.schema, other.schema);
        self.positions.append(&mut other.positions);
        self.colors.append(&mut other.colors);
        self.intensities.append(&mut other.intensities);
        self.classifications.append(&mut other.classifications);
        self.normals.append(&mut other.normals);
    }

    /// Move-split into eight batches keyed by the octant of each point in
    /// `bounds`. Relative order within each octant is preserved.
    pub fn split_by_octant(self, bounds: &Aabb) -> [PointBatch; 8] {
        let mut out: [PointBatch; 8] =
            std::array::from_fn(|_| PointBatch::new(self.schema.clone()));
        for index in 0..self.len() {
            let octant = bounds.octant_of(self.positions[index]);
            out[octant].push_from(&self, index);
        }
        out
    }

    pub fn clear(&mut self) {
        self.positions.clear();
        self.colors.clear();
        self.intensities.clear();
        self.classifications.clear();
        self.normals.clear();
    }

    /// Resident in-memory size of one record, used by the memory governor.
    pub fn mem_bytes_per_point(&self) -> usize {
        self.schema.mem_bytes_per_point()
    }
}
