pub mod batch;
pub mod point;

pub use batch::PointBatch;
pub use point::{AttributeSchema, Point, PointAttribute};
