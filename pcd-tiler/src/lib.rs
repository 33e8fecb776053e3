pub mod algorithms;
pub mod cache;
pub mod progress;
pub mod sampling;
pub mod taskgraph;
pub mod tiler;
pub mod tree;

pub use algorithms::{AlgorithmKind, TilingAlgorithm};
pub use cache::PointsCache;
pub use progress::{ProgressReporter, ThroughputCounter};
pub use sampling::SamplingKind;
pub use taskgraph::{GraphExecutor, TaskGraph};
pub use tiler::{OutputFormat, Tiler, TilerConfig, TilerSummary};
