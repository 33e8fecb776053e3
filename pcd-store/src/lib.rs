pub mod persistence;
pub mod sidecar;
pub mod workdir;

pub use persistence::{IndexEntry, PointsPersistence};
pub use sidecar::{write_sources, BoundsJson, CloudDescription, SourceEntry, SourcesDescription};
pub use workdir::{verify_work_dir, StoreOption};
