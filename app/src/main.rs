use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Local;
use env_logger::Builder;
use log::LevelFilter;

use clap::Parser;

use pcd_core::error::TilerError;
use pcd_core::math::Aabb;
use pcd_core::pointcloud::{AttributeSchema, PointAttribute};
use pcd_core::transform::{CoordinateTransform, IdentityTransform};
use pcd_reader::{expand_sources, BinPointReader, PointReader};
use pcd_store::{
    verify_work_dir, write_sources, BoundsJson, SourceEntry, SourcesDescription, StoreOption,
};
use pcd_tiler::{
    AlgorithmKind, ProgressReporter, SamplingKind, ThroughputCounter, Tiler, TilerConfig,
};

/// Run `process_store` after this many ingested points.
const PROCESS_COUNT: u64 = 1_000_000;

#[derive(Parser, Debug)]
#[command(
    name = "Octree Tiler",
    about = "Converts point cloud data into a streamable LOD octree",
    version = "0.1.0"
)]
struct Cli {
    #[arg(short, long, required = true, num_args = 1.., value_name = "FILE")]
    input: Vec<String>,

    #[arg(short, long, required = true, value_name = "DIR")]
    output: String,

    /// Minimum distance between points accepted at the root.
    #[arg(short, long, default_value_t = 0.0)]
    spacing: f64,

    /// Alternative to --spacing: spacing = bounds diagonal / fraction.
    #[arg(short = 'd', long, default_value_t = 200.0)]
    diagonal_fraction: f64,

    #[arg(long, default_value_t = 20)]
    max_depth: u16,

    #[arg(long, default_value_t = 20_000)]
    max_points_per_node: usize,

    /// Position quantization step in meters.
    #[arg(long, default_value_t = 0.001)]
    scale: f64,

    /// Output attributes next to the position: RGB, RGB_FROM_INTENSITY,
    /// INTENSITY, CLASSIFICATION, NORMAL.
    #[arg(short, long, value_name = "NAME")]
    attributes: Vec<String>,

    /// Sampling quality: random, grid or min-distance.
    #[arg(short, long, default_value = "min-distance")]
    quality: String,

    /// Tiling algorithm: v1 or v2.
    #[arg(long, default_value = "v1")]
    algorithm: String,

    /// Worker pool size; 0 uses all hardware threads.
    #[arg(short, long, default_value_t = 0)]
    concurrency: usize,

    #[arg(long, default_value_t = 2048)]
    max_memory_usage_mib: usize,

    /// Global bounding box as min_x min_y min_z max_x max_y max_z.
    /// Required for headerless .bin inputs.
    #[arg(long, num_args = 6, value_name = "COORD")]
    aabb: Vec<f64>,

    /// Replace an existing conversion in the output directory.
    #[arg(long, default_value_t = false)]
    overwrite: bool,

    /// Append to an existing conversion instead of aborting.
    #[arg(long, default_value_t = false)]
    incremental: bool,

    /// Projection string recorded in sources.json.
    #[arg(long, default_value = "")]
    projection: String,
}

fn build_schema(names: &[String]) -> Result<AttributeSchema, TilerError> {
    let mut attributes = vec![PointAttribute::PositionCartesian];
    for name in names {
        let attribute = PointAttribute::from_name(name)
            .ok_or_else(|| TilerError::Configuration(format!("unknown attribute \"{name}\"")))?;
        if !attributes.contains(&attribute) {
            attributes.push(attribute);
        }
    }
    AttributeSchema::new(attributes)
}

fn store_option(cli: &Cli) -> StoreOption {
    if cli.incremental {
        StoreOption::Incremental
    } else if cli.overwrite {
        StoreOption::Overwrite
    } else {
        StoreOption::AbortIfExists
    }
}

fn make_reader(
    path: &Path,
    schema: &AttributeSchema,
    aabb: Aabb,
    scale: f64,
) -> Result<BinPointReader, TilerError> {
    let is_bin = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("bin"))
        .unwrap_or(false);
    if !is_bin {
        return Err(TilerError::reader(
            path.display().to_string(),
            "unsupported input format; this build reads the internal .bin format",
        ));
    }
    BinPointReader::new(path, schema.clone(), aabb, scale)
}

fn run(cli: Cli) -> Result<(), TilerError> {
    let start = std::time::Instant::now();

    let input_files = expand_sources(&cli.input);
    log::info!("input files: {:?}", input_files);
    if input_files.is_empty() {
        return Err(TilerError::Configuration(
            "no readable input files".to_string(),
        ));
    }

    let output_path = PathBuf::from(&cli.output);
    verify_work_dir(&output_path, store_option(&cli))?;

    let schema = build_schema(&cli.attributes)?;
    log::info!("writing point attributes: {:?}", schema.names());

    let quality = SamplingKind::from_quality(&cli.quality)
        .ok_or_else(|| TilerError::Configuration(format!("unknown quality \"{}\"", cli.quality)))?;
    let algorithm = AlgorithmKind::from_name(&cli.algorithm).ok_or_else(|| {
        TilerError::Configuration(format!("unknown algorithm \"{}\"", cli.algorithm))
    })?;

    let aabb = if cli.aabb.len() == 6 {
        Aabb::new(
            [cli.aabb[0], cli.aabb[1], cli.aabb[2]],
            [cli.aabb[3], cli.aabb[4], cli.aabb[5]],
        )
    } else {
        return Err(TilerError::Configuration(
            "--aabb is required for .bin inputs".to_string(),
        ));
    };
    log::info!("source AABB: {:?} .. {:?}", aabb.min, aabb.max);

    let config = TilerConfig {
        spacing: cli.spacing,
        diagonal_fraction: cli.diagonal_fraction,
        max_depth: cli.max_depth,
        max_points_per_node: cli.max_points_per_node,
        scale: cli.scale,
        attributes: schema.clone(),
        quality,
        algorithm,
        concurrency: cli.concurrency,
        max_memory_usage_mib: cli.max_memory_usage_mib,
        ..TilerConfig::default()
    };

    // Partitioning always happens in source coordinates; a projection would
    // only apply to the bounds written into the JSON sidecars.
    if !cli.projection.is_empty() {
        log::info!(
            "projection \"{}\" recorded; points are not transformed",
            cli.projection
        );
    }
    let transform = IdentityTransform;

    let progress = Arc::new(ProgressReporter::new());
    let mut tiler = Tiler::new(config, aabb, &output_path, Arc::clone(&progress))?;
    log::info!(
        "cubic AABB: {:?} .. {:?}",
        tiler.root_bounds().min,
        tiler.root_bounds().max
    );

    let mut throughput = ThroughputCounter::new();
    let mut since_process = 0u64;
    let mut source_entries = Vec::new();

    for path in &input_files {
        let source_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());

        let mut reader = match make_reader(path, &schema, aabb, cli.scale) {
            Ok(reader) => reader,
            Err(e) => {
                log::warn!("skipping source: {e}");
                continue;
            }
        };

        log::info!("reading {} ({} points)", source_name, reader.num_points());
        let source_bounds = reader.get_aabb();
        let mut source_points = 0u64;

        loop {
            let batch = match reader.read_point_batch() {
                Ok(batch) => batch,
                Err(e) if !e.is_fatal() => {
                    // A reader failure abandons this source; the batches it
                    // already delivered stay in the tree.
                    log::warn!("abandoning source after error: {e}");
                    break;
                }
                Err(e) => return Err(e),
            };
            if batch.is_empty() {
                break;
            }

            let count = batch.len() as u64;
            source_points += count;
            since_process += count;
            throughput.push_entry(count);

            if let Err(e) = tiler.add(batch) {
                if e.is_fatal() {
                    return Err(e);
                }
                log::warn!("batch not fully indexed: {e}");
            }

            if since_process >= PROCESS_COUNT {
                since_process -= PROCESS_COUNT;
                tiler.process_store()?;
                let indexed = progress.get("indexing").map(|(value, _)| value).unwrap_or(0);
                log::info!(
                    "indexing at {:.0} points/s, {} points processed, {} indexed",
                    throughput.per_second(),
                    tiler.num_processed(),
                    indexed
                );
            }
            if tiler.needs_flush() {
                log::info!("memory budget exceeded, flushing");
                tiler.flush()?;
            }
        }
        reader.close()?;

        source_entries.push(SourceEntry {
            name: source_name,
            points: source_points,
            bounds: BoundsJson::from_aabb(&transform.transform_aabb(&source_bounds)),
        });
    }

    let summary = tiler.close()?;
    write_sources(
        &output_path,
        &SourcesDescription::new(cli.projection.clone(), source_entries),
    )?;

    let percent = if summary.processed > 0 {
        summary.accepted as f64 / summary.processed as f64 * 100.0
    } else {
        100.0
    };
    log::info!(
        "conversion finished: processed={} accepted={} ({:.2}%) in {:.1?}",
        summary.processed,
        summary.accepted,
        percent,
        start.elapsed()
    );
    Ok(())
}

fn main() {
    Builder::new()
        .format(|buf, record| {
            writeln!(
                buf,
                "{} [{}] - {}",
                Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.args()
            )
        })
        .filter(None, LevelFilter::Info)
        .init();

    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        log::error!("{e}");
        std::process::exit(1);
    }
}
