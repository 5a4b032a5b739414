use crate::cog::{AccessProfile, OptimizeConfig};
use crate::error::Result;
use crate::raster::{BoundingBox, Compression};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

const BYTES_PER_MB: u64 = 1024 * 1024;

#[derive(Parser, Debug)]
#[command(name = "cogwin")]
#[command(about = "Memory-bounded windowed processing and cloud-optimized GeoTIFF tooling")]
#[command(version)]
#[command(author = "Huimori Project")]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// Number of threads (default: all available)
    #[arg(short, long, value_name = "N", global = true)]
    pub threads: Option<usize>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Show the window size chosen for a memory budget
    Plan {
        /// Input GeoTIFF path
        #[arg(short, long, value_name = "FILE")]
        input: PathBuf,

        /// Memory budget in MB
        #[arg(long, value_name = "MB", default_value_t = 512)]
        memory_mb: u64,

        /// Fraction of the budget a window may use
        #[arg(long, value_name = "FRACTION", default_value_t = 0.8)]
        safety_factor: f64,

        /// Plan against this fraction of currently available memory instead
        #[arg(long, value_name = "FRACTION", conflicts_with = "memory_mb")]
        available_fraction: Option<f64>,
    },

    /// Windowed focal mean of every band
    Smooth {
        /// Input GeoTIFF path
        #[arg(short, long, value_name = "FILE")]
        input: PathBuf,

        /// Output GeoTIFF path
        #[arg(short, long, value_name = "FILE")]
        output: PathBuf,

        /// Focal radius in map units (e.g., 2000 for 2km)
        #[arg(short, long, value_name = "DISTANCE")]
        radius: f64,

        /// Treat the radius as a number of cells
        #[arg(long)]
        cells: bool,

        /// Override nodata value (default: read from input)
        #[arg(long, value_name = "VALUE")]
        nodata: Option<f64>,

        /// Memory budget in MB
        #[arg(long, value_name = "MB", default_value_t = 512)]
        memory_mb: u64,
    },

    /// Change pixel size
    Resample {
        #[arg(short, long, value_name = "FILE")]
        input: PathBuf,

        #[arg(short, long, value_name = "FILE")]
        output: PathBuf,

        /// Target pixel size in map units
        #[arg(long, value_name = "SIZE")]
        resolution: f64,

        /// nearest, bilinear or average
        #[arg(long, default_value = "average")]
        method: String,

        /// Output window side in pixels
        #[arg(long, value_name = "PIXELS", default_value_t = 512)]
        window_size: usize,
    },

    /// Rebuild the overview pyramid in place
    Overviews {
        #[arg(short, long, value_name = "FILE")]
        input: PathBuf,

        /// Stop when the shorter side would drop below this
        #[arg(long, value_name = "PIXELS", default_value_t = 256)]
        min_size: usize,

        #[arg(long, default_value = "average")]
        method: String,
    },

    /// Check cloud-optimized layout
    Validate {
        #[arg(short, long, value_name = "FILE")]
        input: PathBuf,

        /// Also compare against web, analysis or archive access
        #[arg(long)]
        profile: Option<String>,
    },

    /// Rewrite as a cloud-optimized GeoTIFF
    Optimize {
        #[arg(short, long, value_name = "FILE")]
        input: PathBuf,

        #[arg(short, long, value_name = "FILE")]
        output: PathBuf,

        #[command(flatten)]
        layout: LayoutOptions,
    },

    /// Optimize many files in parallel
    BatchOptimize {
        /// Input GeoTIFF paths
        #[arg(required = true, value_name = "FILE")]
        inputs: Vec<PathBuf>,

        /// Directory for the outputs (same file names)
        #[arg(short, long, value_name = "DIR")]
        output_dir: PathBuf,

        /// Concurrent jobs (default: all available)
        #[arg(long, value_name = "N")]
        workers: Option<usize>,

        #[command(flatten)]
        layout: LayoutOptions,
    },

    /// Read an extent at a target resolution from the best overview
    Read {
        #[arg(short, long, value_name = "FILE")]
        input: PathBuf,

        /// min_x,min_y,max_x,max_y in the raster's CRS
        #[arg(long, value_parser = parse_bbox, allow_hyphen_values = true)]
        bbox: BoundingBox,

        /// Coarsest acceptable pixel size in map units
        #[arg(long, value_name = "SIZE")]
        resolution: f64,

        #[arg(long, value_name = "PIXELS", default_value_t = 16_777_216)]
        max_pixels: usize,

        /// Also fetch the planned byte ranges from the file
        #[arg(long)]
        fetch: bool,
    },

    /// Print system and process memory
    Memory,
}

/// Target layout for `optimize` and `batch-optimize`.
#[derive(clap::Args, Debug, Clone)]
pub struct LayoutOptions {
    /// web, analysis or archive defaults
    #[arg(long)]
    pub profile: Option<String>,

    /// Compression type (DEFLATE, LZW, ZSTD, NONE)
    #[arg(short, long)]
    pub compression: Option<String>,

    /// Tile size in pixels (multiple of 16)
    #[arg(long, value_name = "PIXELS")]
    pub tile_size: Option<usize>,

    /// Smallest overview side
    #[arg(long, value_name = "PIXELS", default_value_t = 256)]
    pub overview_min_size: usize,

    /// Memory budget in MB
    #[arg(long, value_name = "MB", default_value_t = 256)]
    pub memory_mb: u64,
}

impl LayoutOptions {
    /// Profile defaults, then explicit flags on top.
    pub fn to_config(&self) -> Result<OptimizeConfig> {
        let mut config = match &self.profile {
            Some(name) => OptimizeConfig::for_profile(name.parse::<AccessProfile>()?),
            None => OptimizeConfig::default(),
        };
        if let Some(compression) = &self.compression {
            config.compression = compression.parse::<Compression>()?;
        }
        if let Some(tile_size) = self.tile_size {
            config.tile_size = tile_size;
        }
        config.overview_min_size = self.overview_min_size;
        config.max_memory_bytes = mb_to_bytes(self.memory_mb);
        config.validate()?;
        Ok(config)
    }
}

pub fn mb_to_bytes(mb: u64) -> u64 {
    mb.saturating_mul(BYTES_PER_MB)
}

fn parse_bbox(value: &str) -> std::result::Result<BoundingBox, String> {
    let parts = value
        .split(',')
        .map(|part| part.trim().parse::<f64>().map_err(|e| format!("'{}': {}", part.trim(), e)))
        .collect::<std::result::Result<Vec<_>, _>>()?;
    match parts.as_slice() {
        &[min_x, min_y, max_x, max_y] if min_x < max_x && min_y < max_y => {
            Ok(BoundingBox::new(min_x, min_y, max_x, max_y))
        }
        &[_, _, _, _] => Err("expected min_x < max_x and min_y < max_y".to_string()),
        _ => Err(format!("expected 4 comma-separated numbers, got {}", parts.len())),
    }
}
