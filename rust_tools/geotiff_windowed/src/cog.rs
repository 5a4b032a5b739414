//! Cloud-optimized layout validation and optimization.

use crate::chunking::WindowGrid;
use crate::error::{RasterError, Result};
use crate::planner::{plan_per_band, DEFAULT_SAFETY_FACTOR};
use crate::pyramid::{overview_factors, OverviewPyramidBuilder, PyramidConfig, DEFAULT_MIN_OVERVIEW_DIMENSION};
use crate::raster::{BlockShape, Compression, Predictor, RasterDataset, RasterDriver, RasterMeta, Window};
use crate::resample::ResamplingKernel;
use log::{debug, info, warn};
use std::path::Path;
use std::str::FromStr;
use std::time::{Duration, Instant};

/// Tiles smaller than this make too many requests per read.
const MIN_RECOMMENDED_TILE: usize = 128;

/// Side of the small-window read used to probe latency and amplification.
const PROBE_WINDOW: usize = 256;

const MAX_PROBE_LATENCY_MS: f64 = 250.0;

const MAX_READ_AMPLIFICATION: f64 = 4.0;

/// Validate tile size (must be multiple of 16)
pub fn validate_tile_size(tile_size: usize) -> Result<()> {
    if tile_size == 0 || tile_size % 16 != 0 {
        return Err(RasterError::InvalidTileSize(tile_size));
    }
    Ok(())
}

/// GTiff creation options for a raster's layout.
pub fn create_dataset_options(meta: &RasterMeta) -> Vec<String> {
    let mut options = vec![format!("COMPRESS={}", meta.compression.gdal_name())];
    if meta.predictor != Predictor::None {
        options.push(format!("PREDICTOR={}", meta.predictor.tag_value()));
    }
    if let BlockShape::Tiled { width, height } = meta.block_shape {
        options.push("TILED=YES".to_string());
        options.push(format!("BLOCKXSIZE={}", width));
        options.push(format!("BLOCKYSIZE={}", height));
    }
    options.push("BIGTIFF=IF_SAFER".to_string());
    options
}

/// Typical access pattern a layout is tuned for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessProfile {
    /// Map tiles over HTTP: 256 px tiles, DEFLATE.
    Web,
    /// Windowed analysis reads: 512 px tiles, LZW.
    Analysis,
    /// Long-term storage: 512 px tiles, ZSTD.
    Archive,
}

impl AccessProfile {
    pub fn tile_size(&self) -> usize {
        match self {
            AccessProfile::Web => 256,
            AccessProfile::Analysis | AccessProfile::Archive => 512,
        }
    }

    pub fn compression(&self) -> Compression {
        match self {
            AccessProfile::Web => Compression::Deflate,
            AccessProfile::Analysis => Compression::Lzw,
            AccessProfile::Archive => Compression::Zstd,
        }
    }
}

impl FromStr for AccessProfile {
    type Err = RasterError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "web" => Ok(AccessProfile::Web),
            "analysis" => Ok(AccessProfile::Analysis),
            "archive" => Ok(AccessProfile::Archive),
            other => Err(RasterError::invalid(
                "access_profile",
                format!("unknown profile '{}' (expected web, analysis or archive)", other),
            )),
        }
    }
}

/// Storage layout as observed on a raster, or as an optimization target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CogProfile {
    pub tiled: bool,
    pub block_shape: BlockShape,
    pub compression: Compression,
    pub overview_factors: Vec<usize>,
    pub predictor: Predictor,
}

impl CogProfile {
    pub fn from_meta(meta: &RasterMeta) -> Self {
        Self {
            tiled: meta.block_shape.is_tiled(),
            block_shape: meta.block_shape,
            compression: meta.compression,
            overview_factors: meta.overview_factors.clone(),
            predictor: meta.predictor,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValidationReport {
    pub is_valid_cog: bool,
    pub issues: Vec<String>,
    pub warnings: Vec<String>,
    pub profile: CogProfile,
    /// Wall time of one small-window read.
    pub read_latency_ms: f64,
    /// Pixels in the blocks touched by that read over pixels in the window.
    pub read_amplification: f64,
}

/// Check a raster against cloud-optimized layout rules.
pub fn validate<R: RasterDataset + ?Sized>(raster: &R) -> Result<ValidationReport> {
    validate_layout(raster, DEFAULT_MIN_OVERVIEW_DIMENSION)
}

/// [`validate`] plus warnings where the layout differs from what `profile` wants.
pub fn validate_against<R: RasterDataset + ?Sized>(raster: &R, profile: AccessProfile) -> Result<ValidationReport> {
    let mut report = validate(raster)?;
    match report.profile.block_shape {
        BlockShape::Tiled { width, height } if width == profile.tile_size() && height == profile.tile_size() => {}
        _ => report.warnings.push(format!(
            "{:?} access prefers {}x{} tiles",
            profile,
            profile.tile_size(),
            profile.tile_size()
        )),
    }
    if report.profile.compression != profile.compression() {
        report.warnings.push(format!(
            "{:?} access prefers {} compression, found {}",
            profile,
            profile.compression(),
            report.profile.compression
        ));
    }
    Ok(report)
}

fn validate_layout<R: RasterDataset + ?Sized>(raster: &R, overview_minimum: usize) -> Result<ValidationReport> {
    let meta = raster.meta();
    meta.validate()?;
    let profile = CogProfile::from_meta(&meta);
    let mut issues = Vec::new();
    let mut warnings = Vec::new();

    match meta.block_shape {
        BlockShape::Untiled { rows_per_strip } => {
            issues.push(format!("not tiled (strips of {} rows)", rows_per_strip));
        }
        BlockShape::Tiled { width, height } => {
            if !width.is_power_of_two() || !height.is_power_of_two() {
                issues.push(format!("tile size {}x{} is not a power of two", width, height));
            }
            if width.min(height) < MIN_RECOMMENDED_TILE {
                warnings.push(format!(
                    "tiles of {}x{} are smaller than {} px",
                    width, height, MIN_RECOMMENDED_TILE
                ));
            }
        }
    }

    if meta.overview_factors.is_empty() && !overview_factors(meta.width, meta.height, overview_minimum).is_empty() {
        issues.push(format!(
            "no overviews for a {}x{} raster",
            meta.width, meta.height
        ));
    }

    if meta.compression == Compression::None {
        issues.push("no compression".to_string());
    } else if meta.predictor == Predictor::None {
        warnings.push(format!("{} compression without a predictor", meta.compression));
    }

    let (read_latency_ms, read_amplification) = probe_small_read(raster, &meta)?;
    if read_latency_ms > MAX_PROBE_LATENCY_MS {
        warnings.push(format!("small-window read took {:.0} ms", read_latency_ms));
    }
    if read_amplification > MAX_READ_AMPLIFICATION {
        warnings.push(format!(
            "small-window read touches {:.1}x the requested pixels",
            read_amplification
        ));
    }

    for issue in &issues {
        debug!("{}: {}", raster.identifier(), issue);
    }
    Ok(ValidationReport {
        is_valid_cog: issues.is_empty(),
        issues,
        warnings,
        profile,
        read_latency_ms,
        read_amplification,
    })
}

/// Time a block-aligned small read near the raster centre.
fn probe_small_read<R: RasterDataset + ?Sized>(raster: &R, meta: &RasterMeta) -> Result<(f64, f64)> {
    let (block_width, block_height) = meta.block_shape.block_dims(meta.width);
    let side_x = PROBE_WINDOW.min(meta.width);
    let side_y = PROBE_WINDOW.min(meta.height);
    let col_off = (meta.width - side_x) / 2 / block_width * block_width;
    let row_off = (meta.height - side_y) / 2 / block_height * block_height;
    let window = Window::new(col_off, row_off, side_x, side_y);

    let blocks_x = window.col_end().div_ceil(block_width) - col_off / block_width;
    let blocks_y = window.row_end().div_ceil(block_height) - row_off / block_height;
    let touched = (blocks_x * block_width * blocks_y * block_height) as f64;
    let amplification = touched / window.area() as f64;

    let start = Instant::now();
    raster.read(&window)?;
    let latency_ms = start.elapsed().as_secs_f64() * 1000.0;
    Ok((latency_ms, amplification))
}

#[derive(Debug, Clone, PartialEq)]
pub struct OptimizeConfig {
    pub compression: Compression,
    pub tile_size: usize,
    pub overview_min_size: usize,
    pub kernel: ResamplingKernel,
    pub max_memory_bytes: u64,
}

impl Default for OptimizeConfig {
    fn default() -> Self {
        Self {
            compression: Compression::Deflate,
            tile_size: 512,
            overview_min_size: DEFAULT_MIN_OVERVIEW_DIMENSION,
            kernel: ResamplingKernel::Average,
            max_memory_bytes: 256 * 1024 * 1024,
        }
    }
}

impl OptimizeConfig {
    pub fn for_profile(profile: AccessProfile) -> Self {
        Self {
            compression: profile.compression(),
            tile_size: profile.tile_size(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        validate_tile_size(self.tile_size)?;
        if self.overview_min_size == 0 {
            return Err(RasterError::invalid("overview_min_size", "must be positive"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OptimizationReport {
    pub input_bytes: u64,
    pub output_bytes: u64,
    /// Negative when the output is larger.
    pub size_reduction_percent: f64,
    pub window_size: usize,
    pub windows_copied: usize,
    pub overview_factors: Vec<usize>,
    pub elapsed: Duration,
    pub validation: ValidationReport,
}

/// Largest copy window within the planned size that lines up with tile edges.
fn tile_aligned_window(planned: usize, tile_size: usize) -> usize {
    if planned >= tile_size {
        return planned / tile_size * tile_size;
    }
    let mut side = 16;
    while side * 2 <= planned && tile_size % (side * 2) == 0 {
        side *= 2;
    }
    side
}

/// Rewrite `input` as a tiled, compressed raster with overviews.
///
/// Bands are copied one at a time in tile-aligned windows sized by the
/// planner, then the pyramid is built and the result re-validated.
pub fn optimize<R, D>(
    input: &R,
    driver: &D,
    output_path: &Path,
    config: &OptimizeConfig,
) -> Result<(D::Dataset, OptimizationReport)>
where
    R: RasterDataset + ?Sized,
    D: RasterDriver,
{
    config.validate()?;
    let start = Instant::now();
    let meta = input.meta();
    meta.validate()?;

    let predictor = Predictor::for_layout(config.compression, meta.data_type);
    let output_meta = meta.clone().with_layout(BlockShape::square(config.tile_size), config.compression, predictor);
    let plan = plan_per_band(&meta, config.max_memory_bytes, DEFAULT_SAFETY_FACTOR)?;
    let window_size = tile_aligned_window(plan.window_size, config.tile_size);

    info!(
        "Optimizing {} → {}: {}x{} tiles, {} compression, predictor {:?}",
        input.identifier(),
        output_path.display(),
        config.tile_size,
        config.tile_size,
        config.compression,
        predictor
    );

    let mut output = driver.create(output_path, &output_meta)?;
    let grid = WindowGrid::new(meta.width, meta.height, window_size, 0)?;
    for band in 0..meta.band_count {
        for bounds in &grid {
            let data = input.read_band(band, &bounds.target)?;
            output.write_band(band, &bounds.target, data.view())?;
        }
        debug!("Band {} copied in {} windows", band + 1, grid.total_windows);
    }

    let pyramid = OverviewPyramidBuilder::new(PyramidConfig {
        minimum_overview_dimension: config.overview_min_size,
        kernel: config.kernel,
        window_size,
    })
    .build(&mut output)?;
    output.flush()?;

    let validation = validate_layout(&output, config.overview_min_size)?;
    if !validation.is_valid_cog {
        warn!(
            "{} is still not cloud-optimized: {}",
            output.identifier(),
            validation.issues.join("; ")
        );
    }

    let input_bytes = input.storage_bytes()?;
    let output_bytes = output.storage_bytes()?;
    let size_reduction_percent = if input_bytes == 0 {
        0.0
    } else {
        (1.0 - output_bytes as f64 / input_bytes as f64) * 100.0
    };

    let report = OptimizationReport {
        input_bytes,
        output_bytes,
        size_reduction_percent,
        window_size,
        windows_copied: grid.total_windows * meta.band_count,
        overview_factors: pyramid.factors(),
        elapsed: start.elapsed(),
        validation,
    };
    info!(
        "Optimized in {:.2?}: {} → {} bytes ({:.1}% smaller), overviews {:?}",
        report.elapsed, report.input_bytes, report.output_bytes, report.size_reduction_percent, report.overview_factors
    );
    Ok((output, report))
}
