use clap::Parser;
use env_logger::Env;
use log::{info, warn};
use std::path::{Path, PathBuf};

use geotiff_windowed::batch::{BatchConfig, ParallelBatchDispatcher};
use geotiff_windowed::cli::{mb_to_bytes, Args, Command};
use geotiff_windowed::cog::{self, OptimizeConfig, ValidationReport};
use geotiff_windowed::crs::{calculate_radius_in_cells, detect_radius_mode};
use geotiff_windowed::error::{RasterError, Result};
use geotiff_windowed::focal::focal_mean_transform;
use geotiff_windowed::gdal_io::GdalDriver;
use geotiff_windowed::monitor::MemoryMonitor;
use geotiff_windowed::planner;
use geotiff_windowed::processor::{ProcessConfig, WindowedProcessor};
use geotiff_windowed::pyramid::{OverviewPyramidBuilder, PyramidConfig};
use geotiff_windowed::range_read::{fetch_ranges, EfficientRangeReader, LocalRangeSource, RangeRequest};
use geotiff_windowed::raster::{RasterDataset, RasterDriver};
use geotiff_windowed::resample::{ResampleConfig, Resampler};

fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logger
    let log_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level)).init();

    // Set thread pool size if specified
    if let Some(n_threads) = args.threads {
        rayon::ThreadPoolBuilder::new()
            .num_threads(n_threads)
            .build_global()
            .map_err(|e| RasterError::WorkerPool(e.to_string()))?;
        info!("Using {} threads", n_threads);
    }

    let driver = GdalDriver::new();
    match args.command {
        Command::Plan {
            input,
            memory_mb,
            safety_factor,
            available_fraction,
        } => {
            let meta = driver.open(&input)?.meta();
            let plan = match available_fraction {
                Some(fraction) => planner::plan_with_monitor(&meta, &MemoryMonitor::new(), fraction, safety_factor)?,
                None => planner::plan(&meta, mb_to_bytes(memory_mb), safety_factor)?,
            };
            println!(
                "{}: {}x{} windows, {:.1} MB each, ~{} windows",
                input.display(),
                plan.window_size,
                plan.window_size,
                plan.bytes_per_window / (1024.0 * 1024.0),
                plan.windows_estimated
            );
        }

        Command::Smooth {
            input,
            output,
            radius,
            cells,
            nodata,
            memory_mb,
        } => {
            if radius <= 0.0 {
                return Err(RasterError::InvalidParameter {
                    name: "radius",
                    reason: format!("{} must be positive", radius),
                });
            }
            let raster = driver.open(&input)?;
            let meta = raster.meta();
            let (pixel_width, pixel_height) = meta.resolution();
            if (pixel_width - pixel_height).abs() > 1e-9 {
                warn!(
                    "Non-square pixels detected ({:.6} x {:.6}), using width for calculations",
                    pixel_width, pixel_height
                );
            }
            let mode = detect_radius_mode(&raster_wkt(&meta.crs), cells);
            let radius_cells = calculate_radius_in_cells(radius, pixel_width, mode);
            let nodata = nodata.or(meta.nodata);

            let processor = WindowedProcessor::new(ProcessConfig {
                overlap: radius_cells,
                max_memory_bytes: mb_to_bytes(memory_mb),
                ..ProcessConfig::default()
            });
            let (_, report) = processor.run(&raster, &driver, &output, focal_mean_transform(radius_cells, nodata))?;
            println!(
                "{} windows of {} px, {:.0} pixels/s, peak RSS {:.1} MB",
                report.windows_processed, report.window_size, report.throughput_pixels_per_sec, report.peak_memory_mb
            );
        }

        Command::Resample {
            input,
            output,
            resolution,
            method,
            window_size,
        } => {
            let config = ResampleConfig::new(resolution, &method, window_size)?;
            let raster = driver.open(&input)?;
            let (_, report) = Resampler::new(config).resample(&raster, &driver, &output)?;
            println!(
                "{}x{} -> {}x{} (ratio {:.3})",
                report.original_width, report.original_height, report.new_width, report.new_height, report.resolution_ratio
            );
        }

        Command::Overviews {
            input,
            min_size,
            method,
        } => {
            let config = PyramidConfig {
                minimum_overview_dimension: min_size,
                kernel: method.parse()?,
                ..PyramidConfig::default()
            };
            let mut raster = driver.open_update(&input)?;
            let spec = OverviewPyramidBuilder::new(config).build(&mut raster)?;
            println!("{}: overviews {:?}", input.display(), spec.factors());
        }

        Command::Validate { input, profile } => {
            let raster = driver.open(&input)?;
            let report = match profile {
                Some(name) => cog::validate_against(&raster, name.parse()?)?,
                None => cog::validate(&raster)?,
            };
            print_validation(&input, &report);
        }

        Command::Optimize { input, output, layout } => {
            let config = layout.to_config()?;
            let raster = driver.open(&input)?;
            let (_, report) = cog::optimize(&raster, &driver, &output, &config)?;
            println!(
                "{} -> {} bytes ({:.1}% smaller), overviews {:?}",
                report.input_bytes, report.output_bytes, report.size_reduction_percent, report.overview_factors
            );
            print_validation(&output, &report.validation);
        }

        Command::BatchOptimize {
            inputs,
            output_dir,
            workers,
            layout,
        } => {
            let config = layout.to_config()?;
            let batch_config = workers.map_or_else(BatchConfig::default, |max_workers| BatchConfig { max_workers });
            let report =
                ParallelBatchDispatcher::new(batch_config).run(inputs.as_slice(), &output_dir, optimize_into, &config)?;
            for result in &report.results {
                match (&result.output_path, &result.error) {
                    (Some(path), _) => println!("ok   {} -> {}", result.input_path.display(), path.display()),
                    (None, error) => println!(
                        "fail {}: {}",
                        result.input_path.display(),
                        error.as_deref().unwrap_or("unknown error")
                    ),
                }
            }
            println!(
                "{} succeeded, {} failed in {:.2?}",
                report.successful, report.failed, report.total_time
            );
        }

        Command::Read {
            input,
            bbox,
            resolution,
            max_pixels,
            fetch,
        } => {
            let raster = driver.open(&input)?;
            let request = RangeRequest {
                bbox,
                target_resolution: resolution,
                max_pixels,
            };
            let (block, report) = EfficientRangeReader::new(&raster).read(&request)?;
            println!(
                "level {} (1/{}), window {}, {} blocks in {} ranges, {} bytes ({:.1}x reduction), {} values",
                report.level,
                report.factor,
                report.window,
                report.blocks_touched,
                report.byte_ranges.len(),
                report.bytes_transferred,
                report.data_reduction_factor,
                block.len()
            );
            if fetch {
                let source = LocalRangeSource::new(&input)?;
                let chunks = fetch_ranges(&source, &report.byte_ranges)?;
                let fetched: usize = chunks.iter().map(Vec::len).sum();
                println!("fetched {} bytes in {} requests", fetched, chunks.len());
            }
        }

        Command::Memory => {
            let snapshot = MemoryMonitor::new().snapshot();
            println!(
                "total {:.0} MB, available {:.0} MB, used {:.0} MB ({:.1}%), process {:.1} MB",
                snapshot.total_mb, snapshot.available_mb, snapshot.used_mb, snapshot.usage_percent, snapshot.process_rss_mb
            );
        }
    }

    Ok(())
}

/// One batch job: open, optimize into `output_dir` under the same file name.
fn optimize_into(input: &Path, output_dir: &Path, config: &OptimizeConfig) -> Result<PathBuf> {
    let driver = GdalDriver::new();
    let raster = driver.open(input)?;
    let file_name = input
        .file_name()
        .ok_or_else(|| RasterError::NotFound(input.display().to_string()))?;
    let output_path = output_dir.join(file_name);
    cog::optimize(&raster, &driver, &output_path, config)?;
    Ok(output_path)
}

/// WKT (or other definition) for radius mode detection.
fn raster_wkt(crs: &str) -> String {
    gdal::spatial_ref::SpatialRef::from_definition(crs)
        .and_then(|srs| srs.to_wkt())
        .unwrap_or_else(|_| crs.to_string())
}

fn print_validation(path: &Path, report: &ValidationReport) {
    let verdict = if report.is_valid_cog { "valid COG" } else { "not a valid COG" };
    println!(
        "{}: {} (small read {:.1} ms, amplification {:.2}x)",
        path.display(),
        verdict,
        report.read_latency_ms,
        report.read_amplification
    );
    for issue in &report.issues {
        println!("  issue:   {}", issue);
    }
    for warning in &report.warnings {
        println!("  warning: {}", warning);
    }
}
