//! Windowed read → transform → write loop under a memory budget.

use crate::chunking::{WindowBounds, WindowGrid};
use crate::error::{RasterError, Result, TransformError};
use crate::monitor::MemoryMonitor;
use crate::planner::{self, DEFAULT_SAFETY_FACTOR};
use crate::raster::{PixelBlock, RasterDataset, RasterDriver};
use log::{debug, info};
use std::path::Path;
use std::time::{Duration, Instant};

/// Process RSS is sampled once every this many windows.
const MEMORY_SAMPLE_INTERVAL: usize = 16;

#[derive(Debug, Clone, PartialEq)]
pub struct ProcessConfig {
    /// Window side; chosen by the planner when `None`.
    pub window_size: Option<usize>,
    pub overlap: usize,
    pub max_memory_bytes: u64,
    pub safety_factor: f64,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            window_size: None,
            overlap: 0,
            max_memory_bytes: 512 * 1024 * 1024,
            safety_factor: DEFAULT_SAFETY_FACTOR,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProcessingReport {
    pub window_size: usize,
    pub windows_processed: usize,
    pub overlap_pixels: usize,
    pub total_time: Duration,
    pub peak_memory_mb: f64,
    pub pixels_processed: usize,
    pub throughput_pixels_per_sec: f64,
}

/// Applies a block transform to a raster one window at a time.
///
/// The transform receives the padded block `(band, row, col)` for
/// [`WindowBounds::read`] and must return a block of the same shape; only the
/// un-overlapped centre is written to the output.
#[derive(Debug, Clone)]
pub struct WindowedProcessor {
    config: ProcessConfig,
    monitor: MemoryMonitor,
}

impl WindowedProcessor {
    pub fn new(config: ProcessConfig) -> Self {
        Self {
            config,
            monitor: MemoryMonitor::new(),
        }
    }

    pub fn config(&self) -> &ProcessConfig {
        &self.config
    }

    pub fn run<R, D, F>(
        &self,
        input: &R,
        driver: &D,
        output_path: &Path,
        mut transform: F,
    ) -> Result<(D::Dataset, ProcessingReport)>
    where
        R: RasterDataset + ?Sized,
        D: RasterDriver,
        F: FnMut(&WindowBounds, PixelBlock) -> std::result::Result<PixelBlock, TransformError>,
    {
        let start = Instant::now();
        let meta = input.meta();
        meta.validate()?;

        let window_size = match self.config.window_size {
            Some(size) => size,
            None => {
                planner::plan_with_overlap(
                    &meta,
                    self.config.overlap,
                    self.config.max_memory_bytes,
                    self.config.safety_factor,
                )?
                .window_size
            }
        };
        let grid = WindowGrid::new(meta.width, meta.height, window_size, self.config.overlap)?;

        info!(
            "Processing {} ({}x{}, {} bands) in {} windows of {}x{} (overlap {})",
            input.identifier(),
            meta.width,
            meta.height,
            meta.band_count,
            grid.total_windows,
            window_size,
            window_size,
            self.config.overlap
        );

        let mut output_meta = meta.clone();
        output_meta.overview_factors.clear();
        let mut output = driver.create(output_path, &output_meta)?;

        let mut peak_memory_mb = self.monitor.process_rss_mb();
        let mut overlap_pixels = 0;
        let mut pixels_processed = 0;
        let mut windows_processed = 0;

        for bounds in &grid {
            let block = input.read(&bounds.read)?;
            let expected = block.dim();
            let result = transform(&bounds, block).map_err(|source| RasterError::WindowTransform {
                window: bounds.read,
                source,
            })?;
            if result.dim() != expected {
                return Err(RasterError::BlockShapeMismatch {
                    window: bounds.read,
                    expected,
                    got: result.dim(),
                });
            }
            output.write(&bounds.target, bounds.central_view(&result))?;

            windows_processed += 1;
            overlap_pixels += bounds.overlap_pixels();
            pixels_processed += bounds.target.area();
            if windows_processed % MEMORY_SAMPLE_INTERVAL == 0 {
                peak_memory_mb = peak_memory_mb.max(self.monitor.process_rss_mb());
            }
            debug!(
                "Window {}/{} done: target={}",
                windows_processed, grid.total_windows, bounds.target
            );
        }

        output.flush()?;
        peak_memory_mb = peak_memory_mb.max(self.monitor.process_rss_mb());

        let total_time = start.elapsed();
        let seconds = total_time.as_secs_f64();
        let throughput_pixels_per_sec = if seconds > 0.0 {
            pixels_processed as f64 / seconds
        } else {
            0.0
        };

        info!(
            "Processed {} windows ({} pixels) in {:.2?}, {:.0} pixels/s, peak RSS {:.1} MB",
            windows_processed, pixels_processed, total_time, throughput_pixels_per_sec, peak_memory_mb
        );

        Ok((
            output,
            ProcessingReport {
                window_size,
                windows_processed,
                overlap_pixels,
                total_time,
                peak_memory_mb,
                pixels_processed,
                throughput_pixels_per_sec,
            },
        ))
    }
}
