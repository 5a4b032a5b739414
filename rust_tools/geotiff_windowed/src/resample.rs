//! Resolution change over the output grid, one window at a time.

use crate::chunking::WindowGrid;
use crate::error::{RasterError, Result};
use crate::raster::{PixelBlock, RasterDataset, RasterDriver, Window};
use log::{debug, info};
use ndarray::{Array3, ArrayView3};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResamplingKernel {
    Nearest,
    Bilinear,
    /// Area-weighted mean of the covered source pixels.
    Average,
}

impl ResamplingKernel {
    pub fn name(&self) -> &'static str {
        match self {
            ResamplingKernel::Nearest => "nearest",
            ResamplingKernel::Bilinear => "bilinear",
            ResamplingKernel::Average => "average",
        }
    }
}

impl FromStr for ResamplingKernel {
    type Err = RasterError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "nearest" => Ok(ResamplingKernel::Nearest),
            "bilinear" => Ok(ResamplingKernel::Bilinear),
            "average" => Ok(ResamplingKernel::Average),
            _ => Err(RasterError::UnsupportedResamplingMethod(s.to_string())),
        }
    }
}

impl fmt::Display for ResamplingKernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Source samples and weights feeding one output row or column.
type Taps = Vec<Vec<(usize, f64)>>;

fn axis_taps(kernel: ResamplingKernel, offset: usize, len: usize, scale: f64, src_len: usize) -> Taps {
    let last = src_len.saturating_sub(1);
    (offset..offset + len)
        .map(|i| {
            let i = i as f64;
            match kernel {
                ResamplingKernel::Nearest => {
                    vec![((((i + 0.5) * scale).floor() as usize).min(last), 1.0)]
                }
                ResamplingKernel::Bilinear => {
                    let x = ((i + 0.5) * scale - 0.5).clamp(0.0, last as f64);
                    let x0 = x.floor() as usize;
                    let x1 = (x0 + 1).min(last);
                    let frac = x - x0 as f64;
                    if frac > 0.0 && x1 != x0 {
                        vec![(x0, 1.0 - frac), (x1, frac)]
                    } else {
                        vec![(x0, 1.0)]
                    }
                }
                ResamplingKernel::Average => {
                    let start = i * scale;
                    let end = ((i + 1.0) * scale).min(src_len as f64);
                    let first = (start.floor() as usize).min(last);
                    let stop = (end.ceil() as usize).clamp(first + 1, src_len.max(1));
                    let taps: Vec<_> = (first..stop)
                        .filter_map(|s| {
                            let weight = end.min(s as f64 + 1.0) - start.max(s as f64);
                            (weight > 0.0).then_some((s, weight))
                        })
                        .collect();
                    if taps.is_empty() {
                        vec![(first, 1.0)]
                    } else {
                        taps
                    }
                }
            }
        })
        .collect()
}

fn tap_span(taps: &Taps) -> (usize, usize) {
    let indices = taps.iter().flatten().map(|&(index, _)| index);
    let lo = indices.clone().min().unwrap_or(0);
    let hi = indices.max().unwrap_or(0);
    (lo, hi + 1 - lo)
}

/// Maps one output window onto the source region it needs.
///
/// `scale` is source pixels per output pixel along x and y. Output pixel `i`
/// covers source coordinates `[i * scale, (i + 1) * scale)`.
pub(crate) struct BlockResampler {
    col_taps: Taps,
    row_taps: Taps,
    pub(crate) source_window: Window,
}

impl BlockResampler {
    pub(crate) fn new(
        kernel: ResamplingKernel,
        output: &Window,
        scale: (f64, f64),
        source_dims: (usize, usize),
    ) -> Self {
        let col_taps = axis_taps(kernel, output.col_off, output.width, scale.0, source_dims.0);
        let row_taps = axis_taps(kernel, output.row_off, output.height, scale.1, source_dims.1);
        let (col_off, width) = tap_span(&col_taps);
        let (row_off, height) = tap_span(&row_taps);
        Self {
            col_taps,
            row_taps,
            source_window: Window::new(col_off, row_off, width, height),
        }
    }

    /// Resample a block read for [`Self::source_window`]. Missing samples are
    /// left out and the remaining weights renormalised.
    pub(crate) fn apply(&self, source: ArrayView3<'_, f64>, nodata: Option<f64>) -> PixelBlock {
        let bands = source.dim().0;
        let fill = nodata.unwrap_or(f64::NAN);
        let is_missing = |v: f64| v.is_nan() || nodata.is_some_and(|nd| v == nd);
        let (col0, row0) = (self.source_window.col_off, self.source_window.row_off);

        Array3::from_shape_fn(
            (bands, self.row_taps.len(), self.col_taps.len()),
            |(band, row, col)| {
                let mut total = 0.0;
                let mut weight = 0.0;
                for &(src_row, row_weight) in &self.row_taps[row] {
                    for &(src_col, col_weight) in &self.col_taps[col] {
                        let value = source[[band, src_row - row0, src_col - col0]];
                        if !is_missing(value) {
                            let w = row_weight * col_weight;
                            total += value * w;
                            weight += w;
                        }
                    }
                }
                if weight > 0.0 {
                    total / weight
                } else {
                    fill
                }
            },
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResampleConfig {
    /// Output pixel size in map units, applied to both axes.
    pub target_resolution: f64,
    pub kernel: ResamplingKernel,
    /// Output window side.
    pub window_size: usize,
}

impl ResampleConfig {
    /// Validated config; an unknown kernel name fails here, before any I/O.
    pub fn new(target_resolution: f64, kernel: &str, window_size: usize) -> Result<Self> {
        if !(target_resolution.is_finite() && target_resolution > 0.0) {
            return Err(RasterError::invalid(
                "target_resolution",
                format!("{} is not a positive resolution", target_resolution),
            ));
        }
        if window_size == 0 {
            return Err(RasterError::InvalidWindowSize(window_size));
        }
        Ok(Self {
            target_resolution,
            kernel: kernel.parse()?,
            window_size,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResampleReport {
    pub original_width: usize,
    pub original_height: usize,
    pub new_width: usize,
    pub new_height: usize,
    pub original_resolution: (f64, f64),
    pub target_resolution: f64,
    /// target / original x resolution; above 1 means coarser output.
    pub resolution_ratio: f64,
    pub windows_processed: usize,
    pub elapsed: Duration,
}

pub struct Resampler {
    config: ResampleConfig,
}

impl Resampler {
    pub fn new(config: ResampleConfig) -> Self {
        Self { config }
    }

    pub fn resample<R, D>(&self, input: &R, driver: &D, output_path: &Path) -> Result<(D::Dataset, ResampleReport)>
    where
        R: RasterDataset + ?Sized,
        D: RasterDriver,
    {
        let start = Instant::now();
        let meta = input.meta();
        meta.validate()?;

        let (res_x, res_y) = meta.resolution();
        let target = self.config.target_resolution;
        let new_width = ((meta.width as f64 * res_x / target).round() as usize).max(1);
        let new_height = ((meta.height as f64 * res_y / target).round() as usize).max(1);
        let scale = (target / res_x, target / res_y);

        info!(
            "Resampling {} from {}x{} ({:.6} x {:.6}) to {}x{} ({:.6}) with {}",
            input.identifier(),
            meta.width,
            meta.height,
            res_x,
            res_y,
            new_width,
            new_height,
            target,
            self.config.kernel
        );

        let output_meta = meta.regridded(new_width, new_height, meta.geo_transform.scaled(scale.0, scale.1));
        let mut output = driver.create(output_path, &output_meta)?;

        let grid = WindowGrid::new(new_width, new_height, self.config.window_size, 0)?;
        for bounds in &grid {
            let resampler = BlockResampler::new(self.config.kernel, &bounds.target, scale, (meta.width, meta.height));
            let source = input.read(&resampler.source_window)?;
            let block = resampler.apply(source.view(), meta.nodata);
            output.write(&bounds.target, block.view())?;
            debug!(
                "Resampled output window {} from source {}",
                bounds.target, resampler.source_window
            );
        }
        output.flush()?;

        let report = ResampleReport {
            original_width: meta.width,
            original_height: meta.height,
            new_width,
            new_height,
            original_resolution: (res_x, res_y),
            target_resolution: target,
            resolution_ratio: target / res_x,
            windows_processed: grid.total_windows,
            elapsed: start.elapsed(),
        };
        info!(
            "Resampling finished: {} windows in {:.2?}",
            report.windows_processed, report.elapsed
        );
        Ok((output, report))
    }
}
