//! Overview pyramid planning and in-place construction.

use crate::chunking::WindowGrid;
use crate::error::{RasterError, Result};
use crate::raster::{RasterDataset, RasterMeta};
use crate::resample::{BlockResampler, ResamplingKernel};
use log::{debug, info};
use std::time::Instant;

pub const DEFAULT_MIN_OVERVIEW_DIMENSION: usize = 256;

/// Power-of-two reduction factors (2, 4, 8, …) for which the shorter axis
/// still spans at least `minimum_dimension` pixels.
pub fn overview_factors(width: usize, height: usize, minimum_dimension: usize) -> Vec<usize> {
    let shorter = width.min(height) as f64;
    let minimum = minimum_dimension.max(1) as f64;
    let mut factors = Vec::new();
    let mut factor = 2usize;
    while shorter / factor as f64 >= minimum {
        factors.push(factor);
        factor *= 2;
    }
    factors
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PyramidLevel {
    pub factor: usize,
    pub width: usize,
    pub height: usize,
    pub kernel: ResamplingKernel,
}

/// Overview levels, finest first.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PyramidSpec {
    pub levels: Vec<PyramidLevel>,
}

impl PyramidSpec {
    pub fn factors(&self) -> Vec<usize> {
        self.levels.iter().map(|level| level.factor).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PyramidConfig {
    pub minimum_overview_dimension: usize,
    pub kernel: ResamplingKernel,
    /// Output window side used while filling each level.
    pub window_size: usize,
}

impl Default for PyramidConfig {
    fn default() -> Self {
        Self {
            minimum_overview_dimension: DEFAULT_MIN_OVERVIEW_DIMENSION,
            kernel: ResamplingKernel::Average,
            window_size: 512,
        }
    }
}

pub struct OverviewPyramidBuilder {
    config: PyramidConfig,
}

impl OverviewPyramidBuilder {
    pub fn new(config: PyramidConfig) -> Self {
        Self { config }
    }

    /// Levels that [`Self::build`] would create for this raster.
    pub fn plan(&self, meta: &RasterMeta) -> PyramidSpec {
        let levels = overview_factors(meta.width, meta.height, self.config.minimum_overview_dimension)
            .into_iter()
            .map(|factor| PyramidLevel {
                factor,
                width: meta.width.div_ceil(factor),
                height: meta.height.div_ceil(factor),
                kernel: self.config.kernel,
            })
            .collect();
        PyramidSpec { levels }
    }

    /// Replace the raster's overviews with a freshly computed pyramid.
    ///
    /// Each level is derived from the previous one (the first from full
    /// resolution), window by window over the level being written.
    pub fn build<R: RasterDataset + ?Sized>(&self, raster: &mut R) -> Result<PyramidSpec> {
        if !raster.is_writable() {
            return Err(RasterError::PermissionDenied(raster.identifier().to_string()));
        }
        if self.config.window_size == 0 {
            return Err(RasterError::InvalidWindowSize(0));
        }
        let start = Instant::now();
        let meta = raster.meta();
        meta.validate()?;

        let spec = self.plan(&meta);
        if spec.is_empty() {
            info!(
                "{}: {}x{} is below the {} px overview minimum, no pyramid built",
                raster.identifier(),
                meta.width,
                meta.height,
                self.config.minimum_overview_dimension
            );
            return Ok(spec);
        }

        info!(
            "Building overviews {:?} for {} with {}",
            spec.factors(),
            raster.identifier(),
            self.config.kernel
        );
        raster.create_overviews(&spec.factors())?;

        let mut previous = (1, meta.width, meta.height);
        for (index, level) in spec.levels.iter().enumerate() {
            let (previous_factor, source_width, source_height) = previous;
            let ratio = (level.factor / previous_factor) as f64;
            let grid = WindowGrid::new(level.width, level.height, self.config.window_size, 0)?;

            for bounds in &grid {
                let resampler = BlockResampler::new(
                    self.config.kernel,
                    &bounds.target,
                    (ratio, ratio),
                    (source_width, source_height),
                );
                let source = raster.read_level(index, &resampler.source_window)?;
                let block = resampler.apply(source.view(), meta.nodata);
                raster.write_level(index + 1, &bounds.target, block.view())?;
            }
            debug!(
                "Overview 1/{} ({}x{}) filled in {} windows",
                level.factor, level.width, level.height, grid.total_windows
            );
            previous = (level.factor, level.width, level.height);
        }
        raster.flush()?;

        info!("Built {} overview levels in {:.2?}", spec.levels.len(), start.elapsed());
        Ok(spec)
    }
}
