// Library exports for testing and reuse

pub mod batch;
pub mod chunking;
pub mod cli;
pub mod cog;
pub mod crs;
pub mod error;
pub mod focal;
#[cfg(feature = "gdal")]
pub mod gdal_io;
pub mod geometry;
pub mod memory;
pub mod monitor;
pub mod planner;
pub mod processor;
pub mod pyramid;
pub mod range_read;
pub mod raster;
pub mod resample;
pub mod zonal;

// Re-export commonly used types
pub use batch::{BatchConfig, BatchJobResult, BatchReport, ParallelBatchDispatcher};
pub use chunking::{WindowBounds, WindowGrid};
pub use cog::{optimize, validate, validate_against, AccessProfile, OptimizeConfig, ValidationReport};
pub use crs::CrsTransformer;
pub use error::{RasterError, Result, TransformError};
pub use memory::{MemoryDriver, MemoryRaster};
pub use monitor::{MemoryMonitor, MemorySnapshot};
pub use planner::{plan, plan_with_overlap, MemoryPlan};
pub use processor::{ProcessConfig, ProcessingReport, WindowedProcessor};
pub use pyramid::{overview_factors, OverviewPyramidBuilder, PyramidConfig, PyramidSpec};
pub use range_read::{ByteRangeSource, EfficientRangeReader, RangeRequest, ReadReport};
pub use raster::{
    BlockShape, BoundingBox, Compression, DataType, GeoTransform, PixelBlock, RasterDataset, RasterDriver,
    RasterMeta, Window,
};
pub use resample::{ResampleConfig, ResampleReport, Resampler, ResamplingKernel};
pub use zonal::{Statistic, ZonalConfig, ZonalStatisticsEngine, Zone, ZoneRecord};

#[cfg(feature = "gdal")]
pub use gdal_io::{GdalDriver, GdalRaster};
