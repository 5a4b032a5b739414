use crate::raster::Window;
use thiserror::Error;

/// Error raised by a user-supplied window transform.
pub type TransformError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Error, Debug)]
pub enum RasterError {
    #[error("GDAL error: {0}")]
    Gdal(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Array shape error: {0}")]
    ShapeError(#[from] ndarray::ShapeError),

    #[error(
        "Insufficient memory budget: {max_memory_bytes} bytes x {safety_factor} cannot hold a \
         {min_window}x{min_window} window at {bytes_per_pixel} bytes/pixel"
    )]
    InsufficientMemoryBudget {
        max_memory_bytes: u64,
        safety_factor: f64,
        bytes_per_pixel: usize,
        min_window: usize,
    },

    #[error("CRS mismatch for zone {zone_id}: raster is {raster_crs}, zone is {zone_crs} ({reason})")]
    CrsMismatch {
        zone_id: String,
        raster_crs: String,
        zone_crs: String,
        reason: String,
    },

    #[error("Unsupported resampling method: {0} (expected nearest, bilinear or average)")]
    UnsupportedResamplingMethod(String),

    #[error("Permission denied: {0} is opened read-only")]
    PermissionDenied(String),

    #[error("Transform failed at window {window}: {source}")]
    WindowTransform {
        window: Window,
        #[source]
        source: TransformError,
    },

    #[error("Transform returned shape {got:?} at window {window}, expected {expected:?}")]
    BlockShapeMismatch {
        window: Window,
        expected: (usize, usize, usize),
        got: (usize, usize, usize),
    },

    #[error("Invalid parameter {name}: {reason}")]
    InvalidParameter { name: &'static str, reason: String },

    #[error("Raster has invalid dimensions: {0}x{1}")]
    InvalidDimensions(usize, usize),

    #[error("Invalid window size: {0} (must be positive)")]
    InvalidWindowSize(usize),

    #[error("Window {window} lies outside {width}x{height} raster")]
    WindowOutOfBounds {
        window: Window,
        width: usize,
        height: usize,
    },

    #[error("Invalid compression type: {0}")]
    InvalidCompression(String),

    #[error("Invalid tile size: {0} (must be multiple of 16)")]
    InvalidTileSize(usize),

    #[error("Raster not found: {0}")]
    NotFound(String),

    #[error("Not a raster dataset: {0}")]
    NotARaster(String),

    #[error("Overview level {0} does not exist")]
    MissingOverview(usize),

    #[error("Requested area does not intersect the raster: {0}")]
    EmptyRequest(String),

    #[error("Request needs {pixels} pixels even at the coarsest level, limit is {max_pixels}")]
    RequestTooLarge { pixels: usize, max_pixels: usize },

    #[error("COG creation failed: {0}")]
    CogCreationFailed(String),

    #[error("Worker pool error: {0}")]
    WorkerPool(String),
}

impl RasterError {
    pub(crate) fn invalid(name: &'static str, reason: impl Into<String>) -> Self {
        RasterError::InvalidParameter {
            name,
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, RasterError>;

#[cfg(feature = "gdal")]
impl From<gdal::errors::GdalError> for RasterError {
    fn from(err: gdal::errors::GdalError) -> Self {
        RasterError::Gdal(err.to_string())
    }
}
