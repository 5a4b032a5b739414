//! Raster geometry, on-disk layout descriptors and the raster I/O traits.
//!
//! Every engine operation talks to storage through [`RasterDataset`] (an open
//! handle) and [`RasterDriver`] (open/create by path). The in-memory backend lives
//! in [`crate::memory`]; the GDAL backend in `gdal_io` behind the `gdal` feature.

use crate::error::{RasterError, Result};
use ndarray::{stack, Array2, Array3, ArrayView2, ArrayView3, Axis};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// Pixel data for a window, laid out as `(band, row, col)`.
pub type PixelBlock = Array3<f64>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    UInt8,
    UInt16,
    Int16,
    UInt32,
    Int32,
    Float32,
    Float64,
}

impl DataType {
    pub fn byte_width(&self) -> usize {
        match self {
            DataType::UInt8 => 1,
            DataType::UInt16 | DataType::Int16 => 2,
            DataType::UInt32 | DataType::Int32 | DataType::Float32 => 4,
            DataType::Float64 => 8,
        }
    }

    pub fn is_float(&self) -> bool {
        matches!(self, DataType::Float32 | DataType::Float64)
    }

    /// Round and clamp a computed value into what this type can store.
    pub fn coerce(&self, value: f64) -> f64 {
        let clamp_int = |lo: f64, hi: f64| {
            if value.is_nan() {
                0.0
            } else {
                value.round().clamp(lo, hi)
            }
        };
        match self {
            DataType::UInt8 => clamp_int(0.0, u8::MAX as f64),
            DataType::UInt16 => clamp_int(0.0, u16::MAX as f64),
            DataType::Int16 => clamp_int(i16::MIN as f64, i16::MAX as f64),
            DataType::UInt32 => clamp_int(0.0, u32::MAX as f64),
            DataType::Int32 => clamp_int(i32::MIN as f64, i32::MAX as f64),
            DataType::Float32 => value as f32 as f64,
            DataType::Float64 => value,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DataType::UInt8 => "Byte",
            DataType::UInt16 => "UInt16",
            DataType::Int16 => "Int16",
            DataType::UInt32 => "UInt32",
            DataType::Int32 => "Int32",
            DataType::Float32 => "Float32",
            DataType::Float64 => "Float64",
        }
    }
}

/// Affine pixel-to-world transform in GDAL coefficient order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoTransform(pub [f64; 6]);

impl GeoTransform {
    /// North-up transform; `pixel_height` is given as a positive size.
    pub fn north_up(origin_x: f64, origin_y: f64, pixel_width: f64, pixel_height: f64) -> Self {
        GeoTransform([origin_x, pixel_width, 0.0, origin_y, 0.0, -pixel_height])
    }

    pub fn pixel_to_world(&self, col: f64, row: f64) -> (f64, f64) {
        let gt = &self.0;
        (
            gt[0] + col * gt[1] + row * gt[2],
            gt[3] + col * gt[4] + row * gt[5],
        )
    }

    /// Inverse mapping; `None` when the transform is singular.
    pub fn world_to_pixel(&self, x: f64, y: f64) -> Option<(f64, f64)> {
        let gt = &self.0;
        let det = gt[1] * gt[5] - gt[2] * gt[4];
        if det.abs() < f64::EPSILON {
            return None;
        }
        let dx = x - gt[0];
        let dy = y - gt[3];
        Some((
            (gt[5] * dx - gt[2] * dy) / det,
            (gt[1] * dy - gt[4] * dx) / det,
        ))
    }

    /// Pixel size along x and y, always positive.
    pub fn resolution(&self) -> (f64, f64) {
        let gt = &self.0;
        (gt[1].hypot(gt[4]), gt[2].hypot(gt[5]))
    }

    /// Same origin, pixel size multiplied by `fx`/`fy`.
    pub fn scaled(&self, fx: f64, fy: f64) -> Self {
        let gt = &self.0;
        GeoTransform([gt[0], gt[1] * fx, gt[2] * fy, gt[3], gt[4] * fx, gt[5] * fy])
    }

    pub fn bounds(&self, width: usize, height: usize) -> BoundingBox {
        let corners = [
            self.pixel_to_world(0.0, 0.0),
            self.pixel_to_world(width as f64, 0.0),
            self.pixel_to_world(0.0, height as f64),
            self.pixel_to_world(width as f64, height as f64),
        ];
        BoundingBox::around(&corners)
    }
}

/// Axis-aligned world-coordinate rectangle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl BoundingBox {
    pub fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
        Self {
            min_x,
            min_y,
            max_x,
            max_y,
        }
    }

    pub fn around(points: &[(f64, f64)]) -> Self {
        let mut bbox = BoundingBox::new(f64::MAX, f64::MAX, f64::MIN, f64::MIN);
        for &(x, y) in points {
            bbox.min_x = bbox.min_x.min(x);
            bbox.min_y = bbox.min_y.min(y);
            bbox.max_x = bbox.max_x.max(x);
            bbox.max_y = bbox.max_y.max(y);
        }
        bbox
    }

    pub fn intersection(&self, other: &BoundingBox) -> Option<BoundingBox> {
        let result = BoundingBox::new(
            self.min_x.max(other.min_x),
            self.min_y.max(other.min_y),
            self.max_x.min(other.max_x),
            self.max_y.min(other.max_y),
        );
        (result.min_x < result.max_x && result.min_y < result.max_y).then_some(result)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockShape {
    /// Scanline/strip organisation, `rows_per_strip` full-width rows per block.
    Untiled { rows_per_strip: usize },
    Tiled { width: usize, height: usize },
}

impl BlockShape {
    pub fn square(size: usize) -> Self {
        BlockShape::Tiled {
            width: size,
            height: size,
        }
    }

    pub fn scanlines() -> Self {
        BlockShape::Untiled { rows_per_strip: 1 }
    }

    pub fn is_tiled(&self) -> bool {
        matches!(self, BlockShape::Tiled { .. })
    }

    /// Block width and height for a raster (level) of the given width.
    pub fn block_dims(&self, raster_width: usize) -> (usize, usize) {
        match *self {
            BlockShape::Untiled { rows_per_strip } => (raster_width, rows_per_strip.max(1)),
            BlockShape::Tiled { width, height } => (width, height),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Lzw,
    Deflate,
    Zstd,
}

impl Compression {
    pub fn gdal_name(&self) -> &'static str {
        match self {
            Compression::None => "NONE",
            Compression::Lzw => "LZW",
            Compression::Deflate => "DEFLATE",
            Compression::Zstd => "ZSTD",
        }
    }
}

impl FromStr for Compression {
    type Err = RasterError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "NONE" => Ok(Compression::None),
            "LZW" => Ok(Compression::Lzw),
            "DEFLATE" => Ok(Compression::Deflate),
            "ZSTD" => Ok(Compression::Zstd),
            _ => Err(RasterError::InvalidCompression(s.to_string())),
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.gdal_name())
    }
}

/// TIFF predictor applied before compression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Predictor {
    None,
    Horizontal,
    FloatingPoint,
}

impl Predictor {
    pub fn tag_value(&self) -> u16 {
        match self {
            Predictor::None => 1,
            Predictor::Horizontal => 2,
            Predictor::FloatingPoint => 3,
        }
    }

    pub fn from_tag(value: u16) -> Self {
        match value {
            2 => Predictor::Horizontal,
            3 => Predictor::FloatingPoint,
            _ => Predictor::None,
        }
    }

    /// Differencing suited to the sample type; nothing for uncompressed output.
    pub fn for_layout(compression: Compression, data_type: DataType) -> Self {
        match (compression, data_type.is_float()) {
            (Compression::None, _) => Predictor::None,
            (_, true) => Predictor::FloatingPoint,
            (_, false) => Predictor::Horizontal,
        }
    }
}

/// Geometry and layout of an open raster.
#[derive(Debug, Clone, PartialEq)]
pub struct RasterMeta {
    pub width: usize,
    pub height: usize,
    pub band_count: usize,
    pub data_type: DataType,
    pub geo_transform: GeoTransform,
    pub crs: String,
    pub nodata: Option<f64>,
    pub block_shape: BlockShape,
    pub compression: Compression,
    pub predictor: Predictor,
    /// Reduction factors of the attached overviews, increasing.
    pub overview_factors: Vec<usize>,
}

impl RasterMeta {
    /// Untiled, uncompressed raster without overviews.
    pub fn new(
        width: usize,
        height: usize,
        band_count: usize,
        data_type: DataType,
        geo_transform: GeoTransform,
        crs: impl Into<String>,
    ) -> Self {
        Self {
            width,
            height,
            band_count,
            data_type,
            geo_transform,
            crs: crs.into(),
            nodata: None,
            block_shape: BlockShape::scanlines(),
            compression: Compression::None,
            predictor: Predictor::None,
            overview_factors: Vec::new(),
        }
    }

    pub fn with_nodata(mut self, nodata: Option<f64>) -> Self {
        self.nodata = nodata;
        self
    }

    pub fn with_layout(
        mut self,
        block_shape: BlockShape,
        compression: Compression,
        predictor: Predictor,
    ) -> Self {
        self.block_shape = block_shape;
        self.compression = compression;
        self.predictor = predictor;
        self
    }

    /// Copy with a new pixel grid; overviews are not carried over.
    pub fn regridded(&self, width: usize, height: usize, geo_transform: GeoTransform) -> Self {
        Self {
            width,
            height,
            geo_transform,
            overview_factors: Vec::new(),
            ..self.clone()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(RasterError::InvalidDimensions(self.width, self.height));
        }
        if self.band_count == 0 {
            return Err(RasterError::invalid("band_count", "raster has no bands"));
        }
        Ok(())
    }

    pub fn bytes_per_pixel(&self) -> usize {
        self.band_count * self.data_type.byte_width()
    }

    pub fn pixel_count(&self) -> usize {
        self.width * self.height
    }

    pub fn full_window(&self) -> Window {
        Window::new(0, 0, self.width, self.height)
    }

    pub fn resolution(&self) -> (f64, f64) {
        self.geo_transform.resolution()
    }

    pub fn bounds(&self) -> BoundingBox {
        self.geo_transform.bounds(self.width, self.height)
    }

    /// Number of levels including full resolution (level 0).
    pub fn level_count(&self) -> usize {
        1 + self.overview_factors.len()
    }

    pub fn level_factor(&self, level: usize) -> Option<usize> {
        match level {
            0 => Some(1),
            n => self.overview_factors.get(n - 1).copied(),
        }
    }

    pub fn level_dims(&self, level: usize) -> Option<(usize, usize)> {
        self.level_factor(level).map(|factor| {
            (
                self.width.div_ceil(factor),
                self.height.div_ceil(factor),
            )
        })
    }

    pub fn is_nodata(&self, value: f64) -> bool {
        value.is_nan() || self.nodata.is_some_and(|nd| value == nd)
    }
}

/// Integer pixel rectangle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Window {
    pub col_off: usize,
    pub row_off: usize,
    pub width: usize,
    pub height: usize,
}

impl Window {
    pub fn new(col_off: usize, row_off: usize, width: usize, height: usize) -> Self {
        Self {
            col_off,
            row_off,
            width,
            height,
        }
    }

    pub fn col_end(&self) -> usize {
        self.col_off + self.width
    }

    pub fn row_end(&self) -> usize {
        self.row_off + self.height
    }

    pub fn area(&self) -> usize {
        self.width * self.height
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn intersection(&self, other: &Window) -> Option<Window> {
        let col_off = self.col_off.max(other.col_off);
        let row_off = self.row_off.max(other.row_off);
        let col_end = self.col_end().min(other.col_end());
        let row_end = self.row_end().min(other.row_end());
        (col_off < col_end && row_off < row_end)
            .then(|| Window::new(col_off, row_off, col_end - col_off, row_end - row_off))
    }

    /// Smallest window holding both.
    pub fn union(&self, other: &Window) -> Window {
        let col_off = self.col_off.min(other.col_off);
        let row_off = self.row_off.min(other.row_off);
        Window::new(
            col_off,
            row_off,
            self.col_end().max(other.col_end()) - col_off,
            self.row_end().max(other.row_end()) - row_off,
        )
    }

    pub fn contains(&self, other: &Window) -> bool {
        other.col_off >= self.col_off
            && other.row_off >= self.row_off
            && other.col_end() <= self.col_end()
            && other.row_end() <= self.row_end()
    }

    /// Offsets of `self` inside `outer`, which must contain it.
    pub fn relative_to(&self, outer: &Window) -> Window {
        Window::new(
            self.col_off - outer.col_off,
            self.row_off - outer.row_off,
            self.width,
            self.height,
        )
    }

    pub fn fits_within(&self, width: usize, height: usize) -> bool {
        self.col_end() <= width && self.row_end() <= height
    }

    pub(crate) fn check_bounds(&self, width: usize, height: usize) -> Result<()> {
        if self.is_empty() || !self.fits_within(width, height) {
            return Err(RasterError::WindowOutOfBounds {
                window: *self,
                width,
                height,
            });
        }
        Ok(())
    }
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "(col {}, row {}, {}x{})",
            self.col_off, self.row_off, self.width, self.height
        )
    }
}

/// Contiguous span of bytes in a stored raster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub offset: u64,
    pub length: u64,
}

impl ByteRange {
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }
}

/// An open raster dataset.
///
/// Level 0 is full resolution; level `n` is the `n`-th overview listed in
/// [`RasterMeta::overview_factors`]. Dropping the handle closes it.
pub trait RasterDataset {
    fn meta(&self) -> RasterMeta;

    /// Path or name used in logs and errors.
    fn identifier(&self) -> &str;

    fn is_writable(&self) -> bool;

    fn read_band_level(&self, level: usize, band: usize, window: &Window) -> Result<Array2<f64>>;

    fn write_band_level(
        &mut self,
        level: usize,
        band: usize,
        window: &Window,
        data: ArrayView2<'_, f64>,
    ) -> Result<()>;

    /// Allocate (empty) overview levels with the given factors, replacing any existing ones.
    fn create_overviews(&mut self, factors: &[usize]) -> Result<()>;

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    /// Bytes the dataset occupies in its store.
    fn storage_bytes(&self) -> Result<u64>;

    /// Location of a (pixel-interleaved) block, when the backend can tell.
    fn block_byte_range(&self, _level: usize, _block_col: usize, _block_row: usize) -> Option<ByteRange> {
        None
    }

    fn read_band(&self, band: usize, window: &Window) -> Result<Array2<f64>> {
        self.read_band_level(0, band, window)
    }

    fn write_band(&mut self, band: usize, window: &Window, data: ArrayView2<'_, f64>) -> Result<()> {
        self.write_band_level(0, band, window, data)
    }

    fn read_level(&self, level: usize, window: &Window) -> Result<PixelBlock> {
        let band_count = self.meta().band_count;
        let planes = (0..band_count)
            .map(|band| self.read_band_level(level, band, window))
            .collect::<Result<Vec<_>>>()?;
        let views: Vec<_> = planes.iter().map(|plane| plane.view()).collect();
        Ok(stack(Axis(0), &views)?)
    }

    fn read(&self, window: &Window) -> Result<PixelBlock> {
        self.read_level(0, window)
    }

    fn write_level(&mut self, level: usize, window: &Window, block: ArrayView3<'_, f64>) -> Result<()> {
        for (band, plane) in block.outer_iter().enumerate() {
            self.write_band_level(level, band, window, plane)?;
        }
        Ok(())
    }

    fn write(&mut self, window: &Window, block: ArrayView3<'_, f64>) -> Result<()> {
        self.write_level(0, window, block)
    }
}

/// Opens and creates datasets by path.
pub trait RasterDriver {
    type Dataset: RasterDataset;

    fn open(&self, path: &Path) -> Result<Self::Dataset>;

    fn open_update(&self, path: &Path) -> Result<Self::Dataset>;

    /// Create a dataset with the geometry and layout of `meta` (overviews ignored).
    fn create(&self, path: &Path, meta: &RasterMeta) -> Result<Self::Dataset>;
}
