//! Overview-aware reads of a geographic extent, with the byte ranges they need.
//!
//! Remote storage is reached through [`ByteRangeSource`]; the reader itself
//! only plans which blocks (and so which ranges) a request touches.

use crate::error::{RasterError, Result};
use crate::raster::{BoundingBox, ByteRange, PixelBlock, RasterDataset, RasterMeta, Window};
use log::{debug, info};
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

/// Ranges closer than this are fetched as one request.
pub const DEFAULT_COALESCE_GAP: u64 = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RangeRequest {
    /// Extent in the raster's CRS.
    pub bbox: BoundingBox,
    /// Coarsest acceptable pixel size, in map units.
    pub target_resolution: f64,
    pub max_pixels: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReadReport {
    pub level: usize,
    pub factor: usize,
    pub window: Window,
    pub pixels_read: usize,
    pub blocks_touched: usize,
    /// Coalesced ranges, empty when the backend cannot locate blocks.
    pub byte_ranges: Vec<ByteRange>,
    pub bytes_transferred: u64,
    /// Cost of reading the whole raster at full resolution.
    pub full_resolution_bytes: u64,
    /// Cost of the same extent at full resolution.
    pub window_full_resolution_bytes: u64,
    /// `full_resolution_bytes / bytes_transferred`.
    pub data_reduction_factor: f64,
}

/// Merge sorted-or-not ranges that overlap or sit within `max_gap` bytes.
pub fn coalesce_ranges(mut ranges: Vec<ByteRange>, max_gap: u64) -> Vec<ByteRange> {
    ranges.sort_by_key(|range| range.offset);
    let mut merged: Vec<ByteRange> = Vec::with_capacity(ranges.len());
    for range in ranges {
        match merged.last_mut() {
            Some(last) if range.offset <= last.end() + max_gap => {
                last.length = last.end().max(range.end()) - last.offset;
            }
            _ => merged.push(range),
        }
    }
    merged
}

struct FetchPlan {
    blocks_touched: usize,
    byte_ranges: Vec<ByteRange>,
    bytes: u64,
}

pub struct EfficientRangeReader<'a, R: RasterDataset + ?Sized> {
    raster: &'a R,
    coalesce_gap: u64,
}

impl<'a, R: RasterDataset + ?Sized> EfficientRangeReader<'a, R> {
    pub fn new(raster: &'a R) -> Self {
        Self {
            raster,
            coalesce_gap: DEFAULT_COALESCE_GAP,
        }
    }

    pub fn with_coalesce_gap(mut self, gap: u64) -> Self {
        self.coalesce_gap = gap;
        self
    }

    /// Read the extent from the coarsest level that still meets the target
    /// resolution, stepping coarser while the window exceeds `max_pixels`.
    pub fn read(&self, request: &RangeRequest) -> Result<(PixelBlock, ReadReport)> {
        if !(request.target_resolution.is_finite() && request.target_resolution > 0.0) {
            return Err(RasterError::invalid(
                "target_resolution",
                format!("{} is not a positive resolution", request.target_resolution),
            ));
        }
        if request.max_pixels == 0 {
            return Err(RasterError::invalid("max_pixels", "must be positive"));
        }

        let meta = self.raster.meta();
        meta.validate()?;
        let bbox = &request.bbox;
        let empty = || {
            RasterError::EmptyRequest(format!(
                "[{}, {}, {}, {}] vs {}",
                bbox.min_x,
                bbox.min_y,
                bbox.max_x,
                bbox.max_y,
                self.raster.identifier()
            ))
        };
        let clipped = bbox.intersection(&meta.bounds()).ok_or_else(empty)?;

        let (res_x, res_y) = meta.resolution();
        let finest = res_x.max(res_y);
        let preferred = (0..meta.level_count())
            .filter(|&level| {
                meta.level_factor(level)
                    .is_some_and(|factor| finest * factor as f64 <= request.target_resolution * (1.0 + 1e-9))
            })
            .last()
            .unwrap_or(0);

        let mut chosen = None;
        let mut coarsest_area = 0;
        for level in preferred..meta.level_count() {
            let window = level_window(&meta, &clipped, level).ok_or_else(empty)?;
            coarsest_area = window.area();
            if window.area() <= request.max_pixels {
                chosen = Some((level, window));
                break;
            }
            debug!(
                "Level {} window {} exceeds {} pixels, trying coarser",
                level, window, request.max_pixels
            );
        }
        let (level, window) = chosen.ok_or(RasterError::RequestTooLarge {
            pixels: coarsest_area,
            max_pixels: request.max_pixels,
        })?;
        let factor = meta.level_factor(level).unwrap_or(1);

        let block = self.raster.read_level(level, &window)?;
        let plan = self.fetch_plan(&meta, level, &window);
        let window_full_resolution_bytes = match level_window(&meta, &clipped, 0) {
            Some(full) if level > 0 => self.fetch_plan(&meta, 0, &full).bytes,
            _ => plan.bytes,
        };
        let whole = Window::new(0, 0, meta.width, meta.height);
        let full_resolution_bytes = self.fetch_plan(&meta, 0, &whole).bytes;
        let data_reduction_factor = if plan.bytes == 0 {
            1.0
        } else {
            full_resolution_bytes as f64 / plan.bytes as f64
        };

        let report = ReadReport {
            level,
            factor,
            window,
            pixels_read: window.area(),
            blocks_touched: plan.blocks_touched,
            byte_ranges: plan.byte_ranges,
            bytes_transferred: plan.bytes,
            full_resolution_bytes,
            window_full_resolution_bytes,
            data_reduction_factor,
        };
        info!(
            "Read {} at level {} (1/{}): {} blocks, {} ranges, {} bytes ({:.1}x less than full resolution)",
            window,
            level,
            factor,
            report.blocks_touched,
            report.byte_ranges.len(),
            report.bytes_transferred,
            report.data_reduction_factor
        );
        Ok((block, report))
    }

    fn fetch_plan(&self, meta: &RasterMeta, level: usize, window: &Window) -> FetchPlan {
        let level_width = meta.level_dims(level).map_or(meta.width, |(w, _)| w);
        let (block_width, block_height) = meta.block_shape.block_dims(level_width);
        let block_cols = window.col_off / block_width..window.col_end().div_ceil(block_width);
        let block_rows = window.row_off / block_height..window.row_end().div_ceil(block_height);
        let blocks_touched = block_cols.len() * block_rows.len();

        let ranges: Option<Vec<ByteRange>> = block_rows
            .flat_map(|row| block_cols.clone().map(move |col| (col, row)))
            .map(|(col, row)| self.raster.block_byte_range(level, col, row))
            .collect();

        match ranges {
            Some(ranges) => {
                let byte_ranges = coalesce_ranges(ranges, self.coalesce_gap);
                let bytes = byte_ranges.iter().map(|range| range.length).sum();
                FetchPlan {
                    blocks_touched,
                    byte_ranges,
                    bytes,
                }
            }
            // Block locations unknown: count decoded window bytes instead.
            None => FetchPlan {
                blocks_touched,
                byte_ranges: Vec::new(),
                bytes: (window.area() * meta.bytes_per_pixel()) as u64,
            },
        }
    }
}

/// Pixel window at `level` covering `bbox`, clipped to that level.
fn level_window(meta: &RasterMeta, bbox: &BoundingBox, level: usize) -> Option<Window> {
    let factor = meta.level_factor(level)? as f64;
    let (level_width, level_height) = meta.level_dims(level)?;
    let corners = [
        (bbox.min_x, bbox.min_y),
        (bbox.min_x, bbox.max_y),
        (bbox.max_x, bbox.min_y),
        (bbox.max_x, bbox.max_y),
    ];
    let mut pixels = Vec::with_capacity(4);
    for (x, y) in corners {
        pixels.push(meta.geo_transform.world_to_pixel(x, y)?);
    }
    let extent = BoundingBox::around(&pixels);

    let col_start = (extent.min_x / factor).floor().max(0.0) as usize;
    let row_start = (extent.min_y / factor).floor().max(0.0) as usize;
    let col_end = ((extent.max_x / factor).ceil().max(0.0) as usize).min(level_width);
    let row_end = ((extent.max_y / factor).ceil().max(0.0) as usize).min(level_height);
    (col_start < col_end && row_start < row_end)
        .then(|| Window::new(col_start, row_start, col_end - col_start, row_end - row_start))
}

/// Byte-range transport (local file, object store, HTTP).
pub trait ByteRangeSource: Send + Sync {
    fn read_range(&self, offset: u64, length: usize) -> Result<Vec<u8>>;

    fn size(&self) -> u64;

    /// Path or URL, for logs and errors.
    fn identifier(&self) -> &str;
}

/// Local file range source
pub struct LocalRangeSource {
    path: PathBuf,
    identifier: String,
    size: u64,
}

impl LocalRangeSource {
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let size = std::fs::metadata(&path)?.len();
        Ok(Self {
            identifier: path.display().to_string(),
            path,
            size,
        })
    }
}

impl ByteRangeSource for LocalRangeSource {
    fn read_range(&self, offset: u64, length: usize) -> Result<Vec<u8>> {
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(offset))?;
        let mut buffer = vec![0u8; length];
        file.read_exact(&mut buffer)?;
        Ok(buffer)
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn identifier(&self) -> &str {
        &self.identifier
    }
}

/// Bytes held in memory, for tests and cached objects.
pub struct MemoryRangeSource {
    identifier: String,
    bytes: Vec<u8>,
}

impl MemoryRangeSource {
    pub fn new(identifier: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            identifier: identifier.into(),
            bytes,
        }
    }
}

impl ByteRangeSource for MemoryRangeSource {
    fn read_range(&self, offset: u64, length: usize) -> Result<Vec<u8>> {
        let start = usize::try_from(offset).unwrap_or(usize::MAX);
        start
            .checked_add(length)
            .and_then(|end| self.bytes.get(start..end))
            .map(<[u8]>::to_vec)
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("{}: range {}+{} past end", self.identifier, offset, length),
                )
                .into()
            })
    }

    fn size(&self) -> u64 {
        self.bytes.len() as u64
    }

    fn identifier(&self) -> &str {
        &self.identifier
    }
}

/// Fetch every range, refusing ranges that run past the end of the source.
pub fn fetch_ranges(source: &dyn ByteRangeSource, ranges: &[ByteRange]) -> Result<Vec<Vec<u8>>> {
    ranges
        .iter()
        .map(|range| {
            if range.end() > source.size() {
                return Err(RasterError::invalid(
                    "byte_range",
                    format!(
                        "{}..{} is past the end of {} ({} bytes)",
                        range.offset,
                        range.end(),
                        source.identifier(),
                        source.size()
                    ),
                ));
            }
            let length = usize::try_from(range.length)
                .map_err(|_| RasterError::invalid("byte_range", format!("{} bytes is too long", range.length)))?;
            source.read_range(range.offset, length)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::tests::{gradient, meta};
    use crate::memory::MemoryRaster;
    use crate::pyramid::{OverviewPyramidBuilder, PyramidConfig};
    use crate::raster::{BlockShape, Compression, DataType, Predictor};
    use std::io::Write;

    fn cog(size: usize) -> MemoryRaster {
        let layout = meta(size, size, 1, DataType::UInt16).with_layout(
            BlockShape::square(128),
            Compression::Deflate,
            Predictor::Horizontal,
        );
        let data = gradient(size, size, 1, DataType::UInt16).level_data(0).unwrap();
        let mut raster = MemoryRaster::new("cog", layout, data).unwrap();
        OverviewPyramidBuilder::new(PyramidConfig {
            minimum_overview_dimension: 128,
            ..PyramidConfig::default()
        })
        .build(&mut raster)
        .unwrap();
        raster
    }

    fn request(bbox: BoundingBox, target_resolution: f64, max_pixels: usize) -> RangeRequest {
        RangeRequest {
            bbox,
            target_resolution,
            max_pixels,
        }
    }

    #[test]
    fn test_coalesce_ranges() {
        let ranges = vec![
            ByteRange { offset: 300, length: 50 },
            ByteRange { offset: 0, length: 100 },
            ByteRange { offset: 100, length: 100 },
            ByteRange { offset: 1000, length: 10 },
        ];
        let merged = coalesce_ranges(ranges, 100);
        assert_eq!(
            merged,
            vec![ByteRange { offset: 0, length: 350 }, ByteRange { offset: 1000, length: 10 }]
        );
    }

    #[test]
    fn test_picks_level_matching_resolution() {
        let raster = cog(1024);
        assert_eq!(raster.meta().overview_factors, vec![2, 4, 8]);
        let full = BoundingBox::new(0.0, 0.0, 1024.0, 1024.0);

        let (block, report) = EfficientRangeReader::new(&raster)
            .read(&request(full, 4.0, usize::MAX))
            .unwrap();
        assert_eq!((report.level, report.factor), (2, 4));
        assert_eq!(block.dim(), (1, 256, 256));
        assert_eq!(report.blocks_touched, 4);
        assert!(report.data_reduction_factor > 1.0);
        assert_eq!(report.full_resolution_bytes, report.window_full_resolution_bytes);
        assert!(!report.byte_ranges.is_empty());
        assert!(report.byte_ranges.len() <= report.blocks_touched);
    }

    #[test]
    fn test_steps_coarser_under_pixel_limit() {
        let raster = cog(1024);
        let full = BoundingBox::new(0.0, 0.0, 1024.0, 1024.0);
        let (_, report) = EfficientRangeReader::new(&raster)
            .read(&request(full, 1.0, 128 * 128))
            .unwrap();
        assert_eq!(report.factor, 8);

        let result = EfficientRangeReader::new(&raster).read(&request(full, 1.0, 10));
        assert!(matches!(
            result,
            Err(RasterError::RequestTooLarge { pixels: 16384, max_pixels: 10 })
        ));
    }

    #[test]
    fn test_full_resolution_subwindow() {
        let raster = cog(512);
        // world y grows upwards: rows 12..40, cols 100..150
        let bbox = BoundingBox::new(100.0, 472.0, 150.0, 500.0);
        let (block, report) = EfficientRangeReader::new(&raster)
            .read(&request(bbox, 0.5, usize::MAX))
            .unwrap();
        assert_eq!(report.level, 0);
        assert_eq!(report.window, Window::new(100, 12, 50, 28));
        assert_eq!(block, raster.read(&report.window).unwrap());
        // two of the sixteen level-0 tiles
        assert_eq!(report.blocks_touched, 2);
        assert_eq!(report.window_full_resolution_bytes, report.bytes_transferred);
        assert!(report.full_resolution_bytes > report.bytes_transferred);
        assert!(report.data_reduction_factor > 1.0);
    }

    #[test]
    fn test_request_outside_raster() {
        let raster = cog(256);
        let far = BoundingBox::new(5000.0, 5000.0, 6000.0, 6000.0);
        assert!(matches!(
            EfficientRangeReader::new(&raster).read(&request(far, 1.0, 1000)),
            Err(RasterError::EmptyRequest(_))
        ));
    }

    #[test]
    fn test_fetch_from_memory_source() {
        let source = MemoryRangeSource::new("blob", (0u8..=255).collect());
        let ranges = [ByteRange { offset: 10, length: 3 }, ByteRange { offset: 250, length: 6 }];
        let chunks = fetch_ranges(&source, &ranges).unwrap();
        assert_eq!(chunks[0], vec![10, 11, 12]);
        assert_eq!(chunks[1].len(), 6);

        let past_end = [ByteRange { offset: 250, length: 7 }];
        assert!(fetch_ranges(&source, &past_end).is_err());
        assert!(source.read_range(255, 2).is_err());
    }

    #[test]
    fn test_fetch_from_local_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"0123456789abcdef").unwrap();
        file.flush().unwrap();

        let source = LocalRangeSource::new(file.path()).unwrap();
        assert_eq!(source.size(), 16);
        let chunks = fetch_ranges(&source, &[ByteRange { offset: 10, length: 6 }]).unwrap();
        assert_eq!(chunks[0], b"abcdef".to_vec());
    }
}
