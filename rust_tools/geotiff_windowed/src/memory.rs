//! In-memory raster backend.
//!
//! [`MemoryDriver`] behaves like a small file system of rasters keyed by path:
//! handles opened on the same path share storage, read-only handles reject
//! writes, and non-raster entries fail to open. Storage size is measured by
//! actually encoding every block with the raster's predictor and compression,
//! so layout comparisons (tiled vs untiled, compressed vs raw) are real.

use crate::error::{RasterError, Result};
use crate::raster::{
    BlockShape, ByteRange, Compression, DataType, Predictor, RasterDataset, RasterDriver,
    RasterMeta, Window,
};
use flate2::write::ZlibEncoder;
use log::debug;
use ndarray::{s, Array2, Array3, ArrayView2};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

const HEADER_BYTES: u64 = 16;
const IFD_BYTES: u64 = 256;
const BYTES_PER_BLOCK_ENTRY: u64 = 16;

struct Store {
    meta: RasterMeta,
    levels: Vec<Array3<f64>>,
    layout: Option<BlockLayout>,
}

struct BlockLayout {
    blocks: Vec<Vec<ByteRange>>,
    total_bytes: u64,
}

impl Store {
    fn blank(meta: RasterMeta) -> Self {
        let fill = meta.nodata.unwrap_or(0.0);
        let level0 = Array3::from_elem((meta.band_count, meta.height, meta.width), fill);
        Self {
            meta: RasterMeta {
                overview_factors: Vec::new(),
                ..meta
            },
            levels: vec![level0],
            layout: None,
        }
    }

    fn layout(&mut self) -> Result<&BlockLayout> {
        let layout = match self.layout.take() {
            Some(layout) => layout,
            None => encode_layout(&self.meta, &self.levels)?,
        };
        Ok(self.layout.insert(layout))
    }
}

/// Handle to an in-memory raster.
pub struct MemoryRaster {
    id: String,
    store: Arc<RwLock<Store>>,
    writable: bool,
    bytes_read: AtomicU64,
}

impl MemoryRaster {
    /// Writable raster from `(band, row, col)` data; values are coerced to the data type.
    pub fn new(id: impl Into<String>, meta: RasterMeta, mut data: Array3<f64>) -> Result<Self> {
        meta.validate()?;
        let expected = (meta.band_count, meta.height, meta.width);
        if data.dim() != expected {
            return Err(RasterError::invalid(
                "data",
                format!("shape {:?} does not match raster {:?}", data.dim(), expected),
            ));
        }
        let data_type = meta.data_type;
        data.mapv_inplace(|v| data_type.coerce(v));
        let mut store = Store::blank(meta);
        store.levels[0] = data;
        Ok(Self::from_store(id.into(), Arc::new(RwLock::new(store)), true))
    }

    pub fn from_fn<F>(id: impl Into<String>, meta: RasterMeta, f: F) -> Result<Self>
    where
        F: Fn(usize, usize, usize) -> f64,
    {
        let data = Array3::from_shape_fn((meta.band_count, meta.height, meta.width), |(b, r, c)| {
            f(b, r, c)
        });
        Self::new(id, meta, data)
    }

    fn from_store(id: String, store: Arc<RwLock<Store>>, writable: bool) -> Self {
        Self {
            id,
            store,
            writable,
            bytes_read: AtomicU64::new(0),
        }
    }

    /// Same storage, writes rejected.
    pub fn into_read_only(mut self) -> Self {
        self.writable = false;
        self
    }

    /// Sample bytes handed out by this handle so far.
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::Relaxed)
    }

    /// Copy of a whole level, `(band, row, col)`.
    pub fn level_data(&self, level: usize) -> Option<Array3<f64>> {
        self.store().levels.get(level).cloned()
    }

    fn store(&self) -> RwLockReadGuard<'_, Store> {
        self.store.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn store_mut(&self) -> RwLockWriteGuard<'_, Store> {
        self.store.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_writable(&self) -> Result<()> {
        if !self.writable {
            return Err(RasterError::PermissionDenied(self.id.clone()));
        }
        Ok(())
    }
}

fn level_shape(store: &Store, level: usize) -> Result<(usize, usize)> {
    store
        .levels
        .get(level)
        .map(|data| (data.dim().2, data.dim().1))
        .ok_or(RasterError::MissingOverview(level))
}

fn check_band(meta: &RasterMeta, band: usize) -> Result<()> {
    if band >= meta.band_count {
        return Err(RasterError::invalid(
            "band",
            format!("band {} requested, raster has {}", band, meta.band_count),
        ));
    }
    Ok(())
}

impl RasterDataset for MemoryRaster {
    fn meta(&self) -> RasterMeta {
        self.store().meta.clone()
    }

    fn identifier(&self) -> &str {
        &self.id
    }

    fn is_writable(&self) -> bool {
        self.writable
    }

    fn read_band_level(&self, level: usize, band: usize, window: &Window) -> Result<Array2<f64>> {
        let store = self.store();
        check_band(&store.meta, band)?;
        let (width, height) = level_shape(&store, level)?;
        window.check_bounds(width, height)?;

        let data = store.levels[level]
            .slice(s![
                band,
                window.row_off..window.row_end(),
                window.col_off..window.col_end()
            ])
            .to_owned();
        let bytes = (window.area() * store.meta.data_type.byte_width()) as u64;
        self.bytes_read.fetch_add(bytes, Ordering::Relaxed);
        Ok(data)
    }

    fn write_band_level(
        &mut self,
        level: usize,
        band: usize,
        window: &Window,
        data: ArrayView2<'_, f64>,
    ) -> Result<()> {
        self.ensure_writable()?;
        let mut store = self.store_mut();
        check_band(&store.meta, band)?;
        let (width, height) = level_shape(&store, level)?;
        window.check_bounds(width, height)?;
        if data.dim() != (window.height, window.width) {
            return Err(RasterError::invalid(
                "data",
                format!("shape {:?} does not match window {}", data.dim(), window),
            ));
        }

        let data_type = store.meta.data_type;
        let mut target = store.levels[level].slice_mut(s![
            band,
            window.row_off..window.row_end(),
            window.col_off..window.col_end()
        ]);
        target.zip_mut_with(&data, |dst, &src| *dst = data_type.coerce(src));
        store.layout = None;
        Ok(())
    }

    fn create_overviews(&mut self, factors: &[usize]) -> Result<()> {
        self.ensure_writable()?;
        let mut store = self.store_mut();
        let mut factors = factors.to_vec();
        factors.sort_unstable();
        factors.dedup();

        let fill = store.meta.nodata.unwrap_or(0.0);
        let bands = store.meta.band_count;
        store.levels.truncate(1);
        store.meta.overview_factors = factors.clone();
        for factor in factors {
            let width = store.meta.width.div_ceil(factor);
            let height = store.meta.height.div_ceil(factor);
            store.levels.push(Array3::from_elem((bands, height, width), fill));
        }
        store.layout = None;
        debug!(
            "{}: allocated overviews {:?}",
            self.id, store.meta.overview_factors
        );
        Ok(())
    }

    fn storage_bytes(&self) -> Result<u64> {
        let mut store = self.store_mut();
        Ok(store.layout()?.total_bytes)
    }

    fn block_byte_range(&self, level: usize, block_col: usize, block_row: usize) -> Option<ByteRange> {
        let mut store = self.store_mut();
        let (level_width, _) = store.meta.level_dims(level)?;
        let (block_width, _) = store.meta.block_shape.block_dims(level_width);
        let blocks_x = level_width.div_ceil(block_width);
        if block_col >= blocks_x {
            return None;
        }
        let layout = store.layout().ok()?;
        let range = layout.blocks.get(level)?.get(block_row * blocks_x + block_col).copied();
        range
    }
}

/// Lay blocks out sequentially after a header and one directory per level.
fn encode_layout(meta: &RasterMeta, levels: &[Array3<f64>]) -> Result<BlockLayout> {
    let mut offset = HEADER_BYTES;
    let mut blocks = Vec::with_capacity(levels.len());

    for data in levels {
        let (_, height, width) = data.dim();
        let (block_width, block_height) = meta.block_shape.block_dims(width);
        let blocks_x = width.div_ceil(block_width);
        let blocks_y = height.div_ceil(block_height);
        offset += IFD_BYTES + BYTES_PER_BLOCK_ENTRY * (blocks_x * blocks_y) as u64;

        let mut level_blocks = Vec::with_capacity(blocks_x * blocks_y);
        for by in 0..blocks_y {
            for bx in 0..blocks_x {
                let length = encoded_block_len(meta, data, bx, by, block_width, block_height)?;
                level_blocks.push(ByteRange { offset, length });
                offset += length;
            }
        }
        blocks.push(level_blocks);
    }

    Ok(BlockLayout {
        blocks,
        total_bytes: offset,
    })
}

fn encoded_block_len(
    meta: &RasterMeta,
    data: &Array3<f64>,
    bx: usize,
    by: usize,
    block_width: usize,
    block_height: usize,
) -> Result<u64> {
    let (bands, height, width) = data.dim();
    let col0 = bx * block_width;
    let row0 = by * block_height;
    // Tiles are padded to full size; strips end at the last row.
    let rows = if meta.block_shape.is_tiled() {
        block_height
    } else {
        block_height.min(height - row0)
    };
    let byte_width = meta.data_type.byte_width();
    let row_samples = block_width * bands;

    let mut raw = Vec::with_capacity(rows * row_samples * byte_width);
    for r in 0..rows {
        let mut samples: Vec<f64> = Vec::with_capacity(row_samples);
        for c in 0..block_width {
            for b in 0..bands {
                let (row, col) = (row0 + r, col0 + c);
                let value = if row < height && col < width {
                    data[[b, row, col]]
                } else {
                    0.0
                };
                samples.push(value);
            }
        }
        raw.extend(encode_row(&samples, meta.data_type, meta.predictor, bands));
    }

    let encoded = compress(&raw, meta.compression)?;
    Ok(encoded as u64)
}

fn sample_bits(value: f64, data_type: DataType) -> u64 {
    match data_type {
        DataType::UInt8 => value as u8 as u64,
        DataType::UInt16 => value as u16 as u64,
        DataType::Int16 => value as i16 as u16 as u64,
        DataType::UInt32 => value as u32 as u64,
        DataType::Int32 => value as i32 as u32 as u64,
        DataType::Float32 => (value as f32).to_bits() as u64,
        DataType::Float64 => value.to_bits(),
    }
}

/// Little-endian bytes for one block row after the predictor.
fn encode_row(samples: &[f64], data_type: DataType, predictor: Predictor, stride: usize) -> Vec<u8> {
    let byte_width = data_type.byte_width();
    let mask = if byte_width == 8 {
        u64::MAX
    } else {
        (1u64 << (byte_width * 8)) - 1
    };
    let mut bits: Vec<u64> = samples.iter().map(|&v| sample_bits(v, data_type)).collect();

    match predictor {
        Predictor::None => {}
        Predictor::Horizontal => {
            for i in (stride..bits.len()).rev() {
                bits[i] = bits[i].wrapping_sub(bits[i - stride]) & mask;
            }
        }
        Predictor::FloatingPoint => {
            // Byte planes, most significant first, then byte differencing.
            let n = bits.len();
            let mut shuffled = vec![0u8; n * byte_width];
            for (i, &word) in bits.iter().enumerate() {
                for k in 0..byte_width {
                    let shift = 8 * (byte_width - 1 - k);
                    shuffled[k * n + i] = (word >> shift) as u8;
                }
            }
            for i in (stride..shuffled.len()).rev() {
                shuffled[i] = shuffled[i].wrapping_sub(shuffled[i - stride]);
            }
            return shuffled;
        }
    }

    let mut out = Vec::with_capacity(bits.len() * byte_width);
    for word in bits {
        out.extend_from_slice(&word.to_le_bytes()[..byte_width]);
    }
    out
}

fn compress(raw: &[u8], compression: Compression) -> Result<usize> {
    match compression {
        Compression::None => Ok(raw.len()),
        Compression::Deflate => zlib_len(raw, flate2::Compression::default()),
        Compression::Zstd => Ok(zstd::stream::encode_all(raw, ZSTD_LEVEL)?.len()),
        Compression::Lzw => weezl::encode::Encoder::with_tiff_size_switch(weezl::BitOrder::Msb, 8)
            .encode(raw)
            .map(|encoded| encoded.len())
            .map_err(|e| RasterError::CogCreationFailed(format!("LZW encoding failed: {}", e))),
    }
}

/// GDAL's default ZSTD_LEVEL.
const ZSTD_LEVEL: i32 = 9;

fn zlib_len(raw: &[u8], level: flate2::Compression) -> Result<usize> {
    let mut encoder = ZlibEncoder::new(Vec::new(), level);
    encoder.write_all(raw)?;
    Ok(encoder.finish()?.len())
}

enum Entry {
    Raster(Arc<RwLock<Store>>),
    Opaque(Vec<u8>),
}

/// Path-keyed collection of in-memory rasters.
#[derive(Clone, Default)]
pub struct MemoryDriver {
    entries: Arc<Mutex<HashMap<PathBuf, Entry>>>,
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a raster under `path`; later opens share its storage.
    pub fn insert(&self, path: impl AsRef<Path>, raster: MemoryRaster) {
        self.entries()
            .insert(path.as_ref().to_path_buf(), Entry::Raster(raster.store));
    }

    /// Register a file that is not a raster.
    pub fn insert_bytes(&self, path: impl AsRef<Path>, bytes: Vec<u8>) {
        self.entries()
            .insert(path.as_ref().to_path_buf(), Entry::Opaque(bytes));
    }

    pub fn contains(&self, path: impl AsRef<Path>) -> bool {
        self.entries().contains_key(path.as_ref())
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<PathBuf, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn open_with(&self, path: &Path, writable: bool) -> Result<MemoryRaster> {
        let id = path.display().to_string();
        match self.entries().get(path) {
            Some(Entry::Raster(store)) => Ok(MemoryRaster::from_store(id, Arc::clone(store), writable)),
            Some(Entry::Opaque(bytes)) => {
                debug!("{}: {} bytes without raster structure", id, bytes.len());
                Err(RasterError::NotARaster(id))
            }
            None => Err(RasterError::NotFound(id)),
        }
    }
}

impl RasterDriver for MemoryDriver {
    type Dataset = MemoryRaster;

    fn open(&self, path: &Path) -> Result<MemoryRaster> {
        self.open_with(path, false)
    }

    fn open_update(&self, path: &Path) -> Result<MemoryRaster> {
        self.open_with(path, true)
    }

    fn create(&self, path: &Path, meta: &RasterMeta) -> Result<MemoryRaster> {
        meta.validate()?;
        if let BlockShape::Tiled { width, height } = meta.block_shape {
            if width == 0 || height == 0 {
                return Err(RasterError::InvalidTileSize(width.min(height)));
            }
        }
        let store = Arc::new(RwLock::new(Store::blank(meta.clone())));
        self.entries()
            .insert(path.to_path_buf(), Entry::Raster(Arc::clone(&store)));
        debug!(
            "Created in-memory raster {} ({}x{}, {} bands)",
            path.display(),
            meta.width,
            meta.height,
            meta.band_count
        );
        Ok(MemoryRaster::from_store(path.display().to_string(), store, true))
    }
}
