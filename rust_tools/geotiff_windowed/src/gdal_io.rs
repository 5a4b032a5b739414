//! GTiff backend through GDAL.

use crate::cog::create_dataset_options;
use crate::error::{RasterError, Result};
use crate::raster::{
    BlockShape, ByteRange, Compression, DataType, GeoTransform, Predictor, RasterDataset, RasterDriver, RasterMeta,
    Window,
};
use gdal::cpl::CslStringList;
use gdal::raster::{Buffer, GdalDataType, GdalType, RasterBand};
use gdal::spatial_ref::SpatialRef;
use gdal::{Dataset, DatasetOptions, DriverManager, GdalOpenFlags, Metadata};
use log::{debug, info, warn};
use ndarray::{Array2, ArrayView2};
use std::path::{Path, PathBuf};

fn data_type_of(band: &RasterBand<'_>) -> Result<DataType> {
    match band.band_type() {
        GdalDataType::UInt8 => Ok(DataType::UInt8),
        GdalDataType::UInt16 => Ok(DataType::UInt16),
        GdalDataType::Int16 => Ok(DataType::Int16),
        GdalDataType::UInt32 => Ok(DataType::UInt32),
        GdalDataType::Int32 => Ok(DataType::Int32),
        GdalDataType::Float32 => Ok(DataType::Float32),
        GdalDataType::Float64 => Ok(DataType::Float64),
        other => Err(RasterError::Gdal(format!("unsupported band type {:?}", other))),
    }
}

/// Extract metadata from a dataset without reading pixels
fn extract_meta(dataset: &Dataset) -> Result<RasterMeta> {
    let (width, height) = dataset.raster_size();
    let band_count = dataset.raster_count() as usize;
    if band_count == 0 {
        return Err(RasterError::invalid("band_count", "raster has no bands"));
    }
    let band = dataset.rasterband(1)?;
    let data_type = data_type_of(&band)?;

    let crs = dataset
        .spatial_ref()
        .ok()
        .and_then(|srs| srs.authority().ok())
        .unwrap_or_else(|| dataset.projection());

    let (block_x, block_y) = band.block_size();
    let block_shape = if block_x == width {
        BlockShape::Untiled { rows_per_strip: block_y }
    } else {
        BlockShape::Tiled {
            width: block_x,
            height: block_y,
        }
    };
    let compression = dataset
        .metadata_item("COMPRESSION", "IMAGE_STRUCTURE")
        .map_or(Ok(Compression::None), |name| name.parse())
        .unwrap_or_else(|e| {
            warn!("{}, treating as uncompressed", e);
            Compression::None
        });
    let predictor = dataset
        .metadata_item("PREDICTOR", "IMAGE_STRUCTURE")
        .and_then(|value| value.trim().parse::<u16>().ok())
        .map_or(Predictor::None, Predictor::from_tag);

    let overview_count = band.overview_count()?.max(0) as usize;
    let mut overview_factors = Vec::with_capacity(overview_count);
    for index in 0..overview_count {
        let overview = band.overview(index)?;
        overview_factors.push((width as f64 / overview.x_size() as f64).round() as usize);
    }

    let meta = RasterMeta {
        width,
        height,
        band_count,
        data_type,
        geo_transform: GeoTransform(dataset.geo_transform()?),
        crs,
        nodata: band.no_data_value(),
        block_shape,
        compression,
        predictor,
        overview_factors,
    };
    meta.validate()?;
    Ok(meta)
}

/// An open GTiff dataset.
pub struct GdalRaster {
    dataset: Dataset,
    path: PathBuf,
    identifier: String,
    writable: bool,
    meta: RasterMeta,
}

impl GdalRaster {
    fn new(dataset: Dataset, path: &Path, writable: bool) -> Result<Self> {
        let meta = extract_meta(&dataset)?;
        debug!(
            "Opened {}: {}x{}, {} bands of {}, {:?}, overviews {:?}",
            path.display(),
            meta.width,
            meta.height,
            meta.band_count,
            meta.data_type.name(),
            meta.block_shape,
            meta.overview_factors
        );
        Ok(Self {
            dataset,
            identifier: path.display().to_string(),
            path: path.to_path_buf(),
            writable,
            meta,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn band(&self, level: usize, band: usize) -> Result<RasterBand<'_>> {
        if band >= self.meta.band_count {
            return Err(RasterError::invalid(
                "band",
                format!("band {} requested, raster has {}", band, self.meta.band_count),
            ));
        }
        let full = self.dataset.rasterband(band + 1)?;
        match level {
            0 => Ok(full),
            n if n <= self.meta.overview_factors.len() => Ok(full.overview(n - 1)?),
            n => Err(RasterError::MissingOverview(n)),
        }
    }

    fn level_dims(&self, level: usize) -> Result<(usize, usize)> {
        self.meta.level_dims(level).ok_or(RasterError::MissingOverview(level))
    }
}

impl RasterDataset for GdalRaster {
    fn meta(&self) -> RasterMeta {
        self.meta.clone()
    }

    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn is_writable(&self) -> bool {
        self.writable
    }

    fn read_band_level(&self, level: usize, band: usize, window: &Window) -> Result<Array2<f64>> {
        let (width, height) = self.level_dims(level)?;
        window.check_bounds(width, height)?;
        let rasterband = self.band(level, band)?;

        let buffer = rasterband.read_as::<f64>(
            (window.col_off as isize, window.row_off as isize),
            (window.width, window.height),
            (window.width, window.height),
            None,
        )?;
        let data_vec: Vec<f64> = buffer.into_iter().collect();
        Ok(Array2::from_shape_vec((window.height, window.width), data_vec)?)
    }

    fn write_band_level(
        &mut self,
        level: usize,
        band: usize,
        window: &Window,
        data: ArrayView2<'_, f64>,
    ) -> Result<()> {
        if !self.writable {
            return Err(RasterError::PermissionDenied(self.identifier.clone()));
        }
        let (width, height) = self.level_dims(level)?;
        window.check_bounds(width, height)?;
        if data.dim() != (window.height, window.width) {
            return Err(RasterError::invalid(
                "data",
                format!("shape {:?} does not match window {}", data.dim(), window),
            ));
        }

        let data_type = self.meta.data_type;
        let values: Vec<f64> = data.iter().map(|&v| data_type.coerce(v)).collect();
        let mut buffer = Buffer::new((window.width, window.height), values);
        let mut rasterband = self.band(level, band)?;
        rasterband.write(
            (window.col_off as isize, window.row_off as isize),
            (window.width, window.height),
            &mut buffer,
        )?;
        Ok(())
    }

    fn create_overviews(&mut self, factors: &[usize]) -> Result<()> {
        if !self.writable {
            return Err(RasterError::PermissionDenied(self.identifier.clone()));
        }
        let levels: Vec<i32> = factors.iter().map(|&factor| factor as i32).collect();
        // "NONE" allocates the levels; their pixels are written by the caller.
        self.dataset
            .build_overviews("NONE", &levels, &[])
            .map_err(|e| RasterError::CogCreationFailed(format!("Failed to build overviews: {}", e)))?;
        self.meta.overview_factors = factors.to_vec();
        debug!("{}: allocated overviews {:?}", self.identifier, factors);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.dataset.flush_cache()?;
        Ok(())
    }

    fn storage_bytes(&self) -> Result<u64> {
        Ok(std::fs::metadata(&self.path)?.len())
    }

    fn block_byte_range(&self, level: usize, block_col: usize, block_row: usize) -> Option<ByteRange> {
        let band = self.band(level, 0).ok()?;
        let read = |key: &str| {
            band.metadata_item(&format!("{}_{}_{}", key, block_col, block_row), "TIFF")
                .and_then(|value| value.trim().parse::<u64>().ok())
        };
        Some(ByteRange {
            offset: read("BLOCK_OFFSET")?,
            length: read("BLOCK_SIZE")?,
        })
    }
}

/// Opens and creates GeoTIFFs.
#[derive(Debug, Default, Clone, Copy)]
pub struct GdalDriver;

impl GdalDriver {
    pub fn new() -> Self {
        GdalDriver
    }

    fn open_with(&self, path: &Path, writable: bool) -> Result<GdalRaster> {
        if !path.exists() {
            return Err(RasterError::NotFound(path.display().to_string()));
        }
        let flags = if writable {
            GdalOpenFlags::GDAL_OF_RASTER | GdalOpenFlags::GDAL_OF_UPDATE
        } else {
            GdalOpenFlags::GDAL_OF_RASTER | GdalOpenFlags::GDAL_OF_READONLY
        };
        let options = DatasetOptions {
            open_flags: flags,
            ..Default::default()
        };
        let dataset = Dataset::open_ex(path, options).map_err(|e| {
            debug!("GDAL refused {}: {}", path.display(), e);
            RasterError::NotARaster(path.display().to_string())
        })?;
        GdalRaster::new(dataset, path, writable)
    }
}

fn create_typed<T: GdalType>(path: &Path, meta: &RasterMeta, options: &CslStringList) -> Result<Dataset> {
    let driver = DriverManager::get_driver_by_name("GTiff")?;
    Ok(driver.create_with_band_type_with_options::<T, _>(path, meta.width, meta.height, meta.band_count, options)?)
}

impl RasterDriver for GdalDriver {
    type Dataset = GdalRaster;

    fn open(&self, path: &Path) -> Result<GdalRaster> {
        self.open_with(path, false)
    }

    fn open_update(&self, path: &Path) -> Result<GdalRaster> {
        self.open_with(path, true)
    }

    fn create(&self, path: &Path, meta: &RasterMeta) -> Result<GdalRaster> {
        meta.validate()?;
        info!("Creating output dataset: {}", path.display());

        let mut gdal_options = CslStringList::new();
        for opt in create_dataset_options(meta) {
            gdal_options.add_string(&opt)?;
        }
        let mut dataset = match meta.data_type {
            DataType::UInt8 => create_typed::<u8>(path, meta, &gdal_options)?,
            DataType::UInt16 => create_typed::<u16>(path, meta, &gdal_options)?,
            DataType::Int16 => create_typed::<i16>(path, meta, &gdal_options)?,
            DataType::UInt32 => create_typed::<u32>(path, meta, &gdal_options)?,
            DataType::Int32 => create_typed::<i32>(path, meta, &gdal_options)?,
            DataType::Float32 => create_typed::<f32>(path, meta, &gdal_options)?,
            DataType::Float64 => create_typed::<f64>(path, meta, &gdal_options)?,
        };

        dataset.set_geo_transform(&meta.geo_transform.0)?;
        if !meta.crs.trim().is_empty() {
            let srs = SpatialRef::from_definition(&meta.crs)?;
            dataset.set_spatial_ref(&srs)?;
        }
        if let Some(nodata) = meta.nodata {
            for band in 1..=meta.band_count {
                dataset.rasterband(band)?.set_no_data_value(Some(nodata))?;
            }
        }
        GdalRaster::new(dataset, path, true)
    }
}
