//! Per-zone raster statistics with batched window reads.

use crate::chunking::WindowGrid;
use crate::crs::{reproject_geometry, same_crs, CrsTransformer};
use crate::error::{RasterError, Result};
use crate::geometry::{footprint_window, rasterize, repair, to_pixel_space, PixelPolygon};
use crate::raster::{RasterDataset, RasterMeta, Window};
use geo::MultiPolygon;
use log::{debug, info, warn};
use ndarray::{s, Array2, ArrayView2, ArrayView3};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::str::FromStr;
use std::time::Instant;

/// A batch read is rejected when its union window is more than this many times
/// larger than the member windows combined.
const MAX_BATCH_SPARSITY: usize = 4;

#[derive(Debug, Clone, PartialEq)]
pub struct Zone {
    pub id: String,
    pub geometry: MultiPolygon<f64>,
    /// Empty means "same as the raster".
    pub crs: String,
    pub attributes: BTreeMap<String, String>,
}

impl Zone {
    pub fn new(id: impl Into<String>, geometry: MultiPolygon<f64>, crs: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            geometry,
            crs: crs.into(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Statistic {
    Count,
    Mean,
    Std,
    Min,
    Max,
    Sum,
    Mode,
    Unique,
}

impl Statistic {
    pub const ALL: [Statistic; 8] = [
        Statistic::Count,
        Statistic::Mean,
        Statistic::Std,
        Statistic::Min,
        Statistic::Max,
        Statistic::Sum,
        Statistic::Mode,
        Statistic::Unique,
    ];

    /// Only meaningful for categorical bands.
    pub fn is_categorical(&self) -> bool {
        matches!(self, Statistic::Mode | Statistic::Unique)
    }
}

impl FromStr for Statistic {
    type Err = RasterError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "count" => Ok(Statistic::Count),
            "mean" => Ok(Statistic::Mean),
            "std" => Ok(Statistic::Std),
            "min" => Ok(Statistic::Min),
            "max" => Ok(Statistic::Max),
            "sum" => Ok(Statistic::Sum),
            "mode" => Ok(Statistic::Mode),
            "unique" => Ok(Statistic::Unique),
            other => Err(RasterError::invalid(
                "statistic",
                format!("unknown statistic '{}'", other),
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ZonalConfig {
    pub statistics: Vec<Statistic>,
    /// Zero-based band indices that hold class codes.
    pub categorical_bands: Vec<usize>,
    /// Largest window read in one go, for batches and for streamed zones.
    pub batch_pixel_limit: usize,
}

impl Default for ZonalConfig {
    fn default() -> Self {
        Self {
            statistics: Statistic::ALL.to_vec(),
            categorical_bands: Vec::new(),
            batch_pixel_limit: 4_000_000,
        }
    }
}

impl ZonalConfig {
    /// Config computing the named statistics; unknown names fail here.
    pub fn with_statistic_names<S: AsRef<str>>(names: &[S]) -> Result<Self> {
        let statistics = names
            .iter()
            .map(|name| name.as_ref().parse())
            .collect::<Result<Vec<Statistic>>>()?;
        Ok(Self {
            statistics,
            ..Self::default()
        })
    }

    pub fn with_categorical_bands(mut self, bands: Vec<usize>) -> Self {
        self.categorical_bands = bands;
        self
    }

    fn wants(&self, statistic: Statistic) -> bool {
        self.statistics.contains(&statistic)
    }
}

/// Statistics of one band over one zone. With `count == 0` every other field is `None`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BandStatistics {
    pub count: usize,
    pub sum: Option<f64>,
    pub mean: Option<f64>,
    /// Population standard deviation.
    pub std: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub mode: Option<f64>,
    pub unique: Option<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ZoneRecord {
    pub zone_id: String,
    pub bands: Vec<BandStatistics>,
    /// Pixels whose centres fall inside the zone, valid or not.
    pub masked_pixels: usize,
}

impl ZoneRecord {
    fn empty(zone_id: &str, band_count: usize) -> Self {
        Self {
            zone_id: zone_id.to_string(),
            bands: vec![BandStatistics::default(); band_count],
            masked_pixels: 0,
        }
    }

    pub fn has_valid_pixels(&self) -> bool {
        self.bands.iter().any(|band| band.count > 0)
    }
}

/// Running moments (Welford) plus optional class histogram; partial results merge.
#[derive(Debug, Clone)]
struct Accumulator {
    count: usize,
    mean: f64,
    m2: f64,
    sum: f64,
    min: f64,
    max: f64,
    classes: Option<HashMap<u64, usize>>,
}

impl Accumulator {
    fn new(categorical: bool) -> Self {
        Self {
            count: 0,
            mean: 0.0,
            m2: 0.0,
            sum: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            classes: categorical.then(HashMap::new),
        }
    }

    fn push(&mut self, value: f64) {
        self.count += 1;
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (value - self.mean);
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        if let Some(classes) = &mut self.classes {
            // +0.0 folds -0.0 into the same class
            *classes.entry((value + 0.0).to_bits()).or_insert(0) += 1;
        }
    }

    fn merge(&mut self, other: &Accumulator) {
        if other.count == 0 {
            return;
        }
        if self.count == 0 {
            *self = other.clone();
            return;
        }
        let n = (self.count + other.count) as f64;
        let delta = other.mean - self.mean;
        self.mean += delta * other.count as f64 / n;
        self.m2 += other.m2 + delta * delta * self.count as f64 * other.count as f64 / n;
        self.count += other.count;
        self.sum += other.sum;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
        if let (Some(mine), Some(theirs)) = (&mut self.classes, &other.classes) {
            for (&class, &hits) in theirs {
                *mine.entry(class).or_insert(0) += hits;
            }
        }
    }

    fn finish(&self, config: &ZonalConfig) -> BandStatistics {
        if self.count == 0 {
            return BandStatistics::default();
        }
        let pick = |statistic: Statistic, value: f64| config.wants(statistic).then_some(value);
        let mut stats = BandStatistics {
            count: self.count,
            sum: pick(Statistic::Sum, self.sum),
            mean: pick(Statistic::Mean, self.mean),
            std: pick(Statistic::Std, (self.m2 / self.count as f64).max(0.0).sqrt()),
            min: pick(Statistic::Min, self.min),
            max: pick(Statistic::Max, self.max),
            mode: None,
            unique: None,
        };
        if let Some(classes) = &self.classes {
            if config.wants(Statistic::Mode) {
                stats.mode = classes
                    .iter()
                    .map(|(&bits, &n)| (f64::from_bits(bits), n))
                    .max_by(|a, b| a.1.cmp(&b.1).then(b.0.total_cmp(&a.0)))
                    .map(|(value, _)| value);
            }
            if config.wants(Statistic::Unique) {
                stats.unique = Some(classes.len());
            }
        }
        stats
    }
}

struct PreparedZone<'z> {
    id: &'z str,
    pixels: Vec<PixelPolygon>,
    window: Window,
}

pub struct ZonalStatisticsEngine {
    config: ZonalConfig,
}

impl ZonalStatisticsEngine {
    pub fn new(config: ZonalConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ZonalConfig {
        &self.config
    }

    /// Statistics for every zone, keyed by zone id.
    ///
    /// Zones in a different CRS are reprojected through `transformer`; without
    /// one (or when it fails) the call fails with [`RasterError::CrsMismatch`].
    /// Zones that miss the raster or have no usable geometry get a record with
    /// `count == 0`.
    pub fn compute<R: RasterDataset + ?Sized>(
        &self,
        raster: &R,
        zones: &[Zone],
        transformer: Option<&dyn CrsTransformer>,
    ) -> Result<BTreeMap<String, ZoneRecord>> {
        let start = Instant::now();
        let meta = raster.meta();
        meta.validate()?;
        self.check_config(&meta, zones)?;

        info!(
            "Computing {:?} for {} zones over {}",
            self.config.statistics,
            zones.len(),
            raster.identifier()
        );

        let mut records = BTreeMap::new();
        let mut prepared = Vec::with_capacity(zones.len());
        for zone in zones {
            match self.prepare(zone, &meta, transformer)? {
                Some(p) => prepared.push(p),
                None => {
                    records.insert(zone.id.clone(), ZoneRecord::empty(&zone.id, meta.band_count));
                }
            }
        }

        let limit = self.config.batch_pixel_limit;
        let (large, mut small): (Vec<_>, Vec<_>) =
            prepared.into_iter().partition(|p| p.window.area() > limit);

        for zone in &large {
            let record = self.stream_zone(raster, &meta, zone)?;
            records.insert(zone.id.to_string(), record);
        }

        small.sort_by_key(|p| (p.window.row_off, p.window.col_off));
        let mut reads = 0;
        for batch in batches(&small, limit) {
            let union = batch
                .iter()
                .map(|p| p.window)
                .reduce(|a, b| a.union(&b))
                .unwrap_or_default();
            let block = raster.read(&union)?;
            reads += 1;
            debug!("Batch of {} zones read as {}", batch.len(), union);

            for zone in batch {
                let local = zone.window.relative_to(&union);
                let view = block.slice(s![
                    ..,
                    local.row_off..local.row_end(),
                    local.col_off..local.col_end()
                ]);
                let mask = rasterize(&zone.pixels, &zone.window);
                let mut accs = self.accumulators(&meta);
                accumulate(view, mask.view(), &meta, &mut accs);
                records.insert(zone.id.to_string(), self.record(zone.id, &accs, &mask));
            }
        }

        info!(
            "Zonal statistics for {} zones in {:.2?} ({} batched reads, {} streamed zones)",
            records.len(),
            start.elapsed(),
            reads,
            large.len()
        );
        Ok(records)
    }

    fn check_config(&self, meta: &RasterMeta, zones: &[Zone]) -> Result<()> {
        if self.config.batch_pixel_limit == 0 {
            return Err(RasterError::invalid("batch_pixel_limit", "must be positive"));
        }
        if let Some(&band) = self
            .config
            .categorical_bands
            .iter()
            .find(|&&band| band >= meta.band_count)
        {
            return Err(RasterError::invalid(
                "categorical_bands",
                format!("band {} requested, raster has {}", band, meta.band_count),
            ));
        }
        let mut seen = HashSet::new();
        if let Some(zone) = zones.iter().find(|zone| !seen.insert(zone.id.as_str())) {
            return Err(RasterError::invalid(
                "zones",
                format!("duplicate zone id '{}'", zone.id),
            ));
        }
        Ok(())
    }

    fn prepare<'z>(
        &self,
        zone: &'z Zone,
        meta: &RasterMeta,
        transformer: Option<&dyn CrsTransformer>,
    ) -> Result<Option<PreparedZone<'z>>> {
        let mismatch = |reason: String| RasterError::CrsMismatch {
            zone_id: zone.id.clone(),
            raster_crs: meta.crs.clone(),
            zone_crs: zone.crs.clone(),
            reason,
        };

        let reprojected;
        let geometry = if zone.crs.is_empty() || same_crs(&zone.crs, &meta.crs) {
            &zone.geometry
        } else {
            let transformer = transformer.ok_or_else(|| mismatch("no CRS transformer supplied".into()))?;
            reprojected = reproject_geometry(&zone.geometry, transformer, &zone.crs, &meta.crs)
                .map_err(mismatch)?;
            &reprojected
        };

        let repaired = repair(geometry);
        if repaired.0.is_empty() {
            warn!("Zone {}: no usable geometry after repair, reporting as empty", zone.id);
            return Ok(None);
        }
        let Some(pixels) = to_pixel_space(&repaired, &meta.geo_transform) else {
            warn!("Zone {}: raster geotransform is not invertible", zone.id);
            return Ok(None);
        };
        let Some(window) = footprint_window(&pixels, meta.width, meta.height) else {
            debug!("Zone {} does not intersect the raster", zone.id);
            return Ok(None);
        };
        Ok(Some(PreparedZone {
            id: &zone.id,
            pixels,
            window,
        }))
    }

    /// Zones bigger than one read are folded window by window.
    fn stream_zone<R: RasterDataset + ?Sized>(
        &self,
        raster: &R,
        meta: &RasterMeta,
        zone: &PreparedZone<'_>,
    ) -> Result<ZoneRecord> {
        let side = ((self.config.batch_pixel_limit as f64).sqrt() as usize).max(1);
        let grid = WindowGrid::within(zone.window, side, 0)?;
        debug!("Zone {} streamed in {} windows", zone.id, grid.total_windows);

        let mut totals = self.accumulators(meta);
        let mut masked_pixels = 0;
        for bounds in &grid {
            let mask = rasterize(&zone.pixels, &bounds.target);
            let inside = mask.iter().filter(|&&m| m).count();
            if inside == 0 {
                continue;
            }
            masked_pixels += inside;
            let block = raster.read(&bounds.target)?;
            let mut partial = self.accumulators(meta);
            accumulate(block.view(), mask.view(), meta, &mut partial);
            for (total, part) in totals.iter_mut().zip(&partial) {
                total.merge(part);
            }
        }

        Ok(ZoneRecord {
            zone_id: zone.id.to_string(),
            bands: totals.iter().map(|acc| acc.finish(&self.config)).collect(),
            masked_pixels,
        })
    }

    fn accumulators(&self, meta: &RasterMeta) -> Vec<Accumulator> {
        let track_classes = self.config.statistics.iter().any(Statistic::is_categorical);
        (0..meta.band_count)
            .map(|band| Accumulator::new(track_classes && self.config.categorical_bands.contains(&band)))
            .collect()
    }

    fn record(&self, zone_id: &str, accs: &[Accumulator], mask: &Array2<bool>) -> ZoneRecord {
        ZoneRecord {
            zone_id: zone_id.to_string(),
            bands: accs.iter().map(|acc| acc.finish(&self.config)).collect(),
            masked_pixels: mask.iter().filter(|&&m| m).count(),
        }
    }
}

/// Greedy grouping of zones (sorted by position) whose union window stays
/// small and dense enough to be read once.
fn batches<'a, 'z>(zones: &'a [PreparedZone<'z>], limit: usize) -> Vec<&'a [PreparedZone<'z>]> {
    let mut groups = Vec::new();
    let mut start = 0;
    while start < zones.len() {
        let mut union = zones[start].window;
        let mut member_area = union.area();
        let mut end = start + 1;
        while end < zones.len() {
            let candidate = union.union(&zones[end].window);
            let area = member_area + zones[end].window.area();
            if candidate.area() > limit || candidate.area() > MAX_BATCH_SPARSITY * area {
                break;
            }
            union = candidate;
            member_area = area;
            end += 1;
        }
        groups.push(&zones[start..end]);
        start = end;
    }
    groups
}

fn accumulate(
    block: ArrayView3<'_, f64>,
    mask: ArrayView2<'_, bool>,
    meta: &RasterMeta,
    accs: &mut [Accumulator],
) {
    for (plane, acc) in block.outer_iter().zip(accs.iter_mut()) {
        for (&value, &inside) in plane.iter().zip(mask.iter()) {
            if inside && !meta.is_nodata(value) {
                acc.push(value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::tests::{gradient, meta};
    use crate::memory::MemoryRaster;
    use crate::raster::DataType;
    use geo::polygon;

    // Test rasters use origin (0, height) and 1 m pixels, so pixel (col, row)
    // spans world x in [col, col + 1] and y in [height - row - 1, height - row].
    fn rect(x0: f64, y0: f64, x1: f64, y1: f64) -> MultiPolygon<f64> {
        MultiPolygon::new(vec![polygon![
            (x: x0, y: y0), (x: x1, y: y0), (x: x1, y: y1), (x: x0, y: y1)
        ]])
    }

    struct Shift(f64);

    impl CrsTransformer for Shift {
        fn transform_point(&self, x: f64, y: f64, _: &str, _: &str) -> std::result::Result<(f64, f64), String> {
            Ok((x + self.0, y))
        }
    }

    #[test]
    fn test_full_zone_matches_raster_mean() {
        let raster = gradient(30, 20, 1, DataType::Float64);
        let data = raster.level_data(0).unwrap();
        let expected = data.sum() / data.len() as f64;

        let zones = vec![Zone::new("all", rect(0.0, 0.0, 30.0, 20.0), "EPSG:32633")];
        let engine = ZonalStatisticsEngine::new(ZonalConfig::default());
        let records = engine.compute(&raster, &zones, None).unwrap();
        let band = &records["all"].bands[0];
        assert_eq!(band.count, 600);
        assert!((band.mean.unwrap() - expected).abs() < 1e-9);
        assert_eq!(band.min, data.iter().copied().reduce(f64::min));
    }

    #[test]
    fn test_outside_zone_reports_empty() {
        let raster = gradient(10, 10, 2, DataType::UInt8);
        let zones = vec![Zone::new("far", rect(100.0, 100.0, 110.0, 110.0), "EPSG:32633")];
        let records = ZonalStatisticsEngine::new(ZonalConfig::default())
            .compute(&raster, &zones, None)
            .unwrap();
        let record = &records["far"];
        assert!(!record.has_valid_pixels());
        assert_eq!(record.bands.len(), 2);
        assert_eq!(record.bands[0], BandStatistics::default());
    }

    #[test]
    fn test_population_std_and_nodata() {
        let meta = meta(3, 2, 1, DataType::Float32).with_nodata(Some(-1.0));
        let raster = MemoryRaster::new(
            "small",
            meta,
            ndarray::arr3(&[[[1.0, 2.0, -1.0], [3.0, 4.0, f64::NAN]]]),
        )
        .unwrap();
        let zones = vec![Zone::new("z", rect(0.0, 0.0, 3.0, 2.0), "")];
        let records = ZonalStatisticsEngine::new(ZonalConfig::default())
            .compute(&raster, &zones, None)
            .unwrap();
        let band = &records["z"].bands[0];
        assert_eq!(records["z"].masked_pixels, 6);
        assert_eq!(band.count, 4);
        assert_eq!(band.sum, Some(10.0));
        assert!((band.std.unwrap() - 1.25f64.sqrt()).abs() < 1e-12);
        // mode only for categorical bands
        assert_eq!(band.mode, None);
    }

    #[test]
    fn test_categorical_mode_prefers_lowest_on_tie() {
        let raster = MemoryRaster::new(
            "classes",
            meta(5, 1, 1, DataType::UInt8),
            ndarray::arr3(&[[[3.0, 3.0, 1.0, 1.0, 2.0]]]),
        )
        .unwrap();
        let config = ZonalConfig::default().with_categorical_bands(vec![0]);
        let zones = vec![Zone::new("z", rect(0.0, 0.0, 5.0, 1.0), "EPSG:32633")];
        let records = ZonalStatisticsEngine::new(config).compute(&raster, &zones, None).unwrap();
        let band = &records["z"].bands[0];
        assert_eq!(band.mode, Some(1.0));
        assert_eq!(band.unique, Some(3));
    }

    #[test]
    fn test_crs_mismatch() {
        let raster = gradient(10, 10, 1, DataType::UInt8);
        let zones = vec![Zone::new("z", rect(-10.0, 0.0, -5.0, 5.0), "EPSG:4326")];
        let engine = ZonalStatisticsEngine::new(ZonalConfig::default());
        assert!(matches!(
            engine.compute(&raster, &zones, None),
            Err(RasterError::CrsMismatch { .. })
        ));

        let records = engine.compute(&raster, &zones, Some(&Shift(10.0))).unwrap();
        assert_eq!(records["z"].bands[0].count, 25);
    }

    #[test]
    fn test_unknown_statistic_rejected() {
        assert!(matches!(
            ZonalConfig::with_statistic_names(&["mean", "median"]),
            Err(RasterError::InvalidParameter { name: "statistic", .. })
        ));
        let config = ZonalConfig::with_statistic_names(&["MEAN", "count"]).unwrap();
        assert_eq!(config.statistics, vec![Statistic::Mean, Statistic::Count]);
    }

    #[test]
    fn test_selected_statistics_only() {
        let raster = gradient(8, 8, 1, DataType::Int16);
        let config = ZonalConfig::with_statistic_names(&["max"]).unwrap();
        let zones = vec![Zone::new("z", rect(0.0, 0.0, 8.0, 8.0), "EPSG:32633")];
        let records = ZonalStatisticsEngine::new(config).compute(&raster, &zones, None).unwrap();
        let band = &records["z"].bands[0];
        assert_eq!(band.count, 64);
        assert!(band.max.is_some());
        assert!(band.mean.is_none() && band.std.is_none());
    }

    #[test]
    fn test_streaming_and_batching_agree() {
        let raster = gradient(60, 40, 2, DataType::Float32);
        let zones: Vec<Zone> = (0..6)
            .map(|i| {
                let x = i as f64 * 9.0;
                Zone::new(format!("z{}", i), rect(x, 3.0, x + 14.0, 31.5), "EPSG:32633")
            })
            .chain(std::iter::once(Zone::new(
                "diamond",
                MultiPolygon::new(vec![polygon![
                    (x: 30.0, y: 0.0), (x: 60.0, y: 20.0), (x: 30.0, y: 40.0), (x: 0.0, y: 20.0)
                ]]),
                "EPSG:32633",
            )))
            .collect();

        let batched = ZonalStatisticsEngine::new(ZonalConfig::default())
            .compute(&raster, &zones, None)
            .unwrap();
        let streamed = ZonalStatisticsEngine::new(ZonalConfig {
            batch_pixel_limit: 30,
            ..ZonalConfig::default()
        })
        .compute(&raster, &zones, None)
        .unwrap();

        assert_eq!(batched.len(), 7);
        for (id, a) in &batched {
            let b = &streamed[id];
            assert_eq!(a.masked_pixels, b.masked_pixels, "{}", id);
            for (x, y) in a.bands.iter().zip(&b.bands) {
                assert_eq!(x.count, y.count);
                assert_eq!((x.min, x.max), (y.min, y.max));
                assert!((x.mean.unwrap() - y.mean.unwrap()).abs() < 1e-9);
                assert!((x.std.unwrap() - y.std.unwrap()).abs() < 1e-9);
            }
        }
    }

    #[test]
    fn test_many_small_zones_share_reads() {
        let raster = gradient(400, 400, 1, DataType::Float32);
        // 20 x 20 grid of 8x8 px squares, 12 px apart
        let zones: Vec<Zone> = (0..400)
            .map(|i| {
                let x = (i % 20) as f64 * 20.0 + 6.0;
                let y = (i / 20) as f64 * 20.0 + 6.0;
                Zone::new(format!("z{}", i), rect(x, y, x + 8.0, y + 8.0), "EPSG:32633")
            })
            .collect();

        let records = ZonalStatisticsEngine::new(ZonalConfig::default())
            .compute(&raster, &zones, None)
            .unwrap();
        assert_eq!(records.len(), 400);
        assert!(records.values().all(|r| r.bands[0].count == 64));

        let zone_bytes = (400 * 64 * 4) as u64;
        let raster_bytes = (400 * 400 * 4) as u64;
        assert!(raster.bytes_read() >= zone_bytes);
        assert!(raster.bytes_read() <= MAX_BATCH_SPARSITY as u64 * zone_bytes);
        assert!(raster.bytes_read() < raster_bytes);
    }

    #[test]
    fn test_degenerate_and_duplicate_zones() {
        let raster = gradient(10, 10, 1, DataType::UInt8);
        let line = MultiPolygon::new(vec![polygon![(x: 0.0, y: 0.0), (x: 5.0, y: 5.0), (x: 9.0, y: 9.0)]]);
        let zones = vec![Zone::new("line", line, "EPSG:32633")];
        let records = ZonalStatisticsEngine::new(ZonalConfig::default())
            .compute(&raster, &zones, None)
            .unwrap();
        assert_eq!(records["line"].bands[0].count, 0);

        let twice = vec![
            Zone::new("a", rect(0.0, 0.0, 2.0, 2.0), ""),
            Zone::new("a", rect(2.0, 2.0, 4.0, 4.0), ""),
        ];
        assert!(ZonalStatisticsEngine::new(ZonalConfig::default())
            .compute(&raster, &twice, None)
            .is_err());
    }

    #[test]
    fn test_accumulator_merge_matches_single_pass() {
        let values = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        let mut whole = Accumulator::new(true);
        values.iter().for_each(|&v| whole.push(v));

        let mut left = Accumulator::new(true);
        let mut right = Accumulator::new(true);
        values[..3].iter().for_each(|&v| left.push(v));
        values[3..].iter().for_each(|&v| right.push(v));
        left.merge(&right);

        let config = ZonalConfig::default();
        let (a, b) = (whole.finish(&config), left.finish(&config));
        assert_eq!(a.count, b.count);
        assert!((b.std.unwrap() - 2.0).abs() < 1e-12);
        assert!((a.mean.unwrap() - b.mean.unwrap()).abs() < 1e-12);
        assert_eq!(b.mode, Some(4.0));
    }
}
