use geo::{polygon, MultiPolygon};
use geotiff_windowed::batch::{BatchConfig, ParallelBatchDispatcher};
use geotiff_windowed::cog::{self, OptimizeConfig};
use geotiff_windowed::error::RasterError;
use geotiff_windowed::memory::{MemoryDriver, MemoryRaster};
use geotiff_windowed::planner;
use geotiff_windowed::processor::{ProcessConfig, WindowedProcessor};
use geotiff_windowed::pyramid::{overview_factors, OverviewPyramidBuilder, PyramidConfig};
use geotiff_windowed::range_read::{EfficientRangeReader, RangeRequest};
use geotiff_windowed::raster::{BoundingBox, DataType, GeoTransform, RasterDataset, RasterDriver, RasterMeta};
use geotiff_windowed::resample::{ResampleConfig, Resampler};
use geotiff_windowed::zonal::{ZonalConfig, ZonalStatisticsEngine, Zone};
use std::path::{Path, PathBuf};

fn meta(width: usize, height: usize, bands: usize, data_type: DataType) -> RasterMeta {
    RasterMeta::new(
        width,
        height,
        bands,
        data_type,
        GeoTransform::north_up(0.0, height as f64, 1.0, 1.0),
        "EPSG:32633",
    )
}

fn ramp(width: usize, height: usize, bands: usize, data_type: DataType) -> MemoryRaster {
    MemoryRaster::from_fn("ramp", meta(width, height, bands, data_type), |b, r, c| {
        ((r * 5 + c * 3 + b * 13) % 200) as f64
    })
    .unwrap()
}

fn rectangle(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> MultiPolygon<f64> {
    MultiPolygon::new(vec![polygon![
        (x: min_x, y: min_y), (x: max_x, y: min_y), (x: max_x, y: max_y), (x: min_x, y: max_y)
    ]])
}

#[test]
fn planned_windows_cover_and_identity_round_trips() {
    let input = ramp(300, 170, 3, DataType::Int16);
    let budget = 64 * 1024;
    let plan = planner::plan_with_overlap(&input.meta(), 4, budget, 0.8).unwrap();
    assert!(plan.bytes_per_window <= budget as f64 * 0.8);

    let driver = MemoryDriver::new();
    let processor = WindowedProcessor::new(ProcessConfig {
        overlap: 4,
        max_memory_bytes: budget,
        ..ProcessConfig::default()
    });
    let (output, report) = processor
        .run(&input, &driver, Path::new("/out/copy.tif"), |_, block| Ok(block))
        .unwrap();

    assert_eq!(report.window_size, plan.window_size);
    assert_eq!(report.windows_processed, plan.windows_estimated);
    assert_eq!(report.pixels_processed, 300 * 170);
    assert_eq!(output.level_data(0), input.level_data(0));
}

#[test]
fn zone_statistics_match_whole_raster() {
    let raster = ramp(120, 80, 1, DataType::Float64);
    let data = raster.level_data(0).unwrap();
    let expected_mean = data.mean().unwrap();

    let zones = vec![
        Zone::new("everything", rectangle(0.0, 0.0, 120.0, 80.0), "EPSG:32633"),
        Zone::new("elsewhere", rectangle(1000.0, 1000.0, 1010.0, 1010.0), ""),
    ];
    let records = ZonalStatisticsEngine::new(ZonalConfig::default())
        .compute(&raster, &zones, None)
        .unwrap();

    let everything = &records["everything"].bands[0];
    assert_eq!(everything.count, 120 * 80);
    assert!((everything.mean.unwrap() - expected_mean).abs() < 1e-9);
    assert_eq!(everything.min, Some(0.0));

    let elsewhere = &records["elsewhere"];
    assert_eq!(elsewhere.bands[0].count, 0);
    assert!(elsewhere.bands[0].mean.is_none());
}

#[test]
fn zone_in_other_crs_needs_transformer() {
    let raster = ramp(20, 20, 1, DataType::UInt8);
    let zones = vec![Zone::new("z", rectangle(0.0, 0.0, 5.0, 5.0), "EPSG:4326")];
    let result = ZonalStatisticsEngine::new(ZonalConfig::default()).compute(&raster, &zones, None);
    assert!(matches!(result, Err(RasterError::CrsMismatch { .. })));
}

#[test]
fn resampling_preserves_native_and_bounds_values() {
    let input = ramp(64, 48, 2, DataType::Float32);
    let data = input.level_data(0).unwrap();
    let lo = data.iter().cloned().fold(f64::INFINITY, f64::min);
    let hi = data.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let driver = MemoryDriver::new();

    let native = ResampleConfig::new(1.0, "nearest", 20).unwrap();
    let (same, _) = Resampler::new(native)
        .resample(&input, &driver, Path::new("/out/native.tif"))
        .unwrap();
    assert_eq!(same.level_data(0), input.level_data(0));

    let coarse = ResampleConfig::new(4.0, "average", 20).unwrap();
    let (down, report) = Resampler::new(coarse)
        .resample(&input, &driver, Path::new("/out/down.tif"))
        .unwrap();
    assert_eq!((report.new_width, report.new_height), (16, 12));

    let fine = ResampleConfig::new(0.5, "bilinear", 20).unwrap();
    let (up, _) = Resampler::new(fine)
        .resample(&down, &driver, Path::new("/out/up.tif"))
        .unwrap();
    for raster in [&down, &up] {
        let values = raster.level_data(0).unwrap();
        assert!(values.iter().all(|&v| v >= lo - 1e-6 && v <= hi + 1e-6));
    }
}

#[test]
fn pyramid_factors_follow_shorter_axis() {
    assert_eq!(overview_factors(2048, 1536, 256), vec![2, 4]);

    let mut raster = ramp(2048, 1536, 1, DataType::UInt8);
    let spec = OverviewPyramidBuilder::new(PyramidConfig::default())
        .build(&mut raster)
        .unwrap();
    assert_eq!(spec.factors(), vec![2, 4]);
    assert_eq!(raster.meta().level_dims(2), Some((512, 384)));
}

#[test]
fn optimize_fixes_layout_and_enables_overview_reads() {
    let input = ramp(1024, 1024, 1, DataType::UInt16);
    let before = cog::validate(&input).unwrap();
    assert!(!before.is_valid_cog);
    assert!(before.issues.len() >= 3);

    let driver = MemoryDriver::new();
    let (output, report) = cog::optimize(&input, &driver, Path::new("/out/cog.tif"), &OptimizeConfig::default()).unwrap();
    assert!(report.validation.is_valid_cog, "{:?}", report.validation.issues);
    assert_eq!(report.overview_factors, vec![2, 4]);
    assert!(report.output_bytes < report.input_bytes);

    let request = RangeRequest {
        bbox: BoundingBox::new(0.0, 0.0, 1024.0, 1024.0),
        target_resolution: 4.0,
        max_pixels: 1 << 20,
    };
    let (block, read) = EfficientRangeReader::new(&output).read(&request).unwrap();
    assert_eq!(read.factor, 4);
    assert_eq!(block.dim(), (1, 256, 256));
    assert!(read.data_reduction_factor > 1.0);
}

fn optimize_into(
    driver: &MemoryDriver,
    input: &Path,
    output_dir: &Path,
    config: &OptimizeConfig,
) -> geotiff_windowed::Result<PathBuf> {
    let raster = driver.open(input)?;
    let output_path = output_dir.join(input.file_name().unwrap_or_default());
    cog::optimize(&raster, driver, &output_path, config)?;
    Ok(output_path)
}

#[test]
fn batch_isolates_failures_and_matches_solo_runs() {
    let one = || ramp(300, 280, 1, DataType::UInt8);
    let two = || ramp(260, 400, 2, DataType::Int16);
    let driver = MemoryDriver::new();
    driver.insert("/in/one.tif", one());
    driver.insert_bytes("/in/corrupt.tif", b"not a tiff".to_vec());
    driver.insert("/in/two.tif", two());
    let inputs = ["/in/one.tif", "/in/corrupt.tif", "/in/two.tif"];

    let out_dir = tempfile::tempdir().unwrap();
    let config = OptimizeConfig {
        tile_size: 128,
        ..OptimizeConfig::default()
    };
    let report = ParallelBatchDispatcher::new(BatchConfig { max_workers: 3 })
        .run(
            &inputs,
            out_dir.path(),
            |input, dir, params| optimize_into(&driver, input, dir, params),
            &config,
        )
        .unwrap();
    assert_eq!((report.successful, report.failed), (2, 1));
    assert!(!report.result_for(1).unwrap().success);

    for (index, name, source) in [(0, "/in/one.tif", one()), (2, "/in/two.tif", two())] {
        let solo = MemoryDriver::new();
        solo.insert(name, source);
        let solo_path = optimize_into(&solo, Path::new(name), Path::new("/solo"), &config).unwrap();
        let solo_out = solo.open(&solo_path).unwrap();

        let batch_path = report.result_for(index).unwrap().output_path.clone().unwrap();
        let batch_out = driver.open(&batch_path).unwrap();
        assert_eq!(batch_out.meta(), solo_out.meta());
        for level in 0..batch_out.meta().level_count() {
            assert_eq!(batch_out.level_data(level), solo_out.level_data(level));
        }
    }
}
