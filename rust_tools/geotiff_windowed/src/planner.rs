//! Window sizing under a memory ceiling.

use crate::error::{RasterError, Result};
use crate::monitor::MemoryMonitor;
use crate::raster::RasterMeta;
use log::{debug, info};

/// Largest window side ever proposed.
pub const MAX_WINDOW_SIZE: usize = 4096;

/// Windows are never shrunk below this side.
pub const MIN_WINDOW_SIZE: usize = 16;

pub const DEFAULT_SAFETY_FACTOR: f64 = 0.8;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemoryPlan {
    pub window_size: usize,
    pub bytes_per_window: f64,
    pub windows_estimated: usize,
    pub safety_factor: f64,
    pub max_memory_bytes: u64,
}

/// Square window side for a raster under `max_memory_bytes × safety_factor`.
///
/// Starts from `min(width, height, 4096)` and halves until one window of all
/// bands fits, failing with [`RasterError::InsufficientMemoryBudget`] if even a
/// 16-pixel window does not. Pure; does no I/O.
pub fn plan(meta: &RasterMeta, max_memory_bytes: u64, safety_factor: f64) -> Result<MemoryPlan> {
    plan_for_pixel_bytes(meta, meta.bytes_per_pixel(), 0, max_memory_bytes, safety_factor)
}

/// Same as [`plan`], but the budget must hold the padded read block
/// `(side + 2 * overlap)²`, not just the window itself.
pub fn plan_with_overlap(
    meta: &RasterMeta,
    overlap: usize,
    max_memory_bytes: u64,
    safety_factor: f64,
) -> Result<MemoryPlan> {
    plan_for_pixel_bytes(meta, meta.bytes_per_pixel(), overlap, max_memory_bytes, safety_factor)
}

/// Same as [`plan`], sized for one band at a time.
pub fn plan_per_band(meta: &RasterMeta, max_memory_bytes: u64, safety_factor: f64) -> Result<MemoryPlan> {
    plan_for_pixel_bytes(meta, meta.data_type.byte_width(), 0, max_memory_bytes, safety_factor)
}

/// Plans against a fraction of the memory the system currently has available.
pub fn plan_with_monitor(
    meta: &RasterMeta,
    monitor: &MemoryMonitor,
    fraction_of_available: f64,
    safety_factor: f64,
) -> Result<MemoryPlan> {
    if !(fraction_of_available > 0.0 && fraction_of_available <= 1.0) {
        return Err(RasterError::invalid(
            "fraction_of_available",
            format!("{} is outside (0, 1]", fraction_of_available),
        ));
    }
    let budget = monitor.budget_bytes(fraction_of_available);
    info!(
        "Planning against {:.1} MB ({:.0}% of available memory)",
        budget as f64 / (1024.0 * 1024.0),
        fraction_of_available * 100.0
    );
    plan(meta, budget, safety_factor)
}

fn plan_for_pixel_bytes(
    meta: &RasterMeta,
    bytes_per_pixel: usize,
    overlap: usize,
    max_memory_bytes: u64,
    safety_factor: f64,
) -> Result<MemoryPlan> {
    meta.validate()?;
    if !(safety_factor > 0.0 && safety_factor <= 1.0) {
        return Err(RasterError::invalid(
            "safety_factor",
            format!("{} is outside (0, 1]", safety_factor),
        ));
    }

    let budget = max_memory_bytes as f64 * safety_factor;
    let footprint = |side: usize| {
        let padded = side + 2 * overlap;
        (padded * padded * bytes_per_pixel) as f64
    };

    let mut side = meta.width.min(meta.height).min(MAX_WINDOW_SIZE);
    while footprint(side) > budget && side > MIN_WINDOW_SIZE {
        side = (side / 2).max(MIN_WINDOW_SIZE);
    }
    if footprint(side) > budget {
        return Err(RasterError::InsufficientMemoryBudget {
            max_memory_bytes,
            safety_factor,
            bytes_per_pixel,
            min_window: side,
        });
    }

    let windows_estimated = meta.width.div_ceil(side) * meta.height.div_ceil(side);
    debug!(
        "Planned {}x{} windows (overlap {}, {:.0} bytes each, {} windows) for {}x{} raster",
        side,
        side,
        overlap,
        footprint(side),
        windows_estimated,
        meta.width,
        meta.height
    );

    Ok(MemoryPlan {
        window_size: side,
        bytes_per_window: footprint(side),
        windows_estimated,
        safety_factor,
        max_memory_bytes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raster::{DataType, GeoTransform};

    fn meta(width: usize, height: usize, bands: usize, data_type: DataType) -> RasterMeta {
        RasterMeta::new(
            width,
            height,
            bands,
            data_type,
            GeoTransform::north_up(0.0, 0.0, 10.0, 10.0),
            "EPSG:3857",
        )
    }

    #[test]
    fn test_generous_budget_uses_largest_window() {
        let plan = plan(&meta(10_000, 8_000, 3, DataType::UInt8), 1 << 30, 0.8).unwrap();
        assert_eq!(plan.window_size, 4096);
        assert_eq!(plan.windows_estimated, 3 * 2);
    }

    #[test]
    fn test_small_raster_single_window() {
        let plan = plan(&meta(300, 200, 1, DataType::Float32), 1 << 30, 1.0).unwrap();
        assert_eq!(plan.window_size, 200);
        assert_eq!(plan.windows_estimated, 2);
    }

    #[test]
    fn test_window_halves_to_fit() {
        // 4 bands of f64 = 32 bytes per pixel; 1 MiB x 0.5 fits 128x128 (512 KiB)
        let plan = plan(&meta(5000, 5000, 4, DataType::Float64), 1 << 20, 0.5).unwrap();
        assert_eq!(plan.window_size, 128);
        assert!(plan.bytes_per_window <= (1 << 20) as f64 * 0.5);
    }

    #[test]
    fn test_insufficient_budget() {
        let result = plan(&meta(10_000, 10_000, 1, DataType::Float32), 100, 0.8);
        assert!(matches!(
            result,
            Err(RasterError::InsufficientMemoryBudget { min_window: 16, .. })
        ));
    }

    #[test]
    fn test_invalid_safety_factor() {
        let m = meta(100, 100, 1, DataType::UInt8);
        assert!(plan(&m, 1 << 20, 0.0).is_err());
        assert!(plan(&m, 1 << 20, 1.5).is_err());
    }

    #[test]
    fn test_budget_and_coverage_hold_across_sizes() {
        let budgets = [4096u64, 65_536, 1 << 20, 1 << 24];
        let shapes = [(16, 16), (100, 37), (1000, 1000), (5000, 333), (9000, 12_000)];
        for &(w, h) in &shapes {
            for &budget in &budgets {
                let m = meta(w, h, 2, DataType::Int16);
                let row_cost = (w * m.bytes_per_pixel()) as u64;
                let plan = match plan(&m, budget, 1.0) {
                    Ok(plan) => plan,
                    Err(RasterError::InsufficientMemoryBudget { .. }) => {
                        assert!(budget < row_cost, "{}x{} at {} bytes", w, h, budget);
                        continue;
                    }
                    Err(e) => panic!("unexpected error {}", e),
                };
                assert!(plan.bytes_per_window <= budget as f64);
                assert!(plan.windows_estimated * plan.window_size.pow(2) >= w * h);
            }
        }
    }

    #[test]
    fn test_overlap_counts_against_budget() {
        let m = meta(300, 200, 1, DataType::Float64);
        // unpadded 50x50 fits, but 90x90 reads would not
        assert_eq!(plan(&m, 32_768, 1.0).unwrap().window_size, 50);

        let padded = plan_with_overlap(&m, 20, 32_768, 1.0).unwrap();
        assert_eq!(padded.window_size, 16);
        assert_eq!(padded.bytes_per_window, (56 * 56 * 8) as f64);
        assert!(padded.bytes_per_window <= 32_768.0);

        assert!(matches!(
            plan_with_overlap(&m, 40, 32_768, 1.0),
            Err(RasterError::InsufficientMemoryBudget { min_window: 16, .. })
        ));
    }

    #[test]
    fn test_per_band_plan_allows_larger_windows() {
        let m = meta(8000, 8000, 8, DataType::Float32);
        let all_bands = plan(&m, 16 << 20, 1.0).unwrap();
        let one_band = plan_per_band(&m, 16 << 20, 1.0).unwrap();
        assert!(one_band.window_size > all_bands.window_size);
    }
}
