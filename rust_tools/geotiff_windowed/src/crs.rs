//! CRS identity checks and the pluggable reprojection collaborator.

use geo::{Coord, MapCoords, MultiPolygon};
use log::info;

/// Canonical form for comparing CRS identifiers (`epsg:4326` == `EPSG:4326`).
pub fn normalize_crs(crs: &str) -> String {
    let trimmed = crs.trim();
    match trimmed.split_once(':') {
        Some((authority, code)) if !trimmed.contains('[') => {
            format!("{}:{}", authority.trim().to_ascii_uppercase(), code.trim())
        }
        _ => trimmed.to_string(),
    }
}

pub fn same_crs(a: &str, b: &str) -> bool {
    normalize_crs(a) == normalize_crs(b)
}

/// Coordinate transformation supplied by the caller; projection math lives outside this crate.
pub trait CrsTransformer: Send + Sync {
    fn transform_point(&self, x: f64, y: f64, from: &str, to: &str) -> Result<(f64, f64), String>;
}

/// Transform every vertex of a geometry.
pub fn reproject_geometry(
    geometry: &MultiPolygon<f64>,
    transformer: &dyn CrsTransformer,
    from: &str,
    to: &str,
) -> Result<MultiPolygon<f64>, String> {
    geometry.try_map_coords(|coord| {
        let (x, y) = transformer.transform_point(coord.x, coord.y, from, to)?;
        if !x.is_finite() || !y.is_finite() {
            return Err(format!("non-finite result for ({}, {})", coord.x, coord.y));
        }
        Ok(Coord { x, y })
    })
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RadiusMode {
    Meters, // Radius specified in map units (meters)
    Cells,  // Radius specified in number of cells
}

/// Calculate radius in cells based on mode
pub fn calculate_radius_in_cells(radius_value: f64, pixel_size: f64, mode: RadiusMode) -> usize {
    match mode {
        RadiusMode::Meters => {
            let cells = (radius_value / pixel_size).ceil() as usize;
            info!(
                "Radius: {} meters = {} cells (pixel size: {:.6} m)",
                radius_value, cells, pixel_size
            );
            cells
        }
        RadiusMode::Cells => {
            let cells = radius_value.ceil() as usize;
            info!("Radius: {} cells (specified directly)", cells);
            cells
        }
    }
}

#[cfg(feature = "gdal")]
pub use self::gdal_crs::{detect_radius_mode, GdalCrsTransformer};

#[cfg(feature = "gdal")]
mod gdal_crs {
    use super::{CrsTransformer, RadiusMode};
    use gdal::spatial_ref::{AxisMappingStrategy, CoordTransform, SpatialRef};
    use log::{info, warn};

    /// Reprojection through GDAL/PROJ.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct GdalCrsTransformer;

    fn spatial_ref(definition: &str) -> Result<SpatialRef, String> {
        let srs = SpatialRef::from_definition(definition).map_err(|e| e.to_string())?;
        srs.set_axis_mapping_strategy(AxisMappingStrategy::TraditionalGisOrder);
        Ok(srs)
    }

    impl CrsTransformer for GdalCrsTransformer {
        fn transform_point(&self, x: f64, y: f64, from: &str, to: &str) -> Result<(f64, f64), String> {
            let source = spatial_ref(from)?;
            let target = spatial_ref(to)?;
            let transform = CoordTransform::new(&source, &target).map_err(|e| e.to_string())?;
            let (mut xs, mut ys, mut zs) = ([x], [y], [0.0]);
            transform
                .transform_coords(&mut xs, &mut ys, &mut zs)
                .map_err(|e| e.to_string())?;
            Ok((xs[0], ys[0]))
        }
    }

    /// Detect if the CRS uses meters as linear unit
    pub fn detect_radius_mode(projection_wkt: &str, force_cells: bool) -> RadiusMode {
        if force_cells {
            info!("Radius mode: CELLS (forced)");
            return RadiusMode::Cells;
        }

        let spatial_ref = match SpatialRef::from_wkt(projection_wkt) {
            Ok(sr) => sr,
            Err(e) => {
                warn!("Failed to parse projection WKT, defaulting to CELLS mode: {}", e);
                return RadiusMode::Cells;
            }
        };

        if spatial_ref.is_geographic() {
            info!("Geographic CRS detected (lat/lon), using radius as CELLS");
            return RadiusMode::Cells;
        }

        if spatial_ref.is_projected() {
            let linear_units = spatial_ref.linear_units();
            if (linear_units - 1.0).abs() < 0.01 {
                info!("Projected CRS with meter units, using radius as METERS");
                return RadiusMode::Meters;
            }
            warn!(
                "Projected CRS with non-meter units detected (units={:.6}), using radius as CELLS",
                linear_units
            );
            return RadiusMode::Cells;
        }

        warn!("Unknown CRS type, defaulting to radius as CELLS");
        RadiusMode::Cells
    }
}
