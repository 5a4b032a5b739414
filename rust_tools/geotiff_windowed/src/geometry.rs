//! Zone geometry repair and pixel-grid masking.
//!
//! Repair is ring normalisation: non-finite vertices and consecutive duplicates
//! are dropped, rings are closed, rings with fewer than three distinct vertices
//! or no area are discarded, and orientation is fixed (exterior CCW, holes CW).
//! Masks use the even-odd rule on pixel centres, so self-intersecting rings
//! still produce a deterministic footprint.

use crate::raster::{GeoTransform, Window};
use geo::orient::{Direction, Orient};
use geo::{Coord, LineString, MultiPolygon, Polygon};
use ndarray::Array2;

/// A polygon's rings (exterior first) in fractional pixel coordinates.
pub type PixelPolygon = Vec<Vec<(f64, f64)>>;

const MIN_CROSS: f64 = 1e-12;

fn clean_ring(ring: &LineString<f64>) -> Option<LineString<f64>> {
    let mut coords: Vec<Coord<f64>> = Vec::with_capacity(ring.0.len());
    for coord in ring.coords().filter(|c| c.x.is_finite() && c.y.is_finite()) {
        if coords.last() != Some(coord) {
            coords.push(*coord);
        }
    }
    while coords.len() > 1 && coords.first() == coords.last() {
        coords.pop();
    }
    if coords.len() < 3 || is_collinear(&coords) {
        return None;
    }
    coords.push(coords[0]);
    Some(LineString::new(coords))
}

/// True when every vertex lies on the line through the first two.
fn is_collinear(coords: &[Coord<f64>]) -> bool {
    let origin = coords[0];
    let direction = coords[1] - origin;
    coords[2..].iter().all(|&c| {
        let offset = c - origin;
        (direction.x * offset.y - direction.y * offset.x).abs() < MIN_CROSS
    })
}

/// Best-effort validity repair; an empty result means nothing usable survived.
pub fn repair(geometry: &MultiPolygon<f64>) -> MultiPolygon<f64> {
    let polygons = geometry
        .0
        .iter()
        .filter_map(|polygon| {
            let exterior = clean_ring(polygon.exterior())?;
            let interiors = polygon.interiors().iter().filter_map(clean_ring).collect();
            Some(Polygon::new(exterior, interiors))
        })
        .collect();
    MultiPolygon::new(polygons).orient(Direction::Default)
}

/// Map geometry into the raster's pixel space; `None` for a singular transform.
pub fn to_pixel_space(geometry: &MultiPolygon<f64>, transform: &GeoTransform) -> Option<Vec<PixelPolygon>> {
    geometry
        .0
        .iter()
        .map(|polygon| {
            std::iter::once(polygon.exterior())
                .chain(polygon.interiors())
                .map(|ring| {
                    ring.coords()
                        .map(|c| transform.world_to_pixel(c.x, c.y))
                        .collect::<Option<Vec<_>>>()
                })
                .collect::<Option<PixelPolygon>>()
        })
        .collect()
}

/// Pixel window that can hold centres inside the polygons, clipped to the raster.
pub fn footprint_window(polygons: &[PixelPolygon], width: usize, height: usize) -> Option<Window> {
    let mut min_x = f64::MAX;
    let mut min_y = f64::MAX;
    let mut max_x = f64::MIN;
    let mut max_y = f64::MIN;
    for &(x, y) in polygons.iter().flat_map(|p| p.iter().flatten()) {
        min_x = min_x.min(x);
        min_y = min_y.min(y);
        max_x = max_x.max(x);
        max_y = max_y.max(y);
    }
    if min_x > max_x || min_y > max_y {
        return None;
    }

    let col_start = min_x.floor().max(0.0);
    let row_start = min_y.floor().max(0.0);
    let col_end = max_x.ceil().min(width as f64);
    let row_end = max_y.ceil().min(height as f64);
    if col_start >= col_end || row_start >= row_end {
        return None;
    }
    let (c0, r0) = (col_start as usize, row_start as usize);
    Some(Window::new(c0, r0, col_end as usize - c0, row_end as usize - r0))
}

/// Boolean mask over `window` of pixels whose centres fall inside any polygon.
pub fn rasterize(polygons: &[PixelPolygon], window: &Window) -> Array2<bool> {
    let mut mask = Array2::from_elem((window.height, window.width), false);
    let mut crossings: Vec<f64> = Vec::new();

    for row in window.row_off..window.row_end() {
        let yc = row as f64 + 0.5;
        for polygon in polygons {
            crossings.clear();
            for ring in polygon {
                for edge in ring.windows(2) {
                    let ((x1, y1), (x2, y2)) = (edge[0], edge[1]);
                    if (y1 > yc) != (y2 > yc) {
                        crossings.push(x1 + (yc - y1) * (x2 - x1) / (y2 - y1));
                    }
                }
            }
            crossings.sort_by(|a, b| a.total_cmp(b));

            for span in crossings.chunks_exact(2) {
                let start = (span[0] - 0.5).ceil().max(window.col_off as f64);
                let end = (span[1] - 0.5).ceil().min(window.col_end() as f64);
                if end <= start {
                    continue;
                }
                for col in start as usize..end as usize {
                    mask[[row - window.row_off, col - window.col_off]] = true;
                }
            }
        }
    }
    mask
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::{polygon, Area};

    fn identity() -> GeoTransform {
        // pixel (col, row) == world (x, -y) with origin at 0,0
        GeoTransform::north_up(0.0, 0.0, 1.0, 1.0)
    }

    fn world_square(x0: f64, y0: f64, x1: f64, y1: f64) -> MultiPolygon<f64> {
        MultiPolygon::new(vec![polygon![
            (x: x0, y: y0), (x: x1, y: y0), (x: x1, y: y1), (x: x0, y: y1)
        ]])
    }

    #[test]
    fn test_repair_drops_degenerate_rings() {
        let line = MultiPolygon::new(vec![polygon![
            (x: 0.0, y: 0.0), (x: 1.0, y: 1.0), (x: 2.0, y: 2.0)
        ]]);
        assert!(repair(&line).0.is_empty());

        let with_dupes = MultiPolygon::new(vec![polygon![
            (x: 0.0, y: 0.0), (x: 0.0, y: 0.0), (x: 4.0, y: 0.0), (x: 4.0, y: 4.0), (x: f64::NAN, y: 1.0), (x: 0.0, y: 4.0)
        ]]);
        let repaired = repair(&with_dupes);
        assert_eq!(repaired.0.len(), 1);
        assert_eq!(repaired.0[0].exterior().0.len(), 5);
        assert!((repaired.unsigned_area() - 16.0).abs() < 1e-12);
    }

    #[test]
    fn test_repair_fixes_orientation() {
        // clockwise exterior
        let cw = MultiPolygon::new(vec![polygon![
            (x: 0.0, y: 0.0), (x: 0.0, y: 2.0), (x: 2.0, y: 2.0), (x: 2.0, y: 0.0)
        ]]);
        let repaired = repair(&cw);
        assert!(repaired.0[0].signed_area() > 0.0);
    }

    #[test]
    fn test_square_mask() {
        // world y is negative downwards: rows 2..6, cols 1..4
        let zone = world_square(1.0, -2.0, 4.0, -6.0);
        let pixels = to_pixel_space(&zone, &identity()).unwrap();
        let window = footprint_window(&pixels, 10, 10).unwrap();
        assert_eq!(window, Window::new(1, 2, 3, 4));
        let mask = rasterize(&pixels, &window);
        assert!(mask.iter().all(|&m| m));
    }

    #[test]
    fn test_hole_excluded() {
        let zone = MultiPolygon::new(vec![polygon!(
            exterior: [(x: 0.0, y: 0.0), (x: 6.0, y: 0.0), (x: 6.0, y: -6.0), (x: 0.0, y: -6.0)],
            interiors: [[(x: 2.0, y: -2.0), (x: 4.0, y: -2.0), (x: 4.0, y: -4.0), (x: 2.0, y: -4.0)]]
        )]);
        let pixels = to_pixel_space(&zone, &identity()).unwrap();
        let window = footprint_window(&pixels, 6, 6).unwrap();
        let mask = rasterize(&pixels, &window);
        assert_eq!(mask.iter().filter(|&&m| m).count(), 36 - 4);
        assert!(!mask[[2, 2]] && !mask[[3, 3]]);
    }

    #[test]
    fn test_footprint_clipped_and_outside() {
        let partly = world_square(-5.0, 5.0, 3.0, -3.0);
        let pixels = to_pixel_space(&partly, &identity()).unwrap();
        assert_eq!(footprint_window(&pixels, 10, 10), Some(Window::new(0, 0, 3, 3)));

        let outside = world_square(20.0, -20.0, 30.0, -30.0);
        let pixels = to_pixel_space(&outside, &identity()).unwrap();
        assert_eq!(footprint_window(&pixels, 10, 10), None);
    }

    #[test]
    fn test_bowtie_uses_even_odd() {
        let bowtie = MultiPolygon::new(vec![polygon![
            (x: 0.0, y: 0.0), (x: 4.0, y: -4.0), (x: 4.0, y: 0.0), (x: 0.0, y: -4.0)
        ]]);
        let pixels = to_pixel_space(&repair(&bowtie), &identity()).unwrap();
        let window = footprint_window(&pixels, 4, 4).unwrap();
        let mask = rasterize(&pixels, &window);
        let filled = mask.iter().filter(|&&m| m).count();
        assert!(filled > 0 && filled < 16);
    }
}
