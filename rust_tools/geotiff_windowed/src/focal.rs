use crate::chunking::WindowBounds;
use crate::error::TransformError;
use ndarray::{Array2, Array3, ArrayView2, Axis};

/// Square-window mean of every band, ignoring `nodata` and NaN cells.
///
/// Cells whose whole neighbourhood is missing become `nodata` (or NaN when the
/// raster has none). Edges use the truncated window, like
/// `scipy.ndimage.uniform_filter` with nodata excluded from the denominator.
pub fn focal_mean(block: &Array3<f64>, radius: usize, nodata: Option<f64>) -> Array3<f64> {
    let mut out = Array3::zeros(block.raw_dim());
    for (band, mut plane) in block.axis_iter(Axis(0)).zip(out.axis_iter_mut(Axis(0))) {
        plane.assign(&focal_mean_band(band, radius, nodata));
    }
    out
}

fn focal_mean_band(data: ArrayView2<'_, f64>, radius: usize, nodata: Option<f64>) -> Array2<f64> {
    let (nrows, ncols) = data.dim();
    let missing = nodata.unwrap_or(f64::NAN);
    let is_valid = |v: f64| !v.is_nan() && nodata.map_or(true, |nd| v != nd);

    // Summed-area tables of values and valid counts, one extra row/col of zeros.
    let mut sums = Array2::<f64>::zeros((nrows + 1, ncols + 1));
    let mut counts = Array2::<u32>::zeros((nrows + 1, ncols + 1));
    for r in 0..nrows {
        for c in 0..ncols {
            let v = data[[r, c]];
            let (value, count) = if is_valid(v) { (v, 1) } else { (0.0, 0) };
            sums[[r + 1, c + 1]] = value + sums[[r, c + 1]] + sums[[r + 1, c]] - sums[[r, c]];
            counts[[r + 1, c + 1]] = count + counts[[r, c + 1]] + counts[[r + 1, c]] - counts[[r, c]];
        }
    }

    Array2::from_shape_fn((nrows, ncols), |(row, col)| {
        let row_min = row.saturating_sub(radius);
        let row_max = (row + radius + 1).min(nrows);
        let col_min = col.saturating_sub(radius);
        let col_max = (col + radius + 1).min(ncols);

        let valid = counts[[row_max, col_max]] + counts[[row_min, col_min]]
            - counts[[row_min, col_max]]
            - counts[[row_max, col_min]];
        if valid == 0 {
            return missing;
        }
        let total = sums[[row_max, col_max]] - sums[[row_min, col_max]] - sums[[row_max, col_min]]
            + sums[[row_min, col_min]];
        total / valid as f64
    })
}

/// Window transform for [`crate::processor::WindowedProcessor`]; run it with an
/// overlap of at least `radius` so tile seams match a whole-raster pass.
pub fn focal_mean_transform(
    radius: usize,
    nodata: Option<f64>,
) -> impl FnMut(&WindowBounds, Array3<f64>) -> Result<Array3<f64>, TransformError> {
    move |_bounds, block| Ok(focal_mean(&block, radius, nodata))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr2, Array3};

    fn single_band(rows: &[[f64; 3]; 3]) -> Array3<f64> {
        arr2(rows).insert_axis(Axis(0))
    }

    #[test]
    fn test_uniform_block_unchanged() {
        let block = Array3::from_elem((2, 5, 5), 7.0);
        let out = focal_mean(&block, 2, None);
        assert!(out.iter().all(|&v| (v - 7.0).abs() < 1e-12));
    }

    #[test]
    fn test_center_mean_with_nodata() {
        let block = single_band(&[[1.0, 2.0, -9999.0], [2.0, 1.0, 2.0], [1.0, 2.0, 1.0]]);
        let out = focal_mean(&block, 1, Some(-9999.0));
        // 8 valid cells summing to 12
        assert!((out[[0, 1, 1]] - 1.5).abs() < 1e-12);
    }

    #[test]
    fn test_edge_uses_truncated_window() {
        let block = single_band(&[[1.0, 2.0, 3.0], [4.0, 5.0, 6.0], [7.0, 8.0, 9.0]]);
        let out = focal_mean(&block, 1, None);
        // top-left neighbourhood: 1, 2, 4, 5
        assert!((out[[0, 0, 0]] - 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_all_missing_neighbourhood() {
        let block = single_band(&[[0.0; 3]; 3]);
        let out = focal_mean(&block, 1, Some(0.0));
        assert!(out.iter().all(|&v| v == 0.0));

        let nan_block = Array3::from_elem((1, 2, 2), f64::NAN);
        assert!(focal_mean(&nan_block, 1, None).iter().all(|v| v.is_nan()));
    }
}
