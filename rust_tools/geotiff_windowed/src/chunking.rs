use crate::error::{RasterError, Result};
use crate::raster::Window;
use log::debug;
use ndarray::{s, Array3, ArrayView3};

/// One step of a window pass: the padded region to read and the
/// un-overlapped region it is responsible for writing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowBounds {
    pub index: usize,

    // Region written to output
    pub target: Window,

    // Region read from input (target plus overlap, clipped to the grid)
    pub read: Window,

    // Padding actually applied on each side (smaller at edges)
    pub pad_left: usize,
    pub pad_right: usize,
    pub pad_top: usize,
    pub pad_bottom: usize,
}

impl WindowBounds {
    pub fn overlap_pixels(&self) -> usize {
        self.read.area() - self.target.area()
    }

    /// The target region inside a block that was read for `self.read`.
    pub fn central_view<'a>(&self, padded: &'a Array3<f64>) -> ArrayView3<'a, f64> {
        let y_end = self.pad_top + self.target.height;
        let x_end = self.pad_left + self.target.width;
        padded.slice(s![.., self.pad_top..y_end, self.pad_left..x_end])
    }
}

/// Row-major tiling of a pixel region into square windows.
#[derive(Debug, Clone)]
pub struct WindowGrid {
    region: Window,
    window_size: usize,
    overlap: usize,
    pub num_windows_x: usize,
    pub num_windows_y: usize,
    pub total_windows: usize,
}

impl WindowGrid {
    /// Grid over a full `width` x `height` raster.
    pub fn new(width: usize, height: usize, window_size: usize, overlap: usize) -> Result<Self> {
        Self::within(Window::new(0, 0, width, height), window_size, overlap)
    }

    /// Grid over a sub-region; padding is clipped to the region.
    pub fn within(region: Window, window_size: usize, overlap: usize) -> Result<Self> {
        if window_size == 0 {
            return Err(RasterError::InvalidWindowSize(window_size));
        }
        let num_windows_x = region.width.div_ceil(window_size);
        let num_windows_y = region.height.div_ceil(window_size);
        let total_windows = num_windows_x * num_windows_y;

        debug!(
            "WindowGrid: {} region, window_size={}, overlap={} → {}x{} windows ({} total)",
            region, window_size, overlap, num_windows_x, num_windows_y, total_windows
        );

        Ok(Self {
            region,
            window_size,
            overlap,
            num_windows_x,
            num_windows_y,
            total_windows,
        })
    }

    pub fn window_size(&self) -> usize {
        self.window_size
    }

    pub fn overlap(&self) -> usize {
        self.overlap
    }

    pub fn iter(&self) -> WindowIter<'_> {
        WindowIter {
            grid: self,
            current_idx: 0,
        }
    }

    /// Read windows (overlap baked in), in iteration order.
    pub fn read_windows(&self) -> impl Iterator<Item = Window> + '_ {
        self.iter().map(|bounds| bounds.read)
    }

    pub fn window_bounds(&self, index: usize) -> WindowBounds {
        let wy = index / self.num_windows_x;
        let wx = index % self.num_windows_x;

        let region_col_end = self.region.col_end();
        let region_row_end = self.region.row_end();

        let x_min = self.region.col_off + wx * self.window_size;
        let y_min = self.region.row_off + wy * self.window_size;
        let x_max = (x_min + self.window_size).min(region_col_end);
        let y_max = (y_min + self.window_size).min(region_row_end);

        let read_x_min = x_min.saturating_sub(self.overlap).max(self.region.col_off);
        let read_y_min = y_min.saturating_sub(self.overlap).max(self.region.row_off);
        let read_x_max = (x_max + self.overlap).min(region_col_end);
        let read_y_max = (y_max + self.overlap).min(region_row_end);

        let bounds = WindowBounds {
            index,
            target: Window::new(x_min, y_min, x_max - x_min, y_max - y_min),
            read: Window::new(
                read_x_min,
                read_y_min,
                read_x_max - read_x_min,
                read_y_max - read_y_min,
            ),
            pad_left: x_min - read_x_min,
            pad_right: read_x_max - x_max,
            pad_top: y_min - read_y_min,
            pad_bottom: read_y_max - y_max,
        };

        debug!(
            "Window {} ({}, {}): target={}, read={}, padding=[L:{} R:{} T:{} B:{}]",
            index,
            wx,
            wy,
            bounds.target,
            bounds.read,
            bounds.pad_left,
            bounds.pad_right,
            bounds.pad_top,
            bounds.pad_bottom
        );

        bounds
    }
}

impl<'a> IntoIterator for &'a WindowGrid {
    type Item = WindowBounds;
    type IntoIter = WindowIter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

pub struct WindowIter<'a> {
    grid: &'a WindowGrid,
    current_idx: usize,
}

impl Iterator for WindowIter<'_> {
    type Item = WindowBounds;

    fn next(&mut self) -> Option<Self::Item> {
        if self.current_idx < self.grid.total_windows {
            let bounds = self.grid.window_bounds(self.current_idx);
            self.current_idx += 1;
            Some(bounds)
        } else {
            None
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.grid.total_windows - self.current_idx;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for WindowIter<'_> {}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    fn coverage(grid: &WindowGrid, width: usize, height: usize, use_read: bool) -> Array2<u32> {
        let mut counts = Array2::<u32>::zeros((height, width));
        for bounds in grid {
            let w = if use_read { bounds.read } else { bounds.target };
            counts
                .slice_mut(s![w.row_off..w.row_end(), w.col_off..w.col_end()])
                .mapv_inplace(|c| c + 1);
        }
        counts
    }

    #[test]
    fn test_window_grid_simple() {
        // 4000x4000 raster with 2000 window size and 67 overlap
        let grid = WindowGrid::new(4000, 4000, 2000, 67).unwrap();
        assert_eq!(grid.num_windows_x, 2);
        assert_eq!(grid.num_windows_y, 2);
        assert_eq!(grid.total_windows, 4);
    }

    #[test]
    fn test_window_bounds_corner() {
        let grid = WindowGrid::new(4000, 4000, 2000, 67).unwrap();
        let bounds = grid.window_bounds(0);

        assert_eq!(bounds.target, Window::new(0, 0, 2000, 2000));
        assert_eq!(bounds.read, Window::new(0, 0, 2067, 2067));
        assert_eq!(bounds.pad_left, 0);
        assert_eq!(bounds.pad_right, 67);
    }

    #[test]
    fn test_window_bounds_far_edge() {
        let grid = WindowGrid::new(4000, 4000, 2000, 67).unwrap();
        let bounds = grid.window_bounds(3);

        assert_eq!(bounds.target, Window::new(2000, 2000, 2000, 2000));
        assert_eq!(bounds.read.col_off, 1933);
        assert_eq!(bounds.read.col_end(), 4000);
        assert_eq!(bounds.pad_left, 67);
        assert_eq!(bounds.pad_right, 0);
    }

    #[test]
    fn test_partial_last_window() {
        let grid = WindowGrid::new(100, 70, 32, 0).unwrap();
        assert_eq!(grid.total_windows, 4 * 3);
        let last = grid.window_bounds(grid.total_windows - 1);
        assert_eq!(last.target, Window::new(96, 64, 4, 6));
    }

    #[test]
    fn test_row_major_order() {
        let grid = WindowGrid::new(64, 64, 32, 4).unwrap();
        let targets: Vec<_> = grid.iter().map(|b| (b.target.col_off, b.target.row_off)).collect();
        assert_eq!(targets, vec![(0, 0), (32, 0), (0, 32), (32, 32)]);
        assert_eq!(grid.iter().len(), 4);
    }

    #[test]
    fn test_partition_without_overlap() {
        for &(w, h, size) in &[(100, 70, 32), (17, 5, 16), (1, 1, 16), (256, 256, 64)] {
            let grid = WindowGrid::new(w, h, size, 0).unwrap();
            let counts = coverage(&grid, w, h, true);
            assert!(counts.iter().all(|&c| c == 1), "{}x{} by {}", w, h, size);
        }
    }

    #[test]
    fn test_overlap_targets_still_partition() {
        let grid = WindowGrid::new(90, 61, 20, 5).unwrap();
        let written = coverage(&grid, 90, 61, false);
        assert!(written.iter().all(|&c| c == 1));
        let read = coverage(&grid, 90, 61, true);
        assert!(read.iter().all(|&c| c >= 1));
        assert!(read.iter().any(|&c| c > 1));
        assert!(grid.iter().all(|b| b.read.fits_within(90, 61)));
    }

    #[test]
    fn test_sub_region_grid() {
        let region = Window::new(10, 20, 50, 30);
        let grid = WindowGrid::within(region, 16, 3).unwrap();
        for bounds in &grid {
            assert!(region.contains(&bounds.read));
            assert!(region.contains(&bounds.target));
        }
        assert_eq!(grid.window_bounds(0).target, Window::new(10, 20, 16, 16));
        assert_eq!(grid.window_bounds(0).pad_left, 0);
    }

    #[test]
    fn test_restartable() {
        let grid = WindowGrid::new(50, 50, 16, 2).unwrap();
        let first: Vec<_> = grid.read_windows().collect();
        let second: Vec<_> = grid.read_windows().collect();
        assert_eq!(first, second);
    }

    #[test]
    fn test_central_view() {
        let grid = WindowGrid::new(10, 10, 4, 2).unwrap();
        let bounds = grid.window_bounds(4);
        let padded = Array3::from_shape_fn((1, bounds.read.height, bounds.read.width), |(_, r, c)| {
            ((bounds.read.row_off + r) * 10 + bounds.read.col_off + c) as f64
        });
        let central = bounds.central_view(&padded);
        assert_eq!(central.dim(), (1, 4, 4));
        assert_eq!(central[[0, 0, 0]], (bounds.target.row_off * 10 + bounds.target.col_off) as f64);
    }

    #[test]
    fn test_zero_window_size_rejected() {
        assert!(matches!(
            WindowGrid::new(10, 10, 0, 0),
            Err(RasterError::InvalidWindowSize(0))
        ));
    }
}
