//! Display surface collaborator: grid geometry and per-stream targets.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::config::StreamDescriptor;

pub mod presenter;

pub use presenter::{presenter_for, Presenter, PresenterBackend, SyncPolicy};

/// Pixel rectangle on the display surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Region {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Region {
    pub fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn area(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }

    fn right(&self) -> i64 {
        i64::from(self.x) + i64::from(self.width)
    }

    fn bottom(&self) -> i64 {
        i64::from(self.y) + i64::from(self.height)
    }

    /// Whether the two rectangles share at least one pixel.
    pub fn overlaps(&self, other: &Region) -> bool {
        i64::from(self.x) < other.right()
            && i64::from(other.x) < self.right()
            && i64::from(self.y) < other.bottom()
            && i64::from(other.y) < self.bottom()
    }
}

/// Row-major grid of equally sized cells covering the whole surface. The last
/// column and row absorb the remainder of the integer division so the cells
/// tile the surface exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridLayout {
    pub width: u32,
    pub height: u32,
    pub columns: u32,
    pub rows: u32,
}

impl GridLayout {
    /// Smallest grid with `columns` columns holding `cells` cells.
    pub fn for_cells(width: u32, height: u32, columns: u32, cells: usize) -> Self {
        let columns = columns.max(1);
        let rows = (cells as u32).div_ceil(columns).max(1);
        Self {
            width,
            height,
            columns,
            rows,
        }
    }

    pub fn capacity(&self) -> usize {
        (self.columns as usize) * (self.rows as usize)
    }

    pub fn cell(&self, index: usize) -> Option<Region> {
        if index >= self.capacity() {
            return None;
        }
        let column = (index % self.columns as usize) as u32;
        let row = (index / self.columns as usize) as u32;

        let cell_width = self.width / self.columns;
        let cell_height = self.height / self.rows;
        let x = column * cell_width;
        let y = row * cell_height;
        let width = if column + 1 == self.columns {
            self.width - x
        } else {
            cell_width
        };
        let height = if row + 1 == self.rows {
            self.height - y
        } else {
            cell_height
        };

        Some(Region::new(x as i32, y as i32, width, height))
    }
}

/// Where a presenter draws: its rectangle on the surface and, when the
/// windowing side provides one, the native window it renders into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplayTarget {
    pub region: Region,
    pub window_handle: Option<u64>,
}

/// Provider of drawable targets, one per stream.
pub trait DisplaySurface: Send + Sync {
    fn target(&self, stream: &StreamDescriptor) -> DisplayTarget;
}

/// Display whose native windows, if any, are created outside this process
/// and passed in by handle.
#[derive(Debug, Clone, Default)]
pub struct StaticDisplay {
    handles: HashMap<String, u64>,
}

impl StaticDisplay {
    pub fn new(handles: impl IntoIterator<Item = (String, u64)>) -> Self {
        Self {
            handles: handles.into_iter().collect(),
        }
    }
}

impl DisplaySurface for StaticDisplay {
    fn target(&self, stream: &StreamDescriptor) -> DisplayTarget {
        DisplayTarget {
            region: stream.region,
            window_handle: self.handles.get(&stream.name).copied(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grid_cells_tile_surface() {
        let grid = GridLayout::for_cells(1920, 1080, 2, 4);
        assert_eq!(grid.rows, 2);
        assert_eq!(grid.cell(0), Some(Region::new(0, 0, 960, 540)));
        assert_eq!(grid.cell(1), Some(Region::new(960, 0, 960, 540)));
        assert_eq!(grid.cell(3), Some(Region::new(960, 540, 960, 540)));
        assert_eq!(grid.cell(4), None);
    }

    #[test]
    fn test_grid_remainder_goes_to_last_cells() {
        let grid = GridLayout::for_cells(1001, 601, 2, 3);
        assert_eq!(grid.rows, 2);
        assert_eq!(grid.cell(0), Some(Region::new(0, 0, 500, 300)));
        assert_eq!(grid.cell(1), Some(Region::new(500, 0, 501, 300)));
        assert_eq!(grid.cell(2), Some(Region::new(0, 300, 500, 301)));

        let total: u64 = (0..grid.capacity())
            .filter_map(|i| grid.cell(i))
            .map(|r| r.area())
            .sum();
        assert_eq!(total, 1001 * 601);
    }

    #[test]
    fn test_region_overlap() {
        let a = Region::new(0, 0, 100, 100);
        assert!(a.overlaps(&Region::new(50, 50, 100, 100)));
        assert!(!a.overlaps(&Region::new(100, 0, 100, 100)));
        assert!(!a.overlaps(&Region::new(0, 100, 10, 10)));
    }

    #[test]
    fn test_empty_grid_has_one_row() {
        let grid = GridLayout::for_cells(800, 600, 2, 0);
        assert_eq!(grid.rows, 1);
        assert_eq!(grid.capacity(), 2);
    }
}
