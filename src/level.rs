//! Level planning: turning a parsed manifest into the grid a writer streams.

use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::error::{SwtError, SwtResult};
use crate::vrt::VrtInfo;

/// One resolution level to be written: grid geometry plus the sparse mapping
/// from `(row, col)` to the payload stored there.
///
/// Built once, immutable afterwards apart from test-subset selection.
#[derive(Debug, Clone)]
pub struct LevelConfig {
    /// Caller-assigned identifier written into the level table.
    pub level_id: u8,
    /// Pixel edge length of every tile in this level.
    pub tile_px: u16,
    /// Ground resolution in metres per pixel.
    pub resolution_m: f32,
    /// Metric edge length of one tile, `tile_px * resolution_m`.
    pub tile_extent_m: f32,
    /// Easting of the grid's left edge.
    pub origin_e: f64,
    /// Northing of the grid's top edge.
    pub origin_n: f64,
    /// Number of grid columns.
    pub grid_cols: u32,
    /// Number of grid rows.
    pub grid_rows: u32,
    tiles: BTreeMap<(u32, u32), PathBuf>,
}

impl LevelConfig {
    /// Creates an empty level with explicit grid geometry.
    ///
    /// # Errors
    ///
    /// [`SwtError::InvalidTileSize`] when `tile_px` is zero and
    /// [`SwtError::InvalidResolution`] when `resolution_m` is not a positive
    /// finite number.
    pub fn new(
        level_id: u8,
        tile_px: u16,
        resolution_m: f32,
        origin_e: f64,
        origin_n: f64,
        grid_cols: u32,
        grid_rows: u32,
    ) -> SwtResult<Self> {
        if tile_px == 0 {
            return Err(SwtError::InvalidTileSize(tile_px));
        }
        if !resolution_m.is_finite() || resolution_m <= 0.0 {
            return Err(SwtError::InvalidResolution(resolution_m));
        }
        Ok(Self {
            level_id,
            tile_px,
            resolution_m,
            tile_extent_m: f32::from(tile_px) * resolution_m,
            origin_e,
            origin_n,
            grid_cols,
            grid_rows,
            tiles: BTreeMap::new(),
        })
    }

    /// Derives a level from a parsed manifest and assigns every placement to
    /// its grid cell.
    ///
    /// Grid dimensions round up, so the last row and column may be partially
    /// populated. Placements colliding on a cell keep the last one; a
    /// placement outside the declared raster is skipped. Both are logged.
    ///
    /// # Errors
    ///
    /// [`SwtError::InvalidTileSize`] for a zero `tile_px`;
    /// [`SwtError::ManifestMalformed`] when the derived grid dimensions
    /// overflow the 32-bit fields of the level table.
    pub fn from_vrt(vrt: &VrtInfo, tile_px: u16, level_id: u8) -> SwtResult<Self> {
        if tile_px == 0 {
            return Err(SwtError::InvalidTileSize(tile_px));
        }
        let edge = u64::from(tile_px);
        let grid_cols = vrt.raster_x.div_ceil(edge);
        let grid_rows = vrt.raster_y.div_ceil(edge);
        let (grid_cols, grid_rows) = match (u32::try_from(grid_cols), u32::try_from(grid_rows)) {
            (Ok(cols), Ok(rows)) => (cols, rows),
            _ => {
                return Err(SwtError::ManifestMalformed(format!(
                    "grid of {grid_cols} x {grid_rows} tiles overflows the level table"
                )));
            }
        };

        #[allow(clippy::cast_possible_truncation)]
        let mut level = Self::new(
            level_id,
            tile_px,
            vrt.pixel_size as f32,
            vrt.origin_e,
            vrt.origin_n,
            grid_cols,
            grid_rows,
        )?;

        for placement in &vrt.placements {
            let row = placement.y_off / edge;
            let col = placement.x_off / edge;
            if row >= u64::from(grid_rows) || col >= u64::from(grid_cols) {
                log::warn!(
                    "placement {} at pixel ({}, {}) is outside the declared raster, skipped",
                    placement.path.display(),
                    placement.x_off,
                    placement.y_off
                );
                continue;
            }
            let cell = (row as u32, col as u32);
            if let Some(previous) = level.tiles.insert(cell, placement.path.clone()) {
                log::warn!(
                    "cell ({}, {}) assigned twice, {} replaces {}",
                    cell.0,
                    cell.1,
                    placement.path.display(),
                    previous.display()
                );
            }
        }
        Ok(level)
    }

    /// Assigns a payload to a cell, replacing any previous assignment.
    ///
    /// # Errors
    ///
    /// [`SwtError::OutOfBounds`] when the cell lies outside the grid.
    pub fn insert_tile(
        &mut self,
        row: u32,
        col: u32,
        path: impl Into<PathBuf>,
    ) -> SwtResult<()> {
        if row >= self.grid_rows || col >= self.grid_cols {
            return Err(SwtError::OutOfBounds {
                row,
                col,
                grid_rows: self.grid_rows,
                grid_cols: self.grid_cols,
            });
        }
        self.tiles.insert((row, col), path.into());
        Ok(())
    }

    /// The populated cells in row-major key order.
    #[must_use]
    pub fn tiles(&self) -> &BTreeMap<(u32, u32), PathBuf> {
        &self.tiles
    }

    /// Number of populated cells.
    #[must_use]
    pub fn tile_count(&self) -> usize {
        self.tiles.len()
    }

    /// Total number of cells in the grid.
    #[must_use]
    pub fn cell_count(&self) -> u64 {
        u64::from(self.grid_cols) * u64::from(self.grid_rows)
    }

    /// Restricts the level to a dense square subset of roughly `count` tiles,
    /// for test builds of large mosaics.
    ///
    /// The window has edge `ceil(sqrt(count))`. With `anchor` pinned it sits
    /// at that cell; otherwise the window with the most placements wins, ties
    /// going to the lowest row, then column, stopping early once a window
    /// holds `count`. Placements inside the window are kept in row-major
    /// order up to `count`. Grid dimensions are left untouched.
    pub fn select_dense_region(&mut self, count: usize, anchor: Option<(u32, u32)>) {
        if count == 0 {
            self.tiles.clear();
            return;
        }
        if anchor.is_none() && self.tiles.len() <= count {
            return;
        }
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let side = (count as f64).sqrt().ceil() as u32;
        let (row0, col0) = anchor.unwrap_or_else(|| self.densest_window(side, count));
        let row_end = row0.saturating_add(side).min(self.grid_rows);
        let col_end = col0.saturating_add(side).min(self.grid_cols);

        self.tiles = self
            .tiles
            .iter()
            .filter(|((row, col), _)| {
                (row0..row_end).contains(row) && (col0..col_end).contains(col)
            })
            .take(count)
            .map(|(cell, path)| (*cell, path.clone()))
            .collect();
    }

    /// Finds the `side x side` window over the bounding box of populated
    /// cells holding the most placements.
    fn densest_window(&self, side: u32, target: usize) -> (u32, u32) {
        let Some((row_min, row_max, col_min, col_max)) = self.key_bounds() else {
            return (0, 0);
        };
        let mut best = (row_min, col_min);
        let mut best_count = 0usize;
        'scan: for row in row_min..=row_max {
            for col in col_min..=col_max {
                let row_end = row.saturating_add(side).min(self.grid_rows);
                let col_end = col.saturating_add(side).min(self.grid_cols);
                let mut inside = 0usize;
                for r in row..row_end {
                    for c in col..col_end {
                        if self.tiles.contains_key(&(r, c)) {
                            inside += 1;
                        }
                    }
                }
                if inside > best_count {
                    best_count = inside;
                    best = (row, col);
                    if inside >= target {
                        break 'scan;
                    }
                }
            }
        }
        best
    }

    fn key_bounds(&self) -> Option<(u32, u32, u32, u32)> {
        let mut keys = self.tiles.keys();
        let &(first_row, first_col) = keys.next()?;
        let bounds = keys.fold(
            (first_row, first_row, first_col, first_col),
            |(row_min, row_max, col_min, col_max), &(row, col)| {
                (
                    row_min.min(row),
                    row_max.max(row),
                    col_min.min(col),
                    col_max.max(col),
                )
            },
        );
        Some(bounds)
    }

    /// Metric bounding box `(min_e, min_n, max_e, max_n)` of the populated
    /// cells, or `None` for an empty level.
    #[must_use]
    pub fn populated_bounds(&self) -> Option<(f64, f64, f64, f64)> {
        let (row_min, row_max, col_min, col_max) = self.key_bounds()?;
        let extent = f64::from(self.tile_extent_m);
        Some((
            self.origin_e + f64::from(col_min) * extent,
            self.origin_n - f64::from(row_max + 1) * extent,
            self.origin_e + f64::from(col_max + 1) * extent,
            self.origin_n - f64::from(row_min) * extent,
        ))
    }
}
