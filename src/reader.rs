use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use crate::error::{SwtError, SwtResult};
use crate::header::{HEADER_SIZE, Header, LEVEL_ENTRY_SIZE, LevelEntry};
use crate::index::{INDEX_ENTRY_SIZE, IndexEntry, TileIndex};

/// A populated cell found by a coverage scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileLocation {
    /// Grid row.
    pub row: u32,
    /// Grid column.
    pub col: u32,
    /// Payload offset relative to the level's data region.
    pub offset: u64,
    /// Payload length in bytes.
    pub length: u32,
}

/// Iterator over the populated cells of one level, in row-major order.
///
/// Produced by [`SwTilesReader::coverage`] from a single sequential read of
/// the level's index; iterating performs no further I/O.
#[derive(Debug)]
pub struct CoverageScan {
    index: TileIndex,
    next_cell: u64,
}

impl Iterator for CoverageScan {
    type Item = TileLocation;

    fn next(&mut self) -> Option<TileLocation> {
        let cols = u64::from(self.index.grid_cols());
        let cells = cols * u64::from(self.index.grid_rows());
        while self.next_cell < cells {
            let cell = self.next_cell;
            self.next_cell += 1;
            #[allow(clippy::cast_possible_truncation)]
            let (row, col) = ((cell / cols) as u32, (cell % cols) as u32);
            if let Some(entry) = self.index.get(row, col) {
                if !entry.is_empty() {
                    return Some(TileLocation {
                        row,
                        col,
                        offset: entry.offset,
                        length: entry.length,
                    });
                }
            }
        }
        None
    }
}

/// Returns `offset` when `offset..offset + length` lies inside the source.
fn span_start(offset: Option<u64>, length: u64, source_len: u64) -> Option<u64> {
    let offset = offset?;
    offset
        .checked_add(length)
        .filter(|&end| end <= source_len)
        .map(|_| offset)
}

/// Random-access reader for SWTILES archives.
///
/// Owns its source exclusively; every tile lookup is a bounds check plus two
/// reads (index entry, then payload). Callers wanting parallel reads open one
/// reader per thread.
pub struct SwTilesReader<R> {
    source: R,
    source_len: u64,
    header: Header,
    levels: Vec<LevelEntry>,
}

impl SwTilesReader<BufReader<File>> {
    /// Opens an archive file.
    ///
    /// # Errors
    ///
    /// See [`SwTilesReader::from_source`]; file-open failures pass through as
    /// [`SwtError::Io`].
    pub fn open(path: &Path) -> SwtResult<Self> {
        Self::from_source(BufReader::new(File::open(path)?))
    }
}

impl<R: Read + Seek> SwTilesReader<R> {
    /// Parses the header and level table from a seekable source.
    ///
    /// # Errors
    ///
    /// [`SwtError::InvalidMagicNumber`] and [`SwtError::UnsupportedVersion`]
    /// per the header gate, and [`SwtError::InvalidHeader`] when the source
    /// is too short for the sections the header advertises or a level entry
    /// is inconsistent with its grid.
    pub fn from_source(mut source: R) -> SwtResult<Self> {
        let source_len = source.seek(SeekFrom::End(0))?;
        source.seek(SeekFrom::Start(0))?;

        let mut raw = [0u8; HEADER_SIZE];
        source.read_exact(&mut raw).map_err(|err| {
            if err.kind() == std::io::ErrorKind::UnexpectedEof {
                SwtError::InvalidHeader
            } else {
                SwtError::Io(err)
            }
        })?;
        let header = Header::try_from_bytes(&raw)?;

        let table_length = u64::from(header.num_levels) * LEVEL_ENTRY_SIZE as u64;
        let table_end = header.level_table_offset.checked_add(table_length);
        if table_end.is_none_or(|end| end > source_len) {
            return Err(SwtError::InvalidHeader);
        }

        source.seek(SeekFrom::Start(header.level_table_offset))?;
        let mut levels = Vec::with_capacity(usize::from(header.num_levels));
        let mut raw = [0u8; LEVEL_ENTRY_SIZE];
        for _ in 0..header.num_levels {
            source.read_exact(&mut raw)?;
            let entry = LevelEntry::from_bytes(&raw);
            if entry.cell_count().checked_mul(INDEX_ENTRY_SIZE as u64) != Some(entry.index_length) {
                return Err(SwtError::InvalidHeader);
            }
            levels.push(entry);
        }

        log::debug!(
            "opened archive: {} levels, table at {}, {} bytes total",
            header.num_levels,
            header.level_table_offset,
            source_len
        );
        Ok(Self {
            source,
            source_len,
            header,
            levels,
        })
    }

    /// The parsed archive header.
    #[must_use]
    pub fn header(&self) -> &Header {
        &self.header
    }

    /// Level-table entries in file order (coarsest first as written).
    #[must_use]
    pub fn levels(&self) -> &[LevelEntry] {
        &self.levels
    }

    /// Looks a level up by id.
    ///
    /// # Errors
    ///
    /// [`SwtError::InvalidLevel`] when the id is not in the table.
    pub fn level(&self, level_id: u8) -> SwtResult<&LevelEntry> {
        self.levels
            .iter()
            .find(|level| level.level_id == level_id)
            .ok_or(SwtError::InvalidLevel(level_id))
    }

    /// Fetches the payload stored at `(row, col)`, or `None` for an empty
    /// cell.
    ///
    /// # Errors
    ///
    /// [`SwtError::InvalidLevel`] / [`SwtError::OutOfBounds`] for bad
    /// arguments; [`SwtError::TruncatedIndex`] /
    /// [`SwtError::TruncatedPayload`] when the archive is shorter than its
    /// header advertises.
    pub fn get_tile(&mut self, level_id: u8, row: u32, col: u32) -> SwtResult<Option<Vec<u8>>> {
        let level = *self.level(level_id)?;
        if row >= level.grid_rows || col >= level.grid_cols {
            return Err(SwtError::OutOfBounds {
                row,
                col,
                grid_rows: level.grid_rows,
                grid_cols: level.grid_cols,
            });
        }

        let cell = u64::from(row) * u64::from(level.grid_cols) + u64::from(col);
        let slot = span_start(
            level.index_offset.checked_add(cell * INDEX_ENTRY_SIZE as u64),
            INDEX_ENTRY_SIZE as u64,
            self.source_len,
        )
        .ok_or(SwtError::TruncatedIndex { level_id })?;
        let mut raw = [0u8; INDEX_ENTRY_SIZE];
        self.source.seek(SeekFrom::Start(slot))?;
        self.source.read_exact(&mut raw)?;
        let entry = IndexEntry::from_bytes(&raw);
        if entry.is_empty() {
            return Ok(None);
        }

        let start = span_start(
            level.data_offset.checked_add(entry.offset),
            u64::from(entry.length),
            self.source_len,
        )
        .ok_or(SwtError::TruncatedPayload {
            level_id,
            row,
            col,
        })?;
        self.source.seek(SeekFrom::Start(start))?;
        let mut payload = vec![0u8; entry.length as usize];
        self.source.read_exact(&mut payload)?;
        Ok(Some(payload))
    }

    /// Scans a level's index in one sequential read and returns an iterator
    /// over its populated cells in row-major order.
    ///
    /// # Errors
    ///
    /// [`SwtError::InvalidLevel`] for an unknown id and
    /// [`SwtError::TruncatedIndex`] when the index extends past the source.
    pub fn coverage(&mut self, level_id: u8) -> SwtResult<CoverageScan> {
        let level = *self.level(level_id)?;
        let end = level.index_offset.checked_add(level.index_length);
        if end.is_none_or(|end| end > self.source_len) {
            return Err(SwtError::TruncatedIndex { level_id });
        }
        self.source.seek(SeekFrom::Start(level.index_offset))?;
        #[allow(clippy::cast_possible_truncation)]
        let mut buf = vec![0u8; level.index_length as usize];
        self.source.read_exact(&mut buf)?;
        let index = TileIndex::from_bytes(level.grid_cols, level.grid_rows, buf)?;
        Ok(CoverageScan {
            index,
            next_cell: 0,
        })
    }

    /// Maps a ground coordinate to the grid cell containing it, or `None`
    /// outside the level's grid.
    ///
    /// # Errors
    ///
    /// [`SwtError::InvalidLevel`] for an unknown id.
    pub fn coord_to_rowcol(&self, level_id: u8, e: f64, n: f64) -> SwtResult<Option<(u32, u32)>> {
        Ok(self.level(level_id)?.rowcol_at(e, n))
    }

    /// Ground extent of one cell as `(min_e, min_n, max_e, max_n)`.
    ///
    /// # Errors
    ///
    /// [`SwtError::InvalidLevel`] / [`SwtError::OutOfBounds`] for bad
    /// arguments.
    pub fn tile_bounds(&self, level_id: u8, row: u32, col: u32) -> SwtResult<(f64, f64, f64, f64)> {
        let level = self.level(level_id)?;
        if row >= level.grid_rows || col >= level.grid_cols {
            return Err(SwtError::OutOfBounds {
                row,
                col,
                grid_rows: level.grid_rows,
                grid_cols: level.grid_cols,
            });
        }
        Ok(level.tile_bounds(row, col))
    }

    /// Counts cells inside a metric bounding box.
    ///
    /// Returns `(total_cells, present_cells)` for the grid rectangle covered
    /// by the box, clipped to the grid; a box missing the grid entirely
    /// yields `(0, 0)`.
    ///
    /// # Errors
    ///
    /// [`SwtError::InvalidLevel`] for an unknown id and
    /// [`SwtError::TruncatedIndex`] when probed entries lie past the source.
    pub fn count_tiles_in_bounds(
        &mut self,
        level_id: u8,
        e_min: f64,
        n_min: f64,
        e_max: f64,
        n_max: f64,
    ) -> SwtResult<(u64, u64)> {
        let level = *self.level(level_id)?;
        let Some(((row_min, row_max), (col_min, col_max))) =
            level.rowcol_rect(e_min, n_min, e_max, n_max)
        else {
            return Ok((0, 0));
        };

        let width = u64::from(col_max - col_min) + 1;
        #[allow(clippy::cast_possible_truncation)]
        let mut raw = vec![0u8; width as usize * INDEX_ENTRY_SIZE];
        let mut total = 0u64;
        let mut present = 0u64;
        for row in row_min..=row_max {
            let cell = u64::from(row) * u64::from(level.grid_cols) + u64::from(col_min);
            let start = span_start(
                level.index_offset.checked_add(cell * INDEX_ENTRY_SIZE as u64),
                width * INDEX_ENTRY_SIZE as u64,
                self.source_len,
            )
            .ok_or(SwtError::TruncatedIndex { level_id })?;
            self.source.seek(SeekFrom::Start(start))?;
            self.source.read_exact(&mut raw)?;
            for chunk in raw.chunks_exact(INDEX_ENTRY_SIZE) {
                total += 1;
                if !IndexEntry::from_bytes(chunk).is_empty() {
                    present += 1;
                }
            }
        }
        Ok((total, present))
    }
}
