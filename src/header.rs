use std::io::Cursor;
use std::path::Path;

use bytes::{Buf, BufMut};

use crate::error::{SwtError, SwtResult};

/// Magic bytes at the start of every SWTILES archive.
pub const MAGIC: [u8; 8] = *b"SWTILES\0";

/// The only format version this crate reads and writes.
pub const VERSION: u16 = 2;

/// Size of the fixed header at offset 0, in bytes.
pub const HEADER_SIZE: usize = 256;

/// Size of one level-table record, in bytes.
pub const LEVEL_ENTRY_SIZE: usize = 64;

/// Kind of data stored in the archive. Advertised in the header, no effect on layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    /// Visual raster imagery.
    Raster = 1,
    /// Terrain elevation encoded as imagery.
    Terrain = 2,
    /// Anything else.
    Other = 3,
}

impl TryFrom<u8> for DataType {
    type Error = SwtError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Raster),
            2 => Ok(Self::Terrain),
            3 => Ok(Self::Other),
            _ => Err(SwtError::InvalidDataType(value)),
        }
    }
}

/// Encoding of the stored tile payloads. Payloads themselves are opaque to the codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    /// WebP imagery.
    Webp = 1,
    /// PNG imagery.
    Png = 2,
    /// JPEG imagery.
    Jpeg = 3,
    /// AVIF imagery.
    Avif = 4,
}

impl TryFrom<u8> for ImageFormat {
    type Error = SwtError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Webp),
            2 => Ok(Self::Png),
            3 => Ok(Self::Jpeg),
            4 => Ok(Self::Avif),
            _ => Err(SwtError::InvalidImageFormat(value)),
        }
    }
}

impl ImageFormat {
    /// Guesses the format from a payload path's extension. Unknown or missing
    /// extensions fall back to [`ImageFormat::Png`].
    #[must_use]
    pub fn from_path(path: &Path) -> Self {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase);
        match ext.as_deref() {
            Some("webp") => Self::Webp,
            Some("jpg" | "jpeg") => Self::Jpeg,
            Some("avif") => Self::Avif,
            _ => Self::Png,
        }
    }
}

/// The 256-byte archive header.
///
/// All multi-byte scalars are little-endian; bytes not covered by a field are
/// reserved, written as zero and ignored on read.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Header {
    /// Format version, always [`VERSION`] for files this crate writes.
    pub version: u16,
    /// Kind of data stored in the archive.
    pub data_type: DataType,
    /// Payload encoding advertised to consumers.
    pub image_format: ImageFormat,
    /// EPSG (or similar) code of the ground CRS.
    pub crs_code: u32,
    /// Westernmost easting covered by any populated cell, metres.
    pub bounds_min_e: f64,
    /// Southernmost northing covered by any populated cell, metres.
    pub bounds_min_n: f64,
    /// Easternmost easting covered by any populated cell, metres.
    pub bounds_max_e: f64,
    /// Northernmost northing covered by any populated cell, metres.
    pub bounds_max_n: f64,
    /// Pixel edge length of a tile in the first level.
    pub tile_px: u16,
    /// Number of entries in the level table.
    pub num_levels: u8,
    /// Absolute byte offset of the level table.
    pub level_table_offset: u64,
}

impl Header {
    /// Parses a header from the first [`HEADER_SIZE`] bytes of an archive.
    ///
    /// # Errors
    ///
    /// [`SwtError::InvalidMagicNumber`] when the magic does not match,
    /// [`SwtError::UnsupportedVersion`] for any version other than 2, and
    /// [`SwtError::InvalidDataType`] / [`SwtError::InvalidImageFormat`] for
    /// unknown enum bytes.
    pub fn try_from_bytes(raw: &[u8; HEADER_SIZE]) -> SwtResult<Self> {
        if raw[..MAGIC.len()] != MAGIC {
            return Err(SwtError::InvalidMagicNumber);
        }
        let mut buf = Cursor::new(&raw[MAGIC.len()..]);

        let version = buf.get_u16_le();
        if version != VERSION {
            return Err(SwtError::UnsupportedVersion(version));
        }

        let data_type = buf.get_u8().try_into()?;
        let image_format = buf.get_u8().try_into()?;
        let crs_code = buf.get_u32_le();
        let bounds_min_e = buf.get_f64_le();
        let bounds_min_n = buf.get_f64_le();
        let bounds_max_e = buf.get_f64_le();
        let bounds_max_n = buf.get_f64_le();
        let tile_px = buf.get_u16_le();
        let num_levels = buf.get_u8();
        buf.advance(1); // reserved
        let level_table_offset = buf.get_u64_le();

        Ok(Self {
            version,
            data_type,
            image_format,
            crs_code,
            bounds_min_e,
            bounds_min_n,
            bounds_max_e,
            bounds_max_n,
            tile_px,
            num_levels,
            level_table_offset,
        })
    }

    /// Serializes the header into its fixed 256-byte on-disk form.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut raw = [0u8; HEADER_SIZE];
        let mut buf = &mut raw[..];
        buf.put_slice(&MAGIC);
        buf.put_u16_le(self.version);
        buf.put_u8(self.data_type as u8);
        buf.put_u8(self.image_format as u8);
        buf.put_u32_le(self.crs_code);
        buf.put_f64_le(self.bounds_min_e);
        buf.put_f64_le(self.bounds_min_n);
        buf.put_f64_le(self.bounds_max_e);
        buf.put_f64_le(self.bounds_max_n);
        buf.put_u16_le(self.tile_px);
        buf.put_u8(self.num_levels);
        buf.put_u8(0); // reserved
        buf.put_u64_le(self.level_table_offset);
        // the remaining bytes stay zero
        raw
    }
}

/// One 64-byte record of the level table.
///
/// The reader trusts the recorded offsets, never implicit adjacency of the
/// file sections.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LevelEntry {
    /// Caller-assigned identifier, unique within the archive.
    pub level_id: u8,
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
    /// Number of populated cells.
    pub tile_count: u32,
    /// Absolute byte offset of this level's dense index.
    pub index_offset: u64,
    /// Length of the index in bytes, `grid_cols * grid_rows * 8`.
    pub index_length: u64,
    /// Absolute byte offset of this level's payload region.
    pub data_offset: u64,
}

impl LevelEntry {
    /// Parses one level-table record.
    pub(crate) fn from_bytes(raw: &[u8; LEVEL_ENTRY_SIZE]) -> Self {
        let mut buf = Cursor::new(&raw[..]);
        let level_id = buf.get_u8();
        buf.advance(1); // reserved
        let resolution_m = buf.get_f32_le();
        let tile_extent_m = buf.get_f32_le();
        buf.advance(2); // reserved
        Self {
            level_id,
            resolution_m,
            tile_extent_m,
            origin_e: buf.get_f64_le(),
            origin_n: buf.get_f64_le(),
            grid_cols: buf.get_u32_le(),
            grid_rows: buf.get_u32_le(),
            tile_count: buf.get_u32_le(),
            index_offset: buf.get_u64_le(),
            index_length: buf.get_u64_le(),
            data_offset: buf.get_u64_le(),
        }
    }

    /// Serializes the record into its 64-byte on-disk form.
    pub(crate) fn to_bytes(&self) -> [u8; LEVEL_ENTRY_SIZE] {
        let mut raw = [0u8; LEVEL_ENTRY_SIZE];
        let mut buf = &mut raw[..];
        buf.put_u8(self.level_id);
        buf.put_u8(0); // reserved
        buf.put_f32_le(self.resolution_m);
        buf.put_f32_le(self.tile_extent_m);
        buf.put_u16_le(0); // reserved
        buf.put_f64_le(self.origin_e);
        buf.put_f64_le(self.origin_n);
        buf.put_u32_le(self.grid_cols);
        buf.put_u32_le(self.grid_rows);
        buf.put_u32_le(self.tile_count);
        buf.put_u64_le(self.index_offset);
        buf.put_u64_le(self.index_length);
        buf.put_u64_le(self.data_offset);
        raw
    }

    /// Total number of cells in this level's grid.
    #[must_use]
    pub fn cell_count(&self) -> u64 {
        u64::from(self.grid_cols) * u64::from(self.grid_rows)
    }

    /// Maps a ground coordinate to the grid cell containing it.
    ///
    /// Returns `None` when the coordinate falls outside the grid.
    #[must_use]
    pub fn rowcol_at(&self, e: f64, n: f64) -> Option<(u32, u32)> {
        let extent = f64::from(self.tile_extent_m);
        if extent <= 0.0 {
            return None;
        }
        let col = ((e - self.origin_e) / extent).floor();
        let row = ((self.origin_n - n) / extent).floor();
        if col < 0.0
            || row < 0.0
            || col >= f64::from(self.grid_cols)
            || row >= f64::from(self.grid_rows)
        {
            return None;
        }
        Some((row as u32, col as u32))
    }

    /// Ground extent of one cell as `(min_e, min_n, max_e, max_n)`.
    #[must_use]
    pub fn tile_bounds(&self, row: u32, col: u32) -> (f64, f64, f64, f64) {
        let extent = f64::from(self.tile_extent_m);
        let min_e = self.origin_e + f64::from(col) * extent;
        let max_n = self.origin_n - f64::from(row) * extent;
        (min_e, max_n - extent, min_e + extent, max_n)
    }

    /// Grid rectangle covered by a metric bounding box, clipped to the grid.
    ///
    /// Returns inclusive `(row_min, row_max)` and `(col_min, col_max)` ranges,
    /// or `None` when the box misses the grid entirely.
    #[must_use]
    pub fn rowcol_rect(
        &self,
        e_min: f64,
        n_min: f64,
        e_max: f64,
        n_max: f64,
    ) -> Option<((u32, u32), (u32, u32))> {
        let extent = f64::from(self.tile_extent_m);
        if extent <= 0.0 || self.grid_cols == 0 || self.grid_rows == 0 {
            return None;
        }
        let col_lo = ((e_min - self.origin_e) / extent).floor();
        let col_hi = ((e_max - self.origin_e) / extent).floor();
        let row_lo = ((self.origin_n - n_max) / extent).floor();
        let row_hi = ((self.origin_n - n_min) / extent).floor();
        if col_hi < 0.0
            || row_hi < 0.0
            || col_lo >= f64::from(self.grid_cols)
            || row_lo >= f64::from(self.grid_rows)
        {
            return None;
        }
        let clip = |v: f64, max: u32| -> u32 {
            if v < 0.0 {
                0
            } else if v >= f64::from(max) {
                max - 1
            } else {
                v as u32
            }
        };
        Some((
            (clip(row_lo, self.grid_rows), clip(row_hi, self.grid_rows)),
            (clip(col_lo, self.grid_cols), clip(col_hi, self.grid_cols)),
        ))
    }
}
