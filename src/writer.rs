use std::fs::File;
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use countio::Counter;

use crate::error::{SwtError, SwtResult};
use crate::header::{
    DataType, HEADER_SIZE, Header, ImageFormat, LEVEL_ENTRY_SIZE, LevelEntry, VERSION,
};
use crate::index::{IndexEntry, MAX_PAYLOAD_LEN, MAX_PAYLOAD_OFFSET, TileIndex};
use crate::level::LevelConfig;

/// Progress callback receiving a value between 0.0 and 1.0.
///
/// Invoked once per processed tile; it must not re-enter the codec.
pub type WriteProgressCallback<'a> = dyn Fn(f64) + Send + Sync + 'a;

/// What a completed write did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteSummary {
    /// Tiles whose payloads were stored.
    pub tiles_written: u64,
    /// Tiles skipped because their payload could not be read.
    pub tiles_skipped: u64,
    /// Total payload bytes across all levels.
    pub payload_bytes: u64,
    /// Length of the finished archive in bytes.
    pub file_length: u64,
}

/// Result of a dry-run validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationReport {
    /// Number of payloads referenced across all levels.
    pub payloads: u64,
    /// Referenced payloads that do not exist or are unreadable.
    pub missing: Vec<PathBuf>,
}

/// Streaming writer for SWTILES archives.
///
/// Assembles header, level table, per-level dense index and payload region in
/// one pass over the output: sections are reserved up front, payloads stream
/// through sequentially, and the real header and table are written at close.
pub struct SwTilesWriter<'a> {
    data_type: DataType,
    crs_code: u32,
    image_format: Option<ImageFormat>,
    progress: Option<&'a WriteProgressCallback<'a>>,
}

impl<'a> SwTilesWriter<'a> {
    /// Creates a writer for the given payload kind.
    #[must_use]
    pub fn new(data_type: DataType) -> Self {
        Self {
            data_type,
            crs_code: 0,
            image_format: None,
            progress: None,
        }
    }

    /// Sets the CRS code written into the header.
    #[must_use]
    pub fn crs_code(mut self, crs_code: u32) -> Self {
        self.crs_code = crs_code;
        self
    }

    /// Overrides the payload encoding advertised in the header.
    ///
    /// Without this the format is inferred from the file extension of the
    /// first placement of the first (coarsest) level.
    #[must_use]
    pub fn image_format(mut self, image_format: ImageFormat) -> Self {
        self.image_format = Some(image_format);
        self
    }

    /// Sets a progress callback invoked once per processed tile.
    #[must_use]
    pub fn progress(mut self, progress: &'a WriteProgressCallback<'a>) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Checks that every referenced payload exists, without opening any
    /// output.
    ///
    /// # Errors
    ///
    /// [`SwtError::EmptyArchive`] when no level is given.
    pub fn validate(&self, levels: &[LevelConfig]) -> SwtResult<ValidationReport> {
        if levels.is_empty() {
            return Err(SwtError::EmptyArchive);
        }
        let mut report = ValidationReport {
            payloads: 0,
            missing: Vec::new(),
        };
        for level in levels {
            for path in level.tiles().values() {
                report.payloads += 1;
                if std::fs::metadata(path).is_err() {
                    log::warn!("payload {} is missing", path.display());
                    report.missing.push(path.clone());
                }
            }
        }
        Ok(report)
    }

    /// Writes an archive to a new file at `path`.
    ///
    /// On error a partial file is left in place for the caller to handle.
    ///
    /// # Errors
    ///
    /// See [`SwTilesWriter::write`].
    pub fn write_to_path(
        &self,
        levels: &[LevelConfig],
        path: &Path,
    ) -> SwtResult<WriteSummary> {
        let file = File::create(path)?;
        self.write(levels, BufWriter::new(file))
    }

    /// Writes an archive into `out`.
    ///
    /// Levels are emitted coarsest to finest; within a level payloads are
    /// emitted in `(row, col)` ascending order. Unreadable payloads leave
    /// their index slot zero and are reported through the summary.
    ///
    /// # Errors
    ///
    /// [`SwtError::EmptyArchive`] without levels, [`SwtError::TooManyLevels`]
    /// past 255, [`SwtError::InvalidLevel`] on duplicate level ids,
    /// [`SwtError::PayloadTooLarge`] when a payload exceeds the 24-bit length
    /// field, [`SwtError::IndexEntryOverflow`] when a payload region outgrows
    /// the 40-bit offset field, and [`SwtError::Io`] on output failures.
    pub fn write<W: Write + Seek>(
        &self,
        levels: &[LevelConfig],
        mut out: W,
    ) -> SwtResult<WriteSummary> {
        if levels.is_empty() {
            return Err(SwtError::EmptyArchive);
        }
        let num_levels =
            u8::try_from(levels.len()).map_err(|_| SwtError::TooManyLevels(levels.len()))?;

        // Coarsest level first; the reader looks levels up by id, so the
        // file order is purely conventional.
        let mut ordered: Vec<&LevelConfig> = levels.iter().collect();
        ordered.sort_by(|a, b| b.resolution_m.total_cmp(&a.resolution_m));

        let mut ids: Vec<u8> = ordered.iter().map(|level| level.level_id).collect();
        ids.sort_unstable();
        if let Some(duplicate) = ids.windows(2).find(|pair| pair[0] == pair[1]) {
            return Err(SwtError::InvalidLevel(duplicate[0]));
        }

        let image_format = self.image_format.unwrap_or_else(|| {
            ordered[0]
                .tiles()
                .values()
                .next()
                .map_or(ImageFormat::Png, |path| ImageFormat::from_path(path))
        });

        let level_table_offset = HEADER_SIZE as u64;
        let table_length = ordered.len() * LEVEL_ENTRY_SIZE;
        out.write_all(&vec![0u8; HEADER_SIZE + table_length])?;

        let total_tiles: u64 = ordered.iter().map(|level| level.tile_count() as u64).sum();
        let mut processed: u64 = 0;
        let mut summary = WriteSummary {
            tiles_written: 0,
            tiles_skipped: 0,
            payload_bytes: 0,
            file_length: 0,
        };

        let mut entries: Vec<LevelEntry> = Vec::with_capacity(ordered.len());
        let mut bounds: Option<(f64, f64, f64, f64)> = None;
        let mut cursor = level_table_offset + table_length as u64;

        for level in &ordered {
            let index_offset = cursor;
            let index_length = level.cell_count() * 8;
            let data_offset = index_offset + index_length;
            log::debug!(
                "level {}: index at {index_offset} ({index_length} bytes), data at {data_offset}",
                level.level_id
            );

            let mut index = TileIndex::new(level.grid_cols, level.grid_rows);
            let mut written_cells: Option<(u32, u32, u32, u32)> = None;

            out.seek(SeekFrom::Start(data_offset))?;
            let mut sink = Counter::new(&mut out);
            for (&(row, col), path) in level.tiles() {
                processed += 1;
                let payload = match std::fs::read(path) {
                    Ok(payload) => payload,
                    Err(err) => {
                        log::warn!(
                            "payload {} unavailable ({err}), cell ({row}, {col}) left empty",
                            path.display()
                        );
                        summary.tiles_skipped += 1;
                        self.report_progress(processed, total_tiles);
                        continue;
                    }
                };
                let length = payload.len() as u64;
                if length > MAX_PAYLOAD_LEN {
                    return Err(SwtError::PayloadTooLarge {
                        path: path.clone(),
                        length,
                    });
                }
                let relative_offset = sink.writer_bytes() as u64;
                if relative_offset > MAX_PAYLOAD_OFFSET {
                    return Err(SwtError::IndexEntryOverflow);
                }
                sink.write_all(&payload)?;
                #[allow(clippy::cast_possible_truncation)]
                index.set(
                    row,
                    col,
                    IndexEntry {
                        offset: relative_offset,
                        length: length as u32,
                    },
                );
                written_cells = Some(match written_cells {
                    None => (row, row, col, col),
                    Some((row_min, row_max, col_min, col_max)) => (
                        row_min.min(row),
                        row_max.max(row),
                        col_min.min(col),
                        col_max.max(col),
                    ),
                });
                summary.tiles_written += 1;
                self.report_progress(processed, total_tiles);
            }
            let payload_length = sink.writer_bytes() as u64;

            out.seek(SeekFrom::Start(index_offset))?;
            out.write_all(index.as_bytes())?;

            entries.push(LevelEntry {
                level_id: level.level_id,
                resolution_m: level.resolution_m,
                tile_extent_m: level.tile_extent_m,
                origin_e: level.origin_e,
                origin_n: level.origin_n,
                grid_cols: level.grid_cols,
                grid_rows: level.grid_rows,
                tile_count: index.present_count(),
                index_offset,
                index_length,
                data_offset,
            });

            if let Some((row_min, row_max, col_min, col_max)) = written_cells {
                let extent = f64::from(level.tile_extent_m);
                let level_bounds = (
                    level.origin_e + f64::from(col_min) * extent,
                    level.origin_n - f64::from(row_max + 1) * extent,
                    level.origin_e + f64::from(col_max + 1) * extent,
                    level.origin_n - f64::from(row_min) * extent,
                );
                bounds = Some(match bounds {
                    None => level_bounds,
                    Some(whole) => (
                        whole.0.min(level_bounds.0),
                        whole.1.min(level_bounds.1),
                        whole.2.max(level_bounds.2),
                        whole.3.max(level_bounds.3),
                    ),
                });
            }

            summary.payload_bytes += payload_length;
            // The next level starts where this payload region actually
            // ended, overriding any pre-planned offset.
            cursor = data_offset + payload_length;
        }

        let (bounds_min_e, bounds_min_n, bounds_max_e, bounds_max_n) =
            bounds.unwrap_or((0.0, 0.0, 0.0, 0.0));
        let header = Header {
            version: VERSION,
            data_type: self.data_type,
            image_format,
            crs_code: self.crs_code,
            bounds_min_e,
            bounds_min_n,
            bounds_max_e,
            bounds_max_n,
            tile_px: ordered[0].tile_px,
            num_levels,
            level_table_offset,
        };

        out.seek(SeekFrom::Start(0))?;
        out.write_all(&header.to_bytes())?;
        out.seek(SeekFrom::Start(level_table_offset))?;
        for entry in &entries {
            out.write_all(&entry.to_bytes())?;
        }
        out.flush()?;

        if summary.tiles_skipped > 0 {
            log::warn!(
                "{} of {} payloads were unavailable, their cells are empty",
                summary.tiles_skipped,
                total_tiles
            );
        }
        summary.file_length = cursor;
        Ok(summary)
    }

    fn report_progress(&self, processed: u64, total: u64) {
        if let Some(progress) = &self.progress {
            if total > 0 {
                #[allow(clippy::cast_precision_loss)]
                progress(processed as f64 / total as f64);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tempfile::TempDir;

    use super::*;

    fn tile_file(dir: &TempDir, name: &str, bytes: &[u8]) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, bytes).expect("write payload fixture");
        path
    }

    fn single_tile_level(dir: &TempDir, payload: &[u8]) -> LevelConfig {
        let path = tile_file(dir, "0_0.png", payload);
        let mut level = LevelConfig::new(0, 500, 1.0, 0.0, 0.0, 1, 1).expect("valid level");
        level.insert_tile(0, 0, path).expect("cell in grid");
        level
    }

    #[test]
    fn minimal_archive_layout_is_byte_exact() {
        let dir = TempDir::new().expect("tempdir");
        let level = single_tile_level(&dir, b"\xDE\xAD\xBE\xEF");
        let mut out = Cursor::new(Vec::new());
        let summary = SwTilesWriter::new(DataType::Raster)
            .crs_code(3006)
            .write(&[level], &mut out)
            .expect("write should succeed");

        let bytes = out.into_inner();
        assert_eq!(bytes.len(), 332);
        assert_eq!(summary.file_length, 332);
        assert_eq!(summary.tiles_written, 1);
        assert_eq!(summary.payload_bytes, 4);

        assert_eq!(&bytes[..8], b"SWTILES\0");
        assert_eq!(bytes[8..10], [2, 0]); // version
        assert_eq!(u64::from_le_bytes(bytes[52..60].try_into().expect("u64")), 256);
        // one level entry at 256, index entry at 320: offset 0, length 4
        assert_eq!(bytes[256], 0); // level id
        assert_eq!(&bytes[320..328], &[0, 0, 0, 0, 0, 4, 0, 0]);
        assert_eq!(&bytes[328..332], b"\xDE\xAD\xBE\xEF");
    }

    #[test]
    fn sparse_index_only_populates_written_cells() {
        let dir = TempDir::new().expect("tempdir");
        let mut level = LevelConfig::new(0, 500, 1.0, 0.0, 0.0, 3, 3).expect("valid level");
        level
            .insert_tile(0, 0, tile_file(&dir, "a.png", b"aaaa"))
            .expect("cell in grid");
        level
            .insert_tile(2, 2, tile_file(&dir, "b.png", b"bbbbbb"))
            .expect("cell in grid");

        let mut out = Cursor::new(Vec::new());
        SwTilesWriter::new(DataType::Raster)
            .write(&[level], &mut out)
            .expect("write should succeed");
        let bytes = out.into_inner();

        // 9-cell index at 320; entries 1..8 of the index are zero except the last
        let index = &bytes[320..320 + 72];
        assert_eq!(&index[..8], &[0, 0, 0, 0, 0, 4, 0, 0]);
        assert!(index[8..64].iter().all(|&b| b == 0));
        // cell (2,2): offset 4, length 6
        assert_eq!(&index[64..72], &[4, 0, 0, 0, 0, 6, 0, 0]);
    }

    #[test]
    fn levels_are_ordered_coarsest_first_and_abut() {
        let dir = TempDir::new().expect("tempdir");
        let mut fine = LevelConfig::new(1, 500, 1.0, 0.0, 0.0, 2, 1).expect("valid level");
        fine.insert_tile(0, 0, tile_file(&dir, "f.png", b"fine-tile"))
            .expect("cell in grid");
        let mut coarse = LevelConfig::new(7, 500, 4.0, 0.0, 0.0, 1, 1).expect("valid level");
        coarse
            .insert_tile(0, 0, tile_file(&dir, "c.png", b"coarse"))
            .expect("cell in grid");

        let mut out = Cursor::new(Vec::new());
        let summary = SwTilesWriter::new(DataType::Raster)
            .write(&[fine, coarse], &mut out)
            .expect("write should succeed");
        let bytes = out.into_inner();

        let entry = |i: usize| {
            let start = 256 + i * LEVEL_ENTRY_SIZE;
            let mut raw = [0u8; LEVEL_ENTRY_SIZE];
            raw.copy_from_slice(&bytes[start..start + LEVEL_ENTRY_SIZE]);
            LevelEntry::from_bytes(&raw)
        };
        let first = entry(0);
        let second = entry(1);

        assert_eq!(first.level_id, 7); // coarsest first
        assert_eq!(second.level_id, 1);
        // sections are planned gap-free: table, then index/data pairs
        assert_eq!(first.index_offset, 256 + 2 * LEVEL_ENTRY_SIZE as u64);
        assert_eq!(first.data_offset, first.index_offset + first.index_length);
        assert_eq!(second.index_offset, first.data_offset + 6);
        assert_eq!(second.data_offset, second.index_offset + second.index_length);
        assert_eq!(summary.file_length, second.data_offset + 9);
        assert_eq!(bytes.len() as u64, summary.file_length);
    }

    #[test]
    fn unavailable_payloads_are_skipped_and_counted() {
        let dir = TempDir::new().expect("tempdir");
        let mut level = LevelConfig::new(0, 500, 1.0, 0.0, 0.0, 2, 2).expect("valid level");
        level
            .insert_tile(0, 0, tile_file(&dir, "ok.png", b"ok"))
            .expect("cell in grid");
        level
            .insert_tile(0, 1, dir.path().join("gone.png"))
            .expect("cell in grid");

        let mut out = Cursor::new(Vec::new());
        let summary = SwTilesWriter::new(DataType::Raster)
            .write(&[level], &mut out)
            .expect("write should succeed");
        assert_eq!(summary.tiles_written, 1);
        assert_eq!(summary.tiles_skipped, 1);

        let bytes = out.into_inner();
        // slot (0,1) stays zero
        assert!(bytes[328..336].iter().all(|&b| b == 0));
    }

    #[test]
    fn payload_at_the_24_bit_limit_is_accepted() {
        let dir = TempDir::new().expect("tempdir");
        let level = single_tile_level(&dir, &vec![0x5A; MAX_PAYLOAD_LEN as usize]);
        let mut out = Cursor::new(Vec::new());
        let summary = SwTilesWriter::new(DataType::Raster)
            .write(&[level], &mut out)
            .expect("write should succeed");
        assert_eq!(summary.payload_bytes, MAX_PAYLOAD_LEN);
    }

    #[test]
    fn payload_past_the_24_bit_limit_is_rejected() {
        let dir = TempDir::new().expect("tempdir");
        let level = single_tile_level(&dir, &vec![0x5A; MAX_PAYLOAD_LEN as usize + 1]);
        let mut out = Cursor::new(Vec::new());
        let result = SwTilesWriter::new(DataType::Raster).write(&[level], &mut out);
        assert!(matches!(result, Err(SwtError::PayloadTooLarge { .. })));
    }

    #[test]
    fn empty_level_writes_a_zeroed_index() {
        let level = LevelConfig::new(0, 500, 1.0, 0.0, 0.0, 3, 3).expect("valid level");
        let mut out = Cursor::new(Vec::new());
        let summary = SwTilesWriter::new(DataType::Terrain)
            .write(&[level], &mut out)
            .expect("write should succeed");
        let bytes = out.into_inner();
        assert_eq!(bytes.len(), 256 + 64 + 72);
        assert!(bytes[320..].iter().all(|&b| b == 0));
        assert_eq!(summary.tiles_written, 0);
        // empty archive zeroes the bounds
        assert!(bytes[16..48].iter().all(|&b| b == 0));
    }

    #[test]
    fn no_levels_is_an_error() {
        let mut out = Cursor::new(Vec::new());
        assert!(matches!(
            SwTilesWriter::new(DataType::Raster).write(&[], &mut out),
            Err(SwtError::EmptyArchive)
        ));
    }

    #[test]
    fn duplicate_level_ids_are_rejected() {
        let a = LevelConfig::new(3, 500, 1.0, 0.0, 0.0, 1, 1).expect("valid level");
        let b = LevelConfig::new(3, 500, 2.0, 0.0, 0.0, 1, 1).expect("valid level");
        let mut out = Cursor::new(Vec::new());
        assert!(matches!(
            SwTilesWriter::new(DataType::Raster).write(&[a, b], &mut out),
            Err(SwtError::InvalidLevel(3))
        ));
    }

    #[test]
    fn image_format_is_sniffed_from_the_first_placement() {
        let dir = TempDir::new().expect("tempdir");
        let path = tile_file(&dir, "t.webp", b"webpdata");
        let mut level = LevelConfig::new(0, 500, 1.0, 0.0, 0.0, 1, 1).expect("valid level");
        level.insert_tile(0, 0, path).expect("cell in grid");
        let mut out = Cursor::new(Vec::new());
        SwTilesWriter::new(DataType::Raster)
            .write(&[level], &mut out)
            .expect("write should succeed");
        assert_eq!(out.into_inner()[11], ImageFormat::Webp as u8);
    }

    #[test]
    fn progress_is_reported_per_tile() {
        let dir = TempDir::new().expect("tempdir");
        let mut level = LevelConfig::new(0, 500, 1.0, 0.0, 0.0, 2, 2).expect("valid level");
        for (row, col) in [(0, 0), (0, 1), (1, 1)] {
            level
                .insert_tile(row, col, tile_file(&dir, &format!("{row}{col}.png"), b"x"))
                .expect("cell in grid");
        }
        let calls = AtomicUsize::new(0);
        let callback = |_ratio: f64| {
            calls.fetch_add(1, Ordering::SeqCst);
        };
        let mut out = Cursor::new(Vec::new());
        SwTilesWriter::new(DataType::Raster)
            .progress(&callback)
            .write(&[level], &mut out)
            .expect("write should succeed");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn validate_reports_missing_payloads_without_output() {
        let dir = TempDir::new().expect("tempdir");
        let mut level = LevelConfig::new(0, 500, 1.0, 0.0, 0.0, 2, 2).expect("valid level");
        level
            .insert_tile(0, 0, tile_file(&dir, "here.png", b"x"))
            .expect("cell in grid");
        level
            .insert_tile(1, 1, dir.path().join("missing.png"))
            .expect("cell in grid");

        let report = SwTilesWriter::new(DataType::Raster)
            .validate(&[level])
            .expect("validation should run");
        assert_eq!(report.payloads, 2);
        assert_eq!(report.missing, vec![dir.path().join("missing.png")]);
    }

    #[test]
    fn bounds_cover_only_written_cells() {
        let dir = TempDir::new().expect("tempdir");
        let mut level = LevelConfig::new(0, 500, 1.0, 1000.0, 9000.0, 4, 4).expect("valid level");
        level
            .insert_tile(1, 1, tile_file(&dir, "a.png", b"a"))
            .expect("cell in grid");
        level
            .insert_tile(2, 3, tile_file(&dir, "b.png", b"b"))
            .expect("cell in grid");
        // a cell whose payload is missing must not stretch the bounds
        level
            .insert_tile(3, 0, dir.path().join("void.png"))
            .expect("cell in grid");

        let mut out = Cursor::new(Vec::new());
        SwTilesWriter::new(DataType::Raster)
            .write(&[level], &mut out)
            .expect("write should succeed");
        let bytes = out.into_inner();
        let f64_at = |at: usize| f64::from_le_bytes(bytes[at..at + 8].try_into().expect("f64"));
        assert_eq!(f64_at(16), 1000.0 + 500.0); // min_e: col 1
        assert_eq!(f64_at(24), 9000.0 - 3.0 * 500.0); // min_n: row 2 bottom
        assert_eq!(f64_at(32), 1000.0 + 4.0 * 500.0); // max_e: col 3 right
        assert_eq!(f64_at(40), 9000.0 - 500.0); // max_n: row 1 top
    }
}
