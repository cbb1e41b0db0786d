use std::path::PathBuf;

use thiserror::Error;

/// Convenience alias for operations that can fail with a [`SwtError`].
pub type SwtResult<T> = Result<T, SwtError>;

/// Errors raised while parsing manifests, writing archives, or reading them back.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SwtError {
    /// The first eight bytes of the file are not the SWTILES magic.
    #[error("invalid magic number")]
    InvalidMagicNumber,
    /// The magic matched but the archive declares an unsupported format version.
    #[error("unsupported SWTILES version {0}")]
    UnsupportedVersion(u16),
    /// The header or level table is structurally unusable.
    #[error("invalid header")]
    InvalidHeader,
    /// Unrecognized data type byte in the header.
    #[error("invalid data type value {0}")]
    InvalidDataType(u8),
    /// Unrecognized image format byte in the header.
    #[error("invalid image format value {0}")]
    InvalidImageFormat(u8),
    /// The requested level id is not present in the level table.
    #[error("unknown level {0}")]
    InvalidLevel(u8),
    /// The requested cell lies outside the level's grid.
    #[error("cell ({row}, {col}) outside grid of {grid_rows} x {grid_cols}")]
    OutOfBounds {
        /// Requested row.
        row: u32,
        /// Requested column.
        col: u32,
        /// Number of rows in the grid.
        grid_rows: u32,
        /// Number of columns in the grid.
        grid_cols: u32,
    },
    /// The mosaic manifest is missing required structure or carries unusable values.
    #[error("malformed manifest: {0}")]
    ManifestMalformed(String),
    /// The configured tile edge length cannot form a grid.
    #[error("invalid tile size {0}")]
    InvalidTileSize(u16),
    /// The configured ground resolution is not a positive finite number.
    #[error("invalid resolution {0}")]
    InvalidResolution(f32),
    /// More levels than the header's `num_levels` byte can express.
    #[error("too many levels: {0}")]
    TooManyLevels(usize),
    /// A tile payload exceeds the 24-bit length field.
    #[error("payload {} is {length} bytes, exceeding the 24-bit limit", path.display())]
    PayloadTooLarge {
        /// Path of the offending payload.
        path: PathBuf,
        /// Observed payload length in bytes.
        length: u64,
    },
    /// A referenced tile payload could not be read.
    #[error("payload {} unavailable", path.display())]
    PayloadUnavailable {
        /// Path of the missing payload.
        path: PathBuf,
        /// Underlying I/O failure.
        source: std::io::Error,
    },
    /// A level's payload region outgrew the 40-bit offset field.
    #[error("index entry overflow")]
    IndexEntryOverflow,
    /// The writer was invoked without any level to write.
    #[error("archive must contain at least one level")]
    EmptyArchive,
    /// An index read would pass the end of the file.
    #[error("index of level {level_id} is truncated")]
    TruncatedIndex {
        /// Level whose index is short.
        level_id: u8,
    },
    /// A payload read would pass the end of the file.
    #[error("payload of tile ({row}, {col}) in level {level_id} is truncated")]
    TruncatedPayload {
        /// Level holding the tile.
        level_id: u8,
        /// Row of the truncated tile.
        row: u32,
        /// Column of the truncated tile.
        col: u32,
    },
    /// Untagged I/O failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
