#![doc = include_str!("../README.md")]

mod error;
mod header;
mod index;
mod level;
mod reader;
mod vrt;
mod writer;

pub use error::{SwtError, SwtResult};
pub use header::{
    DataType, HEADER_SIZE, Header, ImageFormat, LEVEL_ENTRY_SIZE, LevelEntry, MAGIC, VERSION,
};
pub use index::{INDEX_ENTRY_SIZE, IndexEntry, MAX_PAYLOAD_LEN, MAX_PAYLOAD_OFFSET, TileIndex};
pub use level::LevelConfig;
pub use reader::{CoverageScan, SwTilesReader, TileLocation};
pub use vrt::{Placement, VrtInfo, reduce_crs};
pub use writer::{SwTilesWriter, ValidationReport, WriteProgressCallback, WriteSummary};

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use tempfile::TempDir;

    use super::*;

    /// Manifest to archive and back, through the whole pipeline.
    #[test]
    fn manifest_to_archive_round_trip() {
        let dir = TempDir::new().expect("tempdir");
        let mut sources = String::new();
        let mut payloads: Vec<(u64, u64, Vec<u8>)> = Vec::new();
        for (x_off, y_off) in [(0u64, 0u64), (500, 0), (1000, 0), (0, 500)] {
            let name = format!("{y_off}_{x_off}.webp");
            let bytes = format!("tile {x_off} {y_off}").into_bytes();
            std::fs::write(dir.path().join(&name), &bytes).expect("payload fixture");
            sources.push_str(&format!(
                r#"    <SimpleSource>
      <SourceFilename relativeToVRT="1">{name}</SourceFilename>
      <SourceBand>1</SourceBand>
      <SrcRect xOff="0" yOff="0" xSize="500" ySize="500"/>
      <DstRect xOff="{x_off}" yOff="{y_off}" xSize="500" ySize="500"/>
    </SimpleSource>
"#
            ));
            payloads.push((x_off, y_off, bytes));
        }
        let manifest = format!(
            r#"<VRTDataset rasterXSize="1001" rasterYSize="1000">
  <SRS>EPSG:3006</SRS>
  <GeoTransform>265000.0, 1.0, 0.0, 7680000.0, 0.0, -1.0</GeoTransform>
  <VRTRasterBand dataType="Byte" band="1">
{sources}  </VRTRasterBand>
</VRTDataset>"#
        );
        let manifest_path = dir.path().join("mosaik.vrt");
        std::fs::write(&manifest_path, manifest).expect("manifest fixture");

        let vrt = VrtInfo::from_file(&manifest_path).expect("parse manifest");
        assert_eq!(vrt.crs_code, 3006);
        let level = LevelConfig::from_vrt(&vrt, 500, 0).expect("plan level");
        assert_eq!((level.grid_cols, level.grid_rows), (3, 2));

        let writer = SwTilesWriter::new(DataType::Raster).crs_code(vrt.crs_code);
        assert!(
            writer
                .validate(std::slice::from_ref(&level))
                .expect("validate")
                .missing
                .is_empty()
        );
        let archive: PathBuf = dir.path().join("sweden.swtiles");
        let summary = writer
            .write_to_path(std::slice::from_ref(&level), &archive)
            .expect("write archive");
        assert_eq!(summary.tiles_written, 4);
        assert_eq!(summary.tiles_skipped, 0);

        let mut reader = SwTilesReader::open(&archive).expect("open archive");
        assert_eq!(reader.header().image_format, ImageFormat::Webp);
        assert_eq!(reader.header().crs_code, 3006);
        for (x_off, y_off, bytes) in payloads {
            #[allow(clippy::cast_possible_truncation)]
            let (row, col) = ((y_off / 500) as u32, (x_off / 500) as u32);
            assert_eq!(reader.get_tile(0, row, col).expect("lookup"), Some(bytes));
        }
        assert_eq!(reader.get_tile(0, 1, 2).expect("lookup"), None);
        assert_eq!(reader.coverage(0).expect("scan").count(), 4);
    }
}
