//! Per-tile CSV logs and the shared timing log.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::time::Instant;

use log::info;
use serde::Serialize;

use crate::error::Result;

/// A row of a per-tile CSV log.
pub trait LogRecord: Serialize {
    /// Column names, in the order the fields serialize.
    const HEADER: &'static [&'static str];
}

/// Writes the header, then one CSV row per record. A log without records
/// still names its columns.
pub fn write_csv<R: LogRecord>(path: &Path, records: &[R]) -> Result<()> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(File::create(path)?);
    writer.write_record(R::HEADER)?;
    for record in records {
        writer.serialize(record)?;
    }
    writer.flush()?;
    info!("Processing finished. Log saved to {}", path.display());
    Ok(())
}

/// Writes a CSV whose columns are only known at run time.
pub fn write_table(path: &Path, header: &[String], rows: &[Vec<String>]) -> Result<()> {
    let mut writer = csv::Writer::from_writer(File::create(path)?);
    writer.write_record(header)?;
    for row in rows {
        writer.write_record(row)?;
    }
    writer.flush()?;
    info!("Processing finished. Log saved to {}", path.display());
    Ok(())
}

/// Wall-clock timer for one stage run.
pub struct StageTimer {
    stage: String,
    start: Instant,
}

impl StageTimer {
    pub fn start(stage: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            start: Instant::now(),
        }
    }

    /// Appends `>>> Processing time: <stage>: <secs> seconds` to the timing log.
    pub fn finish(self, timing_log: &Path) -> Result<f64> {
        let secs = self.start.elapsed().as_secs_f64();
        let line = format!(">>> Processing time: {}: {:.2} seconds", self.stage, secs);
        info!("{line}");
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(timing_log)?;
        writeln!(file, "{line}")?;
        Ok(secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tile::TileId;
    use std::fs;
    use tempfile::TempDir;

    #[derive(Serialize)]
    struct Row {
        tile_id: TileId,
        raster_created: bool,
    }

    impl LogRecord for Row {
        const HEADER: &'static [&'static str] = &["tile_id", "raster_created"];
    }

    #[test]
    fn test_write_csv_uses_field_names() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("clipping_log_2010.csv");
        let rows = vec![
            Row {
                tile_id: "N09E104".parse().unwrap(),
                raster_created: true,
            },
            Row {
                tile_id: "S01E117".parse().unwrap(),
                raster_created: false,
            },
        ];
        write_csv(&path, &rows).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(
            text,
            "tile_id,raster_created\nN09E104,true\nS01E117,false\n"
        );
    }

    #[test]
    fn test_write_csv_without_records_keeps_header() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("MPM.csv");
        write_csv::<Row>(&path, &[]).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "tile_id,raster_created\n");
    }

    #[test]
    fn test_header_matches_serialized_fields() {
        let mut writer = csv::Writer::from_writer(Vec::new());
        writer
            .serialize(Row {
                tile_id: "N09E104".parse().unwrap(),
                raster_created: true,
            })
            .unwrap();
        let text = String::from_utf8(writer.into_inner().unwrap()).unwrap();
        assert_eq!(text.lines().next().unwrap(), Row::HEADER.join(","));
    }

    #[test]
    fn test_write_table_with_dynamic_columns() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("COA_ADD.csv");
        let header: Vec<String> = ["tile_id", "coa_7500", "coa_500", "add_raster"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let rows = vec![vec![
            "N09E104".to_string(),
            "true".to_string(),
            "false".to_string(),
            "true".to_string(),
        ]];
        write_table(&path, &header, &rows).unwrap();
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "tile_id,coa_7500,coa_500,add_raster\nN09E104,true,false,true\n"
        );
    }

    #[test]
    fn test_timer_appends() {
        let tmp = TempDir::new().unwrap();
        let log = tmp.path().join("timing_log.txt");
        StageTimer::start("ponds").finish(&log).unwrap();
        StageTimer::start("tides").finish(&log).unwrap();
        let text = fs::read_to_string(&log).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with(">>> Processing time: ponds: "));
        assert!(lines[1].ends_with(" seconds"));
    }
}
