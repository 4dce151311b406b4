use std::{
    fs::File,
    io::{self, BufReader, Read},
    path::{Path, PathBuf},
};

use flate2::read::GzDecoder;
use log::{info, warn};

use crate::error::Result;
use crate::tablespec::TableSpec;
use crate::writer::{BlockSink, CsvBlock, ROW_DELIMITER, ROW_QUOTE};

/// What the engine needs to know about the export beyond the table layout.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExportParameters {
    pub table_prefix: String,
    pub add_minzoom: bool,
    pub extended: bool,
}

/// A row the engine could not produce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineError {
    pub table: String,
    pub message: String,
}

#[derive(Debug, Default)]
pub struct EngineReport {
    pub rows: usize,
    pub errors: Vec<EngineError>,
}

/// Produces rows for every column of every table spec, in declared order,
/// and hands them to the sink block by block. Ends the stream with `None`.
pub trait ProcessingEngine {
    fn process(
        &mut self,
        tables: &[TableSpec],
        params: &ExportParameters,
        sink: &mut dyn BlockSink,
    ) -> Result<EngineReport>;

    /// Row count the engine expects to emit, if it can tell up front.
    fn expected_rows(&self, _tables: &[TableSpec]) -> Option<usize> {
        None
    }
}

/// Replays `{prefix}{table}.csv.gz` files into blocks of at most `block_rows` rows.
pub struct BatchFileReplay {
    prefix: String,
    block_rows: usize,
}

impl BatchFileReplay {
    pub fn new(prefix: &str, block_rows: usize) -> Self {
        BatchFileReplay { prefix: prefix.to_string(), block_rows: block_rows.max(1) }
    }

    fn path(&self, table: &str) -> PathBuf {
        PathBuf::from(format!("{}{}.csv.gz", self.prefix, table))
    }
}

fn read_table(path: &Path) -> io::Result<Vec<u8>> {
    let mut data = Vec::new();
    GzDecoder::new(BufReader::new(File::open(path)?)).read_to_end(&mut data)?;
    Ok(data)
}

/// Splits encoded rows at newlines outside quoted fields. Each item is the row
/// including its newline, and its field count.
fn split_rows(data: &[u8]) -> Vec<(&[u8], usize)> {
    let mut rows = Vec::new();
    let mut start = 0;
    let mut quoted = false;
    let mut fields = 1;
    for (i, b) in data.iter().enumerate() {
        match *b {
            ROW_QUOTE => quoted = !quoted,
            ROW_DELIMITER if !quoted => fields += 1,
            b'\n' if !quoted => {
                rows.push((&data[start..=i], fields));
                start = i + 1;
                fields = 1;
            }
            _ => {}
        }
    }
    if start < data.len() {
        rows.push((&data[start..], fields));
    }
    rows
}

impl ProcessingEngine for BatchFileReplay {
    fn process(
        &mut self,
        tables: &[TableSpec],
        params: &ExportParameters,
        sink: &mut dyn BlockSink,
    ) -> Result<EngineReport> {
        let mut report = EngineReport::default();
        let mut block = CsvBlock::new();
        for spec in tables {
            let path = self.path(&spec.table_name);
            let data = match read_table(&path) {
                Ok(d) => d,
                Err(e) => {
                    warn!("skipping {}: {}", path.display(), e);
                    report.errors.push(EngineError {
                        table: spec.table_name.clone(),
                        message: format!("{}: {}", path.display(), e),
                    });
                    continue;
                }
            };
            for (n, (row, fields)) in split_rows(&data).into_iter().enumerate() {
                if fields != spec.columns.len() {
                    report.errors.push(EngineError {
                        table: spec.table_name.clone(),
                        message: format!("row {} has {} fields, expected {}", n, fields, spec.columns.len()),
                    });
                    continue;
                }
                let rows = block.get(&spec.table_name);
                rows.add_encoded(row, 1);
                if !row.ends_with(b"\n") {
                    rows.add_encoded(b"\n", 0);
                }
                report.rows += 1;
                if block.row_count() >= self.block_rows {
                    sink.accept(Some(std::mem::take(&mut block)))?;
                }
            }
        }
        if !block.is_empty() {
            sink.accept(Some(block))?;
        }
        sink.accept(None)?;
        info!(
            "replayed {} rows into {}* with {} errors",
            report.rows,
            params.table_prefix,
            report.errors.len()
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::style::Style;
    use crate::tablespec::derive_tables;
    use crate::writer::{BlockCounter, BlockWriter, CsvRows, StoredBlock};

    fn specs() -> Vec<TableSpec> {
        derive_tables(&Style::with_keys([("name", true, true)]), false, false).unwrap()
    }

    fn point_row(id: &str, name: Option<&str>) -> Vec<Option<String>> {
        vec![Some(id.into()), Some("0".into()), Some("0".into()), name.map(Into::into), Some("POINT(0 0)".into())]
    }

    fn encoded(rows: &[Vec<Option<String>>]) -> CsvRows {
        let mut out = CsvRows::default();
        for r in rows {
            let fields: Vec<Option<&str>> = r.iter().map(|f| f.as_deref()).collect();
            out.add(&fields);
        }
        out
    }

    #[test]
    fn newlines_inside_quotes_stay_in_row() {
        let rows = encoded(&[point_row("1", Some("two\nlines")), point_row("2", None)]);
        let split = split_rows(rows.data());
        assert_eq!(split.len(), 2);
        assert_eq!(split[0].1, 5);
        assert!(split[0].0.windows(4).any(|w| w == b"two\n"));
    }

    #[test]
    fn replays_written_files() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = format!("{}/b_", dir.path().display());
        let specs = specs();

        let mut first = CsvBlock::new();
        *first.get("point") = encoded(&[point_row("1", Some("a")), point_row("2", None), point_row("3", Some("c"))]);
        let mut writer = BlockWriter::to_files(&prefix);
        writer.accept(Some(first.clone())).unwrap();
        writer.accept(None).unwrap();

        let mut replay = BatchFileReplay::new(&prefix, 2);
        let mut memory = BlockWriter::in_memory(3);
        let report = replay.process(&specs, &ExportParameters::default(), &mut memory).unwrap();
        assert_eq!(report.rows, 3);
        // line and polygon were never written
        assert_eq!(report.errors.len(), 2);
        assert!(memory.is_closed());

        let blocks = memory.into_blocks();
        assert_eq!(blocks.len(), 2);
        let mut replayed = Vec::new();
        for b in &blocks {
            match b {
                StoredBlock::Rows(b) => replayed.extend_from_slice(b.rows()["point"].data()),
                StoredBlock::Volume(_) => panic!("expected rows"),
            }
        }
        assert_eq!(replayed, first.rows()["point"].data());
    }

    #[test]
    fn short_rows_are_errors() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = format!("{}/s_", dir.path().display());
        let mut block = CsvBlock::new();
        block.get("point").add(&[Some("1"), Some("2")]);
        block.get("point").add(&[Some("1"), Some("0"), Some("0"), None, Some("POINT(0 0)")]);
        let mut writer = BlockWriter::to_files(&prefix);
        writer.accept(Some(block)).unwrap();
        writer.accept(None).unwrap();

        let mut counter = BlockCounter::default();
        let report = BatchFileReplay::new(&prefix, 100)
            .process(&specs()[..1], &ExportParameters::default(), &mut counter)
            .unwrap();
        assert_eq!(report.rows, 1);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(counter.counts()["point"].0, 1);
    }
}
