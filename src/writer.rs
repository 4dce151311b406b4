use std::{
    collections::BTreeMap,
    fs::File,
    io::{BufWriter, Write},
    path::PathBuf,
};

use flate2::{write::GzEncoder, Compression};
use log::info;
use postgres::Client;

use crate::error::{ExportError, Result};
use crate::style::check_prefix;

pub const ROW_QUOTE: u8 = 0x01;
pub const ROW_DELIMITER: u8 = 0x02;

/// Anticipated row counts above this keep only per-table volumes in memory.
pub const SIZE_GUARD_ROWS: usize = 100;

/// Encoded rows for one table, in arrival order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CsvRows {
    data: Vec<u8>,
    count: usize,
}

impl CsvRows {
    /// Encodes one row. `None` fields are written unquoted, which the store reads as null.
    pub fn add(&mut self, fields: &[Option<&str>]) {
        for (i, f) in fields.iter().enumerate() {
            if i > 0 {
                self.data.push(ROW_DELIMITER);
            }
            if let Some(v) = f {
                self.data.push(ROW_QUOTE);
                for b in v.bytes() {
                    if b == ROW_QUOTE {
                        self.data.push(ROW_QUOTE);
                    }
                    self.data.push(b);
                }
                self.data.push(ROW_QUOTE);
            }
        }
        self.data.push(b'\n');
        self.count += 1;
    }

    /// Appends rows that are already encoded.
    pub fn add_encoded(&mut self, data: &[u8], count: usize) {
        self.data.extend_from_slice(data);
        self.count += count;
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

/// One batch of rows keyed by table name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CsvBlock {
    rows: BTreeMap<String, CsvRows>,
}

impl CsvBlock {
    pub fn new() -> Self {
        CsvBlock::default()
    }

    pub fn get(&mut self, table: &str) -> &mut CsvRows {
        self.rows.entry(table.to_string()).or_default()
    }

    pub fn rows(&self) -> &BTreeMap<String, CsvRows> {
        &self.rows
    }

    pub fn row_count(&self) -> usize {
        self.rows.values().map(CsvRows::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.row_count() == 0
    }
}

/// Receives row batches from the processing engine. `None` or an empty block
/// ends the stream. Not meant for concurrent use: one engine thread feeds one sink.
pub trait BlockSink {
    fn accept(&mut self, block: Option<CsvBlock>) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableVolume {
    pub table: String,
    pub rows: usize,
    pub bytes: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoredBlock {
    Rows(CsvBlock),
    Volume(Vec<TableVolume>),
}

struct TableFile {
    path: PathBuf,
    out: GzEncoder<BufWriter<File>>,
    rows: usize,
    bytes: usize,
}

enum Mode {
    Files { prefix: String, outs: BTreeMap<String, TableFile> },
    Memory { too_big: bool, blocks: Vec<StoredBlock> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Collecting,
    Closed,
}

/// Writes each table's rows to `{prefix}{table}.csv.gz`, or keeps blocks in
/// memory when no prefix is given.
pub struct BlockWriter {
    mode: Mode,
    state: State,
}

impl BlockWriter {
    pub fn to_files(prefix: &str) -> Self {
        BlockWriter {
            mode: Mode::Files { prefix: prefix.to_string(), outs: BTreeMap::new() },
            state: State::Collecting,
        }
    }

    pub fn in_memory(expected_rows: usize) -> Self {
        BlockWriter {
            mode: Mode::Memory { too_big: expected_rows > SIZE_GUARD_ROWS, blocks: Vec::new() },
            state: State::Collecting,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state == State::Closed
    }

    /// Blocks retained in memory mode. Empty in file mode.
    pub fn blocks(&self) -> &[StoredBlock] {
        match &self.mode {
            Mode::Memory { blocks, .. } => blocks,
            Mode::Files { .. } => &[],
        }
    }

    pub fn into_blocks(self) -> Vec<StoredBlock> {
        match self.mode {
            Mode::Memory { blocks, .. } => blocks,
            Mode::Files { .. } => Vec::new(),
        }
    }

    fn store(&mut self, block: CsvBlock) -> Result<()> {
        match &mut self.mode {
            Mode::Memory { too_big: true, blocks } => {
                blocks.push(StoredBlock::Volume(
                    block
                        .rows()
                        .iter()
                        .map(|(k, v)| TableVolume { table: k.clone(), rows: v.len(), bytes: v.data().len() })
                        .collect(),
                ));
            }
            Mode::Memory { too_big: false, blocks } => blocks.push(StoredBlock::Rows(block)),
            Mode::Files { prefix, outs } => {
                for (table, rows) in block.rows() {
                    if rows.is_empty() {
                        continue;
                    }
                    if !outs.contains_key(table) {
                        let path = PathBuf::from(format!("{}{}.csv.gz", prefix, table));
                        let file = File::create(&path).map_err(|source| ExportError::Output { path: path.clone(), source })?;
                        let out = GzEncoder::new(BufWriter::new(file), Compression::new(5));
                        outs.insert(table.clone(), TableFile { path, out, rows: 0, bytes: 0 });
                    }
                    if let Some(tf) = outs.get_mut(table) {
                        tf.out
                            .write_all(rows.data())
                            .map_err(|source| ExportError::Output { path: tf.path.clone(), source })?;
                        tf.rows += rows.len();
                        tf.bytes += rows.data().len();
                    }
                }
            }
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.state = State::Closed;
        if let Mode::Files { outs, .. } = &mut self.mode {
            let mut written = Vec::new();
            for (table, tf) in std::mem::take(outs) {
                let TableFile { path, out, rows, bytes } = tf;
                let mut inner = out.finish().map_err(|source| ExportError::Output { path: path.clone(), source })?;
                inner.flush().map_err(|source| ExportError::Output { path: path.clone(), source })?;
                written.push(format!("{}: {} rows, {} bytes -> {}", table, rows, bytes, path.display()));
            }
            info!("written: [{}]", written.join("; "));
        }
        Ok(())
    }
}

impl BlockSink for BlockWriter {
    fn accept(&mut self, block: Option<CsvBlock>) -> Result<()> {
        match block {
            Some(block) if !block.is_empty() => {
                if self.state == State::Closed {
                    return Err(ExportError::Config("block received after end of stream".to_string()));
                }
                self.store(block)
            }
            _ if self.state == State::Closed => Ok(()),
            _ => self.close(),
        }
    }
}

/// Tallies rows and bytes per table without storing anything.
#[derive(Debug, Default)]
pub struct BlockCounter {
    counts: BTreeMap<String, (usize, usize)>,
}

impl BlockCounter {
    pub fn counts(&self) -> &BTreeMap<String, (usize, usize)> {
        &self.counts
    }
}

impl BlockSink for BlockCounter {
    fn accept(&mut self, block: Option<CsvBlock>) -> Result<()> {
        match block {
            Some(block) if !block.is_empty() => {
                for (table, rows) in block.rows() {
                    let c = self.counts.entry(table.clone()).or_default();
                    c.0 += rows.len();
                    c.1 += rows.data().len();
                }
            }
            _ => {
                info!("block count finished:");
                for (table, (rows, bytes)) in &self.counts {
                    info!("{}: {} {}", table, rows, bytes);
                }
            }
        }
        Ok(())
    }
}

/// Streams each block straight into `{prefix}{table}` with `COPY`, inside
/// one transaction committed at end of stream.
pub struct PostgisWriter<'a> {
    client: &'a mut Client,
    prefix: String,
    in_transaction: bool,
    blocks: usize,
}

impl<'a> PostgisWriter<'a> {
    pub fn new(client: &'a mut Client, prefix: &str) -> Result<Self> {
        check_prefix(prefix)?;
        Ok(PostgisWriter { client, prefix: prefix.to_string(), in_transaction: false, blocks: 0 })
    }

    fn copy(&mut self, table: &str, rows: &CsvRows) -> Result<()> {
        if !self.in_transaction {
            self.client.batch_execute("BEGIN")?;
            self.in_transaction = true;
        }
        let sql = format!("COPY {}{} FROM STDIN csv QUOTE e'\\x01' DELIMITER e'\\x02'", self.prefix, table);
        let mut writer = self.client.copy_in(sql.as_str())?;
        writer.write_all(rows.data()).map_err(|source| ExportError::Output {
            path: PathBuf::from(format!("{}{}", self.prefix, table)),
            source,
        })?;
        writer.finish()?;
        Ok(())
    }
}

impl BlockSink for PostgisWriter<'_> {
    fn accept(&mut self, block: Option<CsvBlock>) -> Result<()> {
        match block {
            Some(block) if !block.is_empty() => {
                for (table, rows) in block.rows() {
                    if !rows.is_empty() {
                        self.copy(table, rows)?;
                    }
                }
                self.blocks += 1;
            }
            _ => {
                if self.in_transaction {
                    self.client.batch_execute("COMMIT")?;
                    self.in_transaction = false;
                }
                info!("postgis writer done after {} blocks", self.blocks);
            }
        }
        Ok(())
    }
}
