//! The export pipeline: derive tables, create them, populate them through a
//! processing engine, index them and build the low zoom tiers.

use std::time::Duration;

use log::info;
use postgres::Client;
use strum::IntoEnumIterator;
use strum_macros::Display;

use crate::ddl;
use crate::engine::{EngineReport, ExportParameters, ProcessingEngine};
use crate::error::{ExportError, Result};
use crate::executor::Executor;
use crate::orchestrator::{IndexOptions, Orchestrator};
use crate::pyramid::{create_low_zoom_views, derive_standard_objects, materialize_low_zoom_tables, ZoomTier};
use crate::sql::{Catalog, ROADS_TABLE};
use crate::style::{check_prefix, Style};
use crate::tablespec::{derive_tables, CanonicalTable, Storage, TableSpec};
use crate::writer::{BlockSink, BlockWriter, PostgisWriter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Display)]
pub enum Phase {
    Planned,
    TablesCreated,
    Populated,
    Indexed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LowZoomConfig {
    pub prefix: String,
    pub minzoom: i64,
    pub as_tables: bool,
    pub simplify: Option<f64>,
    pub with_indices: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExportConfig {
    pub table_prefix: String,
    pub connection: Option<String>,
    pub output_prefix: Option<String>,
    pub add_minzoom: bool,
    pub extended: bool,
    pub write_indices: bool,
    pub extra_indices: bool,
    pub planet_views: bool,
    pub vacuum: bool,
    pub lowzoom: Vec<LowZoomConfig>,
}

/// Appends `_` to a non-empty prefix that lacks it.
pub fn normalize_prefix(prefix: &str) -> String {
    if prefix.is_empty() || prefix.ends_with('_') {
        prefix.to_string()
    } else {
        format!("{}_", prefix)
    }
}

impl ExportConfig {
    pub fn is_direct(&self) -> bool {
        self.connection.is_some()
    }

    /// Normalizes prefixes and rejects unusable combinations. Runs before any DDL.
    pub fn validate(mut self) -> Result<Self> {
        self.table_prefix = normalize_prefix(&self.table_prefix);
        check_prefix(&self.table_prefix)?;
        if let Some(c) = &self.connection {
            if c.trim().is_empty() {
                return Err(ExportError::Config("direct export needs a connection string".to_string()));
            }
            if self.table_prefix.is_empty() {
                return Err(ExportError::Config("direct export needs a table prefix".to_string()));
            }
        }
        if !self.lowzoom.is_empty() {
            if !self.add_minzoom {
                return Err(ExportError::Config("low zoom tiers need the minzoom column".to_string()));
            }
            if !self.is_direct() {
                return Err(ExportError::Config("low zoom tiers need a connection".to_string()));
            }
        }
        for lz in &mut self.lowzoom {
            lz.prefix = normalize_prefix(&lz.prefix);
            check_prefix(&lz.prefix)?;
            if lz.prefix.is_empty() || lz.prefix == self.table_prefix {
                return Err(ExportError::Config(format!("unusable low zoom prefix {:?}", lz.prefix)));
            }
        }
        Ok(self)
    }

    pub fn index_options(&self) -> IndexOptions {
        IndexOptions { extra: self.extra_indices, planet: self.planet_views, vacuum: self.vacuum }
    }
}

/// One export run. Each step checks the phase it needs and advances it.
pub struct Export {
    config: ExportConfig,
    specs: Vec<TableSpec>,
    catalog: Catalog,
    phase: Phase,
}

impl Export {
    pub fn plan(style: &Style, config: ExportConfig) -> Result<Self> {
        style.validate()?;
        let config = config.validate()?;
        let specs = derive_tables(style, config.add_minzoom, config.extended)?;
        info!(
            "planned {} tables: {}",
            specs.len(),
            specs.iter().map(|s| s.table_name.as_str()).collect::<Vec<_>>().join(", ")
        );
        Ok(Export { config, specs, catalog: Catalog::new(), phase: Phase::Planned })
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn specs(&self) -> &[TableSpec] {
        &self.specs
    }

    pub fn config(&self) -> &ExportConfig {
        &self.config
    }

    pub fn parameters(&self) -> ExportParameters {
        ExportParameters {
            table_prefix: self.config.table_prefix.clone(),
            add_minzoom: self.config.add_minzoom,
            extended: self.config.extended,
        }
    }

    fn expect(&self, allowed: &[Phase]) -> Result<()> {
        if allowed.contains(&self.phase) {
            Ok(())
        } else {
            Err(ExportError::Phase { expected: allowed[0], actual: self.phase })
        }
    }

    pub fn create_tables(&mut self, exec: &mut dyn Executor) -> Result<()> {
        self.expect(&[Phase::Planned])?;
        ddl::create_tables(exec, &self.config.table_prefix, &self.specs)?;
        self.phase = Phase::TablesCreated;
        Ok(())
    }

    /// Runs the engine into `sink`. A direct export must have created its tables first.
    pub fn populate(&mut self, engine: &mut dyn ProcessingEngine, sink: &mut dyn BlockSink) -> Result<EngineReport> {
        if self.config.is_direct() {
            self.expect(&[Phase::TablesCreated])?;
        } else {
            self.expect(&[Phase::Planned, Phase::TablesCreated])?;
        }
        let report = engine.process(&self.specs, &self.parameters(), sink)?;
        info!("engine produced {} rows, {} errors", report.rows, report.errors.len());
        self.phase = Phase::Populated;
        Ok(report)
    }

    pub fn create_indices(&mut self, exec: &mut dyn Executor) -> Result<Duration> {
        self.expect(&[Phase::Populated])?;
        let orch = Orchestrator::new(&self.catalog);
        let options = self.config.index_options();
        let elapsed = if self.config.extended {
            orch.create_extended_indices(exec, &self.config.table_prefix, &self.specs, options)?
        } else {
            orch.create_indices(exec, &self.config.table_prefix, options)?
        };
        self.phase = Phase::Indexed;
        Ok(elapsed)
    }

    /// Table names a low zoom tier covers. View tiers of the standard set also
    /// cover its filtered views and derived tables. Table tiers copy only the
    /// physical tables; the standard set's derived objects are rebuilt after.
    fn tier_tables(&self, as_tables: bool) -> Vec<String> {
        let mut names: Vec<String> = self.specs.iter().map(|s| s.table_name.clone()).collect();
        if !as_tables && !self.config.extended {
            names.extend(
                CanonicalTable::iter()
                    .filter(|t| t.storage(false) != Storage::Table)
                    .map(|t| t.to_string()),
            );
            names.push(ROADS_TABLE.to_string());
        }
        names
    }

    /// Builds every configured low zoom tier from the base tables.
    pub fn build_pyramid(&mut self, exec: &mut dyn Executor) -> Result<Duration> {
        if self.phase != Phase::Indexed {
            self.expect(&[Phase::Populated])?;
        }
        if !self.config.add_minzoom {
            return Err(ExportError::Config("low zoom tiers need the minzoom column".to_string()));
        }
        let mut total = Duration::ZERO;
        for lz in &self.config.lowzoom {
            let tables = self.tier_tables(lz.as_tables);
            total += if lz.as_tables {
                let mut tier = ZoomTier::new(lz.minzoom, &tables);
                if let Some(t) = lz.simplify {
                    tier = tier.simplify(t);
                }
                let mut elapsed =
                    materialize_low_zoom_tables(exec, &self.config.table_prefix, &lz.prefix, &tier, self.config.extended)?;
                if !self.config.extended {
                    elapsed += derive_standard_objects(exec, &lz.prefix, &self.catalog)?;
                }
                elapsed
            } else {
                create_low_zoom_views(
                    exec,
                    &self.config.table_prefix,
                    &lz.prefix,
                    lz.minzoom,
                    &tables,
                    lz.with_indices,
                    self.config.extended,
                )?
            };
        }
        Ok(total)
    }

    /// Creates, populates and indexes the tables over `client`, then builds the tiers.
    pub fn run_direct(&mut self, client: &mut Client, engine: &mut dyn ProcessingEngine) -> Result<EngineReport> {
        if !self.config.is_direct() {
            return Err(ExportError::Config("direct export needs a connection string".to_string()));
        }
        self.create_tables(&mut *client)?;
        let report = {
            let mut sink = PostgisWriter::new(&mut *client, &self.config.table_prefix)?;
            self.populate(engine, &mut sink)?
        };
        if self.config.write_indices {
            self.create_indices(&mut *client)?;
        }
        if !self.config.lowzoom.is_empty() {
            self.build_pyramid(&mut *client)?;
        }
        Ok(report)
    }

    /// Populates batch files under the output prefix, or memory when none is set.
    pub fn run_to_writer(&mut self, engine: &mut dyn ProcessingEngine) -> Result<(EngineReport, BlockWriter)> {
        let mut writer = match &self.config.output_prefix {
            Some(prefix) => BlockWriter::to_files(prefix),
            None => BlockWriter::in_memory(engine.expected_rows(&self.specs).unwrap_or(usize::MAX)),
        };
        let report = self.populate(engine, &mut writer)?;
        Ok((report, writer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineError;
    use crate::executor::testing::RecordingExecutor;
    use crate::writer::{CsvBlock, StoredBlock};

    struct FixedEngine {
        rows_per_table: usize,
    }

    impl ProcessingEngine for FixedEngine {
        fn process(
            &mut self,
            tables: &[TableSpec],
            _params: &ExportParameters,
            sink: &mut dyn BlockSink,
        ) -> Result<EngineReport> {
            let mut block = CsvBlock::new();
            for t in tables {
                for i in 0..self.rows_per_table {
                    let id = i.to_string();
                    let fields: Vec<Option<&str>> = t.columns.iter().map(|_| Some(id.as_str())).collect();
                    block.get(&t.table_name).add(&fields);
                }
            }
            sink.accept(Some(block))?;
            sink.accept(None)?;
            Ok(EngineReport {
                rows: self.rows_per_table * tables.len(),
                errors: vec![EngineError { table: "point".into(), message: "bad geometry".into() }],
            })
        }

        fn expected_rows(&self, tables: &[TableSpec]) -> Option<usize> {
            Some(self.rows_per_table * tables.len())
        }
    }

    fn style() -> Style {
        Style::with_keys([("name", true, true), ("building", false, true)])
    }

    fn direct() -> ExportConfig {
        ExportConfig {
            table_prefix: "osm".into(),
            connection: Some("host=localhost".into()),
            add_minzoom: true,
            ..Default::default()
        }
    }

    #[test]
    fn prefix_normalization() {
        assert_eq!(normalize_prefix("osm"), "osm_");
        assert_eq!(normalize_prefix("osm_"), "osm_");
        assert_eq!(normalize_prefix(""), "");
        let export = Export::plan(&style(), direct()).unwrap();
        assert_eq!(export.config().table_prefix, "osm_");
    }

    #[test]
    fn config_errors() {
        let no_prefix = ExportConfig { table_prefix: "".into(), ..direct() };
        assert!(matches!(Export::plan(&style(), no_prefix), Err(ExportError::Config(_))));

        let empty_conn = ExportConfig { connection: Some(" ".into()), ..direct() };
        assert!(matches!(Export::plan(&style(), empty_conn), Err(ExportError::Config(_))));

        let lz = LowZoomConfig { prefix: "z6".into(), minzoom: 6, as_tables: true, simplify: None, with_indices: false };
        let no_minzoom = ExportConfig { add_minzoom: false, lowzoom: vec![lz.clone()], ..direct() };
        assert!(matches!(Export::plan(&style(), no_minzoom), Err(ExportError::Config(_))));

        let same = ExportConfig { lowzoom: vec![LowZoomConfig { prefix: "osm".into(), ..lz }], ..direct() };
        assert!(matches!(Export::plan(&style(), same), Err(ExportError::Config(_))));

        assert!(matches!(Export::plan(&Style::default(), direct()), Err(ExportError::Config(_))));
    }

    #[test]
    fn phases_are_checked() {
        let mut export = Export::plan(&style(), direct()).unwrap();
        let mut exec = RecordingExecutor::default();
        let err = export.create_indices(&mut exec).unwrap_err();
        assert!(matches!(err, ExportError::Phase { expected: Phase::Populated, actual: Phase::Planned }));

        let mut engine = FixedEngine { rows_per_table: 1 };
        let mut sink = BlockWriter::in_memory(3);
        assert!(matches!(export.populate(&mut engine, &mut sink), Err(ExportError::Phase { .. })));
        assert!(exec.statements.is_empty());

        export.create_tables(&mut exec).unwrap();
        let report = export.populate(&mut engine, &mut sink).unwrap();
        assert_eq!(report.errors.len(), 1);
        assert_eq!(export.phase(), Phase::Populated);
        export.create_indices(&mut exec).unwrap();
        assert_eq!(export.phase(), Phase::Indexed);
        assert!(matches!(export.create_tables(&mut exec), Err(ExportError::Phase { .. })));
    }

    #[test]
    fn in_memory_export_applies_size_guard() {
        let config = ExportConfig { add_minzoom: true, ..Default::default() };
        let mut export = Export::plan(&style(), config).unwrap();
        let mut engine = FixedEngine { rows_per_table: 50 };
        let (report, writer) = export.run_to_writer(&mut engine).unwrap();
        assert_eq!(report.rows, 150);
        assert!(writer.blocks().iter().all(|b| matches!(b, StoredBlock::Volume(_))));
    }

    #[test]
    fn pyramid_views_and_tables() {
        let config = ExportConfig {
            lowzoom: vec![
                LowZoomConfig { prefix: "z9".into(), minzoom: 9, as_tables: false, simplify: None, with_indices: true },
                LowZoomConfig { prefix: "z6".into(), minzoom: 6, as_tables: true, simplify: Some(100.0), with_indices: true },
            ],
            ..direct()
        };
        let mut export = Export::plan(&style(), config).unwrap();
        let mut exec = RecordingExecutor::default()
            .with_table("osm_line", &["osm_id", "name", "minzoom", "way"])
            .with_table("osm_polygon", &["osm_id", "name", "minzoom", "way"]);
        assert!(matches!(export.build_pyramid(&mut exec), Err(ExportError::Phase { .. })));

        export.create_tables(&mut exec).unwrap();
        export.populate(&mut FixedEngine { rows_per_table: 1 }, &mut BlockWriter::in_memory(3)).unwrap();
        export.build_pyramid(&mut exec).unwrap();

        assert!(exec
            .position("CREATE VIEW z9_highway AS (SELECT * FROM osm_line WHERE z_order IS NOT NULL AND z_order != 0 AND minzoom <= 9)")
            .is_some());
        assert!(exec.position("CREATE INDEX z9_highway_way ON osm_line USING gist (way) WHERE z_order").is_some());
        assert!(exec.position("CREATE TABLE z6_point AS (SELECT * FROM osm_point WHERE minzoom <= 6)").is_some());
        assert!(exec.position("ST_Simplify(way, 100) AS way FROM osm_line").is_some());
        for object in [
            "CREATE TABLE z6_roads AS",
            "CREATE VIEW z6_highway AS (SELECT * FROM z6_line",
            "CREATE TABLE z6_boundary AS",
            "CREATE VIEW z6_building AS (SELECT * FROM z6_polygon",
            "CREATE VIEW z9_roads AS",
            "CREATE VIEW z9_boundary AS",
        ] {
            assert!(exec.position(object).is_some(), "tier lacks {}", object);
        }
        let copied = exec.position("CREATE TABLE z6_line AS").unwrap();
        assert!(copied < exec.position("CREATE TABLE z6_roads AS").unwrap());
    }

    #[test]
    fn view_tier_without_extra_indices() {
        let config = ExportConfig {
            write_indices: true,
            extra_indices: false,
            lowzoom: vec![LowZoomConfig { prefix: "z9".into(), minzoom: 9, as_tables: false, simplify: None, with_indices: true }],
            ..direct()
        };
        let mut export = Export::plan(&style(), config).unwrap();
        let mut exec = RecordingExecutor::default();
        export.create_tables(&mut exec).unwrap();
        export.populate(&mut FixedEngine { rows_per_table: 1 }, &mut BlockWriter::in_memory(3)).unwrap();
        export.create_indices(&mut exec).unwrap();
        let tier_start = exec.statements.len();
        export.build_pyramid(&mut exec).unwrap();

        let created: Vec<&String> = exec.statements[..tier_start].iter().filter(|s| s.starts_with("CREATE")).collect();
        for tier_statement in &exec.statements[tier_start..] {
            for object in ["osm_highway", "osm_building", "osm_boundary"] {
                if tier_statement.contains(object) {
                    assert!(created.iter().any(|c| c.contains(object)), "{} reads missing {}", tier_statement, object);
                }
            }
        }
        assert!(exec.position("CREATE VIEW z9_highway").is_some());
    }
}
