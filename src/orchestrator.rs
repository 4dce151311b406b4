use std::time::{Duration, Instant};

use log::{debug, info};

use crate::error::{ExportError, Result};
use crate::executor::Executor;
use crate::sql::{Catalog, PREFIX_TOKEN};
use crate::style::check_prefix;
use crate::tablespec::TableSpec;

/// A named, ordered list of statement templates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub name: &'static str,
    pub statements: Vec<String>,
}

impl Batch {
    pub fn new(name: &'static str, templates: &[&str]) -> Self {
        Batch { name, statements: templates.iter().map(|t| t.to_string()).collect() }
    }

    pub fn render(&self, prefix: &str) -> Vec<String> {
        self.statements.iter().map(|s| s.replace(PREFIX_TOKEN, prefix)).collect()
    }
}

fn one_line(statement: &str) -> String {
    statement.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Runs every statement of `batch` in order with the prefix substituted.
/// Stops at the first rejected statement; earlier ones stay applied.
pub fn run_batch(exec: &mut dyn Executor, prefix: &str, batch: &Batch) -> Result<Duration> {
    check_prefix(prefix)?;
    let start = Instant::now();
    for (position, statement) in batch.render(prefix).into_iter().enumerate() {
        debug!("{}", statement);
        let qst = Instant::now();
        if let Err(source) = exec.run(&statement) {
            return Err(ExportError::Statement {
                batch: batch.name.to_string(),
                position,
                statement,
                elapsed: start.elapsed(),
                source,
            });
        }
        info!("{:<100.100} {:7.1}s", one_line(&statement), qst.elapsed().as_secs_f64());
    }
    let elapsed = start.elapsed();
    info!("batch {} ({} statements) in {:.1}s", batch.name, batch.statements.len(), elapsed.as_secs_f64());
    Ok(elapsed)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexOptions {
    pub extra: bool,
    pub planet: bool,
    pub vacuum: bool,
}

/// Applies the index, view and maintenance batches for a loaded export.
pub struct Orchestrator<'a> {
    catalog: &'a Catalog,
}

impl<'a> Orchestrator<'a> {
    pub fn new(catalog: &'a Catalog) -> Self {
        Orchestrator { catalog }
    }

    pub fn catalog(&self) -> &'a Catalog {
        self.catalog
    }

    /// Batches for the standard table set, in application order.
    pub fn standard_batches(&self, options: IndexOptions) -> Vec<&'a Batch> {
        let c = self.catalog;
        let mut batches = vec![&c.base];
        if options.extra {
            batches.push(&c.extras);
        }
        if options.planet {
            batches.push(&c.planet);
        }
        batches.push(&c.autovacuum);
        if options.vacuum {
            batches.push(&c.vacuum);
            if options.extra {
                batches.push(&c.vacuum_extra);
            }
        }
        batches
    }

    /// Batches for the extended table set, in application order.
    pub fn extended_batches(&self, specs: &[TableSpec], options: IndexOptions) -> Vec<Batch> {
        let c = self.catalog;
        let mut batches = vec![c.extended_point_line(specs), c.extended_polygon(specs)];
        if options.planet {
            batches.push(c.extended_planet(specs));
        }
        batches.push(c.extended_maintenance(specs, options.vacuum));
        batches
    }

    pub fn create_indices(&self, exec: &mut dyn Executor, prefix: &str, options: IndexOptions) -> Result<Duration> {
        let mut total = Duration::ZERO;
        for batch in self.standard_batches(options) {
            total += run_batch(exec, prefix, batch)?;
        }
        info!("created indices in {:.1}s", total.as_secs_f64());
        Ok(total)
    }

    pub fn create_extended_indices(
        &self,
        exec: &mut dyn Executor,
        prefix: &str,
        specs: &[TableSpec],
        options: IndexOptions,
    ) -> Result<Duration> {
        let mut total = Duration::ZERO;
        for batch in self.extended_batches(specs, options) {
            total += run_batch(exec, prefix, &batch)?;
        }
        info!("created extended indices in {:.1}s", total.as_secs_f64());
        Ok(total)
    }
}
