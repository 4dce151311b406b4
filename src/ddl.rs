use strum::IntoEnumIterator;

use crate::error::{ExportError, Result};
use crate::executor::Executor;
use crate::orchestrator::{run_batch, Batch};
use crate::style::{check_column_name, check_prefix};
use crate::tablespec::{CanonicalTable, ColumnType, TableSpec};

pub fn native_type(column_type: ColumnType) -> &'static str {
    match column_type {
        ColumnType::BigInteger => "bigint",
        ColumnType::Text => "text",
        ColumnType::Double => "double precision",
        ColumnType::Hstore => "hstore",
        ColumnType::Geometry => "geometry(Geometry,3857)",
        ColumnType::PointGeometry => "geometry(Point,3857)",
        ColumnType::LineGeometry => "geometry(LineString,3857)",
        ColumnType::PolygonGeometry => "geometry(Polygon,3857)",
    }
}

/// Same as [`native_type`] for a type known only by name, e.g. from a saved spec.
pub fn native_type_named(name: &str) -> Result<&'static str> {
    name.parse::<ColumnType>()
        .map(native_type)
        .map_err(|_| ExportError::Schema(format!("unexpected column type {:?}", name)))
}

pub fn table_create_statement(prefix: &str, spec: &TableSpec) -> Result<String> {
    check_prefix(prefix)?;
    let mut cols = Vec::with_capacity(spec.columns.len());
    for c in &spec.columns {
        check_column_name(&c.name)?;
        cols.push(format!("\"{}\" {}", c.name, native_type(c.column_type)));
    }
    Ok(format!("CREATE TABLE {}{} ({})", prefix, spec.table_name, cols.join(", ")))
}

pub fn autovacuum_statement(prefix: &str, table: &str, enabled: bool) -> String {
    format!("ALTER TABLE {}{} SET (autovacuum_enabled={})", prefix, table, enabled)
}

pub fn drop_statements(prefix: &str) -> Vec<String> {
    CanonicalTable::iter()
        .map(|t| format!("DROP TABLE IF EXISTS {}{} CASCADE", prefix, t))
        .collect()
}

pub fn drop_tables(exec: &mut dyn Executor, prefix: &str) -> Result<()> {
    run_batch(exec, prefix, &Batch { name: "drop_tables", statements: drop_statements(prefix) })?;
    Ok(())
}

/// Drops every canonical table, then creates each supplied table with
/// autovacuum disabled for the bulk load. Runs as one batch, so a failure
/// reports its position among all of these statements.
pub fn create_tables(exec: &mut dyn Executor, prefix: &str, specs: &[TableSpec]) -> Result<()> {
    check_prefix(prefix)?;
    let mut statements = drop_statements(prefix);
    for spec in specs {
        statements.push(table_create_statement(prefix, spec)?);
        statements.push(autovacuum_statement(prefix, &spec.table_name, false));
    }
    run_batch(exec, prefix, &Batch { name: "create_tables", statements })?;
    Ok(())
}
