//! Lower-detail derivatives of a loaded table set, filtered by `minzoom`.
//!
//! A tier is either materialized as new tables (optionally simplified and
//! projected) or exposed as views over the source tables with partial indices
//! pushed down onto the physical tables underneath.

use std::time::Duration;

use log::info;

use crate::error::{ExportError, Result};
use crate::executor::Executor;
use crate::orchestrator::{run_batch, Batch};
use crate::sql::{derived_query, Catalog, PREFIX_TOKEN};
use crate::style::{check_column_name, check_prefix};
use crate::tablespec::{CanonicalTable, Storage};

#[derive(Debug, Clone, PartialEq)]
pub struct ZoomTier {
    pub minzoom: i64,
    pub table_names: Vec<String>,
    pub simplify_tolerance: Option<f64>,
    pub column_subset: Option<Vec<String>>,
}

impl ZoomTier {
    pub fn new<S: AsRef<str>>(minzoom: i64, table_names: &[S]) -> Self {
        ZoomTier {
            minzoom,
            table_names: table_names.iter().map(|t| t.as_ref().to_string()).collect(),
            simplify_tolerance: None,
            column_subset: None,
        }
    }

    pub fn simplify(mut self, tolerance: f64) -> Self {
        self.simplify_tolerance = Some(tolerance);
        self
    }

    pub fn columns<S: AsRef<str>>(mut self, columns: &[S]) -> Self {
        self.column_subset = Some(columns.iter().map(|c| c.as_ref().to_string()).collect());
        self
    }

    /// Tolerance to apply to `table`, if any. Points are never simplified.
    fn tolerance_for(&self, table: &str) -> Option<f64> {
        let is_point = table.parse::<CanonicalTable>().map(|t| t.is_point()).unwrap_or(false);
        match self.simplify_tolerance {
            Some(t) if t > 0.0 && !is_point => Some(t),
            _ => None,
        }
    }
}

fn check_names(source_prefix: &str, target_prefix: &str, table_names: &[String]) -> Result<()> {
    check_prefix(source_prefix)?;
    check_prefix(target_prefix)?;
    if source_prefix == target_prefix {
        return Err(ExportError::Config(format!(
            "low zoom prefix {:?} is the source prefix",
            target_prefix
        )));
    }
    for t in table_names {
        check_column_name(t)?;
    }
    Ok(())
}

fn quoted(columns: &[String]) -> Vec<String> {
    columns.iter().map(|c| format!("\"{}\"", c)).collect()
}

/// Copies the rows of every tier table with `minzoom <= tier.minzoom` from
/// `source_prefix` into new tables under `target_prefix`, then indexes and
/// vacuums them.
pub fn materialize_low_zoom_tables(
    exec: &mut dyn Executor,
    source_prefix: &str,
    target_prefix: &str,
    tier: &ZoomTier,
    convenience_views: bool,
) -> Result<Duration> {
    check_names(source_prefix, target_prefix, &tier.table_names)?;
    if let Some(cols) = &tier.column_subset {
        for c in cols {
            check_column_name(c)?;
        }
    }

    let mut statements = Vec::new();
    for tab in &tier.table_names {
        statements.push(format!("DROP TABLE IF EXISTS {}{} CASCADE", target_prefix, tab));
    }

    // column list of each derived table, when known without asking the store
    let mut projected: Vec<(String, Option<Vec<String>>)> = Vec::new();
    for tab in &tier.table_names {
        let source = format!("{}{}", source_prefix, tab);
        let tolerance = tier.tolerance_for(tab);
        let columns = match (&tier.column_subset, tolerance) {
            (Some(subset), _) => Some(subset.clone()),
            (None, Some(_)) => Some(exec.describe_columns(&source).map_err(|e| {
                ExportError::Config(format!("cannot read columns of {}: {}", source, e))
            })?),
            (None, None) => None,
        };
        let columns = columns.map(|cols| cols.into_iter().filter(|c| c != "way").collect::<Vec<_>>());

        let select = match (&columns, tolerance) {
            (None, _) => "*".to_string(),
            (Some(cols), t) => {
                let mut parts = quoted(cols);
                parts.push(match t {
                    Some(t) => format!("ST_Simplify(way, {}) AS way", t),
                    None => "way".to_string(),
                });
                parts.join(", ")
            }
        };
        statements.push(format!(
            "CREATE TABLE {}{} AS (SELECT {} FROM {} WHERE minzoom <= {})",
            target_prefix, tab, select, source, tier.minzoom
        ));
        projected.push((tab.clone(), columns));
    }

    for (tab, columns) in &projected {
        let target = format!("{}{}", target_prefix, tab);
        statements.push(format!("CREATE INDEX {}_way ON {} USING gist (way)", target, target));
        let has_id = columns.as_ref().map_or(true, |c| c.iter().any(|c| c == "osm_id"));
        if has_id {
            statements.push(format!("CREATE INDEX {}_id ON {} USING btree (osm_id)", target, target));
        }
    }

    if convenience_views {
        if let Some((_, columns)) = projected.iter().find(|(t, _)| t == "polygon") {
            let columns = match columns {
                Some(c) => c.clone(),
                None => exec.describe_columns(&format!("{}polygon", source_prefix)).map_err(|e| {
                    ExportError::Config(format!("cannot read columns of {}polygon: {}", source_prefix, e))
                })?,
            };
            statements.extend(polygon_views(target_prefix, &columns));
        }
    }

    for tab in &tier.table_names {
        statements.push(format!("VACUUM ANALYZE {}{}", target_prefix, tab));
    }

    info!("materializing minzoom {} tier {:?} ({} statements)", tier.minzoom, target_prefix, statements.len());
    run_batch(exec, target_prefix, &Batch { name: "lowzoom_tables", statements })
}

/// The representative-point view (when the polygon tier kept `way_point`) and
/// the exterior-ring alias view over a derived polygon table.
fn polygon_views(target_prefix: &str, columns: &[String]) -> Vec<String> {
    let attrs: Vec<String> = columns.iter().filter(|c| *c != "way" && *c != "way_point").cloned().collect();
    let attrs = quoted(&attrs).join(", ");
    let polygon = format!("{}polygon", target_prefix);
    let mut res = Vec::new();
    if columns.iter().any(|c| c == "way_point") {
        res.push(format!("DROP VIEW IF EXISTS {}_point", polygon));
        res.push(format!("CREATE VIEW {p}_point AS SELECT {a}, way_point AS way FROM {p}", p = polygon, a = attrs));
        res.push(format!(
            "CREATE INDEX {p}_way_point ON {p} USING gist (way_point) WHERE way_point IS NOT NULL",
            p = polygon
        ));
    }
    res.push(format!("DROP VIEW IF EXISTS {}_exterior", polygon));
    res.push(format!(
        "CREATE VIEW {p}_exterior AS SELECT {a}, ST_ExteriorRing(way) AS way FROM {p}",
        p = polygon,
        a = attrs
    ));
    res
}

/// Rebuilds the standard set's roads, highway, boundary and building objects
/// over the tier tables already under `target_prefix`.
pub fn derive_standard_objects(exec: &mut dyn Executor, target_prefix: &str, catalog: &Catalog) -> Result<Duration> {
    check_prefix(target_prefix)?;
    info!("deriving standard objects for {:?}", target_prefix);
    run_batch(exec, target_prefix, &catalog.derived)
}

/// Recreates `target_prefix` views that filter the source tables by
/// `minzoom <= minzoom`. Filtered views of the standard set read their base
/// table with the view predicate added, and derived tables are computed from
/// `line` and `polygon` directly, so neither needs the source's own objects.
/// With `with_indices`, each view over a physical table gets a partial gist
/// index restricted by the same predicate. Names with an underscore denote
/// convenience objects and get no index.
pub fn create_low_zoom_views(
    exec: &mut dyn Executor,
    source_prefix: &str,
    target_prefix: &str,
    minzoom: i64,
    table_names: &[String],
    with_indices: bool,
    extended: bool,
) -> Result<Duration> {
    check_names(source_prefix, target_prefix, table_names)?;

    let mut statements = Vec::new();
    for tab in table_names {
        let zoom = format!("minzoom <= {}", minzoom);
        let storage = tab.parse::<CanonicalTable>().map(|t| t.storage(extended)).ok();
        let (relation, filter, physical) = match (derived_query(tab, extended), storage) {
            (Some(query), _) => (
                format!("({}) AS {}", query.replace(PREFIX_TOKEN, source_prefix), tab),
                zoom,
                None,
            ),
            (None, Some(Storage::View { base, predicate })) => (
                format!("{}{}", source_prefix, base),
                format!("{} AND {}", predicate, zoom),
                Some(base.to_string()),
            ),
            (None, _) => (format!("{}{}", source_prefix, tab), zoom, Some(tab.clone())),
        };
        statements.push(format!("DROP VIEW IF EXISTS {}{} CASCADE", target_prefix, tab));
        statements.push(format!(
            "CREATE VIEW {}{} AS (SELECT * FROM {} WHERE {})",
            target_prefix, tab, relation, filter
        ));
        let physical = match physical {
            Some(p) if with_indices && !tab.contains('_') => p,
            _ => continue,
        };
        let index = format!("{}{}_way", target_prefix, tab);
        statements.push(format!("DROP INDEX IF EXISTS {}", index));
        statements.push(format!(
            "CREATE INDEX {} ON {}{} USING gist (way) WHERE {}",
            index, source_prefix, physical, filter
        ));
    }

    info!("creating minzoom {} views {:?} ({} statements)", minzoom, target_prefix, statements.len());
    run_batch(exec, target_prefix, &Batch { name: "lowzoom_views", statements })
}
