use crate::orchestrator::Batch;
use crate::tablespec::{CanonicalTable, Storage, TableSpec};

/// Stands for the table prefix in every template.
pub const PREFIX_TOKEN: &str = "%ZZ%";
/// Stands for the quoted non-geometry column list of a template's table.
pub const COLUMNS_TOKEN: &str = "%RR%";

/// The standard set's derived line table, built from `line` and `polygon`.
pub const ROADS_TABLE: &str = "roads";

const ROADS_QUERY_TOKEN: &str = "%ROADS%";
const BOUNDARY_QUERY_TOKEN: &str = "%BOUNDARY%";

pub const ROADS_QUERY: &str = "SELECT osm_id,tile,quadtree,name,ref,admin_level,highway,railway,boundary,
            service,tunnel,bridge,z_order,covered,surface,minzoom,way
        FROM %ZZ%line
        WHERE highway in (
            'secondary','secondary_link','primary','primary_link',
            'trunk','trunk_link','motorway','motorway_link')
        OR railway is not null
    UNION ALL SELECT osm_id,tile,quadtree,name,null as ref,admin_level,null as highway,
            null as railway,boundary,null as service,
            null as tunnel,null as bridge,0 as z_order,null as covered,null as surface,minzoom,
            st_exteriorring(way) as way
        FROM %ZZ%polygon WHERE
            osm_id<0 and boundary='administrative'";

pub const BOUNDARY_QUERY: &str = "SELECT osm_id,tile,quadtree,name,admin_level,boundary,minzoom,
            st_exteriorring(way) AS way FROM %ZZ%polygon WHERE osm_id<0 AND boundary='administrative'";

/// Query a standard-set derived table is built from, if `table` is one.
pub fn derived_query(table: &str, extended: bool) -> Option<&'static str> {
    if table == ROADS_TABLE {
        return Some(ROADS_QUERY);
    }
    match table.parse::<CanonicalTable>().map(|t| t.storage(extended)) {
        Ok(Storage::Derived) => Some(BOUNDARY_QUERY),
        _ => None,
    }
}

const BASE: &[&str] = &[
    "DROP TABLE IF EXISTS %ZZ%roads CASCADE",
    "CREATE TABLE %ZZ%roads AS %ROADS%",
    "CREATE INDEX %ZZ%point_way ON %ZZ%point USING gist (way)",
    "CREATE INDEX %ZZ%line_way ON %ZZ%line USING gist (way)",
    "CREATE INDEX %ZZ%polygon_way ON %ZZ%polygon USING gist (way)",
    "CREATE INDEX %ZZ%roads_way ON %ZZ%roads USING gist (way)",
];

/// Recreates roads, highway, boundary and building over the `point`, `line`
/// and `polygon` tables of one prefix.
const STANDARD_DERIVED: &[&str] = &[
    "DROP TABLE IF EXISTS %ZZ%roads CASCADE",
    "CREATE TABLE %ZZ%roads AS %ROADS%",
    "CREATE INDEX %ZZ%roads_way ON %ZZ%roads USING gist (way)",
    "DROP VIEW IF EXISTS %ZZ%highway",
    "CREATE VIEW %ZZ%highway AS (SELECT * FROM %ZZ%line WHERE z_order IS NOT NULL AND z_order != 0)",
    "DROP TABLE IF EXISTS %ZZ%boundary CASCADE",
    "CREATE TABLE %ZZ%boundary AS (%BOUNDARY%)",
    "DROP VIEW IF EXISTS %ZZ%building",
    "CREATE VIEW %ZZ%building AS (SELECT * FROM %ZZ%polygon WHERE building IS NOT NULL AND building != 'no')",
    "CREATE INDEX %ZZ%highway_view ON %ZZ%line USING gist (way) WHERE z_order IS NOT NULL AND z_order != 0",
    "CREATE INDEX %ZZ%boundary_view ON %ZZ%boundary USING gist (way)",
    "CREATE INDEX %ZZ%building_view ON %ZZ%polygon USING gist (way) WHERE building IS NOT NULL AND building != 'no'",
    "VACUUM ANALYZE %ZZ%roads",
    "VACUUM ANALYZE %ZZ%boundary",
];

const EXTRAS: &[&str] = &[
    "CREATE INDEX %ZZ%point_osmid ON %ZZ%point USING btree (osm_id)",
    "CREATE INDEX %ZZ%line_osmid ON %ZZ%line USING btree (osm_id)",
    "CREATE INDEX %ZZ%polygon_osmid ON %ZZ%polygon USING btree (osm_id)",
    "CREATE INDEX %ZZ%roads_osmid ON %ZZ%roads USING btree (osm_id)",
    "CREATE INDEX %ZZ%roads_admin ON %ZZ%roads USING gist (way) WHERE boundary = 'administrative'",
    "CREATE INDEX %ZZ%roads_roads_ref ON %ZZ%roads USING gist (way) WHERE highway IS NOT NULL AND ref IS NOT NULL",
    "CREATE INDEX %ZZ%roads_admin_low ON %ZZ%roads USING gist (way) WHERE boundary = 'administrative' AND admin_level IN ('0', '1', '2', '3', '4')",
    "CREATE INDEX %ZZ%line_ferry ON %ZZ%line USING gist (way) WHERE route = 'ferry'",
    "CREATE INDEX %ZZ%line_river ON %ZZ%line USING gist (way) WHERE waterway = 'river'",
    "CREATE INDEX %ZZ%line_name ON %ZZ%line USING gist (way) WHERE name IS NOT NULL",
    "CREATE INDEX %ZZ%polygon_military ON %ZZ%polygon USING gist (way) WHERE landuse = 'military'",
    "CREATE INDEX %ZZ%polygon_nobuilding ON %ZZ%polygon USING gist (way) WHERE building IS NULL",
    "CREATE INDEX %ZZ%polygon_name ON %ZZ%polygon USING gist (way) WHERE name IS NOT NULL",
    "CREATE INDEX %ZZ%polygon_way_area_z6 ON %ZZ%polygon USING gist (way) WHERE way_area > 59750",
    "CREATE INDEX %ZZ%point_place ON %ZZ%point USING gist (way) WHERE place IS NOT NULL AND name IS NOT NULL",
    "DROP VIEW IF EXISTS %ZZ%highway",
    "CREATE VIEW %ZZ%highway AS (SELECT * FROM %ZZ%line WHERE z_order IS NOT NULL AND z_order != 0)",
    "DROP TABLE IF EXISTS %ZZ%boundary CASCADE",
    "CREATE TABLE %ZZ%boundary AS (%BOUNDARY%)",
    "DROP VIEW IF EXISTS %ZZ%building",
    "CREATE VIEW %ZZ%building AS (SELECT * FROM %ZZ%polygon WHERE building IS NOT NULL AND building != 'no')",
    "CREATE INDEX %ZZ%highway_view ON %ZZ%line USING gist (way) WHERE z_order IS NOT NULL AND z_order != 0",
    "CREATE INDEX %ZZ%boundary_view ON %ZZ%boundary USING gist (way)",
    "CREATE INDEX %ZZ%building_view ON %ZZ%polygon USING gist (way) WHERE building IS NOT NULL AND building != 'no'",
];

const PLANET: &[&str] = &[
    "DROP VIEW IF EXISTS planet_osm_point",
    "DROP VIEW IF EXISTS planet_osm_line",
    "DROP VIEW IF EXISTS planet_osm_polygon",
    "DROP TABLE IF EXISTS planet_osm_roads",
    "DROP VIEW IF EXISTS planet_osm_highway",
    "DROP VIEW IF EXISTS planet_osm_boundary",
    "DROP VIEW IF EXISTS planet_osm_building",
    "CREATE VIEW planet_osm_point AS (SELECT * FROM %ZZ%point)",
    "CREATE VIEW planet_osm_line AS (SELECT * FROM %ZZ%line)",
    "CREATE VIEW planet_osm_polygon AS (SELECT * FROM %ZZ%polygon)",
    "CREATE TABLE planet_osm_roads AS (SELECT * FROM %ZZ%roads)",
    "CREATE INDEX planet_osm_roads_way_admin_idx ON planet_osm_roads USING gist (way) WHERE (osm_id < 0 AND boundary='administrative')",
    "CREATE INDEX planet_osm_roads_way_highway_idx ON planet_osm_roads USING gist (way) WHERE (highway IS NOT NULL OR railway IS NOT NULL)",
    "CREATE VIEW planet_osm_highway AS (SELECT * FROM %ZZ%highway)",
    "CREATE VIEW planet_osm_boundary AS (SELECT * FROM %ZZ%boundary)",
    "CREATE VIEW planet_osm_building AS (SELECT * FROM %ZZ%building)",
];

const PLANET_EXTENDED_HEAD: &[&str] = &[
    "DROP VIEW IF EXISTS planet_osm_point",
    "DROP VIEW IF EXISTS planet_osm_line",
    "DROP VIEW IF EXISTS planet_osm_polygon",
    "DROP TABLE IF EXISTS planet_osm_roads",
    "DROP VIEW IF EXISTS planet_osm_highway",
    "DROP VIEW IF EXISTS planet_osm_building",
    "DROP VIEW IF EXISTS planet_osm_boundary",
    "DROP VIEW IF EXISTS planet_osm_polygon_point",
    "CREATE VIEW planet_osm_point AS (SELECT * FROM %ZZ%point)",
];

const PLANET_EXTENDED_TAIL: &[&str] = &[
    "CREATE TABLE planet_osm_roads AS (
    SELECT osm_id,tile,quadtree,name,ref,admin_level,highway,railway,boundary,service,tunnel,bridge,
            z_order,covered,surface,minzoom,way
        FROM %ZZ%highway
        WHERE highway IN ('secondary','secondary_link','primary','primary_link',
            'trunk','trunk_link','motorway','motorway_link') OR railway IS NOT NULL
    UNION ALL SELECT osm_id,tile,quadtree,name,null AS ref,admin_level,null AS highway,
            null AS railway,boundary,null AS service,null AS tunnel,null AS bridge,0 AS z_order,
            null AS covered,null AS surface,minzoom,st_exteriorring(way) AS way
        FROM %ZZ%boundary WHERE osm_id<0 AND boundary='administrative')",
    "CREATE INDEX planet_osm_roads_way_admin_idx ON planet_osm_roads USING gist (way) WHERE (osm_id < 0 AND boundary='administrative')",
    "CREATE INDEX planet_osm_roads_way_highway_idx ON planet_osm_roads USING gist (way) WHERE (highway IS NOT NULL OR railway IS NOT NULL)",
    "CREATE VIEW planet_osm_highway AS (SELECT * FROM %ZZ%highway)",
    "CREATE VIEW planet_osm_building AS (SELECT * FROM %ZZ%building)",
    "CREATE VIEW planet_osm_boundary AS (SELECT * FROM %ZZ%boundary)",
    "CREATE VIEW planet_osm_polygon_point AS (SELECT * FROM %ZZ%polygon_point)",
];

const AUTOVACUUM: &[&str] = &[
    "ALTER TABLE %ZZ%point SET (autovacuum_enabled=true)",
    "ALTER TABLE %ZZ%line SET (autovacuum_enabled=true)",
    "ALTER TABLE %ZZ%polygon SET (autovacuum_enabled=true)",
];

const VACUUM: &[&str] = &[
    "VACUUM ANALYZE %ZZ%point",
    "VACUUM ANALYZE %ZZ%line",
    "VACUUM ANALYZE %ZZ%polygon",
    "VACUUM ANALYZE %ZZ%roads",
];

const VACUUM_EXTRA: &[&str] = &["VACUUM ANALYZE %ZZ%boundary"];

const MAJOR_ROADS: &str = "(highway IN ('motorway','motorway_link','trunk','trunk_link','primary','primary_link','secondary')
    OR (railway IN ('rail','light_rail','narrow_gauge','funicular') AND (service IS NULL OR service NOT IN ('spur', 'siding', 'yard'))))";

/// An extended-set statement that only applies when `table` is exported and
/// carries every column in `requires`.
#[derive(Debug, Clone)]
pub struct TableTemplate {
    pub table: CanonicalTable,
    pub requires: &'static [&'static str],
    pub sql: String,
}

impl TableTemplate {
    fn new(table: CanonicalTable, requires: &'static [&'static str], sql: &str) -> Self {
        TableTemplate { table, requires, sql: sql.to_string() }
    }

    fn applies_to(&self, spec: &TableSpec) -> bool {
        spec.table_name == self.table.as_ref() && self.requires.iter().all(|c| spec.has_column(c))
    }
}

fn gist_and_id(table: CanonicalTable) -> Vec<TableTemplate> {
    let t = table.as_ref();
    vec![
        TableTemplate::new(table, &[], &format!("CREATE INDEX %ZZ%{t}_way_idx ON %ZZ%{t} USING gist(way)")),
        TableTemplate::new(table, &[], &format!("CREATE INDEX %ZZ%{t}_id_idx ON %ZZ%{t} USING btree(osm_id)")),
    ]
}

fn trigram_name(table: CanonicalTable) -> TableTemplate {
    let t = table.as_ref();
    TableTemplate::new(
        table,
        &["name"],
        &format!("CREATE INDEX %ZZ%{t}_name_idx ON %ZZ%{t} USING gin(name gin_trgm_ops)"),
    )
}

fn extended_point_line() -> Vec<TableTemplate> {
    let mut res = Vec::new();
    for table in [CanonicalTable::Point, CanonicalTable::Line, CanonicalTable::Highway] {
        res.extend(gist_and_id(table));
        res.push(trigram_name(table));
    }
    res.push(TableTemplate::new(
        CanonicalTable::Highway,
        &["highway", "railway", "service"],
        &format!("CREATE INDEX %ZZ%highway_way_lz_idx ON %ZZ%highway USING gist(way) WHERE {}", MAJOR_ROADS),
    ));
    res.push(TableTemplate::new(
        CanonicalTable::Point,
        &["place", "name"],
        "CREATE INDEX %ZZ%point_place_idx ON %ZZ%point USING gist(way) WHERE place IS NOT NULL AND name IS NOT NULL",
    ));
    res
}

fn extended_polygon() -> Vec<TableTemplate> {
    let mut res = Vec::new();
    for table in [CanonicalTable::Polygon, CanonicalTable::Building, CanonicalTable::Boundary] {
        res.extend(gist_and_id(table));
    }
    res.push(trigram_name(CanonicalTable::Polygon));
    res.push(trigram_name(CanonicalTable::Boundary));
    res.push(TableTemplate::new(
        CanonicalTable::Polygon,
        &["way_point"],
        "CREATE INDEX %ZZ%polygon_way_point_idx ON %ZZ%polygon USING gist(way_point)",
    ));
    res.push(TableTemplate::new(
        CanonicalTable::Polygon,
        &["way_point", "boundary"],
        "CREATE INDEX %ZZ%polygon_way_point_admin_idx ON %ZZ%polygon USING gist(way_point) WHERE (boundary = 'administrative' AND osm_id < 0)",
    ));
    res.push(TableTemplate::new(
        CanonicalTable::Polygon,
        &["landuse", "natural", "building"],
        "CREATE INDEX %ZZ%polygon_landcover_lowzoom_idx ON %ZZ%polygon USING gist(way) WHERE ((landuse IN ('forest', 'farmland', 'residential', 'commercial', 'retail', 'industrial', 'meadow', 'grass', 'village_green', 'vineyard', 'orchard') OR \"natural\" IN ('wood', 'wetland', 'mud', 'sand', 'scree', 'shingle', 'bare_rock', 'heath', 'grassland', 'scrub')) AND way_area > 3 AND building IS NULL)",
    ));
    res.push(TableTemplate::new(CanonicalTable::Polygon, &["way_point"], "DROP VIEW IF EXISTS %ZZ%polygon_point"));
    res.push(TableTemplate::new(
        CanonicalTable::Polygon,
        &["way_point"],
        "CREATE VIEW %ZZ%polygon_point AS SELECT %RR%, way_point AS way FROM %ZZ%polygon",
    ));
    res.push(TableTemplate::new(
        CanonicalTable::Polygon,
        &["way_point"],
        "CREATE INDEX %ZZ%polygon_point_way_idx ON %ZZ%polygon USING gist(way_point) WHERE way_point IS NOT NULL",
    ));
    res.push(TableTemplate::new(CanonicalTable::Boundary, &[], "DROP VIEW IF EXISTS %ZZ%boundary_exterior"));
    res.push(TableTemplate::new(
        CanonicalTable::Boundary,
        &[],
        "CREATE VIEW %ZZ%boundary_exterior AS SELECT %RR%, st_exteriorring(way) AS way FROM %ZZ%boundary",
    ));
    res
}

/// Unions of each base table with its split-off table. Both arms select the
/// split-off table's columns, so `polygon`'s `way_point` stays out.
fn planet_unions() -> Vec<TableTemplate> {
    vec![
        TableTemplate::new(
            CanonicalTable::Highway,
            &[],
            "CREATE VIEW planet_osm_line AS (SELECT %RR%, way FROM %ZZ%line UNION ALL SELECT %RR%, way FROM %ZZ%highway)",
        ),
        TableTemplate::new(
            CanonicalTable::Building,
            &[],
            "CREATE VIEW planet_osm_polygon AS (SELECT %RR%, way FROM %ZZ%polygon UNION ALL SELECT %RR%, way FROM %ZZ%building)",
        ),
    ]
}

/// Quoted column list of `spec` without its geometry columns.
pub fn attribute_columns(spec: &TableSpec) -> String {
    spec.columns
        .iter()
        .filter(|c| !c.column_type.is_geometry())
        .map(|c| format!("\"{}\"", c.name))
        .collect::<Vec<_>>()
        .join(", ")
}

/// A `json_<table>` view folding every attribute column, and the catch-all
/// tag map when present, into one `properties` document.
pub fn json_view(spec: &TableSpec) -> Vec<String> {
    let t = &spec.table_name;
    let mut removed = vec!["osm_id", "quadtree", "tile", "tags", "minzoom"];
    let mut geometry = Vec::new();
    for c in spec.columns.iter().filter(|c| c.column_type.is_geometry()) {
        removed.push(c.name.as_str());
        geometry.push(c.name.as_str());
    }
    let stripped: String = removed.iter().map(|c| format!(" - '{}'", c)).collect();
    let tags = if spec.has_column("tags") { " || coalesce(tags::jsonb, '{}'::jsonb)" } else { "" };
    let minzoom = if spec.has_column("minzoom") { ", minzoom" } else { "" };
    vec![
        format!("DROP VIEW IF EXISTS %ZZ%json_{}", t),
        format!(
            "CREATE VIEW %ZZ%json_{t} AS SELECT osm_id, quadtree, tile, jsonb_strip_nulls(row_to_json(pp)::jsonb{stripped}){tags} AS properties{minzoom}, {geom} FROM %ZZ%{t} pp",
            t = t,
            stripped = stripped,
            tags = tags,
            minzoom = minzoom,
            geom = geometry.join(", "),
        ),
    ]
}

fn expanded(name: &'static str, templates: &[&str]) -> Batch {
    let statements = templates
        .iter()
        .map(|t| t.replace(ROADS_QUERY_TOKEN, ROADS_QUERY).replace(BOUNDARY_QUERY_TOKEN, BOUNDARY_QUERY))
        .collect();
    Batch { name, statements }
}

/// Every named statement batch. Built once and shared by reference.
pub struct Catalog {
    pub base: Batch,
    pub extras: Batch,
    pub planet: Batch,
    pub autovacuum: Batch,
    pub vacuum: Batch,
    pub vacuum_extra: Batch,
    pub derived: Batch,
    planet_unions: Vec<TableTemplate>,
    point_line_templates: Vec<TableTemplate>,
    polygon_templates: Vec<TableTemplate>,
}

impl Catalog {
    pub fn new() -> Self {
        Catalog {
            base: expanded("base", BASE),
            extras: expanded("extras", EXTRAS),
            planet: Batch::new("planet", PLANET),
            autovacuum: Batch::new("autovacuum", AUTOVACUUM),
            vacuum: Batch::new("vacuum", VACUUM),
            vacuum_extra: Batch::new("vacuum_extra", VACUUM_EXTRA),
            derived: expanded("derived", STANDARD_DERIVED),
            planet_unions: planet_unions(),
            point_line_templates: extended_point_line(),
            polygon_templates: extended_polygon(),
        }
    }

    fn select(name: &'static str, templates: &[TableTemplate], specs: &[TableSpec]) -> Batch {
        let mut statements = Vec::new();
        for tt in templates {
            if let Some(spec) = specs.iter().find(|s| tt.applies_to(s)) {
                statements.push(tt.sql.replace(COLUMNS_TOKEN, &attribute_columns(spec)));
            }
        }
        Batch { name, statements }
    }

    /// Planet-compatible views over the extended set.
    pub fn extended_planet(&self, specs: &[TableSpec]) -> Batch {
        let unions = Catalog::select("planet_extended", &self.planet_unions, specs);
        let mut batch = Batch::new("planet_extended", PLANET_EXTENDED_HEAD);
        batch.statements.extend(unions.statements);
        batch.statements.extend(PLANET_EXTENDED_TAIL.iter().map(|s| s.to_string()));
        batch
    }

    /// Point- and line-oriented indices and views for the extended set.
    pub fn extended_point_line(&self, specs: &[TableSpec]) -> Batch {
        let mut batch = Catalog::select("extended_point_line", &self.point_line_templates, specs);
        if batch.statements.iter().any(|s| s.contains("gin_trgm_ops")) {
            batch.statements.insert(0, "CREATE EXTENSION IF NOT EXISTS pg_trgm".to_string());
        }
        for spec in specs.iter().filter(|s| matches!(s.table_name.as_str(), "point" | "line" | "highway")) {
            batch.statements.extend(json_view(spec));
        }
        batch
    }

    /// Polygon-oriented indices and views for the extended set.
    pub fn extended_polygon(&self, specs: &[TableSpec]) -> Batch {
        let mut batch = Catalog::select("extended_polygon", &self.polygon_templates, specs);
        if batch.statements.iter().any(|s| s.contains("gin_trgm_ops")) {
            batch.statements.insert(0, "CREATE EXTENSION IF NOT EXISTS pg_trgm".to_string());
        }
        for spec in specs.iter().filter(|s| matches!(s.table_name.as_str(), "polygon" | "building" | "boundary")) {
            batch.statements.extend(json_view(spec));
        }
        batch
    }

    /// Re-enables autovacuum on every exported table, then optionally vacuums it.
    pub fn extended_maintenance(&self, specs: &[TableSpec], vacuum: bool) -> Batch {
        let mut statements: Vec<String> = specs
            .iter()
            .map(|s| format!("ALTER TABLE %ZZ%{} SET (autovacuum_enabled=true)", s.table_name))
            .collect();
        if vacuum {
            statements.extend(specs.iter().map(|s| format!("VACUUM ANALYZE %ZZ%{}", s.table_name)));
        }
        Batch { name: "extended_maintenance", statements }
    }
}

impl Default for Catalog {
    fn default() -> Self {
        Catalog::new()
    }
}
