use std::str::FromStr;

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumIter, EnumString};

use crate::error::{ExportError, Result};
use crate::style::{check_column_name, Style};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, EnumString, Display)]
pub enum ColumnType {
    BigInteger,
    Text,
    Double,
    Hstore,
    Geometry,
    PointGeometry,
    LineGeometry,
    PolygonGeometry,
}

impl ColumnType {
    pub fn is_geometry(&self) -> bool {
        matches!(
            self,
            ColumnType::Geometry
                | ColumnType::PointGeometry
                | ColumnType::LineGeometry
                | ColumnType::PolygonGeometry
        )
    }
}

/// Which value the processing engine writes into a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, EnumString, Display)]
pub enum ColumnSource {
    OsmId,
    ObjectQuadtree,
    BlockQuadtree,
    Tag,
    MinZoom,
    OtherTags,
    Layer,
    ZOrder,
    Length,
    Area,
    Geometry,
    RepresentativePointGeometry,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
    pub source: ColumnSource,
}

impl ColumnSpec {
    pub fn new(name: &str, column_type: ColumnType, source: ColumnSource) -> Self {
        ColumnSpec { name: name.to_string(), column_type, source }
    }

    fn tag(name: &str) -> Self {
        ColumnSpec::new(name, ColumnType::Text, ColumnSource::Tag)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableSpec {
    pub table_name: String,
    pub columns: Vec<ColumnSpec>,
}

#[derive(Deserialize)]
struct RawColumn {
    name: String,
    #[serde(rename = "type")]
    column_type: String,
    source: String,
}

#[derive(Deserialize)]
struct RawTable {
    table_name: String,
    columns: Vec<RawColumn>,
}

impl TableSpec {
    pub fn new(table_name: &str, columns: Vec<ColumnSpec>) -> Self {
        TableSpec { table_name: table_name.to_string(), columns }
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c.name == name)
    }

    /// The column the engine fills with the feature geometry.
    pub fn geometry_column(&self) -> Option<&ColumnSpec> {
        self.columns.iter().find(|c| c.source == ColumnSource::Geometry)
    }

    pub fn to_json(specs: &[TableSpec]) -> Result<String> {
        serde_json::to_string_pretty(specs).map_err(|e| ExportError::Schema(e.to_string()))
    }

    /// Reads specifications written by [`TableSpec::to_json`]. Unknown column
    /// types or sources are schema errors.
    pub fn from_json(text: &str) -> Result<Vec<TableSpec>> {
        let raw: Vec<RawTable> =
            serde_json::from_str(text).map_err(|e| ExportError::Schema(e.to_string()))?;
        let mut specs = Vec::with_capacity(raw.len());
        for table in raw {
            let mut columns = Vec::with_capacity(table.columns.len());
            for c in table.columns {
                check_column_name(&c.name)?;
                let column_type = ColumnType::from_str(&c.column_type).map_err(|_| {
                    ExportError::Schema(format!("unexpected column type {:?} for {}", c.column_type, c.name))
                })?;
                let source = ColumnSource::from_str(&c.source).map_err(|_| {
                    ExportError::Schema(format!("unexpected column source {:?} for {}", c.source, c.name))
                })?;
                columns.push(ColumnSpec { name: c.name, column_type, source });
            }
            specs.push(TableSpec { table_name: table.table_name, columns });
        }
        Ok(specs)
    }
}

/// Where a canonical table's rows live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Storage {
    /// Created by `create_tables` and filled by the engine.
    Table,
    /// A filtered view over another canonical table.
    View { base: CanonicalTable, predicate: &'static str },
    /// Materialized with `CREATE TABLE AS` after the base tables are loaded.
    Derived,
}

/// Declaration order is drop order: base tables go first so that dropping
/// them cascades to the views over them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, Display, EnumIter, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum CanonicalTable {
    Point,
    Line,
    Polygon,
    Highway,
    Building,
    Boundary,
}

pub const HIGHWAY_PREDICATE: &str = "z_order IS NOT NULL AND z_order != 0";
pub const BUILDING_PREDICATE: &str = "building IS NOT NULL AND building != 'no'";

impl CanonicalTable {
    pub fn storage(&self, extended: bool) -> Storage {
        match (self, extended) {
            (_, true) => Storage::Table,
            (CanonicalTable::Highway, false) => {
                Storage::View { base: CanonicalTable::Line, predicate: HIGHWAY_PREDICATE }
            }
            (CanonicalTable::Building, false) => {
                Storage::View { base: CanonicalTable::Polygon, predicate: BUILDING_PREDICATE }
            }
            (CanonicalTable::Boundary, false) => Storage::Derived,
            _ => Storage::Table,
        }
    }

    pub fn is_point(&self) -> bool {
        *self == CanonicalTable::Point
    }
}

const POINT_RESERVED: &[&str] = &["osm_id", "quadtree", "tile", "minzoom", "tags", "way"];
const LINE_RESERVED: &[&str] =
    &["osm_id", "quadtree", "tile", "layer", "z_order", "minzoom", "tags", "length", "way"];
const POLYGON_RESERVED: &[&str] = &[
    "osm_id", "quadtree", "tile", "layer", "z_order", "minzoom", "tags", "way_area", "way", "way_point",
];
const BOUNDARY_COLUMNS: &[&str] =
    &["osm_id", "quadtree", "tile", "boundary", "admin_level", "name", "minzoom", "way_area", "way"];

struct ColumnList {
    columns: Vec<ColumnSpec>,
    reserved: &'static [&'static str],
}

impl ColumnList {
    fn new(reserved: &'static [&'static str]) -> Self {
        let columns = vec![
            ColumnSpec::new("osm_id", ColumnType::BigInteger, ColumnSource::OsmId),
            ColumnSpec::new("quadtree", ColumnType::BigInteger, ColumnSource::ObjectQuadtree),
            ColumnSpec::new("tile", ColumnType::BigInteger, ColumnSource::BlockQuadtree),
        ];
        ColumnList { columns, reserved }
    }

    /// First occurrence wins; tags never shadow structural columns.
    fn push_tags<'a, I: IntoIterator<Item = &'a str>>(&mut self, tags: I) {
        for tag in tags {
            if self.reserved.contains(&tag) || self.columns.iter().any(|c| c.name == tag) {
                continue;
            }
            self.columns.push(ColumnSpec::tag(tag));
        }
    }

    fn push(&mut self, name: &str, column_type: ColumnType, source: ColumnSource) {
        self.columns.push(ColumnSpec::new(name, column_type, source));
    }

    fn push_optional(&mut self, style: &Style, add_min_zoom: bool) {
        if add_min_zoom {
            self.push("minzoom", ColumnType::BigInteger, ColumnSource::MinZoom);
        }
        if style.other_tags {
            self.push("tags", ColumnType::Hstore, ColumnSource::OtherTags);
        }
    }
}

fn point_columns(style: &Style, add_min_zoom: bool) -> Vec<ColumnSpec> {
    let mut cols = ColumnList::new(POINT_RESERVED);
    cols.push_tags(style.node_keys());
    cols.push_tags(style.parent_tags.iter().map(String::as_str));
    cols.push_optional(style, add_min_zoom);
    cols.push("way", ColumnType::PointGeometry, ColumnSource::Geometry);
    cols.columns
}

fn line_columns(style: &Style, add_min_zoom: bool) -> Vec<ColumnSpec> {
    let mut cols = ColumnList::new(LINE_RESERVED);
    cols.push_tags(style.way_keys());
    cols.push_tags(style.relation_tag_spec.iter().map(|r| r.target_key.as_str()));
    cols.push("layer", ColumnType::BigInteger, ColumnSource::Layer);
    cols.push("z_order", ColumnType::BigInteger, ColumnSource::ZOrder);
    cols.push_optional(style, add_min_zoom);
    cols.push("length", ColumnType::Double, ColumnSource::Length);
    cols.push("way", ColumnType::LineGeometry, ColumnSource::Geometry);
    cols.columns
}

fn polygon_columns(style: &Style, add_min_zoom: bool, extended: bool) -> Vec<ColumnSpec> {
    let mut cols = ColumnList::new(POLYGON_RESERVED);
    cols.push_tags(style.way_keys());
    cols.push("layer", ColumnType::BigInteger, ColumnSource::Layer);
    cols.push("z_order", ColumnType::BigInteger, ColumnSource::ZOrder);
    cols.push_optional(style, add_min_zoom);
    cols.push("way_area", ColumnType::Double, ColumnSource::Area);
    cols.push("way", ColumnType::PolygonGeometry, ColumnSource::Geometry);
    if extended {
        cols.push("way_point", ColumnType::PointGeometry, ColumnSource::RepresentativePointGeometry);
    }
    cols.columns
}

/// Builds the table layout for one export. `point`, `line` and `polygon` are
/// always present; `extended` adds `highway`, `building` and `boundary`.
pub fn derive_tables(style: &Style, add_min_zoom: bool, extended: bool) -> Result<Vec<TableSpec>> {
    style.validate()?;

    let point = TableSpec::new("point", point_columns(style, add_min_zoom));
    let line = line_columns(style, add_min_zoom);
    let polygon = polygon_columns(style, add_min_zoom, extended);

    if !extended {
        return Ok(vec![point, TableSpec::new("line", line), TableSpec::new("polygon", polygon)]);
    }

    let building = polygon
        .iter()
        .filter(|c| c.source != ColumnSource::RepresentativePointGeometry)
        .cloned()
        .collect();
    let boundary = polygon
        .iter()
        .filter(|c| BOUNDARY_COLUMNS.contains(&c.name.as_str()))
        .cloned()
        .collect();

    Ok(vec![
        point,
        TableSpec::new("line", line.clone()),
        TableSpec::new("polygon", polygon),
        TableSpec::new("highway", line),
        TableSpec::new("building", building),
        TableSpec::new("boundary", boundary),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::style::RelationTagSpec;
    use rstest::rstest;

    fn names(spec: &TableSpec) -> Vec<&str> {
        spec.column_names().collect()
    }

    fn scenario_style() -> Style {
        Style::with_keys([("name", true, false), ("shop", true, false), ("highway", false, true)])
    }

    #[test]
    fn standard_layout() {
        let specs = derive_tables(&scenario_style(), true, false).unwrap();
        assert_eq!(specs.len(), 3);
        assert_eq!(names(&specs[0]), vec!["osm_id", "quadtree", "tile", "name", "shop", "minzoom", "way"]);
        assert_eq!(
            names(&specs[1]),
            vec!["osm_id", "quadtree", "tile", "highway", "layer", "z_order", "minzoom", "length", "way"]
        );
        assert_eq!(
            names(&specs[2]),
            vec!["osm_id", "quadtree", "tile", "highway", "layer", "z_order", "minzoom", "way_area", "way"]
        );
    }

    #[test]
    fn extended_layout() {
        let specs = derive_tables(&scenario_style(), true, true).unwrap();
        let tables: Vec<&str> = specs.iter().map(|s| s.table_name.as_str()).collect();
        assert_eq!(tables, vec!["point", "line", "polygon", "highway", "building", "boundary"]);
        assert_eq!(specs[3].columns, specs[1].columns);

        let polygon = &specs[2];
        assert_eq!(polygon.columns.last().unwrap().source, ColumnSource::RepresentativePointGeometry);
        assert!(!specs[4].has_column("way_point"));
        assert_eq!(specs[4].columns.len(), polygon.columns.len() - 1);

        let boundary = &specs[5];
        assert!(boundary.columns.len() < polygon.columns.len());
        assert!(boundary.columns.iter().all(|c| polygon.columns.contains(c)));
        assert_eq!(names(boundary), vec!["osm_id", "quadtree", "tile", "minzoom", "way_area", "way"]);
    }

    #[rstest]
    #[case(false, false)]
    #[case(true, false)]
    #[case(false, true)]
    #[case(true, true)]
    fn point_column_count(#[case] minzoom: bool, #[case] other_tags: bool) {
        let mut style = Style::with_keys([("amenity", true, true), ("name", true, true), ("oneway", false, true)]);
        style.other_tags = other_tags;
        style.parent_tags = vec!["route_ref".to_string()];
        style.relation_tag_spec = vec![RelationTagSpec { target_key: "route_name".to_string() }];
        let specs = derive_tables(&style, minzoom, false).unwrap();

        let optional = minzoom as usize + other_tags as usize;
        assert_eq!(specs[0].columns.len(), 3 + 2 + 1 + optional + 1);
        // line: identity, way tags, relation tags, layer, z_order, optional, length, way
        assert_eq!(specs[1].columns.len(), 3 + 3 + 1 + 2 + optional + 2);
        assert_eq!(specs[2].columns.len(), 3 + 3 + 2 + optional + 2);
        assert_eq!(specs[0].has_column("tags"), other_tags);
    }

    #[test]
    fn deterministic() {
        let style = Style::with_keys([("z", true, true), ("a", true, true), ("m", false, true)]);
        assert_eq!(derive_tables(&style, true, true).unwrap(), derive_tables(&style, true, true).unwrap());
        let specs = derive_tables(&style, false, false).unwrap();
        assert_eq!(&names(&specs[0])[3..5], &["a", "z"]);
    }

    #[test]
    fn duplicate_tags_keep_first() {
        let mut style = Style::with_keys([("name", true, true), ("layer", true, true)]);
        style.parent_tags = vec!["name".to_string(), "network".to_string()];
        style.relation_tag_spec = vec![RelationTagSpec { target_key: "name".to_string() }];
        let specs = derive_tables(&style, false, false).unwrap();
        assert_eq!(names(&specs[0]), vec!["osm_id", "quadtree", "tile", "layer", "name", "network", "way"]);
        assert_eq!(names(&specs[1]), vec!["osm_id", "quadtree", "tile", "name", "layer", "z_order", "length", "way"]);
    }

    #[test]
    fn empty_style_is_config_error() {
        assert!(matches!(derive_tables(&Style::default(), true, false), Err(ExportError::Config(_))));
    }

    #[test]
    fn boundary_columns_follow_style() {
        let style = Style::with_keys([("admin_level", false, true), ("boundary", false, true), ("name", true, true)]);
        let specs = derive_tables(&style, true, true).unwrap();
        assert_eq!(
            names(&specs[5]),
            vec!["osm_id", "quadtree", "tile", "admin_level", "boundary", "name", "minzoom", "way_area", "way"]
        );
    }

    #[test]
    fn json_round_trip_and_unknown_type() {
        let specs = derive_tables(&scenario_style(), true, true).unwrap();
        let text = TableSpec::to_json(&specs).unwrap();
        assert_eq!(TableSpec::from_json(&text).unwrap(), specs);

        let bad = r#"[{"table_name": "point", "columns": [{"name": "osm_id", "type": "Integer", "source": "OsmId"}]}]"#;
        assert!(matches!(TableSpec::from_json(bad), Err(ExportError::Schema(_))));
    }

    #[test]
    fn storage_policy() {
        assert_eq!(CanonicalTable::Highway.storage(true), Storage::Table);
        assert_eq!(CanonicalTable::Boundary.storage(false), Storage::Derived);
        assert!(matches!(
            CanonicalTable::Building.storage(false),
            Storage::View { base: CanonicalTable::Polygon, .. }
        ));
        assert_eq!("polygon".parse::<CanonicalTable>().unwrap(), CanonicalTable::Polygon);
        assert_eq!(CanonicalTable::Boundary.to_string(), "boundary");
    }
}
