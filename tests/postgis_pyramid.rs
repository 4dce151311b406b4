use postgres::{Client, NoTls};

use tilepg::ddl::create_tables;
use tilepg::pyramid::{materialize_low_zoom_tables, ZoomTier};
use tilepg::style::Style;
use tilepg::tablespec::derive_tables;

const SOURCE: &str = "tilepg_it_";
const TARGET: &str = "tilepg_it_z6_";

fn connect() -> Option<Client> {
    let url = std::env::var("TILEPG_TEST_DATABASE").ok()?;
    Some(Client::connect(&url, NoTls).expect("connect to TILEPG_TEST_DATABASE"))
}

#[test]
fn materialized_tier_keeps_low_zoom_polygons() {
    let mut client = match connect() {
        Some(c) => c,
        None => return,
    };
    client
        .batch_execute("CREATE EXTENSION IF NOT EXISTS postgis; CREATE EXTENSION IF NOT EXISTS hstore")
        .unwrap();

    let style = Style::with_keys([("name", true, true), ("building", false, true)]);
    let specs = derive_tables(&style, true, false).unwrap();
    create_tables(&mut client, SOURCE, &specs).unwrap();

    let minzooms = [2, 4, 6, 7, 8, 9, 10, 11, 12, 13];
    for (i, z) in minzooms.iter().enumerate() {
        client
            .execute(
                "INSERT INTO tilepg_it_polygon (osm_id, name, minzoom, way_area, way) \
                 VALUES ($1, 'p', $2, 0, ST_SetSRID(ST_Buffer(ST_MakePoint($3, 0), 1000, 32), 3857))",
                &[&(i as i64), &(*z as i64), &(i as f64 * 5000.0)],
            )
            .unwrap();
    }

    let tier = ZoomTier::new(6, &["polygon"]).simplify(50.0);
    materialize_low_zoom_tables(&mut client, SOURCE, TARGET, &tier, false).unwrap();

    let count: i64 = client.query_one("SELECT count(*) FROM tilepg_it_z6_polygon", &[]).unwrap().get(0);
    assert_eq!(count, 3);

    let unsimplified: i64 = client
        .query_one(
            "SELECT count(*) FROM tilepg_it_z6_polygon d JOIN tilepg_it_polygon s USING (osm_id) \
             WHERE ST_NPoints(d.way) >= ST_NPoints(s.way)",
            &[],
        )
        .unwrap()
        .get(0);
    assert_eq!(unsimplified, 0);

    let indices: Vec<String> = client
        .query("SELECT indexname FROM pg_indexes WHERE tablename = 'tilepg_it_z6_polygon' ORDER BY 1", &[])
        .unwrap()
        .iter()
        .map(|r| r.get(0))
        .collect();
    assert_eq!(indices, vec!["tilepg_it_z6_polygon_id", "tilepg_it_z6_polygon_way"]);

    client
        .batch_execute("DROP TABLE IF EXISTS tilepg_it_z6_polygon CASCADE")
        .unwrap();
    tilepg::ddl::drop_tables(&mut client, SOURCE).unwrap();
}
