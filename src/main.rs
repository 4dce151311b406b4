use std::error::Error;
use clap::{Parser, Subcommand, Args};
use simple_logger::SimpleLogger;
use log::{info, warn};
use postgres::{Client, NoTls};

use tilepg::ddl::table_create_statement;
use tilepg::engine::BatchFileReplay;
use tilepg::export::{normalize_prefix, Export, ExportConfig, LowZoomConfig};
use tilepg::orchestrator::{IndexOptions, Orchestrator};
use tilepg::pyramid::{create_low_zoom_views, derive_standard_objects, materialize_low_zoom_tables, ZoomTier};
use tilepg::sql::Catalog;
use tilepg::style::Style;
use tilepg::tablespec::{derive_tables, TableSpec};

#[derive(Parser)]
#[clap(author, version, about, long_about = None)]
#[clap(propagate_version = true)]
struct Cli {
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the tables derived from a style
    Schema(Schema),
    /// Load batch files into PostgreSQL, or rewrite them under a new prefix
    Export(ExportArgs),
    /// Create indices and views on loaded tables
    Indices(Indices),
    /// Build one low zoom tier from loaded tables
    Lowzoom(Lowzoom),
}

#[derive(Args)]
struct Schema {
    /// Style file (JSON)
    #[clap(short, long)]
    style: String,

    /// Table prefix
    #[clap(short, long, default_value = "osm")]
    prefix: String,

    /// Add the minzoom column
    #[clap(long)]
    minzoom: bool,

    /// Use the extended table set
    #[clap(long)]
    extended: bool,

    /// Print table specs as JSON instead of DDL
    #[clap(long)]
    json: bool,
}

#[derive(Args)]
struct ExportArgs {
    /// Style file (JSON)
    #[clap(short, long)]
    style: String,

    /// Prefix of the batch files to read ({input}{table}.csv.gz)
    #[clap(short, long)]
    input: String,

    /// Target PostgreSQL connection string
    #[clap(short, long)]
    connectionstring: Option<String>,

    /// Table prefix
    #[clap(short, long, default_value = "osm")]
    prefix: String,

    /// Prefix of batch files to write when no connection is given
    #[clap(short, long)]
    output: Option<String>,

    /// Rows per block
    #[clap(long, default_value_t = 100000)]
    block_rows: usize,

    #[clap(long)]
    minzoom: bool,

    #[clap(long)]
    extended: bool,

    /// Create indices after loading
    #[clap(long)]
    indices: bool,

    #[clap(long)]
    extra_indices: bool,

    /// Create planet_osm_* compatibility views
    #[clap(long)]
    planet: bool,

    #[clap(long)]
    vacuum: bool,

    /// Low zoom tier as PREFIX:MINZOOM[:SIMPLIFY], materialized as tables
    #[clap(long, value_parser = parse_lowzoom)]
    lowzoom: Vec<LowZoomConfig>,
}

#[derive(Args)]
struct Indices {
    /// Target PostgreSQL connection string
    #[clap(short, long)]
    connectionstring: String,

    #[clap(short, long, default_value = "osm")]
    prefix: String,

    /// Style file, needed for the extended table set
    #[clap(short, long)]
    style: Option<String>,

    /// The tables carry the minzoom column
    #[clap(long)]
    minzoom: bool,

    #[clap(long)]
    extended: bool,

    #[clap(long)]
    extra_indices: bool,

    #[clap(long)]
    planet: bool,

    #[clap(long)]
    vacuum: bool,
}

#[derive(Args)]
struct Lowzoom {
    /// Target PostgreSQL connection string
    #[clap(short, long)]
    connectionstring: String,

    /// Prefix of the loaded tables
    #[clap(short, long, default_value = "osm")]
    source: String,

    /// Prefix of the tier
    #[clap(short, long)]
    target: String,

    #[clap(short, long)]
    minzoom: i64,

    /// Tables to include. Standard-set view tiers may also name highway, building, boundary and roads
    #[clap(long, value_delimiter = ',', default_value = "point,line,polygon")]
    tables: Vec<String>,

    /// Create views instead of tables
    #[clap(long)]
    views: bool,

    /// Simplification tolerance for line and polygon tables
    #[clap(long)]
    simplify: Option<f64>,

    /// Columns to keep in materialized tables
    #[clap(long, value_delimiter = ',')]
    columns: Vec<String>,

    /// Create partial indices for views
    #[clap(long)]
    indices: bool,

    #[clap(long)]
    extended: bool,
}

fn parse_lowzoom(s: &str) -> Result<LowZoomConfig, String> {
    let parts: Vec<&str> = s.split(':').collect();
    if parts.len() < 2 || parts.len() > 3 {
        return Err(format!("expected PREFIX:MINZOOM[:SIMPLIFY], got {}", s));
    }
    let minzoom = parts[1].parse::<i64>().map_err(|e| e.to_string())?;
    let simplify = match parts.get(2) {
        Some(t) => Some(t.parse::<f64>().map_err(|e| e.to_string())?),
        None => None,
    };
    Ok(LowZoomConfig { prefix: parts[0].to_string(), minzoom, as_tables: true, simplify, with_indices: true })
}

fn schema(args: &Schema) -> Result<(), Box<dyn Error>> {
    let style = Style::from_path(&args.style)?;
    let specs = derive_tables(&style, args.minzoom, args.extended)?;
    if args.json {
        println!("{}", TableSpec::to_json(&specs)?);
    } else {
        let prefix = normalize_prefix(&args.prefix);
        for spec in &specs {
            println!("{};", table_create_statement(&prefix, spec)?);
        }
    }
    Ok(())
}

fn export(args: &ExportArgs) -> Result<(), Box<dyn Error>> {
    let style = Style::from_path(&args.style)?;
    let config = ExportConfig {
        table_prefix: args.prefix.clone(),
        connection: args.connectionstring.clone(),
        output_prefix: args.output.clone(),
        add_minzoom: args.minzoom,
        extended: args.extended,
        write_indices: args.indices,
        extra_indices: args.extra_indices,
        planet_views: args.planet,
        vacuum: args.vacuum,
        lowzoom: args.lowzoom.clone(),
    };
    let mut export = Export::plan(&style, config)?;
    let mut engine = BatchFileReplay::new(&args.input, args.block_rows);
    let report = match &args.connectionstring {
        Some(cs) => {
            let mut client = Client::connect(cs, NoTls)?;
            export.run_direct(&mut client, &mut engine)?
        }
        None => export.run_to_writer(&mut engine)?.0,
    };
    for e in &report.errors {
        warn!("{}: {}", e.table, e.message);
    }
    info!("Exported {} rows with {} errors", report.rows, report.errors.len());
    Ok(())
}

fn indices(args: &Indices) -> Result<(), Box<dyn Error>> {
    let prefix = normalize_prefix(&args.prefix);
    let mut client = Client::connect(&args.connectionstring, NoTls)?;
    let catalog = Catalog::new();
    let orch = Orchestrator::new(&catalog);
    let options = IndexOptions { extra: args.extra_indices, planet: args.planet, vacuum: args.vacuum };
    if args.extended {
        let path = args.style.as_ref().ok_or("--extended needs --style")?;
        let specs = derive_tables(&Style::from_path(path)?, args.minzoom, true)?;
        orch.create_extended_indices(&mut client, &prefix, &specs, options)?;
    } else {
        orch.create_indices(&mut client, &prefix, options)?;
    }
    Ok(())
}

fn lowzoom(args: &Lowzoom) -> Result<(), Box<dyn Error>> {
    let source = normalize_prefix(&args.source);
    let target = normalize_prefix(&args.target);
    let mut client = Client::connect(&args.connectionstring, NoTls)?;
    if args.views {
        create_low_zoom_views(&mut client, &source, &target, args.minzoom, &args.tables, args.indices, args.extended)?;
    } else {
        let mut tier = ZoomTier::new(args.minzoom, &args.tables);
        if let Some(t) = args.simplify {
            tier = tier.simplify(t);
        }
        if !args.columns.is_empty() {
            tier = tier.columns(&args.columns);
        }
        materialize_low_zoom_tables(&mut client, &source, &target, &tier, args.extended)?;
        let has_base = ["line", "polygon"].iter().all(|t| args.tables.iter().any(|n| n == t));
        if !args.extended && has_base && args.columns.is_empty() {
            derive_standard_objects(&mut client, &target, &Catalog::new())?;
        }
    }
    Ok(())
}

fn main() -> Result<(), Box<dyn Error>> {
    SimpleLogger::new().env().init()?;
    let cli = Cli::parse();
    info!("Initializing");
    match &cli.command {
        Commands::Schema(args) => schema(args)?,
        Commands::Export(args) => export(args)?,
        Commands::Indices(args) => indices(args)?,
        Commands::Lowzoom(args) => lowzoom(args)?,
    }
    info!("Done!");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn indices_args(extra: &[&str]) -> Indices {
        let mut argv = vec!["tilepg", "indices", "-c", "host=localhost", "--extended", "-s", "style.json"];
        argv.extend_from_slice(extra);
        match Cli::try_parse_from(argv).unwrap().command {
            Commands::Indices(args) => args,
            _ => panic!("expected indices"),
        }
    }

    #[test]
    fn indices_minzoom_is_opt_in() {
        assert!(!indices_args(&[]).minzoom);
        assert!(indices_args(&["--minzoom"]).minzoom);
    }

    #[test]
    fn lowzoom_values() {
        let lz = parse_lowzoom("z6:6:50").unwrap();
        assert_eq!((lz.prefix.as_str(), lz.minzoom, lz.simplify), ("z6", 6, Some(50.0)));
        assert!(parse_lowzoom("z6").is_err());
    }
}
