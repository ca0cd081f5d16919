//! plateau-feed CLI entry point

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};
use plateau_feed::{
    commands::{
        cmd_ingest_dir, cmd_init, cmd_query, cmd_serve, cmd_stats, cmd_verify, print_ingest_stats,
        print_query_summary, print_stats, print_verify_report, IngestOptions, InitOptions,
        QueryOptions,
    },
    config::Config,
    error::{Error, Result},
    geom::{BBox, CoordBounds},
    progress::LogWriterFactory,
    store::{BuildingDb, Predicate},
};
use std::path::PathBuf;
use tracing::error;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "plateau-feed")]
#[command(version, about = "PLATEAU building footprints as OSM XML for MapWithAI/RapiD", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize configuration and database
    Init {
        /// Force overwrite existing config
        #[arg(long)]
        force: bool,
    },

    /// Import one municipality directory of .osm/.zip files
    Ingest {
        /// Directory holding the municipality's source files
        dir: PathBuf,

        /// Municipality code (defaults to the directory's 5-digit prefix)
        #[arg(long)]
        citycode: Option<String>,

        /// Valid coordinate envelope: min_lat,max_lat,min_lon,max_lon
        #[arg(long, allow_hyphen_values = true)]
        coord_bounds: Option<CoordBounds>,

        /// Keep footprints that duplicate an existing building's geometry
        #[arg(long)]
        no_dedupe: bool,
    },

    /// Run the HTTP API
    Serve {
        /// Address to listen on (overrides server.bind)
        #[arg(long, env = "PLATEAU_FEED_BIND")]
        bind: Option<String>,
    },

    /// Query buildings in a bounding box and write OSM XML
    Query {
        /// min_lon,min_lat,max_lon,max_lat
        #[arg(long, allow_hyphen_values = true)]
        bbox: BBox,

        /// Maximum number of buildings
        #[arg(short, long)]
        limit: Option<usize>,

        /// intersects or contains-centroid
        #[arg(long, default_value = "intersects")]
        predicate: Predicate,

        /// Write the document to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show building counts and recent ingestion runs
    Stats,

    /// Check stored node runs and spatial indexes
    Verify,

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!("{}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(LogWriterFactory::default()))
        .with(filter)
        .init();

    // Handle init command specially (doesn't need existing config)
    if let Commands::Init { force } = cli.command {
        return handle_init(cli.config, force, cli.json).await;
    }

    // Handle completions command (doesn't need config/db)
    if let Commands::Completions { shell } = cli.command {
        let mut cmd = Cli::command();
        generate(shell, &mut cmd, "plateau-feed", &mut std::io::stdout());
        return Ok(());
    }

    // Load configuration
    let config = load_config(cli.config.as_deref()).await?;

    let db = BuildingDb::connect(&config).await?;
    if !db.is_initialized().await? {
        return Err(Error::NotInitialized);
    }

    // Handle commands
    match cli.command {
        Commands::Init { .. } | Commands::Completions { .. } => unreachable!(),

        Commands::Ingest {
            dir,
            citycode,
            coord_bounds,
            no_dedupe,
        } => {
            let options = IngestOptions {
                citycode,
                bounds: coord_bounds,
                dedupe_geometry: no_dedupe.then_some(false),
            };
            let stats = cmd_ingest_dir(&config, &db, &dir, options).await?;

            if cli.json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                print_ingest_stats(&stats);
            }
        }

        Commands::Serve { bind } => {
            cmd_serve(config, db, bind).await?;
        }

        Commands::Query {
            bbox,
            limit,
            predicate,
            output,
        } => {
            let to_file = output.is_some();
            let options = QueryOptions {
                bbox,
                limit,
                predicate,
                output,
            };
            let summary = cmd_query(&config, &db, options).await?;

            if cli.json {
                if to_file {
                    println!("{}", serde_json::to_string_pretty(&summary)?);
                } else {
                    eprintln!("{}", serde_json::to_string_pretty(&summary)?);
                }
            } else {
                print_query_summary(&summary);
            }
        }

        Commands::Stats => {
            let status = cmd_stats(&config, &db).await?;

            if cli.json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                print_stats(&status);
            }
        }

        Commands::Verify => {
            let report = cmd_verify(&db).await?;

            if cli.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_verify_report(&report);
            }

            if !report.is_ok() {
                return Err(Error::Integrity(report.issues.len()));
            }
        }
    }

    Ok(())
}

async fn handle_init(config: Option<PathBuf>, force: bool, json: bool) -> Result<()> {
    // Get the base directory: if user specifies config file, use its parent dir
    // Otherwise use default base dir
    let (base_dir, config_path) = if let Some(path) = config {
        if path.extension().map_or(false, |e| e == "toml") {
            let base = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("."));
            (base, path)
        } else {
            (path.clone(), path.join("config.toml"))
        }
    } else {
        let base = Config::default_base_dir();
        (base.clone(), base.join("config.toml"))
    };

    if config_path.exists() && !force {
        eprintln!(
            "Config file already exists at: {}\nUse --force to overwrite.",
            config_path.display()
        );
        std::process::exit(1);
    }

    let info = cmd_init(InitOptions {
        base_dir,
        config_path,
        force,
    })
    .await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&info)?);
        return Ok(());
    }

    println!("✓ plateau-feed initialized successfully");
    println!("  Config: {}", info.config_path);
    println!("  Database: {}", info.db_path);
    println!("\nNext steps:");
    println!("  1. Edit the config file to customize settings");
    println!("  2. Import a municipality: plateau-feed ingest ./data/31202_yonago");
    println!("  3. Serve the feed: plateau-feed serve");

    Ok(())
}

async fn load_config(path: Option<&std::path::Path>) -> Result<Config> {
    let config_path = path
        .map(PathBuf::from)
        .unwrap_or_else(Config::default_config_path);

    if !config_path.exists() {
        eprintln!(
            "Config file not found: {}\nRun 'plateau-feed init' first.",
            config_path.display()
        );
        std::process::exit(1);
    }

    Config::load(&config_path)
}
