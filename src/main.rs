//! # Shopfinder CLI (`shopfinder`)
//!
//! ## Usage
//!
//! ```bash
//! shopfinder --config ./config/shopfinder.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `shopfinder init` | Create the backend schema or index |
//! | `shopfinder import <json>` | Insert shops from a JSON array |
//! | `shopfinder nearest <lat> <lon>` | Shops within a radius |
//! | `shopfinder search "<text>"` | Keyword search |
//! | `shopfinder query "<expr>"` | Advanced boolean query |
//! | `shopfinder get <id>` | Show one shop |
//! | `shopfinder suggest <key>` | Keyword suggestions |
//! | `shopfinder districts` | List districts |
//! | `shopfinder stats` | Counts for the configured backend |
//! | `shopfinder fill-info` | Geocode shops with no location |
//! | `shopfinder migrate-index <dir>` | Copy all shops into a search index |
//! | `shopfinder serve` | Start the HTTP server |

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use shopfinder::{commands, config, server};

/// Shopfinder: a shop directory with proximity, keyword and boolean search.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/shopfinder.example.toml` for a full example.
#[derive(Parser)]
#[command(name = "shopfinder", version)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/shopfinder.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the backend schema (or search index). Safe to run repeatedly.
    Init,

    /// Insert shops from a JSON file holding an array of shop objects.
    ///
    /// Ids in the file are ignored; the backend assigns new ones.
    Import {
        /// Path to the JSON file.
        path: PathBuf,
    },

    /// List open shops within a radius of a point, nearest first.
    Nearest {
        lat: f64,
        lon: f64,

        /// Radius such as `500m`, `1km` or `1.5km`.
        #[arg(long, default_value = server::DEFAULT_RADIUS)]
        radius: String,
    },

    /// Keyword search over tags, names and districts.
    ///
    /// A single word matches a tag, a district, or part of a name. Several
    /// words must all be tags of the shop.
    Search {
        text: String,
    },

    /// Advanced query: `term`, `"a phrase"`, `-excluded`, `a OR b`, and
    /// `name:` / `district:` / `type:` / `tag:` prefixes.
    Query {
        expr: String,
    },

    /// Show one shop by id.
    Get {
        id: i64,
    },

    /// Suggest known tags close to `key`.
    Suggest {
        key: String,
    },

    /// List the districts that have open shops.
    Districts,

    /// Print shop counts for the configured backend.
    Stats,

    /// Geocode every open shop that has no location yet.
    ///
    /// Shops that cannot be geocoded are reported and skipped; the rest
    /// are saved.
    FillInfo,

    /// Copy every shop from the configured backend into a tantivy index.
    MigrateIndex {
        /// Directory for the index. Created if missing.
        dir: PathBuf,
    },

    /// Start the HTTP server on `[server].bind`.
    Serve,
}

fn init_logging() {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "shopfinder=info,sqlx=warn,tantivy=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging();

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => commands::run_init(&cfg).await?,
        Commands::Import { path } => commands::run_import(&cfg, &path).await?,
        Commands::Nearest { lat, lon, radius } => {
            commands::run_nearest(&cfg, lat, lon, &radius).await?
        }
        Commands::Search { text } => commands::run_search(&cfg, &text).await?,
        Commands::Query { expr } => commands::run_query(&cfg, &expr).await?,
        Commands::Get { id } => commands::run_get(&cfg, id).await?,
        Commands::Suggest { key } => commands::run_suggest(&cfg, &key).await?,
        Commands::Districts => commands::run_districts(&cfg).await?,
        Commands::Stats => commands::run_stats(&cfg).await?,
        Commands::FillInfo => commands::run_fill_info(&cfg).await?,
        Commands::MigrateIndex { dir } => commands::run_migrate_index(&cfg, &dir).await?,
        Commands::Serve => server::run_server(&cfg).await?,
    }

    Ok(())
}
