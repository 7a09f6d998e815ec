//! JQL compiler
//!
//! Compiles one query and prints the command list as JSON.
//!
//! ```text
//! jql [--catalog datasets.toml] [--config jql.toml] "FROM jobsearch 1d today SELECT count()"
//! echo "FROM ..." | jql -
//! ```

use anyhow::Context;
use clap::Parser;
use std::io::Read;
use std::path::PathBuf;

use jql::catalog::{source_from_config, DatasetCatalog};
use jql::config::Config;
use jql::query::Compiler;

#[derive(Parser)]
#[command(name = "jql")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Compile a JQL query into engine commands")]
struct Args {
    /// Query text, or `-` to read it from stdin
    query: String,

    /// Dataset metadata file, overrides the configured catalog
    #[arg(short, long)]
    catalog: Option<PathBuf>,

    /// Config file (default: search the usual locations)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Print compact JSON
    #[arg(long)]
    compact: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = match &args.config {
        Some(path) => Config::load_with_env(path)?,
        None => Config::load_default(),
    };
    config.logging.init(&[]);

    let query = if args.query == "-" {
        let mut text = String::new();
        std::io::stdin()
            .read_to_string(&mut text)
            .context("Failed to read query from stdin")?;
        text
    } else {
        args.query
    };

    let catalog = match &args.catalog {
        Some(path) => DatasetCatalog::load(path)
            .with_context(|| format!("Failed to load catalog {}", path.display()))?,
        None => source_from_config(&config.catalog).fetch().await?,
    };

    let compiler = Compiler::new(catalog, config.compile);
    let compiled = compiler.compile(&query)?;

    for warning in &compiled.warnings {
        tracing::warn!("{}", warning);
    }

    let output = if args.compact {
        serde_json::to_string(&compiled.commands)?
    } else {
        serde_json::to_string_pretty(&compiled.commands)?
    };
    println!("{}", output);
    Ok(())
}
