//! JQL CLI
//!
//! Command-line interface for JQL operations:
//! - Compile queries locally
//! - Inspect the parse of a query, doc metric or doc filter
//! - Render engine results as TSV or JSON
//! - Compile through a running API server

use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use std::io::Read;
use std::path::PathBuf;

use jql::catalog::{source_from_config, DatasetCatalog};
use jql::config::Config;
use jql::execution::{render_json, write_tsv, ResultRow};
use jql::query::{parse_doc_filter, parse_doc_metric, parse_query, CompiledQuery, Compiler};

#[derive(Parser)]
#[command(name = "jql-cli")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Compile and inspect JQL queries")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// API server URL
    #[arg(long, default_value = "http://localhost:8040", global = true)]
    pub api_url: String,

    /// Config file (default: search the usual locations)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Output format
    #[arg(short, long, value_enum, default_value = "table", global = true)]
    pub format: OutputFormat,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Table,
    Json,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ParseTarget {
    Query,
    Metric,
    Filter,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum RenderFormat {
    Tsv,
    Json,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Compile a query against a catalog
    Compile {
        /// Query text, or `-` for stdin
        query: String,
        /// Dataset metadata file, overrides the configured catalog
        #[arg(short, long)]
        catalog: Option<PathBuf>,
    },

    /// Print the syntax tree of a query, doc metric or doc filter
    Parse {
        /// Text to parse, or `-` for stdin
        text: String,
        #[arg(short, long, value_enum, default_value = "query")]
        target: ParseTarget,
    },

    /// Render result rows (`[{"keys": [...], "stats": [...]}]`)
    Render {
        /// JSON rows file (default: stdin)
        input: Option<PathBuf>,
        #[arg(short = 'o', long, value_enum, default_value = "tsv")]
        output_format: RenderFormat,
        /// Output file (default: stdout)
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Generate default config file
    Config {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Compile through a running API server
    Remote {
        /// Query text, or `-` for stdin
        query: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => Config::load_with_env(path)?,
        None => Config::load_default(),
    };
    config.logging.init(&[]);

    match cli.command {
        Commands::Compile { query, catalog } => {
            let query = read_text(query)?;
            let catalog = match catalog {
                Some(path) => DatasetCatalog::load(&path)
                    .with_context(|| format!("Failed to load catalog {}", path.display()))?,
                None => source_from_config(&config.catalog).fetch().await?,
            };

            let compiled = Compiler::new(catalog, config.compile).compile(&query)?;
            match cli.format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&compiled.commands)?),
                OutputFormat::Table => print_compiled(&compiled)?,
            }
        }

        Commands::Parse { text, target } => {
            let text = read_text(text)?;
            let tree = match target {
                ParseTarget::Query => format!("{:#?}", parse_query(&text)?),
                ParseTarget::Metric => format!("{:#?}", parse_doc_metric(&text)?),
                ParseTarget::Filter => format!("{:#?}", parse_doc_filter(&text)?),
            };
            println!("{}", tree);
        }

        Commands::Render {
            input,
            output_format,
            output,
        } => {
            let text = match input {
                Some(path) => std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read {}", path.display()))?,
                None => read_text("-".to_string())?,
            };
            let rows: Vec<ResultRow> = serde_json::from_str(&text).context("Invalid result rows")?;

            match (output_format, output) {
                (RenderFormat::Tsv, Some(path)) => {
                    let file = std::fs::File::create(&path)?;
                    write_tsv(&rows, file)?;
                    eprintln!("Rendered {} rows to {:?}", rows.len(), path);
                }
                (RenderFormat::Tsv, None) => write_tsv(&rows, std::io::stdout().lock())?,
                (RenderFormat::Json, Some(path)) => {
                    std::fs::write(&path, render_json(&rows)?)?;
                    eprintln!("Rendered {} rows to {:?}", rows.len(), path);
                }
                (RenderFormat::Json, None) => println!("{}", render_json(&rows)?),
            }
        }

        Commands::Config { output } => {
            let config = jql::config::generate_default_config();

            match output {
                Some(path) => {
                    if let Some(parent) = path.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    std::fs::write(&path, &config)?;
                    println!("Config written to {:?}", path);
                }
                None => {
                    print!("{}", config);
                }
            }
        }

        Commands::Remote { query } => {
            let query = read_text(query)?;
            let client = reqwest::Client::new();
            let response = client
                .post(format!("{}/api/v1/compile", cli.api_url))
                .json(&serde_json::json!({ "query": query }))
                .send()
                .await
                .with_context(|| format!("Cannot connect to JQL API at {}", cli.api_url))?;

            let status = response.status();
            let body: serde_json::Value = response.json().await?;
            if !status.is_success() {
                eprintln!(
                    "Compile failed ({}): {}",
                    status,
                    body["error"]["message"].as_str().unwrap_or("unknown error")
                );
                if let Some(details) = body["error"]["details"].as_array() {
                    for detail in details {
                        eprintln!("  {}", detail.as_str().unwrap_or_default());
                    }
                }
                std::process::exit(1);
            }

            match cli.format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&body["commands"])?),
                OutputFormat::Table => {
                    let commands = body["commands"].as_array().cloned().unwrap_or_default();
                    for (i, command) in commands.iter().enumerate() {
                        println!("{:>3}  {}", i, command["command"].as_str().unwrap_or("-"));
                    }
                    print_warnings(body["warnings"].as_array().into_iter().flatten().filter_map(|w| w.as_str()));
                    println!();
                    println!("Cache file: {}", body["cache_key"]["file_name"].as_str().unwrap_or("-"));
                }
            }
        }
    }

    Ok(())
}

/// `-` reads stdin
fn read_text(arg: String) -> anyhow::Result<String> {
    if arg != "-" {
        return Ok(arg);
    }
    let mut text = String::new();
    std::io::stdin()
        .read_to_string(&mut text)
        .context("Failed to read stdin")?;
    if text.trim().is_empty() {
        bail!("Nothing to read on stdin");
    }
    Ok(text)
}

fn print_compiled(compiled: &CompiledQuery) -> anyhow::Result<()> {
    println!("{:>3}  {}", "#", "Command");
    println!("{}", "-".repeat(40));
    for (i, command) in compiled.commands.iter().enumerate() {
        let value = serde_json::to_value(command)?;
        println!("{:>3}  {}", i, value["command"].as_str().unwrap_or("-"));
    }
    print_warnings(compiled.warnings.iter().map(String::as_str));
    println!();
    for dataset in &compiled.datasets {
        println!(
            "Dataset: {} [{} .. {})",
            dataset.dataset,
            dataset.start.map(|t| t.to_rfc3339()).unwrap_or_else(|| "-".into()),
            dataset.end.map(|t| t.to_rfc3339()).unwrap_or_else(|| "-".into()),
        );
    }
    if let Some(limit) = compiled.row_limit {
        println!("Row limit: {}", limit);
    }
    println!("Cache file: {}", compiled.cache_key.file_name);
    Ok(())
}

fn print_warnings<'a>(warnings: impl Iterator<Item = &'a str>) {
    let mut warnings = warnings.peekable();
    if warnings.peek().is_none() {
        return;
    }
    println!();
    println!("Warnings:");
    for warning in warnings {
        println!("  {}", warning);
    }
}
