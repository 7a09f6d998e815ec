//! JQL API Server
//!
//! Run with: cargo run --bin jql-api
//!
//! # Configuration
//!
//! Read from the first config file found (`$CONFIG/jql/config.toml`,
//! `/etc/jql/config.toml`, `./jql.toml`), then overridden by:
//! - `JQL_API_HOST`, `JQL_API_PORT`: Address to bind (default: 127.0.0.1:8040)
//! - `JQL_CATALOG_PATH`: Dataset metadata file
//! - `JQL_CATALOG_URL`: Metadata service returning the catalog as JSON
//! - `JQL_TIMEZONE_OFFSET_HOURS`: Zone of dates written without one (default: -6)
//! - `RUST_LOG`: Log filter (default: jql=info,tower_http=debug)

use jql::api::{serve, AppState};
use jql::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load_default();
    config.logging.init(&["tower_http=debug"]);

    tracing::info!("Starting JQL API server v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        timezone_offset_hours = config.compile.timezone_offset_hours,
        legacy_mode = config.compile.legacy_mode,
        "Compile settings"
    );

    let state = AppState::from_config(&config);
    match state.catalog().await {
        Ok(catalog) => tracing::info!(
            source = state.source.name(),
            datasets = catalog.len(),
            "Dataset catalog available"
        ),
        Err(e) => tracing::warn!(
            source = state.source.name(),
            "Dataset catalog not available yet: {}",
            e
        ),
    }

    serve(state, &config.api).await?;

    tracing::info!("JQL API server stopped");
    Ok(())
}
