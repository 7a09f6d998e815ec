//! Configuration System
//!
//! Handles loading configuration from files and environment variables.
//! Supports TOML config files and `JQL_*` environment variable overrides.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub compile: CompileConfig,

    #[serde(default)]
    pub catalog: CatalogConfig,

    #[serde(default)]
    pub api: ApiConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Compiler settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CompileConfig {
    /// Offset from UTC used for dates written without a zone
    #[serde(default = "default_timezone_offset")]
    pub timezone_offset_hours: i32,

    /// Row limit applied when a query has no `LIMIT`
    #[serde(default)]
    pub row_limit: Option<u64>,

    #[serde(default)]
    pub legacy_mode: bool,

    /// Denominator of `sample(f, n)` when none is given
    #[serde(default = "default_sample_denominator")]
    pub default_sample_denominator: u64,

    /// Largest number of groups a single grouping stage may create
    #[serde(default = "default_group_limit")]
    pub group_limit: u64,

    /// `tsv` or `json`
    #[serde(default = "default_result_format")]
    pub result_format: String,
}

fn default_timezone_offset() -> i32 {
    -6
}

fn default_sample_denominator() -> u64 {
    100
}

fn default_group_limit() -> u64 {
    1_000_000
}

fn default_result_format() -> String {
    "tsv".to_string()
}

impl Default for CompileConfig {
    fn default() -> Self {
        Self {
            timezone_offset_hours: default_timezone_offset(),
            row_limit: None,
            legacy_mode: false,
            default_sample_denominator: default_sample_denominator(),
            group_limit: default_group_limit(),
            result_format: default_result_format(),
        }
    }
}

/// Where dataset metadata comes from
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CatalogConfig {
    /// Metadata file, `.toml` or `.json`
    #[serde(default)]
    pub path: Option<String>,

    /// Metadata service returning the catalog as JSON
    #[serde(default)]
    pub url: Option<String>,
}

/// API server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApiConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_cors_enabled")]
    pub cors_enabled: bool,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8040
}

fn default_cors_enabled() -> bool {
    true
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_enabled: default_cors_enabled(),
        }
    }
}

impl ApiConfig {
    /// Get the socket address string
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// `pretty` or `json`
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl LoggingConfig {
    /// Install the global subscriber. `RUST_LOG` wins over the configured
    /// level; `extra` adds directives such as `tower_http=debug`.
    pub fn init(&self, extra: &[&str]) {
        use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

        let mut directives = vec![format!("jql={}", self.level)];
        directives.extend(extra.iter().map(|d| d.to_string()));
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(directives.join(",")));

        let registry = tracing_subscriber::registry().with(filter);
        let result = if self.format == "json" {
            registry
                .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
                .try_init()
        } else {
            registry
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .try_init()
        };
        if let Err(e) = result {
            eprintln!("Logging already initialised: {}", e);
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        let config: Config = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        Ok(config)
    }

    /// Load configuration from environment variables only
    pub fn from_env() -> Self {
        let mut config = Config::default();
        config.apply_env_overrides();
        config
    }

    /// Load configuration with environment variable overrides
    pub fn load_with_env(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from default locations or environment
    pub fn load_default() -> Self {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("jql").join("config.toml")),
            Some(PathBuf::from("/etc/jql/config.toml")),
            Some(PathBuf::from("./jql.toml")),
        ];

        for path_opt in config_paths.iter().flatten() {
            if path_opt.exists() {
                match Self::load_with_env(path_opt) {
                    Ok(config) => {
                        tracing::info!("Loaded config from {:?}", path_opt);
                        return config;
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load config from {:?}: {}", path_opt, e);
                    }
                }
            }
        }

        tracing::info!("Using default config with environment overrides");
        Self::from_env()
    }

    /// Apply environment variable overrides to an existing config
    fn apply_env_overrides(&mut self) {
        if let Ok(offset) = std::env::var("JQL_TIMEZONE_OFFSET_HOURS") {
            match offset.parse() {
                Ok(hours) => self.compile.timezone_offset_hours = hours,
                Err(_) => tracing::warn!("Ignoring invalid JQL_TIMEZONE_OFFSET_HOURS: {}", offset),
            }
        }
        if let Ok(limit) = std::env::var("JQL_ROW_LIMIT") {
            if let Ok(l) = limit.parse() {
                self.compile.row_limit = Some(l);
            }
        }
        if let Ok(legacy) = std::env::var("JQL_LEGACY_MODE") {
            self.compile.legacy_mode = matches!(legacy.as_str(), "1" | "true" | "yes");
        }
        if let Ok(format) = std::env::var("JQL_RESULT_FORMAT") {
            self.compile.result_format = format;
        }

        if let Ok(path) = std::env::var("JQL_CATALOG_PATH") {
            self.catalog.path = Some(path);
        }
        if let Ok(url) = std::env::var("JQL_CATALOG_URL") {
            self.catalog.url = Some(url);
        }

        if let Ok(host) = std::env::var("JQL_API_HOST") {
            self.api.host = host;
        }
        if let Ok(port) = std::env::var("JQL_API_PORT") {
            if let Ok(p) = port.parse() {
                self.api.port = p;
            }
        }

        if let Ok(level) = std::env::var("JQL_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(format) = std::env::var("JQL_LOG_FORMAT") {
            self.logging.format = format;
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {error}")]
    Io { path: PathBuf, error: String },

    #[error("Failed to parse config file {path:?}: {error}")]
    Parse { path: PathBuf, error: String },
}

/// Generate a default config file content
pub fn generate_default_config() -> String {
    r#"# JQL Configuration
#
# Environment variables override these settings:
# - JQL_TIMEZONE_OFFSET_HOURS
# - JQL_ROW_LIMIT
# - JQL_LEGACY_MODE
# - JQL_RESULT_FORMAT
# - JQL_CATALOG_PATH
# - JQL_CATALOG_URL
# - JQL_API_HOST
# - JQL_API_PORT
# - JQL_LOG_LEVEL
# - JQL_LOG_FORMAT

[compile]
# Offset from UTC for dates written without a zone
timezone_offset_hours = -6

# Row limit for queries without LIMIT
# row_limit = 10000

# Compile for the legacy result cache
legacy_mode = false

# Denominator used by sample(field, n)
default_sample_denominator = 100

# Largest number of groups one grouping stage may create
group_limit = 1000000

# Result format: tsv or json
result_format = "tsv"

[catalog]
# Dataset metadata file (.toml or .json)
# path = "/etc/jql/datasets.toml"

# Metadata service URL
# url = "http://localhost:8041/datasets"

[api]
# API server host
host = "127.0.0.1"

# API server port
port = 8040

# Allow cross-origin requests
cors_enabled = true

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log format: pretty (for development) or json (for production)
format = "pretty"
"#
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.compile.timezone_offset_hours, -6);
        assert_eq!(config.compile.default_sample_denominator, 100);
        assert_eq!(config.compile.group_limit, 1_000_000);
        assert_eq!(config.compile.result_format, "tsv");
        assert_eq!(config.api.port, 8040);
        assert_eq!(config.logging.format, "pretty");
        assert!(config.catalog.path.is_none());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[compile]\ntimezone_offset_hours = 0\n\n[api]\nport = 9000").unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.compile.timezone_offset_hours, 0);
        assert_eq!(config.compile.group_limit, 1_000_000);
        assert_eq!(config.api.port, 9000);
        assert_eq!(config.api.host, "127.0.0.1");
    }

    #[test]
    fn test_generated_config_parses() {
        let config: Config = toml::from_str(&generate_default_config()).unwrap();
        assert_eq!(config.compile.timezone_offset_hours, -6);
        assert_eq!(config.api.port, 8040);
        assert!(config.api.cors_enabled);
    }

    #[test]
    fn test_missing_and_invalid_files() {
        assert!(matches!(
            Config::load(Path::new("/nonexistent/jql.toml")),
            Err(ConfigError::Io { .. })
        ));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[api\nport = ").unwrap();
        assert!(matches!(Config::load(file.path()), Err(ConfigError::Parse { .. })));
    }
}
