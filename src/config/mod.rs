//! Configuration management for plateau-feed
//!
//! Handles loading, saving, and validating configuration from TOML files.

mod defaults;

pub use defaults::*;

use crate::error::{Error, Result};
use crate::geom::CoordBounds;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// SQLite settings
    #[serde(default)]
    pub database: DatabaseConfig,

    /// HTTP API settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Ingestion settings
    #[serde(default)]
    pub ingest: IngestConfig,

    /// Bounding-box query settings
    #[serde(default)]
    pub query: QueryConfig,

    /// Attributes stamped on the OSM XML document
    #[serde(default)]
    pub output: OutputConfig,

    /// Paths configuration (internal, not user-editable)
    #[serde(skip)]
    pub paths: PathsConfig,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database file; relative paths resolve against the config directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,

    /// Maximum pooled connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Socket address to listen on
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Cache-Control max-age for building responses
    #[serde(default = "default_cache_max_age_secs")]
    pub cache_max_age_secs: u64,
}

/// Ingestion configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Valid coordinate envelope; vertices outside it reject the record
    #[serde(default)]
    pub bounds: CoordBounds,

    /// Skip new buildings whose footprint already exists under another id
    #[serde(default = "default_dedupe_geometry")]
    pub dedupe_geometry: bool,

    /// Source tag holding the stable building id
    #[serde(default = "default_source_id_tag")]
    pub source_id_tag: String,

    /// Abort the batch after this many storage failures in a row
    #[serde(default = "default_max_consecutive_store_errors")]
    pub max_consecutive_store_errors: usize,
}

/// Query configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryConfig {
    /// Buildings per response when the caller gives no limit
    #[serde(default = "default_query_limit")]
    pub default_limit: usize,

    /// Larger limits are clamped to this value
    #[serde(default = "default_query_max_limit")]
    pub max_limit: usize,

    /// Repeat the first node reference at the end of every way
    #[serde(default)]
    pub close_ways: bool,
}

/// OSM document metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    #[serde(default = "default_generator")]
    pub generator: String,

    #[serde(default = "default_copyright")]
    pub copyright: String,

    #[serde(default = "default_attribution")]
    pub attribution: String,

    #[serde(default = "default_license")]
    pub license: String,

    /// User name on every element
    #[serde(default = "default_user")]
    pub user: String,
}

/// Internal paths configuration
#[derive(Debug, Clone, Default)]
pub struct PathsConfig {
    /// Base directory for plateau-feed data
    pub base_dir: PathBuf,

    /// Path to config file
    pub config_file: PathBuf,

    /// Path to SQLite database
    pub db_file: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: None,
            max_connections: default_max_connections(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            cache_max_age_secs: default_cache_max_age_secs(),
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            bounds: CoordBounds::default(),
            dedupe_geometry: default_dedupe_geometry(),
            source_id_tag: default_source_id_tag(),
            max_consecutive_store_errors: default_max_consecutive_store_errors(),
        }
    }
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            default_limit: default_query_limit(),
            max_limit: default_query_max_limit(),
            close_ways: false,
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            generator: default_generator(),
            copyright: default_copyright(),
            attribution: default_attribution(),
            license: default_license(),
            user: default_user(),
        }
    }
}

impl Config {
    /// Get the default base directory (~/.plateau-feed)
    pub fn default_base_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".plateau-feed")
    }

    /// Get the default config file path
    pub fn default_config_path() -> PathBuf {
        Self::default_base_dir().join("config.toml")
    }

    /// Initialize paths configuration
    pub fn init_paths(&mut self, base_dir: Option<PathBuf>) {
        let base = base_dir.unwrap_or_else(Self::default_base_dir);
        self.paths = PathsConfig {
            config_file: base.join("config.toml"),
            db_file: self.resolve_db_file(&base),
            base_dir: base,
        };
    }

    fn resolve_db_file(&self, base: &Path) -> PathBuf {
        match &self.database.path {
            Some(path) if path.is_absolute() => path.clone(),
            Some(path) => base.join(path),
            None => base.join("buildings.db"),
        }
    }

    /// Load configuration from a specific file path
    pub fn load(config_path: &Path) -> Result<Self> {
        debug!("Loading config from {:?}", config_path);

        if !config_path.exists() {
            return Err(Error::Config(format!(
                "Config file not found: {}",
                config_path.display()
            )));
        }

        let content = std::fs::read_to_string(config_path)?;
        let mut config: Config = toml::from_str(&content)?;

        let base = config_path.parent().unwrap_or(Path::new(".")).to_path_buf();
        config.paths = PathsConfig {
            config_file: config_path.to_path_buf(),
            db_file: config.resolve_db_file(&base),
            base_dir: base,
        };

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.paths.config_file.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(&self.paths.config_file, content)?;
        info!("Saved config to {:?}", self.paths.config_file);
        Ok(())
    }

    /// Check if plateau-feed is initialized (config and DB exist)
    pub fn is_initialized(&self) -> bool {
        self.paths.config_file.exists() && self.paths.db_file.exists()
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.database.max_connections == 0 {
            return Err(Error::Config(
                "database.max_connections must be positive".to_string(),
            ));
        }

        self.ingest.bounds.validate()?;

        if self.ingest.source_id_tag.trim().is_empty() {
            return Err(Error::Config(
                "ingest.source_id_tag cannot be empty".to_string(),
            ));
        }

        if self.ingest.max_consecutive_store_errors == 0 {
            return Err(Error::Config(
                "ingest.max_consecutive_store_errors must be positive".to_string(),
            ));
        }

        if self.query.default_limit == 0 {
            return Err(Error::Config(
                "query.default_limit must be positive".to_string(),
            ));
        }

        if self.query.default_limit > self.query.max_limit {
            return Err(Error::Config(
                "query.default_limit must be <= query.max_limit".to_string(),
            ));
        }

        if self.server.bind.parse::<std::net::SocketAddr>().is_err() {
            return Err(Error::Config(format!(
                "server.bind is not a socket address: {}",
                self.server.bind
            )));
        }

        Ok(())
    }
}
