//! Init command implementation

use crate::config::Config;
use crate::error::{Error, Result};
use crate::store::BuildingDb;
use serde::Serialize;
use std::path::PathBuf;
use tracing::info;

#[derive(Debug, Clone)]
pub struct InitOptions {
    pub base_dir: PathBuf,
    pub config_path: PathBuf,
    pub force: bool,
}

/// Paths created by `init`
#[derive(Debug, Clone, Serialize)]
pub struct InitInfo {
    pub config_path: String,
    pub db_path: String,
}

/// Write a default config and create the database schema
pub async fn cmd_init(options: InitOptions) -> Result<InitInfo> {
    let InitOptions {
        base_dir,
        config_path,
        force,
    } = options;

    if config_path.exists() && !force {
        return Err(Error::Config(format!(
            "Config already exists at {}. Use --force to overwrite.",
            config_path.display()
        )));
    }

    let mut config = Config::default();
    config.init_paths(Some(base_dir));
    config.paths.config_file = config_path;
    config.validate()?;
    config.save()?;
    info!("Created config at {:?}", config.paths.config_file);

    let db = BuildingDb::connect(&config).await?;
    db.init_schema().await?;
    info!("Created database at {:?}", config.paths.db_file);

    Ok(InitInfo {
        config_path: config.paths.config_file.display().to_string(),
        db_path: config.paths.db_file.display().to_string(),
    })
}
