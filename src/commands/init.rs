//! Init command implementation

use crate::config::Config;
use crate::error::{Error, Result};
use crate::meta::MetaDb;
use serde::Serialize;
use std::path::PathBuf;
use tracing::info;

/// What `init` created
#[derive(Debug, Clone, Serialize)]
pub struct InitReport {
    pub config_path: String,
    pub db_path: String,
    pub storage_root: String,
}

/// Write the default config, create the blob root and the database schema
pub async fn cmd_init(base_dir: PathBuf, config_path: PathBuf, force: bool) -> Result<InitReport> {
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

    let storage_root = config.storage_root();
    tokio::fs::create_dir_all(&storage_root).await?;

    let db = MetaDb::connect(&config).await?;
    db.init_schema().await?;
    info!(db = ?config.paths.db_file, "Database ready");

    Ok(InitReport {
        config_path: config.paths.config_file.display().to_string(),
        db_path: config.paths.db_file.display().to_string(),
        storage_root: storage_root.display().to_string(),
    })
}
