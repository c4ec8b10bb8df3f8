//! Init command implementation

use crate::config::Config;
use crate::error::{Error, Result};
use crate::meta::MetaDb;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::info;

#[derive(Debug, Clone)]
pub struct InitOptions {
    pub base_dir: PathBuf,
    /// Overwrite an existing config file with defaults
    pub force: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitResult {
    pub config_path: String,
    pub db_path: String,
    pub cache_dir: String,
    /// False when an existing config was kept
    pub wrote_config: bool,
}

/// Initialize syllabus configuration, database and cache directory.
///
/// Re-running without `force` keeps the existing config and only makes sure
/// the database schema and directories exist.
pub async fn cmd_init(options: InitOptions) -> Result<InitResult> {
    let InitOptions { base_dir, force } = options;

    let mut config = Config::default();
    config.init_paths(Some(base_dir));

    let exists = config.paths.config_file.exists();
    let wrote_config = if !exists || force {
        config.validate()?;
        config.save()?;
        true
    } else {
        config = Config::load(&config.paths.config_file).map_err(|e| {
            Error::Config(format!(
                "Existing config is invalid ({}); rerun with --force to overwrite",
                e
            ))
        })?;
        info!("Keeping existing config at {:?}", config.paths.config_file);
        false
    };

    let db = MetaDb::connect(&config).await?;
    db.init_schema().await?;
    info!("Database ready at {:?}", config.paths.db_file);

    std::fs::create_dir_all(&config.paths.cache_dir)?;

    Ok(InitResult {
        config_path: config.paths.config_file.display().to_string(),
        db_path: config.paths.db_file.display().to_string(),
        cache_dir: config.paths.cache_dir.display().to_string(),
        wrote_config,
    })
}

/// Print init result to console
pub fn print_init_result(result: &InitResult) {
    println!("\n✨ syllabus initialized\n");
    if result.wrote_config {
        println!("Config: {} (defaults written)", result.config_path);
    } else {
        println!("Config: {} (kept existing)", result.config_path);
    }
    println!("Database: {}", result.db_path);
    println!("Parse cache: {}", result.cache_dir);
    println!("\nNext: syllabus ingest <pdf> --name <book> --grade <n>");
}
