// src/config/loader.rs

use std::fs;
use std::path::Path;

use tracing::debug;

use crate::config::model::{ConfigFile, RawConfigFile};
use crate::errors::Result;

/// Read and deserialize a configuration file without semantic validation.
///
/// Use [`load_and_validate`] to also check pool bounds and the query DAG.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<RawConfigFile> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path)?;

    let config: RawConfigFile = toml::from_str(&contents)?;
    debug!(path = %path.display(), queries = config.query.len(), "config parsed");

    Ok(config)
}

/// Load a configuration file and validate it.
///
/// This is the entry point the binary uses. It rejects:
/// - configs without queries and malformed query names,
/// - unknown or self dependencies and cycles,
/// - inconsistent pool bounds and unparsable durations,
/// - a `metric_query` that names no declared query.
pub fn load_and_validate(path: impl AsRef<Path>) -> Result<ConfigFile> {
    let raw_config = load_from_path(&path)?;
    let config = ConfigFile::try_from(raw_config)?;
    Ok(config)
}

/// Config file looked up in the working directory when `--config` is absent.
pub const DEFAULT_CONFIG_FILE: &str = "Statdag.toml";
