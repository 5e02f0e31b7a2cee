// src/config/mod.rs

//! Configuration loading and validation.
//!
//! - [`model`] maps the TOML file onto raw and validated structs.
//! - [`loader`] reads files from disk.
//! - [`validate`] turns a raw config into a checked [`ConfigFile`].

pub mod loader;
pub mod model;
pub mod validate;

pub use loader::{DEFAULT_CONFIG_FILE, load_and_validate, load_from_path};
pub use model::{AnalysisSection, ConfigFile, PoolSection, QueryConfig, RawConfigFile};
