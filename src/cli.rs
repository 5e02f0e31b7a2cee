// src/cli.rs

//! CLI argument parsing using `clap`.

use clap::{Parser, ValueEnum};

use crate::config::DEFAULT_CONFIG_FILE;

/// Command-line arguments for `statdag`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "statdag",
    version,
    about = "Run a dependent set of warehouse queries and aggregate them into an analysis.",
    long_about = None
)]
pub struct CliArgs {
    /// Path to the config file (TOML).
    #[arg(long, value_name = "PATH", default_value = DEFAULT_CONFIG_FILE)]
    pub config: String,

    /// Directory of the JSON model store holding analyzed entities.
    #[arg(long, value_name = "DIR", default_value = ".statdag")]
    pub store: String,

    /// Identity used for the permission check before any query is created.
    #[arg(long, value_name = "NAME", default_value = "anonymous")]
    pub user: String,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `STATDAG_LOG` or a default level will be used.
    #[arg(long, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    /// Parse + validate, print the query DAG, but don't execute anything.
    #[arg(long)]
    pub dry_run: bool,
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_to_the_working_directory_file() {
        let args = CliArgs::try_parse_from(["statdag"]).unwrap();
        assert_eq!(args.config, DEFAULT_CONFIG_FILE);
        assert!(!args.dry_run);
    }
}
