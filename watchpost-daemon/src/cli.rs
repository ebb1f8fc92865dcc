//! CLI argument definitions for watchpost-daemon.
//!
//! Uses `clap` v4 derive macros to parse command-line arguments.

use std::path::PathBuf;

use clap::Parser;

/// Watchpost alert processing daemon.
///
/// Orchestrates the access → detect → alert → action pipeline and
/// the periodic cache refresh jobs.
#[derive(Parser, Debug)]
#[command(name = "watchpost-daemon")]
#[command(version, about, long_about = None)]
pub struct DaemonCli {
    /// Path to watchpost.toml configuration file.
    #[arg(short, long, default_value = "/etc/watchpost/watchpost.toml")]
    pub config: PathBuf,

    /// Override log level (trace, debug, info, warn, error).
    ///
    /// Takes precedence over the config file and environment variables.
    #[arg(long)]
    pub log_level: Option<String>,

    /// Override log format (json, pretty).
    ///
    /// Takes precedence over the config file and environment variables.
    #[arg(long)]
    pub log_format: Option<String>,

    /// Validate configuration file and exit without starting the daemon.
    #[arg(long)]
    pub validate: bool,
}
