//! Command-line interface (ambient stack, §4.7): the two knobs this binary actually needs.

use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(about = "Reverse-proxy supervisor for on-demand and pausable local backend processes")]
pub struct Cli {
    /// Path to the supervisor config file.
    #[arg(long, default_value = "config.json")]
    pub config: PathBuf,

    /// Overrides RUST_LOG when set.
    #[arg(long)]
    pub log_level: Option<String>,
}
