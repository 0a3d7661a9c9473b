//! Command-line surface.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// adcd: acquisition gateway for ADC64/TQDC digitizer modules.
#[derive(Debug, Parser)]
#[command(name = "adcd", version, about)]
pub struct Cli {
    /// Path to the configuration file.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    /// Disable colored output.
    #[arg(long, global = true)]
    pub no_color: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the control server (register/memory channel and periodic poll).
    Control,
    /// Run the acquisition server (MStream receive pipelines).
    Mstream,
    /// Read or write the configuration file.
    Config(ConfigArgs),
}

#[derive(Debug, Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub action: ConfigAction,
}

#[derive(Debug, Subcommand)]
pub enum ConfigAction {
    /// Write an example configuration file.
    Init {
        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },
    /// Print the effective configuration.
    Show,
}
