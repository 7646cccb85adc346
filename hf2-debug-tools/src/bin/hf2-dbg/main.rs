mod cmd;
mod config;
mod logging;

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

use crate::config::Configs;
use crate::logging::{setup_logging, LevelFilter};

#[derive(clap::Parser)]
#[clap(
    name = "hf2-dbg",
    about = "Source-level debugging of programs running on HF2 devices",
    version
)]
struct Cli {
    /// Location for log file
    #[clap(long, global = true, help_heading = "LOG CONFIGURATION")]
    log_file: Option<PathBuf>,

    /// Log level for the terminal. Overrides RUST_LOG and the configuration.
    #[clap(long, global = true, value_enum, help_heading = "LOG CONFIGURATION")]
    log_level: Option<LevelFilter>,

    /// Configuration file merged on top of `.hf2dbg.*` in the working directory
    #[clap(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[clap(subcommand)]
    subcommand: Subcommand,
}

#[derive(clap::Subcommand)]
enum Subcommand {
    /// List all connected HF2 devices
    List(cmd::list::Cmd),
    /// Flash a program and debug it, speaking JSON lines on stdin and stdout
    Debug(cmd::debug::Cmd),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut configs = Configs::new(std::env::current_dir()?);
    if let Some(config) = cli.config.clone() {
        configs.merge(config)?;
    }
    let config = configs.extract()?;

    let log_file = cli
        .log_file
        .clone()
        .or_else(|| config.general.log_file.clone());
    let _logger_guard = setup_logging(
        log_file.as_deref(),
        cli.log_level.or(config.general.log_level),
    )?;

    match cli.subcommand {
        Subcommand::List(cmd) => cmd.run(),
        Subcommand::Debug(cmd) => cmd.run(config).await,
    }
}
