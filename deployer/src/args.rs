use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "slipway-deployer", about = "Start the deployer daemon")]
pub struct Args {
    /// Path to the settings file
    #[clap(short = 'f', long = "config", default_value = "/etc/slipway/deployer.toml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the daemon until SIGTERM/SIGINT
    Run,
}
