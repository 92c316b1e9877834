use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use kbsync::config::Config;

#[derive(Parser, Debug)]
#[command(name = "kbsync", version)]
struct Cli {
    /// Path to config file
    #[arg(short = 'c', long = "config")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the sync daemon
    Daemon,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = Config::load(&cli.config)?;

    match cli.command {
        Commands::Daemon => kbsync::daemon::run(cfg).await?,
    }

    Ok(())
}
