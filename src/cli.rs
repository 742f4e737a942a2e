use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "loadvault")]
#[command(about = "loadvault download worker", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the download worker
    Worker(WorkerArgs),
}

#[derive(clap::Args, Debug)]
pub struct WorkerArgs {
    /// Path to the TOML config file (embedded defaults apply when omitted)
    #[arg(long)]
    pub config: Option<PathBuf>,
}
