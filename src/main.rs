mod cli;

use clap::Parser;
use cli::{Cli, Commands};
use loadvault::config::Config;
use loadvault::worker;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "loadvault=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Worker(args) => {
            let config = match args.config {
                Some(path) => Config::load_from_path(&path),
                None => Config::load(),
            }
            .map_err(|e| format!("failed to load config: {e}"))?;

            worker::run(config).await?;
        }
    }

    Ok(())
}
