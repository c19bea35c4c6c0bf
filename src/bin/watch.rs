//! Watch objects_dir for changes and reindex changed objects automatically.

use anyhow::{Context, Result};
use clap::Parser;
use graphrepo::watch::run_watcher;
use graphrepo::{Config, Repository};

#[derive(Parser, Debug)]
#[command(name = "watch")]
#[command(about = "Watch objects_dir for changes and reindex changed objects")]
struct Args {
    /// Debounce delay in milliseconds before reindexing a changed object
    #[arg(long, default_value = "500")]
    debounce_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = Config::load()?;

    env_logger::Builder::from_env(
        env_logger::Env::default()
            .filter_or("RUST_LOG", config.repository.log_level.as_str())
    ).init();

    log::info!("Starting graphrepo object watcher");
    log::info!("Objects dir: {}", config.objects_dir().display());
    log::info!("Debounce: {} ms", args.debounce_ms);

    let repo = Repository::open(&config)
        .await
        .context("Failed to open repository")?;

    log::info!("Watching for changes (Ctrl+C to stop)");
    run_watcher(&repo, config.objects_dir(), args.debounce_ms).await?;
    Ok(())
}
