use anyhow::{Context, Result};
use clap::Parser;
use graphrepo::{Config, LockOwner, Repository};
use std::time::Instant;

#[derive(Parser, Debug)]
#[command(name = "reindex")]
#[command(about = "Rebuild processing index records of every stored object")]
struct Args {
    /// Objects rebuilt between commits (overrides index.batch_size)
    #[arg(short, long)]
    batch_size: Option<usize>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut config = Config::load()?;
    if let Some(batch_size) = args.batch_size {
        anyhow::ensure!(batch_size > 0, "--batch-size must be greater than 0");
        config.index.batch_size = batch_size;
    }

    env_logger::Builder::from_env(
        env_logger::Env::default()
            .filter_or("RUST_LOG", config.repository.log_level.as_str())
    ).init();

    log::info!("Starting graphrepo reindex");
    log::info!("Objects dir: {}", config.objects_dir().display());
    log::info!("Database path: {}", config.db_path().display());
    log::info!("Batch size: {}", config.index.batch_size);

    let repo = Repository::open(&config)
        .await
        .context("Failed to open repository")?;

    let start = Instant::now();
    let report = repo.reindex_all(&LockOwner::new()).await?;

    log::info!("=== Reindex Complete ===");
    log::info!("Objects indexed: {}", report.objects);
    log::info!("Records written: {}", report.records);
    log::info!("Commits: {}", report.commits);
    log::info!("Time: {:?}", start.elapsed());
    if report.failed > 0 {
        log::warn!("{} object(s) failed to reindex. Check logs above for details.", report.failed);
    }

    Ok(())
}
