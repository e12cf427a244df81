use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use latent_dataset::{DatasetConfig, LatentDataset};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "bucket_report",
    about = "Print bucket assignments for an image folder and manage its latent cache"
)]
struct Args {
    /// Dataset config (TOML). Falls back to LATENT_DATASET_CONFIG or latent_dataset.toml.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Override the config's image folder.
    #[arg(long)]
    folder: Option<PathBuf>,
    /// Number of epochs to bucket.
    #[arg(long, default_value_t = 1)]
    epochs: usize,
    /// Latent space the cache keys are computed for.
    #[arg(long, default_value = "sd1")]
    latent_space_version: String,
    /// Delete cache files no current item addresses.
    #[arg(long)]
    prune_orphans: bool,
    /// With --prune-orphans, only list what would be deleted.
    #[arg(long)]
    dry_run: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => DatasetConfig::from_path(path)
            .with_context(|| format!("load config {}", path.display()))?,
        None => DatasetConfig::load().context("load dataset config")?,
    };
    if let Some(folder) = args.folder {
        config.folder_path = folder;
    }
    let root = config.folder_path.clone();

    let mut dataset = LatentDataset::new(config)
        .with_context(|| format!("index dataset at {}", root.display()))?;
    dataset.set_latent_space_version(&args.latent_space_version);
    println!(
        "{}: {} items, seed {}, {} skipped",
        root.display(),
        dataset.len(),
        dataset.seed(),
        dataset.skipped_errors()
    );

    for epoch in 0..args.epochs.max(1) {
        if epoch > 0 {
            dataset.start_epoch(epoch);
        }
        println!("epoch {epoch}: {} batches", dataset.num_batches());
        for bucket in dataset.buckets().iter() {
            println!("  {:>11}  {:>6} items", bucket.key(), bucket.indices.len());
        }
    }

    if args.prune_orphans {
        let orphans = if args.dry_run {
            dataset.orphaned_cache_files()
        } else {
            dataset.prune_orphaned_cache_files()
        }
        .context("scan latent cache")?;
        let verb = if args.dry_run { "would remove" } else { "removed" };
        for path in &orphans {
            println!("{verb} {}", path.display());
        }
        println!("{} orphaned cache files {verb}", orphans.len());
    }
    Ok(())
}
