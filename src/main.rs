use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use preview_cache::cache::{CacheKey, Tier};
use preview_cache::{
    logging, scan_folder, ImagePipeline, PipelineConfig, PipelineStats, Priority, SizeClass,
};
use std::path::PathBuf;
use std::time::Instant;
use tracing::info;

#[derive(Parser)]
#[command(name = "preview-cache")]
#[command(about = "Warm and manage the thumbnail and preview caches of a photo library")]
#[command(version)]
struct Cli {
    /// JSON config file (defaults are used when absent)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Decode every image in a folder into the cache
    Warm {
        /// Folder to scan recursively
        folder: PathBuf,
        /// Size class to decode
        #[arg(long, value_enum, default_value_t = SizeClass::Preview)]
        size: SizeClass,
    },

    /// Delete the on-disk cache
    Clear,

    /// Report how much of a folder is cached on disk
    Stats {
        /// Folder to scan recursively
        folder: PathBuf,
        #[arg(long, value_enum, default_value_t = SizeClass::Preview)]
        size: SizeClass,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init_logging(cli.verbose);

    let config = PipelineConfig::load_or_default(cli.config.as_deref())
        .context("Failed to load configuration")?;

    match cli.command {
        Commands::Warm { folder, size } => warm(&config, folder, size),
        Commands::Clear => clear(&config),
        Commands::Stats { folder, size } => stats(&config, folder, size),
    }
}

/// Scan a folder and preload it at library priority
fn warm(config: &PipelineConfig, folder: PathBuf, size: SizeClass) -> Result<()> {
    let files = scan_folder(&folder)
        .with_context(|| format!("Failed to scan {}", folder.display()))?;
    info!(folder = ?folder, files = files.len(), "scanned folder");

    let pipeline = ImagePipeline::new(config);
    let started = Instant::now();
    let queued = pipeline.preload_all(&files, size, Priority::Library);
    pipeline.wait_idle();

    let stats = pipeline.stats();
    println!(
        "Warmed {} of {} files at {} in {:.1}s",
        queued,
        files.len(),
        size.as_str(),
        started.elapsed().as_secs_f64()
    );
    print_stats(&stats);
    Ok(())
}

/// Delete both disk mirrors without starting any workers
fn clear(config: &PipelineConfig) -> Result<()> {
    let mut removed = 0;
    for tier in [Tier::Thumbnail, Tier::Preview] {
        if let Some(mirror) = config.mirror_for(tier) {
            removed += mirror
                .clear()
                .with_context(|| format!("Failed to clear {}", mirror.root().display()))?;
        }
    }
    println!("Removed {} cached files from {}", removed, config.cache_root().display());
    Ok(())
}

fn stats(config: &PipelineConfig, folder: PathBuf, size: SizeClass) -> Result<()> {
    let files = scan_folder(&folder)
        .with_context(|| format!("Failed to scan {}", folder.display()))?;

    let mirrored = match config.mirror_for(size.tier()) {
        Some(mirror) => files
            .iter()
            .filter(|file| mirror.contains(&CacheKey::new(&file.path, size)))
            .count(),
        None => 0,
    };

    println!(
        "{} of {} files have a cached {} on disk",
        mirrored,
        files.len(),
        size.as_str()
    );
    Ok(())
}

fn print_stats(stats: &PipelineStats) {
    for (name, cache) in [("thumbnails", &stats.thumbnails), ("previews", &stats.previews)] {
        println!(
            "  {:<10} {:>5} entries  {:>8.1} MiB / {:.0} MiB  hits {} (disk {})  misses {}  evictions {}",
            name,
            cache.entries,
            cache.total_cost as f64 / (1024.0 * 1024.0),
            cache.cost_limit as f64 / (1024.0 * 1024.0),
            cache.hits,
            cache.disk_hits,
            cache.misses,
            cache.evictions,
        );
    }
}
