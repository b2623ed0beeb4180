use anyhow::Context;
use clap::Parser;
use galleryfetch::{
    sweep_partials, FsPersister, HttpFetcher, ImageValidator, ManifestSource, Pipeline,
    PipelineConfig, RunContext,
};
use std::path::PathBuf;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "galleryfetch")]
#[command(about = "Download image albums listed in a manifest", long_about = None)]
#[command(version)]
struct Args {
    /// JSON manifest of albums and image URLs
    manifest: PathBuf,

    /// JSON configuration file (defaults apply when omitted)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the configured save root
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Run one more pass over failed downloads at the end
    #[arg(long)]
    retry_abandoned: bool,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let log_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(format!("galleryfetch={}", log_level))
        .init();

    let mut config = match &args.config {
        Some(path) => PipelineConfig::from_json_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => PipelineConfig::default(),
    };
    if let Some(output) = args.output {
        config.save_root = output;
    }
    config.validate()?;

    info!("galleryfetch - album downloader");
    info!("Manifest: {:?}", args.manifest);
    info!("Save root: {:?}", config.save_root);
    info!(
        "Albums in parallel: {}, images per album: {}, max connections: {}",
        config.album_concurrency, config.image_concurrency, config.max_connections
    );
    info!(
        "Verification: {}, minimum size: {} bytes",
        if config.verify { "on" } else { "off" },
        config.min_size
    );

    let source = ManifestSource::from_json_file(&args.manifest, &config)
        .with_context(|| format!("loading manifest {}", args.manifest.display()))?;
    info!("Found {} albums", source.len());

    std::fs::create_dir_all(&config.save_root)?;
    sweep_partials(&config.save_root)?;

    let validator = ImageValidator::default();
    let pipeline = Pipeline::new(
        config.clone(),
        HttpFetcher::new(&config)?,
        validator,
        FsPersister::new(validator),
    );

    let ctx = RunContext::new();
    let report = pipeline.run_source(&ctx, &source).await;

    for batch in &report.batches {
        info!("{}: {}", batch.label, batch.tally);
    }

    // Permanent failures are reported now; retryable ones stay queued.
    let mut failed = 0;
    for batch in &report.batches {
        for (task, reason) in batch.failures().filter(|(_, r)| !r.is_retryable()) {
            warn!("Failed: {} -> {} ({})", task.url(), task.dest().display(), reason);
            failed += 1;
        }
    }

    if args.retry_abandoned && !ctx.abandoned().is_empty() {
        let retry = pipeline
            .retry_abandoned(&ctx, config.image_concurrency)
            .await;
        info!("Retry pass: {}", retry.tally);
        for (task, reason) in retry.failures().filter(|(_, r)| !r.is_retryable()) {
            warn!("Failed: {} -> {} ({})", task.url(), task.dest().display(), reason);
            failed += 1;
        }
    }

    let remaining = ctx.abandoned();
    for entry in &remaining {
        warn!("Failed: {} -> {} ({})", entry.task.url(), entry.task.dest().display(), entry.reason);
    }
    failed += remaining.len();

    info!("Overall: {}", ctx.tally());
    if failed == 0 {
        info!("✅ All downloads completed");
    } else {
        info!(
            "⚠️  {} downloads failed, {} of them can be retried",
            failed,
            remaining.len()
        );
    }
    Ok(())
}
