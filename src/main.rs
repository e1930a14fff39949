//! Enrichment pipeline CLI.
//!
//! Two subcommands:
//! - `run`: enrich a JSON array of records per a TOML pipeline config,
//!   writing enriched records and printing a run report
//! - `estimate`: project request and token cost without issuing a
//!   single provider request
//!
//! # Usage
//!
//! ```bash
//! # Full run with checkpointed resume
//! enrich run --config pipeline.toml --items records.json --output enriched.json
//!
//! # Dry cost projection
//! enrich estimate --config pipeline.toml --items records.json
//!
//! # Bearer token for the HTTP provider
//! ENRICH_API_KEY=... enrich run --config pipeline.toml --items records.json
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use enrich::{
    estimate_cost, EnrichItem, EnrichmentOrchestrator, HttpProvider, PipelineConfig,
};

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Enrich a record catalog
    Run {
        /// Pipeline configuration (TOML)
        #[arg(long)]
        config: PathBuf,

        /// Input records: a JSON array of objects
        #[arg(long)]
        items: PathBuf,

        /// Where to write enriched records (stdout when omitted)
        #[arg(long)]
        output: Option<PathBuf>,

        /// Checkpoint file, overriding the config's path
        #[arg(long)]
        checkpoint: Option<PathBuf>,

        /// Print per-chunk progress to stderr
        #[arg(long, default_value_t = false)]
        progress: bool,
    },
    /// Project run cost without issuing any request
    Estimate {
        /// Pipeline configuration (TOML)
        #[arg(long)]
        config: PathBuf,

        /// Input records: a JSON array of objects
        #[arg(long)]
        items: PathBuf,
    },
}

fn load_items(path: &Path) -> Result<Vec<EnrichItem>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading items from {}", path.display()))?;
    let records: Vec<serde_json::Value> =
        serde_json::from_str(&raw).with_context(|| format!("{} is not a JSON array", path.display()))?;
    Ok(records
        .into_iter()
        .enumerate()
        .map(|(index, record)| EnrichItem::from_record(index, record))
        .collect())
}

async fn run(
    config: PathBuf,
    items: PathBuf,
    output: Option<PathBuf>,
    checkpoint: Option<PathBuf>,
    progress: bool,
) -> Result<()> {
    let mut config = PipelineConfig::load(&config)?;
    if checkpoint.is_some() {
        config.checkpoint_path = checkpoint;
    }
    let mut items = load_items(&items)?;

    let endpoint = config
        .endpoint
        .clone()
        .context("config has no provider endpoint")?;
    let mut provider = HttpProvider::new(endpoint)?;
    if let Ok(key) = std::env::var("ENRICH_API_KEY") {
        provider = provider.with_api_key(key);
    }

    let mut orchestrator = EnrichmentOrchestrator::new(config, Arc::new(provider))?;
    if progress {
        orchestrator = orchestrator.with_progress(Arc::new(|p| {
            eprintln!(
                "  {}/{} ({:.0}%) — {} ok, {} failed",
                p.processed, p.total, p.percentage, p.successful, p.failed
            );
        }));
    }

    // Ctrl-C finishes the in-flight chunk, persists the checkpoint, and
    // reports instead of tearing the process down.
    let cancel = orchestrator.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; finishing in-flight chunk");
            cancel.cancel();
        }
    });

    let report = orchestrator.run(&mut items).await?;

    let enriched = serde_json::to_string_pretty(&items)?;
    match output {
        Some(path) => {
            std::fs::write(&path, enriched)
                .with_context(|| format!("writing {}", path.display()))?;
            info!(path = %path.display(), items = items.len(), "enriched records written");
        }
        None => println!("{enriched}"),
    }

    eprintln!("{report}");
    if report.cancelled {
        bail!("run cancelled; re-run with the same config to resume");
    }
    Ok(())
}

fn estimate(config: PathBuf, items: PathBuf) -> Result<()> {
    let config = PipelineConfig::load(&config)?;
    let items = load_items(&items)?;
    let router = config.router()?;
    let requested = config.requested_fields(&router);
    let estimate = estimate_cost(items.len(), &router, &requested)?;
    println!("{}", serde_json::to_string_pretty(&estimate)?);
    eprintln!("{estimate}");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Run {
            config,
            items,
            output,
            checkpoint,
            progress,
        } => run(config, items, output, checkpoint, progress).await,
        Command::Estimate { config, items } => estimate(config, items),
    }
}
