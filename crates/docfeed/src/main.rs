#![warn(missing_docs)]

//! Command-line feeder: reads one JSON document per line and feeds it.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use docfeed::{
    Cluster, CompletionCallback, Endpoint, FeedConfig, FeedCoordinator, Operation, OperationKind,
    OperationResult, Outcome,
};
use serde::Deserialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "docfeed")]
#[command(about = "Feed JSON documents to a gateway cluster", long_about = None)]
struct Cli {
    /// Configuration file (.toml or .json); defaults are used when omitted.
    #[arg(short, long, env = "DOCFEED_CONFIG")]
    config: Option<PathBuf>,

    /// Input file with one JSON document per line; stdin when omitted.
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Acknowledge everything locally instead of connecting.
    #[arg(long)]
    dry_run: bool,

    /// Endpoint of a single target cluster, replacing configured clusters (repeatable).
    #[arg(long = "cluster-endpoint", value_name = "HOST:PORT")]
    cluster_endpoints: Vec<String>,

    /// Print statistics as JSON when done.
    #[arg(long)]
    stats: bool,
}

#[derive(Deserialize)]
struct DocumentHeader {
    id: String,
    #[serde(default)]
    op: OperationKind,
}

#[derive(Default)]
struct Tally {
    succeeded: AtomicU64,
    transient: AtomicU64,
    permanent: AtomicU64,
    cancelled: AtomicU64,
}

impl Tally {
    fn record(&self, result: &OperationResult) {
        let counter = match &result.outcome {
            Outcome::Success => &self.succeeded,
            Outcome::Transient { .. } => &self.transient,
            Outcome::Permanent { .. } => &self.permanent,
            Outcome::Cancelled { .. } => &self.cancelled,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        if !result.outcome.is_success() {
            tracing::warn!(id = %result.id(), outcome = ?result.outcome, "operation failed");
        }
    }

    fn failed(&self) -> u64 {
        self.transient.load(Ordering::Relaxed)
            + self.permanent.load(Ordering::Relaxed)
            + self.cancelled.load(Ordering::Relaxed)
    }
}

fn load_config(cli: &Cli) -> Result<FeedConfig> {
    let mut config = match &cli.config {
        Some(path) => FeedConfig::from_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => FeedConfig::default(),
    };
    if cli.dry_run {
        config.connection.dry_run = true;
    }
    if !cli.cluster_endpoints.is_empty() {
        let endpoints = cli
            .cluster_endpoints
            .iter()
            .map(|s| Endpoint::parse(s))
            .collect::<docfeed::Result<Vec<_>>>()?;
        config.clusters = vec![Cluster::new(endpoints)];
    }
    config.validate()?;
    Ok(config)
}

async fn feed_lines<R: AsyncBufRead + Unpin>(
    coordinator: &FeedCoordinator,
    reader: R,
) -> Result<u64> {
    let mut lines = reader.lines();
    let mut submitted = 0u64;
    let mut line_no = 0u64;
    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }
        let header: DocumentHeader = match serde_json::from_str(&line) {
            Ok(header) => header,
            Err(e) => {
                tracing::warn!(line = line_no, error = %e, "skipping malformed document");
                continue;
            }
        };
        coordinator
            .submit(Operation::new(header.id, header.op, line.into_bytes()))
            .await;
        submitted += 1;
    }
    Ok(submitted)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    let tally = Arc::new(Tally::default());
    let callback: CompletionCallback = {
        let tally = Arc::clone(&tally);
        Arc::new(move |result: OperationResult| tally.record(&result))
    };
    let coordinator = FeedCoordinator::new(&config, callback)?;
    tracing::info!(
        clusters = coordinator.cluster_count(),
        dry_run = config.connection.dry_run,
        "docfeed starting"
    );

    let submitted = match &cli.input {
        Some(path) => {
            let file = tokio::fs::File::open(path)
                .await
                .with_context(|| format!("opening {}", path.display()))?;
            feed_lines(&coordinator, BufReader::new(file)).await?
        }
        None => feed_lines(&coordinator, BufReader::new(tokio::io::stdin())).await?,
    };

    let reporter = coordinator.stats_reporter();
    let closed = coordinator.close().await;

    println!(
        "submitted {submitted}, succeeded {}, transient {}, permanent {}, cancelled {}",
        tally.succeeded.load(Ordering::Relaxed),
        tally.transient.load(Ordering::Relaxed),
        tally.permanent.load(Ordering::Relaxed),
        tally.cancelled.load(Ordering::Relaxed),
    );
    if cli.stats {
        println!("{}", reporter.to_json()?);
    }
    closed?;
    if tally.failed() > 0 {
        anyhow::bail!("{} operations failed", tally.failed());
    }
    Ok(())
}
