mod input;
mod shipper;

use anyhow::{Context, Result};
use clap::Parser;
use rlog::{ClientConfig, LogClient, Mode, Scope};
use std::path::PathBuf;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "rlog-shipper", about = "Ship log lines to rlog collectors")]
struct Args {
    /// Collector address (repeatable or comma-separated)
    #[arg(long, env = "RLOG_REMOTES", value_delimiter = ',', required = true)]
    remote: Vec<String>,

    /// Keep one bidirectional stream per collector instead of one call per event
    #[arg(long)]
    stream: bool,

    /// Prefix of the shipped events
    #[arg(long, default_value = rlog::event::DEFAULT_PREFIX)]
    prefix: String,

    /// Sub-prefix of the shipped events
    #[arg(long, default_value = "")]
    sub: String,

    /// File to read lines from (default: stdin)
    #[arg(long)]
    input: Option<PathBuf>,

    /// Give up reconnecting once the backoff exceeds this many seconds
    #[arg(long, default_value_t = 300)]
    max_backoff_secs: u64,

    /// Capacity of the outbound event queue
    #[arg(long, default_value_t = 1)]
    queue_size: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"))
        .add_directive("h2=warn".parse()?);
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();

    let remotes: Vec<String> = args
        .remote
        .iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();

    let scope = Scope {
        prefix: args.prefix.clone(),
        sub: args.sub.clone(),
        ..Scope::default()
    };
    let config = ClientConfig {
        addresses: remotes.clone(),
        mode: if args.stream { Mode::Stream } else { Mode::Unary },
        max_backoff: Duration::from_secs(args.max_backoff_secs),
        queue_size: args.queue_size.max(1),
        scope: scope.clone(),
        ..ClientConfig::default()
    };

    info!(remotes = ?remotes, mode = ?config.mode, "Starting rlog-shipper");
    let client = LogClient::start(config)
        .await
        .context("Failed to connect to any collector")?;

    if let Some(errors) = client.errors() {
        tokio::spawn(shipper::report_errors(errors));
    }

    let (tx, rx) = tokio::sync::mpsc::channel(256);
    let source = input::LineSource::new(args.input.clone(), scope);
    let reader = tokio::spawn(async move { source.run(tx).await });

    tokio::select! {
        shipped = shipper::run_shipper(&client, rx) => match shipped {
            Ok(count) => info!(shipped = count, "Input exhausted"),
            Err(e) => error!(error = %e, "Shipper failed"),
        },
        _ = signal::ctrl_c() => info!("Shutting down"),
    }

    reader.abort();
    if let Ok(Err(e)) = reader.await {
        error!(error = %e, "Input failed");
    }
    client.close().await?;

    Ok(())
}
