use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use rlog::config::DEFAULT_LISTEN;
use rlog::{Format, Level, LocalLogger, LogServer, ServerConfig, Sink};

#[derive(Parser, Debug)]
#[command(name = "rlog-collector", version, about = "Collect structured logs over gRPC")]
struct Args {
    /// Listen address (e.g., [::1]:9099)
    #[arg(short, long, default_value = DEFAULT_LISTEN)]
    listen: String,

    /// Output format: text, json or binary
    #[arg(short, long, default_value_t = Format::Text)]
    format: Format,

    /// Where received events go: a file path, or "-" for stdout
    #[arg(short, long, default_value = "-")]
    output: Vec<String>,

    /// Drop received events below this level
    #[arg(long, default_value_t = Level::Trace)]
    level: Level,

    /// Where the collector's own events go: a file path, "-" for stderr,
    /// or "none"
    #[arg(long, default_value = "-")]
    service_output: String,

    /// Maximum concurrent requests per connection
    #[arg(long)]
    concurrency_limit: Option<usize>,
}

fn data_logger(args: &Args) -> Result<LocalLogger> {
    let mut sinks = Vec::with_capacity(args.output.len());
    for output in &args.output {
        let sink = match output.as_str() {
            "-" => Sink::stdout(args.format),
            path => Sink::file(path, args.format)
                .with_context(|| format!("Failed to open output {path}"))?,
        };
        sinks.push(sink.with_level(args.level));
    }
    Ok(LocalLogger::new(sinks))
}

fn service_logger(output: &str) -> Result<LocalLogger> {
    Ok(match output {
        "none" => LocalLogger::discard(),
        "-" => LocalLogger::discard().with_sink(Sink::stderr(Format::Text)),
        path => LocalLogger::discard().with_sink(
            Sink::file(path, Format::Text)
                .with_context(|| format!("Failed to open service output {path}"))?,
        ),
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging with h2 filtered to warn level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"))
        .add_directive("h2=warn".parse()?);
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();

    let config = ServerConfig {
        listen: args.listen.clone(),
        concurrency_limit: args.concurrency_limit,
        ..ServerConfig::default()
    };
    let server = Arc::new(LogServer::new(
        config,
        data_logger(&args)?,
        service_logger(&args.service_output)?,
    ));

    let addr = server.listen().await?;
    info!(addr = %addr, format = %args.format, "rlog-collector starting");

    let serving = {
        let server = server.clone();
        tokio::spawn(async move { server.serve().await })
    };

    signal::ctrl_c().await?;
    info!("Shutting down");
    server.stop();

    match serving.await? {
        Ok(()) => Ok(()),
        Err(e) => {
            error!(error = %e, "Collector failed");
            Err(e.into())
        }
    }
}
