//! charon - keep-alive load driver
//!
//! Issues GET requests through one pooled agent and reports how the pool
//! behaved.

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use charon::http::{self, Http1, HttpConnector};
use charon::{Agent, AgentConfig, ConfigFile, DestinationKey};
use clap::Parser;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// charon keep-alive agent
#[derive(Parser, Debug)]
#[command(name = "charon")]
#[command(author, version, about = "Keep-alive connection pool driver", long_about = None)]
struct Args {
    /// Target URL (http only)
    #[arg(short, long)]
    url: String,

    /// Agent configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Total number of requests
    #[arg(short = 'n', long, default_value = "100")]
    requests: usize,

    /// Requests in flight at once
    #[arg(short = 'c', long, default_value = "4")]
    concurrency: usize,

    /// Local address to bind outgoing connections to
    #[arg(long)]
    local_address: Option<IpAddr>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Enable JSON logging
    #[arg(long)]
    json_logs: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level, args.json_logs)?;

    info!("charon v{}", env!("CARGO_PKG_VERSION"));

    let config = match &args.config {
        Some(path) => {
            info!("Loading configuration from {:?}", path);
            ConfigFile::load(path)?.resolve()?
        }
        None => AgentConfig::default(),
    };

    let uri: ::http::Uri = args.url.parse().context("invalid --url")?;
    if uri.scheme_str().is_some_and(|s| s != "http") {
        anyhow::bail!("only http:// URLs are supported");
    }
    let mut key = DestinationKey::from_uri(&uri).context("--url has no host")?;
    if let Some(local) = args.local_address {
        key = key.with_local_address(local);
    }
    let path = uri
        .path_and_query()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(run(config, key, path, args.requests, args.concurrency.max(1)))
}

async fn run(
    config: AgentConfig,
    key: DestinationKey,
    path: String,
    total: usize,
    concurrency: usize,
) -> anyhow::Result<()> {
    let agent = Agent::new(config.clone(), HttpConnector::from_config(&config), Http1)?;
    let limit = Arc::new(Semaphore::new(concurrency));
    let started = Instant::now();

    info!("Sending {} requests to {} ({} at a time)", total, key, concurrency);

    let mut tasks = Vec::with_capacity(total);
    for _ in 0..total {
        let permit = Arc::clone(&limit).acquire_owned().await?;
        let request = http::get(&key, &path)?;
        let handle = agent.submit(key.clone(), request);
        tasks.push(tokio::spawn(async move {
            let outcome = handle.await;
            drop(permit);
            outcome
        }));
    }

    let mut failed = 0;
    for task in tasks {
        match task.await? {
            Ok(done) => debug!(
                "{} on {} (reused: {})",
                done.value.status(),
                done.connection,
                done.reused
            ),
            Err(e) => {
                failed += 1;
                warn!("Request failed: {}", e);
            }
        }
    }

    let stats = agent.stats();
    info!(
        "Finished {} requests in {:?}: {} failed, {} connections opened, {} reused",
        total,
        started.elapsed(),
        failed,
        stats.connections_created,
        stats.connections_reused
    );
    info!(
        "Pool: {} active, {} free, {} queued",
        agent.sockets().values().map(Vec::len).sum::<usize>(),
        agent.free_sockets().values().map(Vec::len).sum::<usize>(),
        agent.requests().values().sum::<usize>()
    );
    info!("{:?}", stats);

    let closed = agent.close_idle();
    debug!("Closed {} idle connections on exit", closed);

    if failed == total && total > 0 {
        error!("Every request failed");
        anyhow::bail!("all {} requests failed", total);
    }
    Ok(())
}

fn init_logging(level: &str, json: bool) -> anyhow::Result<()> {
    let level = level.parse::<Level>().unwrap_or(Level::INFO);
    let filter = EnvFilter::new(format!("charon={},hyper=warn", level));

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .init();
    }

    Ok(())
}
