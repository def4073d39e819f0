//! statfan server
//!
//! Serves the long-poll HTTP API and accepts newline-delimited JSON status
//! events from the upstream poller over TCP.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::BufReader;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use statfan::transport::build_router;
use statfan::{
    pump_lines, Feed, IngestAdapter, IngestWorker, LogConfig, LogFormat, SnapshotProvider,
    StatfanConfig, StatusBoard, StatusService,
};

#[derive(Parser, Debug)]
#[command(name = "statfan-server", version, about = "Live status fan-out server")]
struct Cli {
    /// TOML config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// HTTP listen address
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Upstream event listen address
    #[arg(long)]
    upstream: Option<SocketAddr>,

    /// Number of recent events kept for diffing
    #[arg(long)]
    retention: Option<usize>,

    /// Long-poll timeout in seconds
    #[arg(long, value_name = "SECS")]
    poll_timeout: Option<u64>,

    /// JSON file with {cfg, servers, rotates}
    #[arg(long)]
    seed: Option<PathBuf>,
}

impl Cli {
    fn into_config(self) -> Result<StatfanConfig> {
        let mut cfg = match &self.config {
            Some(path) => StatfanConfig::load(path)?,
            None => StatfanConfig::default(),
        };
        if let Some(addr) = self.listen {
            cfg.server.listen = addr;
        }
        if let Some(addr) = self.upstream {
            cfg.server.upstream_listen = addr;
        }
        if let Some(n) = self.retention {
            cfg.feed.retention = n;
        }
        if let Some(secs) = self.poll_timeout {
            cfg.feed.poll_timeout_secs = secs;
        }
        if self.seed.is_some() {
            cfg.server.seed_path = self.seed;
        }
        cfg.validate()?;
        Ok(cfg)
    }
}

fn init_tracing(cfg: &LogConfig) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&cfg.filter)
            .with_context(|| format!("invalid log filter '{}'", cfg.filter))?,
    };
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match cfg.format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
    Ok(())
}

fn seed_board(board: &StatusBoard, path: &Path) -> Result<()> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read seed file {}", path.display()))?;
    let doc: serde_json::Value = serde_json::from_str(&text)
        .with_context(|| format!("seed file {} is not valid JSON", path.display()))?;
    let n = board.seed_from_json(&doc)?;
    info!(servers = n, path = %path.display(), "seeded status board");
    Ok(())
}

async fn accept_upstream(listener: TcpListener, worker: Arc<IngestWorker>) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(error = %e, "upstream accept failed");
                continue;
            }
        };
        info!(%peer, "upstream connected");
        let worker = Arc::clone(&worker);
        tokio::spawn(async move {
            match pump_lines(BufReader::new(stream), &worker).await {
                Ok(n) => info!(%peer, messages = n, "upstream disconnected"),
                Err(e) => warn!(%peer, error = %e, "upstream read failed"),
            }
        });
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Cli::parse().into_config()?;
    init_tracing(&cfg.log)?;

    info!(version = env!("CARGO_PKG_VERSION"), "statfan starting");

    let board = Arc::new(StatusBoard::new());
    if let Some(path) = &cfg.server.seed_path {
        seed_board(&board, path)?;
    }

    let feed = Arc::new(Feed::new(&cfg.feed));
    let adapter = IngestAdapter::new(Arc::clone(&feed), cfg.ingest.clone()).with_board(Arc::clone(&board));
    let worker = Arc::new(
        IngestWorker::spawn(Arc::new(adapter), cfg.ingest.queue_capacity)
            .context("failed to start ingest worker")?,
    );

    let upstream = TcpListener::bind(cfg.server.upstream_listen)
        .await
        .with_context(|| format!("failed to bind upstream listener {}", cfg.server.upstream_listen))?;
    info!(addr = %cfg.server.upstream_listen, "accepting upstream events");
    let upstream_task = tokio::spawn(accept_upstream(upstream, Arc::clone(&worker)));

    let provider: Arc<dyn SnapshotProvider> = board;
    let service = Arc::new(StatusService::new(Arc::clone(&feed), provider).with_ingest(Arc::clone(&worker)));
    let app = build_router(service);

    let listener = TcpListener::bind(cfg.server.listen)
        .await
        .with_context(|| format!("failed to bind {}", cfg.server.listen))?;
    info!(
        addr = %cfg.server.listen,
        retention = cfg.feed.retention,
        poll_timeout_secs = cfg.feed.poll_timeout_secs,
        "serving HTTP"
    );

    let shutdown_feed = Arc::clone(&feed);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = signal::ctrl_c().await;
            info!("shutting down");
            // Parked readers, and any that arrive while connections drain,
            // are answered `reload` instead of holding shutdown for a poll.
            let released = shutdown_feed.close();
            info!(released, "feed closed");
        })
        .await?;

    upstream_task.abort();
    tokio::task::spawn_blocking(move || worker.shutdown()).await?;

    info!("shut down");
    Ok(())
}
