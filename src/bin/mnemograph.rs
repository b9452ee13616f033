//! mnemograph server binary.
//!
//! Opens (or creates) the data directory, runs recovery, and serves Bolt and
//! HTTP until SIGINT/SIGTERM.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use mnemograph::auth::AuthService;
use mnemograph::auth::audit::AuditLogger;
use mnemograph::config::Config;
use mnemograph::graph::Graph;
use mnemograph::server::Server;

#[derive(Parser, Debug)]
#[command(name = "mnemograph", version, about = "Property graph database with hybrid search")]
struct Args {
    /// Path to a JSON config file. Defaults apply for anything omitted.
    #[arg(long, env = "MNEMOGRAPH_CONFIG")]
    config: Option<PathBuf>,

    /// Base data directory (overrides the config file).
    #[arg(long, env = "MNEMOGRAPH_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Bolt listener port (overrides the config file).
    #[arg(long, env = "MNEMOGRAPH_BOLT_PORT")]
    bolt_port: Option<u16>,

    /// HTTP listener port (overrides the config file).
    #[arg(long, env = "MNEMOGRAPH_HTTP_PORT")]
    http_port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    if let Some(data_dir) = args.data_dir {
        config.data_dir = data_dir;
    }
    if let Some(port) = args.bolt_port {
        config.server.bolt_port = port;
    }
    if let Some(port) = args.http_port {
        config.server.http_port = port;
    }

    info!(data_dir = %config.data_dir.display(), "starting mnemograph");
    let audit = AuditLogger::open(config.audit_log_path()).await?;
    let auth = Arc::new(AuthService::new(&config.auth));
    let graph = Graph::open(config).await?;

    let server = Server::new(graph.clone(), auth, audit.clone());
    server.start().await?;

    shutdown_signal().await;
    info!("shutdown signal received");
    server.stop();
    graph.shutdown().await;
    audit.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut term =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
