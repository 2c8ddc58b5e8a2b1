//! MockProxy - Main entry point
//!
//! A local intercepting HTTP/HTTPS proxy that serves mock responses

use anyhow::{Context, Result};
use clap::Parser;
use mockproxy::{CertificateAuthority, Forwarder, ProxyConfig, ProxyServer, RuleStore, TrafficLog};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// MockProxy - A local intercepting HTTP/HTTPS proxy
#[derive(Parser, Debug)]
#[command(name = "mockproxy")]
#[command(author = "MockProxy Contributors")]
#[command(version = "1.0.0")]
#[command(about = "A local intercepting HTTP/HTTPS proxy with mock responses")]
struct Args {
    /// Proxy port, also serves the management UI on loopback
    #[arg(long, env = "PROXY_PORT", default_value = "9292")]
    port: u16,

    /// Address to bind
    #[arg(long, env = "BIND_ADDR", default_value = "0.0.0.0")]
    bind: String,

    /// Rule database path
    #[arg(long, env = "DB_PATH", default_value = "./data/rules.db")]
    db_path: PathBuf,

    /// Directory holding ca.crt and ca.key
    #[arg(long, env = "CERTS_DIR", default_value = ".")]
    certs_dir: PathBuf,

    /// Management UI directory
    #[arg(long, env = "UI_DIR", default_value = "./dist")]
    ui_dir: PathBuf,

    /// Number of traffic records kept in memory
    #[arg(long, env = "MAX_LOGS", default_value = "500")]
    max_logs: usize,

    /// Log level
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    info!("Starting MockProxy v1.0.0");

    // The proxy cannot intercept anything without a root credential
    let certs_dir = args.certs_dir.clone();
    let ca = tokio::task::spawn_blocking(move || CertificateAuthority::initialize(certs_dir))
        .await?
        .context("Failed to initialize certificate authority")?;
    info!("Certificate authority ready in: {}", args.certs_dir.display());

    let store = Arc::new(RuleStore::open(&args.db_path).context("Failed to open rule database")?);
    info!("Rule database initialized at: {}", store.db_path());

    let traffic = Arc::new(TrafficLog::new(args.max_logs));
    info!("Keeping the last {} traffic records", traffic.capacity());
    let forwarder = Forwarder::new()?;

    let config = ProxyConfig {
        bind_addr: args.bind,
        port: args.port,
        ui_dir: args.ui_dir,
    };

    info!(
        "Management UI: http://localhost:{}/ (root certificate at /ca.crt)",
        config.port
    );

    let server = Arc::new(ProxyServer::new(config, Arc::new(ca), store, traffic, forwarder));
    server.run().await?;

    Ok(())
}
