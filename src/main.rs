use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};

use cloudproxy::config::{self, CliOverrides, Config};
use cloudproxy::error::Result;
use cloudproxy::proxy::{ProxyServer, TelemetryHooks, TlsHandler};
use cloudproxy::telemetry::{HitCounters, TelemetryTransport};

#[derive(Parser, Debug)]
#[command(name = "cloudproxy")]
#[command(about = "Intercepting HTTP(S) proxy that reports per-request usage to Graphite", long_about = None)]
struct Args {
    /// Path to configuration file (YAML/JSON/TOML)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Your MITM CA certificate (PEM)
    #[arg(long, value_name = "FILE")]
    pemfile: Option<PathBuf>,

    /// Private key of the MITM CA (unencrypted PEM)
    #[arg(long, value_name = "FILE")]
    keyfile: Option<PathBuf>,

    /// IP to listen on
    #[arg(long)]
    address: Option<String>,

    /// Port to listen on
    #[arg(long)]
    port: Option<u16>,

    /// The header to use for correlating requests
    #[arg(long, alias = "tracking_header")]
    tracking_header: Option<String>,

    /// Size of the sample queue. Samples beyond this block the proxy!
    #[arg(long, alias = "batch_size")]
    batch_size: Option<usize>,

    /// ip:port of the graphite server to use
    #[arg(long, alias = "graphite_server")]
    graphite_server: Option<String>,

    /// The prefix for all metrics
    #[arg(long, alias = "metric_prefix")]
    metric_prefix: Option<String>,

    /// Enable debug logging (warning: really noisy!)
    #[arg(short, long)]
    debug: bool,
}

impl Args {
    fn overrides(&self) -> CliOverrides {
        CliOverrides {
            ca_cert_path: self.pemfile.clone(),
            ca_key_path: self.keyfile.clone(),
            address: self.address.clone(),
            port: self.port,
            tracking_header: self.tracking_header.clone(),
            queue_capacity: self.batch_size,
            graphite_server: self.graphite_server.clone(),
            metric_prefix: self.metric_prefix.clone(),
            debug: self.debug,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => config::load_from_path(path).await?,
        None => config::load_from_env_or_file().await?,
    };
    args.overrides().apply(&mut config);

    init_tracing(&config);
    if let Some(path) = &args.config {
        info!("Configuration loaded from {}", path.display());
    }

    if let Err(e) = config::validate(&config) {
        error!("Invalid configuration: {}", e);
        return Err(e);
    }

    run(config).await
}

fn init_tracing(config: &Config) {
    let log_level = if config.debug { "debug" } else { "info" };
    let directive = format!("cloudproxy={log_level}");

    let mut filter = tracing_subscriber::EnvFilter::from_default_env();
    match directive.parse::<tracing_subscriber::filter::Directive>() {
        Ok(parsed) => filter = filter.add_directive(parsed),
        Err(e) => eprintln!("Ignoring log directive {}: {}", directive, e),
    }

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run(config: Config) -> Result<()> {
    // CA problems abort before anything is listening
    let tls = match TlsHandler::from_pem_files(&config.tls.ca_cert_path, &config.tls.ca_key_path) {
        Ok(tls) => Arc::new(tls),
        Err(e) => {
            error!("Failed to load MITM CA: {}", e);
            return Err(e.into());
        }
    };

    // Runs for the life of the process; no explicit stop
    let (sender, _transport) = TelemetryTransport::new(&config.telemetry).spawn();

    let hits = Arc::new(HitCounters::new());
    let hooks = TelemetryHooks::from_config(&config, hits, sender)?;

    info!("Starting cloudproxy");
    info!(
        tracking_header = %config.proxy.tracking_header,
        metric_prefix = %config.telemetry.metric_prefix,
        queue_capacity = config.telemetry.queue_capacity,
        "Telemetry configured"
    );

    let server = ProxyServer::new(config.proxy.listen_addr(), tls, hooks);
    server.run(shutdown_signal()).await?;

    info!("Shutting down cloudproxy");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received terminate signal");
        },
    }
}
