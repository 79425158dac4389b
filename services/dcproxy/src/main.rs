//! dcproxy
//!
//! TLS-terminating relay in front of a plaintext NMDC hub.
//!
//! This binary:
//! - Listens on every configured `host:port` entry
//! - Terminates TLS, presenting a static or generated certificate per SNI name
//! - Relays each client to the hub, optionally scrubbing `$MyIP` addresses
//! - Exposes Prometheus metrics when a metrics address is set

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use dcproxy::{
    CertSource, CertificateProvider, Fanout, ListenerSet, MetricsFacade, MetricsSink, ProxyConfig,
    ProxyStats, Settings,
};

/// Command-line flags. Every flag can also be set through its `DCPROXY_*`
/// environment variable.
#[derive(Debug, Parser)]
#[command(name = "dcproxy", version, about = "TLS proxy for NMDC hubs")]
struct Args {
    /// Hub address to relay to
    #[arg(long, env = "DCPROXY_HUB", default_value = "127.0.0.1:411")]
    hub: String,

    /// Hub network (tcp, tcp4, tcp6)
    #[arg(long, env = "DCPROXY_HUB_NETWORK", default_value = "tcp4")]
    hub_network: String,

    /// Comma-separated host:port entries to listen on
    #[arg(long, env = "DCPROXY_HOSTS", default_value = ":412")]
    hosts: String,

    /// PEM certificate chain
    #[arg(long, env = "DCPROXY_CERT", default_value = "")]
    cert: String,

    /// PEM private key
    #[arg(long, env = "DCPROXY_KEY", default_value = "")]
    key: String,

    /// Organization for generated certificates
    #[arg(long, env = "DCPROXY_CERT_ORG", default_value = "")]
    cert_org: String,

    /// Host name for generated certificates
    #[arg(long, env = "DCPROXY_CERT_HOST", default_value = "")]
    cert_host: String,

    /// Profiler address (not supported)
    #[arg(long, env = "DCPROXY_PPROF", default_value = "")]
    pprof: String,

    /// Prometheus metrics address
    #[arg(long, env = "DCPROXY_METRICS", default_value = "")]
    metrics: String,

    /// Log connection errors
    #[arg(long, env = "DCPROXY_LOG_ERRORS")]
    log_errors: bool,

    /// Dial and idle timeout in milliseconds (0 disables)
    #[arg(long, env = "DCPROXY_WAIT", default_value_t = 650)]
    wait: u64,

    /// Idle-read timeout in milliseconds (0 disables)
    #[arg(long, env = "DCPROXY_IDLE", default_value_t = 300_000)]
    idle: u64,

    /// Relay buffer size in KB
    #[arg(long, env = "DCPROXY_BUFFER", default_value_t = 10)]
    buffer: usize,

    /// Replace client addresses in $MyIP commands
    #[arg(long, env = "DCPROXY_NO_SEND_IP")]
    no_send_ip: bool,

    /// Accept plaintext clients as well as TLS
    #[arg(long, env = "DCPROXY_ALLOW_PLAIN")]
    allow_plain: bool,

    /// Send the client address to the hub before relaying
    #[arg(long, env = "DCPROXY_ANNOUNCE_IP")]
    announce_ip: bool,

    /// Minimum TLS version (1.2, 1.3)
    #[arg(long, env = "DCPROXY_MIN_TLS", default_value = "1.2")]
    min_tls: String,

    /// Log level when RUST_LOG is unset
    #[arg(long, env = "DCPROXY_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

impl Args {
    fn to_config(&self) -> ProxyConfig {
        ProxyConfig {
            hub_addr: self.hub.clone(),
            hub_network: self.hub_network.clone(),
            hosts: self.hosts.clone(),
            cert: self.cert.clone(),
            key: self.key.clone(),
            cert_org: self.cert_org.clone(),
            cert_host: self.cert_host.clone(),
            pprof: self.pprof.clone(),
            metrics: self.metrics.clone(),
            log_errors: self.log_errors,
            wait: self.wait,
            buffer: self.buffer,
            no_send_ip: self.no_send_ip,
            idle: Some(self.idle),
            allow_plain: self.allow_plain,
            announce_ip: self.announce_ip,
            min_tls: self.min_tls.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize tracing (prefer RUST_LOG, fallback to DCPROXY_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| args.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let settings = Settings::from_config(&args.to_config()).context("Invalid configuration")?;
    let settings = Arc::new(settings);

    info!("Starting dcproxy");
    info!(
        hub_addr = %settings.hub_addr,
        hub_network = %settings.hub_network,
        listener_count = settings.bindings.len(),
        static_cert = matches!(settings.certs, CertSource::Static { .. }),
        no_send_ip = settings.no_send_ip,
        allow_plain = settings.allow_plain,
        "Configuration loaded"
    );

    if let Some(pprof) = &settings.pprof {
        warn!(pprof_addr = %pprof, "Profiling endpoint is not supported, ignoring");
    }

    let stats = Arc::new(ProxyStats::new());
    let mut sink = Fanout::new().with(stats.clone());
    if let Some(addr) = settings.metrics {
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("Failed to start metrics exporter")?;
        info!(metrics_addr = %addr, "Metrics exporter listening");
        sink = sink.with(Arc::new(MetricsFacade));
    }
    let sink: Arc<dyn MetricsSink> = Arc::new(sink);

    let provider = CertificateProvider::from_settings(&settings)
        .context("Failed to load TLS certificate")?;
    let listeners = ListenerSet::bind(Arc::clone(&settings), Arc::new(provider), sink)
        .await
        .context("Failed to bind listeners")?;

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown signal received");
                signal.cancel();
            }
            Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
        }
    });

    listeners.serve(shutdown).await?;

    let snapshot = stats.snapshot();
    info!(
        accepted = snapshot.connections_accepted,
        bytes_to_hub = snapshot.bytes_to_hub,
        bytes_to_client = snapshot.bytes_to_client,
        "dcproxy stopped"
    );
    Ok(())
}
