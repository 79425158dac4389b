//! Test harness for dcproxy integration tests.
//!
//! Provides a scripted hub, a proxy handle running the full listener stack,
//! and TLS client helpers.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

use rustls::pki_types::{CertificateDer, ServerName};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, Mutex};
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;

use dcproxy::{CertificateProvider, ListenerSet, ProxyConfig, ProxyStats, Settings};

pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

static INIT_CRYPTO: Once = Once::new();

fn init_crypto_provider() {
    INIT_CRYPTO.call_once(|| {
        rustls::crypto::ring::default_provider()
            .install_default()
            .ok();
    });
}

/// Hub that records what it receives and answers the first read of every
/// connection with a fixed reply.
#[allow(dead_code)]
pub struct ScriptedHub {
    pub addr: SocketAddr,
    pub connections: Arc<AtomicU64>,
    received: Arc<Mutex<Vec<u8>>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

#[allow(dead_code)]
impl ScriptedHub {
    pub async fn spawn(reply: &[u8]) -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let connections = Arc::new(AtomicU64::new(0));
        let received = Arc::new(Mutex::new(Vec::new()));

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let conn_clone = Arc::clone(&connections);
        let received_clone = Arc::clone(&received);
        let reply = reply.to_vec();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accept_result = listener.accept() => {
                        match accept_result {
                            Ok((mut stream, _)) => {
                                conn_clone.fetch_add(1, Ordering::Relaxed);
                                let received = Arc::clone(&received_clone);
                                let reply = reply.clone();
                                tokio::spawn(async move {
                                    let mut buf = vec![0u8; 4096];
                                    let mut replied = false;
                                    loop {
                                        match stream.read(&mut buf).await {
                                            Ok(0) | Err(_) => break,
                                            Ok(n) => {
                                                received.lock().await.extend_from_slice(&buf[..n]);
                                                if !replied && !reply.is_empty() {
                                                    replied = true;
                                                    if stream.write_all(&reply).await.is_err() {
                                                        break;
                                                    }
                                                }
                                            }
                                        }
                                    }
                                });
                            }
                            Err(_) => break,
                        }
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
        });

        Ok(Self {
            addr,
            connections,
            received,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    /// Wait until at least `len` bytes arrived, then return everything
    /// received so far.
    pub async fn wait_for_bytes(&self, len: usize) -> Vec<u8> {
        let deadline = tokio::time::Instant::now() + TEST_TIMEOUT;
        loop {
            {
                let received = self.received.lock().await;
                if received.len() >= len || tokio::time::Instant::now() >= deadline {
                    return received.clone();
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl Drop for ScriptedHub {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// A running proxy bound to ephemeral ports.
#[allow(dead_code)]
pub struct ProxyHandle {
    pub addr: SocketAddr,
    pub stats: Arc<ProxyStats>,
    pub provider: Arc<CertificateProvider>,
    shutdown: CancellationToken,
}

#[allow(dead_code)]
impl ProxyHandle {
    /// Start the proxy. `hosts` defaults to one ephemeral loopback port.
    pub async fn spawn(mut config: ProxyConfig) -> io::Result<Self> {
        if config.hosts.is_empty() {
            config.hosts = "127.0.0.1:0".to_string();
        }

        let settings = Arc::new(Settings::from_config(&config).map_err(io::Error::other)?);
        let provider =
            Arc::new(CertificateProvider::from_settings(&settings).map_err(io::Error::other)?);
        let stats = Arc::new(ProxyStats::new());

        let listeners = ListenerSet::bind(settings, Arc::clone(&provider), stats.clone())
            .await
            .map_err(io::Error::other)?;
        let addr = listeners.local_addrs()[0];

        let shutdown = CancellationToken::new();
        tokio::spawn(listeners.serve(shutdown.clone()));

        Ok(Self {
            addr,
            stats,
            provider,
            shutdown,
        })
    }

    /// Poll the stats until `check` holds or the test timeout passes.
    pub async fn wait_for_stats(
        &self,
        check: impl Fn(&dcproxy::StatsSnapshot) -> bool,
    ) -> dcproxy::StatsSnapshot {
        let deadline = tokio::time::Instant::now() + TEST_TIMEOUT;
        loop {
            let snapshot = self.stats.snapshot();
            if check(&snapshot) || tokio::time::Instant::now() >= deadline {
                return snapshot;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for ProxyHandle {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Hub configuration pointing at `hub`, presenting `chat.example`.
#[allow(dead_code)]
pub fn hub_config(hub: SocketAddr) -> ProxyConfig {
    ProxyConfig {
        hub_addr: hub.to_string(),
        hub_network: "tcp4".to_string(),
        cert_host: "chat.example".to_string(),
        wait: 2000,
        ..ProxyConfig::default()
    }
}

/// An address nothing listens on.
#[allow(dead_code)]
pub async fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

#[allow(dead_code)]
pub async fn tls_client_connect(
    addr: SocketAddr,
    server_name: &str,
    cert_der: &[u8],
) -> io::Result<tokio_rustls::client::TlsStream<TcpStream>> {
    init_crypto_provider();

    let mut root_store = rustls::RootCertStore::empty();
    root_store
        .add(CertificateDer::from(cert_der.to_vec()))
        .map_err(io::Error::other)?;

    let mut config = rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    config.alpn_protocols = vec![b"nmdc".to_vec()];

    let connector = TlsConnector::from(Arc::new(config));
    let stream = TcpStream::connect(addr).await?;
    let server_name = ServerName::try_from(server_name.to_string())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    connector.connect(server_name, stream).await
}
