//! Client listeners and connection handling.
//!
//! A [`ListenerSet`] binds one TCP listener per configured `host:port`
//! entry. Each accepted connection runs in its own task:
//!
//! ```text
//! accept -> [plain detection] -> TLS handshake (SNI -> certificate) -> pipe
//! ```
//!
//! Connection failures stay inside their task. Accept failures are counted
//! and the loop backs off briefly. Every phase of a connection, detection
//! and handshake included, ends when shutdown is requested.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rustls::server::Acceptor;
use rustls::ProtocolVersion;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_rustls::server::TlsStream;
use tokio_rustls::LazyConfigAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, trace, warn, Instrument};

use super::certs::CertificateProvider;
use super::detect::{detect, Detected};
use super::dialer::UpstreamDialer;
use super::pipe::{ConnectionPipe, RelayOptions, Transport};
use crate::config::Settings;
use crate::error::ProxyError;
use crate::metrics::{MetricsSink, ProxyEvent};

/// Pause after a failed accept.
pub const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// State shared by every connection task.
struct Shared {
    settings: Arc<Settings>,
    provider: Arc<CertificateProvider>,
    sink: Arc<dyn MetricsSink>,
    dialer: UpstreamDialer,
    relay: Arc<RelayOptions>,
}

/// The bound client listeners.
pub struct ListenerSet {
    listeners: Vec<(TcpListener, SocketAddr)>,
    shared: Arc<Shared>,
}

impl ListenerSet {
    /// Bind every configured entry. Any unbindable address fails the set.
    pub async fn bind(
        settings: Arc<Settings>,
        provider: Arc<CertificateProvider>,
        sink: Arc<dyn MetricsSink>,
    ) -> Result<Self, ProxyError> {
        let mut listeners = Vec::with_capacity(settings.bindings.len());

        for binding in &settings.bindings {
            let listener = TcpListener::bind((binding.host.as_str(), binding.port))
                .await
                .map_err(|source| ProxyError::Bind {
                    addr: binding.to_string(),
                    source,
                })?;
            let local_addr = listener.local_addr().map_err(|source| ProxyError::Bind {
                addr: binding.to_string(),
                source,
            })?;

            info!(
                bind_addr = %local_addr,
                entry = %binding,
                allow_plain = settings.allow_plain,
                "Listener bound"
            );
            listeners.push((listener, local_addr));
        }

        let shared = Shared {
            dialer: UpstreamDialer::from_settings(&settings),
            relay: Arc::new(RelayOptions::from_settings(&settings)),
            settings,
            provider,
            sink,
        };

        Ok(Self {
            listeners,
            shared: Arc::new(shared),
        })
    }

    /// Addresses actually bound, in configuration order.
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.listeners.iter().map(|(_, addr)| *addr).collect()
    }

    /// Accept connections until `shutdown` is cancelled, then wait for live
    /// connections to close.
    pub async fn serve(self, shutdown: CancellationToken) -> Result<(), ProxyError> {
        let tracker = TaskTracker::new();
        let mut loops = JoinSet::new();

        for (listener, local_addr) in self.listeners {
            let shared = Arc::clone(&self.shared);
            let tracker = tracker.clone();
            let shutdown = shutdown.clone();
            loops.spawn(accept_loop(listener, local_addr, shared, tracker, shutdown));
        }

        let mut result = Ok(());
        while let Some(joined) = loops.join_next().await {
            let outcome = match joined {
                Ok(outcome) => outcome,
                Err(e) => Err(ProxyError::Accept(io::Error::other(e))),
            };
            if let Err(e) = outcome {
                error!(error = %e, "Listener failed, shutting down");
                shutdown.cancel();
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }

        tracker.close();
        let live = tracker.len();
        if live > 0 {
            info!(connections = live, "Waiting for connections to close");
        }
        tracker.wait().await;
        info!("Listeners stopped");
        result
    }
}

async fn accept_loop(
    listener: TcpListener,
    local_addr: SocketAddr,
    shared: Arc<Shared>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
) -> Result<(), ProxyError> {
    info!(bind_addr = %local_addr, "Listener started");

    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = shutdown.cancelled() => break,
        };

        match accepted {
            Ok((stream, peer)) => {
                shared.sink.record(ProxyEvent::ConnectionAccepted);

                let pipe = ConnectionPipe::new(
                    peer,
                    Arc::clone(&shared.relay),
                    Arc::clone(&shared.sink),
                    shutdown.child_token(),
                );
                let span = tracing::info_span!("connection", peer = %peer, conn_id = %pipe.id());
                let shared = Arc::clone(&shared);

                tracker.spawn(handle_connection(shared, stream, pipe).instrument(span));
            }
            Err(e) => {
                shared.sink.record(ProxyEvent::AcceptFailed);
                match classify_accept_error(&e) {
                    AcceptError::Peer => {
                        if shared.settings.log_errors {
                            warn!(bind_addr = %local_addr, error = %e, "Accept error");
                        } else {
                            debug!(bind_addr = %local_addr, error = %e, "Accept error");
                        }
                    }
                    AcceptError::Exhausted => {
                        error!(
                            bind_addr = %local_addr,
                            error = %e,
                            "Accept failed, out of resources"
                        );
                    }
                    AcceptError::Fatal => return Err(ProxyError::Accept(e)),
                }
                // Brief sleep to avoid tight loop on persistent errors
                tokio::select! {
                    _ = tokio::time::sleep(ACCEPT_BACKOFF) => {}
                    _ = shutdown.cancelled() => break,
                }
            }
        }
    }

    info!(bind_addr = %local_addr, "Listener stopped");
    Ok(())
}

enum AcceptError {
    /// The peer went away during accept.
    Peer,
    /// Descriptor or memory limits; may clear once connections close.
    Exhausted,
    /// The listening socket itself is unusable.
    Fatal,
}

// EMFILE, ENFILE, ENOBUFS, ENOMEM on Linux.
const EXHAUSTION_ERRNOS: &[i32] = &[24, 23, 105, 12];

fn classify_accept_error(e: &io::Error) -> AcceptError {
    match e.kind() {
        io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionRefused
        | io::ErrorKind::Interrupted
        | io::ErrorKind::WouldBlock
        | io::ErrorKind::TimedOut => AcceptError::Peer,
        io::ErrorKind::OutOfMemory => AcceptError::Exhausted,
        _ if e
            .raw_os_error()
            .is_some_and(|code| EXHAUSTION_ERRNOS.contains(&code)) =>
        {
            AcceptError::Exhausted
        }
        _ => AcceptError::Fatal,
    }
}

async fn handle_connection(shared: Arc<Shared>, stream: TcpStream, pipe: ConnectionPipe) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(error = %e, "Failed to set TCP_NODELAY on client connection");
    }

    let shutdown = pipe.cancellation().clone();

    if shared.settings.allow_plain {
        let detected = tokio::select! {
            detected = detect(&stream, shared.settings.wait) => Some(detected),
            _ = shutdown.cancelled() => None,
        };
        match detected {
            None => {
                debug!("Shutdown before the client spoke");
                return;
            }
            Some(Ok(Detected::Closed)) => {
                debug!("Client closed before sending data");
                return;
            }
            Some(Ok(detected)) if detected.is_plain() => {
                relay(pipe, stream, &shared.dialer, Transport::Plain).await;
                return;
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                report_handshake_failure(&shared, &ProxyError::Handshake(e));
                return;
            }
        }
    }

    let started = Instant::now();
    let handshake = async {
        let handshake = accept_tls(&shared.provider, stream);
        match shared.settings.wait {
            Some(limit) => timeout(limit, handshake)
                .await
                .unwrap_or(Err(ProxyError::HandshakeTimeout)),
            None => handshake.await,
        }
    };
    let result = tokio::select! {
        result = handshake => Some(result),
        _ = shutdown.cancelled() => None,
    };

    let tls = match result {
        Some(Ok(tls)) => tls,
        Some(Err(e)) => {
            report_handshake_failure(&shared, &e);
            return;
        }
        None => {
            debug!("Shutdown during TLS handshake");
            return;
        }
    };

    let duration = started.elapsed();
    shared
        .sink
        .record(ProxyEvent::HandshakeCompleted { duration });

    let (_, session) = tls.get_ref();
    let transport = match session.protocol_version() {
        Some(ProtocolVersion::TLSv1_3) => Transport::Tls13,
        _ => Transport::Tls12,
    };
    debug!(
        sni = session.server_name().unwrap_or("-"),
        version = transport.announced_version(),
        handshake_ms = duration.as_millis() as u64,
        "TLS handshake completed"
    );

    relay(pipe, tls, &shared.dialer, transport).await;
}

/// Run the pipe to completion. Failures were logged and counted by the pipe.
async fn relay<C>(pipe: ConnectionPipe, client: C, dialer: &UpstreamDialer, transport: Transport)
where
    C: AsyncRead + AsyncWrite + Unpin,
{
    match pipe.run(client, dialer, transport).await {
        Ok(report) => trace!(termination = ?report.termination, "Connection finished"),
        Err(e) => trace!(reason = e.reason_code(), "Connection ended before relaying"),
    }
}

/// Read the ClientHello, pick the certificate for its SNI, finish the
/// handshake.
async fn accept_tls(
    provider: &CertificateProvider,
    stream: TcpStream,
) -> Result<TlsStream<TcpStream>, ProxyError> {
    let start = LazyConfigAcceptor::new(Acceptor::default(), stream)
        .await
        .map_err(ProxyError::Handshake)?;

    let sni = start.client_hello().server_name().map(str::to_string);
    let record = provider.resolve(sni.as_deref()).await?;
    debug!(sni = sni.as_deref().unwrap_or("-"), host = %record.host(), "Certificate selected");

    start
        .into_stream(record.server_config())
        .await
        .map_err(ProxyError::Handshake)
}

fn report_handshake_failure(shared: &Shared, e: &ProxyError) {
    shared.sink.record(ProxyEvent::HandshakeFailed);
    if shared.settings.log_errors {
        warn!(error = %e, reason = e.reason_code(), "Handshake failed");
    } else {
        debug!(error = %e, reason = e.reason_code(), "Handshake failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProxyConfig;
    use crate::metrics::ProxyStats;
    use crate::proxy::certs::TlsProfile;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn settings(hub: SocketAddr, extra: impl FnOnce(&mut ProxyConfig)) -> Arc<Settings> {
        let mut config = ProxyConfig {
            hub_addr: hub.to_string(),
            hosts: "127.0.0.1:0".to_string(),
            wait: 500,
            ..ProxyConfig::default()
        };
        extra(&mut config);
        Arc::new(Settings::from_config(&config).unwrap())
    }

    fn provider() -> Arc<CertificateProvider> {
        Arc::new(CertificateProvider::generating(
            "dcproxy".to_string(),
            None,
            Vec::new(),
            TlsProfile::default(),
        ))
    }

    #[test]
    fn test_accept_error_classification() {
        let peer = io::Error::from(io::ErrorKind::ConnectionAborted);
        assert!(matches!(classify_accept_error(&peer), AcceptError::Peer));

        let exhausted = io::Error::from_raw_os_error(24);
        assert!(matches!(classify_accept_error(&exhausted), AcceptError::Exhausted));

        let fatal = io::Error::from(io::ErrorKind::InvalidInput);
        assert!(matches!(classify_accept_error(&fatal), AcceptError::Fatal));
    }

    #[tokio::test]
    async fn test_bind_reports_ephemeral_ports() {
        let hub: SocketAddr = "127.0.0.1:411".parse().unwrap();
        let set = ListenerSet::bind(
            settings(hub, |c| c.hosts = "127.0.0.1:0,127.0.0.2:0".to_string()),
            provider(),
            Arc::new(ProxyStats::new()),
        )
        .await;

        // 127.0.0.2 is not bindable everywhere.
        if let Ok(set) = set {
            let addrs = set.local_addrs();
            assert_eq!(addrs.len(), 2);
            assert!(addrs.iter().all(|a| a.port() != 0));
        }
    }

    #[tokio::test]
    async fn test_bind_conflict_is_fatal() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = taken.local_addr().unwrap().port();
        let hub: SocketAddr = "127.0.0.1:411".parse().unwrap();

        let err = ListenerSet::bind(
            settings(hub, |c| c.hosts = format!("127.0.0.1:{port}")),
            provider(),
            Arc::new(ProxyStats::new()),
        )
        .await
        .err()
        .unwrap();
        assert!(err.is_startup_fatal());
        assert_eq!(err.reason_code(), "bind_failed");
    }

    async fn assert_serve_stops_with_silent_client(extra: impl FnOnce(&mut ProxyConfig)) {
        let hub = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let stats = Arc::new(ProxyStats::new());
        let set = ListenerSet::bind(
            settings(hub.local_addr().unwrap(), extra),
            provider(),
            stats.clone(),
        )
        .await
        .unwrap();
        let proxy_addr = set.local_addrs()[0];
        let shutdown = CancellationToken::new();
        let serving = tokio::spawn(set.serve(shutdown.clone()));

        let mut client = TcpStream::connect(proxy_addr).await.unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while stats.snapshot().connections_accepted == 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(stats.snapshot().connections_accepted, 1);

        shutdown.cancel();
        timeout(Duration::from_secs(3), serving)
            .await
            .expect("serve did not stop")
            .unwrap()
            .unwrap();

        let mut buf = [0u8; 8];
        let closed = timeout(Duration::from_secs(3), client.read(&mut buf)).await.unwrap();
        assert!(matches!(closed, Ok(0) | Err(_)));
        assert_eq!(stats.snapshot().handshake_errors, 0);
    }

    #[tokio::test]
    async fn test_shutdown_during_pending_handshake() {
        assert_serve_stops_with_silent_client(|c| c.wait = 0).await;
    }

    #[tokio::test]
    async fn test_shutdown_during_detection() {
        assert_serve_stops_with_silent_client(|c| {
            c.wait = 0;
            c.allow_plain = true;
        })
        .await;
    }

    #[tokio::test]
    async fn test_silent_plain_client_is_relayed() {
        let hub = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let hub_addr = hub.local_addr().unwrap();
        let stats = Arc::new(ProxyStats::new());

        let set = ListenerSet::bind(
            settings(hub_addr, |c| {
                c.allow_plain = true;
                c.wait = 100;
                c.idle = Some(5000);
            }),
            provider(),
            stats.clone(),
        )
        .await
        .unwrap();
        let proxy_addr = set.local_addrs()[0];
        let shutdown = CancellationToken::new();
        let serving = tokio::spawn(set.serve(shutdown.clone()));

        let mut client = TcpStream::connect(proxy_addr).await.unwrap();
        let (mut upstream, _) = timeout(Duration::from_secs(5), hub.accept())
            .await
            .unwrap()
            .unwrap();

        upstream.write_all(b"$Lock x|").await.unwrap();
        let mut buf = [0u8; 8];
        timeout(Duration::from_secs(5), client.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf, b"$Lock x|");

        shutdown.cancel();
        timeout(Duration::from_secs(5), serving)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(stats.snapshot().plain_opened, 1);
        assert_eq!(stats.snapshot().connections_closed, 1);
    }
}
