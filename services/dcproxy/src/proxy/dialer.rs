//! Upstream hub connections.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::{lookup_host, TcpStream};
use tokio::time::timeout;
use tracing::{debug, trace};

use crate::config::{HubNetwork, Settings};
use crate::error::ProxyError;

/// Opens plaintext connections to the hub.
#[derive(Debug, Clone)]
pub struct UpstreamDialer {
    addr: String,
    network: HubNetwork,
    connect_timeout: Option<Duration>,
}

impl UpstreamDialer {
    pub fn new(
        addr: impl Into<String>,
        network: HubNetwork,
        connect_timeout: Option<Duration>,
    ) -> Self {
        Self {
            addr: addr.into(),
            network,
            connect_timeout,
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(settings.hub_addr.clone(), settings.hub_network, settings.wait)
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Connect to the hub.
    ///
    /// Resolution and every candidate address share one deadline.
    pub async fn dial(&self) -> Result<TcpStream, ProxyError> {
        let attempt = self.connect();
        let result = match self.connect_timeout {
            Some(limit) => match timeout(limit, attempt).await {
                Ok(result) => result,
                Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "connect timeout")),
            },
            None => attempt.await,
        };

        let stream = result.map_err(|source| ProxyError::Dial {
            addr: self.addr.clone(),
            source,
        })?;

        // Nagle only delays small protocol commands.
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "Failed to set TCP_NODELAY on hub connection");
        }
        Ok(stream)
    }

    async fn connect(&self) -> io::Result<TcpStream> {
        let candidates: Vec<SocketAddr> = lookup_host(self.addr.as_str())
            .await?
            .filter(|addr| self.network.admits(addr))
            .collect();

        if candidates.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("no {} address for {}", self.network, self.addr),
            ));
        }

        let mut last_error = None;
        for candidate in candidates {
            trace!(candidate = %candidate, "Dialing hub");
            match TcpStream::connect(candidate).await {
                Ok(stream) => {
                    debug!(hub_addr = %candidate, "Connected to hub");
                    return Ok(stream);
                }
                Err(e) => {
                    debug!(hub_addr = %candidate, error = %e, "Hub candidate failed");
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| io::Error::from(io::ErrorKind::ConnectionRefused)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    const TWO_SECONDS: Duration = Duration::from_secs(2);

    #[tokio::test]
    async fn test_dial_connects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let dialer = UpstreamDialer::new(addr.to_string(), HubNetwork::Tcp4, Some(TWO_SECONDS));
        let stream = dialer.dial().await.unwrap();
        assert_eq!(stream.peer_addr().unwrap(), addr);
        assert!(stream.nodelay().unwrap());
    }

    #[tokio::test]
    async fn test_dial_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let dialer = UpstreamDialer::new(addr.to_string(), HubNetwork::Tcp, Some(TWO_SECONDS));
        let err = dialer.dial().await.unwrap_err();
        assert_eq!(err.reason_code(), "dial_failed");
    }

    #[tokio::test]
    async fn test_dial_respects_deadline() {
        let limit = Duration::from_millis(200);
        let dialer = UpstreamDialer::new("10.255.255.1:411", HubNetwork::Tcp4, Some(limit));

        let started = std::time::Instant::now();
        let err = dialer.dial().await.unwrap_err();
        assert!(started.elapsed() < Duration::from_millis(500));
        assert_eq!(err.reason_code(), "dial_failed");
    }

    #[tokio::test]
    async fn test_network_filter_excludes_family() {
        let dialer = UpstreamDialer::new("127.0.0.1:411", HubNetwork::Tcp6, None);
        match dialer.dial().await {
            Err(ProxyError::Dial { source, .. }) => {
                assert_eq!(source.kind(), io::ErrorKind::AddrNotAvailable)
            }
            other => panic!("expected dial failure, got {other:?}"),
        }
    }
}
