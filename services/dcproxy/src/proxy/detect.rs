//! Distinguishing TLS clients from plaintext NMDC clients.
//!
//! A TLS client speaks first with a handshake record (`0x16 0x03 ...`). A
//! plaintext NMDC client waits for the hub's `$Lock`, so it usually sends
//! nothing at all. The detector peeks at the socket without consuming bytes,
//! leaving them for the TLS acceptor or the relay.

use std::io;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

/// TLS record type of a handshake message.
const TLS_HANDSHAKE: u8 = 0x16;

/// Major version byte of every TLS record version.
const TLS_MAJOR_VERSION: u8 = 0x03;

/// Wait applied when no other is configured.
pub const DEFAULT_DETECT_TIMEOUT: Duration = Duration::from_millis(650);

/// What the client sent first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Detected {
    /// A TLS record header.
    Tls,
    /// Bytes that are not TLS.
    Plain,
    /// Nothing within the wait.
    Silent,
    /// The client closed before sending anything.
    Closed,
}

impl Detected {
    /// Whether the connection should be relayed without TLS.
    pub fn is_plain(&self) -> bool {
        matches!(self, Detected::Plain | Detected::Silent)
    }
}

/// Classify leading bytes. A lone handshake byte counts as TLS.
pub fn classify(prefix: &[u8]) -> Detected {
    match prefix {
        [] => Detected::Closed,
        [TLS_HANDSHAKE] => Detected::Tls,
        [TLS_HANDSHAKE, TLS_MAJOR_VERSION, ..] => Detected::Tls,
        _ => Detected::Plain,
    }
}

/// Peek at the client's first bytes for up to `wait`.
pub async fn detect(stream: &TcpStream, wait: Option<Duration>) -> io::Result<Detected> {
    let mut buf = [0u8; 2];
    let wait = wait.unwrap_or(DEFAULT_DETECT_TIMEOUT);

    match timeout(wait, stream.peek(&mut buf)).await {
        Ok(Ok(n)) => {
            let detected = classify(&buf[..n]);
            debug!(?detected, peeked = n, "Client protocol detected");
            Ok(detected)
        }
        Ok(Err(e)) => Err(e),
        Err(_) => {
            debug!("Client silent, assuming plaintext");
            Ok(Detected::Silent)
        }
    }
}
