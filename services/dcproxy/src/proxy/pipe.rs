//! Relaying one client connection to the hub.
//!
//! A [`ConnectionPipe`] owns an accepted client connection and its hub
//! connection. Its states only move forward:
//!
//! ```text
//! Dialing -> Relaying -> Closing -> Closed
//! ```
//!
//! Both relay directions run inside one `select!`: the first direction to
//! end (EOF, I/O error, idle timeout) or an external shutdown ends the other.
//! On the way out, bytes the scrubber still holds are written to the hub
//! unmodified, then both write halves are shut down before the pipe reports.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::dialer::UpstreamDialer;
use super::scrub::{Carry, ProtocolScrubber};
use crate::config::Settings;
use crate::error::ProxyError;
use crate::metrics::{MetricsSink, ProxyEvent};

/// Time allowed for shutting down both connections.
pub const DEFAULT_CLOSE_GRACE: Duration = Duration::from_secs(2);

static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Process-unique connection identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// How the client side is carried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Tls13,
    Tls12,
    Plain,
}

impl Transport {
    pub fn is_tls(&self) -> bool {
        !matches!(self, Transport::Plain)
    }

    /// Version string sent in the hub greeting.
    pub fn announced_version(&self) -> &'static str {
        match self {
            Transport::Tls13 => "1.3",
            Transport::Tls12 => "1.2",
            Transport::Plain => "0.0",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeState {
    Dialing,
    Relaying,
    Closing,
    Closed,
}

/// Relay direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ToHub,
    ToClient,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::ToHub => write!(f, "client->hub"),
            Direction::ToClient => write!(f, "hub->client"),
        }
    }
}

/// Why a pipe stopped relaying.
#[derive(Debug)]
pub enum Termination {
    ClientEof,
    HubEof,
    IdleTimeout(Direction),
    Failed(Direction, io::Error),
    Shutdown,
}

impl Termination {
    pub fn is_error(&self) -> bool {
        matches!(self, Termination::Failed(..))
    }

    /// The relay error, for failed pipes.
    pub fn into_error(self) -> Option<ProxyError> {
        match self {
            Termination::Failed(_, e) => Some(ProxyError::Relay(e)),
            _ => None,
        }
    }
}

/// Outcome of a finished pipe.
#[derive(Debug)]
pub struct PipeReport {
    pub id: ConnectionId,
    pub termination: Termination,
    pub duration: Duration,
    pub bytes_to_hub: u64,
    pub bytes_to_client: u64,
    pub scrubbed: u64,
}

/// Per-connection relay parameters, shared by all pipes.
#[derive(Debug, Clone)]
pub struct RelayOptions {
    /// Buffer size per direction in bytes.
    pub buffer_size: usize,
    /// Idle-read timeout per direction.
    pub idle_timeout: Option<Duration>,
    /// Rewrites client->hub address tokens when set.
    pub scrubber: Option<ProtocolScrubber>,
    /// Send `$MyIP <client> <version>|` to the hub before relaying.
    pub announce_ip: bool,
    pub log_errors: bool,
    pub close_grace: Duration,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            buffer_size: crate::config::DEFAULT_BUFFER_KB * 1024,
            idle_timeout: None,
            scrubber: None,
            announce_ip: false,
            log_errors: false,
            close_grace: DEFAULT_CLOSE_GRACE,
        }
    }
}

impl RelayOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            buffer_size: settings.buffer_size,
            idle_timeout: settings.idle,
            scrubber: settings.no_send_ip.then(ProtocolScrubber::default),
            announce_ip: settings.announce_ip,
            log_errors: settings.log_errors,
            close_grace: DEFAULT_CLOSE_GRACE,
        }
    }
}

/// One client connection and its hub connection.
pub struct ConnectionPipe {
    id: ConnectionId,
    peer: SocketAddr,
    state: PipeState,
    created: Instant,
    options: Arc<RelayOptions>,
    sink: Arc<dyn MetricsSink>,
    shutdown: CancellationToken,
}

impl ConnectionPipe {
    pub fn new(
        peer: SocketAddr,
        options: Arc<RelayOptions>,
        sink: Arc<dyn MetricsSink>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            id: ConnectionId::new(),
            peer,
            state: PipeState::Dialing,
            created: Instant::now(),
            options,
            sink,
            shutdown,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> PipeState {
        self.state
    }

    /// Token that ends this pipe, in any phase.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Dial the hub and relay until either side ends.
    ///
    /// Returns an error only when the hub could not be reached; the client
    /// has been shut down by then. A shutdown while dialing ends the pipe
    /// with [`Termination::Shutdown`] and nothing relayed.
    pub async fn run<C>(
        mut self,
        mut client: C,
        dialer: &UpstreamDialer,
        transport: Transport,
    ) -> Result<PipeReport, ProxyError>
    where
        C: AsyncRead + AsyncWrite + Unpin,
    {
        let dialed = tokio::select! {
            dialed = dialer.dial() => Some(dialed),
            _ = self.shutdown.cancelled() => None,
        };

        let hub = match dialed {
            Some(Ok(hub)) => hub,
            None => {
                debug!(conn_id = %self.id, "Shutdown while dialing hub");
                self.abandon(&mut client).await;
                return Ok(PipeReport {
                    id: self.id,
                    termination: Termination::Shutdown,
                    duration: self.created.elapsed(),
                    bytes_to_hub: 0,
                    bytes_to_client: 0,
                    scrubbed: 0,
                });
            }
            Some(Err(e)) => {
                self.sink.record(ProxyEvent::DialFailed);
                if self.options.log_errors {
                    warn!(conn_id = %self.id, error = %e, "Hub dial failed");
                } else {
                    debug!(conn_id = %self.id, error = %e, "Hub dial failed");
                }
                self.abandon(&mut client).await;
                return Err(e);
            }
        };

        Ok(self.splice(client, hub, transport).await)
    }

    /// Close a client that never reached the relaying state.
    async fn abandon<C>(&mut self, client: &mut C)
    where
        C: AsyncWrite + Unpin,
    {
        self.advance(PipeState::Closing);
        let _ = timeout(self.options.close_grace, client.shutdown()).await;
        self.advance(PipeState::Closed);
    }

    /// Relay between an established client and hub connection.
    pub async fn splice<C, H>(mut self, client: C, hub: H, transport: Transport) -> PipeReport
    where
        C: AsyncRead + AsyncWrite + Unpin,
        H: AsyncRead + AsyncWrite + Unpin,
    {
        self.advance(PipeState::Relaying);
        self.sink.record(ProxyEvent::ConnectionOpened {
            tls: transport.is_tls(),
        });

        let bytes_to_hub = AtomicU64::new(0);
        let bytes_to_client = AtomicU64::new(0);
        let scrubbed = AtomicU64::new(0);

        let (mut client_read, mut client_write) = tokio::io::split(client);
        let (mut hub_read, mut hub_write) = tokio::io::split(hub);

        // Held by the client->hub scrubber across chunks; outlives the relay
        // futures so it can be flushed however they end.
        let mut carry = Carry::default();
        let mut no_carry = Carry::default();

        let termination = match self.announce(&mut hub_write, transport).await {
            Err(e) => Termination::Failed(Direction::ToHub, e),
            Ok(()) => {
                let to_hub = Relay {
                    buffer_size: self.options.buffer_size,
                    idle_timeout: self.options.idle_timeout,
                    scrubber: self.options.scrubber.as_ref(),
                    bytes: &bytes_to_hub,
                    scrubbed: &scrubbed,
                };
                let to_client = Relay {
                    buffer_size: self.options.buffer_size,
                    idle_timeout: self.options.idle_timeout,
                    scrubber: None,
                    bytes: &bytes_to_client,
                    scrubbed: &scrubbed,
                };

                tokio::select! {
                    end = to_hub.copy(&mut client_read, &mut hub_write, &mut carry) => {
                        end.into_termination(Direction::ToHub)
                    }
                    end = to_client.copy(&mut hub_read, &mut client_write, &mut no_carry) => {
                        end.into_termination(Direction::ToClient)
                    }
                    _ = self.shutdown.cancelled() => Termination::Shutdown,
                }
            }
        };

        self.advance(PipeState::Closing);
        let _ = timeout(self.options.close_grace, async {
            if let Some(scrubber) = &self.options.scrubber {
                let rest = scrubber.finish(std::mem::take(&mut carry));
                match write_chunk(&mut hub_write, &rest).await {
                    Ok(len) => {
                        bytes_to_hub.fetch_add(len as u64, Ordering::Relaxed);
                    }
                    Err(e) => {
                        debug!(conn_id = %self.id, error = %e, "Failed to flush held bytes");
                    }
                }
            }
            let _ = tokio::join!(hub_write.shutdown(), client_write.shutdown());
        })
        .await;
        self.advance(PipeState::Closed);

        let report = PipeReport {
            id: self.id,
            termination,
            duration: self.created.elapsed(),
            bytes_to_hub: bytes_to_hub.load(Ordering::Relaxed),
            bytes_to_client: bytes_to_client.load(Ordering::Relaxed),
            scrubbed: scrubbed.load(Ordering::Relaxed),
        };
        self.report(&report, transport);
        report
    }

    async fn announce<W>(&self, hub: &mut W, transport: Transport) -> io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        if !self.options.announce_ip {
            return Ok(());
        }
        let greeting = format!(
            "$MyIP {} {}|",
            self.peer.ip().to_canonical(),
            transport.announced_version()
        );
        hub.write_all(greeting.as_bytes()).await?;
        hub.flush().await
    }

    fn advance(&mut self, next: PipeState) {
        trace!(conn_id = %self.id, from = ?self.state, to = ?next, "Pipe state");
        self.state = next;
    }

    fn report(&self, report: &PipeReport, transport: Transport) {
        if report.scrubbed > 0 {
            self.sink.record(ProxyEvent::ScrubApplied {
                count: report.scrubbed,
            });
        }

        match &report.termination {
            Termination::Failed(direction, e) => {
                self.sink.record(ProxyEvent::RelayFailed);
                if self.options.log_errors {
                    warn!(conn_id = %self.id, %direction, error = %e, "Relay failed");
                } else {
                    debug!(conn_id = %self.id, %direction, error = %e, "Relay failed");
                }
            }
            Termination::IdleTimeout(direction) => {
                debug!(conn_id = %self.id, %direction, "Idle timeout");
            }
            other => {
                trace!(conn_id = %self.id, termination = ?other, "Relay ended");
            }
        }

        self.sink.record(ProxyEvent::ConnectionClosed {
            tls: transport.is_tls(),
            duration: report.duration,
            bytes_to_hub: report.bytes_to_hub,
            bytes_to_client: report.bytes_to_client,
        });

        debug!(
            conn_id = %self.id,
            peer = %self.peer,
            bytes_to_hub = report.bytes_to_hub,
            bytes_to_client = report.bytes_to_client,
            duration_ms = report.duration.as_millis() as u64,
            "Connection closed"
        );
    }
}

enum DirectionEnd {
    Eof,
    IdleTimeout,
    Failed(io::Error),
}

impl DirectionEnd {
    fn into_termination(self, direction: Direction) -> Termination {
        match (self, direction) {
            (DirectionEnd::Eof, Direction::ToHub) => Termination::ClientEof,
            (DirectionEnd::Eof, Direction::ToClient) => Termination::HubEof,
            (DirectionEnd::IdleTimeout, direction) => Termination::IdleTimeout(direction),
            (DirectionEnd::Failed(e), direction) => Termination::Failed(direction, e),
        }
    }
}

/// One direction of copying.
struct Relay<'a> {
    buffer_size: usize,
    idle_timeout: Option<Duration>,
    scrubber: Option<&'a ProtocolScrubber>,
    /// Bytes written to the destination.
    bytes: &'a AtomicU64,
    scrubbed: &'a AtomicU64,
}

impl Relay<'_> {
    /// Copy until EOF, error or idle timeout. Bytes the scrubber holds back
    /// stay in `carry` for the caller to flush.
    async fn copy<R, W>(&self, reader: &mut R, writer: &mut W, carry: &mut Carry) -> DirectionEnd
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut buf = vec![0u8; self.buffer_size];

        loop {
            let read_result = if let Some(limit) = self.idle_timeout {
                match timeout(limit, reader.read(&mut buf)).await {
                    Ok(result) => result,
                    Err(_) => return DirectionEnd::IdleTimeout,
                }
            } else {
                reader.read(&mut buf).await
            };

            let n = match read_result {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => return DirectionEnd::Failed(e),
            };

            let written = match self.scrubber {
                Some(scrubber) => {
                    let scrubbed = scrubber.filter(&buf[..n], std::mem::take(carry));
                    *carry = scrubbed.carry;
                    self.scrubbed.fetch_add(scrubbed.replaced, Ordering::Relaxed);
                    write_chunk(writer, &scrubbed.output).await
                }
                None => write_chunk(writer, &buf[..n]).await,
            };

            match written {
                Ok(len) => {
                    self.bytes.fetch_add(len as u64, Ordering::Relaxed);
                }
                Err(e) => return DirectionEnd::Failed(e),
            }
        }

        DirectionEnd::Eof
    }
}

async fn write_chunk<W>(writer: &mut W, data: &[u8]) -> io::Result<usize>
where
    W: AsyncWrite + Unpin,
{
    if data.is_empty() {
        return Ok(0);
    }
    writer.write_all(data).await?;
    writer.flush().await?;
    Ok(data.len())
}
