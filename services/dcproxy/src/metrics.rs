//! Connection events and the sinks that record them.
//!
//! The proxy core never talks to a metrics backend directly. It emits a
//! [`ProxyEvent`] for every notable step of a connection's life and hands it
//! to a [`MetricsSink`]. Two sinks ship with the crate:
//!
//! - [`ProxyStats`]: in-process atomic counters with a readable snapshot
//! - [`MetricsFacade`]: `dc_conn_*` series through the `metrics` crate
//!
//! [`Fanout`] forwards each event to several sinks.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, gauge, histogram};

pub const METRIC_CONN_ACCEPTED: &str = "dc_conn_accepted";
pub const METRIC_CONN_ERROR: &str = "dc_conn_error";
pub const METRIC_CONN_OPEN: &str = "dc_conn_open";
pub const METRIC_CONN_INSECURE: &str = "dc_conn_insecure";
pub const METRIC_CONN_INSECURE_OPEN: &str = "dc_conn_insecure_open";
pub const METRIC_CONN_TLS: &str = "dc_conn_tls";
pub const METRIC_CONN_TLS_OPEN: &str = "dc_conn_tls_open";
pub const METRIC_CONN_TLS_HANDSHAKE_SEC: &str = "dc_conn_tls_handshake_sec";
pub const METRIC_CONN_RX_BYTES: &str = "dc_conn_rx_bytes";
pub const METRIC_CONN_TX_BYTES: &str = "dc_conn_tx_bytes";
pub const METRIC_CONN_DURATION_SEC: &str = "dc_conn_duration_sec";
pub const METRIC_DIAL_ERROR: &str = "dc_dial_error";
pub const METRIC_SCRUBBED: &str = "dc_scrubbed_tokens";

const LABEL_STAGE: &str = "stage";

/// A notable step in a connection's life.
#[derive(Debug, Clone, PartialEq)]
pub enum ProxyEvent {
    /// A client connection was accepted by a listener.
    ConnectionAccepted,
    /// The client side is ready and the hub is connected.
    ConnectionOpened { tls: bool },
    /// An opened connection finished relaying.
    ConnectionClosed {
        tls: bool,
        duration: Duration,
        bytes_to_hub: u64,
        bytes_to_client: u64,
    },
    /// The listener socket failed to accept.
    AcceptFailed,
    /// The TLS handshake failed or timed out.
    HandshakeFailed,
    /// The TLS handshake completed.
    HandshakeCompleted { duration: Duration },
    /// The hub could not be reached.
    DialFailed,
    /// Address tokens were rewritten in the client stream.
    ScrubApplied { count: u64 },
    /// A relay direction failed with an I/O error.
    RelayFailed,
}

/// Receives connection events.
pub trait MetricsSink: Send + Sync {
    fn record(&self, event: ProxyEvent);
}

/// Sink that drops every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl MetricsSink for NoopSink {
    fn record(&self, _event: ProxyEvent) {}
}

/// In-process proxy counters.
#[derive(Debug, Default)]
pub struct ProxyStats {
    /// Total connections accepted.
    pub connections_accepted: AtomicU64,
    /// Connections currently relaying.
    pub connections_open: AtomicU64,
    /// Connections that finished relaying.
    pub connections_closed: AtomicU64,
    /// TLS connections opened.
    pub tls_opened: AtomicU64,
    /// Plaintext connections opened.
    pub plain_opened: AtomicU64,
    /// Accept failures.
    pub accept_errors: AtomicU64,
    /// Handshake failures and timeouts.
    pub handshake_errors: AtomicU64,
    /// Completed handshakes.
    pub handshakes_completed: AtomicU64,
    /// Hub dial failures.
    pub dial_errors: AtomicU64,
    /// Relay I/O failures.
    pub relay_errors: AtomicU64,
    /// Rewritten address tokens.
    pub tokens_scrubbed: AtomicU64,
    /// Bytes relayed client to hub.
    pub bytes_to_hub: AtomicU64,
    /// Bytes relayed hub to client.
    pub bytes_to_client: AtomicU64,
}

/// Point-in-time copy of [`ProxyStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub connections_accepted: u64,
    pub connections_open: u64,
    pub connections_closed: u64,
    pub tls_opened: u64,
    pub plain_opened: u64,
    pub accept_errors: u64,
    pub handshake_errors: u64,
    pub handshakes_completed: u64,
    pub dial_errors: u64,
    pub relay_errors: u64,
    pub tokens_scrubbed: u64,
    pub bytes_to_hub: u64,
    pub bytes_to_client: u64,
}

impl ProxyStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a snapshot of the counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            connections_open: self.connections_open.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            tls_opened: self.tls_opened.load(Ordering::Relaxed),
            plain_opened: self.plain_opened.load(Ordering::Relaxed),
            accept_errors: self.accept_errors.load(Ordering::Relaxed),
            handshake_errors: self.handshake_errors.load(Ordering::Relaxed),
            handshakes_completed: self.handshakes_completed.load(Ordering::Relaxed),
            dial_errors: self.dial_errors.load(Ordering::Relaxed),
            relay_errors: self.relay_errors.load(Ordering::Relaxed),
            tokens_scrubbed: self.tokens_scrubbed.load(Ordering::Relaxed),
            bytes_to_hub: self.bytes_to_hub.load(Ordering::Relaxed),
            bytes_to_client: self.bytes_to_client.load(Ordering::Relaxed),
        }
    }
}

impl MetricsSink for ProxyStats {
    fn record(&self, event: ProxyEvent) {
        match event {
            ProxyEvent::ConnectionAccepted => {
                self.connections_accepted.fetch_add(1, Ordering::Relaxed);
            }
            ProxyEvent::ConnectionOpened { tls } => {
                self.connections_open.fetch_add(1, Ordering::Relaxed);
                if tls {
                    self.tls_opened.fetch_add(1, Ordering::Relaxed);
                } else {
                    self.plain_opened.fetch_add(1, Ordering::Relaxed);
                }
            }
            ProxyEvent::ConnectionClosed {
                bytes_to_hub,
                bytes_to_client,
                ..
            } => {
                self.connections_open.fetch_sub(1, Ordering::Relaxed);
                self.connections_closed.fetch_add(1, Ordering::Relaxed);
                self.bytes_to_hub.fetch_add(bytes_to_hub, Ordering::Relaxed);
                self.bytes_to_client
                    .fetch_add(bytes_to_client, Ordering::Relaxed);
            }
            ProxyEvent::AcceptFailed => {
                self.accept_errors.fetch_add(1, Ordering::Relaxed);
            }
            ProxyEvent::HandshakeFailed => {
                self.handshake_errors.fetch_add(1, Ordering::Relaxed);
            }
            ProxyEvent::HandshakeCompleted { .. } => {
                self.handshakes_completed.fetch_add(1, Ordering::Relaxed);
            }
            ProxyEvent::DialFailed => {
                self.dial_errors.fetch_add(1, Ordering::Relaxed);
            }
            ProxyEvent::ScrubApplied { count } => {
                self.tokens_scrubbed.fetch_add(count, Ordering::Relaxed);
            }
            ProxyEvent::RelayFailed => {
                self.relay_errors.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// Sink publishing events through the global `metrics` recorder.
///
/// Without an installed recorder every call is a no-op.
#[derive(Debug, Default, Clone, Copy)]
pub struct MetricsFacade;

impl MetricsSink for MetricsFacade {
    fn record(&self, event: ProxyEvent) {
        match event {
            ProxyEvent::ConnectionAccepted => {
                counter!(METRIC_CONN_ACCEPTED).increment(1);
            }
            ProxyEvent::ConnectionOpened { tls } => {
                gauge!(METRIC_CONN_OPEN).increment(1.0);
                if tls {
                    counter!(METRIC_CONN_TLS).increment(1);
                    gauge!(METRIC_CONN_TLS_OPEN).increment(1.0);
                } else {
                    counter!(METRIC_CONN_INSECURE).increment(1);
                    gauge!(METRIC_CONN_INSECURE_OPEN).increment(1.0);
                }
            }
            ProxyEvent::ConnectionClosed {
                tls,
                duration,
                bytes_to_hub,
                bytes_to_client,
            } => {
                gauge!(METRIC_CONN_OPEN).decrement(1.0);
                if tls {
                    gauge!(METRIC_CONN_TLS_OPEN).decrement(1.0);
                } else {
                    gauge!(METRIC_CONN_INSECURE_OPEN).decrement(1.0);
                }
                counter!(METRIC_CONN_RX_BYTES).increment(bytes_to_hub);
                counter!(METRIC_CONN_TX_BYTES).increment(bytes_to_client);
                histogram!(METRIC_CONN_DURATION_SEC).record(duration.as_secs_f64());
            }
            ProxyEvent::AcceptFailed => {
                counter!(METRIC_CONN_ERROR, LABEL_STAGE => "accept").increment(1);
            }
            ProxyEvent::HandshakeFailed => {
                counter!(METRIC_CONN_ERROR, LABEL_STAGE => "handshake").increment(1);
            }
            ProxyEvent::HandshakeCompleted { duration } => {
                histogram!(METRIC_CONN_TLS_HANDSHAKE_SEC).record(duration.as_secs_f64());
            }
            ProxyEvent::DialFailed => {
                counter!(METRIC_DIAL_ERROR).increment(1);
            }
            ProxyEvent::ScrubApplied { count } => {
                counter!(METRIC_SCRUBBED).increment(count);
            }
            ProxyEvent::RelayFailed => {
                counter!(METRIC_CONN_ERROR, LABEL_STAGE => "relay").increment(1);
            }
        }
    }
}

/// Sink forwarding every event to each inner sink in order.
#[derive(Default, Clone)]
pub struct Fanout {
    sinks: Vec<Arc<dyn MetricsSink>>,
}

impl Fanout {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a sink.
    pub fn with(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl MetricsSink for Fanout {
    fn record(&self, event: ProxyEvent) {
        if let Some((last, rest)) = self.sinks.split_last() {
            for sink in rest {
                sink.record(event.clone());
            }
            last.record(event);
        }
    }
}
