//! TLS-terminating relay to an NMDC hub.
//!
//! This module provides:
//! - Client listeners with SNI-based certificate selection
//! - Self-signed certificate generation and caching
//! - Hub dialing bounded by a deadline
//! - Bidirectional relaying with joint teardown
//! - `$MyIP` address scrubbing on the client stream
//!
//! ## Architecture
//!
//! ```text
//! Client -> ListenerSet -> [detect] -> TLS handshake -> ConnectionPipe -> Hub
//!                                          |                  |
//!                                 CertificateProvider   ProtocolScrubber
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use dcproxy::{CertificateProvider, ListenerSet, ProxyConfig, ProxyStats, Settings};
//!
//! let settings = Arc::new(Settings::from_config(&config)?);
//! let provider = Arc::new(CertificateProvider::from_settings(&settings)?);
//! let set = ListenerSet::bind(settings, provider, Arc::new(ProxyStats::new())).await?;
//! set.serve(shutdown).await?;
//! ```

mod certs;
mod detect;
mod dialer;
mod listener;
mod pipe;
mod scrub;

pub use certs::{CertificateProvider, CertificateRecord, TlsProfile, FALLBACK_HOST};
pub use detect::{classify, detect, Detected};
pub use dialer::UpstreamDialer;
pub use listener::ListenerSet;
pub use pipe::{
    ConnectionId, ConnectionPipe, Direction, PipeReport, PipeState, RelayOptions, Termination,
    Transport,
};
pub use scrub::{Carry, ProtocolScrubber, ScrubRule, Scrubbed, NMDC_MY_IP_PREFIX};
