//! Error types for the hub proxy.

use std::io;

use thiserror::Error;

/// Proxy errors with standardized reason codes.
///
/// Startup errors (`Config`, `Certificate`, `Bind`) stop the process before it
/// serves anything. Every other variant is scoped to a single connection.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Configuration rejected during validation.
    #[error("config_invalid: {0}")]
    Config(String),

    /// Static certificate or key could not be loaded.
    #[error("certificate_invalid: {path}: {detail}")]
    Certificate { path: String, detail: String },

    /// Listener address could not be bound.
    #[error("bind_failed: {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// Listener socket stopped accepting connections.
    #[error("accept_failed: {0}")]
    Accept(#[source] io::Error),

    /// Self-signed certificate could not be generated for a host.
    #[error("certificate_generation_failed: {host}: {detail}")]
    CertificateGeneration { host: String, detail: String },

    /// TLS handshake with the client failed.
    #[error("handshake_failed: {0}")]
    Handshake(#[source] io::Error),

    /// TLS handshake did not complete in time.
    #[error("handshake_timeout")]
    HandshakeTimeout,

    /// Upstream hub could not be reached.
    #[error("dial_failed: {addr}: {source}")]
    Dial {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// Read or write failure while relaying.
    #[error("relay_failed: {0}")]
    Relay(#[from] io::Error),
}

impl ProxyError {
    /// Get the standardized reason code for this error.
    pub fn reason_code(&self) -> &'static str {
        match self {
            ProxyError::Config(_) => "config_invalid",
            ProxyError::Certificate { .. } => "certificate_invalid",
            ProxyError::Bind { .. } => "bind_failed",
            ProxyError::Accept(_) => "accept_failed",
            ProxyError::CertificateGeneration { .. } => "certificate_generation_failed",
            ProxyError::Handshake(_) => "handshake_failed",
            ProxyError::HandshakeTimeout => "handshake_timeout",
            ProxyError::Dial { .. } => "dial_failed",
            ProxyError::Relay(_) => "relay_failed",
        }
    }

    /// Whether the error must prevent the proxy from serving.
    pub fn is_startup_fatal(&self) -> bool {
        matches!(
            self,
            ProxyError::Config(_) | ProxyError::Certificate { .. } | ProxyError::Bind { .. }
        )
    }
}
