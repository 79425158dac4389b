//! Proxy configuration.
//!
//! [`ProxyConfig`] is the flat contract handed to the proxy by whatever
//! front end drives it (the CLI in `main.rs`, or an embedding application).
//! [`Settings`] is the validated, immutable form shared by every component.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ProxyError;

/// Hub address used when none is configured.
pub const DEFAULT_HUB_ADDR: &str = "127.0.0.1:411";

/// Hub network used when none is configured.
pub const DEFAULT_HUB_NETWORK: &str = "tcp4";

/// Relay buffer size in KB used when none is configured.
pub const DEFAULT_BUFFER_KB: usize = 10;

/// Upper bound for the relay buffer size in KB.
pub const MAX_BUFFER_KB: usize = 1024;

/// Organization written into generated certificates when none is configured.
pub const DEFAULT_CERT_ORG: &str = "dcproxy";

/// ALPN protocol id advertised to clients.
pub const ALPN_NMDC: &[u8] = b"nmdc";

/// Raw proxy configuration.
///
/// Field semantics follow the hub proxy's historical configuration surface:
/// `hosts` is a comma-separated list of `host:port` listen entries, `wait`
/// is in milliseconds and `buffer` in kilobytes. Zero/empty values select
/// defaults during validation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Hub address (default 127.0.0.1:411).
    pub hub_addr: String,

    /// Hub network: tcp, tcp4 or tcp6 (default tcp4).
    pub hub_network: String,

    /// Comma-separated list of `host:port` entries to listen on.
    pub hosts: String,

    /// Path to the PEM certificate chain.
    pub cert: String,

    /// Path to the PEM private key.
    pub key: String,

    /// Organization for generated certificates.
    pub cert_org: String,

    /// Common name for generated certificates.
    pub cert_host: String,

    /// Profiler bind address (accepted, not served).
    pub pprof: String,

    /// Metrics bind address (empty = disabled).
    pub metrics: String,

    /// Log per-connection errors.
    pub log_errors: bool,

    /// Dial timeout and default idle-read timeout in milliseconds (0 = none).
    pub wait: u64,

    /// Relay buffer size in KB.
    pub buffer: usize,

    /// Rewrite the client's address in `$MyIP` commands.
    pub no_send_ip: bool,

    /// Idle-read timeout in milliseconds; overrides `wait` for idle reads.
    pub idle: Option<u64>,

    /// Accept plaintext clients alongside TLS ones.
    pub allow_plain: bool,

    /// Announce the client's address to the hub before relaying.
    pub announce_ip: bool,

    /// Minimum TLS version: "1.2" or "1.3" (default 1.2).
    pub min_tls: String,
}

/// Network family used to reach the hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HubNetwork {
    /// Any address family.
    Tcp,
    /// IPv4 only.
    Tcp4,
    /// IPv6 only.
    Tcp6,
}

impl HubNetwork {
    /// Parse a network name.
    pub fn parse(network: &str) -> Option<Self> {
        match network {
            "tcp" => Some(Self::Tcp),
            "tcp4" => Some(Self::Tcp4),
            "tcp6" => Some(Self::Tcp6),
            _ => None,
        }
    }

    /// Whether an address belongs to this network.
    pub fn admits(&self, addr: &SocketAddr) -> bool {
        match self {
            Self::Tcp => true,
            Self::Tcp4 => addr.is_ipv4(),
            Self::Tcp6 => addr.is_ipv6(),
        }
    }
}

impl std::fmt::Display for HubNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tcp => write!(f, "tcp"),
            Self::Tcp4 => write!(f, "tcp4"),
            Self::Tcp6 => write!(f, "tcp6"),
        }
    }
}

/// Minimum TLS version offered to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MinTlsVersion {
    Tls12,
    Tls13,
}

/// One listen entry from `hosts`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    /// Host part (IP literal or DNS name).
    pub host: String,
    /// Port.
    pub port: u16,
}

impl Binding {
    /// Parse a `host:port` entry. An empty host listens on all IPv4 addresses.
    pub fn parse(entry: &str) -> Result<Self, ProxyError> {
        let (host, port) = entry
            .rsplit_once(':')
            .ok_or_else(|| ProxyError::Config(format!("host entry {entry:?} has no port")))?;

        let port: u16 = port
            .parse()
            .map_err(|_| ProxyError::Config(format!("host entry {entry:?} has an invalid port")))?;

        let host = host.trim_start_matches('[').trim_end_matches(']');
        let host = if host.is_empty() { "0.0.0.0" } else { host };

        Ok(Self {
            host: host.to_string(),
            port,
        })
    }

    /// Host name this binding contributes as a TLS identity, if any.
    pub fn identity(&self) -> Option<String> {
        if self.host.parse::<IpAddr>().is_ok() {
            return None;
        }
        Some(normalize_hostname(&self.host))
    }
}

impl std::fmt::Display for Binding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Where TLS certificates come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CertSource {
    /// Static certificate chain and key loaded from disk.
    Static { cert: PathBuf, key: PathBuf },
    /// Self-signed certificates generated per identity.
    Generated {
        org: String,
        cert_host: Option<String>,
    },
}

/// Validated, immutable proxy settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub hub_addr: String,
    pub hub_network: HubNetwork,
    pub bindings: Vec<Binding>,
    /// Host names listed for TLS, normalized and de-duplicated.
    pub identities: Vec<String>,
    pub certs: CertSource,
    pub pprof: Option<String>,
    pub metrics: Option<SocketAddr>,
    pub log_errors: bool,
    /// Dial timeout; `None` when `wait` is 0.
    pub wait: Option<Duration>,
    /// Idle-read timeout per relay direction; `None` disables it.
    pub idle: Option<Duration>,
    /// Relay buffer size in bytes.
    pub buffer_size: usize,
    pub no_send_ip: bool,
    pub allow_plain: bool,
    pub announce_ip: bool,
    pub min_tls: MinTlsVersion,
}

impl Settings {
    /// Validate a raw configuration, collecting every problem found.
    pub fn from_config(config: &ProxyConfig) -> Result<Self, ProxyError> {
        let mut problems = Vec::new();

        let (hub_addr, network) = if config.hub_addr.trim().is_empty() {
            (DEFAULT_HUB_ADDR.to_string(), DEFAULT_HUB_NETWORK)
        } else if config.hub_network.trim().is_empty() {
            (config.hub_addr.trim().to_string(), DEFAULT_HUB_NETWORK)
        } else {
            (
                config.hub_addr.trim().to_string(),
                config.hub_network.trim(),
            )
        };

        let hub_network = HubNetwork::parse(network).unwrap_or_else(|| {
            problems.push(format!("unsupported hub network {network:?}"));
            HubNetwork::Tcp4
        });

        let mut bindings: Vec<Binding> = Vec::new();
        for entry in config.hosts.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            match Binding::parse(entry) {
                Ok(binding) if !bindings.contains(&binding) => bindings.push(binding),
                Ok(_) => {}
                Err(e) => problems.push(e.to_string()),
            }
        }
        if bindings.is_empty() && problems.is_empty() {
            problems.push("no hosts to listen on".to_string());
        }

        let cert_host = non_empty(&config.cert_host).map(normalize_hostname);

        let mut identities: Vec<String> = Vec::new();
        for name in bindings
            .iter()
            .filter_map(Binding::identity)
            .chain(cert_host.clone())
        {
            if !identities.contains(&name) {
                identities.push(name);
            }
        }

        let certs = match (non_empty(&config.cert), non_empty(&config.key)) {
            (Some(cert), Some(key)) => CertSource::Static {
                cert: PathBuf::from(cert),
                key: PathBuf::from(key),
            },
            (None, None) => CertSource::Generated {
                org: non_empty(&config.cert_org)
                    .unwrap_or(DEFAULT_CERT_ORG)
                    .to_string(),
                cert_host,
            },
            _ => {
                problems.push("cert and key must be configured together".to_string());
                CertSource::Generated {
                    org: DEFAULT_CERT_ORG.to_string(),
                    cert_host,
                }
            }
        };

        let metrics = match non_empty(&config.metrics) {
            Some(addr) => match addr.parse::<SocketAddr>() {
                Ok(addr) => Some(addr),
                Err(_) => {
                    problems.push(format!("invalid metrics address {addr:?}"));
                    None
                }
            },
            None => None,
        };

        let buffer_kb = if config.buffer == 0 {
            DEFAULT_BUFFER_KB
        } else {
            config.buffer
        };
        if buffer_kb > MAX_BUFFER_KB {
            problems.push(format!(
                "buffer of {buffer_kb} KB exceeds the {MAX_BUFFER_KB} KB limit"
            ));
        }

        let min_tls = match config.min_tls.trim() {
            "" | "1.2" => MinTlsVersion::Tls12,
            "1.3" => MinTlsVersion::Tls13,
            other => {
                problems.push(format!("unsupported minimum TLS version {other:?}"));
                MinTlsVersion::Tls12
            }
        };

        if config.announce_ip && config.no_send_ip {
            problems.push("announce_ip conflicts with no_send_ip".to_string());
        }

        if !problems.is_empty() {
            return Err(ProxyError::Config(problems.join("; ")));
        }

        let wait = millis(config.wait);
        let idle = match config.idle {
            Some(ms) => millis(ms),
            None => wait,
        };

        Ok(Self {
            hub_addr,
            hub_network,
            bindings,
            identities,
            certs,
            pprof: non_empty(&config.pprof).map(str::to_string),
            metrics,
            log_errors: config.log_errors,
            wait,
            idle,
            buffer_size: buffer_kb * 1024,
            no_send_ip: config.no_send_ip,
            allow_plain: config.allow_plain,
            announce_ip: config.announce_ip,
            min_tls,
        })
    }
}

/// Normalize a hostname for matching.
///
/// - Convert to lowercase
/// - Trim trailing dot
pub fn normalize_hostname(hostname: &str) -> String {
    hostname.to_lowercase().trim_end_matches('.').to_string()
}

fn non_empty(value: &str) -> Option<&str> {
    let value = value.trim();
    (!value.is_empty()).then_some(value)
}

fn millis(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}
