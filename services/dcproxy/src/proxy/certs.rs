//! TLS certificate selection and generation.
//!
//! A [`CertificateProvider`] maps the host name a client asked for (SNI) to a
//! [`CertificateRecord`]: a certificate, its key, and a ready rustls
//! `ServerConfig` presenting them. Records are immutable and shared by `Arc`
//! for the life of the process.
//!
//! Two modes:
//! - Static: one chain and key loaded from PEM files at startup, presented
//!   for every host.
//! - Generated: a self-signed certificate is created on the first handshake
//!   for a configured identity and cached. Concurrent first requests share
//!   one generation.

use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::net::IpAddr;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use rcgen::{
    CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, Ia5String, IsCa,
    KeyPair, KeyUsagePurpose, SanType,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::{ServerConfig, SupportedProtocolVersion};
use rustls_pemfile::{certs, private_key};
use time::OffsetDateTime;
use tokio::sync::{OnceCell, RwLock};
use tracing::{debug, info};

use crate::config::{normalize_hostname, CertSource, MinTlsVersion, Settings, ALPN_NMDC};
use crate::error::ProxyError;

/// Host presented when nothing better is known.
pub const FALLBACK_HOST: &str = "localhost";

/// Validity of generated certificates, in days from issuance.
pub const GENERATED_VALIDITY_DAYS: i64 = 365;

/// Label used for the record in static mode.
const STATIC_HOST: &str = "*";

static TLS13_ONLY: &[&SupportedProtocolVersion] = &[&rustls::version::TLS13];

/// Protocol parameters shared by every server config the provider builds.
#[derive(Debug, Clone)]
pub struct TlsProfile {
    versions: &'static [&'static SupportedProtocolVersion],
    alpn: Vec<Vec<u8>>,
}

impl TlsProfile {
    pub fn new(min_tls: MinTlsVersion) -> Self {
        let versions = match min_tls {
            MinTlsVersion::Tls12 => rustls::ALL_VERSIONS,
            MinTlsVersion::Tls13 => TLS13_ONLY,
        };
        Self {
            versions,
            alpn: vec![ALPN_NMDC.to_vec()],
        }
    }

    /// Build a server config presenting `chain` and `key`.
    pub fn server_config(
        &self,
        chain: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
    ) -> Result<Arc<ServerConfig>, rustls::Error> {
        let mut config =
            ServerConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
                .with_protocol_versions(self.versions)?
                .with_no_client_auth()
                .with_single_cert(chain, key)?;
        config.alpn_protocols = self.alpn.clone();
        Ok(Arc::new(config))
    }
}

impl Default for TlsProfile {
    fn default() -> Self {
        Self::new(MinTlsVersion::Tls12)
    }
}

/// A certificate ready to be presented.
#[derive(Debug)]
pub struct CertificateRecord {
    host: String,
    cert_chain: Vec<CertificateDer<'static>>,
    key_der: Vec<u8>,
    not_after: Option<SystemTime>,
    server_config: Arc<ServerConfig>,
}

impl CertificateRecord {
    /// Identity this record was created for (`*` for a static record).
    pub fn host(&self) -> &str {
        &self.host
    }

    /// DER of the leaf certificate.
    pub fn cert_der(&self) -> &[u8] {
        match self.cert_chain.first() {
            Some(cert) => cert,
            None => &[],
        }
    }

    pub fn cert_chain(&self) -> &[CertificateDer<'static>] {
        &self.cert_chain
    }

    /// DER of the private key.
    pub fn key_der(&self) -> &[u8] {
        &self.key_der
    }

    /// Expiry of a generated certificate. Unknown for static ones.
    pub fn not_after(&self) -> Option<SystemTime> {
        self.not_after
    }

    pub fn server_config(&self) -> Arc<ServerConfig> {
        Arc::clone(&self.server_config)
    }
}

type RecordCell = Arc<OnceCell<Arc<CertificateRecord>>>;

enum Mode {
    Static(Arc<CertificateRecord>),
    Generating {
        org: String,
        cert_host: Option<String>,
        identities: Vec<String>,
        cache: RwLock<HashMap<String, RecordCell>>,
    },
}

/// Resolves certificates by requested host name.
pub struct CertificateProvider {
    mode: Mode,
    profile: TlsProfile,
    generated: AtomicU64,
}

impl CertificateProvider {
    /// Build the provider described by validated settings.
    ///
    /// In static mode the PEM files are read here, so a bad certificate or
    /// key fails startup.
    pub fn from_settings(settings: &Settings) -> Result<Self, ProxyError> {
        let profile = TlsProfile::new(settings.min_tls);
        match &settings.certs {
            CertSource::Static { cert, key } => Self::load_static(cert, key, profile),
            CertSource::Generated { org, cert_host } => Ok(Self::generating(
                org.clone(),
                cert_host.clone(),
                settings.identities.clone(),
                profile,
            )),
        }
    }

    /// Load a static certificate chain and key from PEM files.
    pub fn load_static(
        cert_path: &Path,
        key_path: &Path,
        profile: TlsProfile,
    ) -> Result<Self, ProxyError> {
        let chain = load_certificates(cert_path)?;
        let key = load_private_key(key_path)?;
        let key_der = key.secret_der().to_vec();

        let server_config = profile
            .server_config(chain.clone(), key)
            .map_err(|e| ProxyError::Certificate {
                path: key_path.display().to_string(),
                detail: e.to_string(),
            })?;

        info!(
            cert = %cert_path.display(),
            chain_len = chain.len(),
            "Loaded static certificate"
        );

        let record = CertificateRecord {
            host: STATIC_HOST.to_string(),
            cert_chain: chain,
            key_der,
            not_after: None,
            server_config,
        };

        Ok(Self {
            mode: Mode::Static(Arc::new(record)),
            profile,
            generated: AtomicU64::new(0),
        })
    }

    /// Create a provider that generates self-signed certificates on demand.
    pub fn generating(
        org: String,
        cert_host: Option<String>,
        identities: Vec<String>,
        profile: TlsProfile,
    ) -> Self {
        let cert_host = cert_host.map(|h| normalize_hostname(&h));
        let identities = identities.iter().map(|h| normalize_hostname(h)).collect();
        Self {
            mode: Mode::Generating {
                org,
                cert_host,
                identities,
                cache: RwLock::new(HashMap::new()),
            },
            profile,
            generated: AtomicU64::new(0),
        }
    }

    /// Whether every host shares one static record.
    pub fn is_static(&self) -> bool {
        matches!(self.mode, Mode::Static(_))
    }

    /// Number of certificates generated so far.
    pub fn generated_count(&self) -> u64 {
        self.generated.load(Ordering::Relaxed)
    }

    /// Identity whose certificate answers a request for `requested`.
    ///
    /// Only configured names get their own certificate. Unlisted or missing
    /// names are answered with the catch-all identity: `cert_host` if set,
    /// else the first configured name, else `localhost`. The cache is
    /// therefore bounded by the configuration, whatever clients send.
    pub fn identity_for(&self, requested: Option<&str>) -> String {
        let (cert_host, identities) = match &self.mode {
            Mode::Static(record) => return record.host.clone(),
            Mode::Generating {
                cert_host,
                identities,
                ..
            } => (cert_host, identities),
        };

        let requested = requested
            .map(normalize_hostname)
            .filter(|name| !name.is_empty());

        match requested {
            Some(name) if identities.contains(&name) => name,
            _ => cert_host
                .clone()
                .or_else(|| identities.first().cloned())
                .unwrap_or_else(|| FALLBACK_HOST.to_string()),
        }
    }

    /// Resolve the certificate for a requested host name.
    pub async fn resolve(
        &self,
        requested: Option<&str>,
    ) -> Result<Arc<CertificateRecord>, ProxyError> {
        let (org, cert_host, cache) = match &self.mode {
            Mode::Static(record) => return Ok(Arc::clone(record)),
            Mode::Generating {
                org,
                cert_host,
                cache,
                ..
            } => (org, cert_host, cache),
        };

        let host = self.identity_for(requested);
        let cell = Self::cell_for(cache, &host).await;

        let record = cell
            .get_or_try_init(|| async {
                let params = GenerationParams {
                    host: host.clone(),
                    org: org.clone(),
                    cert_host: cert_host.clone(),
                };
                let profile = self.profile.clone();
                let record = tokio::task::spawn_blocking(move || generate(params, &profile))
                    .await
                    .map_err(|e| ProxyError::CertificateGeneration {
                        host: host.clone(),
                        detail: e.to_string(),
                    })??;

                self.generated.fetch_add(1, Ordering::Relaxed);
                info!(host = %host, "Generated self-signed certificate");
                Ok::<_, ProxyError>(Arc::new(record))
            })
            .await?;

        debug!(host = %record.host, "Certificate resolved");
        Ok(Arc::clone(record))
    }

    async fn cell_for(cache: &RwLock<HashMap<String, RecordCell>>, host: &str) -> RecordCell {
        // Fast path: read lock
        {
            let cells = cache.read().await;
            if let Some(cell) = cells.get(host) {
                return Arc::clone(cell);
            }
        }

        // Slow path: write lock
        let mut cells = cache.write().await;
        cells
            .entry(host.to_string())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone()
    }
}

struct GenerationParams {
    host: String,
    org: String,
    cert_host: Option<String>,
}

fn generate(
    params: GenerationParams,
    profile: &TlsProfile,
) -> Result<CertificateRecord, ProxyError> {
    let host = params.host.clone();
    let failed = |detail: String| ProxyError::CertificateGeneration {
        host: host.clone(),
        detail,
    };

    let mut cert_params =
        CertificateParams::new(Vec::<String>::new()).map_err(|e| failed(e.to_string()))?;

    let common_name = params.cert_host.clone().unwrap_or_else(|| params.host.clone());
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    dn.push(DnType::OrganizationName, params.org.clone());
    cert_params.distinguished_name = dn;

    let mut names = vec![params.host.clone()];
    if let Some(cert_host) = &params.cert_host {
        if cert_host != &params.host {
            names.push(cert_host.clone());
        }
    }
    for name in names {
        let san = match name.parse::<IpAddr>() {
            Ok(ip) => SanType::IpAddress(ip),
            Err(_) => SanType::DnsName(
                Ia5String::try_from(name.clone()).map_err(|e| failed(e.to_string()))?,
            ),
        };
        cert_params.subject_alt_names.push(san);
    }

    let now = OffsetDateTime::now_utc();
    let not_after = now + time::Duration::days(GENERATED_VALIDITY_DAYS);
    cert_params.not_before = now - time::Duration::days(1);
    cert_params.not_after = not_after;
    cert_params.is_ca = IsCa::NoCa;
    cert_params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
    cert_params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

    let key_pair = KeyPair::generate().map_err(|e| failed(e.to_string()))?;
    let cert = cert_params
        .self_signed(&key_pair)
        .map_err(|e| failed(e.to_string()))?;

    let cert_der = cert.der().clone();
    let key_der = key_pair.serialize_der();
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_der.clone()));

    let server_config = profile
        .server_config(vec![cert_der.clone()], key)
        .map_err(|e| failed(e.to_string()))?;

    Ok(CertificateRecord {
        host: params.host,
        cert_chain: vec![cert_der],
        key_der,
        not_after: Some(SystemTime::from(not_after)),
        server_config,
    })
}

fn load_certificates(path: &Path) -> Result<Vec<CertificateDer<'static>>, ProxyError> {
    let invalid = |detail: String| ProxyError::Certificate {
        path: path.display().to_string(),
        detail,
    };

    let file = File::open(path).map_err(|e| invalid(e.to_string()))?;
    let mut reader = BufReader::new(file);

    let chain = certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| invalid(e.to_string()))?;

    if chain.is_empty() {
        return Err(invalid("no certificates found in file".to_string()));
    }
    Ok(chain)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, ProxyError> {
    let invalid = |detail: String| ProxyError::Certificate {
        path: path.display().to_string(),
        detail,
    };

    let file = File::open(path).map_err(|e| invalid(e.to_string()))?;
    let mut reader = BufReader::new(file);

    private_key(&mut reader)
        .map_err(|e| invalid(e.to_string()))?
        .ok_or_else(|| invalid("no private key found in file".to_string()))
}
