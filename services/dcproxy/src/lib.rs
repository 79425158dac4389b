pub mod config;
pub mod error;
pub mod metrics;
pub mod proxy;

pub use config::{Binding, CertSource, HubNetwork, MinTlsVersion, ProxyConfig, Settings};
pub use error::ProxyError;
pub use metrics::{
    Fanout, MetricsFacade, MetricsSink, NoopSink, ProxyEvent, ProxyStats, StatsSnapshot,
};
pub use proxy::{
    CertificateProvider, CertificateRecord, ConnectionPipe, ListenerSet, PipeReport,
    ProtocolScrubber, RelayOptions, ScrubRule, Termination, TlsProfile, Transport, UpstreamDialer,
};
