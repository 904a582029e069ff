pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod harness;
pub mod transport;

// Re-export key types at crate root for convenience.
pub use cache::{CacheObserver, CacheStatsSnapshot, ResumptionStore, SessionCache};
pub use config::{CertPaths, HarnessConfig, Identity, ProtocolVersions, Resumption};
pub use engine::{ConnectionState, TlsConfigs};
pub use error::{ConfigError, Error, Result, TransportError};
pub use harness::driver::{BenchReport, BenchmarkDriver, CachePolicy, Stats, TestDriver};
pub use harness::{Anomaly, HandshakeHarness, ServerOutcome, TrialReport};
pub use transport::{duplex, DuplexEndpoint, HandoffMode, Role, Signal, TransportPair};
