use std::path::{Path, PathBuf};

use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{RootCertStore, SupportedProtocolVersion};

use crate::cache::DEFAULT_CAPACITY;
use crate::error::ConfigError;
use crate::transport::HandoffMode;

/// Locations of the PEM files making up a server identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertPaths {
    /// Server certificate chain, leaf first.
    pub cert_chain: PathBuf,
    /// Private key for the leaf certificate.
    pub private_key: PathBuf,
    /// Root certificates the client trusts.
    pub trust_roots: PathBuf,
}

impl Default for CertPaths {
    fn default() -> Self {
        Self::in_dir("certs/rsa2048")
    }
}

impl CertPaths {
    /// The conventional `server-chain.pem` / `server-key.pem` / `ca-cert.pem`
    /// layout under `dir`.
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            cert_chain: dir.join("server-chain.pem"),
            private_key: dir.join("server-key.pem"),
            trust_roots: dir.join("ca-cert.pem"),
        }
    }
}

/// Which protocol versions both peers offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
pub enum ProtocolVersions {
    Tls12,
    Tls13,
    #[default]
    All,
}

static TLS12_ONLY: &[&SupportedProtocolVersion] = &[&rustls::version::TLS12];
static TLS13_ONLY: &[&SupportedProtocolVersion] = &[&rustls::version::TLS13];

impl ProtocolVersions {
    pub fn versions(self) -> &'static [&'static SupportedProtocolVersion] {
        match self {
            Self::Tls12 => TLS12_ONLY,
            Self::Tls13 => TLS13_ONLY,
            Self::All => rustls::ALL_VERSIONS,
        }
    }
}

/// Session resumption settings for a trial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct Resumption {
    /// Server issues tickets and the client keeps a session cache.
    pub enabled: bool,
    /// TLS 1.3 tickets issued after each handshake.
    pub tickets: usize,
}

impl Default for Resumption {
    fn default() -> Self {
        Self {
            enabled: true,
            tickets: 1,
        }
    }
}

impl Resumption {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            tickets: 0,
        }
    }
}

/// Configuration for a handshake harness.
///
/// Constructed through [`HarnessConfig::builder`]; `Default` gives the
/// builder's defaults.
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    /// Name the client expects in the server certificate (default: localhost).
    server_name: String,

    /// Protocol versions offered by both peers (default: TLS 1.2 and 1.3).
    protocol: ProtocolVersions,

    /// Ticket issuance and client-side caching (default: on, one ticket).
    resumption: Resumption,

    /// Capacity of the client session cache (default: 128).
    cache_capacity: usize,

    /// Transport hand-off mode (default: rendezvous).
    handoff: HandoffMode,

    /// Length of the post-handshake drain read (default: 1).
    drain_len: usize,

    /// ALPN protocols offered by the client and accepted by the server
    /// (default: none).
    alpn_protocols: Vec<Vec<u8>>,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            server_name: "localhost".to_string(),
            protocol: ProtocolVersions::default(),
            resumption: Resumption::default(),
            cache_capacity: DEFAULT_CAPACITY,
            handoff: HandoffMode::default(),
            drain_len: 1,
            alpn_protocols: Vec::new(),
        }
    }
}

impl HarnessConfig {
    pub fn builder() -> HarnessConfigBuilder {
        HarnessConfigBuilder::default()
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    pub fn protocol(&self) -> ProtocolVersions {
        self.protocol
    }

    pub fn resumption(&self) -> Resumption {
        self.resumption
    }

    pub fn cache_capacity(&self) -> usize {
        self.cache_capacity
    }

    pub fn handoff(&self) -> HandoffMode {
        self.handoff
    }

    pub fn drain_len(&self) -> usize {
        self.drain_len
    }

    pub fn alpn_protocols(&self) -> &[Vec<u8>] {
        &self.alpn_protocols
    }

    pub(crate) fn parsed_server_name(&self) -> Result<ServerName<'static>, ConfigError> {
        ServerName::try_from(self.server_name.clone())
            .map_err(|_| ConfigError::InvalidServerName(self.server_name.clone()))
    }
}

/// Builder for [`HarnessConfig`].
#[derive(Debug, Clone, Default)]
pub struct HarnessConfigBuilder {
    config: HarnessConfig,
}

impl HarnessConfigBuilder {
    pub fn server_name(mut self, name: impl Into<String>) -> Self {
        self.config.server_name = name.into();
        self
    }

    pub fn protocol(mut self, protocol: ProtocolVersions) -> Self {
        self.config.protocol = protocol;
        self
    }

    pub fn resumption(mut self, resumption: Resumption) -> Self {
        self.config.resumption = resumption;
        self
    }

    pub fn cache_capacity(mut self, capacity: usize) -> Self {
        self.config.cache_capacity = capacity;
        self
    }

    pub fn handoff(mut self, mode: HandoffMode) -> Self {
        self.config.handoff = mode;
        self
    }

    pub fn drain_len(mut self, len: usize) -> Self {
        self.config.drain_len = len;
        self
    }

    pub fn alpn_protocol(mut self, protocol: impl Into<Vec<u8>>) -> Self {
        self.config.alpn_protocols.push(protocol.into());
        self
    }

    /// Build the `HarnessConfig`, validating that all values are sensible.
    pub fn build(self) -> Result<HarnessConfig, ConfigError> {
        let config = self.config;
        if config.server_name.is_empty() {
            return Err(ConfigError::Invalid("server_name must not be empty".into()));
        }
        config.parsed_server_name()?;
        if config.cache_capacity == 0 {
            return Err(ConfigError::Invalid("cache_capacity must be > 0".into()));
        }
        if config.drain_len == 0 {
            return Err(ConfigError::Invalid("drain_len must be > 0".into()));
        }
        if config.alpn_protocols.iter().any(|p| p.is_empty() || p.len() > 255) {
            return Err(ConfigError::Invalid(
                "ALPN protocol names must be 1-255 bytes".into(),
            ));
        }
        if config.resumption.enabled && config.resumption.tickets == 0 {
            return Err(ConfigError::Invalid(
                "resumption needs at least one ticket per handshake".into(),
            ));
        }
        // Without back-pressure the transport may report closing before the
        // client has read the ticket flight.
        if config.resumption.enabled && config.handoff == HandoffMode::Buffered {
            return Err(ConfigError::Invalid(
                "resumption requires the rendezvous hand-off mode".into(),
            ));
        }
        Ok(config)
    }
}

/// Certificates and key for the server plus the client's trust anchors.
#[derive(Debug)]
pub struct Identity {
    pub cert_chain: Vec<CertificateDer<'static>>,
    pub private_key: PrivateKeyDer<'static>,
    pub trust_roots: RootCertStore,
}

impl Clone for Identity {
    fn clone(&self) -> Self {
        Self {
            cert_chain: self.cert_chain.clone(),
            private_key: self.private_key.clone_key(),
            trust_roots: self.trust_roots.clone(),
        }
    }
}

impl Identity {
    /// Load a server identity and trust store from PEM files.
    pub fn load(paths: &CertPaths) -> Result<Self, ConfigError> {
        let cert_chain = read_certs(&paths.cert_chain)?;
        let private_key =
            PrivateKeyDer::from_pem_file(&paths.private_key).map_err(|e| ConfigError::Pem {
                path: paths.private_key.clone(),
                reason: e.to_string(),
            })?;

        let roots = read_certs(&paths.trust_roots)?;
        let mut trust_roots = RootCertStore::empty();
        let (added, ignored) = trust_roots.add_parsable_certificates(roots);
        if added == 0 {
            return Err(ConfigError::NoTrustRoots(paths.trust_roots.clone()));
        }
        if ignored > 0 {
            tracing::warn!(
                path = %paths.trust_roots.display(),
                ignored,
                "skipped unparsable trust roots"
            );
        }

        tracing::debug!(
            chain_len = cert_chain.len(),
            roots = added,
            "loaded server identity"
        );
        Ok(Self {
            cert_chain,
            private_key,
            trust_roots,
        })
    }

    /// Generate a throwaway self-signed certificate for `names` and trust it.
    #[cfg(feature = "self-signed")]
    pub fn self_signed(names: &[&str]) -> Result<Self, ConfigError> {
        let names: Vec<String> = names.iter().map(|n| n.to_string()).collect();
        let rcgen::CertifiedKey { cert, key_pair } = rcgen::generate_simple_self_signed(names)
            .map_err(|e| ConfigError::Generate(e.to_string()))?;

        let cert_der = CertificateDer::from(cert.der().to_vec());
        let private_key = PrivateKeyDer::try_from(key_pair.serialize_der())
            .map_err(|e| ConfigError::Generate(e.to_string()))?;

        let mut trust_roots = RootCertStore::empty();
        trust_roots.add(cert_der.clone())?;

        Ok(Self {
            cert_chain: vec![cert_der],
            private_key,
            trust_roots,
        })
    }
}

fn read_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, ConfigError> {
    let pem_err = |e: rustls::pki_types::pem::Error| ConfigError::Pem {
        path: path.to_path_buf(),
        reason: e.to_string(),
    };
    let certs = CertificateDer::pem_file_iter(path)
        .map_err(pem_err)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(pem_err)?;
    if certs.is_empty() {
        return Err(ConfigError::NoCertificates(path.to_path_buf()));
    }
    Ok(certs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_builder() {
        let built = HarnessConfig::builder().build().unwrap();
        let default = HarnessConfig::default();
        assert_eq!(built.server_name(), default.server_name());
        assert_eq!(built.cache_capacity(), 128);
        assert_eq!(built.drain_len(), 1);
        assert_eq!(built.handoff(), HandoffMode::Rendezvous);
        assert!(built.resumption().enabled);
        assert!(built.alpn_protocols().is_empty());
    }

    #[test]
    fn builder_values_are_readable() {
        let built = HarnessConfig::builder()
            .server_name("example.com")
            .protocol(ProtocolVersions::Tls12)
            .cache_capacity(4)
            .drain_len(16)
            .alpn_protocol("h2")
            .build()
            .unwrap();
        assert_eq!(built.server_name(), "example.com");
        assert_eq!(built.protocol(), ProtocolVersions::Tls12);
        assert_eq!(built.cache_capacity(), 4);
        assert_eq!(built.drain_len(), 16);
        assert_eq!(built.alpn_protocols(), &[b"h2".to_vec()]);
        assert_eq!(built.parsed_server_name().unwrap().to_str(), "example.com");
    }

    #[test]
    fn single_version_lists() {
        assert_eq!(ProtocolVersions::Tls12.versions().len(), 1);
        assert_eq!(
            ProtocolVersions::Tls12.versions()[0].version,
            rustls::ProtocolVersion::TLSv1_2
        );
        assert_eq!(
            ProtocolVersions::Tls13.versions()[0].version,
            rustls::ProtocolVersion::TLSv1_3
        );
        assert_eq!(ProtocolVersions::All.versions().len(), 2);
    }

    #[test]
    fn builder_rejects_zero_capacity() {
        assert!(HarnessConfig::builder().cache_capacity(0).build().is_err());
    }

    #[test]
    fn builder_rejects_zero_drain() {
        assert!(HarnessConfig::builder().drain_len(0).build().is_err());
    }

    #[test]
    fn builder_rejects_bad_server_name() {
        let err = HarnessConfig::builder()
            .server_name("not a hostname!")
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidServerName(_)));
    }

    #[test]
    fn builder_rejects_buffered_resumption() {
        assert!(HarnessConfig::builder()
            .handoff(HandoffMode::Buffered)
            .build()
            .is_err());
        assert!(HarnessConfig::builder()
            .handoff(HandoffMode::Buffered)
            .resumption(Resumption::disabled())
            .build()
            .is_ok());
    }

    #[test]
    fn builder_rejects_ticketless_resumption() {
        let resumption = Resumption {
            enabled: true,
            tickets: 0,
        };
        assert!(HarnessConfig::builder().resumption(resumption).build().is_err());
    }

    #[test]
    fn cert_paths_layout() {
        let paths = CertPaths::in_dir("/tmp/pki");
        assert_eq!(paths.cert_chain, PathBuf::from("/tmp/pki/server-chain.pem"));
        assert_eq!(paths.private_key, PathBuf::from("/tmp/pki/server-key.pem"));
        assert_eq!(paths.trust_roots, PathBuf::from("/tmp/pki/ca-cert.pem"));
    }

    #[test]
    fn load_missing_files_fails() {
        let err = Identity::load(&CertPaths::in_dir("/nonexistent/pki")).unwrap_err();
        assert!(matches!(err, ConfigError::Pem { .. }));
    }

    #[cfg(feature = "self-signed")]
    #[test]
    fn self_signed_identity_is_self_trusting() {
        let identity = Identity::self_signed(&["localhost"]).unwrap();
        assert_eq!(identity.cert_chain.len(), 1);
        assert_eq!(identity.trust_roots.len(), 1);
    }

    #[cfg(feature = "self-signed")]
    #[test]
    fn load_reads_pem_files() {
        let rcgen::CertifiedKey { cert, key_pair } =
            rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();

        let dir = std::env::temp_dir().join(format!("hs-bench-pem-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let paths = CertPaths::in_dir(&dir);
        std::fs::write(&paths.cert_chain, cert.pem()).unwrap();
        std::fs::write(&paths.trust_roots, cert.pem()).unwrap();
        std::fs::write(&paths.private_key, key_pair.serialize_pem()).unwrap();

        let loaded = Identity::load(&paths).unwrap();
        assert_eq!(loaded.cert_chain.len(), 1);
        assert_eq!(loaded.cert_chain[0].as_ref(), cert.der().as_ref());
        assert_eq!(loaded.trust_roots.len(), 1);

        std::fs::write(&paths.trust_roots, "not a certificate\n").unwrap();
        let err = Identity::load(&paths).unwrap_err();
        assert!(matches!(err, ConfigError::NoCertificates(_)));

        std::fs::remove_dir_all(&dir).ok();
    }
}
