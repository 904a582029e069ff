use std::io;
use std::path::PathBuf;

use crate::transport::Role;

/// Errors raised by the simulated transport.
///
/// These cross the `AsyncRead`/`AsyncWrite` boundary wrapped in an
/// [`io::Error`]; use [`TransportError::from_io`] to recover them.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("{role} endpoint closed")]
    Closed { role: Role },

    #[error("{role} endpoint lost its peer")]
    PeerGone { role: Role },
}

impl TransportError {
    /// Recover a transport error from an I/O error produced by an endpoint.
    pub fn from_io(err: &io::Error) -> Option<&TransportError> {
        err.get_ref()
            .and_then(|inner| inner.downcast_ref::<TransportError>())
    }

    /// True when `err` is the read-after-close error of an endpoint.
    pub fn is_closed(err: &io::Error) -> bool {
        matches!(Self::from_io(err), Some(TransportError::Closed { .. }))
    }
}

impl From<TransportError> for io::Error {
    fn from(err: TransportError) -> Self {
        let kind = match err {
            TransportError::Closed { .. } => io::ErrorKind::NotConnected,
            TransportError::PeerGone { .. } => io::ErrorKind::BrokenPipe,
        };
        io::Error::new(kind, err)
    }
}

/// Errors from loading certificates and building engine configuration.
///
/// All of these are fatal at process start; none occur inside a trial.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {reason}")]
    Pem { path: PathBuf, reason: String },

    #[error("no certificates found in {0}")]
    NoCertificates(PathBuf),

    #[error("no usable trust roots in {0}")]
    NoTrustRoots(PathBuf),

    #[error("invalid server name: {0:?}")]
    InvalidServerName(String),

    #[error("invalid harness configuration: {0}")]
    Invalid(String),

    #[error("certificate generation failed: {0}")]
    Generate(String),

    #[error("TLS configuration rejected: {0}")]
    Tls(#[from] rustls::Error),
}

/// Top-level error type for the crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("{role} handshake failed: {source}")]
    Handshake {
        role: Role,
        #[source]
        source: io::Error,
    },

    #[error("{role} handshake returned without completing")]
    Incomplete { role: Role },

    #[error("assertion failed: {0}")]
    Assertion(String),

    #[error("server task did not finish: {0}")]
    ServerTask(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, Error>;
