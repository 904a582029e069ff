//! One client/server handshake trial over an in-memory transport.

/// Repeated trials under timing control, and single trials with assertions.
pub mod driver;

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_rustls::TlsAcceptor;

use crate::config::{HarnessConfig, Identity};
use crate::engine::{self, ClientSessionCache, ConnectionState, TlsConfigs};
use crate::error::{ConfigError, Error, Result, TransportError};
use crate::transport::{DuplexEndpoint, Role, Signal, TransportPair};

/// Progress of a single trial.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrialPhase {
    Created,
    ServerStarted,
    BothHandshaking,
    Settled,
}

impl fmt::Display for TrialPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Created => "created",
            Self::ServerStarted => "server-started",
            Self::BothHandshaking => "both-handshaking",
            Self::Settled => "settled",
        })
    }
}

/// Something odd observed during a trial that did not fail it.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Anomaly {
    /// The post-handshake drain read returned application data.
    #[error("{role} drain read returned {bytes} unexpected bytes")]
    UnexpectedReadAfterHandshake { role: Role, bytes: usize },

    /// The drain read failed with something other than a close.
    #[error("{role} drain read failed: {reason}")]
    DrainFailed { role: Role, reason: String },
}

/// How the server side of a trial ended.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerOutcome {
    Completed(ConnectionState),
    Failed(String),
}

impl ServerOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }

    pub fn state(&self) -> Option<&ConnectionState> {
        match self {
            Self::Completed(state) => Some(state),
            Self::Failed(_) => None,
        }
    }
}

/// Result of one settled trial.
#[derive(Debug, Clone)]
pub struct TrialReport {
    pub client: ConnectionState,
    pub server: ServerOutcome,
    pub anomalies: Vec<Anomaly>,
    /// Wall-clock time from transport creation to settle.
    pub elapsed: Duration,
}

impl TrialReport {
    pub fn resumed(&self) -> bool {
        self.client.is_resumed()
    }
}

/// Sets the shared `closing` signal once both handshake calls have returned,
/// or immediately when a role gives up.
#[derive(Debug)]
struct SettleLatch {
    closing: Signal,
    returned: AtomicUsize,
}

impl SettleLatch {
    fn new(closing: Signal) -> Self {
        Self {
            closing,
            returned: AtomicUsize::new(0),
        }
    }

    fn arrive(&self, role: Role) {
        if self.returned.fetch_add(1, Ordering::AcqRel) + 1 == 2 {
            tracing::trace!(last = %role, "both handshakes returned; closing transport");
            self.closing.set();
        }
    }

    fn abort(&self, role: Role) {
        tracing::trace!(%role, "closing transport early");
        self.closing.set();
    }
}

/// What the server task hands back when joined.
struct ServerReport {
    outcome: ServerOutcome,
    anomaly: Option<Anomaly>,
}

/// Runs complete client/server handshakes against each other in-process.
///
/// Engine configuration is built once; every [`run`](Self::run) creates a
/// fresh transport pair. The client session cache is shared by all trials of
/// one harness, so a second trial can resume the first.
#[derive(Debug, Clone)]
pub struct HandshakeHarness {
    config: HarnessConfig,
    server_name: ServerName<'static>,
    tls: TlsConfigs,
}

impl HandshakeHarness {
    pub fn new(config: HarnessConfig, identity: &Identity) -> std::result::Result<Self, ConfigError> {
        let tls = TlsConfigs::new(&config, identity)?;
        Self::from_configs(config, tls)
    }

    /// Use prebuilt engine configurations. `config` still supplies the
    /// server name, hand-off mode and drain length.
    pub fn from_configs(
        config: HarnessConfig,
        tls: TlsConfigs,
    ) -> std::result::Result<Self, ConfigError> {
        let server_name = config.parsed_server_name()?;
        Ok(Self {
            config,
            server_name,
            tls,
        })
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    pub fn tls(&self) -> &TlsConfigs {
        &self.tls
    }

    pub fn session_cache(&self) -> &Arc<ClientSessionCache> {
        self.tls.session_cache()
    }

    /// A harness sharing this one's server configuration (and ticket key)
    /// but starting from an empty client session cache.
    pub fn with_fresh_cache(&self) -> Self {
        Self {
            config: self.config.clone(),
            server_name: self.server_name.clone(),
            tls: self.tls.with_fresh_cache(),
        }
    }

    /// A harness whose client uses `cache`, e.g. one built with an observer.
    pub fn with_cache(&self, cache: Arc<ClientSessionCache>) -> Self {
        Self {
            config: self.config.clone(),
            server_name: self.server_name.clone(),
            tls: self.tls.with_cache(cache),
        }
    }

    /// Run one trial to completion.
    ///
    /// Fails on a client handshake failure or an incomplete client handshake.
    /// A server failure is recorded in the report instead. Either way the
    /// server task has been joined when this returns; if it panicked the
    /// result is [`Error::ServerTask`].
    pub async fn run(&self) -> Result<TrialReport> {
        let start = Instant::now();
        let drain_len = self.config.drain_len();
        let handoff = self.config.handoff();

        let closing = Signal::new();
        let (client_io, server_io) = TransportPair::new(handoff, closing.clone()).split();
        let latch = Arc::new(SettleLatch::new(closing));
        tracing::trace!(phase = %TrialPhase::Created, ?handoff);

        let server = tokio::spawn(serve(
            self.tls.acceptor(),
            server_io,
            Arc::clone(&latch),
            drain_len,
        ));
        tracing::trace!(phase = %TrialPhase::ServerStarted);

        tracing::trace!(phase = %TrialPhase::BothHandshaking);
        let client = self.drive_client(client_io, &latch).await;

        // The client has drained and closed; the join is the settle barrier.
        let server = server.await;
        let (client, client_anomaly) = match client {
            Ok(done) => done,
            Err(e) => {
                // A dead server task explains the client failure.
                server?;
                return Err(e);
            }
        };
        let ServerReport {
            outcome,
            anomaly: server_anomaly,
        } = server?;

        let elapsed = start.elapsed();
        tracing::debug!(
            phase = %TrialPhase::Settled,
            resumed = client.is_resumed(),
            server_ok = outcome.is_completed(),
            elapsed_us = elapsed.as_micros() as u64,
            "trial settled"
        );

        Ok(TrialReport {
            client,
            server: outcome,
            anomalies: client_anomaly.into_iter().chain(server_anomaly).collect(),
            elapsed,
        })
    }

    async fn drive_client(
        &self,
        io: DuplexEndpoint,
        latch: &SettleLatch,
    ) -> Result<(ConnectionState, Option<Anomaly>)> {
        let connector = self.tls.connector();
        let (mut stream, state) =
            match engine::client_handshake(&connector, self.server_name.clone(), io).await {
                Ok(done) => done,
                Err(e) => {
                    latch.abort(Role::Client);
                    return Err(e);
                }
            };
        if !state.handshake_complete {
            latch.abort(Role::Client);
            return Err(Error::Incomplete { role: Role::Client });
        }
        latch.arrive(Role::Client);

        let anomaly = drain(&mut stream, Role::Client, self.config.drain_len()).await;
        close(&mut stream, Role::Client).await;
        Ok((state, anomaly))
    }
}

/// Server role: handshake, drain, close.
async fn serve(
    acceptor: TlsAcceptor,
    io: DuplexEndpoint,
    latch: Arc<SettleLatch>,
    drain_len: usize,
) -> ServerReport {
    match engine::server_handshake(&acceptor, io).await {
        Ok((mut stream, state)) => {
            latch.arrive(Role::Server);
            let anomaly = drain(&mut stream, Role::Server, drain_len).await;
            close(&mut stream, Role::Server).await;
            ServerReport {
                outcome: ServerOutcome::Completed(state),
                anomaly,
            }
        }
        Err((err, mut io)) => {
            // A close or EOF here means the client gave up first.
            let client_gone = matches!(
                &err,
                Error::Handshake { source, .. }
                    if TransportError::is_closed(source)
                        || source.kind() == io::ErrorKind::UnexpectedEof
            );
            if client_gone {
                tracing::debug!(error = %err, "server handshake aborted");
            } else {
                tracing::warn!(error = %err, "server handshake failed");
            }
            latch.abort(Role::Server);
            let anomaly = drain(&mut io, Role::Server, drain_len).await;
            close(&mut io, Role::Server).await;
            ServerReport {
                outcome: ServerOutcome::Failed(err.to_string()),
                anomaly,
            }
        }
    }
}

/// The single post-handshake read that lets the engine consume any
/// post-handshake messages (TLS 1.3 tickets) before the transport closes.
async fn drain<S>(stream: &mut S, role: Role, len: usize) -> Option<Anomaly>
where
    S: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; len];
    match stream.read(&mut buf).await {
        Ok(0) => None,
        Ok(bytes) => {
            tracing::warn!(%role, bytes, "unexpected data after handshake");
            Some(Anomaly::UnexpectedReadAfterHandshake { role, bytes })
        }
        Err(e) if TransportError::is_closed(&e) || e.kind() == io::ErrorKind::UnexpectedEof => {
            None
        }
        Err(e) => {
            tracing::warn!(%role, error = %e, "drain read failed");
            Some(Anomaly::DrainFailed {
                role,
                reason: e.to_string(),
            })
        }
    }
}

async fn close<S>(stream: &mut S, role: Role)
where
    S: AsyncWrite + Unpin,
{
    if let Err(e) = stream.shutdown().await {
        tracing::debug!(%role, error = %e, "close after trial failed");
    }
}
