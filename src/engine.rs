//! Adapter over the external handshake engine (`rustls` via `tokio-rustls`).
//!
//! The harness only ever calls [`client_handshake`] and [`server_handshake`]
//! and reads the resulting [`ConnectionState`]; record framing, key exchange
//! and certificate validation all stay inside the engine.

use std::sync::Arc;

use rustls::client::Resumption as ClientResumption;
use rustls::pki_types::ServerName;
use rustls::server::NoServerSessionStorage;
use rustls::{ClientConfig, CommonState, HandshakeKind, ServerConfig};
use tokio_rustls::{client, server, TlsAcceptor, TlsConnector};

use crate::cache::{ResumptionStore, ServerSessions, SessionCache};
use crate::config::{HarnessConfig, Identity};
use crate::error::{ConfigError, Error};
use crate::transport::{DuplexEndpoint, Role};

/// Client session cache type used by the engine.
pub type ClientSessionCache = SessionCache<ServerName<'static>, ServerSessions>;

pub type ClientStream = client::TlsStream<DuplexEndpoint>;
pub type ServerStream = server::TlsStream<DuplexEndpoint>;

/// What the engine reports about a connection after its handshake call
/// returns.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionState {
    pub handshake_complete: bool,
    pub cipher_suite: Option<rustls::CipherSuite>,
    pub protocol_version: Option<rustls::ProtocolVersion>,
    pub handshake_kind: Option<HandshakeKind>,
    pub alpn_protocol: Option<Vec<u8>>,
}

impl ConnectionState {
    pub fn from_common(conn: &CommonState) -> Self {
        Self {
            handshake_complete: !conn.is_handshaking(),
            cipher_suite: conn.negotiated_cipher_suite().map(|s| s.suite()),
            protocol_version: conn.protocol_version(),
            handshake_kind: conn.handshake_kind(),
            alpn_protocol: conn.alpn_protocol().map(<[u8]>::to_vec),
        }
    }

    /// True for an abbreviated handshake that reused a saved session.
    pub fn is_resumed(&self) -> bool {
        self.handshake_kind == Some(HandshakeKind::Resumed)
    }
}

/// Engine configuration for both peers of a trial, built once and shared by
/// every trial run with it.
#[derive(Debug, Clone)]
pub struct TlsConfigs {
    pub client: Arc<ClientConfig>,
    pub server: Arc<ServerConfig>,
    cache: Arc<ClientSessionCache>,
    cache_capacity: usize,
    resumption: bool,
}

impl TlsConfigs {
    /// Build client and server configurations from `config` and `identity`.
    ///
    /// The server gets the certificate chain and key plus, when resumption
    /// is enabled, a ticket key and ticket count. The client gets the trust
    /// roots and a [`ResumptionStore`] over a fresh session cache.
    pub fn new(config: &HarnessConfig, identity: &Identity) -> Result<Self, ConfigError> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let versions = config.protocol().versions();

        let mut server = ServerConfig::builder_with_provider(Arc::clone(&provider))
            .with_protocol_versions(versions)?
            .with_no_client_auth()
            .with_single_cert(identity.cert_chain.clone(), identity.private_key.clone_key())?;
        server.alpn_protocols = config.alpn_protocols().to_vec();
        if config.resumption().enabled {
            server.ticketer = rustls::crypto::ring::Ticketer::new()?;
            server.send_tls13_tickets = config.resumption().tickets;
        } else {
            server.session_storage = Arc::new(NoServerSessionStorage {});
            server.send_tls13_tickets = 0;
        }

        let mut client = ClientConfig::builder_with_provider(provider)
            .with_protocol_versions(versions)?
            .with_root_certificates(identity.trust_roots.clone())
            .with_no_client_auth();
        client.alpn_protocols = config.alpn_protocols().to_vec();
        let cache = Arc::new(SessionCache::new(config.cache_capacity()));
        let client = with_cache(client, config.resumption().enabled, &cache);

        Ok(Self {
            client: Arc::new(client),
            server: Arc::new(server),
            cache,
            cache_capacity: config.cache_capacity(),
            resumption: config.resumption().enabled,
        })
    }

    /// The client session cache shared by every trial using these configs.
    pub fn session_cache(&self) -> &Arc<ClientSessionCache> {
        &self.cache
    }

    pub fn resumption_enabled(&self) -> bool {
        self.resumption
    }

    /// Same configurations with an empty client session cache. The server
    /// keeps its ticket key.
    pub fn with_fresh_cache(&self) -> Self {
        self.with_cache(Arc::new(SessionCache::new(self.cache_capacity)))
    }

    /// Same configurations with the client using `cache`.
    pub fn with_cache(&self, cache: Arc<ClientSessionCache>) -> Self {
        let client = with_cache((*self.client).clone(), self.resumption, &cache);
        Self {
            client: Arc::new(client),
            server: Arc::clone(&self.server),
            cache,
            cache_capacity: self.cache_capacity,
            resumption: self.resumption,
        }
    }

    pub fn connector(&self) -> TlsConnector {
        TlsConnector::from(Arc::clone(&self.client))
    }

    pub fn acceptor(&self) -> TlsAcceptor {
        TlsAcceptor::from(Arc::clone(&self.server))
    }
}

fn with_cache(mut client: ClientConfig, enabled: bool, cache: &Arc<ClientSessionCache>) -> ClientConfig {
    client.resumption = if enabled {
        ClientResumption::store(Arc::new(ResumptionStore::new(Arc::clone(cache))))
    } else {
        ClientResumption::disabled()
    };
    client
}

/// Run the client side of a handshake over `io`.
pub async fn client_handshake(
    connector: &TlsConnector,
    server_name: ServerName<'static>,
    io: DuplexEndpoint,
) -> Result<(ClientStream, ConnectionState), Error> {
    let stream = connector
        .connect(server_name, io)
        .await
        .map_err(|source| Error::Handshake {
            role: Role::Client,
            source,
        })?;
    let state = ConnectionState::from_common(stream.get_ref().1);
    Ok((stream, state))
}

/// Run the server side of a handshake over `io`.
///
/// On failure the endpoint is handed back so the caller can still run its
/// drain/close sequence on it.
pub async fn server_handshake(
    acceptor: &TlsAcceptor,
    io: DuplexEndpoint,
) -> Result<(ServerStream, ConnectionState), (Error, DuplexEndpoint)> {
    match acceptor.accept(io).into_fallible().await {
        Ok(stream) => {
            let state = ConnectionState::from_common(stream.get_ref().1);
            Ok((stream, state))
        }
        Err((source, io)) => Err((
            Error::Handshake {
                role: Role::Server,
                source,
            },
            io,
        )),
    }
}
