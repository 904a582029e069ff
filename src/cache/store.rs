use std::collections::VecDeque;
use std::sync::Arc;

use rustls::client::{ClientSessionStore, Tls12ClientSessionValue, Tls13ClientSessionValue};
use rustls::pki_types::ServerName;
use rustls::NamedGroup;

use super::{SessionCache, DEFAULT_CAPACITY};

/// TLS 1.3 tickets retained per server; the oldest is dropped first.
pub const MAX_TLS13_TICKETS_PER_SERVER: usize = 8;

/// Everything remembered about one server.
#[derive(Debug, Default)]
pub struct ServerSessions {
    kx_hint: Option<NamedGroup>,
    tls12: Option<Tls12ClientSessionValue>,
    tls13: VecDeque<Tls13ClientSessionValue>,
}

impl ServerSessions {
    pub fn tls13_tickets(&self) -> usize {
        self.tls13.len()
    }

    pub fn has_tls12_session(&self) -> bool {
        self.tls12.is_some()
    }
}

/// Client-side resumption store handed to `rustls`.
///
/// Saving a ticket or TLS 1.2 session is a cache `put`; consuming one is a
/// `get`, which hits only when a resumable value was actually returned.
/// Key-exchange hints ride along without touching the counters.
#[derive(Debug, Clone)]
pub struct ResumptionStore {
    cache: Arc<SessionCache<ServerName<'static>, ServerSessions>>,
}

impl Default for ResumptionStore {
    fn default() -> Self {
        Self::new(Arc::new(SessionCache::new(DEFAULT_CAPACITY)))
    }
}

impl ResumptionStore {
    pub fn new(cache: Arc<SessionCache<ServerName<'static>, ServerSessions>>) -> Self {
        Self { cache }
    }

    pub fn cache(&self) -> &Arc<SessionCache<ServerName<'static>, ServerSessions>> {
        &self.cache
    }
}

impl ClientSessionStore for ResumptionStore {
    fn set_kx_hint(&self, server_name: ServerName<'static>, group: NamedGroup) {
        self.cache
            .update_untracked(server_name, ServerSessions::default, |s| {
                s.kx_hint = Some(group)
            });
    }

    fn kx_hint(&self, server_name: &ServerName<'_>) -> Option<NamedGroup> {
        self.cache
            .peek(&server_name.to_owned(), |s| s.kx_hint)
            .flatten()
    }

    fn set_tls12_session(&self, server_name: ServerName<'static>, value: Tls12ClientSessionValue) {
        tracing::trace!(server = ?server_name, "storing TLS 1.2 session");
        self.cache
            .update(server_name, ServerSessions::default, |s| s.tls12 = Some(value));
    }

    fn tls12_session(&self, server_name: &ServerName<'_>) -> Option<Tls12ClientSessionValue> {
        self.cache
            .lookup(&server_name.to_owned(), |s| s.tls12.clone())
    }

    fn remove_tls12_session(&self, server_name: &ServerName<'static>) {
        if self.cache.contains(server_name) {
            self.cache
                .update_untracked(server_name.clone(), ServerSessions::default, |s| {
                    s.tls12 = None
                });
        }
    }

    fn insert_tls13_ticket(&self, server_name: ServerName<'static>, value: Tls13ClientSessionValue) {
        tracing::trace!(server = ?server_name, "storing TLS 1.3 ticket");
        self.cache.update(server_name, ServerSessions::default, |s| {
            if s.tls13.len() == MAX_TLS13_TICKETS_PER_SERVER {
                s.tls13.pop_front();
            }
            s.tls13.push_back(value);
        });
    }

    fn take_tls13_ticket(&self, server_name: &ServerName<'static>) -> Option<Tls13ClientSessionValue> {
        self.cache.lookup(server_name, |s| s.tls13.pop_back())
    }
}
