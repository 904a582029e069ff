#![cfg(feature = "self-signed")]

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::ServerName;
use rustls::{HandshakeKind, ProtocolVersion};

use tls_handshake_bench::cache::ServerSessions;
use tls_handshake_bench::{
    CacheObserver, Error, HandoffMode, HandshakeHarness, HarnessConfig, Identity,
    ProtocolVersions, Resumption, Role, ServerOutcome, SessionCache, TestDriver,
};

/// Every trial must settle well inside this; a hang is a failure.
const TRIAL_TIMEOUT: Duration = Duration::from_secs(10);

async fn bounded<F: Future>(fut: F) -> F::Output {
    tokio::time::timeout(TRIAL_TIMEOUT, fut)
        .await
        .expect("trial did not settle")
}

fn identity() -> Identity {
    Identity::self_signed(&["localhost"]).expect("self-signed identity")
}

fn harness(config: HarnessConfig) -> HandshakeHarness {
    HandshakeHarness::new(config, &identity()).expect("harness")
}

fn localhost() -> ServerName<'static> {
    ServerName::try_from("localhost").unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn full_handshake_tls13() {
    let config = HarnessConfig::builder()
        .protocol(ProtocolVersions::Tls13)
        .build()
        .unwrap();
    let report = bounded(TestDriver::verify_handshake(&harness(config)))
        .await
        .unwrap();

    assert!(report.client.handshake_complete);
    assert_eq!(report.client.protocol_version, Some(ProtocolVersion::TLSv1_3));
    assert!(report.client.cipher_suite.is_some());
    assert_eq!(report.client.handshake_kind, Some(HandshakeKind::Full));
    assert!(!report.resumed());
    assert!(report.anomalies.is_empty(), "{:?}", report.anomalies);

    let server = report.server.state().expect("server completed");
    assert_eq!(server.cipher_suite, report.client.cipher_suite);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn full_handshake_tls12() {
    let config = HarnessConfig::builder()
        .protocol(ProtocolVersions::Tls12)
        .build()
        .unwrap();
    let report = bounded(TestDriver::verify_handshake(&harness(config)))
        .await
        .unwrap();

    assert_eq!(report.client.protocol_version, Some(ProtocolVersion::TLSv1_2));
    assert!(report.server.is_completed());
    assert!(report.anomalies.is_empty(), "{:?}", report.anomalies);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn buffered_handoff_without_resumption() {
    let config = HarnessConfig::builder()
        .handoff(HandoffMode::Buffered)
        .resumption(Resumption::disabled())
        .build()
        .unwrap();
    let harness = harness(config);
    let report = bounded(TestDriver::verify_handshake(&harness)).await.unwrap();

    assert!(report.server.is_completed());
    assert!(harness.session_cache().is_empty());
}

#[tokio::test(flavor = "current_thread")]
async fn settles_on_a_single_thread() {
    let report = bounded(harness(HarnessConfig::default()).run()).await.unwrap();
    assert!(report.client.handshake_complete);
    assert!(report.server.is_completed());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn back_to_back_trials_all_settle() {
    let harness = harness(HarnessConfig::default());
    for _ in 0..20 {
        let report = bounded(harness.with_fresh_cache().run()).await.unwrap();
        assert!(report.client.handshake_complete);
        assert!(report.server.is_completed());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn wide_drain_read() {
    let config = HarnessConfig::builder().drain_len(4096).build().unwrap();
    let report = bounded(harness(config).run()).await.unwrap();
    assert!(report.anomalies.is_empty(), "{:?}", report.anomalies);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn alpn_is_negotiated() {
    let config = HarnessConfig::builder().alpn_protocol("h2").build().unwrap();
    let report = bounded(harness(config).run()).await.unwrap();
    assert_eq!(report.client.alpn_protocol.as_deref(), Some(&b"h2"[..]));
    assert_eq!(
        report.server.state().and_then(|s| s.alpn_protocol.clone()),
        Some(b"h2".to_vec())
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn untrusted_server_fails_client_and_releases_server() {
    let server = identity();
    let stranger = identity();
    let mismatched = Identity {
        trust_roots: stranger.trust_roots,
        ..server
    };
    let harness = HandshakeHarness::new(HarnessConfig::default(), &mismatched).unwrap();

    let err = bounded(harness.run()).await.unwrap_err();
    assert!(
        matches!(err, Error::Handshake { role: Role::Client, .. }),
        "unexpected error: {err}"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn wrong_server_name_fails_client() {
    let config = HarnessConfig::builder()
        .server_name("example.com")
        .build()
        .unwrap();
    let err = bounded(harness(config).run()).await.unwrap_err();
    assert!(matches!(err, Error::Handshake { role: Role::Client, .. }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_trial_leaves_harness_usable() {
    let server = identity();
    let stranger = identity();
    let bad = HandshakeHarness::new(
        HarnessConfig::default(),
        &Identity {
            trust_roots: stranger.trust_roots,
            ..server.clone()
        },
    )
    .unwrap();
    assert!(bounded(bad.run()).await.is_err());

    let good = HandshakeHarness::new(HarnessConfig::default(), &server).unwrap();
    let report = bounded(good.run()).await.unwrap();
    assert!(matches!(report.server, ServerOutcome::Completed(_)));
}

async fn check_resumption(protocol: ProtocolVersions, expected: ProtocolVersion) {
    let config = HarnessConfig::builder().protocol(protocol).build().unwrap();
    let harness = harness(config);
    let check = bounded(TestDriver::verify_resumption(&harness))
        .await
        .unwrap();

    assert_eq!(check.first_cache.puts, 1);
    assert!(check.second_cache.hits >= 1);
    assert!(!check.first.resumed());
    assert!(check.second.resumed());
    assert_eq!(check.second.client.protocol_version, Some(expected));
    assert_eq!(
        check.second.server.state().and_then(|s| s.handshake_kind),
        Some(HandshakeKind::Resumed)
    );
    assert!(check.first.anomalies.is_empty(), "{:?}", check.first.anomalies);
    assert!(check.second.anomalies.is_empty(), "{:?}", check.second.anomalies);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn resumption_round_trip_tls13() {
    check_resumption(ProtocolVersions::Tls13, ProtocolVersion::TLSv1_3).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn resumption_round_trip_tls12() {
    check_resumption(ProtocolVersions::Tls12, ProtocolVersion::TLSv1_2).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn ticket_lands_in_cache_after_first_trial() {
    let config = HarnessConfig::builder()
        .protocol(ProtocolVersions::Tls13)
        .build()
        .unwrap();
    let harness = harness(config);
    bounded(harness.run()).await.unwrap();

    let tickets = harness
        .session_cache()
        .peek(&localhost(), ServerSessions::tls13_tickets);
    assert_eq!(tickets, Some(1));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn extra_tickets_are_capped() {
    let config = HarnessConfig::builder()
        .protocol(ProtocolVersions::Tls13)
        .resumption(Resumption {
            enabled: true,
            tickets: 12,
        })
        .build()
        .unwrap();
    let harness = harness(config);
    bounded(harness.run()).await.unwrap();

    let tickets = harness
        .session_cache()
        .peek(&localhost(), ServerSessions::tls13_tickets);
    assert_eq!(
        tickets,
        Some(tls_handshake_bench::cache::store::MAX_TLS13_TICKETS_PER_SERVER)
    );
    assert_eq!(harness.session_cache().stats().puts, 12);
}

#[derive(Default)]
struct Counts {
    puts: AtomicU64,
    hits: AtomicU64,
}

impl CacheObserver<ServerName<'static>> for Counts {
    fn on_put(&self, _key: &ServerName<'static>) {
        self.puts.fetch_add(1, Ordering::SeqCst);
    }

    fn on_get(&self, _key: &ServerName<'static>, hit: bool) {
        if hit {
            self.hits.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn observer_sees_put_then_hit() {
    let counts = Arc::new(Counts::default());
    let cache = Arc::new(SessionCache::new(8).with_observer(counts.clone()));
    let harness = harness(HarnessConfig::default()).with_cache(cache);

    let first = bounded(harness.run()).await.unwrap();
    assert!(!first.resumed());
    assert_eq!(counts.puts.load(Ordering::SeqCst), 1);
    assert_eq!(counts.hits.load(Ordering::SeqCst), 0);

    let second = bounded(harness.run()).await.unwrap();
    assert!(second.resumed());
    assert!(counts.hits.load(Ordering::SeqCst) >= 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn fresh_cache_prevents_resumption() {
    let harness = harness(HarnessConfig::default());
    bounded(harness.run()).await.unwrap();

    let report = bounded(harness.with_fresh_cache().run()).await.unwrap();
    assert!(!report.resumed());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn disabled_resumption_never_resumes() {
    let config = HarnessConfig::builder()
        .resumption(Resumption::disabled())
        .build()
        .unwrap();
    let harness = harness(config);
    bounded(harness.run()).await.unwrap();
    let second = bounded(harness.run()).await.unwrap();

    assert!(!second.resumed());
    assert_eq!(harness.session_cache().stats().puts, 0);
    let err = bounded(TestDriver::verify_resumption(&harness))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Assertion(_)));
}
