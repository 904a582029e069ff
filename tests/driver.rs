#![cfg(feature = "self-signed")]

use std::time::Duration;

use tls_handshake_bench::{
    BenchmarkDriver, CachePolicy, Error, HandshakeHarness, HarnessConfig, Identity,
    ProtocolVersions, Resumption,
};

fn harness(config: HarnessConfig) -> HandshakeHarness {
    let identity = Identity::self_signed(&["localhost"]).unwrap();
    HandshakeHarness::new(config, &identity).unwrap()
}

async fn bounded<F: std::future::Future>(fut: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(60), fut)
        .await
        .expect("benchmark did not finish")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn full_handshake_benchmark() {
    let harness = harness(HarnessConfig::default());
    let driver = BenchmarkDriver::new(8)
        .warmup(2)
        .cache_policy(CachePolicy::FreshPerTrial);
    let report = bounded(driver.run(&harness)).await.unwrap();

    assert_eq!(report.timings.len(), 8);
    assert_eq!(report.resumed, 0);
    assert!(report.anomalies.is_empty());
    let stats = report.stats().unwrap();
    assert!(stats.min <= stats.p50 && stats.p50 <= stats.max);
    assert!(report.handshakes_per_sec() > 0.0);
    // Each fresh cache stores its trial's ticket and never hits.
    assert_eq!(report.cache.puts, 8);
    assert_eq!(report.cache.hits, 0);
    // The harness cache itself is left alone.
    assert_eq!(harness.session_cache().stats().puts, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn resumed_handshake_benchmark() {
    for protocol in [ProtocolVersions::Tls12, ProtocolVersions::Tls13] {
        let config = HarnessConfig::builder().protocol(protocol).build().unwrap();
        let harness = harness(config);
        let driver = BenchmarkDriver::new(6).warmup(1).expect_resumed(true);
        let report = bounded(driver.run(&harness)).await.unwrap();

        assert_eq!(report.resumed, 6, "{protocol:?}");
        assert!(report.cache.hits >= 6, "{protocol:?}");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn expecting_resumption_without_tickets_is_rejected() {
    let config = HarnessConfig::builder()
        .resumption(Resumption::disabled())
        .build()
        .unwrap();
    let driver = BenchmarkDriver::new(2).warmup(1).expect_resumed(true);
    let err = driver.run(&harness(config)).await.unwrap_err();
    assert!(matches!(err, Error::Config(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn expecting_resumption_with_fresh_caches_is_rejected() {
    let driver = BenchmarkDriver::new(2)
        .warmup(1)
        .cache_policy(CachePolicy::FreshPerTrial)
        .expect_resumed(true);
    let err = driver
        .run(&harness(HarnessConfig::default()))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Config(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn zero_rounds_is_rejected() {
    let err = BenchmarkDriver::new(0)
        .run(&harness(HarnessConfig::default()))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Config(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn client_failure_aborts_the_run() {
    let server = Identity::self_signed(&["localhost"]).unwrap();
    let stranger = Identity::self_signed(&["localhost"]).unwrap();
    let harness = HandshakeHarness::new(
        HarnessConfig::default(),
        &Identity {
            trust_roots: stranger.trust_roots,
            ..server
        },
    )
    .unwrap();

    let err = bounded(BenchmarkDriver::new(5).warmup(0).run(&harness))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Handshake { .. }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn report_serializes_to_json() {
    let harness = harness(HarnessConfig::default());
    let report = bounded(BenchmarkDriver::new(2).warmup(0).run(&harness))
        .await
        .unwrap();
    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["timings"].as_array().map(Vec::len), Some(2));
    // Shared cache: the second trial resumes the first.
    assert_eq!(json["resumed"], 1);
    assert_eq!(json["cache"]["puts"], 2);
    assert_eq!(json["cache"]["hits"], 1);

    let stats = serde_json::to_value(report.stats().unwrap()).unwrap();
    assert!(stats["p99_ms"].as_f64().unwrap() > 0.0);
}
