use std::time::{Duration, Instant};

use serde::{Serialize, Serializer};

use super::{Anomaly, HandshakeHarness, TrialReport};
use crate::cache::CacheStatsSnapshot;
use crate::error::{ConfigError, Error, Result};

/// Which client session cache each timed trial sees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CachePolicy {
    /// Every trial shares the harness cache, so trials after the first can
    /// resume.
    #[default]
    Shared,
    /// Every trial starts from an empty cache and does a full handshake.
    FreshPerTrial,
}

/// Runs back-to-back trials and times each one.
#[derive(Debug, Clone)]
pub struct BenchmarkDriver {
    pub rounds: usize,
    /// Untimed trials run first. With a shared cache they also prime it.
    pub warmup: usize,
    pub cache: CachePolicy,
    /// Fail the run if any timed trial was a full handshake.
    pub expect_resumed: bool,
}

impl Default for BenchmarkDriver {
    fn default() -> Self {
        Self {
            rounds: 100,
            warmup: 5,
            cache: CachePolicy::default(),
            expect_resumed: false,
        }
    }
}

impl BenchmarkDriver {
    pub fn new(rounds: usize) -> Self {
        Self {
            rounds,
            ..Default::default()
        }
    }

    pub fn warmup(mut self, warmup: usize) -> Self {
        self.warmup = warmup;
        self
    }

    pub fn cache_policy(mut self, cache: CachePolicy) -> Self {
        self.cache = cache;
        self
    }

    pub fn expect_resumed(mut self, expect: bool) -> Self {
        self.expect_resumed = expect;
        self
    }

    fn validate(&self, harness: &HandshakeHarness) -> std::result::Result<(), ConfigError> {
        if self.rounds == 0 {
            return Err(ConfigError::Invalid("rounds must be > 0".into()));
        }
        if self.expect_resumed {
            if !harness.tls().resumption_enabled() {
                return Err(ConfigError::Invalid(
                    "expect_resumed needs resumption enabled".into(),
                ));
            }
            if self.cache == CachePolicy::FreshPerTrial {
                return Err(ConfigError::Invalid(
                    "expect_resumed needs a shared session cache".into(),
                ));
            }
            if self.warmup == 0 {
                return Err(ConfigError::Invalid(
                    "expect_resumed needs at least one warmup trial".into(),
                ));
            }
        }
        Ok(())
    }

    /// Run warmup then timed trials, stopping at the first failed trial.
    pub async fn run(&self, harness: &HandshakeHarness) -> Result<BenchReport> {
        self.validate(harness)?;

        for _ in 0..self.warmup {
            self.trial_harness(harness).run().await?;
        }
        tracing::debug!(warmup = self.warmup, "warmup done");

        let cache_before = harness.session_cache().stats();
        let mut fresh_caches = CacheStatsSnapshot::default();
        let mut report = BenchReport {
            timings: Vec::with_capacity(self.rounds),
            resumed: 0,
            anomalies: Vec::new(),
            cache: CacheStatsSnapshot::default(),
        };
        for round in 0..self.rounds {
            let trial = self.trial_harness(harness);
            let start = Instant::now();
            let result = trial.run().await?;
            report.timings.push(start.elapsed());
            if self.cache == CachePolicy::FreshPerTrial {
                fresh_caches += trial.session_cache().stats();
            }

            if result.resumed() {
                report.resumed += 1;
            } else if self.expect_resumed {
                return Err(Error::Assertion(format!(
                    "trial {round} was a full handshake, expected resumption"
                )));
            }
            report.anomalies.extend(result.anomalies);
        }
        report.cache = match self.cache {
            CachePolicy::Shared => harness.session_cache().stats().since(&cache_before),
            CachePolicy::FreshPerTrial => fresh_caches,
        };

        tracing::debug!(
            rounds = self.rounds,
            resumed = report.resumed,
            anomalies = report.anomalies.len(),
            "benchmark done"
        );
        Ok(report)
    }

    fn trial_harness(&self, harness: &HandshakeHarness) -> HandshakeHarness {
        match self.cache {
            CachePolicy::Shared => harness.clone(),
            CachePolicy::FreshPerTrial => harness.with_fresh_cache(),
        }
    }
}

/// Timings and observations from a benchmark run.
#[derive(Debug, Clone, Serialize)]
pub struct BenchReport {
    #[serde(serialize_with = "serialize_millis_vec")]
    pub timings: Vec<Duration>,
    /// Timed trials that completed as resumed handshakes.
    pub resumed: usize,
    pub anomalies: Vec<Anomaly>,
    /// Client session cache activity during the timed trials, summed over
    /// the per-trial caches under [`CachePolicy::FreshPerTrial`].
    pub cache: CacheStatsSnapshot,
}

impl BenchReport {
    pub fn stats(&self) -> Option<Stats> {
        Stats::from_timings(&self.timings)
    }

    pub fn handshakes_per_sec(&self) -> f64 {
        let total: Duration = self.timings.iter().sum();
        if total.is_zero() {
            return 0.0;
        }
        self.timings.len() as f64 / total.as_secs_f64()
    }
}

/// Summary of a set of trial durations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Stats {
    #[serde(rename = "min_ms", serialize_with = "serialize_millis")]
    pub min: Duration,
    #[serde(rename = "max_ms", serialize_with = "serialize_millis")]
    pub max: Duration,
    #[serde(rename = "mean_ms", serialize_with = "serialize_millis")]
    pub mean: Duration,
    #[serde(rename = "p50_ms", serialize_with = "serialize_millis")]
    pub p50: Duration,
    #[serde(rename = "p95_ms", serialize_with = "serialize_millis")]
    pub p95: Duration,
    #[serde(rename = "p99_ms", serialize_with = "serialize_millis")]
    pub p99: Duration,
}

impl Stats {
    /// `None` for an empty slice.
    pub fn from_timings(times: &[Duration]) -> Option<Self> {
        if times.is_empty() {
            return None;
        }
        let mut sorted = times.to_vec();
        sorted.sort();
        let n = sorted.len();
        let sum: Duration = sorted.iter().sum();
        Some(Self {
            min: sorted[0],
            max: sorted[n - 1],
            mean: sum / n as u32,
            p50: sorted[n / 2],
            p95: sorted[((n as f64) * 0.95) as usize],
            p99: sorted[((n as f64) * 0.99).min((n - 1) as f64) as usize],
        })
    }
}

impl std::fmt::Display for Stats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "min={:.3}ms, max={:.3}ms, mean={:.3}ms, p50={:.3}ms, p95={:.3}ms, p99={:.3}ms",
            dur_ms(self.min),
            dur_ms(self.max),
            dur_ms(self.mean),
            dur_ms(self.p50),
            dur_ms(self.p95),
            dur_ms(self.p99)
        )
    }
}

pub fn dur_ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

fn serialize_millis<S: Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_f64(dur_ms(*d))
}

fn serialize_millis_vec<S: Serializer>(
    ds: &[Duration],
    s: S,
) -> std::result::Result<S::Ok, S::Error> {
    s.collect_seq(ds.iter().map(|d| dur_ms(*d)))
}

/// Cache counter changes across the two trials of a resumption check.
#[derive(Debug, Clone)]
pub struct ResumptionCheck {
    pub first: TrialReport,
    pub second: TrialReport,
    pub first_cache: CacheStatsSnapshot,
    pub second_cache: CacheStatsSnapshot,
}

/// Single trials with assertions. Failures are [`Error::Assertion`] naming
/// the property that did not hold.
#[derive(Debug, Clone, Copy, Default)]
pub struct TestDriver;

impl TestDriver {
    /// One trial; both sides must complete.
    pub async fn verify_handshake(harness: &HandshakeHarness) -> Result<TrialReport> {
        let report = harness.run().await?;
        if !report.client.handshake_complete {
            return Err(Error::Assertion("client handshake not complete".into()));
        }
        if let super::ServerOutcome::Failed(reason) = &report.server {
            return Err(Error::Assertion(format!(
                "server handshake did not complete: {reason}"
            )));
        }
        Ok(report)
    }

    /// Two trials sharing the harness cache. The first must leave exactly one
    /// cache `put`; the second must hit the cache and resume.
    pub async fn verify_resumption(harness: &HandshakeHarness) -> Result<ResumptionCheck> {
        if !harness.tls().resumption_enabled() {
            return Err(Error::Assertion("resumption is disabled".into()));
        }
        let cache = harness.session_cache();

        let before = cache.stats();
        let first = Self::verify_handshake(harness).await?;
        let after_first = cache.stats();
        let first_cache = after_first.since(&before);
        if first_cache.puts != 1 {
            return Err(Error::Assertion(format!(
                "expected exactly one session cache put after the first trial, saw {}",
                first_cache.puts
            )));
        }

        let second = Self::verify_handshake(harness).await?;
        let second_cache = cache.stats().since(&after_first);
        if second_cache.hits == 0 {
            return Err(Error::Assertion(
                "second trial never hit the session cache".into(),
            ));
        }
        if !second.resumed() {
            return Err(Error::Assertion(format!(
                "second trial was not resumed (handshake kind {:?})",
                second.client.handshake_kind
            )));
        }

        Ok(ResumptionCheck {
            first,
            second,
            first_cache,
            second_cache,
        })
    }
}
