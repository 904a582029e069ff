use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tracing_subscriber::EnvFilter;

use tls_handshake_bench::{
    BenchmarkDriver, CachePolicy, CertPaths, HandoffMode, HandshakeHarness, HarnessConfig,
    Identity, ProtocolVersions, Resumption, TestDriver,
};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Protocol {
    Tls12,
    Tls13,
    All,
}

impl From<Protocol> for ProtocolVersions {
    fn from(p: Protocol) -> Self {
        match p {
            Protocol::Tls12 => ProtocolVersions::Tls12,
            Protocol::Tls13 => ProtocolVersions::Tls13,
            Protocol::All => ProtocolVersions::All,
        }
    }
}

#[derive(Parser)]
#[command(
    name = "tls-handshake-bench",
    about = "In-process TLS handshake and resumption benchmarks"
)]
struct Args {
    /// Directory holding server-chain.pem, server-key.pem and ca-cert.pem
    #[arg(long, default_value = "certs/rsa2048")]
    certs: PathBuf,

    /// Server certificate chain (overrides --certs)
    #[arg(long)]
    cert: Option<PathBuf>,

    /// Server private key (overrides --certs)
    #[arg(long)]
    key: Option<PathBuf>,

    /// Trusted root bundle (overrides --certs)
    #[arg(long)]
    ca: Option<PathBuf>,

    /// Generate a self-signed identity instead of loading PEM files
    #[cfg(feature = "self-signed")]
    #[arg(long)]
    self_signed: bool,

    /// Name the client expects in the server certificate
    #[arg(long, default_value = "localhost")]
    server_name: String,

    /// Number of timed handshakes
    #[arg(long, default_value_t = 100)]
    rounds: usize,

    /// Untimed handshakes run first
    #[arg(long, default_value_t = 5)]
    warmup: usize,

    /// Benchmark resumed handshakes (shared cache, warmup primes it)
    #[arg(long)]
    resume: bool,

    /// Protocol versions offered by both peers
    #[arg(long, value_enum, default_value_t = Protocol::All)]
    protocol: Protocol,

    /// Queue writes instead of waiting for the peer to read them
    #[arg(long)]
    buffered: bool,

    /// Output JSON to this path
    #[arg(long)]
    output: Option<PathBuf>,
}

impl Args {
    fn cert_paths(&self) -> CertPaths {
        let mut paths = CertPaths::in_dir(&self.certs);
        if let Some(cert) = &self.cert {
            paths.cert_chain = cert.clone();
        }
        if let Some(key) = &self.key {
            paths.private_key = key.clone();
        }
        if let Some(ca) = &self.ca {
            paths.trust_roots = ca.clone();
        }
        paths
    }

    fn identity(&self) -> Result<Identity> {
        #[cfg(feature = "self-signed")]
        {
            if self.self_signed {
                return Identity::self_signed(&[self.server_name.as_str()])
                    .context("generating self-signed identity");
            }
        }
        let paths = self.cert_paths();
        Identity::load(&paths)
            .with_context(|| format!("loading identity from {}", paths.cert_chain.display()))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    anyhow::ensure!(args.rounds > 0, "--rounds must be > 0");
    anyhow::ensure!(
        !args.resume || args.warmup > 0,
        "--resume needs at least one warmup round"
    );

    anyhow::ensure!(
        !(args.resume && args.buffered),
        "--resume cannot be combined with --buffered"
    );

    // Buffered hand-off cannot carry tickets reliably.
    let resumption = if args.buffered {
        Resumption::disabled()
    } else {
        Resumption::default()
    };
    let config = HarnessConfig::builder()
        .server_name(args.server_name.clone())
        .protocol(args.protocol.into())
        .resumption(resumption)
        .handoff(if args.buffered {
            HandoffMode::Buffered
        } else {
            HandoffMode::Rendezvous
        })
        .build()?;

    let identity = args.identity()?;
    let harness = HandshakeHarness::new(config, &identity)?;

    let check = TestDriver::verify_handshake(&harness.with_fresh_cache()).await?;
    eprintln!(
        "Handshake OK: {:?} {:?}\n",
        check.client.protocol_version, check.client.cipher_suite
    );

    let driver = BenchmarkDriver::new(args.rounds)
        .warmup(args.warmup)
        .cache_policy(if args.resume {
            CachePolicy::Shared
        } else {
            CachePolicy::FreshPerTrial
        })
        .expect_resumed(args.resume);

    let label = if args.resume { "resumed handshake" } else { "full handshake" };
    eprintln!("{label} (n={})", args.rounds);
    let report = driver.run(&harness).await?;
    let stats = report
        .stats()
        .context("benchmark produced no timings")?;

    println!("  {label}:");
    println!("    {stats}");
    println!(
        "    {:.1} handshakes/s, {} resumed, {} anomalies",
        report.handshakes_per_sec(),
        report.resumed,
        report.anomalies.len()
    );
    for anomaly in &report.anomalies {
        eprintln!("  WARNING: {anomaly}");
    }

    if let Some(path) = &args.output {
        let json = serde_json::json!({
            "benchmark_type": label,
            "protocol": harness.config().protocol(),
            "handoff": harness.config().handoff(),
            "rounds": args.rounds,
            "warmup": args.warmup,
            "stats": stats,
            "handshakes_per_sec": report.handshakes_per_sec(),
            "resumed": report.resumed,
            "cache": report.cache,
            "anomalies": report.anomalies,
        });
        std::fs::write(path, serde_json::to_string_pretty(&json)?)?;
        eprintln!("Results written to {}", path.display());
    }

    Ok(())
}
