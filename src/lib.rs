//! # vnet-bench Library
//!
//! Network benchmarks for the virtualized network interface of a guest
//! machine. Two measurements are provided:
//!
//! - **Latency**: repeated `ping` rounds from the guest, one sample per echo
//!   reply, in milliseconds.
//! - **Throughput**: parallel `iperf3` client/server pairs between host and
//!   guest, one pair per guest vCPU, in either or both directions.
//!
//! Samples are emitted as dimensioned observations into a per-run
//! [`MetricsLogger`]; raw iperf3 reports are persisted as
//! `<direction>_<client_index>.json` artifacts.
//!
//! ## Architecture Overview
//!
//! - `exec`: remote execution port (local shell, network namespace, SSH)
//! - `latency`: probe rounds and `ping` output parsing
//! - `throughput`: iperf3 fleets, port allocation, deadlines, report parsing
//! - `metrics`: dimension sets, observations, HDR-histogram summaries
//! - `results`: artifact, metrics and summary files
//! - `benchmark`: configuration and the runner that wires everything together
//! - `cli`, `logging`, `utils`: front-end support for the binary
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use vnet_bench::{BenchmarkConfig, LocalShell, MetricsLogger, SshExecutor, ThroughputBenchmark};
//! use vnet_bench::cli::TrafficMode;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let host = Arc::new(LocalShell::new("host"));
//!     let guest = Arc::new(SshExecutor::new("guest", "root@192.168.0.2"));
//!
//!     let config = BenchmarkConfig::new(
//!         TrafficMode::G2h,
//!         "128K".parse().map_err(anyhow::Error::msg)?,
//!         2,
//!         "192.168.0.1",
//!         "192.168.0.2",
//!     );
//!     let run = ThroughputBenchmark::new(host, guest)
//!         .run_throughput_benchmark(&config)
//!         .await?;
//!
//!     let mut metrics = MetricsLogger::new();
//!     metrics.set_dimensions(config.dimensions());
//!     vnet_bench::metrics::emit_throughput_metrics(&mut metrics, &run, config.warmup)?;
//!     Ok(())
//! }
//! ```

/// Benchmark configuration and the runner tying sampler, orchestrator,
/// metrics and persistence together
pub mod benchmark;

/// Command-line interface and configuration
///
/// Argument parsing with clap, human-readable durations ("5s", "500ms"),
/// payload length tokens and `key=value` dimensions.
pub mod cli;

pub mod error;

/// Remote execution port
pub mod exec;

pub mod latency;

pub mod logging;

/// Metric observations, dimension sets and aggregate statistics
pub mod metrics;

/// Artifact, metrics and summary files
pub mod results;

pub mod throughput;

pub mod utils;

pub use benchmark::{BenchmarkConfig, BenchmarkOutcome, BenchmarkRunner};
pub use cli::{Args, BenchmarkKind, PayloadLength, TrafficMode};
pub use error::{BenchError, BenchResult};
pub use exec::{CommandOutput, LocalShell, OutputMode, RemoteExecutor, SshExecutor};
pub use latency::{LatencyConfig, LatencySampler};
pub use metrics::{DimensionSet, MetricsLogger, SeriesSummary};
pub use results::{ArtifactSink, ArtifactStore};
pub use throughput::{ClientResult, Direction, RunResult, ThroughputBenchmark};

/// The current version of vnet-bench
///
/// Recorded in `summary.json` for reproducibility.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod defaults {
    use std::time::Duration;

    /// First port of the per-pair port range
    pub const BASE_PORT: u16 = 5000;

    /// Warm-up period excluded from throughput statistics
    pub const WARMUP: Duration = Duration::from_secs(5);

    /// Measured period following the warm-up
    pub const RUNTIME: Duration = Duration::from_secs(20);

    /// Delay between starting the servers and starting the clients
    pub const SERVER_STARTUP_DELAY: Duration = Duration::from_secs(1);

    /// Spawn overhead budgeted per client when checking the timeout
    pub const PER_CLIENT_OVERHEAD: Duration = Duration::from_secs(1);

    /// Slack added on top of the minimum when no timeout is given
    pub const TIMEOUT_SLACK: Duration = Duration::from_secs(5);

    /// Guest vCPUs, and thereby client/server pairs
    pub const VCPUS: usize = 2;

    pub const PAYLOAD_LENGTH: &str = "128K";

    /// Probe rounds of a latency measurement
    pub const LATENCY_ROUNDS: usize = 15;

    /// Echo requests per round
    pub const PROBES_PER_ROUND: usize = 30;

    /// Delay between echo requests of a round
    pub const PROBE_INTERVAL: Duration = Duration::ZERO;

    /// Added to the nominal duration of a probe round to form its deadline
    pub const PROBE_ROUND_SLACK: Duration = Duration::from_secs(10);

    pub const SSH_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

    pub const IPERF3: &str = "iperf3";

    /// Results directory when neither `--results-dir` nor the environment
    /// variable is set
    pub const RESULTS_DIR: &str = "results";

    pub const RESULTS_DIR_ENV: &str = "VNET_BENCH_RESULTS_DIR";
}
