//! # Benchmark Runner Module
//!
//! Turns command-line arguments into validated benchmark configurations and
//! runs one benchmark end to end: executors are built for the host and the
//! guest, the sampler or orchestrator is driven, metrics are emitted under
//! the run's dimensions, and throughput reports are handed to an artifact
//! sink.
//!
//! ## Key Components
//!
//! - **BenchmarkConfig**: immutable description of one throughput run
//! - **BenchmarkRunner**: owns the executors and the extra dimensions
//! - **BenchmarkOutcome**: metrics, summaries and raw results of a run

use crate::{
    cli::{Args, BenchmarkKind, PayloadLength, TrafficMode},
    error::{BenchError, BenchResult},
    exec::{LocalShell, RemoteExecutor, SshExecutor},
    latency::{LatencyConfig, LatencySampler, LATENCY_UNIT, PING_LATENCY_METRIC},
    metrics::{emit_throughput_metrics, summarize_throughput, DimensionSet, MetricsLogger, SeriesSummary},
    results::ArtifactSink,
    throughput::{ports::PortRange, Direction, RunResult, ThroughputBenchmark},
    utils::format_bitrate,
};
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Largest block iperf3 accepts for `--len` on TCP
const MAX_PAYLOAD_BYTES: u64 = 1 << 20;

/// Display helper giving one consistent rendering of a throughput
/// configuration in logs and on the console
struct BenchmarkConfigDisplay<'a> {
    config: &'a BenchmarkConfig,
}

impl<'a> std::fmt::Display for BenchmarkConfigDisplay<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let config = self.config;
        let affinity = match config.server_affinity {
            Some(base) => format!(
                "CPU {}..{}",
                base,
                base.saturating_add(config.num_clients).saturating_sub(1)
            ),
            None => "unpinned".to_string(),
        };
        write!(
            f,
            "mode={} payload={} clients={} ports={}.. warmup={:?} runtime={:?} timeout={:?} servers={}",
            config.mode,
            config.payload_length,
            config.num_clients,
            config.base_port,
            config.warmup,
            config.runtime,
            config.timeout,
            affinity
        )
    }
}

/// Configuration of one throughput run
///
/// Built once (`new` or `from_args`), checked once (`validate`) and then
/// only read. The orchestrator validates again before starting any process.
#[derive(Clone, Debug)]
pub struct BenchmarkConfig {
    /// Which direction(s) to exercise
    pub mode: TrafficMode,

    /// Payload token passed to iperf3 `--len`
    pub payload_length: PayloadLength,

    /// Number of client/server pairs per direction
    ///
    /// Normally the guest's vCPU count.
    pub num_clients: usize,

    /// First port of the contiguous per-pair range
    pub base_port: u16,

    /// Leading period whose intervals are discarded
    pub warmup: Duration,

    /// Measured period following the warm-up
    pub runtime: Duration,

    /// Deadline of each direction's sub-run
    ///
    /// Must exceed [`BenchmarkConfig::minimum_timeout`].
    pub timeout: Duration,

    /// Host address on the guest-facing interface
    pub host_address: String,

    /// Guest address
    pub guest_address: String,

    /// iperf3 binary used on both sides
    pub iperf3: String,

    /// Pause between starting the servers and starting the clients
    pub server_startup_delay: Duration,

    /// Pin server `i` to CPU `base + i`
    pub server_affinity: Option<usize>,
}

impl BenchmarkConfig {
    /// Configuration with default timings and a derived timeout
    pub fn new(
        mode: TrafficMode,
        payload_length: PayloadLength,
        num_clients: usize,
        host_address: impl Into<String>,
        guest_address: impl Into<String>,
    ) -> Self {
        let mut config = Self {
            mode,
            payload_length,
            num_clients,
            base_port: crate::defaults::BASE_PORT,
            warmup: crate::defaults::WARMUP,
            runtime: crate::defaults::RUNTIME,
            timeout: Duration::ZERO,
            host_address: host_address.into(),
            guest_address: guest_address.into(),
            iperf3: crate::defaults::IPERF3.to_string(),
            server_startup_delay: crate::defaults::SERVER_STARTUP_DELAY,
            server_affinity: None,
        };
        config.timeout = config.default_timeout();
        config
    }

    /// Create a throughput configuration from CLI arguments
    ///
    /// ## Parameters
    /// - `args`: Parsed command-line arguments
    ///
    /// ## Returns
    /// - `Ok(BenchmarkConfig)`: Valid configuration ready for use
    /// - `Err(anyhow::Error)`: The arguments describe an invalid run
    pub fn from_args(args: &Args) -> Result<Self> {
        let mut config = Self::new(
            args.mode,
            args.payload_length.clone(),
            args.vcpus,
            args.host_ip.clone(),
            args.guest_ip.clone(),
        );
        config.base_port = args.base_port;
        config.warmup = args.warmup;
        config.runtime = args.runtime;
        config.iperf3 = args.iperf3.clone();
        config.server_startup_delay = args.server_startup_delay;
        config.server_affinity = args.server_affinity;
        config.timeout = args.timeout.unwrap_or_else(|| config.default_timeout());

        config
            .validate()
            .context("Invalid throughput configuration")?;
        Ok(config)
    }

    /// Smallest duration the timeout must exceed: the full iperf3 run, the
    /// server startup delay and one second of spawn overhead per client
    pub fn minimum_timeout(&self) -> Duration {
        let clients = u32::try_from(self.num_clients).unwrap_or(u32::MAX);
        self.warmup
            .saturating_add(self.runtime)
            .saturating_add(self.server_startup_delay)
            .saturating_add(crate::defaults::PER_CLIENT_OVERHEAD.saturating_mul(clients))
    }

    pub fn default_timeout(&self) -> Duration {
        self.minimum_timeout()
            .saturating_add(crate::defaults::TIMEOUT_SLACK)
    }

    /// Address the servers of `direction` bind to and the clients connect to
    pub fn receiver_address(&self, direction: Direction) -> &str {
        match direction {
            Direction::GuestToHost => &self.host_address,
            Direction::HostToGuest => &self.guest_address,
        }
    }

    /// Dimensions every throughput observation of this run carries
    pub fn dimensions(&self) -> DimensionSet {
        DimensionSet::new()
            .with("performance_test", "test_network_tcp_throughput")
            .with("mode", self.mode.to_string())
            .with("payload_length", self.payload_length.to_string())
            .with("vcpus", self.num_clients.to_string())
    }

    pub fn validate(&self) -> BenchResult<()> {
        let invalid = |msg: String| -> BenchResult<()> { Err(BenchError::InvalidConfig(msg)) };

        if self.num_clients == 0 {
            return invalid("at least one client is required".to_string());
        }
        if self.host_address.trim().is_empty() || self.guest_address.trim().is_empty() {
            return invalid("host and guest addresses must be set".to_string());
        }
        if self.iperf3.trim().is_empty() {
            return invalid("iperf3 binary must not be empty".to_string());
        }
        if self.runtime < Duration::from_secs(1) {
            return invalid(format!("runtime {:?} is shorter than 1s", self.runtime));
        }
        // iperf3 only takes whole seconds for --time and --omit
        if self.warmup.subsec_nanos() != 0 || self.runtime.subsec_nanos() != 0 {
            return invalid("warm-up and runtime must be whole seconds".to_string());
        }
        if self.payload_length.bytes() > MAX_PAYLOAD_BYTES {
            return invalid(format!(
                "payload length {} exceeds the 1M iperf3 block limit",
                self.payload_length
            ));
        }
        PortRange::allocate(self.base_port, self.num_clients)?;

        let minimum = self.minimum_timeout();
        if self.timeout <= minimum {
            return invalid(format!(
                "timeout {:?} must exceed {:?} (warm-up + runtime + startup delay + 1s per client)",
                self.timeout, minimum
            ));
        }

        if let Some(base) = self.server_affinity {
            let cpus = crate::utils::get_cpu_cores();
            let end = base.saturating_add(self.num_clients);
            if end > cpus {
                return invalid(format!(
                    "server affinity {}..{} exceeds the {} available CPUs",
                    base,
                    end - 1,
                    cpus
                ));
            }
        }
        Ok(())
    }
}

impl LatencyConfig {
    /// Latency measurement towards the host, issued from the guest
    pub fn from_args(args: &Args) -> Result<Self> {
        let config = Self {
            target_address: args.host_ip.clone(),
            rounds: args.rounds,
            probes_per_round: args.probes_per_round,
            probe_interval: args.probe_interval,
            round_timeout: args.round_timeout,
        };
        config.validate().context("Invalid latency configuration")?;
        Ok(config)
    }

    pub fn dimensions(&self, vcpus: usize) -> DimensionSet {
        DimensionSet::new()
            .with("performance_test", "test_network_latency")
            .with("vcpus", vcpus.to_string())
    }
}

/// Everything a finished benchmark produced
#[derive(Debug)]
pub struct BenchmarkOutcome {
    pub kind: BenchmarkKind,
    pub metrics: MetricsLogger,
    /// One summary per emitted series of interest
    pub summaries: Vec<SeriesSummary>,
    /// Client reports, for throughput runs
    pub run: Option<RunResult>,
    pub elapsed: Duration,
}

/// Runs benchmarks between a host and a guest
pub struct BenchmarkRunner {
    host: Arc<dyn RemoteExecutor>,
    guest: Arc<dyn RemoteExecutor>,

    /// Dimensions added to those of every run (kernel, CPU model, ...)
    extra_dimensions: DimensionSet,
}

impl BenchmarkRunner {
    pub fn new(host: Arc<dyn RemoteExecutor>, guest: Arc<dyn RemoteExecutor>) -> Self {
        Self {
            host,
            guest,
            extra_dimensions: DimensionSet::new(),
        }
    }

    /// Runner whose executors follow the target options of `args`
    ///
    /// The host side is this machine, inside `--host-netns` if given. The
    /// guest is reached over SSH when `--guest-ssh` is set and is this
    /// machine otherwise.
    pub fn from_args(args: &Args) -> Self {
        let mut host = LocalShell::new("host");
        if let Some(ref netns) = args.host_netns {
            host = host.in_netns(netns.clone());
        }

        let guest: Arc<dyn RemoteExecutor> = match args.guest_ssh {
            Some(ref destination) => {
                let mut ssh = SshExecutor::new("guest", destination.clone());
                if let Some(port) = args.ssh_port {
                    ssh = ssh.port(port);
                }
                if let Some(ref key) = args.ssh_key {
                    ssh = ssh.identity_file(key.clone());
                }
                Arc::new(ssh)
            }
            None => Arc::new(LocalShell::new("guest")),
        };

        let extra = args.dimensions.iter().cloned().collect();
        Self::new(Arc::new(host), guest).with_dimensions(extra)
    }

    pub fn with_dimensions(mut self, dimensions: DimensionSet) -> Self {
        self.extra_dimensions = dimensions;
        self
    }

    fn run_dimensions(&self, base: DimensionSet) -> DimensionSet {
        let mut dims = base;
        for (name, value) in self.extra_dimensions.iter() {
            dims.insert(name, value);
        }
        dims
    }

    /// Sample latency from the guest and summarize the samples
    pub async fn run_latency(&self, config: &LatencyConfig, vcpus: usize) -> Result<BenchmarkOutcome> {
        let started = Instant::now();
        let mut metrics = MetricsLogger::new();
        metrics.set_dimensions(self.run_dimensions(config.dimensions(vcpus)));

        let sampler = LatencySampler::new(Arc::clone(&self.guest));
        let samples = sampler
            .run(config, &mut metrics)
            .await
            .with_context(|| format!("Latency benchmark against {} failed", config.target_address))?;
        debug!("Collected {} latency samples", samples.len());

        let summaries = metrics
            .summarize(PING_LATENCY_METRIC)
            .into_iter()
            .collect::<Vec<_>>();
        if let Some(summary) = summaries.first() {
            info!(
                "Latency: p50 {:.3} {} over {} samples",
                summary.percentile(50.0).unwrap_or_default(),
                LATENCY_UNIT,
                summary.count
            );
        }

        Ok(BenchmarkOutcome {
            kind: BenchmarkKind::Latency,
            metrics,
            summaries,
            run: None,
            elapsed: started.elapsed(),
        })
    }

    /// Run the throughput benchmark, emit its metrics and store every client
    /// report in `sink`
    pub async fn run_throughput(
        &self,
        config: &BenchmarkConfig,
        sink: &mut dyn ArtifactSink,
    ) -> Result<BenchmarkOutcome> {
        let started = Instant::now();
        info!("Throughput benchmark: {}", BenchmarkConfigDisplay { config });

        let mut metrics = MetricsLogger::new();
        metrics.set_dimensions(self.run_dimensions(config.dimensions()));

        let benchmark = ThroughputBenchmark::new(Arc::clone(&self.host), Arc::clone(&self.guest));
        let run = benchmark
            .run_throughput_benchmark(config)
            .await
            .context("Throughput benchmark failed")?;

        for (direction, clients) in run.iter() {
            for (client_index, result) in clients.iter().enumerate() {
                sink.store(direction, client_index, result)?;
                if let Some(mean) = result.mean_bits_per_second(config.warmup) {
                    info!(
                        "{} client {}: {} steady-state mean",
                        direction,
                        client_index,
                        format_bitrate(mean)
                    );
                }
            }
        }

        let points = emit_throughput_metrics(&mut metrics, &run, config.warmup)?;
        debug!("Emitted {} throughput time points", points);
        let summaries = summarize_throughput(&metrics, &run);

        Ok(BenchmarkOutcome {
            kind: BenchmarkKind::Throughput,
            metrics,
            summaries,
            run: Some(run),
            elapsed: started.elapsed(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn config(num_clients: usize) -> BenchmarkConfig {
        BenchmarkConfig::new(
            TrafficMode::G2h,
            "128K".parse().unwrap(),
            num_clients,
            "192.168.0.1",
            "192.168.0.2",
        )
    }

    #[test]
    fn test_default_timeout_exceeds_minimum() {
        let config = config(2);
        assert_eq!(config.minimum_timeout(), Duration::from_secs(5 + 20 + 1 + 2));
        assert_eq!(config.timeout, Duration::from_secs(33));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_timeout_must_strictly_exceed_minimum() {
        let mut config = config(1);
        config.timeout = config.minimum_timeout();
        assert!(matches!(config.validate(), Err(BenchError::InvalidConfig(_))));

        config.timeout += Duration::from_millis(1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_configurations() {
        let mut c = config(0);
        assert!(c.validate().is_err());

        c = config(2);
        c.base_port = 65535;
        assert!(c.validate().is_err());

        c = config(1);
        c.runtime = Duration::from_millis(1500);
        c.timeout = Duration::from_secs(60);
        assert!(c.validate().is_err());

        c = config(1);
        c.server_affinity = Some(crate::utils::get_cpu_cores());
        assert!(c.validate().is_err());

        c = config(1);
        c.server_affinity = Some(usize::MAX);
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_payload_length_limit() {
        let mut c = config(1);
        c.payload_length = "1024K".parse().unwrap();
        assert!(c.validate().is_ok());

        c.payload_length = "1025K".parse().unwrap();
        assert!(matches!(c.validate(), Err(BenchError::InvalidConfig(_))));
        c.payload_length = "2M".parse().unwrap();
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_huge_timings_do_not_overflow() {
        let mut c = config(usize::MAX);
        c.warmup = Duration::MAX;
        assert_eq!(c.minimum_timeout(), Duration::MAX);
        assert_eq!(c.default_timeout(), Duration::MAX);
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_receiver_address_follows_direction() {
        let config = config(1);
        assert_eq!(config.receiver_address(Direction::GuestToHost), "192.168.0.1");
        assert_eq!(config.receiver_address(Direction::HostToGuest), "192.168.0.2");
    }

    #[test]
    fn test_from_args() {
        let args = Args::try_parse_from([
            "vnet-bench",
            "--mode",
            "h2g",
            "--vcpus",
            "1",
            "--payload-length",
            "1024K",
            "--warmup",
            "2s",
            "--runtime",
            "3s",
        ])
        .unwrap();
        let config = BenchmarkConfig::from_args(&args).unwrap();
        assert_eq!(config.mode, TrafficMode::H2g);
        assert_eq!(config.num_clients, 1);
        assert_eq!(config.timeout, Duration::from_secs(2 + 3 + 1 + 1 + 5));

        let dims = config.dimensions();
        assert_eq!(dims.get("payload_length"), Some("1024K"));
        assert_eq!(dims.get("mode"), Some("h2g"));
        assert_eq!(dims.get("vcpus"), Some("1"));

        let args = Args::try_parse_from(["vnet-bench", "--timeout", "10s"]).unwrap();
        assert!(BenchmarkConfig::from_args(&args).is_err());
    }

    #[test]
    fn test_latency_config_from_args() {
        let args =
            Args::try_parse_from(["vnet-bench", "--benchmark", "latency", "--host-ip", "10.0.0.1"])
                .unwrap();
        let config = LatencyConfig::from_args(&args).unwrap();
        assert_eq!(config.target_address, "10.0.0.1");
        assert_eq!(config.rounds, 15);
        assert_eq!(config.probes_per_round, 30);
        assert_eq!(
            config.dimensions(2).get("performance_test"),
            Some("test_network_latency")
        );
    }

    #[test]
    fn test_extra_dimensions_are_merged() {
        let args = Args::try_parse_from(["vnet-bench", "--dimension", "guest_kernel=6.1"]).unwrap();
        let runner = BenchmarkRunner::from_args(&args);
        let dims = runner.run_dimensions(config(1).dimensions());
        assert_eq!(dims.get("guest_kernel"), Some("6.1"));
        assert_eq!(dims.get("mode"), Some("g2h"));
    }

    #[test]
    fn test_config_display() {
        let rendered = BenchmarkConfigDisplay { config: &config(2) }.to_string();
        assert!(rendered.contains("mode=g2h"));
        assert!(rendered.contains("clients=2"));
        assert!(rendered.contains("servers=unpinned"));

        let mut unvalidated = config(0);
        unvalidated.server_affinity = Some(0);
        let rendered = BenchmarkConfigDisplay { config: &unvalidated }.to_string();
        assert!(rendered.contains("servers=CPU 0..0"));
    }
}
