//! # Latency Sampler
//!
//! Measures round-trip latency from the guest to a target address with the
//! system `ping` utility. A measurement is a sequence of rounds; each round is
//! one `ping` invocation sending a fixed number of echo requests. Every reply
//! time becomes one sample, in milliseconds.
//!
//! Rounds run strictly one after another, each under its own deadline. A
//! round that hangs or whose output cannot be parsed fails the whole
//! measurement; nothing is emitted for it.

use crate::error::{BenchError, BenchResult};
use crate::exec::RemoteExecutor;
use crate::metrics::MetricsLogger;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info};

/// Metric name of latency samples
pub const PING_LATENCY_METRIC: &str = "ping_latency";

/// Unit of latency samples
pub const LATENCY_UNIT: &str = "Milliseconds";

/// A reply count and summary line are always present, so shorter output
/// cannot hold a reply.
const MIN_OUTPUT_LINES: usize = 3;

/// Latency measurement parameters
#[derive(Debug, Clone)]
pub struct LatencyConfig {
    /// Address the probes are sent to
    pub target_address: String,
    pub rounds: usize,
    pub probes_per_round: usize,
    /// Delay between probes of one round
    pub probe_interval: Duration,
    /// Deadline of one round; derived from the probe count and interval
    /// when unset
    pub round_timeout: Option<Duration>,
}

impl LatencyConfig {
    pub fn new(target_address: impl Into<String>) -> Self {
        Self {
            target_address: target_address.into(),
            rounds: crate::defaults::LATENCY_ROUNDS,
            probes_per_round: crate::defaults::PROBES_PER_ROUND,
            probe_interval: crate::defaults::PROBE_INTERVAL,
            round_timeout: None,
        }
    }

    pub fn validate(&self) -> BenchResult<()> {
        if self.target_address.trim().is_empty() {
            return Err(BenchError::InvalidConfig(
                "latency target address must not be empty".to_string(),
            ));
        }
        if self.rounds == 0 || self.probes_per_round == 0 {
            return Err(BenchError::InvalidConfig(
                "latency rounds and probes per round must be at least 1".to_string(),
            ));
        }
        if self.round_timeout == Some(Duration::ZERO) {
            return Err(BenchError::InvalidConfig(
                "probe round timeout must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Issues probe rounds through an executor
pub struct LatencySampler {
    executor: Arc<dyn RemoteExecutor>,
    round_timeout: Option<Duration>,
}

impl LatencySampler {
    pub fn new(executor: Arc<dyn RemoteExecutor>) -> Self {
        Self {
            executor,
            round_timeout: None,
        }
    }

    /// Fixed deadline for every round instead of the derived one
    pub fn with_round_timeout(mut self, round_timeout: Duration) -> Self {
        self.round_timeout = Some(round_timeout);
        self
    }

    /// Time `probes` echo requests take at `interval`, plus slack for the
    /// last reply and the command transport
    pub fn default_round_timeout(probes: usize, interval: Duration) -> Duration {
        let probes = u32::try_from(probes).unwrap_or(u32::MAX);
        interval
            .saturating_mul(probes)
            .saturating_add(crate::defaults::PROBE_ROUND_SLACK)
    }

    /// Command line of a single probe round
    pub fn probe_command(target: &str, probes: usize, interval: Duration) -> String {
        format!("ping -c {} -i {} {}", probes, interval.as_secs_f64(), target)
    }

    /// Run `rounds` probe rounds against `target` and return every reply
    /// time in the order the replies were printed.
    ///
    /// A round that outlives its deadline is killed and reported as
    /// [`BenchError::ProbeTimeout`].
    pub async fn sample_latency(
        &self,
        target: &str,
        rounds: usize,
        probes_per_round: usize,
        interval: Duration,
    ) -> BenchResult<Vec<f64>> {
        let limit = self
            .round_timeout
            .unwrap_or_else(|| Self::default_round_timeout(probes_per_round, interval));
        self.sample_rounds(target, rounds, probes_per_round, interval, limit)
            .await
    }

    async fn sample_rounds(
        &self,
        target: &str,
        rounds: usize,
        probes_per_round: usize,
        interval: Duration,
        limit: Duration,
    ) -> BenchResult<Vec<f64>> {
        let command = Self::probe_command(target, probes_per_round, interval);
        let mut samples = Vec::new();

        for round in 0..rounds {
            let output = timeout(limit, self.executor.execute(&command))
                .await
                .map_err(|_| BenchError::ProbeTimeout {
                    target: self.executor.target().to_string(),
                    round: round + 1,
                    timeout: limit,
                })??;
            let replies = parse_ping_output(&output.stdout)?;
            debug!(
                "Round {}/{}: {} replies from {}",
                round + 1,
                rounds,
                replies.len(),
                target
            );
            samples.extend(replies);
        }

        Ok(samples)
    }

    /// Sample latency and forward every sample to `metrics`
    pub async fn run(
        &self,
        config: &LatencyConfig,
        metrics: &mut MetricsLogger,
    ) -> BenchResult<Vec<f64>> {
        config.validate()?;
        info!(
            "Sampling latency to {} from {}: {} rounds of {} probes",
            config.target_address,
            self.executor.target(),
            config.rounds,
            config.probes_per_round
        );

        let limit = config
            .round_timeout
            .or(self.round_timeout)
            .unwrap_or_else(|| {
                Self::default_round_timeout(config.probes_per_round, config.probe_interval)
            });
        let samples = self
            .sample_rounds(
                &config.target_address,
                config.rounds,
                config.probes_per_round,
                config.probe_interval,
                limit,
            )
            .await?;

        let fastest = samples.iter().copied().fold(f64::INFINITY, f64::min);
        let slowest = samples.iter().copied().fold(0.0, f64::max);
        info!(
            "Collected {} samples ({} to {})",
            samples.len(),
            crate::utils::format_latency_ms(fastest),
            crate::utils::format_latency_ms(slowest)
        );

        for &sample in &samples {
            metrics.put_metric(PING_LATENCY_METRIC, sample, LATENCY_UNIT)?;
        }
        Ok(samples)
    }
}

/// Extract reply times, in milliseconds, from `ping` output.
///
/// A reply line has the shape
/// `<n> bytes from <addr>: icmp_seq=<n> ttl=<n> time=<t> ms`; every other
/// line is ignored. Output that is too short or holds no reply is malformed.
pub fn parse_ping_output(output: &str) -> BenchResult<Vec<f64>> {
    let output = output.trim();
    let line_count = output.lines().count();
    if line_count < MIN_OUTPUT_LINES {
        return Err(BenchError::probe(format!(
            "expected at least {} lines, got {}",
            MIN_OUTPUT_LINES, line_count
        )));
    }

    let mut samples = Vec::new();
    for line in output.lines() {
        if let Some(time) = reply_time(line) {
            let value = time
                .trim()
                .parse::<f64>()
                .map_err(|_| BenchError::probe(format!("unparseable reply time `{}`", time)))?;
            samples.push(value);
        }
    }

    if samples.is_empty() {
        return Err(BenchError::probe("no echo replies in output"));
    }
    Ok(samples)
}

/// Time token of a reply line, `None` if the line is not a reply
fn reply_time(line: &str) -> Option<&str> {
    let (count, rest) = line.split_once(" bytes from ")?;
    let (from, rest) = rest.split_once(": icmp_seq=")?;
    let (seq, rest) = rest.split_once(" ttl=")?;
    let (ttl, rest) = rest.rsplit_once(" time=")?;
    let (time, _) = rest.rsplit_once(" ms")?;

    if [count, from, seq, ttl, time].iter().any(|s| s.is_empty()) {
        return None;
    }
    Some(time)
}
