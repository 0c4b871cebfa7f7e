use crate::throughput::Direction;
use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// vnet-bench - latency and throughput of a guest's virtual network interface
#[derive(Parser, Debug, Clone)]
#[clap(version, about, long_about = None)]
pub struct Args {
    /// Benchmark to run
    #[clap(short = 'b', long, value_enum, default_value_t = BenchmarkKind::Throughput, help_heading = "Core Options")]
    pub benchmark: BenchmarkKind,

    /// Transfer direction(s) of the throughput benchmark
    #[clap(short = 'm', long, value_enum, default_value_t = TrafficMode::G2h, help_heading = "Core Options")]
    pub mode: TrafficMode,

    /// Guest vCPU count; one client/server pair is started per vCPU
    #[clap(long, default_value_t = crate::defaults::VCPUS, help_heading = "Core Options")]
    pub vcpus: usize,

    /// Payload length passed to iperf3 `--len` (e.g. 128K, 1024K)
    #[clap(short = 'l', long, default_value = crate::defaults::PAYLOAD_LENGTH, help_heading = "Core Options")]
    pub payload_length: PayloadLength,

    /// First TCP port of the per-pair port range
    #[clap(long, default_value_t = crate::defaults::BASE_PORT, help_heading = "Throughput Options")]
    pub base_port: u16,

    /// Warm-up period excluded from statistics (e.g. 5s)
    #[clap(long, value_parser = parse_duration, default_value = "5s", help_heading = "Throughput Options")]
    pub warmup: Duration,

    /// Measured period following the warm-up
    #[clap(long, value_parser = parse_duration, default_value = "20s", help_heading = "Throughput Options")]
    pub runtime: Duration,

    /// Deadline for each direction; derived from the other timings if omitted
    #[clap(long, value_parser = parse_duration, help_heading = "Throughput Options")]
    pub timeout: Option<Duration>,

    /// Delay between starting the servers and starting the clients
    #[clap(long, value_parser = parse_duration, default_value = "1s", help_heading = "Throughput Options")]
    pub server_startup_delay: Duration,

    /// Pin server `i` to CPU `N + i` on the receiving side
    #[clap(long, help_heading = "Throughput Options")]
    pub server_affinity: Option<usize>,

    /// iperf3 binary on both sides
    #[clap(long, default_value = crate::defaults::IPERF3, help_heading = "Throughput Options")]
    pub iperf3: String,

    /// Number of probe rounds
    #[clap(long, default_value_t = crate::defaults::LATENCY_ROUNDS, help_heading = "Latency Options")]
    pub rounds: usize,

    /// Echo requests sent per round
    #[clap(long, default_value_t = crate::defaults::PROBES_PER_ROUND, help_heading = "Latency Options")]
    pub probes_per_round: usize,

    /// Delay between echo requests of a round
    #[clap(long, value_parser = parse_duration, default_value = "0s", help_heading = "Latency Options")]
    pub probe_interval: Duration,

    /// Deadline of one probe round; derived from probes and interval if omitted
    #[clap(long, value_parser = parse_duration, help_heading = "Latency Options")]
    pub round_timeout: Option<Duration>,

    /// Host address on the guest-facing interface
    #[clap(long, default_value = "127.0.0.1", help_heading = "Target Options")]
    pub host_ip: String,

    /// Guest address
    #[clap(long, default_value = "127.0.0.1", help_heading = "Target Options")]
    pub guest_ip: String,

    /// SSH destination of the guest (user@host); commands run locally if omitted
    #[clap(long, help_heading = "Target Options")]
    pub guest_ssh: Option<String>,

    /// Identity file for the guest SSH connection
    #[clap(long, help_heading = "Target Options")]
    pub ssh_key: Option<PathBuf>,

    /// Port of the guest SSH server
    #[clap(long, help_heading = "Target Options")]
    pub ssh_port: Option<u16>,

    /// Network namespace the host side of the guest interface lives in
    #[clap(long, help_heading = "Target Options")]
    pub host_netns: Option<String>,

    /// Directory for artifacts, metrics and summary
    /// (default: $VNET_BENCH_RESULTS_DIR or ./results)
    #[clap(short = 'o', long, help_heading = "Output Options")]
    pub results_dir: Option<PathBuf>,

    /// Extra dimension attached to every metric (key=value, repeatable)
    #[clap(long = "dimension", value_parser = parse_dimension, help_heading = "Output Options")]
    pub dimensions: Vec<(String, String)>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[clap(short = 'v', long, action = clap::ArgAction::Count, help_heading = "Output Options")]
    pub verbose: u8,

    /// Only log warnings and errors
    #[clap(short = 'q', long, default_value_t = false, help_heading = "Output Options")]
    pub quiet: bool,

    /// Also write logs to this file
    #[clap(long, help_heading = "Output Options")]
    pub log_file: Option<PathBuf>,
}

impl Args {
    /// Results directory after applying the environment fallback
    pub fn resolved_results_dir(&self) -> PathBuf {
        self.results_dir
            .clone()
            .or_else(|| std::env::var_os(crate::defaults::RESULTS_DIR_ENV).map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(crate::defaults::RESULTS_DIR))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
pub enum BenchmarkKind {
    /// Round-trip latency from the guest with ping
    #[clap(name = "latency")]
    Latency,
    /// Bulk TCP throughput with parallel iperf3 pairs
    #[clap(name = "throughput")]
    Throughput,
}

impl fmt::Display for BenchmarkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BenchmarkKind::Latency => write!(f, "latency"),
            BenchmarkKind::Throughput => write!(f, "throughput"),
        }
    }
}

/// Direction selection of a throughput run
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
pub enum TrafficMode {
    /// Guest sends, host receives
    #[clap(name = "g2h")]
    G2h,
    /// Host sends, guest receives
    #[clap(name = "h2g")]
    H2g,
    /// Both directions as independent sequential sub-runs
    #[clap(name = "both")]
    Both,
}

impl TrafficMode {
    /// Directions exercised by this mode, in execution order
    pub fn directions(&self) -> Vec<Direction> {
        match self {
            TrafficMode::G2h => vec![Direction::GuestToHost],
            TrafficMode::H2g => vec![Direction::HostToGuest],
            TrafficMode::Both => vec![Direction::GuestToHost, Direction::HostToGuest],
        }
    }
}

impl fmt::Display for TrafficMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrafficMode::G2h => write!(f, "g2h"),
            TrafficMode::H2g => write!(f, "h2g"),
            TrafficMode::Both => write!(f, "both"),
        }
    }
}

/// Categorical payload size token as iperf3 accepts it: a positive integer
/// with an optional `K`, `M` or `G` suffix
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PayloadLength(String);

impl PayloadLength {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Size in bytes, with binary suffixes
    pub fn bytes(&self) -> u64 {
        let (digits, multiplier) = split_size_suffix(&self.0);
        digits.parse::<u64>().unwrap_or(0).saturating_mul(multiplier)
    }
}

fn split_size_suffix(s: &str) -> (&str, u64) {
    match s.chars().last() {
        Some('K') | Some('k') => (&s[..s.len() - 1], 1 << 10),
        Some('M') | Some('m') => (&s[..s.len() - 1], 1 << 20),
        Some('G') | Some('g') => (&s[..s.len() - 1], 1 << 30),
        _ => (s, 1),
    }
}

impl FromStr for PayloadLength {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (digits, _) = split_size_suffix(s);
        if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
            return Err(format!(
                "Invalid payload length '{}': expected a number with an optional K/M/G suffix",
                s
            ));
        }
        if digits.chars().all(|c| c == '0') {
            return Err(format!("Payload length '{}' must be positive", s));
        }
        Ok(Self(s.to_string()))
    }
}

impl TryFrom<String> for PayloadLength {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PayloadLength> for String {
    fn from(value: PayloadLength) -> Self {
        value.0
    }
}

impl fmt::Display for PayloadLength {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();

    if s.is_empty() {
        return Err("Duration cannot be empty".to_string());
    }

    let (num_str, unit) = if let Some(stripped) = s.strip_suffix("ms") {
        (stripped, "ms")
    } else if let Some(stripped) = s.strip_suffix('s') {
        (stripped, "s")
    } else if let Some(stripped) = s.strip_suffix('m') {
        (stripped, "m")
    } else {
        (s, "s") // Default to seconds
    };

    let num: f64 = num_str
        .parse()
        .map_err(|_| format!("Invalid number in duration: {}", num_str))?;
    if !num.is_finite() || num < 0.0 {
        return Err(format!("Duration must be a non-negative number: {}", s));
    }

    // Fractional values are kept so that probe intervals like 0.2s survive.
    let seconds = match unit {
        "ms" => num / 1_000.0,
        "s" => num,
        "m" => num * 60.0,
        _ => return Err(format!("Invalid duration unit: {}", unit)),
    };

    Duration::try_from_secs_f64(seconds).map_err(|e| format!("Duration {} is out of range: {}", s, e))
}

fn parse_dimension(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("Invalid dimension '{}': expected key=value", s))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("Invalid dimension '{}': empty key", s));
    }
    Ok((key.to_string(), value.trim().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("5s").unwrap(), Duration::from_secs(5));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("20").unwrap(), Duration::from_secs(20));
        assert_eq!(parse_duration("0.2s").unwrap(), Duration::from_millis(200));
        assert_eq!(parse_duration("0s").unwrap(), Duration::ZERO);
        assert!(parse_duration("").is_err());
        assert!(parse_duration("fast").is_err());
        assert!(parse_duration("-1s").is_err());
        assert!(parse_duration("1e30s").is_err());
        assert!(parse_duration("1e30m").is_err());
    }

    #[test]
    fn test_out_of_range_duration_is_a_usage_error() {
        let err = Args::try_parse_from(["vnet-bench", "--warmup", "1e30s"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::ValueValidation);

        let args = Args::try_parse_from(["vnet-bench", "--round-timeout", "3s"]).unwrap();
        assert_eq!(args.round_timeout, Some(Duration::from_secs(3)));
    }

    #[test]
    fn test_parse_dimension() {
        assert_eq!(
            parse_dimension("guest_kernel=linux-6.1").unwrap(),
            ("guest_kernel".to_string(), "linux-6.1".to_string())
        );
        assert_eq!(
            parse_dimension("tag=a=b").unwrap(),
            ("tag".to_string(), "a=b".to_string())
        );
        assert!(parse_dimension("novalue").is_err());
        assert!(parse_dimension("=x").is_err());
    }

    #[test]
    fn test_payload_length_tokens() {
        let p: PayloadLength = "128K".parse().unwrap();
        assert_eq!(p.to_string(), "128K");
        assert_eq!(p.bytes(), 128 * 1024);
        assert_eq!("1024K".parse::<PayloadLength>().unwrap().bytes(), 1024 * 1024);
        assert_eq!("1500".parse::<PayloadLength>().unwrap().bytes(), 1500);
        assert!("K".parse::<PayloadLength>().is_err());
        assert!("12X".parse::<PayloadLength>().is_err());
        assert!("0K".parse::<PayloadLength>().is_err());
        assert_eq!(serde_json::to_string(&p).unwrap(), "\"128K\"");
    }

    #[test]
    fn test_traffic_mode_directions() {
        assert_eq!(TrafficMode::G2h.directions(), vec![Direction::GuestToHost]);
        assert_eq!(TrafficMode::H2g.directions(), vec![Direction::HostToGuest]);
        assert_eq!(TrafficMode::Both.directions().len(), 2);
    }

    #[test]
    fn test_args_defaults() {
        let args = Args::try_parse_from(["vnet-bench"]).unwrap();
        assert_eq!(args.benchmark, BenchmarkKind::Throughput);
        assert_eq!(args.mode, TrafficMode::G2h);
        assert_eq!(args.base_port, 5000);
        assert_eq!(args.warmup, Duration::from_secs(5));
        assert_eq!(args.runtime, Duration::from_secs(20));
        assert_eq!(args.rounds, 15);
        assert_eq!(args.probes_per_round, 30);
        assert_eq!(args.probe_interval, Duration::ZERO);
        assert_eq!(args.payload_length.as_str(), "128K");
        assert!(args.timeout.is_none());
        assert!(args.dimensions.is_empty());
    }

    #[test]
    fn test_args_parse_full_command_line() {
        let args = Args::try_parse_from([
            "vnet-bench",
            "--benchmark",
            "throughput",
            "--mode",
            "both",
            "--vcpus",
            "2",
            "--payload-length",
            "1024K",
            "--timeout",
            "60s",
            "--guest-ssh",
            "root@192.168.0.2",
            "--dimension",
            "host_kernel=6.1",
            "--dimension",
            "cpu_model=test",
            "-vv",
        ])
        .unwrap();
        assert_eq!(args.mode, TrafficMode::Both);
        assert_eq!(args.vcpus, 2);
        assert_eq!(args.timeout, Some(Duration::from_secs(60)));
        assert_eq!(args.guest_ssh.as_deref(), Some("root@192.168.0.2"));
        assert_eq!(args.dimensions.len(), 2);
        assert_eq!(args.verbose, 2);

        assert!(Args::try_parse_from(["vnet-bench", "--mode", "bd"]).is_err());
        assert!(Args::try_parse_from(["vnet-bench", "--payload-length", "big"]).is_err());
    }
}
