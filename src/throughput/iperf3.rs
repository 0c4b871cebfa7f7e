//! iperf3 command lines and `--json` report parsing

use crate::benchmark::BenchmarkConfig;
use crate::error::{BenchError, BenchResult};
use crate::throughput::Direction;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use std::time::Duration;

/// Tolerance when comparing interval boundaries against the warm-up period
const INTERVAL_EPSILON: f64 = 1e-3;

/// Chained builder for an iperf3 invocation
#[derive(Debug, Clone)]
pub struct Iperf3Command {
    args: Vec<String>,
}

impl Iperf3Command {
    pub fn new(binary: &str) -> Self {
        Self {
            args: vec![binary.to_string()],
        }
    }

    pub fn flag(mut self, flag: &str) -> Self {
        self.args.push(flag.to_string());
        self
    }

    pub fn arg(mut self, flag: &str, value: impl ToString) -> Self {
        self.args.push(flag.to_string());
        self.args.push(value.to_string());
        self
    }

    pub fn arg_opt<T: ToString>(self, flag: &str, value: Option<T>) -> Self {
        match value {
            Some(value) => self.arg(flag, value),
            None => self,
        }
    }

    pub fn build(self) -> String {
        self.args.join(" ")
    }
}

/// Server of pair `index`: serves exactly one client, then exits
pub fn server_command(
    config: &BenchmarkConfig,
    direction: Direction,
    port: u16,
    index: usize,
) -> String {
    Iperf3Command::new(&config.iperf3)
        .flag("--server")
        .flag("--one-off")
        .arg("--bind", config.receiver_address(direction))
        .arg("--port", port)
        .arg_opt("--affinity", config.server_affinity.map(|base| base + index))
        .build()
}

/// Client of one pair: reports in JSON and transmits for warm-up plus
/// runtime.
///
/// iperf3 runs the `--omit` window before the `--time` window, so `--time`
/// carries the runtime alone.
pub fn client_command(config: &BenchmarkConfig, direction: Direction, port: u16) -> String {
    Iperf3Command::new(&config.iperf3)
        .arg("--client", config.receiver_address(direction))
        .arg("--port", port)
        .arg("--time", config.runtime.as_secs())
        .arg("--omit", config.warmup.as_secs())
        .arg("--len", &config.payload_length)
        .flag("--json")
        .build()
}

/// Summed counters of one reporting interval
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct IntervalSum {
    pub start: f64,
    pub end: f64,
    #[serde(default)]
    pub seconds: f64,
    #[serde(default)]
    pub bytes: f64,
    pub bits_per_second: f64,
    /// Set by iperf3 for intervals inside the `--omit` window
    #[serde(default)]
    pub omitted: bool,
}

#[derive(Debug, Deserialize)]
struct Interval {
    sum: IntervalSum,
}

/// Structured outcome of one client/server pair.
///
/// Keeps the client's report verbatim for persistence next to the typed
/// interval view used for aggregation.
#[derive(Debug, Clone)]
pub struct ClientResult {
    direction: Direction,
    client_index: usize,
    raw: Value,
    intervals: Vec<IntervalSum>,
}

impl ClientResult {
    /// Parse the stdout of `iperf3 --json`.
    ///
    /// Lines printed ahead of the document and text after it are ignored;
    /// a forced tty mixes iperf3's stderr into the same stream. Empty output is [`BenchError::ClientResultMissing`]. Output that is not
    /// JSON, carries an iperf3 `error` field, or has no intervals is
    /// [`BenchError::ClientResultMalformed`].
    pub fn from_json(direction: Direction, client_index: usize, stdout: &str) -> BenchResult<Self> {
        let stdout = stdout.trim();
        if stdout.is_empty() {
            return Err(BenchError::ClientResultMissing {
                direction,
                client_index,
            });
        }

        let malformed = |reason: String| BenchError::ClientResultMalformed {
            direction,
            client_index,
            reason,
        };

        let raw = first_document(stdout).map_err(|e| malformed(format!("invalid JSON: {}", e)))?;

        if let Some(error) = raw.get("error").and_then(Value::as_str) {
            return Err(malformed(error.to_string()));
        }

        let intervals = raw
            .get("intervals")
            .ok_or_else(|| malformed("report has no `intervals`".to_string()))?;
        let intervals: Vec<Interval> = Vec::deserialize(intervals)
            .map_err(|e| malformed(format!("unexpected interval layout: {}", e)))?;
        if intervals.is_empty() {
            return Err(malformed("report has no intervals".to_string()));
        }

        Ok(Self {
            direction,
            client_index,
            raw,
            intervals: intervals.into_iter().map(|i| i.sum).collect(),
        })
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn client_index(&self) -> usize {
        self.client_index
    }

    /// The report exactly as the client printed it
    pub fn raw(&self) -> &Value {
        &self.raw
    }

    pub fn intervals(&self) -> &[IntervalSum] {
        &self.intervals
    }

    /// Intervals measured after the warm-up period.
    ///
    /// Intervals flagged `omitted` are dropped. Reports without any flagged
    /// interval are timed from the start of the warm-up, so intervals
    /// ending inside it are dropped instead.
    pub fn steady_state(&self, warmup: Duration) -> Vec<IntervalSum> {
        if self.intervals.iter().any(|i| i.omitted) {
            return self.intervals.iter().filter(|i| !i.omitted).copied().collect();
        }
        let warmup = warmup.as_secs_f64();
        self.intervals
            .iter()
            .filter(|i| i.end > warmup + INTERVAL_EPSILON)
            .copied()
            .collect()
    }

    pub fn steady_state_bits_per_second(&self, warmup: Duration) -> Vec<f64> {
        self.steady_state(warmup)
            .iter()
            .map(|i| i.bits_per_second)
            .collect()
    }

    /// Mean steady-state throughput in bits per second
    pub fn mean_bits_per_second(&self, warmup: Duration) -> Option<f64> {
        let series = self.steady_state_bits_per_second(warmup);
        if series.is_empty() {
            return None;
        }
        Some(series.iter().sum::<f64>() / series.len() as f64)
    }
}

/// First JSON document of `output`, starting at the first line that opens
/// an object
fn first_document(output: &str) -> serde_json::Result<Value> {
    let mut start = 0;
    let mut offset = 0;
    for line in output.split_inclusive('\n') {
        let trimmed = line.trim_start();
        if trimmed.starts_with('{') {
            start = offset + line.len() - trimmed.len();
            break;
        }
        offset += line.len();
    }

    let mut documents = serde_json::Deserializer::from_str(&output[start..]).into_iter::<Value>();
    match documents.next() {
        Some(document) => document,
        None => serde_json::from_str::<Value>(""),
    }
}

impl Serialize for ClientResult {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.raw.serialize(serializer)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::cli::TrafficMode;
    use serde_json::json;

    /// Minimal iperf3 `--json` report with one interval per throughput value
    pub(crate) fn report(omit: usize, bits_per_second: &[f64]) -> String {
        let intervals: Vec<Value> = bits_per_second
            .iter()
            .enumerate()
            .map(|(i, bps)| {
                json!({
                    "streams": [],
                    "sum": {
                        "start": i as f64,
                        "end": (i + 1) as f64,
                        "seconds": 1.0,
                        "bytes": bps / 8.0,
                        "bits_per_second": bps,
                        "omitted": i < omit,
                    }
                })
            })
            .collect();
        json!({
            "start": { "test_start": { "protocol": "TCP", "omit": omit } },
            "intervals": intervals,
            "end": { "sum_sent": { "bits_per_second": 1.0 } }
        })
        .to_string()
    }

    fn config() -> BenchmarkConfig {
        BenchmarkConfig::new(TrafficMode::G2h, "128K".parse().unwrap(), 2, "10.0.0.1", "10.0.0.2")
    }

    #[test]
    fn test_server_command() {
        let mut config = config();
        assert_eq!(
            server_command(&config, Direction::GuestToHost, 5001, 1),
            "iperf3 --server --one-off --bind 10.0.0.1 --port 5001"
        );

        config.server_affinity = Some(2);
        assert_eq!(
            server_command(&config, Direction::HostToGuest, 5001, 1),
            "iperf3 --server --one-off --bind 10.0.0.2 --port 5001 --affinity 3"
        );
    }

    #[test]
    fn test_client_command() {
        let config = config();
        assert_eq!(
            client_command(&config, Direction::GuestToHost, 5000),
            "iperf3 --client 10.0.0.1 --port 5000 --time 20 --omit 5 --len 128K --json"
        );
    }

    /// Value following `flag` in a command line
    fn flag_value(command: &str, flag: &str) -> u64 {
        let mut words = command.split_whitespace();
        words.find(|w| *w == flag);
        words.next().unwrap().parse().unwrap()
    }

    #[test]
    fn test_client_transmit_time_fits_deadline() {
        let mut config = config();
        config.warmup = Duration::from_secs(5);
        config.runtime = Duration::from_secs(20);
        config.num_clients = 1;
        config.timeout = config.minimum_timeout() + Duration::from_millis(1);
        config.validate().unwrap();

        // iperf3 transmits for omit + time seconds
        let command = client_command(&config, Direction::GuestToHost, 5000);
        let transmit = flag_value(&command, "--omit") + flag_value(&command, "--time");
        assert_eq!(transmit, 25);
        assert!(
            Duration::from_secs(transmit) + config.server_startup_delay < config.timeout,
            "clients outlive the deadline"
        );
    }

    #[test]
    fn test_report_behind_tty_noise() {
        let stdout = format!(
            "warning: block size 131072 exceeds socket buffer\r\n{}\r\niperf3: interrupt - the client has terminated\r\n",
            report(1, &[1e9, 2e9])
        );
        let result = ClientResult::from_json(Direction::GuestToHost, 0, &stdout).unwrap();
        assert_eq!(result.intervals().len(), 2);
        assert_eq!(result.raw()["start"]["test_start"]["omit"], 1);

        let err = ClientResult::from_json(Direction::GuestToHost, 0, "iperf3: no json here").unwrap_err();
        assert!(err.to_string().contains("invalid JSON"));
    }

    #[test]
    fn test_parse_report_and_drop_omitted_intervals() {
        let stdout = report(2, &[1e9, 2e9, 3e9, 4e9]);
        let result = ClientResult::from_json(Direction::GuestToHost, 0, &stdout).unwrap();
        assert_eq!(result.intervals().len(), 4);
        assert_eq!(
            result.steady_state_bits_per_second(Duration::from_secs(2)),
            vec![3e9, 4e9]
        );
        assert_eq!(result.mean_bits_per_second(Duration::from_secs(2)), Some(3.5e9));
        assert_eq!(result.raw()["start"]["test_start"]["omit"], 2);
    }

    #[test]
    fn test_unflagged_report_drops_warmup_by_time() {
        let stdout = report(0, &[1e9, 2e9, 3e9]);
        let result = ClientResult::from_json(Direction::HostToGuest, 1, &stdout).unwrap();
        assert_eq!(
            result.steady_state_bits_per_second(Duration::from_secs(1)),
            vec![2e9, 3e9]
        );
        assert_eq!(
            result.steady_state_bits_per_second(Duration::ZERO),
            vec![1e9, 2e9, 3e9]
        );
    }

    #[test]
    fn test_empty_output_is_missing() {
        let err = ClientResult::from_json(Direction::GuestToHost, 3, "  \n").unwrap_err();
        assert!(matches!(
            err,
            BenchError::ClientResultMissing {
                client_index: 3,
                ..
            }
        ));
    }

    #[test]
    fn test_malformed_reports() {
        let err = ClientResult::from_json(Direction::GuestToHost, 0, "not json").unwrap_err();
        assert!(err.to_string().contains("invalid JSON"));

        let stdout = json!({ "start": {}, "intervals": [], "end": {},
            "error": "unable to connect to server: Connection refused" })
        .to_string();
        let err = ClientResult::from_json(Direction::GuestToHost, 1, &stdout).unwrap_err();
        assert_eq!(
            err.to_string(),
            "g2h client 1 produced a malformed result: unable to connect to server: Connection refused"
        );

        let stdout = json!({ "intervals": [] }).to_string();
        assert!(ClientResult::from_json(Direction::GuestToHost, 0, &stdout).is_err());
    }

    #[test]
    fn test_serializes_as_raw_report() {
        let stdout = report(0, &[5e8]);
        let result = ClientResult::from_json(Direction::GuestToHost, 0, &stdout).unwrap();
        let round: Value = serde_json::from_str(&serde_json::to_string(&result).unwrap()).unwrap();
        assert_eq!(&round, result.raw());
    }
}
