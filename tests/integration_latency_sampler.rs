#![cfg(unix)]

use anyhow::Result;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::process::Command;
use vnet_bench::{
    exec::CommandLifetime, latency::PING_LATENCY_METRIC, BenchError, BenchmarkRunner,
    LatencyConfig, LatencySampler, LocalShell, RemoteExecutor,
};

/// Answers every command with canned `ping` output printed by a real shell,
/// so the default `run`/`execute` path is exercised end to end.
struct CannedPing {
    output: String,
    exit_code: i32,
    commands: Mutex<Vec<String>>,
}

impl CannedPing {
    fn new(output: &str, exit_code: i32) -> Arc<Self> {
        Arc::new(Self {
            output: output.to_string(),
            exit_code,
            commands: Mutex::new(Vec::new()),
        })
    }
}

impl RemoteExecutor for CannedPing {
    fn target(&self) -> &str {
        "guest"
    }

    fn command(&self, command_line: &str, _lifetime: CommandLifetime) -> Command {
        self.commands.lock().unwrap().push(command_line.to_string());
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(format!("printf '%s' \"$0\"; exit {}", self.exit_code))
            .arg(&self.output);
        cmd
    }
}

const PING_OUTPUT: &str = "\
PING 172.16.0.1 (172.16.0.1) 56(84) bytes of data.
64 bytes from 172.16.0.1: icmp_seq=1 ttl=64 time=0.412 ms
64 bytes from 172.16.0.1: icmp_seq=2 ttl=64 time=0.198 ms
64 bytes from 172.16.0.1: icmp_seq=3 ttl=64 time=0.205 ms

--- 172.16.0.1 ping statistics ---
3 packets transmitted, 3 received, 0% packet loss, time 2ms
rtt min/avg/max/mdev = 0.198/0.271/0.412/0.099 ms
";

/// Samples come back in round order and every round issues the same probe.
#[tokio::test]
async fn sampler_collects_every_round() -> Result<()> {
    let executor = CannedPing::new(PING_OUTPUT, 0);
    let sampler = LatencySampler::new(executor.clone());

    let samples = sampler
        .sample_latency("172.16.0.1", 3, 3, Duration::ZERO)
        .await?;

    assert_eq!(samples.len(), 9);
    assert_eq!(&samples[..3], &[0.412, 0.198, 0.205]);
    assert_eq!(&samples[6..], &[0.412, 0.198, 0.205]);

    let commands = executor.commands.lock().unwrap();
    assert_eq!(commands.len(), 3);
    assert!(commands.iter().all(|c| c == "ping -c 3 -i 0 172.16.0.1"));
    Ok(())
}

/// A failing probe command aborts the measurement.
#[tokio::test]
async fn failed_round_aborts_sampling() -> Result<()> {
    let executor = CannedPing::new("ping: connect: Network is unreachable", 2);
    let sampler = LatencySampler::new(executor);

    let err = sampler
        .sample_latency("172.16.0.1", 2, 3, Duration::ZERO)
        .await
        .unwrap_err();

    assert!(matches!(err, BenchError::RemoteCommandFailed { .. }));
    Ok(())
}

/// A round that never finishes is killed once its deadline passes.
#[tokio::test]
async fn hung_ping_round_is_killed_at_its_deadline() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let pid_file = dir.path().join("pid");
    let executor = Arc::new(SleepingPing {
        pid_file: pid_file.clone(),
    });
    let sampler = LatencySampler::new(executor).with_round_timeout(Duration::from_millis(300));

    let started = std::time::Instant::now();
    let err = sampler
        .sample_latency("172.16.0.1", 2, 3, Duration::ZERO)
        .await
        .unwrap_err();

    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(matches!(err, BenchError::ProbeTimeout { round: 1, .. }));

    let pid = std::fs::read_to_string(&pid_file)?;
    let pid = pid.trim();
    for _ in 0..50 {
        if !is_running(pid) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(!is_running(pid), "ping {} still alive", pid);
    Ok(())
}

/// Whether `pid` exists and is neither a zombie nor dead
fn is_running(pid: &str) -> bool {
    match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
        Ok(stat) => stat
            .rsplit_once(") ")
            .map_or(false, |(_, rest)| !rest.starts_with('Z') && !rest.starts_with('X')),
        Err(_) => false,
    }
}

/// Runs a shell that records its pid and never answers
struct SleepingPing {
    pid_file: std::path::PathBuf,
}

impl RemoteExecutor for SleepingPing {
    fn target(&self) -> &str {
        "guest"
    }

    fn command(&self, _command_line: &str, _lifetime: CommandLifetime) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg("echo $$ > \"$0\"; exec sleep 30")
            .arg(&self.pid_file);
        cmd
    }
}

/// The runner tags latency samples with the run's dimensions and summarizes
/// them.
#[tokio::test]
async fn runner_summarizes_latency() -> Result<()> {
    let guest = CannedPing::new(PING_OUTPUT, 0);
    let host = Arc::new(LocalShell::new("host"));
    let runner = BenchmarkRunner::new(host, guest)
        .with_dimensions([("guest_kernel", "6.1")].into_iter().collect());

    let mut config = LatencyConfig::new("172.16.0.1");
    config.rounds = 2;
    config.probes_per_round = 3;

    let outcome = runner.run_latency(&config, 1).await?;

    assert_eq!(outcome.metrics.series(PING_LATENCY_METRIC).count(), 6);
    assert!(outcome.metrics.observations().iter().all(|o| {
        o.dimensions.get("performance_test") == Some("test_network_latency")
            && o.dimensions.get("guest_kernel") == Some("6.1")
            && o.dimensions.get("vcpus") == Some("1")
    }));

    let summary = &outcome.summaries[0];
    assert_eq!(summary.count, 6);
    assert_eq!(summary.min, 0.198);
    assert_eq!(summary.max, 0.412);
    assert!(outcome.run.is_none());
    Ok(())
}
