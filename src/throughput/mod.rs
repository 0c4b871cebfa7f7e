//! # Throughput Orchestrator
//!
//! Runs parallel iperf3 client/server pairs between the host and the guest
//! and collects one structured result per client.
//!
//! ## Roles
//!
//! The receiving side of a direction runs the servers:
//!
//! - **g2h**: servers on the host bound to the host address, clients in the
//!   guest.
//! - **h2g**: servers in the guest bound to the guest address, clients on
//!   the host.
//!
//! ## Sub-run lifecycle
//!
//! For each exercised direction, in order:
//!
//! 1. Allocate one port per pair from a contiguous range.
//! 2. Start every server, wait for the startup delay, then check that none
//!    of them already exited.
//! 3. Start every client and await all of them concurrently.
//! 4. Kill and reap whatever is still running.
//!
//! Steps 1 to 3 share a single deadline. Missing it, or any client failing,
//! fails the whole direction; results are never partially salvaged.

pub mod fleet;
pub mod iperf3;
pub mod ports;

use crate::benchmark::BenchmarkConfig;
use crate::error::{BenchError, BenchResult};
use crate::exec::RemoteExecutor;
use fleet::{ProcessFleet, Role};
use ports::{ensure_disjoint, PortRange};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio::time::{sleep, timeout_at, Instant};
use tracing::{info, info_span, warn, Instrument};

pub use iperf3::ClientResult;

/// Direction of bulk transfer across the virtual NIC
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Direction {
    #[serde(rename = "g2h")]
    GuestToHost,
    #[serde(rename = "h2g")]
    HostToGuest,
}

impl Direction {
    /// Short label used for result keys and artifact names
    pub fn label(&self) -> &'static str {
        match self {
            Direction::GuestToHost => "g2h",
            Direction::HostToGuest => "h2g",
        }
    }

    /// Metric name of this direction's throughput series
    pub fn metric_name(&self) -> &'static str {
        match self {
            Direction::GuestToHost => "throughput_guest_to_host",
            Direction::HostToGuest => "throughput_host_to_guest",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Per-direction client results of one run.
///
/// Only exercised directions have an entry; each holds exactly one result
/// per client, ordered by client index.
#[derive(Debug, Clone, Default)]
pub struct RunResult {
    results: BTreeMap<Direction, Vec<ClientResult>>,
}

impl RunResult {
    pub fn get(&self, direction: Direction) -> Option<&[ClientResult]> {
        self.results.get(&direction).map(Vec::as_slice)
    }

    pub fn contains(&self, direction: Direction) -> bool {
        self.results.contains_key(&direction)
    }

    pub fn directions(&self) -> impl Iterator<Item = Direction> + '_ {
        self.results.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Direction, &[ClientResult])> {
        self.results.iter().map(|(d, r)| (*d, r.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub(crate) fn insert(&mut self, direction: Direction, clients: Vec<ClientResult>) {
        self.results.insert(direction, clients);
    }
}

/// Drives iperf3 fleets between a host and a guest
pub struct ThroughputBenchmark {
    host: Arc<dyn RemoteExecutor>,
    guest: Arc<dyn RemoteExecutor>,
}

impl ThroughputBenchmark {
    pub fn new(host: Arc<dyn RemoteExecutor>, guest: Arc<dyn RemoteExecutor>) -> Self {
        Self { host, guest }
    }

    /// Run every direction selected by `config.mode`, one after another.
    ///
    /// ## Returns
    /// - `Ok(RunResult)`: one entry per exercised direction
    /// - `Err(BenchError)`: the first direction that failed; nothing it
    ///   spawned is left running
    pub async fn run_throughput_benchmark(&self, config: &BenchmarkConfig) -> BenchResult<RunResult> {
        config.validate()?;

        let mut run = RunResult::default();
        for direction in config.mode.directions() {
            let span = info_span!("throughput", direction = %direction);
            let clients = self.run_direction(config, direction).instrument(span).await?;
            run.insert(direction, clients);
        }
        Ok(run)
    }

    /// `(receiver, sender)` executors of a direction
    fn roles(&self, direction: Direction) -> (&dyn RemoteExecutor, &dyn RemoteExecutor) {
        match direction {
            Direction::GuestToHost => (self.host.as_ref(), self.guest.as_ref()),
            Direction::HostToGuest => (self.guest.as_ref(), self.host.as_ref()),
        }
    }

    async fn run_direction(
        &self,
        config: &BenchmarkConfig,
        direction: Direction,
    ) -> BenchResult<Vec<ClientResult>> {
        let range = PortRange::allocate(config.base_port, config.num_clients)?;
        let ports: Vec<u16> = range.iter().collect();
        ensure_disjoint(&ports)?;

        info!(
            "Starting {} pairs on ports {}-{} ({} payload, {:?} warm-up, {:?} runtime)",
            ports.len(),
            range.base(),
            range.base() as usize + range.len() - 1,
            config.payload_length,
            config.warmup,
            config.runtime
        );

        let deadline = Instant::now() + config.timeout;
        let mut fleet = ProcessFleet::new(direction);
        let outcome = timeout_at(deadline, self.drive(&mut fleet, config, direction, &ports)).await;
        fleet.shutdown().await;

        match outcome {
            Ok(Ok(clients)) => {
                info!("Collected {} client results", clients.len());
                Ok(clients)
            }
            Ok(Err(e)) => {
                warn!("Sub-run failed: {}", e);
                Err(e)
            }
            Err(_) => {
                warn!("Deadline of {:?} expired; all processes stopped", config.timeout);
                Err(BenchError::BenchmarkTimeout {
                    direction,
                    timeout: config.timeout,
                })
            }
        }
    }

    async fn drive(
        &self,
        fleet: &mut ProcessFleet,
        config: &BenchmarkConfig,
        direction: Direction,
        ports: &[u16],
    ) -> BenchResult<Vec<ClientResult>> {
        let (receiver, sender) = self.roles(direction);

        for (index, &port) in ports.iter().enumerate() {
            let command = iperf3::server_command(config, direction, port, index);
            fleet.launch(receiver, Role::Server, index, port, &command)?;
        }

        sleep(config.server_startup_delay).await;
        fleet.check_servers()?;

        for (index, &port) in ports.iter().enumerate() {
            let command = iperf3::client_command(config, direction, port);
            fleet.launch(sender, Role::Client, index, port, &command)?;
        }

        fleet.collect_clients().await
    }
}
