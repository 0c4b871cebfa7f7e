//! Error taxonomy shared by the sampler, the orchestrator and the metrics
//! pipeline.
//!
//! Every variant aborts the enclosing benchmark call. Nothing in this crate
//! retries; re-running a failed configuration is the caller's decision.

use crate::throughput::Direction;
use std::time::Duration;
use thiserror::Error;

/// Errors produced by benchmark execution
#[derive(Debug, Error)]
pub enum BenchError {
    /// Probe output too short, without replies, or with an unparseable reply
    #[error("malformed probe output: {reason}")]
    ProbeOutputMalformed { reason: String },

    /// A throughput client exited without printing a report
    #[error("{direction} client {client_index} produced no result")]
    ClientResultMissing {
        direction: Direction,
        client_index: usize,
    },

    /// A throughput client printed something that is not a usable report
    #[error("{direction} client {client_index} produced a malformed result: {reason}")]
    ClientResultMalformed {
        direction: Direction,
        client_index: usize,
        reason: String,
    },

    /// The joint completion of all pairs of a direction missed its deadline
    #[error("{direction} benchmark did not complete within {timeout:?}")]
    BenchmarkTimeout {
        direction: Direction,
        timeout: Duration,
    },

    /// A probe round did not finish within its deadline
    #[error("probe round {round} on {target} did not complete within {timeout:?}")]
    ProbeTimeout {
        target: String,
        round: usize,
        timeout: Duration,
    },

    /// Two concurrent pairs were handed the same port
    #[error("port {port} was allocated to more than one client/server pair")]
    PortAllocationConflict { port: u16 },

    /// A server terminated before any client connected to it
    #[error("{direction} server on port {port} exited early ({status})")]
    ServerExited {
        direction: Direction,
        port: u16,
        status: String,
    },

    /// A command issued through an executor exited with a non-zero status
    #[error("command `{command}` on {target} failed ({status}): {stderr}")]
    RemoteCommandFailed {
        target: String,
        command: String,
        status: String,
        stderr: String,
    },

    /// The local process carrying a command could not be started
    #[error("failed to spawn `{command}` on {target}")]
    Spawn {
        target: String,
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// `put_metric` was called before the run's dimensions were set
    #[error("metric dimensions must be set before the first observation of a run")]
    DimensionsNotSet,
}

/// Result alias used across the library
pub type BenchResult<T> = std::result::Result<T, BenchError>;

impl BenchError {
    pub(crate) fn probe(reason: impl Into<String>) -> Self {
        Self::ProbeOutputMalformed {
            reason: reason.into(),
        }
    }

    /// Whether the error came from a deadline rather than from bad output
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::BenchmarkTimeout { .. } | Self::ProbeTimeout { .. }
        )
    }
}
