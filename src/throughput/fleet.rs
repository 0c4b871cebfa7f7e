//! Ownership of the processes spawned for one direction.
//!
//! Every server and client of a sub-run lives in one [`ProcessFleet`].
//! `shutdown` kills and reaps whatever is still running and must be awaited
//! on every exit path; `Drop` only sends the kill.

use crate::error::{BenchError, BenchResult};
use crate::exec::{CommandOutput, OutputMode, RemoteExecutor};
use crate::throughput::iperf3::ClientResult;
use crate::throughput::Direction;
use futures::future::try_join_all;
use std::fmt;
use tokio::io::AsyncReadExt;
use tokio::process::Child;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

impl Role {
    /// Only client reports are read; server output is discarded
    fn output_mode(&self) -> OutputMode {
        match self {
            Role::Server => OutputMode::Discarded,
            Role::Client => OutputMode::Captured,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Server => write!(f, "server"),
            Role::Client => write!(f, "client"),
        }
    }
}

struct Member {
    role: Role,
    index: usize,
    port: u16,
    target: String,
    command_line: String,
    child: Child,
    reaped: bool,
}

impl Member {
    /// Wait for exit while draining both pipes
    async fn wait_for_output(&mut self) -> BenchResult<CommandOutput> {
        let mut stdout = self.child.stdout.take();
        let mut stderr = self.child.stderr.take();
        let mut out = Vec::new();
        let mut err = Vec::new();

        let (status, _, _) = tokio::try_join!(
            self.child.wait(),
            async {
                match stdout.as_mut() {
                    Some(pipe) => pipe.read_to_end(&mut out).await,
                    None => Ok(0),
                }
            },
            async {
                match stderr.as_mut() {
                    Some(pipe) => pipe.read_to_end(&mut err).await,
                    None => Ok(0),
                }
            },
        )?;
        self.reaped = true;

        Ok(CommandOutput {
            exit_code: status.code(),
            stdout: String::from_utf8_lossy(&out).into_owned(),
            stderr: String::from_utf8_lossy(&err).into_owned(),
        })
    }

    async fn collect_result(&mut self, direction: Direction) -> BenchResult<ClientResult> {
        let output = self.wait_for_output().await?;
        debug!(
            "{} {} on port {} finished ({})",
            self.role,
            self.index,
            self.port,
            output.status_label()
        );

        let parsed = ClientResult::from_json(direction, self.index, &output.stdout);
        if output.success() {
            return parsed;
        }
        match parsed {
            // iperf3 reports its own failures inside the JSON document
            Err(err @ BenchError::ClientResultMalformed { .. }) => Err(err),
            _ => Err(BenchError::RemoteCommandFailed {
                target: self.target.clone(),
                command: self.command_line.clone(),
                status: output.status_label(),
                stderr: output.stderr.trim().to_string(),
            }),
        }
    }
}

/// The servers and clients of one sub-run
pub struct ProcessFleet {
    direction: Direction,
    members: Vec<Member>,
}

impl ProcessFleet {
    pub fn new(direction: Direction) -> Self {
        Self {
            direction,
            members: Vec::new(),
        }
    }

    /// Spawn `command_line` through `executor` and take ownership of it
    pub fn launch(
        &mut self,
        executor: &dyn RemoteExecutor,
        role: Role,
        index: usize,
        port: u16,
        command_line: &str,
    ) -> BenchResult<()> {
        let child = executor.spawn(command_line, role.output_mode())?;
        debug!(
            "Launched {} {} on {} (port {}, pid {:?})",
            role,
            index,
            executor.target(),
            port,
            child.id()
        );
        self.members.push(Member {
            role,
            index,
            port,
            target: executor.target().to_string(),
            command_line: command_line.to_string(),
            child,
            reaped: false,
        });
        Ok(())
    }

    /// Fail if any server has already terminated
    pub fn check_servers(&mut self) -> BenchResult<()> {
        for member in self.members.iter_mut().filter(|m| m.role == Role::Server) {
            if let Some(status) = member.child.try_wait()? {
                member.reaped = true;
                return Err(BenchError::ServerExited {
                    direction: self.direction,
                    port: member.port,
                    status: status.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Await every client concurrently and parse its report.
    ///
    /// Results come back in launch order. The first failing client aborts
    /// the wait; the remaining processes are left for [`Self::shutdown`].
    pub async fn collect_clients(&mut self) -> BenchResult<Vec<ClientResult>> {
        let direction = self.direction;
        let pending = self
            .members
            .iter_mut()
            .filter(|m| m.role == Role::Client)
            .map(|m| m.collect_result(direction));
        try_join_all(pending).await
    }

    /// Kill and reap every process that is still running
    pub async fn shutdown(&mut self) {
        debug!(
            "Shutting down {} fleet of {} processes",
            self.direction,
            self.members.len()
        );
        for member in self.members.iter_mut().filter(|m| !m.reaped) {
            match member.child.try_wait() {
                Ok(Some(_)) => {}
                Ok(None) => {
                    if let Err(e) = member.child.start_kill() {
                        warn!("Failed to kill {} {}: {}", member.role, member.index, e);
                    }
                    if let Err(e) = member.child.wait().await {
                        warn!("Failed to reap {} {}: {}", member.role, member.index, e);
                    }
                    debug!("Stopped {} {} on port {}", member.role, member.index, member.port);
                }
                Err(e) => warn!("Failed to poll {} {}: {}", member.role, member.index, e),
            }
            member.reaped = true;
        }
    }
}

impl Drop for ProcessFleet {
    fn drop(&mut self) {
        for member in self.members.iter_mut().filter(|m| !m.reaped) {
            let _ = member.child.start_kill();
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::exec::LocalShell;

    #[tokio::test]
    async fn test_exited_server_is_detected() {
        let shell = LocalShell::new("host");
        let mut fleet = ProcessFleet::new(Direction::GuestToHost);
        fleet.launch(&shell, Role::Server, 0, 5000, "sleep 30").unwrap();
        fleet.launch(&shell, Role::Server, 1, 5001, "false").unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;

        let err = fleet.check_servers().unwrap_err();
        assert!(matches!(err, BenchError::ServerExited { port: 5001, .. }));
        fleet.shutdown().await;
        assert!(fleet.members.iter().all(|m| m.reaped));
    }

    #[tokio::test]
    async fn test_client_failure_without_report() {
        let shell = LocalShell::new("guest");
        let mut fleet = ProcessFleet::new(Direction::GuestToHost);
        fleet
            .launch(&shell, Role::Client, 0, 5000, "sh -c 'echo refused >&2; exit 1'")
            .unwrap();

        let err = fleet.collect_clients().await.unwrap_err();
        match err {
            BenchError::RemoteCommandFailed { target, stderr, .. } => {
                assert_eq!(target, "guest");
                assert_eq!(stderr, "refused");
            }
            other => panic!("unexpected error: {other}"),
        }
        fleet.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_kills_survivors() {
        let shell = LocalShell::new("host");
        let mut fleet = ProcessFleet::new(Direction::HostToGuest);
        fleet.launch(&shell, Role::Server, 0, 5000, "sleep 30").unwrap();
        fleet.launch(&shell, Role::Client, 0, 5000, "sleep 30").unwrap();
        assert_eq!(fleet.members.len(), 2);

        let started = std::time::Instant::now();
        fleet.shutdown().await;
        assert!(started.elapsed() < std::time::Duration::from_secs(5));
        assert!(fleet.members.iter_mut().all(|m| matches!(m.child.try_wait(), Ok(Some(_)) | Err(_))));
    }

    #[tokio::test]
    async fn test_chatty_server_is_not_blocked_on_output() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("written");
        let shell = LocalShell::new("host");
        let mut fleet = ProcessFleet::new(Direction::GuestToHost);
        // Far more than a pipe buffer holds
        let command = format!(
            "sh -c 'head -c 4194304 /dev/zero; head -c 4194304 /dev/zero >&2; touch \"{}\"; sleep 30'",
            marker.display()
        );
        fleet.launch(&shell, Role::Server, 0, 5000, &command).unwrap();

        let started = std::time::Instant::now();
        while !marker.exists() && started.elapsed() < std::time::Duration::from_secs(5) {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert!(marker.exists(), "server blocked writing its output");
        fleet.check_servers().unwrap();
        fleet.shutdown().await;
    }
}
