//! # Remote Execution Port
//!
//! Every command the benchmarks issue, on the host or inside the guest, goes
//! through a [`RemoteExecutor`]. An executor only knows how to turn a command
//! line into a [`tokio::process::Command`]; running it, checking the exit
//! status and supervising long-lived processes are shared provided methods.
//!
//! Two executors ship with the crate:
//!
//! - [`LocalShell`]: `sh -c` on this machine, optionally inside a network
//!   namespace (`ip netns exec <ns>`), which is how the host side of a guest's
//!   tap device is usually reached.
//! - [`SshExecutor`]: the system `ssh` client against a remote machine,
//!   normally the guest.

use crate::error::{BenchError, BenchResult};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::debug;

/// How long a command is expected to live
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandLifetime {
    /// Runs to completion while the caller waits for its output
    OneShot,
    /// Spawned and later killed by the caller; the process behind the handle
    /// must be the command itself so that killing the handle stops it
    Supervised,
}

/// What happens to the stdout and stderr of a spawned process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Piped back to the caller, who must drain both pipes
    Captured,
    /// Sent to `/dev/null`; for processes nobody reads from
    Discarded,
}

/// Captured result of a finished command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` when the process was terminated by a signal
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Human-readable exit status for error messages
    pub fn status_label(&self) -> String {
        match self.exit_code {
            Some(code) => format!("exit status {}", code),
            None => "terminated by signal".to_string(),
        }
    }

    /// Turn a non-zero exit into [`BenchError::RemoteCommandFailed`]
    pub fn check(self, target: &str, command_line: &str) -> BenchResult<Self> {
        if self.success() {
            return Ok(self);
        }
        Err(BenchError::RemoteCommandFailed {
            target: target.to_string(),
            command: command_line.to_string(),
            status: self.status_label(),
            stderr: self.stderr.trim().to_string(),
        })
    }
}

impl From<std::process::Output> for CommandOutput {
    fn from(output: std::process::Output) -> Self {
        Self {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        }
    }
}

/// A machine that benchmark commands can be issued to
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Short label of the machine ("host", "guest") used in logs and errors
    fn target(&self) -> &str;

    /// Build the local process that carries `command_line` to the target
    fn command(&self, command_line: &str, lifetime: CommandLifetime) -> Command;

    /// Run a command to completion and capture its output, whatever its
    /// exit status
    async fn run(&self, command_line: &str) -> BenchResult<CommandOutput> {
        debug!(target_machine = self.target(), "Running `{}`", command_line);
        let mut cmd = self.command(command_line, CommandLifetime::OneShot);
        cmd.stdin(Stdio::null()).kill_on_drop(true);
        let output = cmd.output().await.map_err(|source| BenchError::Spawn {
            target: self.target().to_string(),
            command: command_line.to_string(),
            source,
        })?;
        Ok(CommandOutput::from(output))
    }

    /// Run a command to completion; a non-zero exit is a hard failure
    async fn execute(&self, command_line: &str) -> BenchResult<CommandOutput> {
        let output = self.run(command_line).await?;
        output.check(self.target(), command_line)
    }

    /// Start a supervised process.
    ///
    /// With [`OutputMode::Captured`] both streams are piped and have to be
    /// read, or the process stalls once a pipe fills up. The child is killed
    /// if its handle is dropped.
    fn spawn(&self, command_line: &str, output: OutputMode) -> BenchResult<Child> {
        debug!(target_machine = self.target(), "Spawning `{}`", command_line);
        let mut cmd = self.command(command_line, CommandLifetime::Supervised);
        let stream = || match output {
            OutputMode::Captured => Stdio::piped(),
            OutputMode::Discarded => Stdio::null(),
        };
        cmd.stdin(Stdio::null())
            .stdout(stream())
            .stderr(stream())
            .kill_on_drop(true);
        cmd.spawn().map_err(|source| BenchError::Spawn {
            target: self.target().to_string(),
            command: command_line.to_string(),
            source,
        })
    }
}

/// Wrap a command line so the shell replaces itself with the command
fn exec_line(command_line: &str, lifetime: CommandLifetime) -> String {
    match lifetime {
        CommandLifetime::OneShot => command_line.to_string(),
        CommandLifetime::Supervised => format!("exec {}", command_line),
    }
}

/// Executes commands with `sh -c` on the local machine
#[derive(Debug, Clone)]
pub struct LocalShell {
    label: String,
    netns: Option<String>,
}

impl LocalShell {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            netns: None,
        }
    }

    /// Run every command inside the given network namespace
    pub fn in_netns(mut self, netns: impl Into<String>) -> Self {
        self.netns = Some(netns.into());
        self
    }
}

impl RemoteExecutor for LocalShell {
    fn target(&self) -> &str {
        &self.label
    }

    fn command(&self, command_line: &str, lifetime: CommandLifetime) -> Command {
        let line = exec_line(command_line, lifetime);
        match &self.netns {
            Some(netns) => {
                let mut cmd = Command::new("ip");
                cmd.args(["netns", "exec", netns.as_str(), "sh", "-c", line.as_str()]);
                cmd
            }
            None => {
                let mut cmd = Command::new("sh");
                cmd.arg("-c").arg(line);
                cmd
            }
        }
    }
}

/// Executes commands on a remote machine through the system `ssh` client
#[derive(Debug, Clone)]
pub struct SshExecutor {
    label: String,
    destination: String,
    port: Option<u16>,
    identity_file: Option<PathBuf>,
    connect_timeout: Duration,
}

impl SshExecutor {
    /// `destination` is anything `ssh` accepts, usually `user@address`
    pub fn new(label: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            destination: destination.into(),
            port: None,
            identity_file: None,
            connect_timeout: crate::defaults::SSH_CONNECT_TIMEOUT,
        }
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn identity_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.identity_file = Some(path.into());
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

impl RemoteExecutor for SshExecutor {
    fn target(&self) -> &str {
        &self.label
    }

    fn command(&self, command_line: &str, lifetime: CommandLifetime) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.args([
            "-q",
            "-o",
            "StrictHostKeyChecking=no",
            "-o",
            "UserKnownHostsFile=/dev/null",
            "-o",
            "BatchMode=yes",
        ]);
        cmd.arg("-o")
            .arg(format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)));
        if let Some(ref identity) = self.identity_file {
            cmd.arg("-i").arg(identity);
        }
        if let Some(port) = self.port {
            cmd.arg("-p").arg(port.to_string());
        }
        // A forced tty makes the remote process receive SIGHUP once the local
        // ssh process is killed.
        if lifetime == CommandLifetime::Supervised {
            cmd.arg("-tt");
        }
        cmd.arg(&self.destination).arg(exec_line(command_line, lifetime));
        cmd
    }
}
