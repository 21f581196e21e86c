//! Command execution seam for the netfilter adapter
//!
//! The kernel control planes (iptables, ip6tables, ipset, ip) are driven
//! through their userland binaries, behind the [`CommandRunner`] trait so
//! the adapter can be exercised in tests without CAP_NET_ADMIN.

use std::process::Stdio;

use async_trait::async_trait;
use tracing::trace;

use crate::error::NetfilterError;

/// Captured result of a control command
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// Process exit status (`-1` if terminated by signal)
    pub status: i32,
    /// Captured standard output
    pub stdout: String,
    /// Captured standard error
    pub stderr: String,
}

impl CommandOutput {
    /// Successful empty output
    #[must_use]
    pub fn ok() -> Self {
        Self {
            status: 0,
            stdout: String::new(),
            stderr: String::new(),
        }
    }

    /// Successful output with the given stdout
    #[must_use]
    pub fn with_stdout(stdout: impl Into<String>) -> Self {
        Self {
            status: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Failed output with the given status and stderr
    #[must_use]
    pub fn failed(status: i32, stderr: impl Into<String>) -> Self {
        Self {
            status,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    /// Whether the command exited with status zero
    #[must_use]
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// Executes a control-plane command and captures its output
///
/// Implementations must be safe to call concurrently; the kernel control
/// planes serialize state changes internally.
#[async_trait]
pub trait CommandRunner: Send + Sync + std::fmt::Debug {
    /// Run `program` with `args` to completion
    ///
    /// A non-zero exit status is NOT an error at this level; callers
    /// inspect [`CommandOutput::status`] because several commands use
    /// non-zero to report "not present".
    async fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput, NetfilterError>;
}

/// Runner that spawns the real control binaries
#[derive(Debug, Default)]
pub struct SystemCommandRunner;

impl SystemCommandRunner {
    /// Create a new system runner
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandRunner for SystemCommandRunner {
    async fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput, NetfilterError> {
        trace!(program, args = args.join(" "), "running control command");

        let output = tokio::process::Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| NetfilterError::Spawn {
                program: program.to_string(),
                source: e,
            })?;

        Ok(CommandOutput {
            status: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Recording runner for tests
///
/// Records every invocation as a single `program arg arg...` line and
/// answers from a list of stubbed prefix rules; unmatched commands
/// succeed with empty output.
#[derive(Debug, Default)]
pub struct RecordingRunner {
    calls: parking_lot::Mutex<Vec<String>>,
    stubs: parking_lot::Mutex<Vec<(String, CommandOutput)>>,
}

impl RecordingRunner {
    /// Create a runner with no stubs
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer commands starting with `prefix` with `output`
    ///
    /// Earlier stubs win when several prefixes match.
    pub fn stub(&self, prefix: impl Into<String>, output: CommandOutput) {
        self.stubs.lock().push((prefix.into(), output));
    }

    /// All commands run so far, in order
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    /// Commands run so far that start with `prefix`
    #[must_use]
    pub fn calls_matching(&self, prefix: &str) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .cloned()
            .collect()
    }

    /// Forget recorded calls (stubs are kept)
    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }
}

#[async_trait]
impl CommandRunner for RecordingRunner {
    async fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput, NetfilterError> {
        let line = if args.is_empty() {
            program.to_string()
        } else {
            format!("{} {}", program, args.join(" "))
        };
        self.calls.lock().push(line.clone());

        let stubs = self.stubs.lock();
        for (prefix, output) in stubs.iter() {
            if line.starts_with(prefix.as_str()) {
                return Ok(output.clone());
            }
        }
        Ok(CommandOutput::ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_recording_runner_records_calls() {
        let runner = RecordingRunner::new();
        runner.run("iptables", &["-t", "nat", "-L"]).await.unwrap();
        runner.run("ipset", &["list"]).await.unwrap();

        assert_eq!(runner.calls(), vec!["iptables -t nat -L", "ipset list"]);
        assert_eq!(runner.calls_matching("ipset"), vec!["ipset list"]);
    }

    #[tokio::test]
    async fn test_recording_runner_stub_order() {
        let runner = RecordingRunner::new();
        runner.stub("iptables -C", CommandOutput::failed(1, "no rule"));
        runner.stub("iptables", CommandOutput::failed(2, "generic"));

        let out = runner.run("iptables", &["-C", "PREROUTING"]).await.unwrap();
        assert_eq!(out.status, 1);

        let out = runner.run("iptables", &["-A", "PREROUTING"]).await.unwrap();
        assert_eq!(out.status, 2);

        let out = runner.run("ipset", &["list"]).await.unwrap();
        assert!(out.success());
    }

    #[tokio::test]
    async fn test_system_runner_missing_binary() {
        let runner = SystemCommandRunner::new();
        let err = runner
            .run("magitrickle-test-no-such-binary", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, NetfilterError::Spawn { .. }));
    }
}
