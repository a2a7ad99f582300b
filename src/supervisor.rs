//! Subprocess supervisor
//!
//! Runs one child process under a wall-clock deadline with output caps and
//! classifies the outcome into a fixed set of statuses. Every failure mode
//! of the child is captured as a value in `ProcessOutcome`; the supervisor
//! itself never escapes with an error.

use std::io::ErrorKind;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::ExitStatusExt;
use std::process::Stdio;
use std::time::Duration;

use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::time::{timeout, Instant};
use tracing::debug;

/// Signal number the kernel OOM killer terminates a process with, reported
/// through the negative return-code convention.
const OOM_SIGNAL: i32 = 9;

/// Grace period for picking up pipe residue after the child was killed.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(250);

/// Classified result of one supervised subprocess run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessStatus {
    /// Child exited with code 0
    Success,
    /// Child exited with a nonzero code that is not the OOM signal
    FailedReturnCode,
    /// Child was terminated by the kernel OOM killer
    FailedOutOfMemory,
    /// Deadline elapsed and the child was killed
    FailedTimeout,
    /// Spawn failed with a permissions error
    FailedNotExecutable,
    /// Any other spawn-time OS error
    FailedExecException,
}

impl ProcessStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, ProcessStatus::Success)
    }
}

/// One captured output stream: full pre-truncation byte count plus the
/// retained head of the data, base64 on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamCapture {
    pub length: usize,
    #[serde(serialize_with = "as_base64", deserialize_with = "from_base64")]
    pub data: Vec<u8>,
}

impl StreamCapture {
    fn new(mut data: Vec<u8>, cap_bytes: usize) -> Self {
        let length = data.len();
        data.truncate(cap_bytes);
        Self { length, data }
    }
}

fn as_base64<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&general_purpose::STANDARD.encode(data))
}

fn from_base64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
    let encoded = String::deserialize(deserializer)?;
    general_purpose::STANDARD
        .decode(encoded)
        .map_err(serde::de::Error::custom)
}

/// Outcome of one supervised run. Which optional fields are present depends
/// on `status`: capture fields exist once the child actually spawned,
/// `returncode` once it ran to completion, `perms` only on the
/// not-executable path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessOutcome {
    pub cmd: Vec<String>,
    pub runtime_limit_secs: f64,
    pub runtime_secs: f64,
    pub status: ProcessStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<StreamCapture>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<StreamCapture>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub returncode: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception_msg: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub perms: Option<String>,
}

impl ProcessOutcome {
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

/// Specification for one supervised run.
#[derive(Debug, Clone)]
pub struct ExecutionSpec {
    cmd: Vec<String>,
    runtime_limit_secs: f64,
    output_cap_bytes: usize,
}

impl ExecutionSpec {
    pub fn new(cmd: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            cmd: cmd.into_iter().map(Into::into).collect(),
            runtime_limit_secs: 30.0,
            output_cap_bytes: 1024 * 1024,
        }
    }

    pub fn with_deadline_secs(mut self, secs: f64) -> Self {
        self.runtime_limit_secs = secs;
        self
    }

    /// Single cap applied to both stdout and stderr.
    pub fn with_output_cap(mut self, bytes: usize) -> Self {
        self.output_cap_bytes = bytes;
        self
    }
}

/// Run the command described by `spec` to completion or deadline expiry.
/// The child is always reaped before this returns, on every path.
pub async fn execute_supervised(spec: &ExecutionSpec) -> ProcessOutcome {
    let start = Instant::now();

    if spec.cmd.is_empty() {
        return ProcessOutcome {
            cmd: Vec::new(),
            runtime_limit_secs: spec.runtime_limit_secs,
            runtime_secs: start.elapsed().as_secs_f64(),
            status: ProcessStatus::FailedExecException,
            stdout: None,
            stderr: None,
            returncode: None,
            exception_msg: Some("no command specified".to_string()),
            perms: None,
        };
    }

    debug!(
        "Supervising {:?} with deadline {:.1}s",
        spec.cmd, spec.runtime_limit_secs
    );

    let mut command = Command::new(&spec.cmd[0]);
    command
        .args(&spec.cmd[1..])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(err) => return spawn_failure(spec, start.elapsed().as_secs_f64(), &err),
    };

    let mut stdout_pipe = child.stdout.take();
    let mut stderr_pipe = child.stderr.take();
    let mut stdout_buf = Vec::new();
    let mut stderr_buf = Vec::new();

    // Drain both pipes while waiting so a child that fills its pipe buffer
    // cannot stall against a full pipe.
    let deadline = Duration::try_from_secs_f64(spec.runtime_limit_secs.max(0.0))
        .unwrap_or(Duration::MAX);
    let waited = {
        let collect = async {
            let (_, _, status) = tokio::join!(
                drain(&mut stdout_pipe, &mut stdout_buf),
                drain(&mut stderr_pipe, &mut stderr_buf),
                child.wait(),
            );
            status
        };
        timeout(deadline, collect).await
    };

    match waited {
        Err(_) => {
            // Deadline elapsed: kill and reap, then pick up whatever was
            // still sitting in the pipe buffers.
            let _ = child.kill().await;
            let _ = timeout(DRAIN_TIMEOUT, async {
                drain(&mut stdout_pipe, &mut stdout_buf).await;
                drain(&mut stderr_pipe, &mut stderr_buf).await;
            })
            .await;
            let runtime_secs = start.elapsed().as_secs_f64();
            debug!(
                "Killed {:?} after {:.1}s (deadline {:.1}s)",
                spec.cmd, runtime_secs, spec.runtime_limit_secs
            );
            ProcessOutcome {
                cmd: spec.cmd.clone(),
                runtime_limit_secs: spec.runtime_limit_secs,
                runtime_secs,
                status: ProcessStatus::FailedTimeout,
                stdout: Some(StreamCapture::new(stdout_buf, spec.output_cap_bytes)),
                stderr: Some(StreamCapture::new(stderr_buf, spec.output_cap_bytes)),
                returncode: None,
                exception_msg: Some(format!(
                    "process timed out after {:.1} secs (limit was {:.1} secs)",
                    runtime_secs, spec.runtime_limit_secs
                )),
                perms: None,
            }
        }
        Ok(Err(err)) => {
            let _ = child.kill().await;
            ProcessOutcome {
                cmd: spec.cmd.clone(),
                runtime_limit_secs: spec.runtime_limit_secs,
                runtime_secs: start.elapsed().as_secs_f64(),
                status: ProcessStatus::FailedExecException,
                stdout: Some(StreamCapture::new(stdout_buf, spec.output_cap_bytes)),
                stderr: Some(StreamCapture::new(stderr_buf, spec.output_cap_bytes)),
                returncode: None,
                exception_msg: Some(format!("failed to wait for process: {}", err)),
                perms: None,
            }
        }
        Ok(Ok(exit_status)) => {
            let returncode = exit_code(&exit_status);
            let (status, exception_msg) = if returncode == 0 {
                (ProcessStatus::Success, None)
            } else if returncode == -OOM_SIGNAL {
                (
                    ProcessStatus::FailedOutOfMemory,
                    Some("process was killed by SIGKILL, assuming the kernel OOM killer".to_string()),
                )
            } else {
                (
                    ProcessStatus::FailedReturnCode,
                    Some(format!("process exited with status code {}", returncode)),
                )
            };
            ProcessOutcome {
                cmd: spec.cmd.clone(),
                runtime_limit_secs: spec.runtime_limit_secs,
                runtime_secs: start.elapsed().as_secs_f64(),
                status,
                stdout: Some(StreamCapture::new(stdout_buf, spec.output_cap_bytes)),
                stderr: Some(StreamCapture::new(stderr_buf, spec.output_cap_bytes)),
                returncode: Some(returncode),
                exception_msg,
                perms: None,
            }
        }
    }
}

async fn drain<R: AsyncRead + Unpin>(pipe: &mut Option<R>, buf: &mut Vec<u8>) {
    if let Some(pipe) = pipe {
        let _ = pipe.read_to_end(buf).await;
    }
}

/// Exit code with the negative-signal convention: a signal-terminated child
/// reports `-signo`.
fn exit_code(status: &std::process::ExitStatus) -> i32 {
    match status.code() {
        Some(code) => code,
        None => -status.signal().unwrap_or(0),
    }
}

fn spawn_failure(spec: &ExecutionSpec, runtime_secs: f64, err: &std::io::Error) -> ProcessOutcome {
    let (status, perms) = if err.kind() == ErrorKind::PermissionDenied {
        (ProcessStatus::FailedNotExecutable, executable_mode(&spec.cmd[0]))
    } else {
        (ProcessStatus::FailedExecException, None)
    };
    debug!("Failed to spawn {:?}: {}", spec.cmd, err);
    ProcessOutcome {
        cmd: spec.cmd.clone(),
        runtime_limit_secs: spec.runtime_limit_secs,
        runtime_secs,
        status,
        stdout: None,
        stderr: None,
        returncode: None,
        exception_msg: Some(format!("failed to execute {}: {}", spec.cmd[0], err)),
        perms,
    }
}

/// File mode bits of the executable as an octal string, for the
/// not-executable diagnosis.
fn executable_mode(path: &str) -> Option<String> {
    std::fs::metadata(path)
        .ok()
        .map(|meta| format!("{:o}", meta.permissions().mode()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn sh(script: &str) -> ExecutionSpec {
        ExecutionSpec::new(["/bin/sh", "-c", script])
    }

    #[tokio::test]
    async fn test_success() {
        let outcome = execute_supervised(&sh("echo hello").with_deadline_secs(5.0)).await;
        assert_eq!(outcome.status, ProcessStatus::Success);
        assert!(outcome.is_success());
        assert_eq!(outcome.returncode, Some(0));
        assert_eq!(outcome.exception_msg, None);
        let stdout = outcome.stdout.unwrap();
        assert_eq!(stdout.data, b"hello\n");
        assert_eq!(stdout.length, 6);
        assert_eq!(outcome.stderr.unwrap().length, 0);
    }

    #[tokio::test]
    async fn test_nonzero_return_code() {
        let outcome = execute_supervised(&sh("exit 3").with_deadline_secs(5.0)).await;
        assert_eq!(outcome.status, ProcessStatus::FailedReturnCode);
        assert_eq!(outcome.returncode, Some(3));
        assert!(outcome.exception_msg.unwrap().contains("3"));
    }

    #[tokio::test]
    async fn test_timeout() {
        let outcome = execute_supervised(&sh("sleep 5").with_deadline_secs(0.2)).await;
        assert_eq!(outcome.status, ProcessStatus::FailedTimeout);
        assert_eq!(outcome.returncode, None);
        assert!(outcome.runtime_secs >= 0.2);
        assert!(outcome.runtime_secs < 2.0);
        assert!(outcome.exception_msg.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_timeout_keeps_partial_output() {
        let outcome =
            execute_supervised(&sh("echo early; sleep 5").with_deadline_secs(0.3)).await;
        assert_eq!(outcome.status, ProcessStatus::FailedTimeout);
        assert_eq!(outcome.stdout.unwrap().data, b"early\n");
    }

    #[tokio::test]
    async fn test_head_truncation() {
        let outcome = execute_supervised(
            &sh("printf abcdefghij; printf x >&2")
                .with_deadline_secs(5.0)
                .with_output_cap(4),
        )
        .await;
        let stdout = outcome.stdout.unwrap();
        assert_eq!(stdout.length, 10);
        assert_eq!(stdout.data, b"abcd");
        let stderr = outcome.stderr.unwrap();
        assert_eq!(stderr.length, 1);
        assert_eq!(stderr.data, b"x");
    }

    #[tokio::test]
    async fn test_sigkill_is_out_of_memory() {
        let outcome = execute_supervised(&sh("kill -9 $$").with_deadline_secs(5.0)).await;
        assert_eq!(outcome.status, ProcessStatus::FailedOutOfMemory);
        assert_eq!(outcome.returncode, Some(-9));
    }

    #[tokio::test]
    async fn test_other_signal_is_return_code() {
        let outcome = execute_supervised(&sh("kill -15 $$").with_deadline_secs(5.0)).await;
        assert_eq!(outcome.status, ProcessStatus::FailedReturnCode);
        assert_eq!(outcome.returncode, Some(-15));
    }

    #[tokio::test]
    async fn test_not_executable_records_perms() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("solution");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "#!/bin/sh").unwrap();
        drop(file);
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();

        let spec = ExecutionSpec::new([path.to_string_lossy().into_owned()]);
        let outcome = execute_supervised(&spec).await;
        assert_eq!(outcome.status, ProcessStatus::FailedNotExecutable);
        assert!(outcome.perms.unwrap().ends_with("644"));
        assert_eq!(outcome.stdout, None);
        assert_eq!(outcome.returncode, None);
    }

    #[tokio::test]
    async fn test_missing_binary_is_exec_exception() {
        let spec = ExecutionSpec::new(["/nonexistent/program"]);
        let outcome = execute_supervised(&spec).await;
        assert_eq!(outcome.status, ProcessStatus::FailedExecException);
        assert_eq!(outcome.perms, None);
        assert!(outcome.exception_msg.is_some());
    }

    #[tokio::test]
    async fn test_empty_command_is_exec_exception() {
        let spec = ExecutionSpec::new(Vec::<String>::new());
        let outcome = execute_supervised(&spec).await;
        assert_eq!(outcome.status, ProcessStatus::FailedExecException);
    }

    #[test]
    fn test_outcome_serialization() {
        let outcome = ProcessOutcome {
            cmd: vec!["/dut/solution".to_string(), "/testcases.json".to_string()],
            runtime_limit_secs: 2.0,
            runtime_secs: 0.1,
            status: ProcessStatus::Success,
            stdout: Some(StreamCapture::new(b"hi".to_vec(), 1024)),
            stderr: Some(StreamCapture::new(Vec::new(), 1024)),
            returncode: Some(0),
            exception_msg: None,
            perms: None,
        };
        let value: serde_json::Value = serde_json::to_value(&outcome).unwrap();
        assert_eq!(value["status"], "Success");
        assert_eq!(value["stdout"]["length"], 2);
        assert_eq!(value["stdout"]["data"], "aGk=");
        assert!(value.get("exception_msg").is_none());
        assert!(value.get("perms").is_none());

        let back: ProcessOutcome = serde_json::from_value(value).unwrap();
        assert_eq!(back.stdout.unwrap().data, b"hi");
    }

    #[test]
    fn test_status_wire_names() {
        assert_eq!(
            serde_json::to_string(&ProcessStatus::FailedTimeout).unwrap(),
            "\"FailedTimeout\""
        );
        assert_eq!(
            serde_json::to_string(&ProcessStatus::FailedOutOfMemory).unwrap(),
            "\"FailedOutOfMemory\""
        );
    }
}
