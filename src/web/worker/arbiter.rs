//! Response arbiter: the per-job state machine.
//!
//! Every observable thing that can happen to a job arrives as a
//! [`JobEvent`]. The arbiter is fed those events by exactly one consumer,
//! in arrival order, and latches the first qualifying one into a
//! [`Resolution`]. Once latched, every further event is a no-op, so the
//! caller can never be answered twice.

use std::time::Duration;

use fitness_predict_types::{truncate_detail, FailureKind, JobFailure, Resolution};
use log::{debug, trace};
use serde_json::Value;

use super::stderr_filter::{ErrorReport, StderrScanner};

/// Stdout beyond this size is treated as a runaway worker.
pub const MAX_STDOUT_BYTES: usize = 4 * 1024 * 1024;

/// How the worker process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerExit {
    /// `None` when the process was terminated by a signal.
    pub code: Option<i32>,
}

impl WorkerExit {
    pub fn code(code: i32) -> Self {
        Self { code: Some(code) }
    }

    pub fn signalled() -> Self {
        Self { code: None }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    fn describe(&self) -> String {
        match self.code {
            Some(code) => format!("exit code {code}"),
            None => "terminated by signal".to_string(),
        }
    }
}

impl From<std::process::ExitStatus> for WorkerExit {
    fn from(status: std::process::ExitStatus) -> Self {
        Self {
            code: status.code(),
        }
    }
}

/// Everything that can happen to a job.
#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
    /// Delivered after stdout and stderr have both reached EOF.
    Exited(WorkerExit),
    /// The scratch file for the input could not be written.
    StagingFailed(String),
    SpawnFailed(String),
    WatchdogFired,
    ClientDisconnected,
}

impl JobEvent {
    fn name(&self) -> &'static str {
        match self {
            JobEvent::Stdout(_) => "stdout",
            JobEvent::Stderr(_) => "stderr",
            JobEvent::Exited(_) => "exit",
            JobEvent::StagingFailed(_) => "staging-error",
            JobEvent::SpawnFailed(_) => "spawn-error",
            JobEvent::WatchdogFired => "watchdog",
            JobEvent::ClientDisconnected => "disconnect",
        }
    }
}

#[derive(Debug)]
pub struct Arbiter {
    timeout: Duration,
    stdout: Vec<u8>,
    stderr: StderrScanner,
    resolution: Option<Resolution>,
}

impl Arbiter {
    /// `timeout` is only used to word the timeout failure.
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            stdout: Vec::new(),
            stderr: StderrScanner::new(),
            resolution: None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.resolution.is_some()
    }

    pub fn resolution(&self) -> Option<&Resolution> {
        self.resolution.as_ref()
    }

    /// Apply one event. Returns the resolution only on the transition out
    /// of the pending state; `None` both while pending and after.
    pub fn handle(&mut self, event: JobEvent) -> Option<Resolution> {
        if self.resolution.is_some() {
            trace!("[ARBITER] ignoring {} after resolution", event.name());
            return None;
        }

        let resolved = match event {
            JobEvent::Stdout(chunk) => self.on_stdout(&chunk),
            JobEvent::Stderr(chunk) => self.stderr.push(&chunk).map(worker_reported),
            JobEvent::Exited(exit) => Some(self.on_exit(exit)),
            JobEvent::StagingFailed(err) => Some(Resolution::Failure(
                JobFailure::new(FailureKind::StagingFailed, "Failed to process image")
                    .with_detail(&err),
            )),
            JobEvent::SpawnFailed(err) => Some(Resolution::Failure(
                JobFailure::new(FailureKind::SpawnFailed, "Failed to start prediction process")
                    .with_detail(&err),
            )),
            JobEvent::WatchdogFired => Some(Resolution::failure(
                FailureKind::Timeout,
                format!(
                    "Prediction timeout: worker did not finish within {}",
                    describe_duration(self.timeout)
                ),
            )),
            JobEvent::ClientDisconnected => Some(Resolution::Abandoned),
        }?;

        debug!("[ARBITER] resolved as {}", resolved.label());
        self.resolution = Some(resolved.clone());
        Some(resolved)
    }

    fn on_stdout(&mut self, chunk: &[u8]) -> Option<Resolution> {
        if self.stdout.len() + chunk.len() > MAX_STDOUT_BYTES {
            return Some(Resolution::Failure(
                JobFailure::new(FailureKind::MalformedOutput, "Prediction output too large")
                    .with_detail(&String::from_utf8_lossy(&self.stdout)),
            ));
        }
        self.stdout.extend_from_slice(chunk);
        None
    }

    fn on_exit(&mut self, exit: WorkerExit) -> Resolution {
        // A fatal stderr line without a trailing newline only becomes
        // visible here, and it outranks exit code 0.
        if let Some(report) = self.stderr.finish() {
            return worker_reported(report);
        }

        let raw = String::from_utf8_lossy(&self.stdout);
        let output = raw.trim();

        if !exit.success() {
            let message = worker_error_message(output).unwrap_or_else(|| {
                format!("Prediction process failed ({})", exit.describe())
            });
            let detail = format!("{}; output: {}", exit.describe(), truncate_detail(output));
            return Resolution::Failure(
                JobFailure::new(FailureKind::NonZeroExit, message).with_detail(&detail),
            );
        }

        if output.is_empty() {
            return Resolution::failure(
                FailureKind::EmptyOutput,
                "Prediction process produced no output",
            );
        }

        match serde_json::from_str::<Value>(output) {
            Ok(payload) => Resolution::Success(payload),
            Err(e) => {
                let detail = format!("{e}; output: {}", truncate_detail(output));
                Resolution::Failure(
                    JobFailure::new(
                        FailureKind::MalformedOutput,
                        "Failed to parse prediction output",
                    )
                    .with_detail(&detail),
                )
            }
        }
    }
}

fn worker_reported(report: ErrorReport) -> Resolution {
    Resolution::Failure(
        JobFailure::new(
            FailureKind::WorkerReportedError,
            "Prediction worker reported an error",
        )
        .with_detail(&report.captured),
    )
}

/// The inference script answers failures with `{"error": "...", "status":
/// "error"}` before exiting 1. Surface that text when it is there.
fn worker_error_message(output: &str) -> Option<String> {
    let value: Value = serde_json::from_str(output).ok()?;
    value
        .get("error")
        .and_then(Value::as_str)
        .filter(|msg| !msg.trim().is_empty())
        .map(str::to_string)
}

fn describe_duration(d: Duration) -> String {
    if d.as_millis() % 1000 == 0 {
        format!("{}s", d.as_secs())
    } else {
        format!("{}ms", d.as_millis())
    }
}
