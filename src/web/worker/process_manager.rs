//! Worker process lifecycle management.
//!
//! Spawns the inference worker as a child process and hands ownership of
//! the `Child` to a supervisor task. The supervisor forwards stdout/stderr
//! chunks and the final exit as [`JobEvent`]s, and is the only place that
//! ever signals the process.

use std::ffi::OsString;
use std::process::Stdio;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::oneshot;
use uuid::Uuid;

use super::arbiter::{JobEvent, WorkerExit};
use super::reaper::terminate_child;

const READ_CHUNK_BYTES: usize = 8 * 1024;

/// Program, arguments and optional stdin payload for one worker run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerInvocation {
    pub program: String,
    pub args: Vec<OsString>,
    pub stdin_payload: Option<Vec<u8>>,
}

/// Owned handle to a running worker. Terminating (or dropping) it asks the
/// supervisor to stop the process; once the process has exited on its own
/// both are no-ops.
#[derive(Debug)]
pub struct WorkerHandle {
    pid: Option<u32>,
    terminate_tx: Option<oneshot::Sender<()>>,
}

impl WorkerHandle {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Request graceful-then-forceful termination. Idempotent.
    pub fn terminate(&mut self) {
        if let Some(tx) = self.terminate_tx.take() {
            // Err means the supervisor already saw the process exit.
            let _ = tx.send(());
        }
    }
}

/// Spawn the worker and start supervising it.
pub fn spawn_worker(
    invocation: WorkerInvocation,
    events: UnboundedSender<JobEvent>,
    kill_grace: Duration,
    job_id: Uuid,
) -> std::io::Result<WorkerHandle> {
    let WorkerInvocation {
        program,
        args,
        stdin_payload,
    } = invocation;

    let stdin = if stdin_payload.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    };

    let mut child = Command::new(&program)
        .args(&args)
        .stdin(stdin)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    let pid = child.id();
    info!("[SUPERVISOR] job {job_id}: spawned {program} (pid {pid:?})");

    if let (Some(payload), Some(mut stdin)) = (stdin_payload, child.stdin.take()) {
        tokio::spawn(async move {
            if let Err(e) = stdin.write_all(&payload).await {
                // The worker may exit before reading everything.
                debug!("[SUPERVISOR] job {job_id}: stdin write stopped: {e}");
            }
            // Dropping the handle closes the pipe so the worker sees EOF.
        });
    }

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let (terminate_tx, terminate_rx) = oneshot::channel();

    tokio::spawn(supervise(
        child,
        stdout,
        stderr,
        events,
        terminate_rx,
        kill_grace,
        job_id,
    ));

    Ok(WorkerHandle {
        pid,
        terminate_tx: Some(terminate_tx),
    })
}

async fn read_chunk<R>(reader: &mut Option<R>, buf: &mut [u8]) -> Option<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let reader = reader.as_mut()?;
    match reader.read(buf).await {
        Ok(0) => None,
        Ok(n) => Some(buf[..n].to_vec()),
        Err(e) => {
            debug!("[SUPERVISOR] pipe read error: {e}");
            None
        }
    }
}

/// Pump output into `events` until the worker exits or termination is
/// requested. `Exited` is only sent after both pipes hit EOF, so every
/// output chunk reaches the arbiter before the exit does.
async fn supervise(
    mut child: Child,
    mut stdout: Option<ChildStdout>,
    mut stderr: Option<ChildStderr>,
    events: UnboundedSender<JobEvent>,
    mut terminate_rx: oneshot::Receiver<()>,
    kill_grace: Duration,
    job_id: Uuid,
) {
    let mut out_buf = vec![0u8; READ_CHUNK_BYTES];
    let mut err_buf = vec![0u8; READ_CHUNK_BYTES];

    loop {
        tokio::select! {
            chunk = read_chunk(&mut stdout, &mut out_buf), if stdout.is_some() => match chunk {
                Some(chunk) => {
                    let _ = events.send(JobEvent::Stdout(chunk));
                }
                None => stdout = None,
            },
            chunk = read_chunk(&mut stderr, &mut err_buf), if stderr.is_some() => match chunk {
                Some(chunk) => {
                    let _ = events.send(JobEvent::Stderr(chunk));
                }
                None => stderr = None,
            },
            status = child.wait(), if stdout.is_none() && stderr.is_none() => {
                let exit = match status {
                    Ok(status) => WorkerExit::from(status),
                    Err(e) => {
                        warn!("[SUPERVISOR] job {job_id}: wait failed: {e}");
                        WorkerExit::signalled()
                    }
                };
                debug!("[SUPERVISOR] job {job_id}: worker exited with {:?}", exit.code);
                let _ = events.send(JobEvent::Exited(exit));
                return;
            }
            // A dropped handle counts as a termination request too.
            _ = &mut terminate_rx => {
                terminate_child(&mut child, kill_grace, &job_id).await;
                return;
            }
        }
    }
}

#[cfg(all(test, not(windows)))]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn sh(script: &str) -> WorkerInvocation {
        WorkerInvocation {
            program: "sh".to_string(),
            args: vec!["-c".into(), script.into()],
            stdin_payload: None,
        }
    }

    async fn collect_until_exit(rx: &mut mpsc::UnboundedReceiver<JobEvent>) -> (Vec<u8>, Vec<u8>, WorkerExit) {
        let mut out = Vec::new();
        let mut err = Vec::new();
        loop {
            match rx.recv().await.expect("supervisor hung up before exit") {
                JobEvent::Stdout(chunk) => out.extend(chunk),
                JobEvent::Stderr(chunk) => err.extend(chunk),
                JobEvent::Exited(exit) => return (out, err, exit),
                other => panic!("unexpected event {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_output_arrives_before_exit() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _handle = spawn_worker(
            sh("printf '{\"a\":'; printf oops >&2; printf '1}'; exit 3"),
            tx,
            Duration::from_millis(200),
            Uuid::new_v4(),
        )
        .unwrap();

        let (out, err, exit) = collect_until_exit(&mut rx).await;
        assert_eq!(out, b"{\"a\":1}");
        assert_eq!(err, b"oops");
        assert_eq!(exit, WorkerExit::code(3));
    }

    #[tokio::test]
    async fn test_stdin_payload_is_delivered() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut invocation = sh("wc -c");
        invocation.stdin_payload = Some(vec![b'z'; 1000]);
        let _handle = spawn_worker(invocation, tx, Duration::from_millis(200), Uuid::new_v4()).unwrap();

        let (out, _, exit) = collect_until_exit(&mut rx).await;
        assert_eq!(String::from_utf8_lossy(&out).trim(), "1000");
        assert!(exit.success());
    }

    #[tokio::test]
    async fn test_spawn_error_for_missing_program() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let invocation = WorkerInvocation {
            program: "/definitely/not/a/real/interpreter".to_string(),
            args: vec![],
            stdin_payload: None,
        };
        assert!(spawn_worker(invocation, tx, Duration::from_millis(200), Uuid::new_v4()).is_err());
    }

    #[tokio::test]
    async fn test_terminate_stops_hung_worker() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut handle = spawn_worker(
            sh("sleep 30"),
            tx,
            Duration::from_millis(200),
            Uuid::new_v4(),
        )
        .unwrap();
        let pid = handle.pid().unwrap();

        handle.terminate();
        handle.terminate();

        // Supervisor exits without reporting an exit event and drops its sender.
        let outcome = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await;
        assert_eq!(outcome.unwrap(), None);
        assert!(!process_alive(pid));
    }

    #[tokio::test]
    async fn test_sigterm_ignored_escalates_to_kill() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut handle = spawn_worker(
            sh("trap '' TERM; while true; do sleep 0.05; done"),
            tx,
            Duration::from_millis(200),
            Uuid::new_v4(),
        )
        .unwrap();
        let pid = handle.pid().unwrap();

        // Give the shell time to install its trap.
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.terminate();

        let outcome = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await;
        assert_eq!(outcome.unwrap(), None);
        assert!(!process_alive(pid));
    }

    fn process_alive(pid: u32) -> bool {
        // SAFETY: signal 0 only checks for existence.
        unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
    }
}
