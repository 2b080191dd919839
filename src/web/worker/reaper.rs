//! Resource reaper.
//!
//! Everything a job acquires (scratch file, worker process, watchdog timer)
//! lives in one [`ResourceSet`]. Releasing it is idempotent: each resource
//! sits in an `Option` and is taken exactly once, whether release runs from
//! the job driver or from `Drop`.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::process::Child;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::arbiter::JobEvent;
use super::process_manager::WorkerHandle;

/// Extension given to every scratch image.
pub const TEMP_FILE_EXTENSION: &str = "jpg";

/// Delete `path` if it exists. Failures are logged, never returned, so a
/// cleanup problem cannot change the response. Returns whether a file was
/// actually removed.
pub fn release_temp_file(path: &Path) -> bool {
    match std::fs::remove_file(path) {
        Ok(()) => {
            debug!("[REAPER] removed temp file {}", path.display());
            true
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => false,
        Err(e) => {
            warn!("[REAPER] failed to remove temp file {}: {e}", path.display());
            false
        }
    }
}

/// A uniquely named scratch file holding one request's input.
#[derive(Debug)]
pub struct TempFile {
    path: PathBuf,
    released: bool,
}

impl TempFile {
    /// Write `bytes` to `temp_image_<uuid>.jpg` under `dir`, creating the
    /// directory if needed. A partially written file is removed before the
    /// error is returned.
    pub fn create(dir: &Path, bytes: &[u8]) -> io::Result<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!(
            "temp_image_{}.{TEMP_FILE_EXTENSION}",
            Uuid::new_v4()
        ));

        let mut file = TempFile {
            path,
            released: false,
        };
        let written = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&file.path)
            .and_then(|mut f| io::Write::write_all(&mut f, bytes));
        if let Err(e) = written {
            file.release();
            return Err(e);
        }

        debug!(
            "[REAPER] staged {} bytes at {}",
            bytes.len(),
            file.path.display()
        );
        Ok(file)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn release(&mut self) {
        if !self.released {
            self.released = true;
            release_temp_file(&self.path);
        }
    }
}

impl Drop for TempFile {
    fn drop(&mut self) {
        self.release();
    }
}

/// Elapsed-time timer. Sends [`JobEvent::WatchdogFired`] once unless
/// cancelled first.
#[derive(Debug)]
pub struct Watchdog {
    task: Option<JoinHandle<()>>,
}

impl Watchdog {
    pub fn arm(timeout: Duration, events: UnboundedSender<JobEvent>) -> Self {
        let task = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = events.send(JobEvent::WatchdogFired);
        });
        Self { task: Some(task) }
    }

    pub fn cancel(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    pub fn is_armed(&self) -> bool {
        self.task.is_some()
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Ask the worker to stop: SIGTERM, then SIGKILL once `grace` has passed.
/// A child that has already been reaped is never signalled.
pub async fn terminate_child(child: &mut Child, grace: Duration, job_id: &Uuid) {
    match child.try_wait() {
        Ok(Some(status)) => {
            debug!("[REAPER] job {job_id}: worker already exited ({status})");
            return;
        }
        Ok(None) => {}
        Err(e) => warn!("[REAPER] job {job_id}: could not poll worker status: {e}"),
    }

    if !send_graceful_signal(child) {
        debug!("[REAPER] job {job_id}: graceful signal not delivered");
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => info!("[REAPER] job {job_id}: worker stopped ({status})"),
        Ok(Err(e)) => warn!("[REAPER] job {job_id}: waiting for worker failed: {e}"),
        Err(_) => {
            warn!(
                "[REAPER] job {job_id}: worker ignored termination for {}ms, killing",
                grace.as_millis()
            );
            if let Ok(Some(_)) = child.try_wait() {
                return;
            }
            if let Err(e) = child.kill().await {
                warn!("[REAPER] job {job_id}: kill failed: {e}");
            }
        }
    }
}

#[cfg(not(windows))]
fn send_graceful_signal(child: &mut Child) -> bool {
    let Some(pid) = child.id() else {
        return false;
    };
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: `pid` belongs to a child we have not reaped yet, so it cannot
    // have been recycled for another process.
    unsafe { libc::kill(pid, libc::SIGTERM) == 0 }
}

#[cfg(windows)]
fn send_graceful_signal(child: &mut Child) -> bool {
    // No SIGTERM on Windows; the forceful kill is the only option.
    child.start_kill().is_ok()
}

/// All resources owned by one job.
#[derive(Debug)]
pub struct ResourceSet {
    job_id: Uuid,
    temp_file: Option<TempFile>,
    worker: Option<WorkerHandle>,
    watchdog: Option<Watchdog>,
}

impl ResourceSet {
    pub fn new(job_id: Uuid) -> Self {
        Self {
            job_id,
            temp_file: None,
            worker: None,
            watchdog: None,
        }
    }

    pub fn set_temp_file(&mut self, file: TempFile) {
        self.temp_file = Some(file);
    }

    pub fn set_worker(&mut self, worker: WorkerHandle) {
        self.worker = Some(worker);
    }

    pub fn set_watchdog(&mut self, watchdog: Watchdog) {
        self.watchdog = Some(watchdog);
    }

    pub fn temp_file_path(&self) -> Option<&Path> {
        self.temp_file.as_ref().map(TempFile::path)
    }

    pub fn worker_pid(&self) -> Option<u32> {
        self.worker.as_ref().and_then(WorkerHandle::pid)
    }

    pub fn is_released(&self) -> bool {
        self.temp_file.is_none() && self.worker.is_none() && self.watchdog.is_none()
    }

    pub fn cancel_watchdog(&mut self) {
        if let Some(mut watchdog) = self.watchdog.take() {
            watchdog.cancel();
        }
    }

    pub fn terminate_worker(&mut self) {
        if let Some(mut worker) = self.worker.take() {
            worker.terminate();
        }
    }

    pub fn release_temp_file(&mut self) {
        if let Some(mut file) = self.temp_file.take() {
            file.release();
        }
    }

    /// Release everything. Safe to call any number of times.
    pub fn release(&mut self) {
        if self.is_released() {
            return;
        }
        debug!("[REAPER] releasing resources for job {}", self.job_id);
        self.cancel_watchdog();
        self.terminate_worker();
        self.release_temp_file();
    }
}

impl Drop for ResourceSet {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[test]
    fn test_temp_file_created_with_unique_name() {
        let dir = tempfile::tempdir().unwrap();
        let scratch = dir.path().join("scratch");
        let a = TempFile::create(&scratch, b"one").unwrap();
        let b = TempFile::create(&scratch, b"two").unwrap();

        assert_ne!(a.path(), b.path());
        assert_eq!(std::fs::read(a.path()).unwrap(), b"one");
        let name = a.path().file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("temp_image_"));
        assert!(name.ends_with(".jpg"));
    }

    #[test]
    fn test_temp_file_removed_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = {
            let file = TempFile::create(dir.path(), b"x").unwrap();
            file.path().to_path_buf()
        };
        assert!(!path.exists());
    }

    #[test]
    fn test_release_temp_file_missing_is_silent() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!release_temp_file(&dir.path().join("never-created.jpg")));
    }

    #[test]
    fn test_temp_file_release_twice() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = TempFile::create(dir.path(), b"x").unwrap();
        file.release();
        assert!(!file.path().exists());
        file.release();
        assert!(!file.path().exists());
    }

    #[tokio::test]
    async fn test_resource_set_release_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let mut resources = ResourceSet::new(Uuid::new_v4());
        resources.set_temp_file(TempFile::create(dir.path(), b"img").unwrap());
        resources.set_watchdog(Watchdog::arm(Duration::from_millis(50), tx));
        let path = resources.temp_file_path().unwrap().to_path_buf();

        resources.release();
        assert!(resources.is_released());
        assert!(!path.exists());

        // A second release has nothing left to do and must not panic.
        resources.release();
        assert!(resources.is_released());

        // The cancelled watchdog never fires.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_watchdog_fires_once() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let watchdog = Watchdog::arm(Duration::from_millis(10), tx);
        assert!(watchdog.is_armed());

        assert_eq!(rx.recv().await, Some(JobEvent::WatchdogFired));
        // The task dropped its sender after firing.
        assert_eq!(rx.recv().await, None);
    }
}
