//! Job launcher: turns validated input into a running worker.
//!
//! The launcher never answers the caller. It acquires resources, arms the
//! watchdog, starts the worker and returns a [`Job`] whose event channel
//! already carries any launch failure, so every outcome goes through the
//! arbiter.

use std::ffi::OsString;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use fitness_predict_types::{validate_features, LaunchError};
use log::{error, info};
use serde_json::Value;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use uuid::Uuid;

use super::arbiter::JobEvent;
use super::process_manager::{spawn_worker, WorkerInvocation};
use super::reaper::{ResourceSet, TempFile, Watchdog};
use crate::web::config::{ImageDelivery, WorkerConfig};

/// How the input reached the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputDelivery {
    /// JSON-encoded features on the command line.
    Inline,
    /// Image written to a scratch file whose path is on the command line.
    TempFile(PathBuf),
    /// Image bytes piped through stdin.
    Stdin,
}

/// One in-flight request's worker invocation and everything it owns.
#[derive(Debug)]
pub struct Job {
    pub id: Uuid,
    pub created_at: Instant,
    pub delivery: InputDelivery,
    pub timeout: Duration,
    pub resources: ResourceSet,
    pub events: UnboundedReceiver<JobEvent>,
    events_tx: UnboundedSender<JobEvent>,
}

impl Job {
    /// Another producer for this job's event stream.
    pub fn event_sender(&self) -> UnboundedSender<JobEvent> {
        self.events_tx.clone()
    }
}

#[derive(Debug, Clone)]
pub struct JobLauncher {
    config: WorkerConfig,
}

impl JobLauncher {
    pub fn new(config: WorkerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// `<script> <json-array>`, stdin closed. Rejects missing or
    /// non-numeric features before anything is spawned.
    pub fn launch_tabular(&self, features: Option<&Value>) -> Result<Job, LaunchError> {
        let features = validate_features(features)?;
        let encoded = serde_json::to_string(&features).map_err(|_| LaunchError::InvalidFeatures)?;

        let invocation = self.invocation(vec![encoded.into()], None);
        Ok(self.start("tabular", InputDelivery::Inline, || Ok((invocation, None))))
    }

    /// `<script> image <path>` (scratch file) or `<script> image` with the
    /// bytes on stdin, depending on configuration.
    pub fn launch_image(&self, image: Option<Vec<u8>>) -> Result<Job, LaunchError> {
        let bytes = match image {
            Some(bytes) if !bytes.is_empty() => bytes,
            _ => return Err(LaunchError::MissingImage),
        };

        match self.config.image_delivery {
            ImageDelivery::Stdin => {
                let invocation = self.invocation(vec!["image".into()], Some(bytes));
                Ok(self.start("image", InputDelivery::Stdin, || Ok((invocation, None))))
            }
            ImageDelivery::TempFile => {
                let scratch_dir = self.config.scratch_dir.clone();
                let staged = TempFile::create(&scratch_dir, &bytes);
                let delivery = match &staged {
                    Ok(file) => InputDelivery::TempFile(file.path().to_path_buf()),
                    Err(_) => InputDelivery::TempFile(scratch_dir),
                };
                Ok(self.start("image", delivery, || {
                    let file = staged.map_err(|e| e.to_string())?;
                    let invocation = self.invocation(
                        vec!["image".into(), file.path().as_os_str().to_owned()],
                        None,
                    );
                    Ok((invocation, Some(file)))
                }))
            }
        }
    }

    fn invocation(&self, mut extra: Vec<OsString>, stdin_payload: Option<Vec<u8>>) -> WorkerInvocation {
        let mut args = vec![self.config.script.as_os_str().to_owned()];
        args.append(&mut extra);
        WorkerInvocation {
            program: self.config.interpreter.clone(),
            args,
            stdin_payload,
        }
    }

    /// Create the job, arm its watchdog and start the worker. `stage`
    /// prepares the invocation; its error becomes a `StagingFailed` event.
    fn start<F>(&self, kind: &str, delivery: InputDelivery, stage: F) -> Job
    where
        F: FnOnce() -> Result<(WorkerInvocation, Option<TempFile>), String>,
    {
        let id = Uuid::new_v4();
        let created_at = Instant::now();
        let (events_tx, events) = mpsc::unbounded_channel();
        let mut resources = ResourceSet::new(id);
        resources.set_watchdog(Watchdog::arm(self.config.timeout, events_tx.clone()));

        match stage() {
            Ok((invocation, temp_file)) => {
                if let Some(file) = temp_file {
                    resources.set_temp_file(file);
                }
                match spawn_worker(invocation, events_tx.clone(), self.config.kill_grace, id) {
                    Ok(worker) => {
                        info!("[PREDICT] job {id}: started {kind} prediction");
                        resources.set_worker(worker);
                    }
                    Err(e) => {
                        error!("[PREDICT] job {id}: failed to spawn worker: {e}");
                        let _ = events_tx.send(JobEvent::SpawnFailed(e.to_string()));
                    }
                }
            }
            Err(e) => {
                error!("[PREDICT] job {id}: failed to stage input: {e}");
                let _ = events_tx.send(JobEvent::StagingFailed(e));
            }
        }

        Job {
            id,
            created_at,
            delivery,
            timeout: self.config.timeout,
            resources,
            events,
            events_tx,
        }
    }
}
