//! Server-side entry point for predictions.
//!
//! Route handlers call into a shared [`PredictionBridge`]. It validates and
//! launches a job, then waits on the job driver for the single response.

use std::sync::Arc;

use hyper::{Body, Response};
use log::warn;
use serde_json::Value;

use super::job::execute;
use super::launcher::JobLauncher;
use crate::web::config::WorkerConfig;
use crate::web::response_helpers::invalid_input;

/// Shared reference to the PredictionBridge.
pub type SharedPredictionBridge = Arc<PredictionBridge>;

pub struct PredictionBridge {
    launcher: JobLauncher,
}

impl PredictionBridge {
    pub fn new(config: WorkerConfig) -> Self {
        Self {
            launcher: JobLauncher::new(config),
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        self.launcher.config()
    }

    /// Run the worker on a feature vector. Invalid input is answered with
    /// 400 and nothing is spawned.
    pub async fn predict_tabular(&self, features: Option<&Value>) -> Response<Body> {
        match self.launcher.launch_tabular(features) {
            Ok(job) => execute(job).await,
            Err(e) => {
                warn!("[PREDICT] rejected tabular request: {e}");
                invalid_input(&e)
            }
        }
    }

    /// Run the worker on an uploaded image.
    pub async fn predict_image(&self, image: Option<Vec<u8>>) -> Response<Body> {
        match self.launcher.launch_image(image) {
            Ok(job) => execute(job).await,
            Err(e) => {
                warn!("[PREDICT] rejected image request: {e}");
                invalid_input(&e)
            }
        }
    }
}
