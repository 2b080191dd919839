// Server and worker configuration, read from the environment

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use log::warn;

/// How image bytes reach the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageDelivery {
    /// Write to a scratch file and pass its path (`<script> image <path>`).
    TempFile,
    /// Pipe the bytes through the worker's stdin (`<script> image`).
    Stdin,
}

impl FromStr for ImageDelivery {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "file" | "tempfile" | "temp_file" | "path" => Ok(ImageDelivery::TempFile),
            "stdin" | "pipe" | "stream" => Ok(ImageDelivery::Stdin),
            other => Err(format!("unknown image delivery mode: {other}")),
        }
    }
}

/// Everything the job launcher and reaper need to run one worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub interpreter: String,
    pub script: PathBuf,
    pub scratch_dir: PathBuf,
    pub timeout: Duration,
    pub kill_grace: Duration,
    pub image_delivery: ImageDelivery,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            interpreter: "python".to_string(),
            script: PathBuf::from("models/predict.py"),
            scratch_dir: PathBuf::from("temp"),
            timeout: Duration::from_secs(30),
            kill_grace: Duration::from_secs(2),
            image_delivery: ImageDelivery::TempFile,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub max_body_bytes: usize,
    pub log_dir: String,
    pub log_level: String,
    pub worker: WorkerConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 5000,
            max_body_bytes: 4 * 1024 * 1024,
            log_dir: "logs".to_string(),
            log_level: "info".to_string(),
            worker: WorkerConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Build the configuration from process environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup. Unparseable
    /// values keep their default and log a warning.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(port) = parse_var(&lookup, "PORT") {
            config.port = port;
        }
        if let Some(limit) = parse_var(&lookup, "MAX_BODY_BYTES") {
            config.max_body_bytes = limit;
        }
        if let Some(dir) = non_empty(&lookup, "LOG_DIR") {
            config.log_dir = dir;
        }
        if let Some(level) = non_empty(&lookup, "LOG_LEVEL") {
            config.log_level = level;
        }

        let worker = &mut config.worker;
        if let Some(interpreter) = non_empty(&lookup, "PREDICT_INTERPRETER") {
            worker.interpreter = interpreter;
        }
        if let Some(script) = non_empty(&lookup, "PREDICT_SCRIPT") {
            worker.script = PathBuf::from(script);
        }
        if let Some(dir) = non_empty(&lookup, "PREDICT_SCRATCH_DIR") {
            worker.scratch_dir = PathBuf::from(dir);
        }
        if let Some(secs) = parse_var::<u64, _>(&lookup, "PREDICT_TIMEOUT_SECS") {
            if secs == 0 {
                warn!("[CONFIG] PREDICT_TIMEOUT_SECS must be positive, keeping default");
            } else {
                worker.timeout = Duration::from_secs(secs);
            }
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "PREDICT_KILL_GRACE_MS") {
            worker.kill_grace = Duration::from_millis(ms);
        }
        if let Some(delivery) = parse_var(&lookup, "PREDICT_IMAGE_DELIVERY") {
            worker.image_delivery = delivery;
        }

        config
    }
}

fn non_empty<F>(lookup: &F, key: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key).filter(|v| !v.trim().is_empty())
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Option<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    let raw = non_empty(lookup, key)?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("[CONFIG] Ignoring invalid {key}={raw}: {e}");
            None
        }
    }
}
