//! Out-of-process prediction worker.
//!
//! Every request runs the inference script in its own child process:
//! - `launcher` validates input, stages it and spawns the worker
//! - `process_manager` supervises the child and streams its output as events
//! - `arbiter` turns the event stream into exactly one resolution
//! - `reaper` releases the temp file, the process and the watchdog
//! - `job` drives one job and writes its response

pub mod arbiter;
pub mod job;
pub mod launcher;
pub mod process_manager;
pub mod reaper;
pub mod stderr_filter;
pub mod worker_bridge;
