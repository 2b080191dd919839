//! Job driver.
//!
//! Each job gets one tokio task that is the sole consumer of its event
//! channel. The task feeds events to the [`Arbiter`] until it resolves,
//! hands the resources to the reaper, then writes the response through a
//! [`ResponseSlot`] that can only be used once.
//!
//! The request future only waits for that response. If hyper drops it
//! because the peer went away, its [`DisconnectGuard`] turns the drop into
//! a `ClientDisconnected` event.

use fitness_predict_types::Resolution;
use hyper::{Body, Response, StatusCode};
use log::{error, info, warn};
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::oneshot;
use uuid::Uuid;

use super::arbiter::{Arbiter, JobEvent};
use super::launcher::Job;
use crate::web::response_helpers::{job_failure, json_error, json_response};

/// Where the one and only response for a job goes.
#[derive(Debug)]
pub struct ResponseSlot {
    job_id: Uuid,
    tx: oneshot::Sender<Response<Body>>,
}

impl ResponseSlot {
    pub fn new(job_id: Uuid, tx: oneshot::Sender<Response<Body>>) -> Self {
        Self { job_id, tx }
    }

    /// Write the response for `resolution`. Consumes the slot, so a second
    /// write does not type-check. Returns whether anything was sent.
    pub fn deliver(self, resolution: &Resolution) -> bool {
        let response = match resolution {
            Resolution::Success(payload) => json_response(StatusCode::OK, payload),
            Resolution::Failure(failure) => job_failure(failure),
            Resolution::Abandoned => {
                info!("[PREDICT] job {}: caller disconnected, no response", self.job_id);
                return false;
            }
        };

        if self.tx.is_closed() {
            warn!(
                "[PREDICT] job {}: caller gone before {} response",
                self.job_id,
                resolution.label()
            );
            return false;
        }
        self.tx.send(response).is_ok()
    }
}

/// Sends `ClientDisconnected` when dropped, unless disarmed first.
#[derive(Debug)]
pub struct DisconnectGuard {
    events: Option<UnboundedSender<JobEvent>>,
}

impl DisconnectGuard {
    pub fn new(events: UnboundedSender<JobEvent>) -> Self {
        Self {
            events: Some(events),
        }
    }

    pub fn disarm(&mut self) {
        self.events = None;
    }
}

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        if let Some(events) = self.events.take() {
            let _ = events.send(JobEvent::ClientDisconnected);
        }
    }
}

/// Run a job to its resolution. Resources are released before the
/// response is written.
pub async fn drive(mut job: Job, slot: ResponseSlot) -> Resolution {
    let mut arbiter = Arbiter::new(job.timeout);

    let resolution = loop {
        match job.events.recv().await {
            Some(event) => {
                if let Some(resolution) = arbiter.handle(event) {
                    break resolution;
                }
            }
            // The job keeps its own sender, so this only happens if the
            // channel is torn down from outside.
            None => break Resolution::Abandoned,
        }
    };

    job.resources.release();

    let elapsed = job.created_at.elapsed();
    match &resolution {
        Resolution::Failure(failure) => warn!(
            "[PREDICT] job {}: {} after {}ms: {}",
            job.id,
            failure.kind,
            elapsed.as_millis(),
            failure.message
        ),
        other => info!(
            "[PREDICT] job {}: {} after {}ms",
            job.id,
            other.label(),
            elapsed.as_millis()
        ),
    }

    slot.deliver(&resolution);
    resolution
}

/// Drive `job` on its own task and wait for its response.
pub async fn execute(job: Job) -> Response<Body> {
    let job_id = job.id;
    let mut guard = DisconnectGuard::new(job.event_sender());
    let (tx, rx) = oneshot::channel();

    tokio::spawn(drive(job, ResponseSlot::new(job_id, tx)));

    let response = match rx.await {
        Ok(response) => response,
        Err(_) => {
            error!("[PREDICT] job {job_id}: driver finished without a response");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "Prediction failed")
        }
    };
    guard.disarm();
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use fitness_predict_types::FailureKind;
    use serde_json::json;

    #[tokio::test]
    async fn test_slot_delivers_success() {
        let (tx, rx) = oneshot::channel();
        let slot = ResponseSlot::new(Uuid::new_v4(), tx);
        assert!(slot.deliver(&Resolution::Success(json!({"label": "ok"}))));

        let response = rx.await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
        assert_eq!(
            serde_json::from_slice::<serde_json::Value>(&bytes).unwrap(),
            json!({"label": "ok"})
        );
    }

    #[tokio::test]
    async fn test_slot_suppresses_abandoned() {
        let (tx, rx) = oneshot::channel();
        let slot = ResponseSlot::new(Uuid::new_v4(), tx);
        assert!(!slot.deliver(&Resolution::Abandoned));
        assert!(rx.await.is_err());
    }

    #[test]
    fn test_slot_skips_closed_exchange() {
        let (tx, rx) = oneshot::channel();
        drop(rx);
        let slot = ResponseSlot::new(Uuid::new_v4(), tx);
        assert!(!slot.deliver(&Resolution::failure(FailureKind::Timeout, "late")));
    }

    #[test]
    fn test_guard_reports_disconnect_on_drop() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        drop(DisconnectGuard::new(tx.clone()));
        assert_eq!(rx.try_recv().unwrap(), JobEvent::ClientDisconnected);

        let mut guard = DisconnectGuard::new(tx);
        guard.disarm();
        drop(guard);
        assert!(rx.try_recv().is_err());
    }
}
