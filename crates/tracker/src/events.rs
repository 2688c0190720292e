//! Notifications delivered to whoever started a tracking session.
//!
//! A session reports through a [`TrackingObserver`]. Callers that prefer
//! a stream can pass an `mpsc::UnboundedSender<TrackerEvent>`, which
//! implements the trait by forwarding every callback as a
//! [`TrackerEvent`].

use afe_core::types::JobId;
use tokio::sync::mpsc;

use crate::error::TrackError;
use crate::interpreter::EvaluationSnapshot;
use crate::supervisor::ConnectionState;

/// Receives progress from one tracking session.
///
/// Callbacks are invoked from the session task and must not block.
/// `on_complete` and `on_error` are mutually exclusive and each fires at
/// most once per session.
pub trait TrackingObserver: Send + Sync {
    /// The snapshot changed.
    fn on_update(&self, snapshot: &EvaluationSnapshot);

    /// The evaluation finished successfully.
    fn on_complete(&self, snapshot: &EvaluationSnapshot);

    /// Tracking ended with a terminal error (job failure or timeout).
    fn on_error(&self, error: &TrackError);

    /// A non-fatal problem (channel drop, failed poll, failed persistence).
    fn on_warning(&self, error: &TrackError) {
        tracing::warn!(job_id = %error.job_id(), error = %error, "Tracking warning");
    }

    fn on_state_change(&self, _job_id: &str, _state: ConnectionState) {}
}

/// Observer callbacks as values.
#[derive(Debug, Clone)]
pub enum TrackerEvent {
    Update(EvaluationSnapshot),
    Complete(EvaluationSnapshot),
    Error(TrackError),
    Warning(TrackError),
    StateChanged { job_id: JobId, state: ConnectionState },
}

impl TrackingObserver for mpsc::UnboundedSender<TrackerEvent> {
    fn on_update(&self, snapshot: &EvaluationSnapshot) {
        let _ = self.send(TrackerEvent::Update(snapshot.clone()));
    }

    fn on_complete(&self, snapshot: &EvaluationSnapshot) {
        let _ = self.send(TrackerEvent::Complete(snapshot.clone()));
    }

    fn on_error(&self, error: &TrackError) {
        let _ = self.send(TrackerEvent::Error(error.clone()));
    }

    fn on_warning(&self, error: &TrackError) {
        let _ = self.send(TrackerEvent::Warning(error.clone()));
    }

    fn on_state_change(&self, job_id: &str, state: ConnectionState) {
        let _ = self.send(TrackerEvent::StateChanged {
            job_id: job_id.to_string(),
            state,
        });
    }
}
