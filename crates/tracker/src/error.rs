use std::time::Duration;

use afe_core::types::JobId;

/// Errors surfaced to tracking observers. Every variant names the job.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TrackError {
    /// The progress channel failed. Recovered by reconnecting, so this
    /// only reaches observers as a warning.
    #[error("Progress channel error for job {job_id}: {message}")]
    Transport { job_id: JobId, message: String },

    /// A status poll failed. Retried on the next tick.
    #[error("Status poll failed for job {job_id}: {message}")]
    Polling { job_id: JobId, message: String },

    /// The backend reported the job as failed. Terminal.
    #[error("Job {job_id} failed: {message}")]
    JobFailure { job_id: JobId, message: String },

    /// The job did not finish within the tracking timeout. Terminal.
    #[error("Job {job_id} timed out after {}s", elapsed.as_secs())]
    Timeout { job_id: JobId, elapsed: Duration },

    /// Storing the completed result failed. The result is still
    /// delivered, so this is a warning.
    #[error("Failed to persist result of job {job_id}: {message}")]
    Persistence { job_id: JobId, message: String },
}

impl TrackError {
    pub fn job_id(&self) -> &str {
        match self {
            Self::Transport { job_id, .. }
            | Self::Polling { job_id, .. }
            | Self::JobFailure { job_id, .. }
            | Self::Timeout { job_id, .. }
            | Self::Persistence { job_id, .. } => job_id,
        }
    }

    /// `true` for errors that end the tracking session.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::JobFailure { .. } | Self::Timeout { .. })
    }
}

/// Misuse of the [`JobTracker`](crate::manager::JobTracker).
#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    #[error("Job {0} is not being tracked")]
    UnknownJob(JobId),

    /// The job already completed or failed. It is not tracked again.
    #[error("Job {0} has already finished")]
    AlreadyFinished(JobId),

    #[error("Tracker is shut down")]
    ShutDown,
}
