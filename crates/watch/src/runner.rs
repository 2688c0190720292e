//! Lecture-range runner.
//!
//! Walks a course's lectures in order. A lecture that already has a
//! stored result is reported as-is; any other lecture gets a fresh job,
//! which is tracked to completion before the next lecture starts. The
//! first failure stops the range.

use std::sync::{Arc, Mutex};

use afe_core::rubric::Rubric;
use afe_core::types::LectureNo;
use afe_tracker::api::{ApiError, ResultQuery};
use afe_tracker::error::{TrackError, TrackerError};
use afe_tracker::events::TrackingObserver;
use afe_tracker::interpreter::EvaluationSnapshot;
use afe_tracker::manager::JobTracker;
use afe_tracker::session::{SessionOutcome, TrackingRequest};
use afe_tracker::supervisor::ConnectionState;

/// Lectures to evaluate for one course.
#[derive(Debug, Clone)]
pub struct RangeRequest {
    pub course_id: String,
    pub start_lecture: LectureNo,
    /// Inclusive.
    pub end_lecture: LectureNo,
    pub rubric: Rubric,
}

/// Where a lecture's result came from.
#[derive(Debug, Clone, PartialEq)]
pub enum LectureOutcome {
    /// The backend already held a result; no job was started.
    Stored(EvaluationSnapshot),
    /// A job ran and was tracked to completion.
    Evaluated(EvaluationSnapshot),
}

impl LectureOutcome {
    pub fn snapshot(&self) -> &EvaluationSnapshot {
        match self {
            Self::Stored(snapshot) | Self::Evaluated(snapshot) => snapshot,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LectureReport {
    pub lecture_no: LectureNo,
    pub outcome: LectureOutcome,
}

/// Errors that stop a range run.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("Invalid lecture range {start}..={end}")]
    InvalidRange { start: LectureNo, end: LectureNo },

    #[error("Backend request for lecture {lecture_no} failed: {source}")]
    Api {
        lecture_no: LectureNo,
        #[source]
        source: ApiError,
    },

    #[error("Could not track lecture {lecture_no}: {source}")]
    Tracker {
        lecture_no: LectureNo,
        #[source]
        source: TrackerError,
    },

    #[error("Lecture {lecture_no}: {source}")]
    Tracking {
        lecture_no: LectureNo,
        #[source]
        source: TrackError,
    },

    #[error("Tracking of lecture {lecture_no} was cancelled")]
    Cancelled { lecture_no: LectureNo },
}

/// Evaluate every lecture in `request`, one at a time.
///
/// Returns the reports of all lectures in order. On error, lectures
/// already finished are lost to the caller but remain stored by the
/// backend.
pub async fn evaluate_range(
    tracker: &Arc<JobTracker>,
    request: &RangeRequest,
    observer: Arc<dyn TrackingObserver>,
) -> Result<Vec<LectureReport>, RunError> {
    if request.start_lecture == 0 || request.end_lecture < request.start_lecture {
        return Err(RunError::InvalidRange {
            start: request.start_lecture,
            end: request.end_lecture,
        });
    }

    let mut reports = Vec::new();
    for lecture_no in request.start_lecture..=request.end_lecture {
        let outcome = evaluate_lecture(tracker, request, lecture_no, Arc::clone(&observer)).await?;
        reports.push(LectureReport {
            lecture_no,
            outcome,
        });
    }

    tracing::info!(
        course_id = %request.course_id,
        lectures = reports.len(),
        "Lecture range finished"
    );
    Ok(reports)
}

async fn evaluate_lecture(
    tracker: &Arc<JobTracker>,
    request: &RangeRequest,
    lecture_no: LectureNo,
    observer: Arc<dyn TrackingObserver>,
) -> Result<LectureOutcome, RunError> {
    let api = tracker.api();
    let query = ResultQuery {
        course_id: request.course_id.clone(),
        lecture_no,
    };

    match api.fetch_result(&query).await {
        Ok(stored) => {
            tracing::info!(course_id = %request.course_id, lecture_no, "Stored result found, skipping");
            return Ok(LectureOutcome::Stored(EvaluationSnapshot::from_stored(
                lecture_no, &stored,
            )));
        }
        Err(e) if e.is_not_found() => {}
        Err(e) => {
            tracing::warn!(lecture_no, error = %e, "Could not check for a stored result, evaluating");
        }
    }

    let job_id = api
        .start_job(&request.course_id, lecture_no, lecture_no)
        .await
        .map_err(|source| RunError::Api { lecture_no, source })?;
    tracing::info!(course_id = %request.course_id, lecture_no, job_id = %job_id, "Evaluation job started");

    let tracking = TrackingRequest::new(job_id, request.course_id.clone())
        .with_rubric(request.rubric.clone())
        .with_lecture(lecture_no);
    let handle = tracker
        .start_tracking(tracking, observer)
        .await
        .map_err(|source| RunError::Tracker { lecture_no, source })?;

    match handle.finished().await {
        SessionOutcome::Completed(snapshot) => Ok(LectureOutcome::Evaluated(snapshot)),
        SessionOutcome::Failed(source) => Err(RunError::Tracking { lecture_no, source }),
        SessionOutcome::Cancelled => Err(RunError::Cancelled { lecture_no }),
    }
}

/// Logs tracking progress.
///
/// Status lines are logged only when they change, so repeated
/// `job_status` frames and streamed chunks stay quiet.
#[derive(Debug, Default)]
pub struct ConsoleObserver {
    last_message: Mutex<String>,
}

impl ConsoleObserver {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TrackingObserver for ConsoleObserver {
    fn on_update(&self, snapshot: &EvaluationSnapshot) {
        let Ok(mut last) = self.last_message.lock() else {
            return;
        };
        if *last != snapshot.message {
            tracing::info!(phase = ?snapshot.phase, "{}", snapshot.message);
            last.clone_from(&snapshot.message);
        }
    }

    fn on_complete(&self, snapshot: &EvaluationSnapshot) {
        tracing::info!(
            lecture_no = ?snapshot.lecture_no,
            total_score = snapshot.total_score,
            criteria = snapshot.criteria_evaluations.len(),
            "Evaluation complete"
        );
    }

    fn on_error(&self, error: &TrackError) {
        tracing::error!(job_id = %error.job_id(), error = %error, "Evaluation failed");
    }

    fn on_state_change(&self, job_id: &str, state: ConnectionState) {
        tracing::debug!(job_id, state = ?state, "Connection state changed");
    }
}
