//! HTTP status polling, used once a progress channel has spent its
//! reconnect budget.
//!
//! [`PollingFallback`] owns the poll interval for one job. The session
//! driver waits on [`tick`](PollingFallback::tick) and then calls
//! [`poll`](PollingFallback::poll), which performs one status request
//! and classifies the answer as a [`PollStep`]. After a terminal step,
//! or after [`stop`](PollingFallback::stop), the fallback never ticks
//! again.

use std::time::Duration;

use afe_core::types::{JobId, JobStatus, LectureNo};
use tokio::time::{Instant, Interval, MissedTickBehavior};

use crate::api::{JobApi, JobStatusReport, ResultQuery, StoredEvaluation};

/// Classified result of one poll.
#[derive(Debug, Clone, PartialEq)]
pub enum PollStep {
    /// The job is queued or running.
    Progress { report: JobStatusReport, attempt: u32 },
    /// The job completed. Carries the stored result when it could be
    /// fetched.
    Completed {
        stored: Option<(LectureNo, StoredEvaluation)>,
    },
    /// The backend reports the job as failed.
    Failed(String),
    /// The status request failed; try again next tick.
    Retry(String),
}

pub struct PollingFallback {
    job_id: JobId,
    course_id: String,
    /// Lecture to fetch when the status report does not name one.
    fallback_lecture: Option<LectureNo>,
    interval: Interval,
    attempts: u32,
    stopped: bool,
}

impl PollingFallback {
    /// The first poll happens one `period` after creation.
    pub fn new(
        job_id: impl Into<JobId>,
        course_id: impl Into<String>,
        fallback_lecture: Option<LectureNo>,
        period: Duration,
    ) -> Self {
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        Self {
            job_id: job_id.into(),
            course_id: course_id.into(),
            fallback_lecture,
            interval,
            attempts: 0,
            stopped: false,
        }
    }

    /// Status requests issued so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Idempotent.
    pub fn stop(&mut self) {
        if !self.stopped {
            tracing::debug!(job_id = %self.job_id, attempts = self.attempts, "Polling stopped");
        }
        self.stopped = true;
    }

    /// Wait for the next poll tick. Pends forever once stopped.
    pub async fn tick(&mut self) {
        if self.stopped {
            std::future::pending::<()>().await;
        }
        self.interval.tick().await;
    }

    /// Issue one status request. A terminal step stops the fallback.
    pub async fn poll(&mut self, api: &dyn JobApi) -> PollStep {
        self.attempts += 1;
        let attempt = self.attempts;

        let report = match api.job_status(&self.job_id).await {
            Ok(report) => report,
            Err(e) => {
                tracing::warn!(job_id = %self.job_id, attempt, error = %e, "Status poll failed");
                return PollStep::Retry(e.to_string());
            }
        };

        tracing::debug!(job_id = %self.job_id, attempt, status = ?report.status, "Polled job status");

        match report.status {
            JobStatus::Queued | JobStatus::InProgress => PollStep::Progress { report, attempt },
            JobStatus::Failed => {
                self.stop();
                PollStep::Failed(
                    report
                        .error_message
                        .unwrap_or_else(|| "job reported FAILED".to_string()),
                )
            }
            JobStatus::Completed => {
                self.stop();
                let lecture_no = report
                    .current_unit
                    .as_ref()
                    .and_then(|unit| unit.as_lecture_no())
                    .or(self.fallback_lecture);
                let stored = match lecture_no {
                    Some(lecture_no) => self.fetch_stored(api, lecture_no).await,
                    None => None,
                };
                PollStep::Completed { stored }
            }
        }
    }

    async fn fetch_stored(
        &self,
        api: &dyn JobApi,
        lecture_no: LectureNo,
    ) -> Option<(LectureNo, StoredEvaluation)> {
        let query = ResultQuery {
            course_id: self.course_id.clone(),
            lecture_no,
        };
        match api.fetch_result(&query).await {
            Ok(stored) => Some((lecture_no, stored)),
            Err(e) => {
                tracing::warn!(
                    job_id = %self.job_id,
                    lecture_no,
                    error = %e,
                    "Failed to fetch stored result after completion",
                );
                None
            }
        }
    }
}
