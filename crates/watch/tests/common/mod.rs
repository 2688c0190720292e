//! Shared fakes for runner tests: a transport that answers each job id
//! with a scripted frame sequence, and an in-memory backend.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use afe_core::types::{JobId, JobStatus, LectureNo};
use afe_tracker::api::{
    ApiError, EvaluationRecord, JobApi, JobStatusReport, ResultQuery, StoredCriterion,
    StoredEvaluation,
};
use afe_tracker::client::{Channel, Transport, TransportError};
use afe_tracker::messages::OutboundFrame;
use async_trait::async_trait;
use serde_json::json;

pub fn frame(kind: &str, data: serde_json::Value) -> String {
    json!({ "type": kind, "data": data }).to_string()
}

/// A one-criterion evaluation of `lecture_no` scoring `score`.
pub fn evaluation_frames(lecture_no: LectureNo, score: f64) -> Vec<String> {
    vec![
        frame("metadata", json!({ "lecture_no": lecture_no, "topic": "Ownership" })),
        frame("criterion_start", json!({ "criterion": "Clarity" })),
        frame("analysis_chunk", json!({ "criterion": "Clarity", "chunk": "Well paced." })),
        frame("criterion_complete", json!({ "criterion": "Clarity", "score": score })),
        frame("complete", json!({})),
    ]
}

pub fn failure_frames(message: &str) -> Vec<String> {
    vec![frame("error", json!({ "message": message }))]
}

/// The id [`FakeBackend::start_job`] hands out for a lecture.
pub fn job_id_for(lecture_no: LectureNo) -> JobId {
    format!("job-{lecture_no}")
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

type Scripts = Arc<Mutex<HashMap<JobId, VecDeque<Vec<String>>>>>;

/// Replies to the job id frame with the frames registered for that job,
/// then stays silent. A job scripted more than once plays one script per
/// channel; the last one repeats.
#[derive(Default)]
pub struct ScriptedTransport {
    scripts: Scripts,
    opens: AtomicU32,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(&self, job_id: impl Into<JobId>, frames: Vec<String>) {
        self.scripts
            .lock()
            .unwrap()
            .entry(job_id.into())
            .or_default()
            .push_back(frames);
    }

    pub fn opens(&self) -> u32 {
        self.opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn open(&self) -> Result<Box<dyn Channel>, TransportError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedChannel {
            scripts: Arc::clone(&self.scripts),
            pending: VecDeque::new(),
        }))
    }
}

struct ScriptedChannel {
    scripts: Scripts,
    pending: VecDeque<String>,
}

#[async_trait]
impl Channel for ScriptedChannel {
    async fn send(&mut self, frame: OutboundFrame) -> Result<(), TransportError> {
        if let OutboundFrame::JobId(job_id) = frame {
            let frames = self.scripts.lock().unwrap().get_mut(&job_id).and_then(|queue| {
                if queue.len() > 1 {
                    queue.pop_front()
                } else {
                    queue.front().cloned()
                }
            });
            self.pending.extend(frames.unwrap_or_default());
        }
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<String, TransportError>> {
        match self.pending.pop_front() {
            Some(text) => Some(Ok(text)),
            None => std::future::pending().await,
        }
    }

    async fn close(&mut self) {}
}

// ---------------------------------------------------------------------------
// Backend
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct FakeBackend {
    stored: Mutex<HashMap<LectureNo, StoredEvaluation>>,
    /// `(course_id, start, end)` of every submitted job.
    pub started: Mutex<Vec<(String, LectureNo, LectureNo)>>,
    pub records: Mutex<Vec<EvaluationRecord>>,
    /// Status code returned by `fetch_result` for lectures with no
    /// stored result.
    missing_status: Mutex<u16>,
}

impl FakeBackend {
    pub fn new() -> Arc<Self> {
        let backend = Self::default();
        *backend.missing_status.lock().unwrap() = 404;
        Arc::new(backend)
    }

    pub fn store(&self, lecture_no: LectureNo, total_score: f64) {
        let evaluation = StoredEvaluation {
            total_score,
            criteria_scores: vec![StoredCriterion {
                criterion: "Clarity".into(),
                score: total_score,
                feedback: "Stored feedback.".into(),
                ..Default::default()
            }],
        };
        self.stored.lock().unwrap().insert(lecture_no, evaluation);
    }

    pub fn fail_lookups_with(&self, status: u16) {
        *self.missing_status.lock().unwrap() = status;
    }

    pub fn started_lectures(&self) -> Vec<LectureNo> {
        self.started.lock().unwrap().iter().map(|(_, start, _)| *start).collect()
    }
}

#[async_trait]
impl JobApi for FakeBackend {
    async fn start_job(
        &self,
        course_id: &str,
        start_lecture: LectureNo,
        end_lecture: LectureNo,
    ) -> Result<JobId, ApiError> {
        self.started
            .lock()
            .unwrap()
            .push((course_id.to_string(), start_lecture, end_lecture));
        Ok(job_id_for(start_lecture))
    }

    async fn job_status(&self, _job_id: &str) -> Result<JobStatusReport, ApiError> {
        Ok(JobStatusReport {
            status: JobStatus::InProgress,
            current_unit: None,
            error_message: None,
        })
    }

    async fn fetch_result(&self, query: &ResultQuery) -> Result<StoredEvaluation, ApiError> {
        match self.stored.lock().unwrap().get(&query.lecture_no) {
            Some(stored) => Ok(stored.clone()),
            None => Err(ApiError::Status {
                status: *self.missing_status.lock().unwrap(),
                body: "no result".into(),
            }),
        }
    }

    async fn store_result(&self, record: &EvaluationRecord) -> Result<(), ApiError> {
        self.records.lock().unwrap().push(record.clone());
        Ok(())
    }
}
