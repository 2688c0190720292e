#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use afe_core::types::{JobId, JobStatus, LectureNo, WorkUnit};
use afe_tracker::api::{
    ApiError, EvaluationRecord, JobApi, JobStatusReport, ResultQuery, StoredCriterion,
    StoredEvaluation,
};
use afe_tracker::client::{Channel, Transport, TransportError};
use afe_tracker::config::TrackerConfig;
use afe_tracker::events::TrackerEvent;
use afe_tracker::messages::OutboundFrame;
use afe_tracker::reconnect::ReconnectConfig;
use afe_tracker::supervisor::ConnectionState;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Tracker config with production timings, except a short reconnect
/// backoff so budget exhaustion happens well inside the timeout.
pub fn test_config() -> TrackerConfig {
    TrackerConfig {
        reconnect: ReconnectConfig {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(2),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// A `{"type": kind, "data": data}` frame.
pub fn frame(kind: &str, data: serde_json::Value) -> String {
    serde_json::json!({ "type": kind, "data": data }).to_string()
}

/// The frames of the single-criterion evaluation of lecture 3.
pub fn lecture_three_frames() -> Vec<String> {
    use serde_json::json;
    vec![
        frame("metadata", json!({ "lecture_no": 3 })),
        frame("criterion_start", json!({ "criterion": "Clarity" })),
        frame("analysis_chunk", json!({ "criterion": "Clarity", "chunk": "Good " })),
        frame("analysis_chunk", json!({ "criterion": "Clarity", "chunk": "pacing." })),
        frame("criterion_complete", json!({ "criterion": "Clarity", "score": 4 })),
        frame("complete", json!({})),
    ]
}

// ---------------------------------------------------------------------------
// Scripted transport
// ---------------------------------------------------------------------------

/// What happens after a channel has delivered its scripted frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum End {
    /// The peer closes the channel.
    Close,
    /// The channel stays open and silent.
    Hang,
    /// The channel stays silent for this long, then the peer closes it.
    CloseAfter(Duration),
}

/// Behaviour of one `open()` call.
#[derive(Debug, Clone)]
pub enum Script {
    Fail,
    Accept { frames: Vec<String>, end: End },
}

impl Script {
    pub fn accept(frames: Vec<String>, end: End) -> Self {
        Self::Accept { frames, end }
    }
}

#[derive(Default)]
struct Stats {
    opens: AtomicU32,
    live: AtomicI32,
    max_live: AtomicI32,
    sent: Mutex<Vec<String>>,
}

/// Transport that plays back one [`Script`] per `open()` call and fails
/// once the scripts run out.
pub struct MockTransport {
    scripts: Mutex<VecDeque<Script>>,
    stats: Arc<Stats>,
}

impl MockTransport {
    pub fn new(scripts: Vec<Script>) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into()),
            stats: Arc::new(Stats::default()),
        })
    }

    pub fn always_fail() -> Arc<Self> {
        Self::new(Vec::new())
    }

    pub fn opens(&self) -> u32 {
        self.stats.opens.load(Ordering::SeqCst)
    }

    /// Channels currently alive (opened and not yet dropped).
    pub fn live(&self) -> i32 {
        self.stats.live.load(Ordering::SeqCst)
    }

    pub fn max_live(&self) -> i32 {
        self.stats.max_live.load(Ordering::SeqCst)
    }

    /// Every frame sent on any channel, in order.
    pub fn sent(&self) -> Vec<String> {
        self.stats.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(&self) -> Result<Box<dyn Channel>, TransportError> {
        self.stats.opens.fetch_add(1, Ordering::SeqCst);
        let script = self.scripts.lock().unwrap().pop_front().unwrap_or(Script::Fail);

        match script {
            Script::Fail => Err(TransportError::Connection("connection refused".into())),
            Script::Accept { frames, end } => {
                let live = self.stats.live.fetch_add(1, Ordering::SeqCst) + 1;
                self.stats.max_live.fetch_max(live, Ordering::SeqCst);
                Ok(Box::new(MockChannel {
                    frames: frames.into(),
                    end,
                    stats: Arc::clone(&self.stats),
                }))
            }
        }
    }
}

struct MockChannel {
    frames: VecDeque<String>,
    end: End,
    stats: Arc<Stats>,
}

#[async_trait]
impl Channel for MockChannel {
    async fn send(&mut self, frame: OutboundFrame) -> Result<(), TransportError> {
        self.stats.sent.lock().unwrap().push(frame.to_text());
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<String, TransportError>> {
        if let Some(text) = self.frames.pop_front() {
            return Some(Ok(text));
        }
        match self.end {
            End::Close => None,
            End::Hang => std::future::pending().await,
            End::CloseAfter(after) => {
                tokio::time::sleep(after).await;
                None
            }
        }
    }

    async fn close(&mut self) {}
}

impl Drop for MockChannel {
    fn drop(&mut self) {
        self.stats.live.fetch_sub(1, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// Scripted backend API
// ---------------------------------------------------------------------------

/// In-memory backend. Status answers are served from a queue; the last
/// one repeats forever.
#[derive(Default)]
pub struct MockApi {
    statuses: Mutex<VecDeque<Result<JobStatusReport, u16>>>,
    stored: Mutex<Option<StoredEvaluation>>,
    store_status: Mutex<Option<u16>>,
    next_job: AtomicU32,
    records: Mutex<Vec<EvaluationRecord>>,
    pub queries: Mutex<Vec<ResultQuery>>,
    pub started: Mutex<Vec<(String, LectureNo, LectureNo)>>,
    status_calls: AtomicU32,
}

impl MockApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_statuses(statuses: Vec<Result<JobStatusReport, u16>>) -> Arc<Self> {
        let api = Self::default();
        *api.statuses.lock().unwrap() = statuses.into();
        Arc::new(api)
    }

    pub fn set_stored(&self, stored: StoredEvaluation) {
        *self.stored.lock().unwrap() = Some(stored);
    }

    /// Make `store_result` answer with this HTTP status.
    pub fn fail_store_with(&self, status: u16) {
        *self.store_status.lock().unwrap() = Some(status);
    }

    pub fn status_calls(&self) -> u32 {
        self.status_calls.load(Ordering::SeqCst)
    }

    pub fn records(&self) -> Vec<EvaluationRecord> {
        self.records.lock().unwrap().clone()
    }
}

pub fn status(status: JobStatus, lecture: Option<u64>) -> JobStatusReport {
    JobStatusReport {
        status,
        current_unit: lecture.map(WorkUnit::Number),
        error_message: None,
    }
}

pub fn stored_evaluation(score: f64) -> StoredEvaluation {
    StoredEvaluation {
        total_score: score,
        criteria_scores: vec![StoredCriterion {
            criterion: "Clarity".into(),
            score,
            feedback: "Stored feedback.".into(),
            ..Default::default()
        }],
    }
}

fn http_error(status: u16) -> ApiError {
    ApiError::Status {
        status,
        body: "scripted failure".into(),
    }
}

#[async_trait]
impl JobApi for MockApi {
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
        let n = self.next_job.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("job-{n}"))
    }

    async fn job_status(&self, _job_id: &str) -> Result<JobStatusReport, ApiError> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        let mut statuses = self.statuses.lock().unwrap();
        let next = if statuses.len() > 1 {
            statuses.pop_front()
        } else {
            statuses.front().cloned()
        };
        match next {
            Some(Ok(report)) => Ok(report),
            Some(Err(code)) => Err(http_error(code)),
            None => Ok(status(JobStatus::InProgress, None)),
        }
    }

    async fn fetch_result(&self, query: &ResultQuery) -> Result<StoredEvaluation, ApiError> {
        self.queries.lock().unwrap().push(query.clone());
        self.stored.lock().unwrap().clone().ok_or_else(|| http_error(404))
    }

    async fn store_result(&self, record: &EvaluationRecord) -> Result<(), ApiError> {
        if let Some(code) = *self.store_status.lock().unwrap() {
            return Err(http_error(code));
        }
        self.records.lock().unwrap().push(record.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Observer helpers
// ---------------------------------------------------------------------------

pub fn drain(rx: &mut mpsc::UnboundedReceiver<TrackerEvent>) -> Vec<TrackerEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

pub fn states(events: &[TrackerEvent]) -> Vec<ConnectionState> {
    events
        .iter()
        .filter_map(|event| match event {
            TrackerEvent::StateChanged { state, .. } => Some(*state),
            _ => None,
        })
        .collect()
}

pub fn count_completes(events: &[TrackerEvent]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, TrackerEvent::Complete(_)))
        .count()
}

pub fn count_errors(events: &[TrackerEvent]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, TrackerEvent::Error(_)))
        .count()
}
