//! REST API client for the evaluation backend.
//!
//! [`JobApi`] is the seam the tracker talks through: job submission,
//! status polling, stored-result retrieval and result persistence.
//! [`HttpJobApi`] implements it over [`reqwest`]; tests substitute their
//! own implementation.

use std::collections::BTreeMap;
use std::time::Duration;

use afe_core::types::{JobId, JobStatus, LectureNo, WorkUnit};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::interpreter::EvaluationSnapshot;

/// Backend operations the tracker depends on.
#[async_trait]
pub trait JobApi: Send + Sync {
    /// Submit a lecture range for evaluation. Returns the new job id.
    async fn start_job(
        &self,
        course_id: &str,
        start_lecture: LectureNo,
        end_lecture: LectureNo,
    ) -> Result<JobId, ApiError>;

    /// Current status of a job.
    async fn job_status(&self, job_id: &str) -> Result<JobStatusReport, ApiError>;

    /// A previously stored evaluation result.
    async fn fetch_result(&self, query: &ResultQuery) -> Result<StoredEvaluation, ApiError>;

    /// Persist a completed evaluation.
    async fn store_result(&self, record: &EvaluationRecord) -> Result<(), ApiError>;
}

/// Errors from the REST API layer.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// The HTTP request itself failed (network, DNS, TLS, decoding).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The backend returned a non-2xx status code.
    #[error("Backend API error ({status}): {body}")]
    Status {
        status: u16,
        /// Raw response body for debugging.
        body: String,
    },
}

impl ApiError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Status { status: 404, .. })
    }
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// Body of `POST /start_job`.
#[derive(Debug, Clone, Serialize)]
pub struct StartJobRequest<'a> {
    pub course_id: &'a str,
    pub start_lecture: LectureNo,
    pub end_lecture: LectureNo,
}

/// Response of `POST /start_job`.
#[derive(Debug, Clone, Deserialize)]
pub struct StartJobResponse {
    pub job_id: JobId,
}

/// Response of `GET /job_status/{job_id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatusReport {
    pub status: JobStatus,
    #[serde(default, alias = "current_lecture")]
    pub current_unit: Option<WorkUnit>,
    #[serde(default)]
    pub error_message: Option<String>,
}

/// Query of `GET /get_result`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultQuery {
    pub course_id: String,
    pub lecture_no: LectureNo,
}

/// One criterion of a stored evaluation, as read and written by the
/// backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoredCriterion {
    pub criterion: String,
    #[serde(default)]
    pub score: f64,
    #[serde(default)]
    pub feedback: String,
    #[serde(default)]
    pub slide_images: BTreeMap<String, String>,
    #[serde(default)]
    pub slide_numbers: Vec<u32>,
    #[serde(default)]
    pub time_range: String,
    #[serde(default)]
    pub slide_content: String,
}

/// Response of `GET /get_result`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoredEvaluation {
    #[serde(default)]
    pub total_score: f64,
    #[serde(default)]
    pub criteria_scores: Vec<StoredCriterion>,
}

/// Body of `POST /store_result`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationRecord {
    pub course_id: String,
    pub lecture_no: LectureNo,
    /// Every criterion's feedback as `"<criterion>:\n<feedback>"`,
    /// joined by blank lines.
    pub response: String,
    pub total_score: f64,
    pub scores: Vec<StoredCriterion>,
}

impl EvaluationRecord {
    /// Build the persistence payload for a snapshot. `None` if the
    /// snapshot has no lecture number to file it under.
    pub fn from_snapshot(course_id: &str, snapshot: &EvaluationSnapshot) -> Option<Self> {
        let lecture_no = snapshot.lecture_no?;

        let response = snapshot
            .criteria_evaluations
            .iter()
            .map(|(criterion, eval)| format!("{criterion}:\n{}", eval.feedback))
            .collect::<Vec<_>>()
            .join("\n\n");

        let scores = snapshot
            .criteria_evaluations
            .iter()
            .map(|(criterion, eval)| StoredCriterion {
                criterion: criterion.clone(),
                score: eval.score,
                feedback: eval.feedback.clone(),
                slide_images: eval.slide_images.clone(),
                slide_numbers: eval.slide_numbers.clone(),
                time_range: eval.time_range.clone(),
                slide_content: eval.slide_content.clone(),
            })
            .collect();

        Some(Self {
            course_id: course_id.to_string(),
            lecture_no,
            response,
            total_score: snapshot.total_score,
            scores,
        })
    }
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

/// HTTP client for the evaluation backend.
pub struct HttpJobApi {
    client: reqwest::Client,
    api_url: String,
}

impl HttpJobApi {
    /// Create a client for `api_url` (e.g. `http://host:8009/afe/api`)
    /// with a per-request timeout.
    pub fn new(api_url: impl Into<String>, request_timeout: Duration) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder().timeout(request_timeout).build()?;
        Ok(Self::with_client(client, api_url))
    }

    /// Reuse an existing [`reqwest::Client`] (connection pooling).
    pub fn with_client(client: reqwest::Client, api_url: impl Into<String>) -> Self {
        let api_url = api_url.into().trim_end_matches('/').to_string();
        Self { client, api_url }
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    // ---- private helpers ----

    /// Return the response unchanged on success, or an
    /// [`ApiError::Status`] carrying the status and body text.
    async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(ApiError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    async fn parse_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ApiError> {
        let response = Self::ensure_success(response).await?;
        Ok(response.json::<T>().await?)
    }

    async fn check_status(response: reqwest::Response) -> Result<(), ApiError> {
        Self::ensure_success(response).await?;
        Ok(())
    }
}

#[async_trait]
impl JobApi for HttpJobApi {
    async fn start_job(
        &self,
        course_id: &str,
        start_lecture: LectureNo,
        end_lecture: LectureNo,
    ) -> Result<JobId, ApiError> {
        let body = StartJobRequest {
            course_id,
            start_lecture,
            end_lecture,
        };

        let response = self
            .client
            .post(format!("{}/start_job", self.api_url))
            .json(&body)
            .send()
            .await?;

        let started: StartJobResponse = Self::parse_response(response).await?;
        tracing::info!(job_id = %started.job_id, course_id, start_lecture, end_lecture, "Job started");
        Ok(started.job_id)
    }

    async fn job_status(&self, job_id: &str) -> Result<JobStatusReport, ApiError> {
        let response = self
            .client
            .get(format!("{}/job_status/{}", self.api_url, job_id))
            .send()
            .await?;

        Self::parse_response(response).await
    }

    async fn fetch_result(&self, query: &ResultQuery) -> Result<StoredEvaluation, ApiError> {
        let response = self
            .client
            .get(format!("{}/get_result", self.api_url))
            .query(query)
            .send()
            .await?;

        Self::parse_response(response).await
    }

    async fn store_result(&self, record: &EvaluationRecord) -> Result<(), ApiError> {
        let response = self
            .client
            .post(format!("{}/store_result", self.api_url))
            .json(record)
            .send()
            .await?;

        Self::check_status(response).await
    }
}
