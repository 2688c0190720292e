//! Progress channel message types and parser.
//!
//! The backend sends JSON frames shaped `{"type": "<kind>", "data":
//! {...}}`. [`parse_message`] turns them into a closed
//! [`ProgressEvent`] enum. Tags this client does not know about land in
//! [`ProgressEvent::Unknown`] rather than failing the parse.
//!
//! Outbound frames are [`OutboundFrame`]s: the raw job id as the first
//! message, then periodic heartbeats. The notification channel opens
//! with the raw client session id instead.

use std::collections::BTreeMap;

use afe_core::message_types::*;
use afe_core::types::{lenient_lecture_no, LectureNo, WorkUnit};
use serde::de::DeserializeOwned;
use serde::Deserialize;

/// All progress events the evaluation backend emits.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    /// The job is queued behind other work.
    QueueStatus(QueueStatusData),

    /// Processing status (current lecture).
    JobStatus(JobStatusData),

    /// Transcription of a lecture started.
    TranscriptionStart(LectureData),

    /// A new lecture started; everything accumulated so far is stale.
    NewLectureStart(LectureData),

    /// Lecture metadata, sent right before criteria are evaluated.
    Metadata(MetadataData),

    /// A criterion started evaluating.
    CriterionStart(CriterionStartData),

    /// A fragment of streamed feedback for one criterion.
    AnalysisChunk(AnalysisChunkData),

    /// A criterion finished.
    CriterionComplete(CriterionCompleteData),

    /// The evaluation finished.
    Complete,

    /// The job failed.
    Error(ErrorData),

    /// Keep-alive reply. Never forwarded to the interpreter.
    Heartbeat,

    /// A tag this client does not recognise.
    Unknown { kind: String },
}

/// Payload for `queue_status`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct QueueStatusData {
    #[serde(default)]
    pub position: Option<u32>,
    #[serde(default)]
    pub session_id: Option<String>,
}

/// Payload for `job_status`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct JobStatusData {
    #[serde(default)]
    pub status: Option<String>,
    /// The backend has used both names for this field.
    #[serde(default, alias = "current_lecture")]
    pub current_unit: Option<WorkUnit>,
}

/// Payload for `transcription_start` and `new_lecture_start`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct LectureData {
    #[serde(default, deserialize_with = "lenient_lecture_no")]
    pub lecture_no: Option<LectureNo>,
}

/// Payload for `metadata`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct MetadataData {
    #[serde(default, deserialize_with = "lenient_lecture_no")]
    pub lecture_no: Option<LectureNo>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub degree: Option<String>,
    #[serde(default)]
    pub topic: Option<String>,
}

/// Payload for `criterion_start`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CriterionStartData {
    pub criterion: String,
    #[serde(default, deserialize_with = "lenient_lecture_no")]
    pub lecture_no: Option<LectureNo>,
}

/// Payload for `analysis_chunk`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AnalysisChunkData {
    pub criterion: String,
    #[serde(default)]
    pub chunk: String,
    /// Optional 0-based position of this chunk within its criterion.
    /// When absent, arrival order is authoritative.
    #[serde(default)]
    pub seq: Option<u64>,
}

/// Payload for `criterion_complete`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CriterionCompleteData {
    pub criterion: String,
    #[serde(default)]
    pub score: f64,
    /// Authoritative full feedback text; replaces streamed chunks when
    /// present and non-empty.
    #[serde(default)]
    pub full_analysis: Option<String>,
    #[serde(default)]
    pub slide_images: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub slide_numbers: Option<Vec<u32>>,
    #[serde(default)]
    pub time_range: Option<String>,
}

/// Payload for `error`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ErrorData {
    #[serde(default)]
    pub message: String,
}

/// Untyped envelope, decoded first so unknown tags can be routed.
#[derive(Deserialize)]
struct RawFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: serde_json::Value,
}

/// Parse a progress channel text frame into a typed event.
///
/// Returns `Err` for malformed JSON or a payload that does not match
/// its tag. Unknown tags are `Ok(ProgressEvent::Unknown { .. })`.
pub fn parse_message(text: &str) -> Result<ProgressEvent, serde_json::Error> {
    let RawFrame { kind, data } = serde_json::from_str(text)?;

    let event = match kind.as_str() {
        MSG_TYPE_QUEUE_STATUS => ProgressEvent::QueueStatus(payload(data)?),
        MSG_TYPE_JOB_STATUS => ProgressEvent::JobStatus(payload(data)?),
        MSG_TYPE_TRANSCRIPTION_START => ProgressEvent::TranscriptionStart(payload(data)?),
        MSG_TYPE_NEW_LECTURE_START => ProgressEvent::NewLectureStart(payload(data)?),
        MSG_TYPE_METADATA => ProgressEvent::Metadata(payload(data)?),
        MSG_TYPE_CRITERION_START => ProgressEvent::CriterionStart(payload(data)?),
        MSG_TYPE_ANALYSIS_CHUNK => ProgressEvent::AnalysisChunk(payload(data)?),
        MSG_TYPE_CRITERION_COMPLETE => ProgressEvent::CriterionComplete(payload(data)?),
        MSG_TYPE_COMPLETE => ProgressEvent::Complete,
        MSG_TYPE_ERROR => ProgressEvent::Error(payload(data)?),
        MSG_TYPE_HEARTBEAT => ProgressEvent::Heartbeat,
        _ => ProgressEvent::Unknown { kind },
    };

    Ok(event)
}

/// Decode a payload, treating a missing `data` field as `{}`.
fn payload<T: DeserializeOwned>(data: serde_json::Value) -> Result<T, serde_json::Error> {
    if data.is_null() {
        serde_json::from_value(serde_json::Value::Object(Default::default()))
    } else {
        serde_json::from_value(data)
    }
}

/// Frames the client sends on the progress channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    /// First message after connecting: the bare job id, not JSON.
    JobId(String),
    /// First message on the notification channel: the bare session id.
    SessionId(String),
    /// Keep-alive frame.
    Heartbeat,
}

impl OutboundFrame {
    /// Text to put on the wire.
    pub fn to_text(&self) -> String {
        match self {
            Self::JobId(id) | Self::SessionId(id) => id.clone(),
            Self::Heartbeat => {
                serde_json::json!({ "type": MSG_TYPE_HEARTBEAT }).to_string()
            }
        }
    }
}
