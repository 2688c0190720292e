//! WebSocket message type names for the evaluation progress channel.
//!
//! Server frames carry one of these in their `"type"` field; the
//! client sends [`MSG_TYPE_HEARTBEAT`] as its keep-alive frame.

/// The job is waiting in the backend queue.
pub const MSG_TYPE_QUEUE_STATUS: &str = "queue_status";

/// Processing status update (current lecture).
pub const MSG_TYPE_JOB_STATUS: &str = "job_status";

/// Transcription of a lecture recording has started.
pub const MSG_TYPE_TRANSCRIPTION_START: &str = "transcription_start";

/// A new lecture within the job has started; previous results are void.
pub const MSG_TYPE_NEW_LECTURE_START: &str = "new_lecture_start";

/// Lecture metadata; marks the start of a fresh evaluation.
pub const MSG_TYPE_METADATA: &str = "metadata";

/// Evaluation of a single criterion has started.
pub const MSG_TYPE_CRITERION_START: &str = "criterion_start";

/// A streamed fragment of feedback text for one criterion.
pub const MSG_TYPE_ANALYSIS_CHUNK: &str = "analysis_chunk";

/// A criterion finished with its score and final feedback.
pub const MSG_TYPE_CRITERION_COMPLETE: &str = "criterion_complete";

/// The whole evaluation finished.
pub const MSG_TYPE_COMPLETE: &str = "complete";

/// The job failed.
pub const MSG_TYPE_ERROR: &str = "error";

/// Keep-alive, sent by the client and echoed by the server.
pub const MSG_TYPE_HEARTBEAT: &str = "heartbeat";

/// Notification channel: re-attach tracking to the given session.
pub const MSG_TYPE_RECONNECT: &str = "reconnect";
