//! Folds progress events into the evaluation snapshot.
//!
//! [`EventInterpreter`] owns the [`EvaluationSnapshot`] for one tracking
//! session. Each [`ProgressEvent`] is applied in arrival order and the
//! returned [`Interpretation`] tells the session what happened: the
//! snapshot changed, the event was ignored, the evaluation completed,
//! or the job failed.
//!
//! `new_lecture_start` and `metadata` are authoritative checkpoints:
//! they discard all accumulated criteria, which is what makes a channel
//! that reconnects mid-stream converge on the right result.

use std::collections::{BTreeMap, HashMap};

use afe_core::rubric::{Rubric, RubricEntry};
use afe_core::types::{LectureNo, WorkUnit};
use serde::{Deserialize, Serialize};

use crate::api::{JobStatusReport, StoredEvaluation};
use crate::messages::{
    AnalysisChunkData, CriterionCompleteData, CriterionStartData, ProgressEvent,
};

/// Coarse phase of the evaluation, as shown to the user.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackingPhase {
    #[default]
    Idle,
    Queued,
    Processing,
    Evaluating,
    Completed,
    Failed,
}

/// Accumulated feedback and score for one criterion.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CriterionEvaluation {
    pub feedback: String,
    pub score: f64,
    /// Set once the criterion has a final score; only scored criteria
    /// count towards the total.
    #[serde(default)]
    pub scored: bool,
    #[serde(default)]
    pub slide_images: BTreeMap<String, String>,
    #[serde(default)]
    pub slide_numbers: Vec<u32>,
    #[serde(default)]
    pub slide_content: String,
    #[serde(default)]
    pub time_range: String,
    #[serde(default)]
    pub rubric: Option<RubricEntry>,
}

/// Serializable view state of one tracked evaluation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvaluationSnapshot {
    pub phase: TrackingPhase,
    /// Human-readable status line.
    pub message: String,
    pub queue_position: Option<u32>,
    pub current_unit: Option<WorkUnit>,
    pub lecture_no: Option<LectureNo>,
    pub name: Option<String>,
    pub degree: Option<String>,
    pub topic: Option<String>,
    pub criteria_evaluations: BTreeMap<String, CriterionEvaluation>,
    /// Mean score over scored criteria.
    pub total_score: f64,
    /// `true` between `metadata` and completion: this result was produced
    /// live and has not been persisted yet.
    pub is_new_evaluation: bool,
    pub evaluation_complete: bool,
}

impl EvaluationSnapshot {
    /// Build a completed snapshot from a result already held by the
    /// backend. It is not a new evaluation and will not be re-persisted.
    pub fn from_stored(lecture_no: LectureNo, stored: &StoredEvaluation) -> Self {
        let criteria_evaluations = stored
            .criteria_scores
            .iter()
            .map(|c| {
                let evaluation = CriterionEvaluation {
                    feedback: c.feedback.clone(),
                    score: c.score,
                    scored: true,
                    slide_images: c.slide_images.clone(),
                    slide_numbers: c.slide_numbers.clone(),
                    slide_content: c.slide_content.clone(),
                    time_range: c.time_range.clone(),
                    rubric: None,
                };
                (c.criterion.clone(), evaluation)
            })
            .collect();

        Self {
            phase: TrackingPhase::Completed,
            message: format!("Lecture {lecture_no} evaluated"),
            lecture_no: Some(lecture_no),
            current_unit: Some(WorkUnit::from(lecture_no)),
            criteria_evaluations,
            total_score: stored.total_score,
            evaluation_complete: true,
            ..Default::default()
        }
    }

    fn recompute_total(&mut self) {
        let scores: Vec<f64> = self
            .criteria_evaluations
            .values()
            .filter(|c| c.scored)
            .map(|c| c.score)
            .collect();
        self.total_score = if scores.is_empty() {
            0.0
        } else {
            scores.iter().sum::<f64>() / scores.len() as f64
        };
    }
}

/// Outcome of applying one event.
#[derive(Debug, Clone, PartialEq)]
pub enum Interpretation {
    /// The snapshot changed.
    Updated,
    /// Nothing to do (heartbeat, unknown tag, chunk held for ordering).
    Ignored,
    /// The backend declared the evaluation complete.
    Completed,
    /// The backend reported an error.
    Failed(String),
}

/// Re-orders sequenced chunks for one criterion.
#[derive(Debug, Default)]
struct ChunkSequencer {
    next: u64,
    held: BTreeMap<u64, String>,
}

impl ChunkSequencer {
    /// Accept chunk `seq`, returning every chunk now ready to append, in
    /// order. Duplicates and already-applied positions are dropped.
    fn accept(&mut self, seq: u64, chunk: String) -> Vec<String> {
        if seq < self.next || self.held.contains_key(&seq) {
            return Vec::new();
        }
        self.held.insert(seq, chunk);

        let mut ready = Vec::new();
        while let Some(chunk) = self.held.remove(&self.next) {
            ready.push(chunk);
            self.next += 1;
        }
        ready
    }

    /// Everything still held, in sequence order, ignoring gaps.
    fn drain(&mut self) -> Vec<String> {
        std::mem::take(&mut self.held).into_values().collect()
    }
}

/// Event fold for one tracking session.
#[derive(Debug, Default)]
pub struct EventInterpreter {
    snapshot: EvaluationSnapshot,
    rubric: Rubric,
    sequencers: HashMap<String, ChunkSequencer>,
}

impl EventInterpreter {
    pub fn new(rubric: Rubric) -> Self {
        Self {
            rubric,
            ..Default::default()
        }
    }

    pub fn snapshot(&self) -> &EvaluationSnapshot {
        &self.snapshot
    }

    /// Apply one progress event.
    pub fn apply(&mut self, event: ProgressEvent) -> Interpretation {
        match event {
            ProgressEvent::QueueStatus(data) => {
                self.snapshot.phase = TrackingPhase::Queued;
                self.snapshot.queue_position = data.position;
                self.snapshot.message = match data.position {
                    Some(position) => format!("Queued (position {position})..."),
                    None => "Queued, waiting for processing to start...".to_string(),
                };
                Interpretation::Updated
            }
            ProgressEvent::JobStatus(data) => {
                self.mark_processing(data.current_unit);
                Interpretation::Updated
            }
            ProgressEvent::TranscriptionStart(data) => {
                self.snapshot.phase = TrackingPhase::Processing;
                self.snapshot.queue_position = None;
                self.snapshot.message = format!("Transcribing Lecture {}...", lecture(data.lecture_no));
                Interpretation::Updated
            }
            ProgressEvent::NewLectureStart(data) => {
                self.sequencers.clear();
                self.snapshot = EvaluationSnapshot {
                    phase: TrackingPhase::Processing,
                    message: format!("Starting Lecture {}...", lecture(data.lecture_no)),
                    lecture_no: data.lecture_no,
                    ..Default::default()
                };
                Interpretation::Updated
            }
            ProgressEvent::Metadata(data) => {
                self.sequencers.clear();
                let snapshot = &mut self.snapshot;
                snapshot.phase = TrackingPhase::Evaluating;
                snapshot.queue_position = None;
                if data.lecture_no.is_some() {
                    snapshot.lecture_no = data.lecture_no;
                }
                snapshot.name = data.name;
                snapshot.degree = data.degree;
                snapshot.topic = data.topic;
                snapshot.criteria_evaluations.clear();
                snapshot.total_score = 0.0;
                snapshot.is_new_evaluation = true;
                snapshot.evaluation_complete = false;
                Interpretation::Updated
            }
            ProgressEvent::CriterionStart(data) => self.start_criterion(data),
            ProgressEvent::AnalysisChunk(data) => self.append_chunk(data),
            ProgressEvent::CriterionComplete(data) => self.complete_criterion(data),
            ProgressEvent::Complete => Interpretation::Completed,
            ProgressEvent::Error(data) => {
                self.snapshot.phase = TrackingPhase::Failed;
                self.snapshot.message = data.message.clone();
                Interpretation::Failed(data.message)
            }
            ProgressEvent::Heartbeat => Interpretation::Ignored,
            ProgressEvent::Unknown { kind } => {
                tracing::debug!(kind = %kind, "Ignoring unknown progress event");
                Interpretation::Ignored
            }
        }
    }

    /// Fold a polled IN_PROGRESS/QUEUED status. Polling carries no
    /// per-criterion detail, only the current unit of work.
    pub fn apply_polled_status(&mut self, report: &JobStatusReport, attempt: u32) {
        self.mark_processing(report.current_unit.clone());
        self.snapshot.message = format!(
            "Processing Lecture {}... (Polling attempt: {attempt})",
            report
                .current_unit
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_else(|| "?".to_string()),
        );
    }

    /// Replace the snapshot with a result fetched from storage.
    pub fn load_stored(&mut self, lecture_no: LectureNo, stored: &StoredEvaluation) {
        self.sequencers.clear();
        self.snapshot = EvaluationSnapshot::from_stored(lecture_no, stored);
    }

    /// Settle a completion observed by polling. The backend already holds
    /// the result, so the snapshot is never marked for persistence.
    pub fn complete_from_poll(&mut self, stored: Option<(LectureNo, StoredEvaluation)>) {
        match stored {
            Some((lecture_no, stored)) => self.load_stored(lecture_no, &stored),
            None => self.snapshot.is_new_evaluation = false,
        }
    }

    /// Record that the evaluation finished and has been handed off.
    pub fn mark_complete(&mut self) {
        self.snapshot.phase = TrackingPhase::Completed;
        self.snapshot.evaluation_complete = true;
        self.snapshot.is_new_evaluation = false;
        if let Some(lecture_no) = self.snapshot.lecture_no {
            self.snapshot.message = format!("Lecture {lecture_no} evaluated");
        }
    }

    /// Record a terminal failure (job error or timeout).
    pub fn mark_failed(&mut self, message: &str) {
        self.snapshot.phase = TrackingPhase::Failed;
        self.snapshot.message = message.to_string();
    }

    // ---- private helpers ----

    fn mark_processing(&mut self, current_unit: Option<WorkUnit>) {
        self.snapshot.phase = TrackingPhase::Processing;
        self.snapshot.queue_position = None;
        if let Some(unit) = current_unit {
            self.snapshot.message = format!("Processing Lecture {unit}...");
            self.snapshot.current_unit = Some(unit);
        }
    }

    fn start_criterion(&mut self, data: CriterionStartData) -> Interpretation {
        if data.criterion.is_empty() {
            return Interpretation::Ignored;
        }
        self.sequencers.remove(&data.criterion);

        let snapshot = &mut self.snapshot;
        snapshot.phase = TrackingPhase::Evaluating;
        if data.lecture_no.is_some() {
            snapshot.lecture_no = data.lecture_no;
        }
        let entry = CriterionEvaluation {
            rubric: self.rubric.entry(&data.criterion).cloned(),
            ..Default::default()
        };
        snapshot.criteria_evaluations.insert(data.criterion, entry);
        snapshot.recompute_total();
        Interpretation::Updated
    }

    fn append_chunk(&mut self, data: AnalysisChunkData) -> Interpretation {
        if data.criterion.is_empty() {
            return Interpretation::Ignored;
        }

        let ready = match data.seq {
            Some(seq) => self
                .sequencers
                .entry(data.criterion.clone())
                .or_default()
                .accept(seq, data.chunk),
            None => vec![data.chunk],
        };
        if ready.is_empty() {
            return Interpretation::Ignored;
        }

        let entry = self
            .snapshot
            .criteria_evaluations
            .entry(data.criterion)
            .or_default();
        for chunk in ready {
            entry.feedback.push_str(&chunk);
        }
        Interpretation::Updated
    }

    fn complete_criterion(&mut self, data: CriterionCompleteData) -> Interpretation {
        if data.criterion.is_empty() {
            return Interpretation::Ignored;
        }

        let held = self
            .sequencers
            .remove(&data.criterion)
            .map(|mut s| s.drain())
            .unwrap_or_default();

        let entry = self
            .snapshot
            .criteria_evaluations
            .entry(data.criterion)
            .or_default();
        for chunk in held {
            entry.feedback.push_str(&chunk);
        }
        if let Some(full) = data.full_analysis.filter(|text| !text.is_empty()) {
            entry.feedback = full;
        }
        entry.score = data.score;
        entry.scored = true;
        entry.slide_images = data.slide_images.unwrap_or_default();
        entry.slide_numbers = data.slide_numbers.unwrap_or_default();
        if let Some(range) = data.time_range.filter(|r| !r.is_empty()) {
            entry.time_range = range;
        }

        self.snapshot.recompute_total();
        Interpretation::Updated
    }
}

fn lecture(lecture_no: Option<LectureNo>) -> String {
    lecture_no
        .map(|n| n.to_string())
        .unwrap_or_else(|| "?".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::api::StoredCriterion;
    use crate::messages::{parse_message, ErrorData, LectureData, MetadataData};

    fn event(json: &str) -> ProgressEvent {
        parse_message(json).unwrap()
    }

    fn chunk(criterion: &str, text: &str, seq: Option<u64>) -> ProgressEvent {
        ProgressEvent::AnalysisChunk(AnalysisChunkData {
            criterion: criterion.into(),
            chunk: text.into(),
            seq,
        })
    }

    fn complete(criterion: &str, score: f64) -> ProgressEvent {
        ProgressEvent::CriterionComplete(CriterionCompleteData {
            criterion: criterion.into(),
            score,
            full_analysis: None,
            slide_images: None,
            slide_numbers: None,
            time_range: None,
        })
    }

    #[test]
    fn scenario_single_criterion_evaluation() {
        let mut interp = EventInterpreter::default();
        let frames = [
            r#"{"type":"metadata","data":{"lecture_no":3}}"#,
            r#"{"type":"criterion_start","data":{"criterion":"Clarity"}}"#,
            r#"{"type":"analysis_chunk","data":{"criterion":"Clarity","chunk":"Good "}}"#,
            r#"{"type":"analysis_chunk","data":{"criterion":"Clarity","chunk":"pacing."}}"#,
            r#"{"type":"criterion_complete","data":{"criterion":"Clarity","score":4}}"#,
        ];
        for frame in frames {
            assert_eq!(interp.apply(event(frame)), Interpretation::Updated);
        }
        assert_eq!(
            interp.apply(event(r#"{"type":"complete","data":{}}"#)),
            Interpretation::Completed
        );

        let snap = interp.snapshot();
        assert_eq!(snap.lecture_no, Some(3));
        assert_eq!(snap.total_score, 4.0);
        assert_eq!(snap.criteria_evaluations.len(), 1);
        let clarity = &snap.criteria_evaluations["Clarity"];
        assert_eq!(clarity.feedback, "Good pacing.");
        assert_eq!(clarity.score, 4.0);
        assert!(snap.is_new_evaluation);
    }

    #[test]
    fn chunks_concatenate_in_arrival_order() {
        let pieces = ["The ", "lecture ", "was ", "well ", "structured", "."];
        let mut interp = EventInterpreter::default();
        for piece in pieces {
            interp.apply(chunk("Flow", piece, None));
        }
        assert_eq!(
            interp.snapshot().criteria_evaluations["Flow"].feedback,
            pieces.concat()
        );
    }

    #[test]
    fn sequenced_chunks_are_reordered_and_deduplicated() {
        let mut interp = EventInterpreter::default();
        assert_eq!(interp.apply(chunk("Flow", "b", Some(1))), Interpretation::Ignored);
        assert_eq!(interp.apply(chunk("Flow", "c", Some(2))), Interpretation::Ignored);
        assert_eq!(interp.apply(chunk("Flow", "a", Some(0))), Interpretation::Updated);
        assert_eq!(interp.apply(chunk("Flow", "a", Some(0))), Interpretation::Ignored);
        assert_eq!(interp.snapshot().criteria_evaluations["Flow"].feedback, "abc");
    }

    #[test]
    fn criterion_complete_flushes_held_chunks() {
        let mut interp = EventInterpreter::default();
        interp.apply(chunk("Flow", "a", Some(0)));
        interp.apply(chunk("Flow", "c", Some(2)));
        interp.apply(complete("Flow", 3.0));
        assert_eq!(interp.snapshot().criteria_evaluations["Flow"].feedback, "ac");
    }

    #[test]
    fn total_score_is_mean_of_recorded_scores() {
        let scores = [4.0, 3.0, 5.0, 2.0, 3.5];
        let mut interp = EventInterpreter::default();

        for (n, score) in scores.iter().enumerate() {
            interp.apply(complete(&format!("C{n}"), *score));
            let recorded = &scores[..=n];
            let mean = recorded.iter().sum::<f64>() / recorded.len() as f64;
            assert!((interp.snapshot().total_score - mean).abs() < 1e-9);
        }
    }

    #[test]
    fn started_but_unscored_criteria_do_not_dilute_total() {
        let mut interp = EventInterpreter::default();
        interp.apply(complete("Clarity", 4.0));
        interp.apply(event(r#"{"type":"criterion_start","data":{"criterion":"Flow"}}"#));
        assert_eq!(interp.snapshot().total_score, 4.0);
        assert_eq!(interp.snapshot().criteria_evaluations.len(), 2);
    }

    #[test]
    fn full_analysis_replaces_streamed_text() {
        let mut interp = EventInterpreter::default();
        interp.apply(chunk("Clarity", "partial", None));
        interp.apply(event(
            r#"{"type":"criterion_complete","data":{"criterion":"Clarity","score":5,
            "full_analysis":"Complete text.","slide_numbers":[3],"time_range":"01:00-02:00"}}"#,
        ));

        let clarity = &interp.snapshot().criteria_evaluations["Clarity"];
        assert_eq!(clarity.feedback, "Complete text.");
        assert_eq!(clarity.slide_numbers, vec![3]);
        assert_eq!(clarity.time_range, "01:00-02:00");
    }

    #[test]
    fn empty_full_analysis_keeps_streamed_text() {
        let mut interp = EventInterpreter::default();
        interp.apply(chunk("Clarity", "streamed", None));
        interp.apply(event(
            r#"{"type":"criterion_complete","data":{"criterion":"Clarity","score":2,"full_analysis":""}}"#,
        ));
        assert_eq!(interp.snapshot().criteria_evaluations["Clarity"].feedback, "streamed");
    }

    #[test]
    fn new_lecture_start_always_clears_criteria() {
        let mut interp = EventInterpreter::default();
        interp.apply(complete("Clarity", 4.0));
        interp.apply(chunk("Flow", "x", Some(0)));

        for _ in 0..2 {
            interp.apply(ProgressEvent::NewLectureStart(LectureData {
                lecture_no: Some(8),
            }));
            let snap = interp.snapshot();
            assert!(snap.criteria_evaluations.is_empty());
            assert_eq!(snap.total_score, 0.0);
            assert_eq!(snap.lecture_no, Some(8));
            assert_eq!(snap.message, "Starting Lecture 8...");
        }

        // Sequencing restarts after the reset.
        interp.apply(chunk("Flow", "y", Some(0)));
        assert_eq!(interp.snapshot().criteria_evaluations["Flow"].feedback, "y");
    }

    #[test]
    fn metadata_resets_scores_and_marks_fresh_evaluation() {
        let mut interp = EventInterpreter::default();
        interp.apply(complete("Clarity", 4.0));
        interp.apply(ProgressEvent::Metadata(MetadataData {
            lecture_no: Some(2),
            name: Some("Dr. Rao".into()),
            degree: None,
            topic: Some("Graphs".into()),
        }));

        let snap = interp.snapshot();
        assert!(snap.criteria_evaluations.is_empty());
        assert_eq!(snap.total_score, 0.0);
        assert!(snap.is_new_evaluation);
        assert_eq!(snap.phase, TrackingPhase::Evaluating);
        assert_eq!(snap.name.as_deref(), Some("Dr. Rao"));
    }

    #[test]
    fn criterion_start_seeds_rubric_text() {
        let mut rubric = Rubric::default();
        rubric.insert(
            "Clarity",
            RubricEntry {
                criteria_explanation: "Is it clear?".into(),
                ..Default::default()
            },
        );
        let mut interp = EventInterpreter::new(rubric);
        interp.apply(event(r#"{"type":"criterion_start","data":{"criterion":"Clarity"}}"#));
        interp.apply(event(r#"{"type":"criterion_start","data":{"criterion":"Flow"}}"#));

        let snap = interp.snapshot();
        let clarity = &snap.criteria_evaluations["Clarity"];
        assert_eq!(clarity.feedback, "");
        assert_eq!(clarity.score, 0.0);
        assert_eq!(
            clarity.rubric.as_ref().unwrap().criteria_explanation,
            "Is it clear?"
        );
        assert!(snap.criteria_evaluations["Flow"].rubric.is_none());
    }

    #[test]
    fn status_events_update_message() {
        let mut interp = EventInterpreter::default();
        interp.apply(event(r#"{"type":"queue_status","data":{}}"#));
        assert_eq!(interp.snapshot().phase, TrackingPhase::Queued);

        interp.apply(event(r#"{"type":"job_status","data":{"current_lecture":5}}"#));
        assert_eq!(interp.snapshot().phase, TrackingPhase::Processing);
        assert_eq!(interp.snapshot().message, "Processing Lecture 5...");

        interp.apply(event(r#"{"type":"transcription_start","data":{"lecture_no":5}}"#));
        assert_eq!(interp.snapshot().message, "Transcribing Lecture 5...");
    }

    #[test]
    fn error_event_fails_with_message() {
        let mut interp = EventInterpreter::default();
        let outcome = interp.apply(ProgressEvent::Error(ErrorData {
            message: "video missing".into(),
        }));
        assert_eq!(outcome, Interpretation::Failed("video missing".into()));
        assert_eq!(interp.snapshot().phase, TrackingPhase::Failed);
    }

    #[test]
    fn heartbeat_and_unknown_events_are_ignored() {
        let mut interp = EventInterpreter::default();
        let before = interp.snapshot().clone();
        assert_eq!(interp.apply(ProgressEvent::Heartbeat), Interpretation::Ignored);
        assert_eq!(
            interp.apply(ProgressEvent::Unknown {
                kind: "mystery".into()
            }),
            Interpretation::Ignored
        );
        assert_eq!(interp.snapshot(), &before);
    }

    #[test]
    fn load_stored_replaces_snapshot() {
        let mut interp = EventInterpreter::default();
        interp.apply(complete("Old", 1.0));

        let stored = StoredEvaluation {
            total_score: 3.5,
            criteria_scores: vec![StoredCriterion {
                criterion: "Clarity".into(),
                score: 3.5,
                feedback: "Fine.".into(),
                ..Default::default()
            }],
        };
        interp.load_stored(6, &stored);

        let snap = interp.snapshot();
        assert_eq!(snap.lecture_no, Some(6));
        assert_eq!(snap.total_score, 3.5);
        assert!(!snap.is_new_evaluation);
        assert!(snap.evaluation_complete);
        assert!(!snap.criteria_evaluations.contains_key("Old"));
    }

    #[test]
    fn snapshot_serializes_as_view_state() {
        let mut interp = EventInterpreter::default();
        interp.apply(complete("Clarity", 4.0));
        let json = serde_json::to_value(interp.snapshot()).unwrap();
        assert_eq!(json["phase"], "idle");
        assert_eq!(json["criteria_evaluations"]["Clarity"]["score"], 4.0);
    }
}
