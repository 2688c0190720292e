//! Plain-text rendering of evaluation snapshots.
//!
//! Everything here is a pure function of an [`EvaluationSnapshot`], so
//! the same view can be produced from a live session or a stored result.

use std::fmt::Write;

use afe_tracker::interpreter::{EvaluationSnapshot, TrackingPhase};
use serde::Serialize;

use crate::runner::{LectureOutcome, LectureReport};

/// One bar of the per-criterion score chart.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScorePoint {
    pub criterion: String,
    pub score: f64,
}

/// Scores of all finished criteria, in criterion name order.
pub fn score_series(snapshot: &EvaluationSnapshot) -> Vec<ScorePoint> {
    snapshot
        .criteria_evaluations
        .iter()
        .filter(|(_, evaluation)| evaluation.scored)
        .map(|(criterion, evaluation)| ScorePoint {
            criterion: criterion.clone(),
            score: evaluation.score,
        })
        .collect()
}

/// Render a snapshot as a readable block of text.
///
/// ```text
/// Lecture 3: Ownership
/// Total score: 4.00
///
/// Clarity [4.0]
///   Good pacing.
///   Slides: 2, 3
/// ```
pub fn render_snapshot(snapshot: &EvaluationSnapshot) -> String {
    let mut out = String::new();

    let title = match snapshot.lecture_no {
        Some(n) => format!("Lecture {n}"),
        None => "Evaluation".to_string(),
    };
    match &snapshot.topic {
        Some(topic) if !topic.is_empty() => {
            let _ = writeln!(out, "{title}: {topic}");
        }
        _ => {
            let _ = writeln!(out, "{title}");
        }
    }
    if let Some(name) = snapshot.name.as_deref().filter(|s| !s.is_empty()) {
        let _ = writeln!(out, "Instructor: {name}");
    }
    if let Some(degree) = snapshot.degree.as_deref().filter(|s| !s.is_empty()) {
        let _ = writeln!(out, "Degree: {degree}");
    }

    match snapshot.phase {
        TrackingPhase::Completed => {
            let _ = writeln!(out, "Total score: {:.2}", snapshot.total_score);
        }
        TrackingPhase::Failed => {
            let _ = writeln!(out, "Failed: {}", snapshot.message);
        }
        _ => {
            let _ = writeln!(out, "Status: {}", snapshot.message);
        }
    }

    for (criterion, evaluation) in &snapshot.criteria_evaluations {
        out.push('\n');
        if evaluation.scored {
            let _ = writeln!(out, "{criterion} [{:.1}]", evaluation.score);
        } else {
            let _ = writeln!(out, "{criterion} [pending]");
        }
        for line in evaluation.feedback.lines().filter(|l| !l.trim().is_empty()) {
            let _ = writeln!(out, "  {}", line.trim_end());
        }
        if !evaluation.slide_numbers.is_empty() {
            let slides: Vec<String> = evaluation.slide_numbers.iter().map(u32::to_string).collect();
            let _ = writeln!(out, "  Slides: {}", slides.join(", "));
        }
        if !evaluation.time_range.is_empty() {
            let _ = writeln!(out, "  Time: {}", evaluation.time_range);
        }
    }

    out
}

/// One line per lecture of a finished range run.
pub fn render_summary(reports: &[LectureReport]) -> String {
    let mut out = String::new();
    for report in reports {
        let source = match report.outcome {
            LectureOutcome::Stored(_) => "stored",
            LectureOutcome::Evaluated(_) => "evaluated",
        };
        let _ = writeln!(
            out,
            "Lecture {:>3}  {:>5.2}  ({source})",
            report.lecture_no,
            report.outcome.snapshot().total_score
        );
    }
    out
}
