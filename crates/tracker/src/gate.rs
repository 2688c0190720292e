//! Exactly-once completion for a tracked job.
//!
//! Completion can be triggered by a `complete` event, by a polled
//! COMPLETED status, or by the timeout. Whichever arrives first wins;
//! the finalized flag is set before anything else happens, so a second
//! trigger (a duplicate `complete`, a poll racing a late event, a
//! replacement session for a job that already finished) is rejected and
//! the result is persisted at most once.
//!
//! One gate exists per job, not per session: the
//! [`JobTracker`](crate::manager::JobTracker) hands the same gate to a
//! replacement session and consults it before starting new ones.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::api::EvaluationRecord;
use crate::interpreter::EvaluationSnapshot;

/// What to do with a successful completion.
#[derive(Debug, Clone, PartialEq)]
pub enum GateOutcome {
    /// Store this record, then report completion.
    Persist(EvaluationRecord),
    /// Report completion without storing (stored result, or no lecture
    /// number to file it under).
    SkipPersistence,
    /// Completion was already handled. Do nothing.
    AlreadyFinalized,
}

#[derive(Debug, Default)]
pub struct CompletionGate {
    finalized: AtomicBool,
}

impl CompletionGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized.load(Ordering::Acquire)
    }

    /// Close the gate on success. Only a fresh evaluation with a lecture
    /// number yields [`GateOutcome::Persist`].
    pub fn finalize_success(&self, course_id: &str, snapshot: &EvaluationSnapshot) -> GateOutcome {
        if self.close() {
            return GateOutcome::AlreadyFinalized;
        }

        if !snapshot.is_new_evaluation {
            return GateOutcome::SkipPersistence;
        }
        match EvaluationRecord::from_snapshot(course_id, snapshot) {
            Some(record) => GateOutcome::Persist(record),
            None => {
                tracing::warn!(course_id, "Completed evaluation has no lecture number, not storing it");
                GateOutcome::SkipPersistence
            }
        }
    }

    /// Close the gate on failure. Returns `false` if it was already closed.
    pub fn finalize_failure(&self) -> bool {
        !self.close()
    }

    /// Set the flag. Returns whether it was already set.
    fn close(&self) -> bool {
        self.finalized.swap(true, Ordering::AcqRel)
    }
}
