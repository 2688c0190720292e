//! Static rubric text attached to evaluation criteria.
//!
//! A [`Rubric`] maps criterion names to the explanatory text shown next
//! to each criterion's feedback. It is supplied by the caller and used
//! to seed entries when the backend announces `criterion_start`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Explanatory text for a single criterion.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RubricEntry {
    #[serde(default)]
    pub criteria_explanation: String,
    #[serde(default)]
    pub criteria_output: String,
    #[serde(default)]
    pub score_explanation: String,
}

/// Criterion name -> rubric text.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Rubric {
    entries: BTreeMap<String, RubricEntry>,
}

impl Rubric {
    /// Parse a rubric from a JSON object keyed by criterion name.
    ///
    /// Criterion names must be non-blank.
    pub fn from_json(json: &str) -> Result<Self, CoreError> {
        let rubric: Self = serde_json::from_str(json).map_err(|source| CoreError::Malformed {
            what: "rubric",
            source,
        })?;

        if rubric.entries.keys().any(|name| name.trim().is_empty()) {
            return Err(CoreError::Validation(
                "rubric criterion names must not be blank".into(),
            ));
        }

        Ok(rubric)
    }

    /// Add or replace the entry for `criterion`.
    pub fn insert(&mut self, criterion: impl Into<String>, entry: RubricEntry) {
        self.entries.insert(criterion.into(), entry);
    }

    /// Rubric text for `criterion`, if the rubric covers it.
    pub fn entry(&self, criterion: &str) -> Option<&RubricEntry> {
        self.entries.get(criterion)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
