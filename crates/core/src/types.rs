use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};

/// Backend job identifiers are opaque strings.
pub type JobId = String;

/// Lecture numbers within a course.
pub type LectureNo = u32;

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Lifecycle status of a backend job as reported by the status endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Queued,
    InProgress,
    Completed,
    Failed,
}

impl JobStatus {
    /// `true` for `Completed` and `Failed`.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// The unit of work a job is currently processing.
///
/// The backend reports this either as a number (`3`) or as a string
/// (`"3"`, or a free-form label), so both shapes are accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WorkUnit {
    Number(u64),
    Text(String),
}

impl WorkUnit {
    /// Interpret the unit as a lecture number, if it is numeric.
    pub fn as_lecture_no(&self) -> Option<LectureNo> {
        match self {
            Self::Number(n) => LectureNo::try_from(*n).ok(),
            Self::Text(s) => s.trim().parse().ok(),
        }
    }
}

impl fmt::Display for WorkUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

impl From<LectureNo> for WorkUnit {
    fn from(value: LectureNo) -> Self {
        Self::Number(u64::from(value))
    }
}

/// Deserialize an optional lecture number sent either as a number or a
/// numeric string. Non-numeric values become `None`.
///
/// Use with `#[serde(default, deserialize_with = "lenient_lecture_no")]`.
pub fn lenient_lecture_no<'de, D>(deserializer: D) -> Result<Option<LectureNo>, D::Error>
where
    D: Deserializer<'de>,
{
    let unit = Option::<WorkUnit>::deserialize(deserializer)?;
    Ok(unit.and_then(|u| u.as_lecture_no()))
}
