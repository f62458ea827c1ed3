//! JobResult: the outcome of a single job run.

use serde::{Deserialize, Serialize};

/// Classification of a run.
///
/// Serialized as SCREAMING_SNAKE_CASE: SUCCESS / NO_OP / FAILED / CANCELLED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobResultKind {
    Success,
    /// Nothing to do this time (e.g. the queue was empty). Not a failure.
    NoOp,
    Failed,
    Cancelled,
}

/// Result of one `run` of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResult {
    pub kind: JobResultKind,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl JobResult {
    pub fn success() -> Self {
        Self {
            kind: JobResultKind::Success,
            reason: None,
        }
    }

    pub fn no_op() -> Self {
        Self {
            kind: JobResultKind::NoOp,
            reason: None,
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            kind: JobResultKind::Failed,
            reason: Some(reason.into()),
        }
    }

    pub fn cancelled() -> Self {
        Self {
            kind: JobResultKind::Cancelled,
            reason: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn is_success(&self) -> bool {
        matches!(self.kind, JobResultKind::Success | JobResultKind::NoOp)
    }

    pub fn is_failure(&self) -> bool {
        self.kind == JobResultKind::Failed
    }
}
