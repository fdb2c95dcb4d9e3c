//! Batch aggregation rules: group identity, progress arithmetic and the
//! policy deciding when a group is closed.
//!
//! A group closes exactly once. Counters only move through atomic
//! increments in the tracker backends; the functions here interpret the
//! values those increments return.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::job::OutputDescriptor;

// ---------------------------------------------------------------------------
// GroupKey
// ---------------------------------------------------------------------------

/// Identity of one tracker entry: a group inside a request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupKey {
    pub request_id: String,
    pub group_id: String,
}

impl GroupKey {
    pub fn new(request_id: impl Into<String>, group_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            group_id: group_id.into(),
        }
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "request:{}:group:{}", self.request_id, self.group_id)
    }
}

// ---------------------------------------------------------------------------
// Progress
// ---------------------------------------------------------------------------

/// Counter snapshot returned by every tracker mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub expected: i32,
    pub completed: i32,
    pub failed: i32,
}

impl Progress {
    pub fn new(expected: i32) -> Self {
        Self {
            expected,
            completed: 0,
            failed: 0,
        }
    }

    /// Items that reached a terminal state, successful or not.
    pub fn settled(&self) -> i32 {
        self.completed + self.failed
    }

    /// Whether one more terminal item would exceed `expected`.
    pub fn is_full(&self) -> bool {
        self.settled() >= self.expected
    }

    /// Whether this snapshot closes the group under `policy`.
    pub fn is_closed(&self, policy: FailurePolicy) -> bool {
        match policy {
            FailurePolicy::Strict => is_batch_complete(self.completed, self.expected),
            FailurePolicy::CountFailures => is_batch_complete(self.settled(), self.expected),
        }
    }
}

/// A batch is complete when the freshly incremented count equals the
/// expected count. Equality (not `>=`) singles out the one increment that
/// crossed the boundary.
pub fn is_batch_complete(new_count: i32, expected: i32) -> bool {
    new_count == expected
}

/// Validate an expected count before it is registered.
pub fn validate_expected_count(expected: i32) -> Result<(), CoreError> {
    if expected <= 0 {
        return Err(CoreError::Validation(format!(
            "Expected count must be positive, got {expected}"
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// RecordOutcome
// ---------------------------------------------------------------------------

/// Result of recording one job outcome against a tracker entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordOutcome {
    /// Counters after the update (or current counters for a duplicate).
    pub progress: Progress,
    /// `false` when the job id had already been recorded for the group.
    pub newly_counted: bool,
}

impl RecordOutcome {
    /// Whether the caller holding this outcome must dispatch the group.
    ///
    /// Only a newly counted record can close a group, so a redelivered
    /// completion of the final job never triggers a second dispatch.
    pub fn closes_group(&self, policy: FailurePolicy) -> bool {
        self.newly_counted && self.progress.is_closed(policy)
    }
}

// ---------------------------------------------------------------------------
// FailurePolicy
// ---------------------------------------------------------------------------

/// How terminally failed jobs affect batch closure.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    /// Only successful completions count. A group with a failed item never
    /// dispatches; the failure stays visible in the status report.
    #[default]
    Strict,
    /// Failed items count toward closure; the webhook fires with the
    /// outputs that did succeed.
    CountFailures,
}

impl FailurePolicy {
    pub fn name(self) -> &'static str {
        match self {
            Self::Strict => "strict",
            Self::CountFailures => "count-failures",
        }
    }
}

impl FromStr for FailurePolicy {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "strict" => Ok(Self::Strict),
            "count-failures" | "count_failures" => Ok(Self::CountFailures),
            other => Err(CoreError::Validation(format!(
                "Unknown failure policy '{other}'. Must be one of: strict, count-failures"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// GroupStatus
// ---------------------------------------------------------------------------

/// Read-only view of one open tracker entry for the status boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupStatus {
    pub group_id: String,
    pub progress: Progress,
    pub outputs: Vec<OutputDescriptor>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
