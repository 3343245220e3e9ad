use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

/// Hard ceiling on any computed retry delay.
pub const MAX_BACKOFF: Duration = Duration::from_secs(5 * 60 * 60);

/// A single scheduled wake instant tagged with the unique work name it is
/// submitted under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WakeSlot {
    pub name: String,
    /// Local wall-clock time of the wake.
    pub at: NaiveDateTime,
}

/// The pair of wake instants produced per scheduling cycle, ascending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleSet {
    slots: [NaiveDateTime; 2],
}

impl ScheduleSet {
    /// Build a set from two instants in any order.
    pub fn new(a: NaiveDateTime, b: NaiveDateTime) -> Self {
        let slots = if a <= b { [a, b] } else { [b, a] };
        Self { slots }
    }

    pub fn first(&self) -> NaiveDateTime {
        self.slots[0]
    }

    pub fn second(&self) -> NaiveDateTime {
        self.slots[1]
    }

    pub fn slots(&self) -> &[NaiveDateTime; 2] {
        &self.slots
    }

    /// Pair each instant with a work name, in chronological order.
    pub fn tag(&self, names: [&str; 2]) -> [WakeSlot; 2] {
        [
            WakeSlot {
                name: names[0].to_string(),
                at: self.slots[0],
            },
            WakeSlot {
                name: names[1].to_string(),
                at: self.slots[1],
            },
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    Exponential,
}

impl std::fmt::Display for BackoffKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BackoffKind::Exponential => "exponential",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for BackoffKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "exponential" => Ok(BackoffKind::Exponential),
            other => Err(format!("unknown backoff kind: {other}")),
        }
    }
}

/// Retry policy declared by the submitter and applied by the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    pub kind: BackoffKind,
    pub base: Duration,
}

impl BackoffPolicy {
    pub fn exponential(base: Duration) -> Self {
        Self {
            kind: BackoffKind::Exponential,
            base,
        }
    }

    /// Delay before retry number `attempt` (1-based), capped at [`MAX_BACKOFF`].
    ///
    /// `base * 2^(attempt-1)`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let delay = match self.kind {
            BackoffKind::Exponential => {
                let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
                self.base.saturating_mul(factor)
            }
        };
        delay.min(MAX_BACKOFF)
    }
}

/// What happens when work is submitted under a name that already has work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExistingWorkPolicy {
    /// Supersede queued or running work under the same name.
    Replace,
    /// Leave existing work alone and drop the new submission.
    Keep,
}

/// Behaviour of an expedited request once the queue cannot expedite it.
///
/// The SQLite queue has no expedite budget; expedited rows are simply claimed
/// ahead of ordinary rows that are due at the same tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutOfQuotaPolicy {
    /// Fall back to an ordinary request.
    RunAsNonExpedited,
}

/// A one-shot work request as accepted by [`crate::queue::WorkQueue`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkRequest {
    pub initial_delay: Duration,
    pub backoff: BackoffPolicy,
    /// `Some` requests expedited execution.
    pub expedited: Option<OutOfQuotaPolicy>,
}

impl WorkRequest {
    pub fn new(initial_delay: Duration, backoff: BackoffPolicy) -> Self {
        Self {
            initial_delay,
            backoff,
            expedited: None,
        }
    }

    pub fn expedite(mut self, policy: OutOfQuotaPolicy) -> Self {
        self.expedited = Some(policy);
        self
    }
}

/// A named submission: what the submitter hands to the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSubmission {
    pub unique_name: String,
    pub request: WorkRequest,
}

/// Lifecycle state of a queued work row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkStatus {
    /// Waiting for `run_at`.
    Pending,
    /// Claimed by a runner and handed to a worker.
    Running,
}

impl std::fmt::Display for WorkStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WorkStatus::Pending => "pending",
            WorkStatus::Running => "running",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for WorkStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(WorkStatus::Pending),
            "running" => Ok(WorkStatus::Running),
            other => Err(format!("unknown work status: {other}")),
        }
    }
}

/// Snapshot of one queued work row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkInfo {
    /// Unique work name, the primary key.
    pub name: String,
    /// UUID v4 of the current submission; changes on every replace.
    pub id: String,
    pub status: WorkStatus,
    pub run_at: DateTime<Utc>,
    /// Number of failed attempts so far.
    pub attempt: u32,
    pub backoff: BackoffPolicy,
    pub expedited: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
