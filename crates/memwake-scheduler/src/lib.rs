//! `memwake-scheduler`: randomized wake scheduling over a durable,
//! unique-name work queue.
//!
//! # Overview
//!
//! [`schedule::compute_schedule_set`] picks two wake instants on distinct days
//! of the coming week inside a daily hour window. The [`WorkSubmitter`] turns
//! them into one-shot submissions under two fixed unique names with
//! replace-existing semantics, so re-arming never piles up pending work.
//!
//! Work lives in a SQLite `work` table, one row per unique name. The
//! [`runner::QueueRunner`] polls it, hands due rows to a [`work::Worker`], and
//! settles each execution:
//!
//! | Outcome              | Queue action                                   |
//! |----------------------|------------------------------------------------|
//! | `Success`            | row deleted (unless replaced meanwhile)        |
//! | `Retry`              | back to pending after exponential backoff      |
//! | timed out            | worker stopped, then treated as `Retry`        |
//! | replaced while running | worker stopped, new row left untouched       |

pub mod db;
pub mod error;
pub mod queue;
pub mod runner;
pub mod schedule;
pub mod submitter;
pub mod types;
pub mod work;

pub use error::{Result, SchedulerError};
pub use queue::{SqliteWorkQueue, WorkQueue};
pub use runner::QueueRunner;
pub use submitter::{Rescheduler, WorkSubmitter};
pub use types::{
    BackoffKind, BackoffPolicy, ExistingWorkPolicy, JobSubmission, OutOfQuotaPolicy, ScheduleSet,
    WakeSlot, WorkInfo, WorkRequest, WorkStatus,
};
pub use work::{completion_pair, WorkCompleter, WorkHandle, WorkOutcome, Worker, WorkerFactory};
