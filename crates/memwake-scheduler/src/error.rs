use thiserror::Error;

/// Errors that can occur within the scheduler subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A persisted row could not be decoded (bad timestamp, unknown enum tag).
    #[error("Corrupt work row {name}: {reason}")]
    CorruptRow { name: String, reason: String },

    /// No work with the given unique name exists in the queue.
    #[error("Work not found: {name}")]
    WorkNotFound { name: String },

    /// The queue refused the submission.
    #[error("Submission of {name} rejected: {reason}")]
    Rejected { name: String, reason: String },
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
