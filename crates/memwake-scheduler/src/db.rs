use rusqlite::Connection;

use crate::error::Result;

/// Initialise the work-queue schema in `conn`.
///
/// Creates the `work` table (idempotent) keyed by unique work name, and an
/// index on `(status, run_at)` for the runner's polling query.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS work (
            name            TEXT    NOT NULL PRIMARY KEY,
            id              TEXT    NOT NULL,   -- submission generation (UUID v4)
            status          TEXT    NOT NULL DEFAULT 'pending',
            run_at          TEXT    NOT NULL,   -- RFC 3339 UTC
            attempt         INTEGER NOT NULL DEFAULT 0,
            backoff_kind    TEXT    NOT NULL,
            backoff_base_ms INTEGER NOT NULL,
            expedited       INTEGER NOT NULL DEFAULT 0,
            created_at      TEXT    NOT NULL,
            updated_at      TEXT    NOT NULL
        ) STRICT;

        -- Polling: SELECT … WHERE status = 'pending' AND run_at <= ?
        CREATE INDEX IF NOT EXISTS idx_work_status_run_at ON work (status, run_at);
        ",
    )?;
    Ok(())
}
