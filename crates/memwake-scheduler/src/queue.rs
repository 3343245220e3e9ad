use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    db::init_db,
    error::{Result, SchedulerError},
    types::{BackoffKind, BackoffPolicy, ExistingWorkPolicy, WorkInfo, WorkRequest, WorkStatus},
};

/// The single operation the scheduler needs from a durable work queue.
pub trait WorkQueue: Send + Sync {
    /// Submit `request` under `name`, resolving conflicts with `policy`.
    fn enqueue_unique_work(
        &self,
        name: &str,
        policy: ExistingWorkPolicy,
        request: WorkRequest,
    ) -> Result<()>;
}

/// A row the runner has just moved from `pending` to `running`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimedWork {
    pub name: String,
    /// Generation id at claim time; later updates are matched against it so a
    /// replaced row is never finished or retried by a stale worker.
    pub id: String,
    pub attempt: u32,
}

/// SQLite-backed durable queue with one row per unique work name.
///
/// Cloning shares the underlying connection, so the submitter and the runner
/// can hold the same queue.
#[derive(Clone)]
pub struct SqliteWorkQueue {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteWorkQueue {
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// [`WorkQueue::enqueue_unique_work`] against an explicit clock.
    pub fn enqueue_at(
        &self,
        now: DateTime<Utc>,
        name: &str,
        policy: ExistingWorkPolicy,
        request: &WorkRequest,
    ) -> Result<()> {
        if name.trim().is_empty() {
            return Err(SchedulerError::Rejected {
                name: name.to_string(),
                reason: "unique work name must not be empty".to_string(),
            });
        }

        let conn = self.conn.lock().unwrap();
        let now_str = db_time(now);
        let run_at = db_time(after(now, request.initial_delay));
        let id = Uuid::new_v4().to_string();
        let backoff_base_ms = request.backoff.base.as_millis() as i64;
        let expedited = request.expedited.is_some();

        let sql = match policy {
            ExistingWorkPolicy::Replace => {
                "INSERT INTO work
                 (name, id, status, run_at, attempt, backoff_kind, backoff_base_ms,
                  expedited, created_at, updated_at)
                 VALUES (?1,?2,'pending',?3,0,?4,?5,?6,?7,?7)
                 ON CONFLICT(name) DO UPDATE SET
                    id = excluded.id,
                    status = 'pending',
                    run_at = excluded.run_at,
                    attempt = 0,
                    backoff_kind = excluded.backoff_kind,
                    backoff_base_ms = excluded.backoff_base_ms,
                    expedited = excluded.expedited,
                    created_at = excluded.created_at,
                    updated_at = excluded.updated_at"
            }
            ExistingWorkPolicy::Keep => {
                "INSERT INTO work
                 (name, id, status, run_at, attempt, backoff_kind, backoff_base_ms,
                  expedited, created_at, updated_at)
                 VALUES (?1,?2,'pending',?3,0,?4,?5,?6,?7,?7)
                 ON CONFLICT(name) DO NOTHING"
            }
        };

        let n = conn.execute(
            sql,
            rusqlite::params![
                name,
                id,
                run_at,
                request.backoff.kind.to_string(),
                backoff_base_ms,
                expedited,
                now_str
            ],
        )?;

        if n == 0 {
            debug!(%name, "existing work kept; submission dropped");
        } else {
            info!(%name, work_id = %id, %run_at, expedited, "work enqueued");
        }
        Ok(())
    }

    /// Remove the work under `name`, whatever its state.
    pub fn cancel_unique_work(&self, name: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute("DELETE FROM work WHERE name = ?1", [name])?;
        if n == 0 {
            return Err(SchedulerError::WorkNotFound {
                name: name.to_string(),
            });
        }
        info!(%name, "work cancelled");
        Ok(())
    }

    pub fn get_work(&self, name: &str) -> Result<Option<WorkInfo>> {
        let conn = self.conn.lock().unwrap();
        let raw = conn
            .query_row(
                "SELECT name, id, status, run_at, attempt, backoff_kind, backoff_base_ms,
                        expedited, created_at, updated_at
                 FROM work WHERE name = ?1",
                [name],
                RawRow::from_row,
            )
            .optional()?;
        raw.map(RawRow::decode).transpose()
    }

    /// All queued work ordered by next run time.
    pub fn list_work(&self) -> Result<Vec<WorkInfo>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT name, id, status, run_at, attempt, backoff_kind, backoff_base_ms,
                    expedited, created_at, updated_at
             FROM work ORDER BY run_at",
        )?;
        let work = stmt
            .query_map([], RawRow::from_row)?
            .filter_map(|r| match r.map_err(SchedulerError::from).and_then(RawRow::decode) {
                Ok(info) => Some(info),
                Err(e) => {
                    warn!("skipping unreadable work row: {e}");
                    None
                }
            })
            .collect();
        Ok(work)
    }

    // --- runner-facing operations ------------------------------------------

    /// Move up to `limit` due pending rows to `running` and return them,
    /// expedited rows first, then by `run_at`. Unreadable rows are logged and
    /// left pending so they never block the rows behind them.
    pub fn claim_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<ClaimedWork>> {
        let mut conn = self.conn.lock().unwrap();
        let now_str = db_time(now);
        let tx = conn.transaction()?;

        // Collect eagerly so `stmt` is dropped before the UPDATEs below.
        let due: Vec<ClaimedWork> = {
            let mut stmt = tx.prepare_cached(
                "SELECT name, id, attempt FROM work
                 WHERE status = 'pending' AND run_at <= ?1
                 ORDER BY expedited DESC, run_at",
            )?;
            let rows: Vec<_> = stmt
                .query_map([&now_str], |row| {
                    Ok(ClaimedWork {
                        name: row.get(0)?,
                        id: row.get(1)?,
                        attempt: row.get(2)?,
                    })
                })?
                .filter_map(|r| match r {
                    Ok(work) => Some(work),
                    Err(e) => {
                        warn!("skipping unreadable work row: {e}");
                        None
                    }
                })
                .take(limit)
                .collect();
            rows
        };

        for work in &due {
            tx.execute(
                "UPDATE work SET status = 'running', updated_at = ?1
                 WHERE name = ?2 AND id = ?3",
                rusqlite::params![now_str, work.name, work.id],
            )?;
        }
        tx.commit()?;
        Ok(due)
    }

    /// Whether `id` is still the live generation for `name`.
    pub fn is_current(&self, name: &str, id: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let current: Option<String> = conn
            .query_row("SELECT id FROM work WHERE name = ?1", [name], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(current.as_deref() == Some(id))
    }

    /// Drop a successfully finished row. Returns `false` when the row was
    /// replaced while running; the newer submission is left untouched.
    pub fn finish(&self, name: &str, id: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "DELETE FROM work WHERE name = ?1 AND id = ?2 AND status = 'running'",
            [name, id],
        )?;
        Ok(n > 0)
    }

    /// Put a failed row back to `pending` after its backoff delay.
    ///
    /// Returns the new `run_at`, or `None` when the row was replaced meanwhile.
    pub fn retry(&self, now: DateTime<Utc>, name: &str, id: &str) -> Result<Option<DateTime<Utc>>> {
        let conn = self.conn.lock().unwrap();
        let row: Option<(u32, String, i64)> = conn
            .query_row(
                "SELECT attempt, backoff_kind, backoff_base_ms FROM work
                 WHERE name = ?1 AND id = ?2 AND status = 'running'",
                [name, id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        let Some((attempt, kind, base_ms)) = row else {
            return Ok(None);
        };

        let kind: BackoffKind = kind.parse().map_err(|reason| SchedulerError::CorruptRow {
            name: name.to_string(),
            reason,
        })?;
        let policy = BackoffPolicy {
            kind,
            base: Duration::from_millis(base_ms.max(0) as u64),
        };
        let attempt = attempt + 1;
        let run_at = after(now, policy.delay_for_attempt(attempt));

        conn.execute(
            "UPDATE work SET status = 'pending', attempt = ?1, run_at = ?2, updated_at = ?3
             WHERE name = ?4 AND id = ?5",
            rusqlite::params![attempt, db_time(run_at), db_time(now), name, id],
        )?;
        info!(%name, attempt, run_at = %db_time(run_at), "work scheduled for retry");
        Ok(Some(run_at))
    }

    /// Return rows a dead process left `running` to `pending`.
    pub fn requeue_running(&self, now: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "UPDATE work SET status = 'pending', updated_at = ?1 WHERE status = 'running'",
            [db_time(now)],
        )?;
        Ok(n)
    }
}

impl WorkQueue for SqliteWorkQueue {
    fn enqueue_unique_work(
        &self,
        name: &str,
        policy: ExistingWorkPolicy,
        request: WorkRequest,
    ) -> Result<()> {
        self.enqueue_at(Utc::now(), name, policy, &request)
    }
}

/// Fixed-width RFC 3339 so lexicographic order in SQL matches time order.
pub(crate) fn db_time(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// 9999-12-31T23:59:59Z, the last instant [`db_time`] renders with a
/// four-digit year. Later years gain a sign prefix and sort before the present.
const LATEST_DB_SECS: i64 = 253_402_300_799;

/// `now + d`, saturating at the latest instant the `run_at` column orders correctly.
pub(crate) fn after(now: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(d)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .filter(|t| t.timestamp() <= LATEST_DB_SECS)
        .or_else(|| DateTime::from_timestamp(LATEST_DB_SECS, 0))
        .unwrap_or(now)
}

fn parse_time(name: &str, s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| SchedulerError::CorruptRow {
            name: name.to_string(),
            reason: format!("bad timestamp {s:?}: {e}"),
        })
}

/// Undecoded `work` row, column order as in the SELECTs above.
struct RawRow {
    name: String,
    id: String,
    status: String,
    run_at: String,
    attempt: u32,
    backoff_kind: String,
    backoff_base_ms: i64,
    expedited: bool,
    created_at: String,
    updated_at: String,
}

impl RawRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            name: row.get(0)?,
            id: row.get(1)?,
            status: row.get(2)?,
            run_at: row.get(3)?,
            attempt: row.get(4)?,
            backoff_kind: row.get(5)?,
            backoff_base_ms: row.get(6)?,
            expedited: row.get(7)?,
            created_at: row.get(8)?,
            updated_at: row.get(9)?,
        })
    }

    fn decode(self) -> Result<WorkInfo> {
        let corrupt = |reason: String| SchedulerError::CorruptRow {
            name: self.name.clone(),
            reason,
        };
        let status: WorkStatus = self.status.parse().map_err(corrupt)?;
        let kind: BackoffKind = self.backoff_kind.parse().map_err(corrupt)?;
        Ok(WorkInfo {
            run_at: parse_time(&self.name, &self.run_at)?,
            created_at: parse_time(&self.name, &self.created_at)?,
            updated_at: parse_time(&self.name, &self.updated_at)?,
            status,
            attempt: self.attempt,
            backoff: BackoffPolicy {
                kind,
                base: Duration::from_millis(self.backoff_base_ms.max(0) as u64),
            },
            expedited: self.expedited,
            id: self.id,
            name: self.name,
        })
    }
}
