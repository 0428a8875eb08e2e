use chrono::{DateTime, TimeZone, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};

use weave_core::config::{BackoffKind, JobBackoff};
use weave_core::error::WeaveError;

use crate::job::{Job, JobState};

pub(crate) const JOB_COLUMNS: &str = "id, queue, kind, payload, priority, state, attempts_made, \
     max_attempts, backoff_kind, backoff_delay_ms, created_at, run_at, finished_at, result, last_error";

pub(crate) fn init(conn: &Connection, durable: bool) -> rusqlite::Result<()> {
    if durable {
        // WAL lets producers in other processes write while we claim jobs
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
    }
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS jobs (
            id TEXT NOT NULL,
            queue TEXT NOT NULL,
            kind TEXT NOT NULL,
            payload TEXT NOT NULL,
            priority INTEGER NOT NULL DEFAULT 0,
            state TEXT NOT NULL,
            attempts_made INTEGER NOT NULL DEFAULT 0,
            max_attempts INTEGER NOT NULL,
            backoff_kind TEXT NOT NULL,
            backoff_delay_ms INTEGER NOT NULL,
            created_at INTEGER NOT NULL,
            run_at INTEGER NOT NULL,
            locked_until INTEGER,
            finished_at INTEGER,
            result TEXT,
            last_error TEXT,
            PRIMARY KEY (queue, id)
        );

        CREATE INDEX IF NOT EXISTS idx_jobs_ready
            ON jobs(queue, state, priority, run_at);

        CREATE INDEX IF NOT EXISTS idx_jobs_finished
            ON jobs(queue, state, finished_at);

        CREATE TABLE IF NOT EXISTS queue_state (
            queue TEXT PRIMARY KEY,
            paused INTEGER NOT NULL DEFAULT 0
        );",
    )
}

pub(crate) fn is_paused(conn: &Connection, queue: &str) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT paused FROM queue_state WHERE queue = ?1",
        params![queue],
        |row| row.get(0),
    )
    .optional()
    .map(|paused| paused.unwrap_or(false))
}

pub(crate) fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn from_ms(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

/// Map a row selected with [`JOB_COLUMNS`].
pub(crate) fn job_from_row(row: &Row<'_>) -> rusqlite::Result<Job> {
    let payload: String = row.get(3)?;
    let state: String = row.get(5)?;
    let backoff_kind: String = row.get(8)?;
    let finished_at: Option<i64> = row.get(12)?;
    let result: Option<String> = row.get(13)?;

    Ok(Job {
        id: row.get(0)?,
        queue: row.get(1)?,
        kind: row.get(2)?,
        payload: json_column(3, &payload)?,
        priority: row.get::<_, i64>(4)? as u32,
        state: JobState::parse(&state).unwrap_or(JobState::Waiting),
        attempts_made: row.get::<_, i64>(6)? as u32,
        max_attempts: row.get::<_, i64>(7)? as u32,
        backoff: JobBackoff {
            kind: BackoffKind::parse(&backoff_kind),
            delay_ms: row.get::<_, i64>(9)? as u64,
        },
        created_at: from_ms(row.get(10)?),
        run_at: from_ms(row.get(11)?),
        finished_at: finished_at.map(from_ms),
        result: result.as_deref().map(|r| json_column(13, r)).transpose()?,
        last_error: row.get(14)?,
    })
}

fn json_column(idx: usize, text: &str) -> rusqlite::Result<serde_json::Value> {
    serde_json::from_str(text)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

/// Map a driver error, keeping JSON decoding failures distinguishable.
pub(crate) fn db_error(e: rusqlite::Error) -> WeaveError {
    match e {
        rusqlite::Error::FromSqlConversionFailure(_, _, source) => {
            match source.downcast::<serde_json::Error>() {
                Ok(json) => WeaveError::Json(*json),
                Err(other) => WeaveError::Database(other.to_string()),
            }
        }
        other => WeaveError::Database(other.to_string()),
    }
}
