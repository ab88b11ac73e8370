use rusqlite::Connection;

use crate::error::Result;

/// Initialise the job schema in `conn`. Idempotent.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS jobs (
            id                       TEXT    NOT NULL PRIMARY KEY,
            name                     TEXT    NOT NULL,
            rule                     TEXT    NOT NULL,   -- JSON-encoded RecurrenceRule
            script                   TEXT    NOT NULL,
            timeout_ms               INTEGER NOT NULL,
            total_runs               INTEGER NOT NULL DEFAULT 0,
            successful_runs          INTEGER NOT NULL DEFAULT 0,
            consecutive_failures     INTEGER NOT NULL DEFAULT 0,
            max_consecutive_failures INTEGER NOT NULL,
            status                   TEXT    NOT NULL DEFAULT 'active',
            last_completed           TEXT,               -- RFC 3339 or NULL
            payload                  TEXT    NOT NULL DEFAULT 'null',
            created_at               TEXT    NOT NULL,
            updated_at               TEXT    NOT NULL
        ) STRICT;

        CREATE TABLE IF NOT EXISTS job_instances (
            id               TEXT    NOT NULL PRIMARY KEY,
            job_id           TEXT    NOT NULL REFERENCES jobs (id) ON DELETE CASCADE,
            scheduled_at     TEXT    NOT NULL,
            occurrence_index INTEGER NOT NULL,
            status           TEXT    NOT NULL DEFAULT 'scheduled',
            timeout_ms       INTEGER NOT NULL,
            started_at       TEXT,
            ended_at         TEXT,
            exit_code        INTEGER,
            stdout           TEXT    NOT NULL DEFAULT '',
            stderr           TEXT    NOT NULL DEFAULT '',
            error            TEXT
        ) STRICT;

        -- Orphan recovery: SELECT … WHERE job_id = ? AND status = 'scheduled'
        CREATE INDEX IF NOT EXISTS idx_job_instances_job_status
            ON job_instances (job_id, status, occurrence_index);
        ",
    )?;
    Ok(())
}
