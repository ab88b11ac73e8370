//! SQLite-backed repository used by the daemon.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{types::Type, Connection, OptionalExtension, Row};
use tracing::{debug, info, instrument};

use crate::{
    db::init_db,
    error::{Result, StoreError},
    repository::JobRepository,
    types::{
        InstanceId, InstanceStatus, Job, JobId, JobInstance, JobStatus, NewInstance, NewJob,
    },
};

const JOB_COLUMNS: &str = "id, name, rule, script, timeout_ms, total_runs, successful_runs,
     consecutive_failures, max_consecutive_failures, status, last_completed,
     payload, created_at, updated_at";

const INSTANCE_COLUMNS: &str = "id, job_id, scheduled_at, occurrence_index, status, timeout_ms,
     started_at, ended_at, exit_code, stdout, stderr, error";

/// Thread-safe repository over a single SQLite connection.
pub struct SqliteRepository {
    db: Mutex<Connection>,
}

impl SqliteRepository {
    /// Wrap an open connection, creating the schema if needed.
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
        })
    }

    /// Open (or create) the database file at `path` in WAL mode.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        info!(path = %path.display(), "job database opened");
        Self::new(conn)
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Self::new(conn)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.db.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl JobRepository for SqliteRepository {
    #[instrument(skip(self))]
    async fn get_jobs(&self) -> Result<Vec<Job>> {
        let db = self.conn();
        let mut stmt = db.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs ORDER BY created_at, id"
        ))?;
        let rows = stmt.query_map([], row_to_job)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    #[instrument(skip(self), fields(job_id = %id))]
    async fn get_job(&self, id: &JobId) -> Result<Option<Job>> {
        let db = self.conn();
        let job = db
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                [id.as_str()],
                row_to_job,
            )
            .optional()?;
        Ok(job)
    }

    #[instrument(skip(self, job), fields(job_id = %job.id))]
    async fn save_job(&self, job: &Job) -> Result<Job> {
        let mut saved = job.clone();
        saved.updated_at = Utc::now();
        let rule = serde_json::to_string(&saved.rule)?;
        let payload = serde_json::to_string(&saved.payload)?;

        let db = self.conn();
        let n = db.execute(
            "UPDATE jobs
             SET name = ?2, rule = ?3, script = ?4, timeout_ms = ?5,
                 total_runs = ?6, successful_runs = ?7, consecutive_failures = ?8,
                 max_consecutive_failures = ?9, status = ?10, last_completed = ?11,
                 payload = ?12, updated_at = ?13
             WHERE id = ?1",
            rusqlite::params![
                saved.id.as_str(),
                saved.name,
                rule,
                path_to_text(&saved.script),
                saved.timeout_ms,
                saved.total_runs,
                saved.successful_runs,
                saved.consecutive_failures,
                saved.max_consecutive_failures,
                saved.status.to_string(),
                saved.last_completed.map(to_text),
                payload,
                to_text(saved.updated_at),
            ],
        )?;
        if n == 0 {
            return Err(StoreError::JobNotFound {
                id: saved.id.to_string(),
            });
        }
        Ok(saved)
    }

    #[instrument(skip(self, new_job), fields(name = %new_job.name))]
    async fn create_job(&self, new_job: NewJob) -> Result<Job> {
        let job = new_job.into_job(Utc::now());
        let rule = serde_json::to_string(&job.rule)?;
        let payload = serde_json::to_string(&job.payload)?;

        let db = self.conn();
        let n = db.execute(
            &format!(
                "INSERT OR IGNORE INTO jobs ({JOB_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, 0, 0, 0, ?6, ?7, NULL, ?8, ?9, ?9)"
            ),
            rusqlite::params![
                job.id.as_str(),
                job.name,
                rule,
                path_to_text(&job.script),
                job.timeout_ms,
                job.max_consecutive_failures,
                job.status.to_string(),
                payload,
                to_text(job.created_at),
            ],
        )?;
        if n == 0 {
            return Err(StoreError::DuplicateJob {
                id: job.id.to_string(),
            });
        }
        debug!(job_id = %job.id, "job created");
        Ok(job)
    }

    #[instrument(skip(self), fields(job_id = %id))]
    async fn remove_job(&self, id: &JobId) -> Result<()> {
        let mut db = self.conn();
        let tx = db.transaction()?;
        tx.execute("DELETE FROM job_instances WHERE job_id = ?1", [id.as_str()])?;
        let n = tx.execute("DELETE FROM jobs WHERE id = ?1", [id.as_str()])?;
        if n == 0 {
            return Err(StoreError::JobNotFound { id: id.to_string() });
        }
        tx.commit()?;
        Ok(())
    }

    #[instrument(skip(self, init), fields(job_id = %job_id, index = init.occurrence_index))]
    async fn add_instance(&self, job_id: &JobId, init: NewInstance) -> Result<JobInstance> {
        let instance = init.into_instance(job_id.clone());
        let db = self.conn();
        let exists: bool = db.query_row(
            "SELECT EXISTS(SELECT 1 FROM jobs WHERE id = ?1)",
            [job_id.as_str()],
            |row| row.get(0),
        )?;
        if !exists {
            return Err(StoreError::JobNotFound {
                id: job_id.to_string(),
            });
        }
        db.execute(
            &format!(
                "INSERT INTO job_instances ({INSTANCE_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL, NULL, NULL, '', '', NULL)"
            ),
            rusqlite::params![
                instance.id.as_str(),
                job_id.as_str(),
                to_text(instance.scheduled_at),
                instance.occurrence_index,
                instance.status.to_string(),
                instance.timeout_ms,
            ],
        )?;
        Ok(instance)
    }

    #[instrument(skip(self, instance), fields(instance_id = %instance.id, status = %instance.status))]
    async fn save_instance(&self, instance: &JobInstance) -> Result<JobInstance> {
        let db = self.conn();
        let n = db.execute(
            "UPDATE job_instances
             SET scheduled_at = ?2, occurrence_index = ?3, status = ?4, timeout_ms = ?5,
                 started_at = ?6, ended_at = ?7, exit_code = ?8,
                 stdout = ?9, stderr = ?10, error = ?11
             WHERE id = ?1",
            rusqlite::params![
                instance.id.as_str(),
                to_text(instance.scheduled_at),
                instance.occurrence_index,
                instance.status.to_string(),
                instance.timeout_ms,
                instance.started_at.map(to_text),
                instance.ended_at.map(to_text),
                instance.exit_code,
                instance.stdout,
                instance.stderr,
                instance.error,
            ],
        )?;
        if n == 0 {
            return Err(StoreError::InstanceNotFound {
                id: instance.id.to_string(),
            });
        }
        Ok(instance.clone())
    }

    #[instrument(skip(self), fields(instance_id = %id))]
    async fn get_instance(&self, id: &InstanceId) -> Result<Option<JobInstance>> {
        let db = self.conn();
        let instance = db
            .query_row(
                &format!("SELECT {INSTANCE_COLUMNS} FROM job_instances WHERE id = ?1"),
                [id.as_str()],
                row_to_instance,
            )
            .optional()?;
        Ok(instance)
    }

    #[instrument(skip(self), fields(job_id = %job_id, %status))]
    async fn instances_with_status(
        &self,
        job_id: &JobId,
        status: InstanceStatus,
    ) -> Result<Vec<JobInstance>> {
        let db = self.conn();
        let mut stmt = db.prepare(&format!(
            "SELECT {INSTANCE_COLUMNS} FROM job_instances
             WHERE job_id = ?1 AND status = ?2
             ORDER BY occurrence_index"
        ))?;
        let rows = stmt.query_map(
            rusqlite::params![job_id.as_str(), status.to_string()],
            row_to_instance,
        )?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    async fn flush(&self) -> Result<()> {
        let db = self.conn();
        // Returns (busy, log frames, checkpointed frames).
        let (busy, log, checkpointed): (i64, i64, i64) =
            db.query_row("PRAGMA wal_checkpoint(PASSIVE)", [], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?;
        debug!(busy, log, checkpointed, "wal checkpoint");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn to_text(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn path_to_text(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn conversion_error<E>(idx: usize, e: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
}

fn parse_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let text: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

fn parse_opt_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let text: Option<String> = row.get(idx)?;
    text.map(|t| {
        DateTime::parse_from_rfc3339(&t)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| conversion_error(idx, e))
    })
    .transpose()
}

fn parse_json<T: serde::de::DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let text: String = row.get(idx)?;
    serde_json::from_str(&text).map_err(|e| conversion_error(idx, e))
}

fn parse_status<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: std::str::FromStr<Err = String>,
{
    let text: String = row.get(idx)?;
    text.parse::<T>()
        .map_err(|e| conversion_error(idx, std::io::Error::new(std::io::ErrorKind::InvalidData, e)))
}

fn row_to_job(row: &Row<'_>) -> rusqlite::Result<Job> {
    Ok(Job {
        id: JobId(row.get(0)?),
        name: row.get(1)?,
        rule: parse_json(row, 2)?,
        script: PathBuf::from(row.get::<_, String>(3)?),
        timeout_ms: row.get(4)?,
        total_runs: row.get(5)?,
        successful_runs: row.get(6)?,
        consecutive_failures: row.get(7)?,
        max_consecutive_failures: row.get(8)?,
        status: parse_status::<JobStatus>(row, 9)?,
        last_completed: parse_opt_ts(row, 10)?,
        payload: parse_json(row, 11)?,
        created_at: parse_ts(row, 12)?,
        updated_at: parse_ts(row, 13)?,
    })
}

fn row_to_instance(row: &Row<'_>) -> rusqlite::Result<JobInstance> {
    Ok(JobInstance {
        id: InstanceId(row.get(0)?),
        job_id: JobId(row.get(1)?),
        scheduled_at: parse_ts(row, 2)?,
        occurrence_index: row.get(3)?,
        status: parse_status::<InstanceStatus>(row, 4)?,
        timeout_ms: row.get(5)?,
        started_at: parse_opt_ts(row, 6)?,
        ended_at: parse_opt_ts(row, 7)?,
        exit_code: row.get(8)?,
        stdout: row.get(9)?,
        stderr: row.get(10)?,
        error: row.get(11)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_recurrence::{DayOfMonth, Frequency, RecurrenceRule};
    use chrono::TimeZone;

    fn new_job(id: &str) -> NewJob {
        NewJob {
            id: Some(JobId::from(id)),
            name: format!("{id} report"),
            rule: RecurrenceRule::new(
                Frequency::Month {
                    day_of_month: DayOfMonth::Last,
                },
                Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            )
            .with_clock(18, 30)
            .with_cap(12),
            script: PathBuf::from("/opt/scripts/report.sh"),
            timeout_ms: 60_000,
            max_consecutive_failures: 3,
            payload: serde_json::json!({"region": "eu"}),
        }
    }

    #[tokio::test]
    async fn job_round_trips_through_sqlite() {
        let repo = SqliteRepository::in_memory().unwrap();
        let created = repo.create_job(new_job("monthly")).await.unwrap();

        let loaded = repo.get_job(&created.id).await.unwrap().unwrap();
        assert_eq!(loaded.rule, created.rule);
        assert_eq!(loaded.payload, serde_json::json!({"region": "eu"}));
        assert_eq!(loaded.status, JobStatus::Active);
        assert_eq!(loaded.script, PathBuf::from("/opt/scripts/report.sh"));
    }

    #[tokio::test]
    async fn save_job_persists_counters() {
        let repo = SqliteRepository::in_memory().unwrap();
        let mut job = repo.create_job(new_job("monthly")).await.unwrap();

        let done = Utc.with_ymd_and_hms(2024, 1, 31, 18, 31, 0).unwrap();
        job.total_runs = 4;
        job.successful_runs = 3;
        job.consecutive_failures = 1;
        job.status = JobStatus::Disabled;
        job.last_completed = Some(done);
        repo.save_job(&job).await.unwrap();

        let loaded = repo.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(loaded.total_runs, 4);
        assert_eq!(loaded.successful_runs, 3);
        assert_eq!(loaded.consecutive_failures, 1);
        assert_eq!(loaded.status, JobStatus::Disabled);
        assert_eq!(loaded.last_completed, Some(done));
    }

    #[tokio::test]
    async fn duplicate_and_missing_jobs_are_reported() {
        let repo = SqliteRepository::in_memory().unwrap();
        repo.create_job(new_job("a")).await.unwrap();
        assert!(matches!(
            repo.create_job(new_job("a")).await,
            Err(StoreError::DuplicateJob { .. })
        ));
        assert!(matches!(
            repo.remove_job(&JobId::from("missing")).await,
            Err(StoreError::JobNotFound { .. })
        ));
        assert!(repo.get_job(&JobId::from("missing")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn instance_lifecycle() {
        let repo = SqliteRepository::in_memory().unwrap();
        let job = repo.create_job(new_job("a")).await.unwrap();
        let at = Utc.with_ymd_and_hms(2024, 1, 31, 18, 30, 0).unwrap();
        let mut instance = repo
            .add_instance(
                &job.id,
                NewInstance {
                    scheduled_at: at,
                    occurrence_index: 0,
                    timeout_ms: 60_000,
                },
            )
            .await
            .unwrap();

        instance.status = InstanceStatus::Errored;
        instance.started_at = Some(at);
        instance.ended_at = Some(at + chrono::Duration::seconds(2));
        instance.exit_code = Some(2);
        instance.stderr = "disk full\n".into();
        instance.error = Some("script exited with code 2".into());
        repo.save_instance(&instance).await.unwrap();

        let loaded = repo.get_instance(&instance.id).await.unwrap().unwrap();
        assert_eq!(loaded, instance);
        assert_eq!(loaded.duration(), Some(chrono::Duration::seconds(2)));
        assert!(repo
            .instances_with_status(&job.id, InstanceStatus::Scheduled)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn instance_for_unknown_job_is_rejected() {
        let repo = SqliteRepository::in_memory().unwrap();
        let result = repo
            .add_instance(
                &JobId::from("nope"),
                NewInstance {
                    scheduled_at: Utc::now(),
                    occurrence_index: 0,
                    timeout_ms: 1,
                },
            )
            .await;
        assert!(matches!(result, Err(StoreError::JobNotFound { .. })));
    }

    #[tokio::test]
    async fn file_database_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("cadence.db");
        {
            let repo = SqliteRepository::open(&path).unwrap();
            repo.create_job(new_job("persisted")).await.unwrap();
            repo.flush().await.unwrap();
        }
        let repo = SqliteRepository::open(&path).unwrap();
        assert_eq!(repo.get_jobs().await.unwrap().len(), 1);
    }
}
