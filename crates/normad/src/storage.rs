//! SQLite-backed run store: `runs`, `steps`, `events` (spec Section 4.2).
//!
//! All writes that span tables happen in a single transaction; event `seq`
//! is computed as `1 + max(seq)` inside that same transaction so concurrent
//! commits against different runs never interleave one run's sequence.

use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use norma_core::events::EventPayload;
use norma_core::types::{Id, Run, RunStatus, Step, StepRole, StepStatus};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("run {0} not found")]
    RunNotFound(String),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

const RUNS_COLUMNS: &str =
    "run_id, created_at, task_id, goal, status, iteration, current_step_index, verdict, run_dir";
const STEPS_COLUMNS: &str =
    "run_id, step_index, role, iteration, status, step_dir, started_at, ended_at, summary";

/// Fields a controller wants to change on a run, alongside an optional
/// accompanying event (spec Section 4.2: `UpdateRun(run_id, update, event?)`).
#[derive(Debug, Clone, Default)]
pub struct RunUpdate {
    pub status: Option<RunStatus>,
    pub iteration: Option<u32>,
    pub current_step_index: Option<u32>,
    pub verdict: Option<Option<String>>,
}

#[derive(Debug)]
pub struct Storage {
    pool: SqlitePool,
}

impl Storage {
    pub async fn new(db_path: &Path) -> Result<Self, StorageError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StorageError::Db(sqlx::Error::Io(e))
            })?;
        }
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", db_path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new().connect_with(options).await?;
        Ok(Self { pool })
    }

    /// Apply the embedded schema. Idempotent: the migration uses
    /// `CREATE TABLE IF NOT EXISTS`.
    pub async fn migrate_embedded(&self) -> Result<(), StorageError> {
        const MIGRATION: &str = include_str!("../migrations/0001_init.sql");
        for statement in MIGRATION.split(';') {
            let statement = statement.trim();
            if statement.is_empty() {
                continue;
            }
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// `CreateRun`: inserts the `runs` row (status `running`) and a
    /// `run_started` event at seq 1, in one transaction.
    pub async fn create_run(
        &self,
        run_id: &str,
        task_id: &str,
        goal: &str,
        run_dir: &str,
    ) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now();
        sqlx::query(&format!("INSERT INTO runs ({RUNS_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"))
            .bind(run_id)
            .bind(now.to_rfc3339())
            .bind(task_id)
            .bind(goal)
            .bind(RunStatus::Running.as_str())
            .bind(1_i64)
            .bind(0_i64)
            .bind(Option::<String>::None)
            .bind(run_dir)
            .execute(&mut *tx)
            .await?;

        let payload = EventPayload::RunStarted(norma_core::events::RunStartedPayload {
            task_id: task_id.to_string(),
            goal: goal.to_string(),
        });
        insert_event(&mut tx, run_id, &payload, "run started").await?;

        tx.commit().await?;
        Ok(())
    }

    /// `CommitStep`: inserts the `steps` row, appends events with fresh
    /// monotonic seqs, and applies the run update — all atomically.
    pub async fn commit_step(
        &self,
        step: &Step,
        events: &[(EventPayload, String)],
        run_update: &RunUpdate,
    ) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(&format!("INSERT INTO steps ({STEPS_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"))
            .bind(&step.run_id)
            .bind(i64::from(step.step_index))
            .bind(step.role.as_str())
            .bind(i64::from(step.iteration))
            .bind(step.status.as_str())
            .bind(&step.step_dir)
            .bind(step.started_at.to_rfc3339())
            .bind(step.ended_at.map(|t| t.to_rfc3339()))
            .bind(&step.summary)
            .execute(&mut *tx)
            .await?;

        for (payload, message) in events {
            insert_event(&mut tx, &step.run_id, payload, message).await?;
        }

        apply_run_update(&mut tx, &step.run_id, run_update).await?;

        tx.commit().await?;
        Ok(())
    }

    /// `UpdateRun`: appends an optional event, then applies the run update.
    pub async fn update_run(
        &self,
        run_id: &str,
        update: &RunUpdate,
        event: Option<(EventPayload, String)>,
    ) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await?;
        if let Some((payload, message)) = event {
            insert_event(&mut tx, run_id, &payload, &message).await?;
        }
        apply_run_update(&mut tx, run_id, update).await?;
        tx.commit().await?;
        Ok(())
    }

    /// `GetRunStatus`: read-only.
    pub async fn get_run(&self, run_id: &str) -> Result<Run, StorageError> {
        let row = sqlx::query(&format!("SELECT {RUNS_COLUMNS} FROM runs WHERE run_id = ?"))
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StorageError::RunNotFound(run_id.to_string()))?;
        row_into_run(&row)
    }

    pub async fn list_steps(&self, run_id: &str) -> Result<Vec<Step>, StorageError> {
        let rows = sqlx::query(&format!(
            "SELECT {STEPS_COLUMNS} FROM steps WHERE run_id = ? ORDER BY step_index ASC"
        ))
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_into_step).collect()
    }

    /// All runs, newest first — the scan order `PruneRuns` ranks against.
    pub async fn list_runs(&self) -> Result<Vec<Run>, StorageError> {
        let rows = sqlx::query(&format!("SELECT {RUNS_COLUMNS} FROM runs ORDER BY created_at DESC"))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_into_run).collect()
    }

    /// Deletes a run's events, steps, and row, in that order, in one
    /// transaction (no `ON DELETE CASCADE` on the embedded schema).
    pub async fn delete_run(&self, run_id: &str) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM events WHERE run_id = ?")
            .bind(run_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM steps WHERE run_id = ?")
            .bind(run_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM runs WHERE run_id = ?")
            .bind(run_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Empties `runs`, `steps`, and `events` — the global reset half of
    /// `Prune(repoRoot)`.
    pub async fn truncate_all(&self) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM events").execute(&mut *tx).await?;
        sqlx::query("DELETE FROM steps").execute(&mut *tx).await?;
        sqlx::query("DELETE FROM runs").execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

async fn insert_event(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    run_id: &str,
    payload: &EventPayload,
    message: &str,
) -> Result<(), StorageError> {
    let next_seq: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(seq), 0) + 1 FROM events WHERE run_id = ?")
        .bind(run_id)
        .fetch_one(&mut **tx)
        .await?;

    let data_json = payload.to_json()?;
    sqlx::query(
        "INSERT INTO events (id, run_id, seq, ts, event_type, message, data_json) VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(Id::new().to_string())
    .bind(run_id)
    .bind(next_seq)
    .bind(Utc::now().to_rfc3339())
    .bind(payload.event_type().as_str())
    .bind(message)
    .bind(data_json)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn apply_run_update(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    run_id: &str,
    update: &RunUpdate,
) -> Result<(), StorageError> {
    if let Some(status) = update.status {
        sqlx::query("UPDATE runs SET status = ? WHERE run_id = ?")
            .bind(status.as_str())
            .bind(run_id)
            .execute(&mut **tx)
            .await?;
    }
    if let Some(iteration) = update.iteration {
        sqlx::query("UPDATE runs SET iteration = ? WHERE run_id = ?")
            .bind(i64::from(iteration))
            .bind(run_id)
            .execute(&mut **tx)
            .await?;
    }
    if let Some(step_index) = update.current_step_index {
        sqlx::query("UPDATE runs SET current_step_index = ? WHERE run_id = ?")
            .bind(i64::from(step_index))
            .bind(run_id)
            .execute(&mut **tx)
            .await?;
    }
    if let Some(verdict) = &update.verdict {
        sqlx::query("UPDATE runs SET verdict = ? WHERE run_id = ?")
            .bind(verdict)
            .bind(run_id)
            .execute(&mut **tx)
            .await?;
    }
    Ok(())
}

fn row_into_run(row: &sqlx::sqlite::SqliteRow) -> Result<Run, StorageError> {
    let status: String = row.try_get("status")?;
    let created_at: String = row.try_get("created_at")?;
    Ok(Run {
        run_id: row.try_get("run_id")?,
        created_at: parse_ts(&created_at)?,
        task_id: row.try_get("task_id")?,
        goal: row.try_get("goal")?,
        status: RunStatus::from_str_opt(&status)
            .ok_or_else(|| StorageError::Db(sqlx::Error::ColumnDecode {
                index: "status".to_string(),
                source: format!("unknown run status: {status}").into(),
            }))?,
        iteration: row.try_get::<i64, _>("iteration")? as u32,
        current_step_index: row.try_get::<i64, _>("current_step_index")? as u32,
        verdict: row.try_get("verdict")?,
        run_dir: row.try_get("run_dir")?,
    })
}

fn row_into_step(row: &sqlx::sqlite::SqliteRow) -> Result<Step, StorageError> {
    let role: String = row.try_get("role")?;
    let status: String = row.try_get("status")?;
    let started_at: String = row.try_get("started_at")?;
    let ended_at: Option<String> = row.try_get("ended_at")?;
    Ok(Step {
        run_id: row.try_get("run_id")?,
        step_index: row.try_get::<i64, _>("step_index")? as u32,
        role: StepRole::from_str_opt(&role)
            .ok_or_else(|| StorageError::Db(sqlx::Error::ColumnDecode {
                index: "role".to_string(),
                source: format!("unknown step role: {role}").into(),
            }))?,
        iteration: row.try_get::<i64, _>("iteration")? as u32,
        status: StepStatus::from_str_opt(&status)
            .ok_or_else(|| StorageError::Db(sqlx::Error::ColumnDecode {
                index: "status".to_string(),
                source: format!("unknown step status: {status}").into(),
            }))?,
        step_dir: row.try_get("step_dir")?,
        started_at: parse_ts(&started_at)?,
        ended_at: ended_at.as_deref().map(parse_ts).transpose()?,
        summary: row.try_get("summary")?,
    })
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StorageError::Db(sqlx::Error::ColumnDecode {
            index: "timestamp".to_string(),
            source: e.into(),
        }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    struct TestStorage {
        storage: Storage,
        _dir: TempDir,
    }

    async fn test_storage() -> TestStorage {
        let dir = TempDir::new().unwrap();
        let storage = Storage::new(&dir.path().join("norma.db")).await.unwrap();
        storage.migrate_embedded().await.unwrap();
        TestStorage { storage, _dir: dir }
    }

    #[tokio::test]
    async fn create_run_inserts_row_and_started_event() {
        let ts = test_storage().await;
        ts.storage
            .create_run("20260101-000000-abcdef", "norma-a3f2dd", "Fix panic", "/runs/r1")
            .await
            .unwrap();

        let run = ts.storage.get_run("20260101-000000-abcdef").await.unwrap();
        assert_eq!(run.status, RunStatus::Running);
        assert_eq!(run.task_id, "norma-a3f2dd");
        assert_eq!(run.iteration, 1);

        let seq: i64 = sqlx::query_scalar("SELECT seq FROM events WHERE run_id = ?")
            .bind("20260101-000000-abcdef")
            .fetch_one(ts.storage.pool())
            .await
            .unwrap();
        assert_eq!(seq, 1);
    }

    #[tokio::test]
    async fn commit_step_assigns_monotonic_event_seqs() {
        let ts = test_storage().await;
        ts.storage
            .create_run("20260101-000000-abcdef", "norma-a3f2dd", "Fix panic", "/runs/r1")
            .await
            .unwrap();

        let step = Step {
            run_id: "20260101-000000-abcdef".to_string(),
            step_index: 1,
            role: StepRole::Plan,
            iteration: 1,
            status: StepStatus::Ok,
            step_dir: "/runs/r1/steps/01-plan".to_string(),
            started_at: Utc::now(),
            ended_at: Some(Utc::now()),
            summary: Some("planned".to_string()),
        };
        let events = vec![(
            EventPayload::StepStarted(norma_core::events::StepStartedPayload {
                step_index: 1,
                role: StepRole::Plan,
                iteration: 1,
                attempt: 1,
            }),
            "step started".to_string(),
        )];
        ts.storage
            .commit_step(&step, &events, &RunUpdate { current_step_index: Some(1), ..Default::default() })
            .await
            .unwrap();

        let seqs: Vec<i64> = sqlx::query_scalar("SELECT seq FROM events WHERE run_id = ? ORDER BY seq")
            .bind("20260101-000000-abcdef")
            .fetch_all(ts.storage.pool())
            .await
            .unwrap();
        assert_eq!(seqs, vec![1, 2]);

        let run = ts.storage.get_run("20260101-000000-abcdef").await.unwrap();
        assert_eq!(run.current_step_index, 1);

        let steps = ts.storage.list_steps("20260101-000000-abcdef").await.unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].role, StepRole::Plan);
    }

    #[tokio::test]
    async fn update_run_applies_terminal_status() {
        let ts = test_storage().await;
        ts.storage
            .create_run("20260101-000000-abcdef", "norma-a3f2dd", "Fix panic", "/runs/r1")
            .await
            .unwrap();

        ts.storage
            .update_run(
                "20260101-000000-abcdef",
                &RunUpdate { status: Some(RunStatus::Passed), verdict: Some(Some("PASS".to_string())), ..Default::default() },
                Some((
                    EventPayload::RunPassed(norma_core::events::RunPassedPayload { iteration: 1 }),
                    "run passed".to_string(),
                )),
            )
            .await
            .unwrap();

        let run = ts.storage.get_run("20260101-000000-abcdef").await.unwrap();
        assert_eq!(run.status, RunStatus::Passed);
        assert_eq!(run.verdict.as_deref(), Some("PASS"));
    }

    #[tokio::test]
    async fn get_run_errors_on_unknown_run() {
        let ts = test_storage().await;
        let err = ts.storage.get_run("does-not-exist").await.unwrap_err();
        assert!(matches!(err, StorageError::RunNotFound(_)));
    }
}
