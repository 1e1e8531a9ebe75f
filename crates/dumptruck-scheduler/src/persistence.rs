//! SQLite-backed run history.
//! One row per run: what the operator inspects, and what `depends_on_past`
//! and catchup resumption read.

use std::path::Path;

use chrono::{DateTime, Utc};
use dumptruck_core::error::{DumptruckError, Result};

use crate::tasks::{RunKind, RunReport, RunState};

/// SQLite-backed run ledger.
pub struct RunHistory {
    conn: rusqlite::Connection,
}

impl RunHistory {
    /// Open or create the history database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = rusqlite::Connection::open(path).map_err(|e| db_err("open", e))?;
        let db = Self { conn };
        db.migrate()?;
        Ok(db)
    }

    /// Throwaway in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        let conn = rusqlite::Connection::open_in_memory().map_err(|e| db_err("open", e))?;
        let db = Self { conn };
        db.migrate()?;
        Ok(db)
    }

    /// Run migrations to create tables.
    fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
            CREATE TABLE IF NOT EXISTS runs (
                run_id TEXT PRIMARY KEY,
                job_id TEXT NOT NULL,
                kind TEXT NOT NULL,             -- 'scheduled', 'manual'
                logical_date TEXT NOT NULL,
                state TEXT NOT NULL,            -- 'running', 'success', 'failed', 'cancelled', 'skipped'
                reason TEXT,
                attempts INTEGER NOT NULL DEFAULT 0,
                started_at TEXT NOT NULL,
                finished_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_runs_job_started ON runs(job_id, started_at);
         ",
            )
            .map_err(|e| db_err("migration", e))
    }

    /// Insert or update a run.
    pub fn record(&self, report: &RunReport) -> Result<()> {
        self.conn
            .execute(
                "INSERT OR REPLACE INTO runs
                 (run_id, job_id, kind, logical_date, state, reason, attempts, started_at, finished_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                rusqlite::params![
                    report.run_id,
                    report.job_id,
                    report.kind.to_string(),
                    report.logical_date.to_rfc3339(),
                    report.state.label(),
                    report.state.reason(),
                    report.attempts,
                    report.started_at.to_rfc3339(),
                    report.finished_at.map(|t| t.to_rfc3339()),
                ],
            )
            .map_err(|e| db_err("record run", e))?;
        Ok(())
    }

    /// Most recent runs first.
    pub fn recent(&self, job_id: &str, limit: usize) -> Result<Vec<RunReport>> {
        self.select_runs("", job_id, limit)
    }

    fn select_runs(&self, filter: &str, job_id: &str, limit: usize) -> Result<Vec<RunReport>> {
        let sql = format!(
            "SELECT run_id, job_id, kind, logical_date, state, reason, attempts, started_at, finished_at
             FROM runs WHERE job_id = ?1 {filter} ORDER BY started_at DESC, rowid DESC LIMIT ?2"
        );
        let mut stmt = self.conn.prepare(&sql).map_err(|e| db_err("prepare", e))?;

        let rows = stmt
            .query_map(rusqlite::params![job_id, limit as i64], |row| {
                let kind: String = row.get(2)?;
                let logical_date: String = row.get(3)?;
                let state: String = row.get(4)?;
                let reason: Option<String> = row.get(5)?;
                let started_at: String = row.get(7)?;
                let finished_at: Option<String> = row.get(8)?;
                Ok(RunReport {
                    run_id: row.get(0)?,
                    job_id: row.get(1)?,
                    kind: if kind == "manual" { RunKind::Manual } else { RunKind::Scheduled },
                    logical_date: parse_time(&logical_date),
                    state: RunState::from_parts(&state, reason),
                    attempts: row.get(6)?,
                    started_at: parse_time(&started_at),
                    finished_at: finished_at.as_deref().map(parse_time),
                })
            })
            .map_err(|e| db_err("query runs", e))?;

        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| db_err("read run", e))
    }

    /// The latest run of a job, if any.
    pub fn last_run(&self, job_id: &str) -> Result<Option<RunReport>> {
        Ok(self.recent(job_id, 1)?.into_iter().next())
    }

    /// The latest run that was not skipped (what `depends_on_past` checks).
    pub fn last_settled_run(&self, job_id: &str) -> Result<Option<RunReport>> {
        Ok(self
            .select_runs("AND state != 'skipped'", job_id, 1)?
            .into_iter()
            .next())
    }

    /// Latest logical date among scheduled runs (catchup resumes after it).
    pub fn last_scheduled_date(&self, job_id: &str) -> Result<Option<DateTime<Utc>>> {
        let value: Option<String> = self
            .conn
            .query_row(
                "SELECT MAX(logical_date) FROM runs WHERE job_id = ?1 AND kind = 'scheduled'",
                [job_id],
                |row| row.get(0),
            )
            .map_err(|e| db_err("query last date", e))?;
        Ok(value.as_deref().map(parse_time))
    }
}

fn parse_time(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

fn db_err(what: &str, e: rusqlite::Error) -> DumptruckError {
    DumptruckError::Database(format!("{what}: {e}"))
}
