// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Job history backed by SQLite.
//
// Terminal job records (never the document bytes) are written here so status
// queries keep working after a record is pruned from memory, and so job ids
// continue from the highest persisted id after a restart.

use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use rusqlite::{Connection, OptionalExtension, params};
use tracing::{debug, info, instrument};

use edgeprint_core::error::{EdgePrintError, Result};
use edgeprint_core::types::{JobId, PrintJob};

/// SQLite schema for the history table.
const CREATE_TABLE_SQL: &str = r#"
    CREATE TABLE IF NOT EXISTS job_history (
        id INTEGER PRIMARY KEY,
        printer TEXT NOT NULL,
        document_name TEXT NOT NULL,
        state TEXT NOT NULL,
        attempts INTEGER NOT NULL,
        last_error TEXT,
        submitted_at TEXT NOT NULL,
        finished_at TEXT,
        record TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS job_history_finished ON job_history (finished_at);
"#;

fn db_err(context: &str) -> impl FnOnce(rusqlite::Error) -> EdgePrintError + '_ {
    move |e| EdgePrintError::Database(format!("{context}: {e}"))
}

/// Persistent store of terminal jobs.
///
/// Methods are synchronous because `rusqlite` is; from async code call them
/// inside `tokio::task::spawn_blocking`.
pub struct JobHistory {
    conn: Mutex<Connection>,
}

impl JobHistory {
    /// Open (or create) the history database at the given path, in WAL mode.
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref()).map_err(db_err("open"))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(db_err("WAL pragma"))?;
        conn.execute_batch(CREATE_TABLE_SQL)
            .map_err(db_err("create table"))?;
        info!("job history database opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (useful for tests).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err("open in-memory"))?;
        conn.execute_batch(CREATE_TABLE_SQL)
            .map_err(db_err("create table"))?;
        debug!("in-memory job history opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store a terminal job, replacing any earlier record with the same id.
    #[instrument(skip(self, job), fields(job_id = %job.id))]
    pub fn record(&self, job: &PrintJob) -> Result<()> {
        let record = serde_json::to_string(job)?;
        self.conn()
            .execute(
                "INSERT OR REPLACE INTO job_history
                 (id, printer, document_name, state, attempts, last_error,
                  submitted_at, finished_at, record)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    job.id.0 as i64,
                    job.printer,
                    job.document_name,
                    job.state.as_str(),
                    job.attempts,
                    job.last_error,
                    job.submitted_at.to_rfc3339(),
                    job.finished_at.map(|t| t.to_rfc3339()),
                    record,
                ],
            )
            .map_err(db_err("insert job"))?;
        debug!(state = job.state.as_str(), "job recorded in history");
        Ok(())
    }

    /// Retrieve a job by id; `None` if it was never recorded.
    pub fn get(&self, id: JobId) -> Result<Option<PrintJob>> {
        let record: Option<String> = self
            .conn()
            .query_row(
                "SELECT record FROM job_history WHERE id = ?1",
                params![id.0 as i64],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err("get job"))?;

        record
            .map(|json| serde_json::from_str(&json).map_err(EdgePrintError::from))
            .transpose()
    }

    /// The most recent `limit` jobs, newest first.
    pub fn recent(&self, limit: usize) -> Result<Vec<PrintJob>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare("SELECT record FROM job_history ORDER BY id DESC LIMIT ?1")
            .map_err(db_err("prepare recent"))?;
        let records = stmt
            .query_map(params![limit as i64], |row| row.get::<_, String>(0))
            .map_err(db_err("query recent"))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(db_err("collect rows"))?;

        records
            .iter()
            .map(|json| serde_json::from_str(json).map_err(EdgePrintError::from))
            .collect()
    }

    /// Highest recorded job id, 0 when empty.
    pub fn max_job_id(&self) -> Result<u64> {
        let max: Option<i64> = self
            .conn()
            .query_row("SELECT MAX(id) FROM job_history", [], |row| row.get(0))
            .map_err(db_err("max id"))?;
        Ok(max.unwrap_or(0).max(0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use edgeprint_core::types::{
        CapabilitySnapshot, JobState, PayloadKind, PayloadRef, PrintOptions, PrinterCapabilities,
    };

    fn finished_job(id: u64, state: JobState) -> PrintJob {
        let snapshot = CapabilitySnapshot {
            printer: "P1".into(),
            uri: None,
            capabilities: PrinterCapabilities::default(),
            taken_at: Utc::now(),
        };
        let payload = PayloadRef {
            path: "/tmp/edgeprint-job-x.pdf".into(),
            size: 3,
            sha256: "abc".into(),
        };
        let mut job = PrintJob::new(
            JobId(id),
            format!("doc-{id}.pdf"),
            PayloadKind::Pdf,
            payload,
            PrintOptions::default(),
            snapshot,
        );
        job.state = state;
        job.attempts = 1;
        job.finished_at = Some(Utc::now());
        job
    }

    #[test]
    fn record_and_get() {
        let history = JobHistory::open_in_memory().expect("open");
        let mut job = finished_job(7, JobState::Failed);
        job.last_error = Some("document rejected: no pages".into());
        history.record(&job).expect("record");

        let loaded = history.get(JobId(7)).expect("get").expect("present");
        assert_eq!(loaded.state, JobState::Failed);
        assert_eq!(loaded.document_name, "doc-7.pdf");
        assert_eq!(loaded.last_error, job.last_error);
        assert!(history.get(JobId(8)).expect("get").is_none());
    }

    #[test]
    fn recent_is_newest_first_and_limited() {
        let history = JobHistory::open_in_memory().expect("open");
        for id in 1..=4 {
            history.record(&finished_job(id, JobState::Completed)).expect("record");
        }
        let recent = history.recent(2).expect("recent");
        assert_eq!(recent.iter().map(|j| j.id).collect::<Vec<_>>(), vec![JobId(4), JobId(3)]);
    }

    #[test]
    fn rerecording_replaces() {
        let history = JobHistory::open_in_memory().expect("open");
        history.record(&finished_job(1, JobState::Cancelled)).expect("record");
        history.record(&finished_job(1, JobState::Completed)).expect("record");
        assert_eq!(history.recent(10).expect("recent").len(), 1);
        assert_eq!(
            history.get(JobId(1)).expect("get").map(|j| j.state),
            Some(JobState::Completed)
        );
    }

    #[test]
    fn max_id_survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("history.db");
        {
            let history = JobHistory::open(&path).expect("open");
            assert_eq!(history.max_job_id().expect("max"), 0);
            history.record(&finished_job(12, JobState::Completed)).expect("record");
            history.record(&finished_job(5, JobState::Completed)).expect("record");
        }
        let reopened = JobHistory::open(&path).expect("reopen");
        assert_eq!(reopened.max_job_id().expect("max"), 12);
    }
}
