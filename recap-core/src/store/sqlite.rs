//! SQLite adapter for the job store contract

use crate::error::{Error, Result};
use crate::types::{AnalysisResult, Job, JobStatus, JobType};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::str::FromStr;
use std::sync::Mutex;
use uuid::Uuid;

use super::{JobFilter, JobStore, NewResult};

/// Job store backed by SQLite (single pooled connection).
pub struct SqliteJobStore {
    conn: Mutex<Connection>,
}

impl SqliteJobStore {
    /// Open or create a database at the given path
    pub fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;

        // Enable foreign keys and WAL mode for better concurrency
        conn.execute_batch(
            "
            PRAGMA foreign_keys = ON;
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            ",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run migrations on this database
    pub fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        super::schema::run_migrations(&conn)
    }

    fn row_to_job(row: &Row) -> rusqlite::Result<Job> {
        let job_type_str: String = row.get("job_type")?;
        let status_str: String = row.get("status")?;
        let created_at_str: String = row.get("created_at")?;
        let updated_at_str: String = row.get("updated_at")?;

        Ok(Job {
            id: row.get("id")?,
            job_type: JobType::from_str(&job_type_str).unwrap_or(JobType::Stenographer),
            session_id: row.get("session_id")?,
            project_path: row.get("project_path")?,
            status: JobStatus::from_str(&status_str).unwrap_or(JobStatus::Failed),
            created_at: parse_rfc3339(&created_at_str),
            updated_at: parse_rfc3339(&updated_at_str),
            error_message: row.get("error_message")?,
            result_id: row.get("result_id")?,
        })
    }

    fn row_to_result(row: &Row) -> rusqlite::Result<AnalysisResult> {
        let job_type_str: String = row.get("job_type")?;
        let created_at_str: String = row.get("created_at")?;
        let transcript_lines: i64 = row.get("transcript_lines")?;
        let context_size: i64 = row.get("context_size")?;

        Ok(AnalysisResult {
            id: row.get("id")?,
            job_type: JobType::from_str(&job_type_str).unwrap_or(JobType::Stenographer),
            session_id: row.get("session_id")?,
            project_path: row.get("project_path")?,
            transcript_lines: transcript_lines.max(0) as usize,
            model_used: row.get("model_used")?,
            context_size: context_size.max(0) as u32,
            result_text: row.get("result_text")?,
            created_at: parse_rfc3339(&created_at_str),
        })
    }
}

fn parse_rfc3339(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

impl JobStore for SqliteJobStore {
    fn create_job(
        &self,
        job_type: JobType,
        session_id: &str,
        project_path: Option<&str>,
    ) -> Result<Job> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();

        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO jobs (id, job_type, session_id, project_path, status, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                id,
                job_type.as_str(),
                session_id,
                project_path,
                JobStatus::Pending.as_str(),
                now.to_rfc3339(),
                now.to_rfc3339(),
            ],
        )?;

        Ok(Job {
            id,
            job_type,
            session_id: session_id.to_string(),
            project_path: project_path.map(str::to_string),
            status: JobStatus::Pending,
            created_at: now,
            updated_at: now,
            error_message: None,
            result_id: None,
        })
    }

    fn get_job(&self, job_id: &str) -> Result<Option<Job>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row("SELECT * FROM jobs WHERE id = ?", [job_id], |row| {
            Self::row_to_job(row)
        })
        .optional()
        .map_err(Error::from)
    }

    fn update_status(&self, job_id: &str, status: JobStatus) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE jobs SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![status.as_str(), Utc::now().to_rfc3339(), job_id],
        )?;
        if changed == 0 {
            return Err(Error::JobNotFound(job_id.to_string()));
        }
        Ok(())
    }

    fn fail_job(&self, job_id: &str, error_message: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE jobs SET status = ?1, error_message = ?2, updated_at = ?3 WHERE id = ?4",
            params![
                JobStatus::Failed.as_str(),
                error_message,
                Utc::now().to_rfc3339(),
                job_id
            ],
        )?;
        if changed == 0 {
            return Err(Error::JobNotFound(job_id.to_string()));
        }
        Ok(())
    }

    fn complete_job(&self, job_id: &str, result: NewResult) -> Result<AnalysisResult> {
        let result_id = Uuid::new_v4().to_string();
        let now = Utc::now();

        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let job = tx
            .query_row("SELECT * FROM jobs WHERE id = ?", [job_id], |row| {
                Self::row_to_job(row)
            })
            .optional()?
            .ok_or_else(|| Error::JobNotFound(job_id.to_string()))?;

        tx.execute(
            r#"
            INSERT INTO analysis_results
            (id, job_type, session_id, project_path, transcript_lines, model_used, context_size, result_text, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
            params![
                result_id,
                job.job_type.as_str(),
                job.session_id,
                job.project_path,
                result.transcript_lines as i64,
                result.model_used,
                result.context_size as i64,
                result.result_text,
                now.to_rfc3339(),
            ],
        )?;

        tx.execute(
            "UPDATE jobs SET status = ?1, result_id = ?2, updated_at = ?3 WHERE id = ?4",
            params![
                JobStatus::Completed.as_str(),
                result_id,
                now.to_rfc3339(),
                job_id
            ],
        )?;

        tx.commit()?;

        Ok(AnalysisResult {
            id: result_id,
            job_type: job.job_type,
            session_id: job.session_id,
            project_path: job.project_path,
            transcript_lines: result.transcript_lines,
            model_used: result.model_used,
            context_size: result.context_size,
            result_text: result.result_text,
            created_at: now,
        })
    }

    fn get_result(&self, result_id: &str) -> Result<Option<AnalysisResult>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT * FROM analysis_results WHERE id = ?",
            [result_id],
            |row| Self::row_to_result(row),
        )
        .optional()
        .map_err(Error::from)
    }

    fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        let mut query = String::from("SELECT * FROM jobs WHERE 1=1");
        let mut values: Vec<String> = Vec::new();

        if let Some(status) = filter.status {
            query.push_str(" AND status = ?");
            values.push(status.as_str().to_string());
        }
        if let Some(session_id) = &filter.session_id {
            query.push_str(" AND session_id = ?");
            values.push(session_id.clone());
        }
        if let Some(job_type) = filter.job_type {
            query.push_str(" AND job_type = ?");
            values.push(job_type.as_str().to_string());
        }

        query.push_str(&format!(
            " ORDER BY created_at DESC LIMIT {}",
            filter.limit
        ));

        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&query)?;
        let jobs = stmt
            .query_map(rusqlite::params_from_iter(values.iter()), |row| {
                Self::row_to_job(row)
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(jobs)
    }

    fn sweep_expired(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        // Jobs whose linked result is gone, or about to be, go first so the
        // result delete does not trip the foreign key
        let orphaned = tx.execute(
            r#"
            DELETE FROM jobs
            WHERE result_id IS NOT NULL
            AND (
                result_id NOT IN (SELECT id FROM analysis_results)
                OR result_id IN (SELECT id FROM analysis_results WHERE created_at < ?1)
            )
            "#,
            params![cutoff.to_rfc3339()],
        )?;

        let deleted = tx.execute(
            "DELETE FROM analysis_results WHERE created_at < ?1",
            params![cutoff.to_rfc3339()],
        )?;

        tx.commit()?;

        if deleted > 0 || orphaned > 0 {
            tracing::info!(
                results_deleted = deleted,
                jobs_deleted = orphaned,
                "Retention sweep complete"
            );
        }

        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn store() -> SqliteJobStore {
        let store = SqliteJobStore::open_in_memory().unwrap();
        store.migrate().unwrap();
        store
    }

    fn new_result(text: &str) -> NewResult {
        NewResult {
            result_text: text.to_string(),
            transcript_lines: 42,
            model_used: "qwen2.5:72b".to_string(),
            context_size: 32768,
        }
    }

    #[test]
    fn test_create_and_get_job() {
        let store = store();
        let job = store
            .create_job(JobType::Stenographer, "sess-1", Some("/dev/proj"))
            .unwrap();

        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.result_id.is_none());
        assert!(job.error_message.is_none());

        let fetched = store.get_job(&job.id).unwrap().unwrap();
        assert_eq!(fetched.id, job.id);
        assert_eq!(fetched.job_type, JobType::Stenographer);
        assert_eq!(fetched.session_id, "sess-1");
        assert_eq!(fetched.project_path.as_deref(), Some("/dev/proj"));
        assert_eq!(fetched.status, JobStatus::Pending);
    }

    #[test]
    fn test_get_missing_job() {
        let store = store();
        assert!(store.get_job("nope").unwrap().is_none());
    }

    #[test]
    fn test_status_transitions() {
        let store = store();
        let job = store
            .create_job(JobType::InsightExtractor, "sess-1", None)
            .unwrap();

        store.update_status(&job.id, JobStatus::Running).unwrap();
        let running = store.get_job(&job.id).unwrap().unwrap();
        assert_eq!(running.status, JobStatus::Running);
        assert!(running.updated_at >= job.updated_at);
    }

    #[test]
    fn test_update_status_missing_job() {
        let store = store();
        let err = store.update_status("nope", JobStatus::Running).unwrap_err();
        assert!(matches!(err, Error::JobNotFound(_)));
    }

    #[test]
    fn test_fail_job_records_message() {
        let store = store();
        let job = store
            .create_job(JobType::Stenographer, "sess-1", None)
            .unwrap();

        store.fail_job(&job.id, "backend returned 500").unwrap();

        let failed = store.get_job(&job.id).unwrap().unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.error_message.as_deref(), Some("backend returned 500"));
        assert!(failed.result_id.is_none());
    }

    #[test]
    fn test_complete_job_links_result() {
        let store = store();
        let job = store
            .create_job(JobType::Stenographer, "sess-1", Some("/p"))
            .unwrap();

        let result = store.complete_job(&job.id, new_result("analysis text")).unwrap();

        let completed = store.get_job(&job.id).unwrap().unwrap();
        assert_eq!(completed.status, JobStatus::Completed);
        assert_eq!(completed.result_id.as_deref(), Some(result.id.as_str()));

        let fetched = store.get_result(&result.id).unwrap().unwrap();
        assert_eq!(fetched.result_text, "analysis text");
        assert_eq!(fetched.session_id, "sess-1");
        assert_eq!(fetched.project_path.as_deref(), Some("/p"));
        assert_eq!(fetched.transcript_lines, 42);
        assert_eq!(fetched.model_used, "qwen2.5:72b");
        assert_eq!(fetched.context_size, 32768);
    }

    #[test]
    fn test_complete_missing_job() {
        let store = store();
        let err = store.complete_job("nope", new_result("x")).unwrap_err();
        assert!(matches!(err, Error::JobNotFound(_)));
    }

    #[test]
    fn test_list_jobs_filters() {
        let store = store();
        let a = store
            .create_job(JobType::Stenographer, "sess-a", None)
            .unwrap();
        let _b = store
            .create_job(JobType::InsightExtractor, "sess-a", None)
            .unwrap();
        let _c = store
            .create_job(JobType::Stenographer, "sess-b", None)
            .unwrap();
        store.fail_job(&a.id, "boom").unwrap();

        let all = store.list_jobs(&JobFilter::default()).unwrap();
        assert_eq!(all.len(), 3);

        let failed = store
            .list_jobs(&JobFilter {
                status: Some(JobStatus::Failed),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].id, a.id);

        let sess_a = store
            .list_jobs(&JobFilter {
                session_id: Some("sess-a".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(sess_a.len(), 2);

        let insight = store
            .list_jobs(&JobFilter {
                job_type: Some(JobType::InsightExtractor),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(insight.len(), 1);

        let capped = store
            .list_jobs(&JobFilter {
                limit: 2,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(capped.len(), 2);
    }

    #[test]
    fn test_sweep_deletes_old_results_and_orphaned_jobs() {
        let store = store();

        let old_job = store
            .create_job(JobType::Stenographer, "sess-old", None)
            .unwrap();
        let old_result = store.complete_job(&old_job.id, new_result("old")).unwrap();

        let new_job = store
            .create_job(JobType::Stenographer, "sess-new", None)
            .unwrap();
        let new_result_rec = store.complete_job(&new_job.id, new_result("new")).unwrap();

        let pending = store
            .create_job(JobType::Stenographer, "sess-pending", None)
            .unwrap();
        let failed = store
            .create_job(JobType::Stenographer, "sess-failed", None)
            .unwrap();
        store.fail_job(&failed.id, "boom").unwrap();

        // Everything was just created; a future cutoff expires both results
        let cutoff = Utc::now() + Duration::seconds(5);
        let deleted = store.sweep_expired(cutoff).unwrap();
        assert_eq!(deleted, 2);

        // Completed jobs lost their results, so they are gone too
        assert!(store.get_result(&old_result.id).unwrap().is_none());
        assert!(store.get_result(&new_result_rec.id).unwrap().is_none());
        assert!(store.get_job(&old_job.id).unwrap().is_none());
        assert!(store.get_job(&new_job.id).unwrap().is_none());

        // Jobs without a result link are untouched
        assert!(store.get_job(&pending.id).unwrap().is_some());
        assert!(store.get_job(&failed.id).unwrap().is_some());
    }

    #[test]
    fn test_sweep_respects_cutoff() {
        let store = store();
        let job = store
            .create_job(JobType::Stenographer, "sess", None)
            .unwrap();
        let result = store.complete_job(&job.id, new_result("fresh")).unwrap();

        // A cutoff in the past deletes nothing
        let cutoff = Utc::now() - Duration::days(30);
        let deleted = store.sweep_expired(cutoff).unwrap();
        assert_eq!(deleted, 0);
        assert!(store.get_result(&result.id).unwrap().is_some());
        assert!(store.get_job(&job.id).unwrap().is_some());
    }
}
