//! Durable storage for jobs and analysis results
//!
//! [`JobStore`] is the contract the orchestrator programs against; every
//! operation is atomic per call and keyed by job or result id, so concurrent
//! workers finishing distinct jobs never interfere. No cross-call
//! transactional guarantee is offered or required.
//!
//! [`SqliteJobStore`] is the bundled adapter: SQLite with embedded
//! migrations, WAL mode, and a single pooled connection.

pub mod schema;
pub mod sqlite;

pub use sqlite::SqliteJobStore;

use crate::error::Result;
use crate::types::{AnalysisResult, Job, JobStatus, JobType};
use chrono::{DateTime, Utc};

/// Payload for completing a job.
#[derive(Debug, Clone)]
pub struct NewResult {
    /// The generated analysis text
    pub result_text: String,
    /// Line count of the formatted transcript that was analyzed
    pub transcript_lines: usize,
    /// Model that produced the result
    pub model_used: String,
    /// Context window size used
    pub context_size: u32,
}

/// Filter for listing jobs.
#[derive(Debug, Clone)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub session_id: Option<String>,
    pub job_type: Option<JobType>,
    /// Cap on the number of jobs returned, newest first
    pub limit: usize,
}

impl Default for JobFilter {
    fn default() -> Self {
        Self {
            status: None,
            session_id: None,
            job_type: None,
            limit: 20,
        }
    }
}

/// Contract for durable job/result records and their state transitions.
pub trait JobStore: Send + Sync {
    /// Create a new job in the PENDING state.
    fn create_job(
        &self,
        job_type: JobType,
        session_id: &str,
        project_path: Option<&str>,
    ) -> Result<Job>;

    /// Fetch a job by id.
    fn get_job(&self, job_id: &str) -> Result<Option<Job>>;

    /// Transition a job's status, bumping `updated_at`.
    fn update_status(&self, job_id: &str, status: JobStatus) -> Result<()>;

    /// Mark a job FAILED with an error message.
    fn fail_job(&self, job_id: &str, error_message: &str) -> Result<()>;

    /// Mark a job COMPLETED, writing its linked result record.
    fn complete_job(&self, job_id: &str, result: NewResult) -> Result<AnalysisResult>;

    /// Fetch an analysis result by id.
    fn get_result(&self, result_id: &str) -> Result<Option<AnalysisResult>>;

    /// List jobs matching the filter, newest first, capped at `filter.limit`.
    fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>>;

    /// Retention sweep: delete results created before `cutoff`, plus any job
    /// whose linked result no longer exists. Returns the number of results
    /// deleted.
    fn sweep_expired(&self, cutoff: DateTime<Utc>) -> Result<usize>;
}
