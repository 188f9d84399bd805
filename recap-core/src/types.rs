//! Core domain types for recap
//!
//! Two families of types live here:
//!
//! - **Ephemeral**: [`Message`] and [`SessionMetadata`] are constructed per
//!   analysis invocation from a session log and discarded afterwards.
//! - **Durable**: [`Job`] and [`AnalysisResult`] are persisted through the
//!   job store and survive process restarts.
//!
//! A job's status only ever moves `PENDING -> RUNNING -> COMPLETED | FAILED`;
//! both end states are terminal, and `result_id` is set exactly when the job
//! completed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

// ============================================
// Messages
// ============================================

/// Who authored a message in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single message in a conversation, as read from a session log.
///
/// Immutable once produced by the transcript reader.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Who wrote the message
    pub role: Role,
    /// Text content (tool noise already stripped by the reader)
    pub content: String,
    /// When the message was recorded, if the log carried a timestamp
    pub timestamp: Option<DateTime<Utc>>,
    /// Session the message belongs to
    pub session_id: Option<String>,
    /// Working directory at the time of the message
    pub cwd: Option<String>,
}

impl Message {
    /// Convenience constructor for messages without log metadata.
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: None,
            session_id: None,
            cwd: None,
        }
    }
}

/// Metadata about a session log file, gathered without a full parse.
#[derive(Debug, Clone)]
pub struct SessionMetadata {
    /// Session ID (from the log, falling back to the file stem)
    pub session_id: String,
    /// Path to the session file
    pub file_path: PathBuf,
    /// Last modification time of the file
    pub modified_at: DateTime<Utc>,
    /// File size in bytes
    pub size_bytes: u64,
    /// Project path decoded from the session directory name
    pub project_path: Option<String>,
}

// ============================================
// Jobs
// ============================================

/// Kind of analysis a job performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    /// Extract structured session state (what happened, in order)
    Stenographer,
    /// Deep insight extraction for training signal
    InsightExtractor,
}

impl JobType {
    /// Identifier used in database storage
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Stenographer => "stenographer",
            JobType::InsightExtractor => "insight_extractor",
        }
    }
}

impl std::str::FromStr for JobType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stenographer" => Ok(JobType::Stenographer),
            "insight_extractor" => Ok(JobType::InsightExtractor),
            _ => Err(format!("unknown job type: {}", s)),
        }
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lifecycle state of an analysis job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    /// Identifier used in database storage
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Running => "RUNNING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
        }
    }

    /// Terminal states are never left once entered.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(JobStatus::Pending),
            "RUNNING" => Ok(JobStatus::Running),
            "COMPLETED" => Ok(JobStatus::Completed),
            "FAILED" => Ok(JobStatus::Failed),
            _ => Err(format!("unknown job status: {}", s)),
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An analysis job tracked through the PENDING/RUNNING/COMPLETED/FAILED
/// state machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Opaque unique identifier
    pub id: String,
    /// Kind of analysis
    pub job_type: JobType,
    /// Session the job analyzes
    pub session_id: String,
    /// Project the session belongs to, if known
    pub project_path: Option<String>,
    /// Current lifecycle state
    pub status: JobStatus,
    /// When the job was created
    pub created_at: DateTime<Utc>,
    /// When the job last changed state
    pub updated_at: DateTime<Utc>,
    /// Failure message, set when status is FAILED
    pub error_message: Option<String>,
    /// Linked result, set exactly when status is COMPLETED
    pub result_id: Option<String>,
}

/// Stored output of a completed analysis job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisResult {
    /// Opaque unique identifier
    pub id: String,
    /// Kind of analysis that produced this result
    pub job_type: JobType,
    /// Session the result describes
    pub session_id: String,
    /// Project the session belongs to, if known
    pub project_path: Option<String>,
    /// Line count of the formatted transcript that was analyzed
    pub transcript_lines: usize,
    /// Model that produced the result
    pub model_used: String,
    /// Context window size used for the inference calls
    pub context_size: u32,
    /// The generated analysis text
    pub result_text: String,
    /// When the result was stored
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_job_status_roundtrip() {
        for status in [
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::Failed,
        ] {
            assert_eq!(JobStatus::from_str(status.as_str()).unwrap(), status);
        }
        assert!(JobStatus::from_str("DONE").is_err());
    }

    #[test]
    fn test_terminal_states() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
    }

    #[test]
    fn test_job_type_roundtrip() {
        assert_eq!(
            JobType::from_str("stenographer").unwrap(),
            JobType::Stenographer
        );
        assert_eq!(
            JobType::from_str("insight_extractor").unwrap(),
            JobType::InsightExtractor
        );
        assert!(JobType::from_str("archivist").is_err());
    }
}
