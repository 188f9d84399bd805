//! Claude Code session transcript reading and formatting
//!
//! Session logs live under `~/.claude/projects/[encoded-path]/*.jsonl`, one
//! JSON record per line. Only `user` and `assistant` records carry
//! conversation text; everything else (tool results, file history, summaries)
//! is skipped.
//!
//! The reader is resilient: blank or malformed lines are logged and skipped,
//! records with empty content are dropped, and missing optional fields fall
//! back to `None`. A session file that yields no messages is not an error.
//!
//! [`format_transcript`] is the single production formatter. The chunker's
//! token gate and the inference payload both go through it, so the
//! chunk/no-chunk decision is made against the exact text the model will see.

use crate::error::{Error, Result};
use crate::types::{Message, Role, SessionMetadata};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

// ============================================
// Raw JSONL record types (serde deserialization)
// ============================================

/// A single line from a Claude Code session log.
///
/// Uses `#[serde(default)]` liberally to handle missing fields gracefully.
#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct RawRecord {
    #[serde(rename = "type")]
    record_type: Option<String>,
    timestamp: Option<String>,
    session_id: Option<String>,
    cwd: Option<String>,
    message: Option<RawMessage>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct RawMessage {
    content: Option<RawContent>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    // Tool calls, tool results, images, thinking blocks: not conversation
    // text, so not extracted.
    #[serde(other)]
    Other,
}

impl RawContent {
    /// Extract the text content, joining multiple text blocks with newlines.
    ///
    /// Returns `None` when there is no usable text.
    fn into_text(self) -> Option<String> {
        match self {
            RawContent::Text(s) if !s.is_empty() => Some(s),
            RawContent::Text(_) => None,
            RawContent::Blocks(blocks) => {
                let texts: Vec<String> = blocks
                    .into_iter()
                    .filter_map(|b| match b {
                        ContentBlock::Text { text } if !text.is_empty() => Some(text),
                        _ => None,
                    })
                    .collect();
                if texts.is_empty() {
                    None
                } else {
                    Some(texts.join("\n"))
                }
            }
        }
    }
}

fn parse_timestamp(ts: Option<&str>) -> Option<DateTime<Utc>> {
    ts.and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

// ============================================
// Reading
// ============================================

/// Parse a session JSONL file into an ordered message sequence.
///
/// Malformed lines and non-conversation records are skipped; an empty file
/// yields an empty sequence.
pub fn parse_session_file(path: &Path) -> Result<Vec<Message>> {
    let file = File::open(path).map_err(|e| {
        Error::Io(std::io::Error::new(
            e.kind(),
            format!("failed to open {}: {}", path.display(), e),
        ))
    })?;
    let reader = BufReader::new(file);

    let mut messages = Vec::new();
    for (line_no, line) in reader.lines().enumerate() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let record: RawRecord = match serde_json::from_str(line) {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    line = line_no + 1,
                    error = %e,
                    "Skipping malformed session log line"
                );
                continue;
            }
        };

        let role = match record.record_type.as_deref() {
            Some("user") => Role::User,
            Some("assistant") => Role::Assistant,
            _ => continue,
        };

        let content = match record.message.and_then(|m| m.content).and_then(RawContent::into_text) {
            Some(c) => c,
            None => continue,
        };

        messages.push(Message {
            role,
            content,
            timestamp: parse_timestamp(record.timestamp.as_deref()),
            session_id: record.session_id,
            cwd: record.cwd,
        });
    }

    Ok(messages)
}

// ============================================
// Formatting
// ============================================

/// Format messages as a readable markdown transcript.
///
/// This is the formatter whose output is sized by the chunker and sent to
/// the inference backend.
pub fn format_transcript(messages: &[Message], include_metadata: bool) -> String {
    let mut lines: Vec<String> = vec!["# Transcript".to_string(), String::new()];

    if let Some(session_id) = messages.first().and_then(|m| m.session_id.as_deref()) {
        lines.push(format!("Session: {}", session_id));
        lines.push(String::new());
    }

    lines.push("---".to_string());
    lines.push(String::new());

    for msg in messages {
        let header = match msg.role {
            Role::User => "## User",
            Role::Assistant => "## Assistant",
        };
        lines.push(header.to_string());

        if include_metadata {
            if let Some(ts) = msg.timestamp {
                lines.push(format!("*{}*", ts.to_rfc3339()));
            }
        }

        lines.push(String::new());
        lines.push(msg.content.clone());
        lines.push(String::new());
    }

    lines.join("\n")
}

/// Read a session file and return its formatted transcript.
pub fn extract_transcript(path: &Path, include_metadata: bool) -> Result<String> {
    let messages = parse_session_file(path)?;
    Ok(format_transcript(&messages, include_metadata))
}

// ============================================
// Session discovery
// ============================================

/// Decode a project path from a session directory name.
///
/// Claude Code encodes `/Users/foo/bar` as a directory named
/// `-Users-foo-bar`.
pub fn decode_project_path(dir_name: &str) -> Option<String> {
    let rest = dir_name.strip_prefix('-')?;
    if rest.is_empty() {
        return None;
    }
    Some(format!("/{}", rest.replace('-', "/")))
}

/// Gather metadata about a session file without fully parsing it.
///
/// The session ID comes from the first record that carries one, falling
/// back to the file stem.
pub fn session_metadata(path: &Path) -> Result<SessionMetadata> {
    let meta = std::fs::metadata(path)?;
    let modified_at: DateTime<Utc> = meta
        .modified()
        .map(DateTime::from)
        .unwrap_or_else(|_| Utc::now());

    let mut session_id = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();

    let file = File::open(path)?;
    for line in BufReader::new(file).lines() {
        let line = match line {
            Ok(l) => l,
            Err(_) => break,
        };
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(&line) {
            if let Some(id) = value.get("sessionId").and_then(|v| v.as_str()) {
                session_id = id.to_string();
                break;
            }
        }
    }

    let project_path = path
        .parent()
        .and_then(|p| p.file_name())
        .and_then(|n| n.to_str())
        .and_then(decode_project_path);

    Ok(SessionMetadata {
        session_id,
        file_path: path.to_path_buf(),
        modified_at,
        size_bytes: meta.len(),
        project_path,
    })
}

/// Find session files under a base directory, newest first.
///
/// `project_filter` matches case-insensitively against the decoded project
/// path; `days` bounds how far back to look; `limit` caps the result count.
pub fn find_sessions(
    base_path: &Path,
    project_filter: Option<&str>,
    days: u32,
    limit: usize,
) -> Result<Vec<SessionMetadata>> {
    if !base_path.exists() {
        return Ok(vec![]);
    }

    let cutoff = Utc::now() - chrono::Duration::days(i64::from(days));
    let pattern = base_path.join("**/*.jsonl");
    let pattern_str = pattern.to_string_lossy();

    let entries = glob::glob(&pattern_str)
        .map_err(|e| Error::Transcript(format!("invalid session glob pattern: {}", e)))?;

    let mut sessions: Vec<SessionMetadata> = Vec::new();
    for entry in entries.flatten() {
        let metadata = match session_metadata(&entry) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(path = %entry.display(), error = %e, "Skipping unreadable session file");
                continue;
            }
        };

        if metadata.modified_at < cutoff {
            continue;
        }

        if let Some(filter) = project_filter {
            match &metadata.project_path {
                Some(p) if p.to_lowercase().contains(&filter.to_lowercase()) => {}
                _ => continue,
            }
        }

        sessions.push(metadata);
    }

    sessions.sort_by(|a, b| b.modified_at.cmp(&a.modified_at));
    sessions.truncate(limit);

    Ok(sessions)
}

/// Default location of Claude Code session logs (`~/.claude/projects`).
pub fn default_sessions_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".claude").join("projects"))
}
