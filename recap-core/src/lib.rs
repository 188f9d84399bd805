//! # recap-core
//!
//! Core library for recap - map-reduce analysis of AI coding session
//! transcripts.
//!
//! This library provides:
//! - Transcript reading and formatting for Claude Code session logs
//! - Token-budget chunking at conversation-turn boundaries
//! - A retrying client for an Ollama-protocol inference backend
//! - Durable job tracking (PENDING/RUNNING/COMPLETED/FAILED) in SQLite
//! - A worker-pool orchestrator running single-pass or map-reduce analysis
//!
//! ## Architecture
//!
//! A submitted job flows through three layers:
//! - **Transcript:** session JSONL parsed into an ordered message sequence
//! - **Chunking:** the shared token threshold decides single-pass vs.
//!   map-reduce; chunks never split a conversation turn
//! - **Execution:** a pool worker drives the inference calls and records the
//!   outcome through the job store
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use recap_core::{Config, JobOrchestrator, SqliteJobStore};
//!
//! # fn main() -> recap_core::Result<()> {
//! let config = Config::load()?;
//!
//! let store = Arc::new(SqliteJobStore::open(&Config::database_path())?);
//! store.migrate()?;
//!
//! let orchestrator = JobOrchestrator::from_config(store, &config)?;
//! # let _ = orchestrator;
//! # Ok(())
//! # }
//! ```

// Re-export commonly used items at the crate root
pub use chunker::{chunk_messages, chunk_threshold, should_chunk, Chunk, ChunkingResult, Turn};
pub use config::Config;
pub use error::{Error, Result};
pub use inference::{GenerateRequest, GenerateResponse, InferenceClient, InferenceError, ModelInfo};
pub use jobs::{AnalysisRequest, ChunkPrompts, JobOrchestrator, OrchestratorSettings, PromptSet};
pub use store::{JobFilter, JobStore, NewResult, SqliteJobStore};
pub use types::*;

// Public modules
pub mod chunker;
pub mod config;
pub mod error;
pub mod inference;
pub mod jobs;
pub mod logging;
pub mod store;
pub mod transcript;
pub mod types;
