//! Background job orchestration for transcript analysis
//!
//! [`JobOrchestrator`] owns a fixed-size worker pool. Submission is
//! non-blocking: a PENDING job record is created and queued, and the caller
//! gets the [`Job`] back immediately. A worker picks the job up FIFO, moves
//! it to RUNNING, reads the transcript, and runs either a single inference
//! pass or map-reduce chunked analysis depending on the shared chunking
//! threshold and whether chunk prompts were supplied.
//!
//! Within one job, chunk map calls run strictly sequentially in index order
//! and the reduce call strictly after all of them; total concurrent
//! inference calls are therefore bounded by the pool size. Any error from
//! transcript reading or an inference call (after the client's own retries)
//! moves the job to FAILED with the error message; no partial chunk output
//! is persisted, a FAILED job is never retried automatically, and the worker
//! itself never dies with it.
//!
//! A separate blocking fast-path runs a single pass directly and returns
//! text in the same call without creating a job record; both paths share
//! one single-pass implementation.

pub mod prompts;

pub use prompts::{ChunkPrompts, PromptSet};

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{Duration, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::chunker::{chunk_messages, estimate_tokens, should_chunk};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::inference::{
    GenerateRequest, HttpTransport, InferenceClient, InferenceTransport,
};
use crate::store::{JobFilter, JobStore, NewResult};
use crate::transcript::{decode_project_path, format_transcript, parse_session_file};
use crate::types::{Job, JobStatus, JobType, Message};

/// Orchestrator configuration.
///
/// Model resolution precedence for a job is: explicit per-request value,
/// then the runtime override set via [`JobOrchestrator::set_model`], then
/// `default_model` here.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Model used when a request names none
    pub default_model: String,
    /// Context window size used when a request names none
    pub default_context_size: u32,
    /// Target tokens per chunk for map-reduce analysis
    pub chunk_tokens: usize,
    /// Turns to overlap between chunks
    pub overlap_turns: usize,
    /// Worker pool size
    pub workers: usize,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            default_model: "qwen2.5:72b".to_string(),
            default_context_size: 32768,
            chunk_tokens: crate::chunker::DEFAULT_CHUNK_TOKENS,
            overlap_turns: crate::chunker::DEFAULT_OVERLAP_TURNS,
            workers: 2,
        }
    }
}

impl OrchestratorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            default_model: config.inference.model.clone(),
            default_context_size: config.inference.context_size,
            chunk_tokens: config.analysis.chunk_tokens,
            overlap_turns: config.analysis.overlap_turns,
            workers: config.analysis.workers,
        }
    }
}

/// A request to analyze one session transcript.
#[derive(Debug, Clone)]
pub struct AnalysisRequest {
    pub job_type: JobType,
    /// Path to the session JSONL file
    pub session_file: PathBuf,
    pub prompts: PromptSet,
    /// Model override (falls back through runtime override to the default)
    pub model: Option<String>,
    /// Context size override
    pub context_size: Option<u32>,
}

/// Everything a worker needs to execute one queued job.
struct JobSpec {
    job_id: String,
    session_file: PathBuf,
    prompts: PromptSet,
    model: String,
    context_size: u32,
}

struct Inner<T: InferenceTransport> {
    store: Arc<dyn JobStore>,
    client: InferenceClient<T>,
    settings: OrchestratorSettings,
    /// Job ids currently submitted or executing; written on submit, retired
    /// on the terminal transition
    running: Mutex<HashSet<String>>,
}

/// Drives analysis jobs through PENDING -> RUNNING -> COMPLETED | FAILED.
pub struct JobOrchestrator<T: InferenceTransport + 'static = HttpTransport> {
    inner: Arc<Inner<T>>,
    queue: mpsc::UnboundedSender<JobSpec>,
    workers: Vec<JoinHandle<()>>,
    runtime_model: RwLock<Option<String>>,
}

impl JobOrchestrator<HttpTransport> {
    /// Build an orchestrator against the configured inference backend.
    pub fn from_config(store: Arc<dyn JobStore>, config: &Config) -> Result<Self> {
        let client = InferenceClient::new(&config.inference.url, config.inference.timeout())?
            .with_retry(config.inference.max_retries, config.inference.base_delay());
        Ok(Self::with_client(
            store,
            client,
            OrchestratorSettings::from_config(config),
        ))
    }
}

impl<T: InferenceTransport + 'static> JobOrchestrator<T> {
    /// Build an orchestrator over an explicit inference client.
    pub fn with_client(
        store: Arc<dyn JobStore>,
        client: InferenceClient<T>,
        settings: OrchestratorSettings,
    ) -> Self {
        let pool_size = settings.workers.max(1);
        let inner = Arc::new(Inner {
            store,
            client,
            settings,
            running: Mutex::new(HashSet::new()),
        });

        let (tx, rx) = mpsc::unbounded_channel::<JobSpec>();
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let workers = (0..pool_size)
            .map(|worker| {
                let inner = Arc::clone(&inner);
                let rx = Arc::clone(&rx);
                tokio::spawn(async move {
                    loop {
                        // Lock only to pop; execution happens with the
                        // receiver released so other workers can pull
                        let spec = { rx.lock().await.recv().await };
                        match spec {
                            Some(spec) => inner.execute(spec).await,
                            None => break,
                        }
                    }
                    tracing::debug!(worker, "Analysis worker stopped");
                })
            })
            .collect();

        Self {
            inner,
            queue: tx,
            workers,
            runtime_model: RwLock::new(None),
        }
    }

    // ============================================
    // Submission
    // ============================================

    /// Submit an analysis job for background execution.
    ///
    /// Creates a PENDING job record and enqueues it to the worker pool;
    /// returns the job immediately.
    pub fn submit(&self, request: AnalysisRequest) -> Result<Job> {
        let model = self.effective_model(request.model.as_deref());
        let context_size = request
            .context_size
            .unwrap_or(self.inner.settings.default_context_size);

        let (session_id, project_path) = session_identity(&request.session_file);
        let job = self
            .inner
            .store
            .create_job(request.job_type, &session_id, project_path.as_deref())?;

        self.inner
            .running
            .lock()
            .unwrap()
            .insert(job.id.clone());

        let spec = JobSpec {
            job_id: job.id.clone(),
            session_file: request.session_file,
            prompts: request.prompts,
            model,
            context_size,
        };

        if self.queue.send(spec).is_err() {
            self.inner.running.lock().unwrap().remove(&job.id);
            self.inner
                .store
                .fail_job(&job.id, "worker pool is shut down")?;
            return Err(Error::Queue("worker pool is shut down".to_string()));
        }

        tracing::info!(
            job_id = %job.id,
            job_type = %job.job_type,
            session_id = %job.session_id,
            "Analysis job submitted"
        );

        Ok(job)
    }

    /// Run a single-pass analysis synchronously, bypassing the job queue.
    ///
    /// Intended for small transcripts where job tracking is unnecessary.
    /// No job record is created; errors surface directly to the caller.
    pub async fn analyze_blocking(
        &self,
        session_file: &Path,
        prompts: &PromptSet,
        model: Option<&str>,
        context_size: Option<u32>,
    ) -> Result<String> {
        let model = self.effective_model(model);
        let context_size = context_size.unwrap_or(self.inner.settings.default_context_size);

        let messages = parse_session_file(session_file)?;
        let transcript = format_transcript(&messages, false);
        self.inner
            .run_single_pass(prompts, &transcript, &model, context_size)
            .await
    }

    // ============================================
    // Model precedence
    // ============================================

    /// Resolve the model for a request: explicit value, then the runtime
    /// override, then the configured default.
    pub fn effective_model(&self, request_model: Option<&str>) -> String {
        if let Some(model) = request_model {
            return model.to_string();
        }
        if let Some(model) = self.runtime_model.read().unwrap().as_ref() {
            return model.clone();
        }
        self.inner.settings.default_model.clone()
    }

    /// Set a runtime model override for subsequent jobs.
    pub fn set_model(&self, model: impl Into<String>) {
        *self.runtime_model.write().unwrap() = Some(model.into());
    }

    /// Clear the runtime model override, returning to the configured default.
    pub fn reset_model(&self) {
        *self.runtime_model.write().unwrap() = None;
    }

    // ============================================
    // Queries
    // ============================================

    /// Current state of a job.
    pub fn job_status(&self, job_id: &str) -> Result<Option<Job>> {
        self.inner.store.get_job(job_id)
    }

    /// Result text for a completed job.
    ///
    /// Returns `None` when the job does not exist, has not completed, or its
    /// result record is gone; never an error for "no result yet".
    pub fn job_result(&self, job_id: &str) -> Result<Option<String>> {
        let job = match self.inner.store.get_job(job_id)? {
            Some(job) => job,
            None => return Ok(None),
        };
        let result_id = match job.result_id {
            Some(id) => id,
            None => return Ok(None),
        };
        Ok(self
            .inner
            .store
            .get_result(&result_id)?
            .map(|r| r.result_text))
    }

    /// Whether a job has been submitted and not yet reached a terminal state.
    pub fn is_running(&self, job_id: &str) -> bool {
        self.inner.running.lock().unwrap().contains(job_id)
    }

    /// List jobs through the underlying store.
    pub fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        self.inner.store.list_jobs(filter)
    }

    /// Delete results older than `retention_days`, plus any job whose result
    /// is gone. Returns the number of results deleted.
    pub fn sweep_older_than(&self, retention_days: u32) -> Result<usize> {
        let cutoff = Utc::now() - Duration::days(i64::from(retention_days));
        self.inner.store.sweep_expired(cutoff)
    }

    /// Probe the inference backend.
    pub async fn backend_available(&self) -> bool {
        self.inner.client.is_available().await
    }

    /// List models on the inference backend.
    pub async fn list_models(&self) -> Result<Vec<crate::inference::ModelInfo>> {
        Ok(self.inner.client.list_models().await?)
    }

    // ============================================
    // Shutdown
    // ============================================

    /// Close the queue and wait for workers to drain remaining jobs.
    pub async fn shutdown(self) {
        let Self { queue, workers, .. } = self;
        drop(queue);
        for worker in workers {
            let _ = worker.await;
        }
    }
}

impl<T: InferenceTransport> Inner<T> {
    /// Run one job to a terminal state. Errors become a FAILED transition;
    /// the worker itself never propagates them.
    async fn execute(&self, spec: JobSpec) {
        let job_id = spec.job_id.clone();
        if let Err(error) = self.run_job(&spec).await {
            tracing::error!(job_id = %job_id, error = %error, "Analysis job failed");
            if let Err(store_error) = self.store.fail_job(&job_id, &error.to_string()) {
                tracing::error!(
                    job_id = %job_id,
                    error = %store_error,
                    "Failed to record job failure"
                );
            }
        }
        self.running.lock().unwrap().remove(&job_id);
    }

    async fn run_job(&self, spec: &JobSpec) -> Result<()> {
        self.store.update_status(&spec.job_id, JobStatus::Running)?;

        tracing::info!(
            job_id = %spec.job_id,
            file = %spec.session_file.display(),
            "Parsing session transcript"
        );
        let messages = parse_session_file(&spec.session_file)?;
        let transcript = format_transcript(&messages, false);
        let transcript_lines = transcript.lines().count();
        let total_tokens = estimate_tokens(&transcript);

        let result_text = match spec.prompts.chunk.as_ref() {
            Some(chunk_prompts) if should_chunk(&messages, self.settings.chunk_tokens) => {
                tracing::info!(
                    job_id = %spec.job_id,
                    total_tokens,
                    chunk_tokens = self.settings.chunk_tokens,
                    "Transcript exceeds chunk threshold, running map-reduce analysis"
                );
                self.run_map_reduce(spec, chunk_prompts, &messages).await?
            }
            _ => {
                tracing::info!(
                    job_id = %spec.job_id,
                    total_tokens,
                    "Running single-pass analysis"
                );
                self.run_single_pass(&spec.prompts, &transcript, &spec.model, spec.context_size)
                    .await?
            }
        };

        self.store.complete_job(
            &spec.job_id,
            NewResult {
                result_text,
                transcript_lines,
                model_used: spec.model.clone(),
                context_size: spec.context_size,
            },
        )?;

        tracing::info!(job_id = %spec.job_id, "Analysis job completed");
        Ok(())
    }

    /// The one single-pass implementation, shared by the async job path and
    /// the blocking fast-path.
    async fn run_single_pass(
        &self,
        prompts: &PromptSet,
        transcript: &str,
        model: &str,
        context_size: u32,
    ) -> Result<String> {
        let prompt = prompts.render(transcript);
        let response = self
            .client
            .generate(&GenerateRequest {
                model,
                prompt: &prompt,
                system: prompts.system_prompt(),
                context_size,
            })
            .await?;
        Ok(response.text)
    }

    /// Map-reduce analysis: one sequential inference call per chunk, then a
    /// synthesis call over the labeled outputs.
    async fn run_map_reduce(
        &self,
        spec: &JobSpec,
        chunk_prompts: &ChunkPrompts,
        messages: &[Message],
    ) -> Result<String> {
        let chunking = chunk_messages(
            messages,
            self.settings.chunk_tokens,
            self.settings.overlap_turns,
        );

        tracing::info!(
            job_id = %spec.job_id,
            chunks = chunking.chunks.len(),
            messages = chunking.total_messages,
            "Chunked transcript for map-reduce analysis"
        );

        let mut outputs: Vec<String> = Vec::with_capacity(chunking.chunks.len());
        for chunk in &chunking.chunks {
            let position = chunk.chunk_index + 1;
            let prompt =
                chunk_prompts.render_map(&chunk.format_transcript(), position, chunk.total_chunks);
            let system =
                chunk_prompts.map_system_prompt(&spec.prompts.system, position, chunk.total_chunks);

            tracing::info!(
                job_id = %spec.job_id,
                chunk = position,
                total = chunk.total_chunks,
                tokens = chunk.estimated_tokens,
                "Analyzing chunk"
            );

            let response = self
                .client
                .generate(&GenerateRequest {
                    model: &spec.model,
                    prompt: &prompt,
                    system: non_empty(&system),
                    context_size: spec.context_size,
                })
                .await?;

            outputs.push(format!(
                "=== Chunk {}/{} ===\n\n{}",
                position, chunk.total_chunks, response.text
            ));
        }

        let total_chunks = outputs.len();
        tracing::info!(
            job_id = %spec.job_id,
            chunks = total_chunks,
            "Synthesizing chunk results"
        );

        let prompt = chunk_prompts.render_reduce(&outputs.join("\n\n"), total_chunks);
        let system = chunk_prompts.reduce_system_prompt(&spec.prompts.system);

        let response = self
            .client
            .generate(&GenerateRequest {
                model: &spec.model,
                prompt: &prompt,
                system: non_empty(&system),
                context_size: spec.context_size,
            })
            .await?;

        Ok(response.text)
    }
}

fn non_empty(s: &str) -> Option<&str> {
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

/// Derive (session_id, project_path) from a session file path.
///
/// The session id is the file stem; the project path is decoded from the
/// `-Users-foo-bar` style parent directory name.
fn session_identity(session_file: &Path) -> (String, Option<String>) {
    let session_id = session_file
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();

    let project_path = session_file
        .parent()
        .and_then(|p| p.file_name())
        .and_then(|n| n.to_str())
        .and_then(decode_project_path);

    (session_id, project_path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_identity_from_path() {
        let (id, project) =
            session_identity(Path::new("/logs/-Users-kai-dev-proj/abc-123.jsonl"));
        assert_eq!(id, "abc-123");
        assert_eq!(project.as_deref(), Some("/Users/kai/dev/proj"));

        let (id, project) = session_identity(Path::new("/tmp/plain/session.jsonl"));
        assert_eq!(id, "session");
        assert!(project.is_none());
    }

    #[test]
    fn test_settings_default() {
        let settings = OrchestratorSettings::default();
        assert_eq!(settings.workers, 2);
        assert_eq!(settings.chunk_tokens, 6000);
        assert_eq!(settings.overlap_turns, 2);
    }
}
