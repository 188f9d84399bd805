//! Integration tests for the job orchestrator
//!
//! These drive the full submit -> worker -> store flow against scripted
//! inference backends: no real network, no real model.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;

use recap_core::chunker::chunk_messages;
use recap_core::inference::{
    GeneratePayload, InferenceClient, InferenceTransport, RawReply, TransportError,
};
use recap_core::jobs::{AnalysisRequest, ChunkPrompts, JobOrchestrator, OrchestratorSettings, PromptSet};
use recap_core::store::{JobFilter, JobStore, SqliteJobStore};
use recap_core::transcript::{format_transcript, parse_session_file};
use recap_core::types::{Job, JobStatus, JobType, Role};
use tempfile::TempDir;

/// Get the path to a fixture file
fn fixture_path(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures/claude")
        .join(name)
}

// ============================================
// Transcript fixtures
// ============================================

#[test]
fn test_parse_minimal_session_fixture() {
    let messages = parse_session_file(&fixture_path("minimal-session.jsonl")).unwrap();

    // The summary record and the tool-only assistant record are skipped
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].role, Role::User);
    assert_eq!(messages[0].content, "What does the build script do?");
    assert_eq!(messages[0].session_id.as_deref(), Some("fixture-session"));
    assert_eq!(messages[0].cwd.as_deref(), Some("/Users/test/dev/myproject"));
    assert!(messages[0].timestamp.is_some());
    assert_eq!(messages[1].role, Role::Assistant);
    assert_eq!(
        messages[1].content,
        "It compiles the workspace and runs the test suite."
    );

    let transcript = format_transcript(&messages, false);
    assert!(transcript.contains("Session: fixture-session"));
    assert!(transcript.contains("## User"));
    assert!(transcript.contains("## Assistant"));
}

// ============================================
// Test backend
// ============================================

/// Scripted inference backend shared between the client and the test body.
struct TestBackend {
    /// Serialized generate payloads, in call order
    calls: Mutex<Vec<serde_json::Value>>,
    /// When set, every generate call waits for a permit first
    gate: Option<Semaphore>,
    /// When set, every generate call replies with this HTTP status
    fail_status: Option<u16>,
}

#[derive(Clone)]
struct SharedBackend(Arc<TestBackend>);

impl SharedBackend {
    fn ok() -> Self {
        Self(Arc::new(TestBackend {
            calls: Mutex::new(Vec::new()),
            gate: None,
            fail_status: None,
        }))
    }

    fn gated() -> Self {
        Self(Arc::new(TestBackend {
            calls: Mutex::new(Vec::new()),
            gate: Some(Semaphore::new(0)),
            fail_status: None,
        }))
    }

    fn failing(status: u16) -> Self {
        Self(Arc::new(TestBackend {
            calls: Mutex::new(Vec::new()),
            gate: None,
            fail_status: Some(status),
        }))
    }

    fn release_one(&self) {
        if let Some(gate) = &self.0.gate {
            gate.add_permits(1);
        }
    }

    fn calls(&self) -> Vec<serde_json::Value> {
        self.0.calls.lock().unwrap().clone()
    }

    fn call_count(&self) -> usize {
        self.0.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl InferenceTransport for SharedBackend {
    async fn post_generate(&self, payload: &GeneratePayload) -> Result<RawReply, TransportError> {
        if let Some(gate) = &self.0.gate {
            gate.acquire().await.unwrap().forget();
        }

        let n = {
            let mut calls = self.0.calls.lock().unwrap();
            calls.push(serde_json::to_value(payload).unwrap());
            calls.len()
        };

        if let Some(status) = self.0.fail_status {
            return Ok(RawReply {
                status,
                body: "bad request".to_string(),
            });
        }

        Ok(RawReply {
            status: 200,
            body: serde_json::json!({
                "response": format!("pass-{}", n),
                "model": "test-model",
            })
            .to_string(),
        })
    }

    async fn get_tags(&self) -> Result<RawReply, TransportError> {
        Ok(RawReply {
            status: 200,
            body: r#"{"models":[]}"#.to_string(),
        })
    }
}

// ============================================
// Helpers
// ============================================

fn settings(workers: usize, chunk_tokens: usize) -> OrchestratorSettings {
    OrchestratorSettings {
        default_model: "test-model".to_string(),
        default_context_size: 4096,
        chunk_tokens,
        overlap_turns: 1,
        workers,
    }
}

fn orchestrator(
    backend: &SharedBackend,
    settings: OrchestratorSettings,
) -> (JobOrchestrator<SharedBackend>, Arc<SqliteJobStore>) {
    let store = Arc::new(SqliteJobStore::open_in_memory().unwrap());
    store.migrate().unwrap();
    let client = InferenceClient::with_transport(backend.clone())
        .with_retry(0, Duration::from_millis(1));
    let orch = JobOrchestrator::with_client(store.clone(), client, settings);
    (orch, store)
}

/// Write a session log with `turns` user/assistant pairs of roughly
/// `content_len` characters each, under a project-style directory.
fn write_session(dir: &Path, turns: usize, content_len: usize) -> PathBuf {
    let project_dir = dir.join("-Users-test-dev-proj");
    std::fs::create_dir_all(&project_dir).unwrap();
    let path = project_dir.join("sess-abc.jsonl");

    let mut lines = Vec::new();
    for i in 0..turns {
        let question = format!("question {} {}", i, "x".repeat(content_len));
        let answer = format!("answer {} {}", i, "y".repeat(content_len));
        lines.push(
            serde_json::json!({
                "type": "user",
                "sessionId": "sess-abc",
                "message": {"role": "user", "content": question},
            })
            .to_string(),
        );
        lines.push(
            serde_json::json!({
                "type": "assistant",
                "message": {"role": "assistant", "content": [{"type": "text", "text": answer}]},
            })
            .to_string(),
        );
    }
    std::fs::write(&path, lines.join("\n")).unwrap();
    path
}

fn prompt_set() -> PromptSet {
    PromptSet::single_pass("You are a session scribe.", "Summarize:\n{transcript}")
}

fn prompt_set_with_chunking() -> PromptSet {
    prompt_set().with_chunking(ChunkPrompts {
        map_system: Some("Analyzing part {chunk_index} of {total_chunks}.".to_string()),
        map_template: "Analyze part {chunk_index}/{total_chunks}:\n{transcript}".to_string(),
        reduce_system: None,
        reduce_template: "Synthesize {total_chunks} analyses:\n{chunk_results}".to_string(),
    })
}

fn request(session_file: PathBuf, prompts: PromptSet) -> AnalysisRequest {
    AnalysisRequest {
        job_type: JobType::Stenographer,
        session_file,
        prompts,
        model: None,
        context_size: None,
    }
}

async fn wait_for_terminal(orch: &JobOrchestrator<SharedBackend>, job_id: &str) -> Job {
    for _ in 0..500 {
        let job = orch.job_status(job_id).unwrap().unwrap();
        if job.status.is_terminal() {
            return job;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("job {} did not reach a terminal state", job_id);
}

async fn wait_for_status(
    orch: &JobOrchestrator<SharedBackend>,
    job_id: &str,
    status: JobStatus,
) -> Job {
    for _ in 0..500 {
        let job = orch.job_status(job_id).unwrap().unwrap();
        if job.status == status {
            return job;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("job {} never reached {:?}", job_id, status);
}

// ============================================
// Single-pass path
// ============================================

#[tokio::test]
async fn test_single_pass_job_completes() {
    let dir = TempDir::new().unwrap();
    let session = write_session(dir.path(), 2, 20);
    let backend = SharedBackend::ok();
    let (orch, _store) = orchestrator(&backend, settings(2, 6000));

    let job = orch.submit(request(session, prompt_set_with_chunking())).unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.session_id, "sess-abc");
    assert_eq!(job.project_path.as_deref(), Some("/Users/test/dev/proj"));

    let done = wait_for_terminal(&orch, &job.id).await;
    assert_eq!(done.status, JobStatus::Completed);
    assert!(done.result_id.is_some());
    assert!(done.error_message.is_none());
    assert!(!orch.is_running(&job.id));

    // Small transcript: one inference call, through the single-pass template
    assert_eq!(backend.call_count(), 1);
    let calls = backend.calls();
    let prompt = calls[0]["prompt"].as_str().unwrap();
    assert!(prompt.starts_with("Summarize:\n"));
    assert!(prompt.contains("## User"));
    assert!(prompt.contains("question 0"));
    assert_eq!(calls[0]["system"].as_str(), Some("You are a session scribe."));
    assert_eq!(calls[0]["options"]["num_ctx"], serde_json::json!(4096));

    assert_eq!(orch.job_result(&job.id).unwrap().as_deref(), Some("pass-1"));
}

#[tokio::test]
async fn test_over_threshold_without_chunk_prompts_runs_single_pass() {
    let dir = TempDir::new().unwrap();
    // Way past any reasonable threshold for chunk_tokens=200
    let session = write_session(dir.path(), 6, 400);
    let backend = SharedBackend::ok();
    let (orch, _store) = orchestrator(&backend, settings(1, 200));

    let job = orch.submit(request(session, prompt_set())).unwrap();
    let done = wait_for_terminal(&orch, &job.id).await;

    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(backend.call_count(), 1);
}

// ============================================
// Map-reduce path
// ============================================

#[tokio::test]
async fn test_map_reduce_job_runs_maps_in_order_then_reduce() {
    let dir = TempDir::new().unwrap();
    let session = write_session(dir.path(), 6, 400);
    let backend = SharedBackend::ok();
    let chunk_tokens = 200;
    let (orch, _store) = orchestrator(&backend, settings(1, chunk_tokens));

    // The chunk layout the worker will see
    let messages = parse_session_file(&session).unwrap();
    let expected_chunks = chunk_messages(&messages, chunk_tokens, 1).chunks.len();
    assert!(expected_chunks >= 2, "fixture should force chunking");

    let job = orch
        .submit(request(session, prompt_set_with_chunking()))
        .unwrap();
    let done = wait_for_terminal(&orch, &job.id).await;
    assert_eq!(done.status, JobStatus::Completed);

    // One call per chunk plus the reduce call, in strict order
    let calls = backend.calls();
    assert_eq!(calls.len(), expected_chunks + 1);

    for (i, call) in calls[..expected_chunks].iter().enumerate() {
        let prompt = call["prompt"].as_str().unwrap();
        assert!(
            prompt.starts_with(&format!("Analyze part {}/{}", i + 1, expected_chunks)),
            "map call {} had prompt: {}",
            i,
            &prompt[..60.min(prompt.len())]
        );
        assert_eq!(
            call["system"].as_str().unwrap(),
            format!("Analyzing part {} of {}.", i + 1, expected_chunks)
        );
    }

    let reduce = &calls[expected_chunks];
    let reduce_prompt = reduce["prompt"].as_str().unwrap();
    assert!(reduce_prompt.starts_with(&format!("Synthesize {} analyses:", expected_chunks)));
    // Labeled map outputs are concatenated into the reduce prompt
    for i in 0..expected_chunks {
        assert!(reduce_prompt.contains(&format!("=== Chunk {}/{} ===", i + 1, expected_chunks)));
        assert!(reduce_prompt.contains(&format!("pass-{}", i + 1)));
    }
    // Reduce system prompt falls back to the single-pass system prompt
    assert_eq!(reduce["system"].as_str(), Some("You are a session scribe."));

    // The job's result is the reduce output
    assert_eq!(
        orch.job_result(&job.id).unwrap().as_deref(),
        Some(format!("pass-{}", expected_chunks + 1).as_str())
    );
}

// ============================================
// Failure semantics
// ============================================

#[tokio::test]
async fn test_failed_inference_marks_job_failed() {
    let dir = TempDir::new().unwrap();
    let session = write_session(dir.path(), 6, 400);
    let backend = SharedBackend::failing(400);
    let (orch, _store) = orchestrator(&backend, settings(1, 200));

    // Chunked path: the first map call fails, nothing partial is persisted
    let job = orch
        .submit(request(session, prompt_set_with_chunking()))
        .unwrap();
    let done = wait_for_terminal(&orch, &job.id).await;

    assert_eq!(done.status, JobStatus::Failed);
    let message = done.error_message.unwrap();
    assert!(message.contains("400"), "error message: {}", message);
    assert!(done.result_id.is_none());
    assert!(orch.job_result(&job.id).unwrap().is_none());
    assert!(!orch.is_running(&job.id));

    // Only one inference call was attempted
    assert_eq!(backend.call_count(), 1);
}

#[tokio::test]
async fn test_missing_session_file_marks_job_failed() {
    let backend = SharedBackend::ok();
    let (orch, _store) = orchestrator(&backend, settings(1, 6000));

    let job = orch
        .submit(request(PathBuf::from("/nonexistent/sess.jsonl"), prompt_set()))
        .unwrap();
    let done = wait_for_terminal(&orch, &job.id).await;

    assert_eq!(done.status, JobStatus::Failed);
    assert!(done.error_message.is_some());
    assert_eq!(backend.call_count(), 0);
}

// ============================================
// Worker pool
// ============================================

#[tokio::test]
async fn test_pool_of_one_admits_jobs_fifo() {
    let dir = TempDir::new().unwrap();
    let session = write_session(dir.path(), 2, 20);
    let backend = SharedBackend::gated();
    let (orch, _store) = orchestrator(&backend, settings(1, 6000));

    let first = orch.submit(request(session.clone(), prompt_set())).unwrap();
    let second = orch.submit(request(session, prompt_set())).unwrap();
    assert!(orch.is_running(&first.id));
    assert!(orch.is_running(&second.id));

    // The single worker picks up the first job and blocks on the backend
    wait_for_status(&orch, &first.id, JobStatus::Running).await;

    // The second job stays PENDING while the first occupies the worker
    for _ in 0..10 {
        let job = orch.job_status(&second.id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    // Releasing the backend lets the first job finish and the second start
    backend.release_one();
    let first_done = wait_for_terminal(&orch, &first.id).await;
    assert_eq!(first_done.status, JobStatus::Completed);

    wait_for_status(&orch, &second.id, JobStatus::Running).await;
    backend.release_one();
    let second_done = wait_for_terminal(&orch, &second.id).await;
    assert_eq!(second_done.status, JobStatus::Completed);
}

// ============================================
// Blocking fast-path
// ============================================

#[tokio::test]
async fn test_blocking_path_creates_no_job_record() {
    let dir = TempDir::new().unwrap();
    let session = write_session(dir.path(), 2, 20);
    let backend = SharedBackend::ok();
    let (orch, store) = orchestrator(&backend, settings(2, 6000));

    let text = orch
        .analyze_blocking(&session, &prompt_set(), None, None)
        .await
        .unwrap();

    assert_eq!(text, "pass-1");
    assert!(store.list_jobs(&JobFilter::default()).unwrap().is_empty());
}

#[tokio::test]
async fn test_blocking_path_surfaces_errors_directly() {
    let dir = TempDir::new().unwrap();
    let session = write_session(dir.path(), 2, 20);
    let backend = SharedBackend::failing(500);
    let (orch, store) = orchestrator(&backend, settings(2, 6000));

    let err = orch
        .analyze_blocking(&session, &prompt_set(), None, None)
        .await
        .unwrap_err();

    assert!(err.to_string().contains("500"), "error: {}", err);
    assert!(store.list_jobs(&JobFilter::default()).unwrap().is_empty());
}

// ============================================
// Model precedence and maintenance
// ============================================

#[tokio::test]
async fn test_model_precedence() {
    let backend = SharedBackend::ok();
    let (orch, _store) = orchestrator(&backend, settings(1, 6000));

    assert_eq!(orch.effective_model(None), "test-model");

    orch.set_model("qwen2.5:14b");
    assert_eq!(orch.effective_model(None), "qwen2.5:14b");

    // An explicit request value beats the runtime override
    assert_eq!(orch.effective_model(Some("mistral:7b")), "mistral:7b");

    orch.reset_model();
    assert_eq!(orch.effective_model(None), "test-model");
}

#[tokio::test]
async fn test_sweep_keeps_fresh_results() {
    let dir = TempDir::new().unwrap();
    let session = write_session(dir.path(), 2, 20);
    let backend = SharedBackend::ok();
    let (orch, _store) = orchestrator(&backend, settings(1, 6000));

    let job = orch.submit(request(session, prompt_set())).unwrap();
    wait_for_terminal(&orch, &job.id).await;

    // A just-written result survives the retention sweep
    assert_eq!(orch.sweep_older_than(30).unwrap(), 0);
    assert!(orch.job_result(&job.id).unwrap().is_some());
}

#[tokio::test]
async fn test_backend_probe() {
    let backend = SharedBackend::ok();
    let (orch, _store) = orchestrator(&backend, settings(1, 6000));
    assert!(orch.backend_available().await);
    assert!(orch.list_models().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_shutdown_drains_queued_jobs() {
    let dir = TempDir::new().unwrap();
    let session = write_session(dir.path(), 2, 20);
    let backend = SharedBackend::ok();
    let (orch, store) = orchestrator(&backend, settings(1, 6000));

    let a = orch.submit(request(session.clone(), prompt_set())).unwrap();
    let b = orch.submit(request(session, prompt_set())).unwrap();

    orch.shutdown().await;

    for id in [&a.id, &b.id] {
        let job = store.get_job(id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
    }
}
