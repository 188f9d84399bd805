//! recap - map-reduce transcript analysis for AI coding sessions
//!
//! Submits session transcripts to a local Ollama-protocol backend for
//! analysis, chunking long conversations map-reduce style, and tracks the
//! work as jobs in SQLite.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use recap_core::jobs::{AnalysisRequest, ChunkPrompts, JobOrchestrator, PromptSet};
use recap_core::store::{JobFilter, JobStore, SqliteJobStore};
use recap_core::transcript::{extract_transcript, find_sessions};
use recap_core::types::{Job, JobStatus, JobType};
use recap_core::{Config, InferenceClient};

#[derive(Parser)]
#[command(name = "recap")]
#[command(about = "Analyze AI coding session transcripts with a local model")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List recent Claude Code session files
    Sessions {
        /// Filter sessions by project path substring
        #[arg(short, long)]
        project: Option<String>,

        /// Only include sessions from the last N days
        #[arg(long, default_value_t = 30)]
        days: u32,

        /// Maximum sessions to list
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },

    /// Print the formatted transcript of a session file
    Transcript {
        /// Path to the session .jsonl file
        file: PathBuf,

        /// Include timestamps in the output
        #[arg(long)]
        metadata: bool,
    },

    /// Run an analysis over a session file
    Analyze {
        /// Path to the session .jsonl file
        file: PathBuf,

        /// Kind of analysis to run
        #[arg(long, default_value = "stenographer")]
        job_type: JobType,

        /// Model to use (defaults to the configured model)
        #[arg(short, long)]
        model: Option<String>,

        /// Context window size (num_ctx)
        #[arg(long)]
        context_size: Option<u32>,

        /// Run synchronously without creating a job record
        #[arg(long)]
        blocking: bool,

        /// File holding the system prompt
        #[arg(long)]
        system: Option<PathBuf>,

        /// File holding the prompt template ({transcript})
        #[arg(long)]
        prompt: Option<PathBuf>,

        /// File holding the per-chunk system prompt ({chunk_index}, {total_chunks})
        #[arg(long)]
        chunk_system: Option<PathBuf>,

        /// File holding the per-chunk prompt template; enables map-reduce
        /// together with --synthesis-prompt
        #[arg(long)]
        chunk_prompt: Option<PathBuf>,

        /// File holding the synthesis system prompt
        #[arg(long)]
        synthesis_system: Option<PathBuf>,

        /// File holding the synthesis prompt template ({chunk_results}, {total_chunks})
        #[arg(long)]
        synthesis_prompt: Option<PathBuf>,
    },

    /// Show status and result of an analysis job
    Status {
        /// Job ID returned by analyze
        job_id: String,
    },

    /// List analysis jobs
    Jobs {
        /// Filter by status (PENDING, RUNNING, COMPLETED, FAILED)
        #[arg(long)]
        status: Option<JobStatus>,

        /// Filter by session ID
        #[arg(long)]
        session: Option<String>,

        /// Filter by job type
        #[arg(long)]
        job_type: Option<JobType>,

        /// Maximum jobs to list
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },

    /// List models available on the inference backend
    Models,

    /// Delete analysis results older than the retention window
    Sweep {
        /// Retention in days (defaults to the configured retention)
        #[arg(long)]
        days: Option<u32>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    Config::ensure_xdg_env();

    let config = Config::load().context("failed to load configuration")?;
    let _log_guard =
        recap_core::logging::init(&config.logging).context("failed to initialize logging")?;

    match cli.command {
        Command::Sessions {
            project,
            days,
            limit,
        } => list_sessions(&config, project.as_deref(), days, limit),

        Command::Transcript { file, metadata } => {
            let transcript = extract_transcript(&file, metadata)
                .with_context(|| format!("failed to read session file {}", file.display()))?;
            println!("{}", transcript);
            Ok(())
        }

        Command::Analyze {
            file,
            job_type,
            model,
            context_size,
            blocking,
            system,
            prompt,
            chunk_system,
            chunk_prompt,
            synthesis_system,
            synthesis_prompt,
        } => {
            let prompts = build_prompts(
                system,
                prompt,
                chunk_system,
                chunk_prompt,
                synthesis_system,
                synthesis_prompt,
            )?;
            analyze(
                &config,
                &file,
                job_type,
                prompts,
                model,
                context_size,
                blocking,
            )
            .await
        }

        Command::Status { job_id } => {
            let store = open_store(&config)?;
            match store.get_job(&job_id)? {
                Some(job) => {
                    print_job(&job);
                    if job.status == JobStatus::Completed {
                        if let Some(result_id) = &job.result_id {
                            if let Some(result) = store.get_result(result_id)? {
                                println!("\n--- Result ---\n");
                                println!("{}", result.result_text);
                            }
                        }
                    }
                    Ok(())
                }
                None => anyhow::bail!("job not found: {}", job_id),
            }
        }

        Command::Jobs {
            status,
            session,
            job_type,
            limit,
        } => {
            let store = open_store(&config)?;
            let jobs = store.list_jobs(&JobFilter {
                status,
                session_id: session,
                job_type,
                limit,
            })?;

            if jobs.is_empty() {
                println!("No jobs found");
                return Ok(());
            }
            for job in jobs {
                print_job(&job);
                println!();
            }
            Ok(())
        }

        Command::Models => list_models(&config).await,

        Command::Sweep { days } => {
            let store = open_store(&config)?;
            let days = days.unwrap_or(config.analysis.retention_days);
            let cutoff = chrono::Utc::now() - chrono::Duration::days(i64::from(days));
            let deleted = store.sweep_expired(cutoff)?;
            println!("Deleted {} result(s) older than {} days", deleted, days);
            Ok(())
        }
    }
}

fn open_store(config: &Config) -> Result<Arc<SqliteJobStore>> {
    let store = SqliteJobStore::open(&Config::database_path())
        .context("failed to open job database")?;
    store.migrate().context("failed to run database migrations")?;

    // Retention sweep on startup
    let cutoff =
        chrono::Utc::now() - chrono::Duration::days(i64::from(config.analysis.retention_days));
    let deleted = store.sweep_expired(cutoff)?;
    if deleted > 0 {
        tracing::info!(deleted, "Cleaned up expired analysis results");
    }

    Ok(Arc::new(store))
}

fn list_sessions(
    config: &Config,
    project: Option<&str>,
    days: u32,
    limit: usize,
) -> Result<()> {
    let base = config.sessions.dir();
    let sessions =
        find_sessions(&base, project, days, limit).context("failed to discover sessions")?;

    if sessions.is_empty() {
        println!("No sessions found under {}", base.display());
        return Ok(());
    }

    for session in sessions {
        println!("- {}", session.session_id);
        println!(
            "  Project: {}",
            session.project_path.as_deref().unwrap_or("unknown")
        );
        println!("  Modified: {}", session.modified_at.to_rfc3339());
        println!("  Size: {} bytes", session.size_bytes);
        println!("  Path: {}", session.file_path.display());
    }
    Ok(())
}

fn build_prompts(
    system: Option<PathBuf>,
    prompt: Option<PathBuf>,
    chunk_system: Option<PathBuf>,
    chunk_prompt: Option<PathBuf>,
    synthesis_system: Option<PathBuf>,
    synthesis_prompt: Option<PathBuf>,
) -> Result<PromptSet> {
    let system = read_template(system)?.unwrap_or_default();
    let template = read_template(prompt)?.unwrap_or_else(|| "{transcript}".to_string());

    let mut prompts = PromptSet::single_pass(system, template);

    match (read_template(chunk_prompt)?, read_template(synthesis_prompt)?) {
        (Some(map_template), Some(reduce_template)) => {
            prompts = prompts.with_chunking(ChunkPrompts {
                map_system: read_template(chunk_system)?,
                map_template,
                reduce_system: read_template(synthesis_system)?,
                reduce_template,
            });
        }
        (None, None) => {}
        _ => anyhow::bail!("--chunk-prompt and --synthesis-prompt must be given together"),
    }

    Ok(prompts)
}

fn read_template(path: Option<PathBuf>) -> Result<Option<String>> {
    match path {
        Some(path) => {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read prompt file {}", path.display()))?;
            Ok(Some(content))
        }
        None => Ok(None),
    }
}

async fn analyze(
    config: &Config,
    file: &Path,
    job_type: JobType,
    prompts: PromptSet,
    model: Option<String>,
    context_size: Option<u32>,
    blocking: bool,
) -> Result<()> {
    if !file.exists() {
        anyhow::bail!("session file not found: {}", file.display());
    }

    let store = open_store(config)?;
    let orchestrator = JobOrchestrator::from_config(store, config)
        .context("failed to create job orchestrator")?;

    if blocking {
        let text = orchestrator
            .analyze_blocking(file, &prompts, model.as_deref(), context_size)
            .await?;
        println!("{}", text);
        return Ok(());
    }

    let job = orchestrator.submit(AnalysisRequest {
        job_type,
        session_file: file.to_path_buf(),
        prompts,
        model,
        context_size,
    })?;

    println!("Job submitted: {}", job.id);
    println!("Session: {}", job.session_id);

    // Wait for the worker to finish; the job record survives either way
    let done = loop {
        tokio::time::sleep(Duration::from_millis(500)).await;
        match orchestrator.job_status(&job.id)? {
            Some(job) if job.status.is_terminal() => break job,
            Some(_) => continue,
            None => anyhow::bail!("job disappeared: {}", job.id),
        }
    };

    match done.status {
        JobStatus::Completed => {
            if let Some(result) = orchestrator.job_result(&done.id)? {
                println!("\n--- Result ---\n");
                println!("{}", result);
            }
            orchestrator.shutdown().await;
            Ok(())
        }
        _ => {
            orchestrator.shutdown().await;
            anyhow::bail!(
                "job {} failed: {}",
                done.id,
                done.error_message.as_deref().unwrap_or("unknown error")
            )
        }
    }
}

async fn list_models(config: &Config) -> Result<()> {
    let client = InferenceClient::new(&config.inference.url, config.inference.timeout())
        .context("failed to create inference client")?;

    if !client.is_available().await {
        anyhow::bail!(
            "inference backend at {} is not reachable",
            config.inference.url
        );
    }

    let models = client.list_models().await?;
    if models.is_empty() {
        println!("No models found on {}", config.inference.url);
        return Ok(());
    }

    for model in models {
        let size_gb = model.size as f64 / (1024u64.pow(3) as f64);
        let marker = if model.name == config.inference.model {
            " <- current"
        } else {
            ""
        };
        println!("- {} ({:.1} GB){}", model.name, size_gb, marker);
    }
    Ok(())
}

fn print_job(job: &Job) {
    println!("Job ID: {}", job.id);
    println!("Type: {}", job.job_type);
    println!("Session: {}", job.session_id);
    println!("Status: {}", job.status);
    println!("Created: {}", job.created_at.to_rfc3339());
    println!("Updated: {}", job.updated_at.to_rfc3339());
    if let Some(error) = &job.error_message {
        println!("Error: {}", error);
    }
}
