//! Prompt sets for analysis jobs
//!
//! Templates arrive as plain strings (loading them from files or config is
//! the caller's concern) and use `{placeholder}` substitution:
//!
//! - single-pass template: `{transcript}`
//! - map template: `{transcript}`, `{chunk_index}`, `{total_chunks}`
//! - map system prompt: `{chunk_index}`, `{total_chunks}`
//! - reduce template: `{chunk_results}`, `{total_chunks}`
//!
//! Chunk indices render 1-indexed. Map/reduce system prompts fall back to
//! the single-pass system prompt when unset.

/// Prompts for one analysis job.
#[derive(Debug, Clone)]
pub struct PromptSet {
    /// System prompt for single-pass analysis (may be empty)
    pub system: String,
    /// Single-pass prompt template with a `{transcript}` placeholder
    pub template: String,
    /// Map-reduce prompts; chunked analysis only runs when these are present
    pub chunk: Option<ChunkPrompts>,
}

/// Prompts for the map and reduce phases of chunked analysis.
#[derive(Debug, Clone)]
pub struct ChunkPrompts {
    /// System prompt for per-chunk analysis (falls back to the single-pass
    /// system prompt)
    pub map_system: Option<String>,
    /// Per-chunk prompt template
    pub map_template: String,
    /// System prompt for synthesis (same fallback)
    pub reduce_system: Option<String>,
    /// Synthesis prompt template
    pub reduce_template: String,
}

impl PromptSet {
    /// A single-pass prompt set with no chunking support.
    pub fn single_pass(system: impl Into<String>, template: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            template: template.into(),
            chunk: None,
        }
    }

    /// Attach map-reduce prompts, enabling chunked analysis.
    pub fn with_chunking(mut self, chunk: ChunkPrompts) -> Self {
        self.chunk = Some(chunk);
        self
    }

    /// Render the single-pass prompt.
    pub fn render(&self, transcript: &str) -> String {
        self.template.replace("{transcript}", transcript)
    }

    /// System prompt as an option, treating empty as unset.
    pub fn system_prompt(&self) -> Option<&str> {
        if self.system.is_empty() {
            None
        } else {
            Some(&self.system)
        }
    }
}

impl ChunkPrompts {
    /// Render the map prompt for one chunk. `position` is 1-indexed.
    pub fn render_map(&self, transcript: &str, position: usize, total_chunks: usize) -> String {
        self.map_template
            .replace("{transcript}", transcript)
            .replace("{chunk_index}", &position.to_string())
            .replace("{total_chunks}", &total_chunks.to_string())
    }

    /// Render the map system prompt for one chunk, falling back to
    /// `default_system` when no map system prompt was supplied.
    pub fn map_system_prompt(
        &self,
        default_system: &str,
        position: usize,
        total_chunks: usize,
    ) -> String {
        self.map_system
            .as_deref()
            .unwrap_or(default_system)
            .replace("{chunk_index}", &position.to_string())
            .replace("{total_chunks}", &total_chunks.to_string())
    }

    /// Render the reduce prompt over the concatenated chunk outputs.
    pub fn render_reduce(&self, chunk_results: &str, total_chunks: usize) -> String {
        self.reduce_template
            .replace("{chunk_results}", chunk_results)
            .replace("{total_chunks}", &total_chunks.to_string())
    }

    /// Reduce system prompt with the same fallback as the map phase.
    pub fn reduce_system_prompt(&self, default_system: &str) -> String {
        self.reduce_system
            .as_deref()
            .unwrap_or(default_system)
            .to_string()
    }
}
