//! Token-budget chunking for transcript analysis
//!
//! Long transcripts are split at conversation-turn boundaries so that each
//! piece fits a single inference pass, enabling map-reduce analysis with
//! models whose context window the full transcript would overflow.
//!
//! Sizing everywhere in this module (and in the orchestrator's chunk/no-chunk
//! decision) goes through [`estimate_tokens`] over the output of the
//! production formatter, so the gate and the actual payload cannot drift.
//! [`chunk_threshold`] is the one place the safety margin lives.

use crate::transcript::format_transcript;
use crate::types::{Message, Role};

/// Default target tokens per chunk (~24k chars, leaving room for prompts)
pub const DEFAULT_CHUNK_TOKENS: usize = 6000;
/// Default number of turns to overlap between chunks
pub const DEFAULT_OVERLAP_TURNS: usize = 2;
/// Rough estimate: ~4 characters per token
pub const CHARS_PER_TOKEN: usize = 4;
/// Fixed per-message overhead for role/formatting
const MESSAGE_OVERHEAD_TOKENS: usize = 10;

/// Estimate token count from text.
///
/// Simple heuristic of ~4 characters per token, a reasonable approximation
/// for English text and code.
pub fn estimate_tokens(text: &str) -> usize {
    text.len() / CHARS_PER_TOKEN
}

/// Estimate tokens for a single message including formatting overhead.
pub fn estimate_message_tokens(message: &Message) -> usize {
    estimate_tokens(&message.content) + MESSAGE_OVERHEAD_TOKENS
}

/// Token threshold above which a transcript gets chunked.
///
/// 80% of the target, the margin covering estimator error and prompt
/// overhead that is not counted in the transcript itself. Every call site
/// that decides chunk vs. no-chunk must use this function.
pub fn chunk_threshold(target_tokens: usize) -> usize {
    target_tokens * 4 / 5
}

/// A conversation turn: one user message plus its assistant reply, if any.
#[derive(Debug, Clone)]
pub struct Turn {
    pub user_message: Message,
    pub assistant_message: Option<Message>,
    pub estimated_tokens: usize,
}

impl Turn {
    /// Messages in this turn, in order.
    pub fn messages(&self) -> Vec<&Message> {
        match &self.assistant_message {
            Some(reply) => vec![&self.user_message, reply],
            None => vec![&self.user_message],
        }
    }

    /// A turn is complete once it has an assistant reply.
    pub fn is_complete(&self) -> bool {
        self.assistant_message.is_some()
    }
}

/// A bounded-size slice of turns dispatched as one inference unit.
///
/// `messages` holds any overlap copied from the previous chunk first, then
/// this chunk's own turns. `estimated_tokens` counts the new turns only.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub messages: Vec<Message>,
    pub chunk_index: usize,
    pub total_chunks: usize,
    /// Number of leading messages duplicated from the previous chunk
    pub overlap_count: usize,
    pub estimated_tokens: usize,
}

impl Chunk {
    /// Format this chunk as a markdown transcript, through the same
    /// formatter used for whole transcripts.
    pub fn format_transcript(&self) -> String {
        format_transcript(&self.messages, false)
    }
}

/// Configuration a chunking run was performed with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkConfig {
    pub target_tokens: usize,
    pub overlap_turns: usize,
}

/// Result of a chunking operation.
#[derive(Debug, Clone)]
pub struct ChunkingResult {
    pub chunks: Vec<Chunk>,
    pub total_tokens: usize,
    pub total_messages: usize,
    /// False when the transcript fit in a single pass
    pub was_chunked: bool,
    pub config: ChunkConfig,
}

/// Group messages into conversation turns.
///
/// A `user` message starts a new turn, flushing any open one. An `assistant`
/// message attaches to the open turn; with no open turn it is dropped (an
/// assistant record with no preceding user message never appears in any
/// turn). The final open turn is still emitted.
pub fn group_into_turns(messages: &[Message]) -> Vec<Turn> {
    let mut turns: Vec<Turn> = Vec::new();
    let mut current: Option<Turn> = None;

    for msg in messages {
        match msg.role {
            Role::User => {
                if let Some(turn) = current.take() {
                    turns.push(turn);
                }
                current = Some(Turn {
                    user_message: msg.clone(),
                    assistant_message: None,
                    estimated_tokens: estimate_message_tokens(msg),
                });
            }
            Role::Assistant => {
                if let Some(turn) = current.as_mut() {
                    turn.estimated_tokens += estimate_message_tokens(msg);
                    turn.assistant_message = Some(msg.clone());
                }
            }
        }
    }

    if let Some(turn) = current {
        turns.push(turn);
    }

    turns
}

/// Pure predicate form of the chunking gate.
///
/// True when the formatted transcript exceeds [`chunk_threshold`] of
/// `target_tokens`. Shares its arithmetic with [`chunk_messages`].
pub fn should_chunk(messages: &[Message], target_tokens: usize) -> bool {
    if messages.is_empty() {
        return false;
    }
    let total = estimate_tokens(&format_transcript(messages, false));
    total > chunk_threshold(target_tokens)
}

/// Split messages into token-budgeted chunks at turn boundaries.
///
/// Turns are accumulated greedily; a turn that would push the running total
/// past `target_tokens` closes the current chunk first (unless the chunk is
/// empty, in which case the oversized turn becomes a chunk by itself, never
/// split). The last `overlap_turns` turns of each chunk are copied as the
/// leading content of the next for context continuity.
pub fn chunk_messages(
    messages: &[Message],
    target_tokens: usize,
    overlap_turns: usize,
) -> ChunkingResult {
    let config = ChunkConfig {
        target_tokens,
        overlap_turns,
    };

    if messages.is_empty() {
        return ChunkingResult {
            chunks: vec![],
            total_tokens: 0,
            total_messages: 0,
            was_chunked: false,
            config,
        };
    }

    let total_tokens = estimate_tokens(&format_transcript(messages, false));

    if total_tokens <= chunk_threshold(target_tokens) {
        // Fits in a single pass
        let chunk = Chunk {
            messages: messages.to_vec(),
            chunk_index: 0,
            total_chunks: 1,
            overlap_count: 0,
            estimated_tokens: total_tokens,
        };
        return ChunkingResult {
            chunks: vec![chunk],
            total_tokens,
            total_messages: messages.len(),
            was_chunked: false,
            config,
        };
    }

    let turns = group_into_turns(messages);
    if turns.is_empty() {
        // Nothing but orphan assistant records; degrade to an empty result
        return ChunkingResult {
            chunks: vec![],
            total_tokens,
            total_messages: messages.len(),
            was_chunked: false,
            config,
        };
    }

    tracing::info!(
        messages = messages.len(),
        turns = turns.len(),
        total_tokens,
        target_tokens,
        "Chunking transcript"
    );

    let mut chunks: Vec<Chunk> = Vec::new();
    let mut current: Vec<Turn> = Vec::new();
    let mut current_tokens = 0usize;
    let mut overlap: Vec<Turn> = Vec::new();

    for turn in turns {
        if current_tokens + turn.estimated_tokens > target_tokens && !current.is_empty() {
            chunks.push(build_chunk(chunks.len(), &overlap, &current));

            overlap = if overlap_turns > 0 {
                current[current.len().saturating_sub(overlap_turns)..].to_vec()
            } else {
                Vec::new()
            };

            current_tokens = turn.estimated_tokens;
            current = vec![turn];
        } else {
            current_tokens += turn.estimated_tokens;
            current.push(turn);
        }
    }

    if !current.is_empty() {
        chunks.push(build_chunk(chunks.len(), &overlap, &current));
    }

    // Second pass: stamp the final chunk count on every chunk
    let total_chunks = chunks.len();
    for chunk in &mut chunks {
        chunk.total_chunks = total_chunks;
    }

    tracing::info!(chunks = total_chunks, "Chunking complete");

    ChunkingResult {
        chunks,
        total_tokens,
        total_messages: messages.len(),
        was_chunked: true,
        config,
    }
}

fn build_chunk(index: usize, overlap: &[Turn], turns: &[Turn]) -> Chunk {
    let mut messages: Vec<Message> = Vec::new();
    let mut overlap_count = 0;

    for turn in overlap {
        for msg in turn.messages() {
            messages.push(msg.clone());
            overlap_count += 1;
        }
    }

    for turn in turns {
        for msg in turn.messages() {
            messages.push(msg.clone());
        }
    }

    Chunk {
        messages,
        chunk_index: index,
        total_chunks: 0, // stamped after all chunks exist
        overlap_count,
        estimated_tokens: turns.iter().map(|t| t.estimated_tokens).sum(),
    }
}
