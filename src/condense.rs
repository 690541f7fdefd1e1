//! The reduction primitive shared by every merging stage.
//!
//! [`Condenser::reduce`] sends a text plus an instruction to the model. Texts at
//! or above the chunk threshold are cut at heading boundaries, each chunk is
//! reduced on its own worker, and the chunk outputs are concatenated in order.

use crate::{
    config::Config,
    document::parse_heading,
    llm::{LanguageModel, LlmError, RetryPolicy},
    pool::run_ordered,
    token::{compression_ratio, CharEstimator, TokenEstimator},
};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Separates the instruction from the document inside a prompt.
pub(crate) const DOCUMENT_MARKER: &str = "\n\n=== DOCUMENT ===\n\n";

/// Outcome of one reduce invocation.
#[derive(Debug, Clone, Serialize)]
pub struct CondensationResult {
    /// Whether every model call succeeded
    pub success: bool,

    /// Reduced text, present on success
    pub condensed_content: Option<String>,

    /// Estimated tokens of the input
    pub original_tokens: usize,

    /// Estimated tokens of the output
    pub condensed_tokens: usize,

    /// `condensed_tokens / original_tokens`
    pub compression_ratio: f64,

    /// Wall-clock seconds spent, retries included
    pub processing_time: f64,

    /// Failure description, present on failure
    pub error: Option<String>,
}

impl CondensationResult {
    fn succeeded(original_tokens: usize, content: String, condensed_tokens: usize, elapsed: Duration) -> Self {
        Self {
            success: true,
            condensed_content: Some(content),
            original_tokens,
            condensed_tokens,
            compression_ratio: compression_ratio(original_tokens, condensed_tokens),
            processing_time: elapsed.as_secs_f64(),
            error: None,
        }
    }

    fn failed(original_tokens: usize, error: String, elapsed: Duration) -> Self {
        Self {
            success: false,
            condensed_content: None,
            original_tokens,
            condensed_tokens: 0,
            compression_ratio: 0.0,
            processing_time: elapsed.as_secs_f64(),
            error: Some(error),
        }
    }

    /// Returns the reduced text on success.
    #[must_use]
    pub fn content(&self) -> Option<&str> {
        self.condensed_content.as_deref()
    }

    /// Returns the failure description, or a generic one.
    #[must_use]
    pub fn error_message(&self) -> &str {
        self.error.as_deref().unwrap_or("unknown error")
    }
}

/// Splits an oversized text into chunks of at most `chunk_size` chars.
///
/// Returns no chunks when `text` is shorter than `threshold` chars, meaning it
/// should be sent whole. Otherwise cuts are made before heading lines outside code
/// fences, and pieces are packed greedily up to `chunk_size`; a piece that is still
/// too large is sliced at fixed char offsets. Concatenating the chunks gives back
/// `text` exactly.
#[must_use]
pub fn split_into_chunks(text: &str, threshold: usize, chunk_size: usize) -> Vec<&str> {
    if text.chars().count() < threshold {
        return Vec::new();
    }
    let chunk_size = chunk_size.max(1);

    let mut chunks = Vec::new();
    let mut start = 0;
    let mut len = 0;
    let mut in_fence = false;
    let mut piece_start = 0;
    let mut offset = 0;

    let mut pieces = Vec::new();
    for line in text.split_inclusive('\n') {
        let trimmed = line.trim_start();
        if trimmed.starts_with("```") || trimmed.starts_with("~~~") {
            in_fence = !in_fence;
        } else if !in_fence && offset > 0 && parse_heading(line.trim_end_matches(['\r', '\n'])).is_some() {
            pieces.push(&text[piece_start..offset]);
            piece_start = offset;
        }
        offset += line.len();
    }
    pieces.push(&text[piece_start..]);

    let mut end = 0;
    for piece in pieces {
        let piece_len = piece.chars().count();
        if len > 0 && len + piece_len > chunk_size {
            push_sliced(&mut chunks, &text[start..end], chunk_size);
            start = end;
            len = 0;
        }
        end += piece.len();
        len += piece_len;
    }
    if start < end {
        push_sliced(&mut chunks, &text[start..end], chunk_size);
    }

    chunks
}

fn push_sliced<'a>(chunks: &mut Vec<&'a str>, chunk: &'a str, chunk_size: usize) {
    let mut start = 0;
    let mut count = 0;
    for (idx, _) in chunk.char_indices() {
        if count == chunk_size {
            chunks.push(&chunk[start..idx]);
            start = idx;
            count = 0;
        }
        count += 1;
    }
    if start < chunk.len() {
        chunks.push(&chunk[start..]);
    }
}

/// Reduces texts through the model, chunking the ones that are too large.
pub struct Condenser {
    model: Arc<dyn LanguageModel>,
    retry: RetryPolicy,
    estimator: Arc<dyn TokenEstimator>,
    max_output_tokens: u32,
    temperature: f32,
    chunk_threshold: usize,
    chunk_size: usize,
    chunk_workers: usize,
}

impl Condenser {
    /// Creates a condenser from configuration.
    #[must_use]
    pub fn new(config: &Config, model: Arc<dyn LanguageModel>) -> Self {
        Self {
            model,
            retry: RetryPolicy::from_config(&config.llm),
            estimator: CharEstimator::shared(),
            max_output_tokens: config.llm.max_output_tokens,
            temperature: config.llm.temperature,
            chunk_threshold: config.merge.chunk_threshold,
            chunk_size: config.merge.chunk_size,
            chunk_workers: config.merge.chunk_workers,
        }
    }

    /// Returns the estimator used for token figures.
    #[must_use]
    pub fn estimator(&self) -> &dyn TokenEstimator {
        self.estimator.as_ref()
    }

    /// Reduces `text` according to `instruction`.
    ///
    /// Never panics or returns early on model failures: a call that exhausts its
    /// retries produces a result with `success == false`. A chunked text fails if
    /// any of its chunks fails.
    pub fn reduce(&self, text: &str, instruction: &str) -> CondensationResult {
        let start = Instant::now();
        let original_tokens = self.estimator.estimate(text);

        let chunks = split_into_chunks(text, self.chunk_threshold, self.chunk_size);
        let outcome = if chunks.is_empty() {
            self.call(text, instruction).map_err(|e| e.to_string())
        } else {
            self.reduce_chunks(&chunks, instruction)
        };

        match outcome {
            Ok(content) => {
                let condensed_tokens = self.estimator.estimate(&content);
                CondensationResult::succeeded(original_tokens, content, condensed_tokens, start.elapsed())
            }
            Err(error) => CondensationResult::failed(original_tokens, error, start.elapsed()),
        }
    }

    fn reduce_chunks(&self, chunks: &[&str], instruction: &str) -> Result<String, String> {
        let total = chunks.len();
        debug!(
            "Text of {} chars exceeds {} chars, reducing {} chunks",
            chunks.iter().map(|c| c.len()).sum::<usize>(),
            self.chunk_threshold,
            total
        );

        let outputs = run_ordered("chunk", self.chunk_workers, chunks.to_vec(), |_, chunk| {
            self.call(chunk, instruction)
        })
        .map_err(|e| e.to_string())?;

        let mut parts = Vec::with_capacity(total);
        let mut failures = Vec::new();
        for (index, output) in outputs.into_iter().enumerate() {
            match output {
                Ok(text) => parts.push(text.trim().to_string()),
                Err(e) => failures.push(format!("chunk {}/{}: {}", index + 1, total, e)),
            }
        }

        if failures.is_empty() {
            Ok(parts.join("\n\n"))
        } else {
            warn!("{} of {} chunks failed", failures.len(), total);
            Err(failures.join("; "))
        }
    }

    fn call(&self, text: &str, instruction: &str) -> Result<String, LlmError> {
        let prompt = format!("{instruction}{DOCUMENT_MARKER}{text}");
        self.retry
            .run(|| self.model.call(&prompt, self.max_output_tokens, self.temperature))
    }
}
