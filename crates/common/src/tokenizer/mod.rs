//! Token counting, truncation, and overlapping chunking.
//!
//! Uses tiktoken BPE encodings for exact counts. If the encoding cannot be
//! loaded or fails on an input, counting falls back to a conservative
//! byte-based estimate and logs a warning instead of failing the request.

mod chunker;

pub use chunker::{reassemble, TextChunk, TextChunks};

use crate::config::TokenizerConfig;
use crate::errors::{AppError, Result};
use std::sync::Arc;
use tracing::warn;
use unicode_segmentation::UnicodeSegmentation;

/// Trait for tokenization backends.
///
/// Implementations must be thread-safe; one instance is shared by every request.
pub trait Tokenizer: Send + Sync {
    /// Encode text into token IDs.
    fn encode(&self, text: &str) -> Result<Vec<u32>>;

    /// Decode token IDs back into text. Fails if the IDs end inside a
    /// multi-byte character.
    fn decode(&self, tokens: &[u32]) -> Result<String>;

    /// Get the name/identifier of this tokenizer.
    fn name(&self) -> &str;
}

/// Tiktoken-based tokenizer implementation.
pub struct TiktokenTokenizer {
    bpe: tiktoken_rs::CoreBPE,
    name: String,
}

impl TiktokenTokenizer {
    /// Load an encoding by name (`cl100k_base`, `p50k_base`, `r50k_base`)
    /// or by model identifier (`gpt-4`, `gpt-3.5-turbo`).
    pub fn new(encoding: &str) -> Result<Self> {
        let bpe = match encoding {
            "cl100k_base" => tiktoken_rs::cl100k_base(),
            "p50k_base" => tiktoken_rs::p50k_base(),
            "r50k_base" => tiktoken_rs::r50k_base(),
            model => tiktoken_rs::get_bpe_from_model(model),
        }
        .map_err(|e| AppError::Internal {
            message: format!("Failed to initialize tokenizer '{}': {}", encoding, e),
        })?;

        Ok(Self {
            bpe,
            name: encoding.to_string(),
        })
    }
}

impl Tokenizer for TiktokenTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        Ok(self
            .bpe
            .encode_ordinary(text)
            .into_iter()
            .map(|t| t as u32)
            .collect())
    }

    fn decode(&self, tokens: &[u32]) -> Result<String> {
        let token_vec: Vec<usize> = tokens.iter().map(|&t| t as usize).collect();
        self.bpe.decode(token_vec).map_err(|e| AppError::Internal {
            message: format!("Failed to decode tokens: {}", e),
        })
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Conservative token estimate: one token per three bytes, rounded up.
///
/// BPE encodings average closer to four bytes per token on English text,
/// so this over-counts, which keeps budget arithmetic on the safe side.
pub fn estimate_tokens(text: &str) -> usize {
    (text.len() + 2) / 3
}

/// Token operations used throughout the pipeline.
///
/// Cheap to clone; wraps an optional backend and degrades to
/// [`estimate_tokens`] when the backend is missing or errors.
#[derive(Clone)]
pub struct TextTokenizer {
    backend: Option<Arc<dyn Tokenizer>>,
}

impl TextTokenizer {
    /// Wrap an explicit backend.
    pub fn new(backend: Arc<dyn Tokenizer>) -> Self {
        Self {
            backend: Some(backend),
        }
    }

    /// Estimation only, no BPE backend.
    pub fn heuristic() -> Self {
        Self { backend: None }
    }

    /// Build from configuration; a backend that fails to load is logged and
    /// replaced by the heuristic.
    pub fn from_config(config: &TokenizerConfig) -> Self {
        match TiktokenTokenizer::new(&config.encoding) {
            Ok(tokenizer) => Self::new(Arc::new(tokenizer)),
            Err(e) => {
                warn!(
                    encoding = %config.encoding,
                    error = %e,
                    "Tokenizer unavailable, falling back to estimation"
                );
                Self::heuristic()
            }
        }
    }

    /// Name of the active backend.
    pub fn name(&self) -> &str {
        self.backend
            .as_deref()
            .map(|b| b.name())
            .unwrap_or("heuristic")
    }

    /// Deterministic token count. Never fails.
    pub fn count(&self, text: &str) -> usize {
        if text.is_empty() {
            return 0;
        }
        match &self.backend {
            Some(backend) => match backend.encode(text) {
                Ok(ids) => ids.len(),
                Err(e) => {
                    warn!(
                        tokenizer = backend.name(),
                        error = %e,
                        "Token count failed, using estimate"
                    );
                    estimate_tokens(text)
                }
            },
            None => estimate_tokens(text),
        }
    }

    /// Cut `text` to at most `max_tokens` tokens without splitting a token.
    ///
    /// Whole segments are kept first; the first segment that does not fit
    /// contributes its longest token prefix that decodes cleanly.
    pub fn truncate(&self, text: &str, max_tokens: usize) -> String {
        if max_tokens == 0 {
            return String::new();
        }
        if self.count(text) <= max_tokens {
            return text.to_string();
        }

        let pieces = pieces(text);
        let mut kept_end = 0;
        let mut used = 0;
        let mut tail = String::new();

        for (start, end) in &pieces {
            let piece = &text[*start..*end];
            let cost = self.count(piece);
            if used + cost <= max_tokens {
                used += cost;
                kept_end = *end;
                continue;
            }
            tail = self.token_prefix(piece, max_tokens - used);
            break;
        }

        let mut result = String::with_capacity(kept_end + tail.len());
        result.push_str(&text[..kept_end]);
        result.push_str(&tail);

        // Adjacent pieces can merge into fewer tokens but rarely more;
        // trim until the real count agrees, the tail first, then whole pieces.
        let mut boundaries: Vec<usize> = pieces
            .iter()
            .map(|(_, end)| *end)
            .filter(|end| *end < result.len())
            .collect();
        while self.count(&result) > max_tokens {
            match boundaries.pop() {
                Some(end) => result.truncate(end),
                None => {
                    result.clear();
                    break;
                }
            }
        }

        result
    }

    /// Lazily split `text` into windows of about `size` tokens sharing about
    /// `overlap` tokens with their predecessor.
    pub fn chunk<'a>(&self, text: &'a str, size: usize, overlap: usize) -> Result<TextChunks<'a>> {
        if size == 0 {
            return Err(AppError::Validation {
                message: "chunk size must be positive".to_string(),
                field: Some("size".to_string()),
            });
        }
        if overlap >= size {
            return Err(AppError::Validation {
                message: format!("overlap {} must be smaller than chunk size {}", overlap, size),
                field: Some("overlap".to_string()),
            });
        }

        let mut spans = Vec::new();
        for (start, end) in pieces(text) {
            let piece = &text[start..end];
            let cost = self.count(piece);
            if cost <= size {
                spans.push((start, end, cost));
                continue;
            }
            // A single run longer than the window: fall back to graphemes
            for (offset, grapheme) in piece.grapheme_indices(true) {
                let g_start = start + offset;
                spans.push((g_start, g_start + grapheme.len(), self.count(grapheme)));
            }
        }

        Ok(TextChunks::new(text, spans, size, overlap, self.clone()))
    }

    /// Longest prefix of `piece` spanning at most `budget` tokens that ends
    /// on a token boundary.
    fn token_prefix(&self, piece: &str, budget: usize) -> String {
        if budget == 0 {
            return String::new();
        }
        if let Some(backend) = &self.backend {
            if let Ok(ids) = backend.encode(piece) {
                let mut take = budget.min(ids.len());
                while take > 0 {
                    // A prefix ending inside a multi-byte char fails to decode
                    if let Ok(decoded) = backend.decode(&ids[..take]) {
                        if piece.starts_with(&decoded) {
                            return decoded;
                        }
                    }
                    take -= 1;
                }
                return String::new();
            }
        }

        let mut end = 0;
        for (offset, grapheme) in piece.grapheme_indices(true) {
            let candidate = offset + grapheme.len();
            if estimate_tokens(&piece[..candidate]) > budget {
                break;
            }
            end = candidate;
        }
        piece[..end].to_string()
    }
}

/// Split text into byte spans of `leading whitespace + word`, the unit BPE
/// pre-tokenizers also split on. Trailing whitespace forms its own span.
/// Spans are contiguous and cover the whole input.
fn pieces(text: &str) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut pending: Option<usize> = None;

    for (start, segment) in text.split_word_bound_indices() {
        let end = start + segment.len();
        if segment.chars().all(char::is_whitespace) {
            pending.get_or_insert(start);
            continue;
        }
        let span_start = pending.take().unwrap_or(start);
        spans.push((span_start, end));
    }
    if let Some(start) = pending {
        spans.push((start, text.len()));
    }

    spans
}
