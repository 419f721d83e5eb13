//! Overlapping token windows over a borrowed text.

use super::TextTokenizer;

/// One window of the source text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextChunk<'a> {
    pub index: usize,
    pub text: &'a str,
    /// Byte offset of the first byte in the source text
    pub start: usize,
    /// Byte offset one past the last byte in the source text
    pub end: usize,
    pub token_count: usize,
}

/// Lazy iterator of [`TextChunk`]s.
///
/// Clone before consuming, or call [`TextChunks::rewind`], to iterate again.
#[derive(Clone)]
pub struct TextChunks<'a> {
    text: &'a str,
    /// (byte start, byte end, token cost), contiguous and in order
    spans: Vec<(usize, usize, usize)>,
    size: usize,
    overlap: usize,
    cursor: usize,
    index: usize,
    done: bool,
    tokenizer: TextTokenizer,
}

impl<'a> TextChunks<'a> {
    pub(super) fn new(
        text: &'a str,
        spans: Vec<(usize, usize, usize)>,
        size: usize,
        overlap: usize,
        tokenizer: TextTokenizer,
    ) -> Self {
        let done = spans.is_empty();
        Self {
            text,
            spans,
            size,
            overlap,
            cursor: 0,
            index: 0,
            done,
            tokenizer,
        }
    }

    /// Restart from the first window.
    pub fn rewind(&mut self) {
        self.cursor = 0;
        self.index = 0;
        self.done = self.spans.is_empty();
    }
}

impl<'a> Iterator for TextChunks<'a> {
    type Item = TextChunk<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let first = self.cursor;
        let mut last = first;
        let mut used = 0;
        // Always take at least one span so a window can never be empty
        while last < self.spans.len() && (last == first || used + self.spans[last].2 <= self.size) {
            used += self.spans[last].2;
            last += 1;
        }

        let start = self.spans[first].0;
        let end = self.spans[last - 1].1;
        let text = &self.text[start..end];

        if last == self.spans.len() {
            self.done = true;
        } else {
            // Step back over trailing spans worth at most `overlap` tokens,
            // but never to or before the current window start.
            let mut next = last;
            let mut shared = 0;
            while next > first + 1 && shared + self.spans[next - 1].2 <= self.overlap {
                shared += self.spans[next - 1].2;
                next -= 1;
            }
            self.cursor = next;
        }

        let chunk = TextChunk {
            index: self.index,
            text,
            start,
            end,
            token_count: self.tokenizer.count(text),
        };
        self.index += 1;
        Some(chunk)
    }
}

/// Rebuild the source text from consecutive chunks, dropping overlaps.
pub fn reassemble(chunks: &[TextChunk<'_>]) -> String {
    let mut out = String::new();
    let mut covered = 0;
    for chunk in chunks {
        if chunk.end <= covered {
            continue;
        }
        let skip = covered.saturating_sub(chunk.start);
        out.push_str(&chunk.text[skip..]);
        covered = chunk.end;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::super::{TextTokenizer, TiktokenTokenizer};
    use super::*;
    use std::sync::Arc;

    fn bpe() -> TextTokenizer {
        TextTokenizer::new(Arc::new(TiktokenTokenizer::new("cl100k_base").unwrap()))
    }

    fn sample() -> String {
        let mut text = String::new();
        for i in 0..40 {
            text.push_str(&format!(
                "Paragraph {} explains how the café’s naïve résumé parser \
                 handles emoji 🚀👩‍👩‍👧 and CJK 文字.\n\n",
                i
            ));
        }
        text
    }

    #[test]
    fn test_chunks_reassemble_exactly() {
        let tokenizer = bpe();
        let text = sample();
        let chunks: Vec<_> = tokenizer.chunk(&text, 40, 8).unwrap().collect();
        assert!(chunks.len() > 1);
        assert_eq!(reassemble(&chunks), text);
    }

    #[test]
    fn test_consecutive_chunks_overlap() {
        let tokenizer = bpe();
        let text = "one two three four five six seven eight nine ten ".repeat(20);
        let chunks: Vec<_> = tokenizer.chunk(&text, 30, 6).unwrap().collect();
        for pair in chunks.windows(2) {
            assert!(pair[1].start < pair[0].end, "windows should share text");
            assert!(pair[1].start > pair[0].start, "windows must advance");
        }
    }

    #[test]
    fn test_chunks_respect_size_on_plain_text() {
        let tokenizer = bpe();
        let text = "Retrieval finds passages and the assembler packs them. ".repeat(50);
        for chunk in tokenizer.chunk(&text, 32, 4).unwrap() {
            let tokens = chunk.token_count;
            assert!(tokens <= 32, "chunk {} has {} tokens", chunk.index, tokens);
        }
    }

    #[test]
    fn test_short_text_is_single_chunk() {
        let tokenizer = bpe();
        let text = "  A short note.  ";
        let chunks: Vec<_> = tokenizer.chunk(text, 384, 64).unwrap().collect();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, text);
    }

    #[test]
    fn test_empty_text_yields_nothing() {
        let tokenizer = bpe();
        assert_eq!(tokenizer.chunk("", 10, 2).unwrap().count(), 0);
    }

    #[test]
    fn test_oversized_run_is_split() {
        let tokenizer = bpe();
        let text = "x".repeat(2000);
        let chunks: Vec<_> = tokenizer.chunk(&text, 16, 2).unwrap().collect();
        assert!(chunks.len() > 1);
        assert_eq!(reassemble(&chunks), text);
    }

    #[test]
    fn test_iteration_is_restartable() {
        let tokenizer = bpe();
        let text = sample();
        let chunks = tokenizer.chunk(&text, 50, 10).unwrap();
        let first: Vec<_> = chunks.clone().collect();
        let mut again = chunks;
        let _ = again.by_ref().take(2).count();
        again.rewind();
        let second: Vec<_> = again.collect();
        assert_eq!(first, second);
    }

    #[test]
    fn test_rejects_bad_parameters() {
        let tokenizer = TextTokenizer::heuristic();
        assert!(tokenizer.chunk("text", 0, 0).is_err());
        assert!(tokenizer.chunk("text", 10, 10).is_err());
    }

    #[test]
    fn test_heuristic_mode_chunks() {
        let tokenizer = TextTokenizer::heuristic();
        let text = "heuristic chunking still reconstructs ".repeat(30);
        let chunks: Vec<_> = tokenizer.chunk(&text, 20, 5).unwrap().collect();
        assert_eq!(reassemble(&chunks), text);
    }
}
