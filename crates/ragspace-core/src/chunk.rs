//! Paragraph-boundary text chunker.
//!
//! A chunk is a contiguous byte range of the document, so
//! `&content[start..end]` always reproduces its text. Ids come from the
//! document id and position; the text hash keys the extraction cache.
//!
//! # Algorithm
//!
//! Paragraphs (separated by blank lines) are trimmed and accumulated into
//! a span while the span stays within `max_tokens * 4` bytes. A paragraph
//! that alone exceeds the budget is cut at the last newline or space
//! before the limit. Empty content still yields one empty chunk.
//!
//! # Example
//!
//! ```rust
//! use ragspace_core::chunk::chunk_text;
//!
//! let text = "Hello world.\n\nSecond paragraph.";
//! let chunks = chunk_text("doc-123", text, 700);
//! assert_eq!(chunks.len(), 1);
//! assert_eq!(&text[chunks[0].start..chunks[0].end], chunks[0].text);
//! ```

use crate::models::{compute_chunk_id, content_hash, Chunk};

/// Approximate characters-per-token ratio.
pub const CHARS_PER_TOKEN: usize = 4;

/// Chunk `text` for `document_id`. Indices run `0..n` without gaps and
/// the output is a pure function of the inputs.
pub fn chunk_text(document_id: &str, text: &str, max_tokens: usize) -> Vec<Chunk> {
    let max_chars = max_tokens.max(1) * CHARS_PER_TOKEN;
    let mut out = ChunkSink::new(document_id, text);
    let mut span: Option<(usize, usize)> = None;

    for (para_start, para) in paragraphs(text) {
        let Some((start, end)) = trimmed_span(para_start, para) else {
            continue;
        };

        let would_be = match span {
            None => end - start,
            Some((s, _)) => end - s,
        };
        if would_be > max_chars {
            if let Some((s, e)) = span.take() {
                out.push(s, e);
            }
        }

        if end - start > max_chars {
            hard_split(text, start, end, max_chars, &mut out);
        } else {
            span = Some(match span {
                None => (start, end),
                Some((s, _)) => (s, end),
            });
        }
    }

    if let Some((s, e)) = span {
        out.push(s, e);
    }

    out.finish()
}

/// Estimated token count for `text`.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN)
}

struct ChunkSink<'a> {
    document_id: &'a str,
    text: &'a str,
    chunks: Vec<Chunk>,
}

impl<'a> ChunkSink<'a> {
    fn new(document_id: &'a str, text: &'a str) -> Self {
        Self {
            document_id,
            text,
            chunks: Vec::new(),
        }
    }

    fn push(&mut self, start: usize, end: usize) {
        let index = self.chunks.len() as i64;
        let slice = &self.text[start..end];
        self.chunks.push(Chunk {
            id: compute_chunk_id(self.document_id, index),
            document_id: self.document_id.to_string(),
            chunk_index: index,
            text: slice.to_string(),
            hash: content_hash(slice),
            start,
            end,
            tokens: estimate_tokens(slice),
        });
    }

    fn finish(mut self) -> Vec<Chunk> {
        if self.chunks.is_empty() {
            let (s, e) = trimmed_span(0, self.text).unwrap_or((0, 0));
            self.push(s, e);
        }
        self.chunks
    }
}

/// Paragraphs separated by `\n\n`, each with its byte offset.
fn paragraphs(text: &str) -> impl Iterator<Item = (usize, &str)> {
    let mut offset = 0;
    text.split("\n\n").map(move |p| {
        let start = offset;
        offset += p.len() + 2;
        (start, p)
    })
}

/// Offsets of `part` (which starts at `base`) with whitespace trimmed.
fn trimmed_span(base: usize, part: &str) -> Option<(usize, usize)> {
    let trimmed = part.trim();
    if trimmed.is_empty() {
        return None;
    }
    let lead = part.len() - part.trim_start().len();
    Some((base + lead, base + lead + trimmed.len()))
}

fn hard_split(text: &str, start: usize, end: usize, max_chars: usize, out: &mut ChunkSink<'_>) {
    let mut pos = start;
    while pos < end {
        let remaining = &text[pos..end];
        let limit = snap_to_char_boundary(remaining, remaining.len().min(max_chars));
        let mut cut = if limit < remaining.len() {
            remaining[..limit]
                .rfind(|c: char| c == '\n' || c == ' ')
                .map(|p| p + 1)
                .unwrap_or(limit)
        } else {
            limit
        };
        if cut == 0 {
            cut = remaining
                .char_indices()
                .nth(1)
                .map(|(i, _)| i)
                .unwrap_or(remaining.len());
        }
        if let Some((s, e)) = trimmed_span(pos, &remaining[..cut]) {
            out.push(s, e);
        }
        pos += cut;
    }
}

/// Snap a byte index back to the nearest valid UTF-8 char boundary.
fn snap_to_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut i = index;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_offsets(text: &str, chunks: &[Chunk]) {
        for c in chunks {
            assert_eq!(&text[c.start..c.end], c.text, "offsets of chunk {}", c.chunk_index);
        }
    }

    #[test]
    fn test_small_text_single_chunk() {
        let chunks = chunk_text("doc1", "Hello, world!", 700);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].chunk_index, 0);
        assert_eq!(chunks[0].text, "Hello, world!");
    }

    #[test]
    fn test_empty_text() {
        let chunks = chunk_text("doc1", "", 700);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].chunk_index, 0);
        assert_eq!(chunks[0].start, 0);
        assert_eq!(chunks[0].end, 0);
    }

    #[test]
    fn test_multiple_paragraphs_under_limit() {
        let text = "First paragraph.\n\nSecond paragraph.\n\nThird paragraph.";
        let chunks = chunk_text("doc1", text, 700);
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].text.contains("First paragraph."));
        assert!(chunks[0].text.contains("Third paragraph."));
        assert_offsets(text, &chunks);
    }

    #[test]
    fn test_multiple_paragraphs_exceed_limit() {
        let text = "This is paragraph one.\n\nThis is paragraph two.\n\nThis is paragraph three.";
        let chunks = chunk_text("doc1", text, 5);
        assert!(chunks.len() > 1);
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.chunk_index, i as i64);
        }
        assert_offsets(text, &chunks);
    }

    #[test]
    fn test_offsets_skip_leading_whitespace() {
        let text = "\n\n   Indented start.\n\n\n\nAfter blank lines.  ";
        let chunks = chunk_text("doc1", text, 5);
        assert_offsets(text, &chunks);
        assert_eq!(chunks[0].text, "Indented start.");
        assert_eq!(chunks.last().unwrap().text, "After blank lines.");
    }

    #[test]
    fn test_chunk_indices_contiguous() {
        let text = (0..50)
            .map(|i| format!("Paragraph number {}.", i))
            .collect::<Vec<_>>()
            .join("\n\n");
        let chunks = chunk_text("doc1", &text, 10);
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.chunk_index, i as i64, "Index mismatch at position {}", i);
        }
        assert_offsets(&text, &chunks);
    }

    #[test]
    fn test_multibyte_utf8_chars() {
        let text = "┌──────────────────┐\n│ Hello world      │\n└──────────────────┘";
        let chunks = chunk_text("doc1", text, 3);
        assert!(!chunks.is_empty());
        assert_offsets(text, &chunks);
        for c in &chunks {
            assert!(!c.text.is_empty());
        }
    }

    #[test]
    fn test_deterministic_ids() {
        let text = "Alpha\n\nBeta\n\nGamma\n\nDelta";
        let c1 = chunk_text("doc1", text, 2);
        let c2 = chunk_text("doc1", text, 2);
        assert_eq!(c1, c2);
        let other = chunk_text("doc2", text, 2);
        assert_ne!(c1[0].id, other[0].id);
        assert_eq!(c1[0].hash, other[0].hash);
    }

    #[test]
    fn test_token_estimate() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }
}
