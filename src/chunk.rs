//! Line-bounded text chunker.
//!
//! Splits file content into fixed-size segments that never break mid-line,
//! with a configurable overlap of trailing lines carried into the next
//! chunk. Chunk indices are contiguous from 0 and line ranges are 1-based
//! inclusive.

use crate::models::Chunk;

/// Approximate chars-per-token ratio used for sizing estimates.
const CHARS_PER_TOKEN: usize = 4;

/// Estimated token count for a piece of text.
pub fn approx_token_count(text: &str) -> usize {
    text.len().div_ceil(CHARS_PER_TOKEN)
}

/// Split content into line-aligned chunks of at most `max_tokens` estimated
/// tokens, overlapping `overlap_lines` lines between consecutive chunks.
///
/// A single line longer than the limit is emitted as its own oversized
/// chunk rather than split mid-line; the embedding batcher handles those as
/// forced singleton batches. Empty or whitespace-only content yields no
/// chunks.
pub fn chunk_lines(content: &str, max_tokens: usize, overlap_lines: usize) -> Vec<Chunk> {
    let max_chars = max_tokens * CHARS_PER_TOKEN;

    if content.trim().is_empty() {
        return Vec::new();
    }

    let lines: Vec<&str> = content.lines().collect();
    let mut chunks = Vec::new();
    let mut buf: Vec<(usize, &str)> = Vec::new();
    let mut buf_chars = 0usize;
    let mut index = 0usize;

    let mut flush = |buf: &mut Vec<(usize, &str)>, buf_chars: &mut usize, index: &mut usize| {
        if buf.is_empty() {
            return;
        }
        let start_line = buf.first().map(|(n, _)| *n).unwrap_or(1);
        let end_line = buf.last().map(|(n, _)| *n).unwrap_or(start_line);
        let text = buf
            .iter()
            .map(|(_, l)| *l)
            .collect::<Vec<_>>()
            .join("\n");
        chunks.push(Chunk {
            index: *index,
            text,
            start_line,
            end_line,
        });
        *index += 1;

        // Seed the next chunk with the trailing overlap, but never with the
        // whole buffer (forward progress requires at least one fresh line).
        let keep = overlap_lines.min(buf.len().saturating_sub(1));
        let tail: Vec<(usize, &str)> = buf[buf.len() - keep..].to_vec();
        *buf = tail;
        *buf_chars = buf.iter().map(|(_, l)| l.len() + 1).sum();
    };

    for (i, &line) in lines.iter().enumerate() {
        let line_no = i + 1;
        let line_chars = line.len() + 1;

        if buf_chars + line_chars > max_chars && !buf.is_empty() {
            flush(&mut buf, &mut buf_chars, &mut index);
            // Retained overlap plus an oversized line can still exceed the
            // budget; drop the overlap rather than loop forever.
            if buf_chars + line_chars > max_chars {
                buf.clear();
                buf_chars = 0;
            }
        }

        buf.push((line_no, line));
        buf_chars += line_chars;
    }

    flush(&mut buf, &mut buf_chars, &mut index);

    chunks
}
