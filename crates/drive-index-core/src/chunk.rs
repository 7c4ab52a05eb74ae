//! Paragraph-boundary text chunker.
//!
//! Splits cleaned document text into ordered [`TextChunk`]s that respect a
//! `max_tokens` budget. Paragraphs (`\n\n`) are packed greedily; a paragraph
//! larger than the budget is hard-split at the last newline or space that
//! fits, falling back to a char boundary.
//!
//! The chunker is deterministic and total: the same input always yields the
//! same chunks, and every input (including empty text) yields at least one.
//!
//! ```rust
//! use drive_index_core::chunk::chunk_text;
//!
//! let chunks = chunk_text("Hello world.\n\nSecond paragraph.", 256);
//! assert_eq!(chunks.len(), 1);
//! assert_eq!(chunks[0].chunk_index, 0);
//! ```

/// Approximate characters-per-token ratio.
const CHARS_PER_TOKEN: usize = 4;

/// One slice of a document's text and its position in the document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextChunk {
    pub chunk_index: i64,
    pub text: String,
}

/// Split text into chunks on paragraph boundaries.
///
/// # Guarantees
///
/// - At least one chunk is returned (empty text yields one empty chunk).
/// - Indices are contiguous: `0, 1, …, N-1`, in document order.
/// - No chunk exceeds `max_tokens × 4` bytes unless a single character does.
pub fn chunk_text(text: &str, max_tokens: usize) -> Vec<TextChunk> {
    let max_chars = (max_tokens * CHARS_PER_TOKEN).max(1);
    let mut pieces: Vec<String> = Vec::new();
    let mut buf = String::new();

    for para in text.split("\n\n").map(str::trim).filter(|p| !p.is_empty()) {
        let would_be = if buf.is_empty() {
            para.len()
        } else {
            buf.len() + 2 + para.len()
        };
        if would_be > max_chars && !buf.is_empty() {
            pieces.push(std::mem::take(&mut buf));
        }

        if para.len() > max_chars {
            pieces.extend(hard_split(para, max_chars));
            continue;
        }

        if !buf.is_empty() {
            buf.push_str("\n\n");
        }
        buf.push_str(para);
    }
    if !buf.is_empty() {
        pieces.push(buf);
    }
    if pieces.is_empty() {
        pieces.push(text.trim().to_string());
    }

    pieces
        .into_iter()
        .enumerate()
        .map(|(i, text)| TextChunk {
            chunk_index: i as i64,
            text,
        })
        .collect()
}

/// Split an oversized paragraph into pieces of at most `max_chars` bytes.
fn hard_split(para: &str, max_chars: usize) -> Vec<String> {
    let mut out = Vec::new();
    let mut remaining = para;

    while !remaining.is_empty() {
        let limit = snap_to_char_boundary(remaining, max_chars);
        let cut = if limit >= remaining.len() {
            remaining.len()
        } else {
            remaining[..limit]
                .rfind('\n')
                .or_else(|| remaining[..limit].rfind(' '))
                .map(|pos| pos + 1)
                .unwrap_or(limit)
        };
        // A single char wider than the budget still has to make progress.
        let cut = if cut == 0 { first_char_len(remaining) } else { cut };

        let piece = remaining[..cut].trim();
        if !piece.is_empty() {
            out.push(piece.to_string());
        }
        remaining = &remaining[cut..];
    }
    out
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

fn first_char_len(s: &str) -> usize {
    s.chars().next().map(char::len_utf8).unwrap_or(s.len())
}
