//! Sliding-window text chunker.
//!
//! Splits extracted contract text into fixed-size character windows with a
//! configurable overlap, so clause boundaries that straddle a window edge
//! still appear whole in at least one chunk.
//!
//! Each chunk carries a contiguous index starting at 0 and a SHA-256 hash of
//! its text for staleness detection.

use sha2::{Digest, Sha256};

use crate::models::Chunk;

/// Split text into overlapping windows of `chunk_size` characters, stepping
/// `chunk_size - overlap` characters each time. Whitespace-only input yields
/// no chunks. `overlap` must be smaller than `chunk_size` (validated at
/// config load).
pub fn chunk_text(file_id: &str, text: &str, chunk_size: usize, overlap: usize) -> Vec<Chunk> {
    if text.trim().is_empty() {
        return Vec::new();
    }

    let chars: Vec<char> = text.chars().collect();
    let step = chunk_size.saturating_sub(overlap).max(1);

    let mut chunks = Vec::new();
    let mut chunk_index: i64 = 0;
    let mut start = 0usize;

    while start < chars.len() {
        let end = (start + chunk_size).min(chars.len());
        let window: String = chars[start..end].iter().collect();
        let trimmed = window.trim();
        if !trimmed.is_empty() {
            chunks.push(make_chunk(file_id, chunk_index, trimmed));
            chunk_index += 1;
        }
        if end == chars.len() {
            break;
        }
        start += step;
    }

    chunks
}

fn make_chunk(file_id: &str, index: i64, text: &str) -> Chunk {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let hash = format!("{:x}", hasher.finalize());

    Chunk {
        file_id: file_id.to_string(),
        chunk_index: index,
        text: text.to_string(),
        hash,
    }
}
