//! Splits documents into overlapping chunks for embedding.
//!
//! Sizes are counted in characters, never bytes, so multi-byte scripts are
//! never cut inside a code point. A chunk ends at the last whitespace in the
//! second half of its window when there is one, otherwise at the hard limit.
//! Consecutive chunks share up to `overlap_chars` characters and together
//! cover the whole input.

use crate::config::ChunkingConfig;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextChunk {
    pub index: u32,
    pub text: String,
    /// Character offset of the first character
    pub start: usize,
    /// Character offset one past the last character
    pub end: usize,
}

#[derive(Debug, Clone)]
pub struct TextChunker {
    target_chars: usize,
    overlap_chars: usize,
}

impl TextChunker {
    pub fn new(target_chars: usize, overlap_chars: usize) -> Self {
        let target_chars = target_chars.max(1);
        Self {
            target_chars,
            overlap_chars: overlap_chars.min(target_chars - 1),
        }
    }

    pub fn from_config(config: &ChunkingConfig) -> Self {
        Self::new(config.target_chars, config.overlap_chars)
    }

    /// Chunks of `text`; empty when the text is blank
    pub fn split(&self, text: &str) -> Vec<TextChunk> {
        if text.trim().is_empty() {
            return Vec::new();
        }

        // Byte offset of every character, plus the end of the string
        let mut offsets: Vec<usize> = text.char_indices().map(|(idx, _)| idx).collect();
        let total = offsets.len();
        offsets.push(text.len());
        let chars: Vec<char> = text.chars().collect();

        let mut chunks = Vec::new();
        let mut start = 0;
        loop {
            let mut end = (start + self.target_chars).min(total);
            if end < total {
                end = self.break_point(&chars, start, end);
            }

            chunks.push(TextChunk {
                index: chunks.len() as u32,
                text: text[offsets[start]..offsets[end]].to_string(),
                start,
                end,
            });

            if end >= total {
                break;
            }
            let next = end.saturating_sub(self.overlap_chars);
            start = if next > start { next } else { end };
        }
        chunks
    }

    /// Position just after the last whitespace in the back half of the window
    fn break_point(&self, chars: &[char], start: usize, hard_end: usize) -> usize {
        let floor = start + (hard_end - start) / 2;
        (floor + 1..=hard_end)
            .rev()
            .find(|&pos| chars[pos - 1].is_whitespace())
            .unwrap_or(hard_end)
    }
}

impl Default for TextChunker {
    fn default() -> Self {
        Self::from_config(&ChunkingConfig::default())
    }
}
