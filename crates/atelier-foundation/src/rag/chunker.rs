//! Text chunking for judge documents.
//!
//! Documents are normalized, then split with a sliding window that prefers
//! to break at sentence boundaries so retrieval returns coherent passages.

/// Configuration for text chunking.
#[derive(Debug, Clone)]
pub struct ChunkConfig {
    /// Maximum number of characters per chunk.
    pub chunk_size: usize,
    /// Characters shared between consecutive chunks.
    pub chunk_overlap: usize,
}

impl ChunkConfig {
    pub fn new(chunk_size: usize, chunk_overlap: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            chunk_overlap: chunk_overlap.min(chunk_size.max(1) - 1),
        }
    }
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            chunk_overlap: 200,
        }
    }
}

/// Splits normalized text into overlapping, sentence-aware chunks.
pub struct TextChunker {
    config: ChunkConfig,
}

impl TextChunker {
    pub fn new(config: ChunkConfig) -> Self {
        Self { config }
    }

    pub fn with_defaults() -> Self {
        Self {
            config: ChunkConfig::default(),
        }
    }

    /// Split `text` into chunks of at most `chunk_size` characters.
    ///
    /// Whitespace runs are collapsed first. Short texts yield a single
    /// chunk; longer texts slide a window that prefers to end at the
    /// nearest sentence terminator in the second half of the window, then
    /// at whitespace, then cuts hard. The next window starts
    /// `chunk_overlap` characters before the previous end.
    pub fn chunk(&self, text: &str) -> Vec<String> {
        let normalized = normalize_whitespace(text);
        if normalized.is_empty() {
            return vec![];
        }

        let chars: Vec<char> = normalized.chars().collect();
        let len = chars.len();
        if len <= self.config.chunk_size {
            return vec![normalized];
        }

        let overlap = self.config.chunk_overlap;
        let mut chunks = Vec::new();
        let mut start = 0usize;

        loop {
            let window_end = (start + self.config.chunk_size).min(len);
            let end = if window_end == len {
                len
            } else {
                pick_break(&chars, start, window_end)
            };

            let chunk: String = chars[start..end].iter().collect();
            let chunk = chunk.trim().to_string();
            if !chunk.is_empty() {
                chunks.push(chunk);
            }

            if end >= len {
                break;
            }
            // `end` lands past the window midpoint, so `start` advances;
            // the max() guards degenerate size/overlap combinations.
            start = (end.saturating_sub(overlap)).max(start + 1);
            if start >= len.saturating_sub(overlap) {
                break;
            }
        }

        chunks
    }
}

impl Default for TextChunker {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Collapse whitespace runs to single spaces and trim the ends.
fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Choose the break position for the window `[start, window_end)`.
///
/// Prefers the last sentence terminator in the second half of the window
/// (break after it), then the last whitespace, then the hard window end.
fn pick_break(chars: &[char], start: usize, window_end: usize) -> usize {
    let half = start + (window_end - start) / 2;

    for i in (half..window_end).rev() {
        if matches!(chars[i], '.' | '!' | '?') {
            return i + 1;
        }
    }
    for i in (half..window_end).rev() {
        if chars[i].is_whitespace() {
            return i;
        }
    }
    window_end
}
