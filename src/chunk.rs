//! Word-window text chunker.
//!
//! Long narratives are split into fixed-size word windows with a fixed
//! overlap between consecutive windows, so every window fits the embedding
//! model's input budget while keeping context across the seams. Windows
//! advance by (window − overlap) words; concatenating each chunk's
//! non-overlap region, in order, reconstructs the original word sequence.

/// Rough words-per-token ratio used to convert token budgets into word counts.
const WORDS_PER_TOKEN: f64 = 0.75;

/// Narratives at or below this word count stay as a single chunk. Sized
/// conservatively under the embedding model's 512-token input window.
pub const SINGLE_CHUNK_WORD_LIMIT: usize = 350;

/// Whether a narrative is long enough to need windowed chunking.
pub fn needs_chunking(text: &str) -> bool {
    text.split_whitespace().count() > SINGLE_CHUNK_WORD_LIMIT
}

/// Split text into overlapping word windows.
///
/// `chunk_size` and `chunk_overlap` are token budgets; both are converted
/// to word counts at [`WORDS_PER_TOKEN`]. The overlap is clamped below the
/// window so the stride stays positive and the loop always terminates,
/// even for degenerate configurations where overlap >= window.
pub fn chunk_words(text: &str, chunk_size: usize, chunk_overlap: usize) -> Vec<String> {
    let words: Vec<&str> = text.split_whitespace().collect();
    if words.is_empty() {
        return vec![String::new()];
    }

    let window = ((chunk_size as f64 * WORDS_PER_TOKEN) as usize).max(1);
    let mut overlap = (chunk_overlap as f64 * WORDS_PER_TOKEN) as usize;
    if overlap >= window {
        overlap = window - 1;
    }

    let mut chunks = Vec::new();
    let mut start = 0usize;
    while start < words.len() {
        let end = (start + window).min(words.len());
        chunks.push(words[start..end].join(" "));
        if end == words.len() {
            break;
        }
        start = end - overlap;
    }

    chunks
}
