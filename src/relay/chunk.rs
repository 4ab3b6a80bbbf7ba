//! Splitting outgoing text to fit the sink's message size limit.

/// Sink limit in characters, below Discord's hard 2000.
pub const MAX_CHUNK_CHARS: usize = 1900;

/// Chunk `text` into pieces of at most `max_chars` characters without splitting
/// codepoints. A chunk ends after the last newline inside the limit when there
/// is one, else at the limit. Concatenating the chunks yields `text` exactly.
pub fn chunk_message(text: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    let mut chunks = Vec::new();
    let mut remaining = text;
    while !remaining.is_empty() {
        // Byte offset just past the `max_chars`-th character, if there are that many.
        let limit = match remaining.char_indices().nth(max_chars) {
            Some((idx, _)) => idx,
            None => {
                chunks.push(remaining.to_string());
                break;
            }
        };
        let window = &remaining[..limit];
        let end = match window.rfind('\n') {
            Some(pos) => pos + 1,
            None => limit,
        };
        chunks.push(remaining[..end].to_string());
        remaining = &remaining[end..];
    }
    chunks
}
