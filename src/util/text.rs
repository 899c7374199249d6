//! Small text helpers shared by tools and renderers.

/// Truncate to at most `max_bytes` without splitting a codepoint.
pub fn truncate_utf8(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }

    let mut cutoff = max_bytes;
    while cutoff > 0 && !s.is_char_boundary(cutoff) {
        cutoff -= 1;
    }
    s[..cutoff].to_string()
}

/// Split text into chunks of at most `max_chars` characters.
pub fn chunk_chars(s: &str, max_chars: usize) -> Vec<String> {
    if max_chars == 0 || s.is_empty() {
        return if s.is_empty() { Vec::new() } else { vec![s.to_string()] };
    }
    s.chars()
        .collect::<Vec<_>>()
        .chunks(max_chars)
        .map(|c| c.iter().collect())
        .collect()
}
