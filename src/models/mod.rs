//! Domain model module declarations.

pub mod subagent;

/// Truncate `text` to at most `max_chars` characters, appending `…` when cut.
pub(crate) fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => format!("{}…", &text[..byte_idx]),
        None => text.to_owned(),
    }
}
