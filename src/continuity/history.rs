//! History injection for turns that cannot natively resume.

use crate::models::session::HistoryMessage;

/// Opening tag of the injected history block.
pub const HISTORY_OPEN: &str = "<conversation_history>";
/// Closing tag of the injected history block.
pub const HISTORY_CLOSE: &str = "</conversation_history>";

/// Prefix `message` with the last `limit` entries of `history`.
///
/// Each prior message is tagged with its role. With no history the message
/// is returned unchanged.
#[must_use]
pub fn inject_history(history: &[HistoryMessage], message: &str, limit: usize) -> String {
    let skip = history.len().saturating_sub(limit);
    let recent = &history[skip..];
    if recent.is_empty() {
        return message.to_owned();
    }

    let mut out = String::with_capacity(
        message.len() + recent.iter().map(|m| m.content.len() + 16).sum::<usize>() + 128,
    );
    out.push_str(HISTORY_OPEN);
    out.push('\n');
    for entry in recent {
        out.push('[');
        out.push_str(&entry.role);
        out.push_str("]: ");
        out.push_str(entry.content.trim_end());
        out.push('\n');
    }
    out.push_str(HISTORY_CLOSE);
    out.push_str("\n\nThe conversation above happened earlier in this session. Continue it.\n\n");
    out.push_str(message);
    out
}
