//! Token estimation and history truncation for prompt assembly.

use quorum_schema::Message;

/// Approximate token count from text (chars / 4). A rough estimate; actual
/// tokenization varies by model.
pub fn estimate_tokens(text: &str) -> usize {
    text.len() / 4
}

pub fn estimate_message_tokens(msg: &Message) -> usize {
    estimate_tokens(&msg.content).max(10)
}

/// Keep the newest history messages that fit `budget_tokens`, dropping from
/// the oldest end. The current user query is never part of `history` and is
/// therefore never truncated.
pub fn truncate_history(history: &[Message], budget_tokens: usize) -> &[Message] {
    let mut kept_tokens = 0;
    let mut start = history.len();
    for (i, msg) in history.iter().enumerate().rev() {
        let msg_tokens = estimate_message_tokens(msg);
        if kept_tokens + msg_tokens > budget_tokens {
            break;
        }
        kept_tokens += msg_tokens;
        start = i;
    }
    &history[start..]
}
