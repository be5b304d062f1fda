use std::collections::VecDeque;

use crate::core::message::Message;

/// One increment of assistant text, addressed to a message by id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextDelta {
    pub message_id: String,
    pub text: String,
}

impl TextDelta {
    pub fn new(message_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
            text: text.into(),
        }
    }
}

/// Applies a delta to the transcript. When the last message is an assistant
/// message with the delta's id, the text is appended to it; any other shape
/// starts a new assistant message under that id. The first delta of a turn is
/// what creates the assistant message, adopting the server's id for it.
///
/// Identity is only ever checked against the last message. A delta reusing
/// the id of an earlier, closed message starts a fresh message; history is
/// never reopened.
pub fn apply_text_delta(messages: &mut VecDeque<Message>, delta: &TextDelta) {
    match messages.back_mut() {
        Some(last) if last.is_assistant() && last.id == delta.message_id => {
            last.append_text(&delta.text);
        }
        _ => messages.push_back(Message::assistant(
            delta.message_id.clone(),
            delta.text.clone(),
        )),
    }
}
