//! Wire protocol between the widget and the relay: the turn request body and
//! the typed frames carried one-per-`data:` line on the SSE response.

use serde::{Deserialize, Serialize};

use crate::core::message::Message;

/// Sentinel payload written after the terminal frame of every stream.
pub const DONE_SENTINEL: &str = "[DONE]";

/// Body of `POST /api/chat/widget`: the conversation id plus the full
/// message history, newest last.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnRequest {
    pub id: String,
    pub messages: Vec<Message>,
}

/// One streamed frame. Tagged on `type`; field names match the JSON the
/// widget protocol uses on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum StreamFrame {
    /// Announces the assistant message id for this turn.
    Start {
        #[serde(rename = "messageId")]
        message_id: String,
    },
    /// Incremental text for message `id`.
    TextDelta { id: String, delta: String },
    /// Terminal success marker.
    Finish,
    /// Terminal failure with a display-ready message.
    Error {
        #[serde(rename = "errorText")]
        error_text: String,
    },
}
