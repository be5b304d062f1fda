//! Provider side of the relay: one streaming chat-completions request per
//! widget turn, re-framed into widget frames and pushed through the SSE
//! channel as pre-serialized payloads.

use std::sync::Arc;

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::api::frames::{StreamFrame, TurnRequest, DONE_SENTINEL};
use crate::api::{ChatMessage, ChatRequest, ChatResponse};
use crate::core::config::RelayConfig;
use crate::relay::RelayState;
use crate::utils::sse::{extract_data_payload, LineBuffer};
use crate::utils::url::construct_api_url;

/// Failure text that goes on the wire. Provider detail stays in the log.
const GENERIC_ERROR_TEXT: &str = "Oops, an error occurred!";

/// Drives one widget turn against the provider. Always terminates the SSE
/// stream with `[DONE]`, whether the turn finished or failed.
pub async fn relay_turn(
    state: Arc<RelayState>,
    turn: TurnRequest,
    tx: mpsc::UnboundedSender<String>,
) {
    let message_id = Uuid::new_v4().to_string();
    if let Err(detail) = pump_provider_stream(&state, &turn, &message_id, &tx).await {
        warn!(conversation_id = %turn.id, detail = %detail, "provider stream failed");
        send_frame(
            &tx,
            &StreamFrame::Error {
                error_text: GENERIC_ERROR_TEXT.to_string(),
            },
        );
    }
    let _ = tx.send(DONE_SENTINEL.to_string());
}

async fn pump_provider_stream(
    state: &RelayState,
    turn: &TurnRequest,
    message_id: &str,
    tx: &mpsc::UnboundedSender<String>,
) -> Result<(), String> {
    let request = ChatRequest {
        model: state.config.model.clone(),
        messages: provider_messages(&state.config, turn),
        stream: true,
    };

    let url = construct_api_url(&state.config.base_url, "chat/completions");
    let mut http_request = state
        .client
        .post(&url)
        .header("Content-Type", "application/json");
    if !state.api_key.is_empty() {
        http_request = http_request.bearer_auth(&state.api_key);
    }

    let response = http_request
        .json(&request)
        .send()
        .await
        .map_err(|e| format!("provider request failed: {e}"))?;

    if !response.status().is_success() {
        let status = response.status();
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "<no body>".to_string());
        return Err(format!(
            "provider returned {status}: {}",
            error_summary(&body)
        ));
    }

    if !send_frame(
        tx,
        &StreamFrame::Start {
            message_id: message_id.to_string(),
        },
    ) {
        return Ok(());
    }

    let mut stream = response.bytes_stream();
    let mut lines = LineBuffer::new();

    while let Some(chunk) = stream.next().await {
        if tx.is_closed() {
            debug!(conversation_id = %turn.id, "client disconnected, dropping provider stream");
            return Ok(());
        }
        let bytes = chunk.map_err(|e| format!("provider stream failed: {e}"))?;
        lines.push(&bytes);
        while let Some(line) = lines.next_line() {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    warn!(error = %e, "skipping non-utf8 provider line");
                    continue;
                }
            };
            match process_provider_line(&line, message_id, tx) {
                LineOutcome::Continue => {}
                LineOutcome::Finished => {
                    send_frame(tx, &StreamFrame::Finish);
                    return Ok(());
                }
                LineOutcome::ProviderError(detail) => return Err(detail),
            }
        }
    }

    // Some providers close the stream without a DONE marker.
    send_frame(tx, &StreamFrame::Finish);
    Ok(())
}

/// Builds the provider message list: configured system prompt first, then the
/// turn history with empty messages dropped.
fn provider_messages(config: &RelayConfig, turn: &TurnRequest) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(turn.messages.len() + 1);
    if let Some(prompt) = &config.system_prompt {
        if !prompt.trim().is_empty() {
            messages.push(ChatMessage {
                role: "system".to_string(),
                content: prompt.clone(),
            });
        }
    }
    for message in &turn.messages {
        let content = message.text();
        if content.trim().is_empty() {
            continue;
        }
        messages.push(ChatMessage {
            role: message.role.as_str().to_string(),
            content,
        });
    }
    messages
}

enum LineOutcome {
    Continue,
    Finished,
    ProviderError(String),
}

fn process_provider_line(
    line: &str,
    message_id: &str,
    tx: &mpsc::UnboundedSender<String>,
) -> LineOutcome {
    let Some(payload) = extract_data_payload(line) else {
        return LineOutcome::Continue;
    };
    if payload == DONE_SENTINEL {
        return LineOutcome::Finished;
    }

    match serde_json::from_str::<ChatResponse>(payload) {
        Ok(response) => {
            if let Some(choice) = response.choices.first() {
                if let Some(reason) = choice.finish_reason.as_deref() {
                    // Anything but "stop" usually means a truncated reply.
                    if reason != "stop" {
                        debug!(reason, "provider finished with a non-stop reason");
                    }
                }
                if let Some(content) = choice.delta.content.as_ref() {
                    if !content.is_empty() {
                        send_frame(
                            tx,
                            &StreamFrame::TextDelta {
                                id: message_id.to_string(),
                                delta: content.clone(),
                            },
                        );
                    }
                }
            }
            LineOutcome::Continue
        }
        Err(_) => {
            if payload.trim().is_empty() {
                return LineOutcome::Continue;
            }
            LineOutcome::ProviderError(format!(
                "unexpected provider payload: {}",
                error_summary(payload)
            ))
        }
    }
}

fn send_frame(tx: &mpsc::UnboundedSender<String>, frame: &StreamFrame) -> bool {
    match serde_json::to_string(frame) {
        Ok(payload) => tx.send(payload).is_ok(),
        Err(e) => {
            warn!(error = %e, "failed to serialize widget frame");
            false
        }
    }
}

/// Short summary of a provider error body: the nested error message when the
/// body is recognizable JSON, the collapsed raw text otherwise.
fn error_summary(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return "<empty>".to_string();
    }
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed) {
        if let Some(summary) = extract_error_message(&value) {
            if !summary.is_empty() {
                return summary;
            }
        }
    }
    collapse_whitespace(trimmed)
}

fn extract_error_message(value: &serde_json::Value) -> Option<String> {
    let message = match value.get("error") {
        Some(serde_json::Value::String(text)) => Some(text.clone()),
        Some(serde_json::Value::Object(map)) => map
            .get("message")
            .and_then(|m| m.as_str())
            .map(str::to_owned),
        _ => value
            .get("message")
            .and_then(|m| m.as_str())
            .map(str::to_owned),
    };
    message.map(|text| collapse_whitespace(&text))
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::message::Message;

    fn channel() -> (
        mpsc::UnboundedSender<String>,
        mpsc::UnboundedReceiver<String>,
    ) {
        mpsc::unbounded_channel()
    }

    fn test_config() -> RelayConfig {
        RelayConfig {
            system_prompt: Some("Answer as the site assistant.".to_string()),
            ..RelayConfig::default()
        }
    }

    #[test]
    fn provider_messages_prepend_the_system_prompt() {
        let turn = TurnRequest {
            id: "c1".to_string(),
            messages: vec![Message::user("What services do you offer?")],
        };
        let messages = provider_messages(&test_config(), &turn);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, "system");
        assert_eq!(messages[0].content, "Answer as the site assistant.");
        assert_eq!(messages[1].role, "user");
        assert_eq!(messages[1].content, "What services do you offer?");
    }

    #[test]
    fn provider_messages_skip_empty_history_entries() {
        let turn = TurnRequest {
            id: "c1".to_string(),
            messages: vec![
                Message::user("hello"),
                Message::assistant("a1", "   "),
                Message::user("still there?"),
            ],
        };
        let config = RelayConfig {
            system_prompt: None,
            ..RelayConfig::default()
        };
        let messages = provider_messages(&config, &turn);
        assert_eq!(messages.len(), 2);
        assert!(messages.iter().all(|m| m.role == "user"));
    }

    #[test]
    fn provider_delta_becomes_a_text_delta_frame() {
        let (tx, mut rx) = channel();
        let line = r#"data: {"choices":[{"delta":{"content":"Hello"}}]}"#;
        assert!(matches!(
            process_provider_line(line, "m1", &tx),
            LineOutcome::Continue
        ));
        let payload = rx.try_recv().expect("frame payload");
        assert_eq!(
            payload,
            r#"{"type":"text-delta","id":"m1","delta":"Hello"}"#
        );
    }

    #[test]
    fn empty_provider_fragments_emit_nothing() {
        let (tx, mut rx) = channel();
        let empty = r#"data: {"choices":[{"delta":{"content":""}}]}"#;
        let missing = r#"data: {"choices":[{"delta":{}}]}"#;
        let no_choices = r#"data: {"choices":[]}"#;
        let truncated = r#"data: {"choices":[{"delta":{},"finish_reason":"length"}]}"#;
        for line in [empty, missing, no_choices, truncated] {
            assert!(matches!(
                process_provider_line(line, "m1", &tx),
                LineOutcome::Continue
            ));
        }
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn provider_done_marker_finishes_the_turn() {
        let (tx, _rx) = channel();
        assert!(matches!(
            process_provider_line("data: [DONE]", "m1", &tx),
            LineOutcome::Finished
        ));
        assert!(matches!(
            process_provider_line("data:[DONE]", "m1", &tx),
            LineOutcome::Finished
        ));
    }

    #[test]
    fn unparseable_payload_is_a_provider_error() {
        let (tx, _rx) = channel();
        let line = r#"data: {"error":{"message":"internal   server    error"}}"#;
        match process_provider_line(line, "m1", &tx) {
            LineOutcome::ProviderError(detail) => {
                assert!(detail.contains("internal server error"));
            }
            _ => panic!("expected a provider error"),
        }
    }

    #[test]
    fn non_data_lines_are_ignored() {
        let (tx, mut rx) = channel();
        for line in ["", ": keep-alive", "event: ping"] {
            assert!(matches!(
                process_provider_line(line, "m1", &tx),
                LineOutcome::Continue
            ));
        }
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn error_summary_reads_nested_and_flat_shapes() {
        assert_eq!(
            error_summary(r#"{"error":{"message":"model overloaded"}}"#),
            "model overloaded"
        );
        assert_eq!(error_summary(r#"{"error":"quota exceeded"}"#), "quota exceeded");
        assert_eq!(error_summary(r#"{"message":"not found"}"#), "not found");
        assert_eq!(error_summary("plain\n\ttext   body"), "plain text body");
        assert_eq!(error_summary("   "), "<empty>");
    }
}
