//! Client-side conversation state: transcript, turn status, last error, and
//! subscriber notification. The store performs no I/O; the transport feeds it
//! and a presentation shell observes it.

use std::collections::VecDeque;

use tokio::sync::mpsc;

use crate::core::delta::{apply_text_delta, TextDelta};
use crate::core::message::Message;
use crate::core::transport::StreamError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationStatus {
    Idle,
    Submitted,
    Streaming,
    Error,
}

impl ConversationStatus {
    /// A turn is in flight; submissions are rejected and the trailing
    /// assistant message may still grow.
    pub fn is_busy(self) -> bool {
        matches!(
            self,
            ConversationStatus::Submitted | ConversationStatus::Streaming
        )
    }
}

impl Default for ConversationStatus {
    fn default() -> Self {
        ConversationStatus::Idle
    }
}

/// Result of a submission attempt. Rejections leave the store untouched.
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    /// The user message was appended; the snapshot is the full history to
    /// hand to the transport.
    Accepted(Vec<Message>),
    /// Input was empty or whitespace-only.
    RejectedEmpty,
    /// A turn is already in flight.
    RejectedBusy,
}

impl SubmitOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, SubmitOutcome::Accepted(_))
    }
}

/// Notifications delivered to subscribers in mutation order.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    UserAppended { id: String },
    AssistantDelta { message_id: String, text: String },
    StatusChanged { status: ConversationStatus },
}

#[derive(Default)]
pub struct ConversationStore {
    messages: VecDeque<Message>,
    status: ConversationStatus,
    last_error: Option<StreamError>,
    subscribers: Vec<mpsc::UnboundedSender<StoreEvent>>,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> &VecDeque<Message> {
        &self.messages
    }

    pub fn status(&self) -> ConversationStatus {
        self.status
    }

    /// The classified cause of the last failed turn. Retained until the next
    /// accepted submission.
    pub fn last_error(&self) -> Option<&StreamError> {
        self.last_error.as_ref()
    }

    /// Registers an observer. Receivers that are dropped get pruned on the
    /// next notification.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<StoreEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.push(tx);
        rx
    }

    /// Appends a user message and opens a turn. Empty input and in-flight
    /// turns are rejected silently with no state change; resubmission from
    /// the error status is the one retry path and clears the recorded error.
    pub fn submit_user_text(&mut self, text: &str) -> SubmitOutcome {
        if text.trim().is_empty() {
            return SubmitOutcome::RejectedEmpty;
        }
        if self.status.is_busy() {
            return SubmitOutcome::RejectedBusy;
        }

        let message = Message::user(text);
        let id = message.id.clone();
        self.messages.push_back(message);
        self.last_error = None;
        self.notify(StoreEvent::UserAppended { id });
        self.set_status(ConversationStatus::Submitted);

        SubmitOutcome::Accepted(self.messages.iter().cloned().collect())
    }

    /// Applies one assistant text delta. Ignored unless a turn is open, which
    /// keeps closed transcripts immutable even if a stray delta slips past
    /// the transport's stream-id guard.
    pub fn apply_delta(&mut self, delta: &TextDelta) {
        if !self.status.is_busy() {
            return;
        }
        apply_text_delta(&mut self.messages, delta);
        self.notify(StoreEvent::AssistantDelta {
            message_id: delta.message_id.clone(),
            text: delta.text.clone(),
        });
        self.set_status(ConversationStatus::Streaming);
    }

    /// Closes the open turn successfully.
    pub fn complete_stream(&mut self) {
        if self.status.is_busy() {
            self.set_status(ConversationStatus::Idle);
        }
    }

    /// Closes the open turn as failed, recording the cause. Whatever partial
    /// assistant text arrived stays in the transcript.
    pub fn fail_stream(&mut self, error: StreamError) {
        if !self.status.is_busy() {
            return;
        }
        self.last_error = Some(error);
        self.set_status(ConversationStatus::Error);
    }

    fn set_status(&mut self, status: ConversationStatus) {
        if self.status != status {
            self.status = status;
            self.notify(StoreEvent::StatusChanged { status });
        }
    }

    fn notify(&mut self, event: StoreEvent) {
        self.subscribers
            .retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }

    #[cfg(test)]
    fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(rx: &mut mpsc::UnboundedReceiver<StoreEvent>) -> Vec<StoreEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn store_mid_turn() -> ConversationStore {
        let mut store = ConversationStore::new();
        assert!(store.submit_user_text("hello").is_accepted());
        store
    }

    #[test]
    fn empty_submissions_change_nothing() {
        let mut store = ConversationStore::new();
        let mut rx = store.subscribe();

        assert_eq!(store.submit_user_text(""), SubmitOutcome::RejectedEmpty);
        assert_eq!(store.submit_user_text("   "), SubmitOutcome::RejectedEmpty);
        assert_eq!(store.submit_user_text("\n\t "), SubmitOutcome::RejectedEmpty);

        assert!(store.messages().is_empty());
        assert_eq!(store.status(), ConversationStatus::Idle);
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn accepted_submission_appends_and_opens_the_turn() {
        let mut store = ConversationStore::new();
        let mut rx = store.subscribe();

        let outcome = store.submit_user_text("hello");
        let SubmitOutcome::Accepted(snapshot) = outcome else {
            panic!("expected acceptance, got {outcome:?}");
        };

        assert_eq!(snapshot.len(), 1);
        assert!(snapshot[0].is_user());
        assert_eq!(snapshot[0].text(), "hello");
        assert_eq!(store.status(), ConversationStatus::Submitted);

        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], StoreEvent::UserAppended { .. }));
        assert_eq!(
            events[1],
            StoreEvent::StatusChanged {
                status: ConversationStatus::Submitted
            }
        );
    }

    #[test]
    fn submissions_during_a_turn_are_rejected() {
        let mut store = store_mid_turn();

        assert_eq!(store.submit_user_text("world"), SubmitOutcome::RejectedBusy);
        assert_eq!(store.messages().len(), 1);
        assert_eq!(store.messages()[0].text(), "hello");

        store.apply_delta(&TextDelta::new("a1", "Hi"));
        assert_eq!(store.status(), ConversationStatus::Streaming);
        assert_eq!(store.submit_user_text("again"), SubmitOutcome::RejectedBusy);

        let user_count = store.messages().iter().filter(|m| m.is_user()).count();
        assert_eq!(user_count, 1);
    }

    #[test]
    fn snapshot_is_detached_from_later_mutation() {
        let mut store = ConversationStore::new();
        let SubmitOutcome::Accepted(snapshot) = store.submit_user_text("hello") else {
            panic!("expected acceptance");
        };

        store.apply_delta(&TextDelta::new("a1", "Hi"));
        assert_eq!(snapshot.len(), 1);
    }

    #[test]
    fn deltas_accumulate_and_move_the_turn_to_streaming() {
        let mut store = store_mid_turn();

        for text in ["Hel", "lo", " there"] {
            store.apply_delta(&TextDelta::new("a1", text));
        }

        assert_eq!(store.status(), ConversationStatus::Streaming);
        assert_eq!(store.messages().len(), 2);
        let reply = store.messages().back().unwrap();
        assert!(reply.is_assistant());
        assert_eq!(reply.id, "a1");
        assert_eq!(reply.text(), "Hello there");
    }

    #[test]
    fn deltas_outside_an_open_turn_are_ignored() {
        let mut store = ConversationStore::new();
        store.apply_delta(&TextDelta::new("a1", "stray"));
        assert!(store.messages().is_empty());
        assert_eq!(store.status(), ConversationStatus::Idle);

        let mut failed = store_mid_turn();
        failed.fail_stream(StreamError::Network {
            detail: "connection reset".into(),
        });
        failed.apply_delta(&TextDelta::new("a1", "late"));
        assert_eq!(failed.messages().len(), 1);
        assert_eq!(failed.status(), ConversationStatus::Error);
    }

    #[test]
    fn completion_returns_the_store_to_idle() {
        let mut store = store_mid_turn();
        store.apply_delta(&TextDelta::new("a1", "All done."));
        store.complete_stream();

        assert_eq!(store.status(), ConversationStatus::Idle);
        assert_eq!(store.messages().back().unwrap().text(), "All done.");
    }

    #[test]
    fn completion_without_an_open_turn_is_a_no_op() {
        let mut store = ConversationStore::new();
        let mut rx = store.subscribe();
        store.complete_stream();
        assert_eq!(store.status(), ConversationStatus::Idle);
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn failure_preserves_partial_output_and_records_the_cause() {
        let mut store = store_mid_turn();
        store.apply_delta(&TextDelta::new("a1", "Hel"));
        store.fail_stream(StreamError::HttpStatus {
            status: 502,
            body: "bad gateway".into(),
        });

        assert_eq!(store.status(), ConversationStatus::Error);
        assert_eq!(store.messages().back().unwrap().text(), "Hel");
        assert_eq!(
            store.last_error().map(StreamError::class),
            Some("http-status:502".to_string())
        );
    }

    #[test]
    fn resubmission_after_an_error_reopens_the_conversation() {
        let mut store = store_mid_turn();
        store.fail_stream(StreamError::Network {
            detail: "offline".into(),
        });

        let outcome = store.submit_user_text("try again");
        assert!(outcome.is_accepted());
        assert_eq!(store.status(), ConversationStatus::Submitted);
        assert!(store.last_error().is_none());

        let SubmitOutcome::Accepted(snapshot) = outcome else {
            unreachable!();
        };
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[1].text(), "try again");
    }

    #[test]
    fn subscribers_see_events_in_mutation_order() {
        let mut store = ConversationStore::new();
        let mut rx = store.subscribe();

        store.submit_user_text("hello");
        store.apply_delta(&TextDelta::new("a1", "Hi"));
        store.apply_delta(&TextDelta::new("a1", " there"));
        store.complete_stream();

        let events = drain(&mut rx);
        let expected_tail = [
            StoreEvent::AssistantDelta {
                message_id: "a1".into(),
                text: "Hi".into(),
            },
            StoreEvent::StatusChanged {
                status: ConversationStatus::Streaming,
            },
            StoreEvent::AssistantDelta {
                message_id: "a1".into(),
                text: " there".into(),
            },
            StoreEvent::StatusChanged {
                status: ConversationStatus::Idle,
            },
        ];
        assert_eq!(&events[2..], &expected_tail);
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let mut store = ConversationStore::new();
        let rx = store.subscribe();
        let mut live = store.subscribe();
        assert_eq!(store.subscriber_count(), 2);

        drop(rx);
        store.submit_user_text("hello");

        assert_eq!(store.subscriber_count(), 1);
        assert!(!drain(&mut live).is_empty());
    }
}
