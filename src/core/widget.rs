//! One configurable widget session: a conversation store, a streaming
//! transport, and the glue between them. Any presentation shell drives this
//! by submitting text and pumping events; rendering happens off store
//! subscriptions. Different pages get different behavior through
//! [`WidgetConfig`] alone.

use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use crate::core::config::WidgetConfig;
use crate::core::store::{ConversationStore, StoreEvent, SubmitOutcome};
use crate::core::transport::{ChatTransport, SendParams, TransportEvent};

pub struct ChatWidget {
    config: WidgetConfig,
    conversation_id: String,
    client: reqwest::Client,
    store: ConversationStore,
    transport: ChatTransport,
    events: mpsc::UnboundedReceiver<(TransportEvent, u64)>,
    current_stream_id: Option<u64>,
}

impl ChatWidget {
    pub fn new(config: WidgetConfig) -> Self {
        let (transport, events) = ChatTransport::new();
        Self {
            config,
            conversation_id: Uuid::new_v4().to_string(),
            client: reqwest::Client::new(),
            store: ConversationStore::new(),
            transport,
            events,
            current_stream_id: None,
        }
    }

    pub fn config(&self) -> &WidgetConfig {
        &self.config
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn store(&self) -> &ConversationStore {
        &self.store
    }

    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<StoreEvent> {
        self.store.subscribe()
    }

    /// Submits user text. When the store accepts it, the full history goes
    /// to the transport and the new stream becomes the current one.
    pub fn submit_text(&mut self, text: &str) -> SubmitOutcome {
        let outcome = self.store.submit_user_text(text);
        if let SubmitOutcome::Accepted(messages) = &outcome {
            let stream_id = self.transport.send(SendParams {
                client: self.client.clone(),
                endpoint: self.config.endpoint.clone(),
                conversation_id: self.conversation_id.clone(),
                messages: messages.clone(),
            });
            self.current_stream_id = Some(stream_id);
        }
        outcome
    }

    /// Submits the configured quick action's label as the user message.
    /// An out-of-range index submits nothing.
    pub fn quick_action(&mut self, index: usize) -> SubmitOutcome {
        let Some(label) = self
            .config
            .quick_actions
            .get(index)
            .map(|action| action.label.clone())
        else {
            return SubmitOutcome::RejectedEmpty;
        };
        self.submit_text(&label)
    }

    /// Awaits the next event of the current stream and applies it to the
    /// store. Events tagged with a superseded stream id are discarded.
    pub async fn pump_event(&mut self) {
        while let Some((event, stream_id)) = self.events.recv().await {
            if self.current_stream_id != Some(stream_id) {
                debug!(stream_id, "discarding event from superseded stream");
                continue;
            }
            self.apply(event);
            return;
        }
    }

    fn apply(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Opened => debug!("stream opened"),
            TransportEvent::Delta(delta) => self.store.apply_delta(&delta),
            TransportEvent::Completed => {
                self.store.complete_stream();
                self.current_stream_id = None;
            }
            TransportEvent::Failed(error) => {
                self.store.fail_stream(error);
                self.current_stream_id = None;
            }
        }
    }

    /// Marks a turn open without touching the network, so tests can inject
    /// transport events directly.
    #[cfg(test)]
    fn open_turn_for_test(&mut self, text: &str, stream_id: u64) {
        assert!(self.store.submit_user_text(text).is_accepted());
        self.current_stream_id = Some(stream_id);
    }
}
