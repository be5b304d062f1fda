//! Streaming transport between the conversation store and the relay: POSTs a
//! turn, decodes the SSE response into events, and feeds them to the consumer
//! tagged with a per-request stream id so superseded streams can be dropped.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use futures_util::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::api::frames::{StreamFrame, TurnRequest, DONE_SENTINEL};
use crate::core::delta::TextDelta;
use crate::core::message::Message;
use crate::utils::sse::{extract_data_payload, LineBuffer};

/// Classified cause of a failed stream. The class string is the stable
/// vocabulary the store records and tests assert on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    /// Request could not be established, was aborted mid-flight, or the
    /// connection closed before a terminal frame.
    Network { detail: String },
    /// Non-2xx response; the body is kept as detail.
    HttpStatus { status: u16, body: String },
    /// A frame that was not valid UTF-8 or not a recognized shape.
    Decode { detail: String },
    /// The relay forwarded an explicit error frame.
    Provider { message: String },
}

impl StreamError {
    pub fn class(&self) -> String {
        match self {
            StreamError::Network { .. } => "network".to_string(),
            StreamError::HttpStatus { status, .. } => format!("http-status:{status}"),
            StreamError::Decode { .. } => "decode-error".to_string(),
            StreamError::Provider { .. } => "provider-error".to_string(),
        }
    }
}

impl fmt::Display for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamError::Network { detail } => write!(f, "network: {detail}"),
            StreamError::HttpStatus { status, body } => {
                if body.trim().is_empty() {
                    write!(f, "http-status:{status}")
                } else {
                    write!(f, "http-status:{status}: {}", body.trim())
                }
            }
            StreamError::Decode { detail } => write!(f, "decode-error: {detail}"),
            StreamError::Provider { message } => write!(f, "provider-error: {message}"),
        }
    }
}

impl std::error::Error for StreamError {}

/// Events pumped to the consumer, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// First body byte seen; the stream is live.
    Opened,
    Delta(TextDelta),
    Completed,
    Failed(StreamError),
}

/// Lifecycle of the current request, observable through [`ChatTransport::watch_phase`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPhase {
    Idle,
    Connecting,
    Streaming,
    Completed,
    Failed,
}

pub struct SendParams {
    pub client: reqwest::Client,
    pub endpoint: String,
    pub conversation_id: String,
    pub messages: Vec<Message>,
}

/// Cancellation token of the stream currently allowed to publish phases.
type ActiveStream = Arc<Mutex<Option<CancellationToken>>>;

fn lock_active(active: &ActiveStream) -> MutexGuard<'_, Option<CancellationToken>> {
    match active.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

struct StreamContext {
    tx: mpsc::UnboundedSender<(TransportEvent, u64)>,
    phase: watch::Sender<StreamPhase>,
    active: ActiveStream,
    cancel: CancellationToken,
    stream_id: u64,
}

impl StreamContext {
    fn emit(&self, event: TransportEvent) {
        let _ = self.tx.send((event, self.stream_id));
    }

    fn set_phase(&self, phase: StreamPhase) {
        // Serialized with send(), which cancels the old token and publishes
        // `Connecting` under this lock; a superseded stream therefore cannot
        // clobber the phase of its successor.
        let _active = lock_active(&self.active);
        if !self.cancel.is_cancelled() {
            self.phase.send_replace(phase);
        }
    }

    fn complete(&self) {
        self.set_phase(StreamPhase::Completed);
        self.emit(TransportEvent::Completed);
    }

    fn fail(&self, error: StreamError) {
        warn!(stream_id = self.stream_id, class = %error.class(), "stream failed");
        self.set_phase(StreamPhase::Failed);
        self.emit(TransportEvent::Failed(error));
    }
}

/// Decodes one SSE line into events. Returns `true` when the stream reached a
/// terminal state and the pump should stop reading.
fn process_frame_line(line: &str, ctx: &StreamContext) -> bool {
    let Some(payload) = extract_data_payload(line) else {
        return false;
    };

    if payload == DONE_SENTINEL {
        // A well-behaved relay sends a terminal frame first; a bare sentinel
        // still closes the stream cleanly.
        ctx.complete();
        return true;
    }

    match serde_json::from_str::<StreamFrame>(payload) {
        Ok(StreamFrame::Start { message_id }) => {
            debug!(stream_id = ctx.stream_id, %message_id, "assistant message announced");
            false
        }
        Ok(StreamFrame::TextDelta { id, delta }) => {
            ctx.emit(TransportEvent::Delta(TextDelta::new(id, delta)));
            false
        }
        Ok(StreamFrame::Finish) => {
            ctx.complete();
            true
        }
        Ok(StreamFrame::Error { error_text }) => {
            ctx.fail(StreamError::Provider {
                message: error_text,
            });
            true
        }
        Err(e) => {
            if payload.trim().is_empty() {
                return false;
            }
            ctx.fail(StreamError::Decode {
                detail: format!("unrecognized frame: {e}"),
            });
            true
        }
    }
}

async fn run_stream(params: SendParams, ctx: StreamContext) {
    let request = TurnRequest {
        id: params.conversation_id,
        messages: params.messages,
    };

    let response = match params
        .client
        .post(&params.endpoint)
        .header("Content-Type", "application/json")
        .json(&request)
        .send()
        .await
    {
        Ok(response) => response,
        Err(e) => {
            ctx.fail(StreamError::Network {
                detail: e.to_string(),
            });
            return;
        }
    };

    if !response.status().is_success() {
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "<no body>".to_string());
        ctx.fail(StreamError::HttpStatus { status, body });
        return;
    }

    let mut stream = response.bytes_stream();
    let mut lines = LineBuffer::new();
    let mut opened = false;

    while let Some(chunk) = stream.next().await {
        if ctx.cancel.is_cancelled() {
            return;
        }

        let chunk_bytes = match chunk {
            Ok(bytes) => bytes,
            Err(e) => {
                ctx.fail(StreamError::Network {
                    detail: e.to_string(),
                });
                return;
            }
        };

        if !opened {
            opened = true;
            ctx.set_phase(StreamPhase::Streaming);
            ctx.emit(TransportEvent::Opened);
        }

        lines.push(&chunk_bytes);
        while let Some(line) = lines.next_line() {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    ctx.fail(StreamError::Decode {
                        detail: format!("invalid utf-8 in stream: {e}"),
                    });
                    return;
                }
            };

            if process_frame_line(&line, &ctx) {
                return;
            }
        }
    }

    ctx.fail(StreamError::Network {
        detail: "connection closed before a terminal frame".to_string(),
    });
}

/// Owns the event channel and the lifecycle of the in-flight request. Issuing
/// a new `send` aborts any previous stream; its remaining events are dropped
/// by consumers via the stream id tag. The store's single-flight guard makes
/// that abort unreachable in normal use.
pub struct ChatTransport {
    tx: mpsc::UnboundedSender<(TransportEvent, u64)>,
    phase: watch::Sender<StreamPhase>,
    active: ActiveStream,
    next_stream_id: AtomicU64,
}

impl ChatTransport {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<(TransportEvent, u64)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (phase, _) = watch::channel(StreamPhase::Idle);
        (
            Self {
                tx,
                phase,
                active: Arc::new(Mutex::new(None)),
                next_stream_id: AtomicU64::new(0),
            },
            rx,
        )
    }

    /// Current phase of the most recently issued request.
    pub fn phase(&self) -> StreamPhase {
        *self.phase.borrow()
    }

    pub fn watch_phase(&self) -> watch::Receiver<StreamPhase> {
        self.phase.subscribe()
    }

    /// Starts a turn request and returns its stream id. Events for this
    /// request arrive on the receiver paired with this transport, tagged with
    /// the returned id.
    pub fn send(&self, params: SendParams) -> u64 {
        let stream_id = self.next_stream_id.fetch_add(1, Ordering::SeqCst) + 1;
        let cancel = CancellationToken::new();

        {
            let mut active = lock_active(&self.active);
            if let Some(previous) = active.replace(cancel.clone()) {
                previous.cancel();
            }
            self.phase.send_replace(StreamPhase::Connecting);
        }

        let ctx = StreamContext {
            tx: self.tx.clone(),
            phase: self.phase.clone(),
            active: self.active.clone(),
            cancel: cancel.clone(),
            stream_id,
        };
        tokio::spawn(async move {
            tokio::select! {
                _ = run_stream(params, ctx) => {}
                _ = cancel.cancelled() => {}
            }
        });

        stream_id
    }

    #[cfg(test)]
    pub fn send_for_test(&self, event: TransportEvent, stream_id: u64) {
        let _ = self.tx.send((event, stream_id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_context() -> (StreamContext, mpsc::UnboundedReceiver<(TransportEvent, u64)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (phase, _) = watch::channel(StreamPhase::Connecting);
        (
            StreamContext {
                tx,
                phase,
                active: Arc::new(Mutex::new(None)),
                cancel: CancellationToken::new(),
                stream_id: 7,
            },
            rx,
        )
    }

    #[test]
    fn error_classes_use_the_stable_vocabulary() {
        let network = StreamError::Network {
            detail: "dns failure".into(),
        };
        let status = StreamError::HttpStatus {
            status: 502,
            body: "bad gateway".into(),
        };
        let decode = StreamError::Decode {
            detail: "garbage".into(),
        };
        let provider = StreamError::Provider {
            message: "Oops, an error occurred!".into(),
        };

        assert_eq!(network.class(), "network");
        assert_eq!(status.class(), "http-status:502");
        assert_eq!(decode.class(), "decode-error");
        assert_eq!(provider.class(), "provider-error");

        assert_eq!(status.to_string(), "http-status:502: bad gateway");
        assert_eq!(
            StreamError::HttpStatus {
                status: 404,
                body: String::new(),
            }
            .to_string(),
            "http-status:404"
        );
    }

    #[test]
    fn delta_frames_route_to_the_channel() {
        let (ctx, mut rx) = test_context();
        let line = r#"data: {"type":"text-delta","id":"a1","delta":"Hel"}"#;

        assert!(!process_frame_line(line, &ctx));

        let (event, stream_id) = rx.try_recv().expect("expected delta event");
        assert_eq!(stream_id, 7);
        assert_eq!(event, TransportEvent::Delta(TextDelta::new("a1", "Hel")));
    }

    #[test]
    fn start_frames_are_informational() {
        let (ctx, mut rx) = test_context();
        let line = r#"data: {"type":"start","messageId":"a1"}"#;

        assert!(!process_frame_line(line, &ctx));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn finish_frames_end_the_stream() {
        let (ctx, mut rx) = test_context();

        assert!(process_frame_line(r#"data: {"type":"finish"}"#, &ctx));
        let (event, _) = rx.try_recv().expect("expected completion");
        assert_eq!(event, TransportEvent::Completed);
        assert_eq!(*ctx.phase.borrow(), StreamPhase::Completed);
    }

    #[test]
    fn done_sentinel_handles_spacing_variants() {
        for line in ["data: [DONE]", "data:[DONE]"] {
            let (ctx, mut rx) = test_context();
            assert!(process_frame_line(line, &ctx));
            let (event, _) = rx.try_recv().expect("expected completion");
            assert_eq!(event, TransportEvent::Completed);
        }
    }

    #[test]
    fn error_frames_classify_as_provider_errors() {
        let (ctx, mut rx) = test_context();
        let line = r#"data: {"type":"error","errorText":"Oops, an error occurred!"}"#;

        assert!(process_frame_line(line, &ctx));

        let (event, _) = rx.try_recv().expect("expected failure");
        match event {
            TransportEvent::Failed(error) => {
                assert_eq!(error.class(), "provider-error");
                assert_eq!(
                    error.to_string(),
                    "provider-error: Oops, an error occurred!"
                );
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(*ctx.phase.borrow(), StreamPhase::Failed);
    }

    #[test]
    fn malformed_frames_classify_as_decode_errors() {
        let (ctx, mut rx) = test_context();

        assert!(process_frame_line("data: {not json", &ctx));

        let (event, _) = rx.try_recv().expect("expected failure");
        match event {
            TransportEvent::Failed(error) => assert_eq!(error.class(), "decode-error"),
            other => panic!("expected decode failure, got {other:?}"),
        }
    }

    #[test]
    fn non_data_lines_are_ignored() {
        let (ctx, mut rx) = test_context();

        assert!(!process_frame_line("", &ctx));
        assert!(!process_frame_line("event: message", &ctx));
        assert!(!process_frame_line(": keep-alive", &ctx));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn superseded_streams_do_not_touch_the_phase() {
        let (ctx, _rx) = test_context();
        ctx.cancel.cancel();
        ctx.set_phase(StreamPhase::Failed);
        assert_eq!(*ctx.phase.borrow(), StreamPhase::Connecting);
    }

    #[tokio::test]
    async fn send_assigns_monotonic_stream_ids() {
        let (transport, _rx) = ChatTransport::new();
        let mut phases = transport.watch_phase();
        assert_eq!(transport.phase(), StreamPhase::Idle);

        let params = |conversation_id: &str| SendParams {
            client: reqwest::Client::new(),
            // Unroutable endpoint; these requests fail, which the ids ignore.
            endpoint: "http://127.0.0.1:9/api/chat/widget".to_string(),
            conversation_id: conversation_id.to_string(),
            messages: Vec::new(),
        };

        let first = transport.send(params("c1"));
        let second = transport.send(params("c1"));
        assert_eq!(first, 1);
        assert_eq!(second, 2);
        assert_eq!(transport.phase(), StreamPhase::Connecting);
        assert_eq!(*phases.borrow_and_update(), StreamPhase::Connecting);
    }
}
