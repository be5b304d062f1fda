//! Relay server: the single route the widget talks to. Accepts a turn
//! request carrying the full message history, forwards it to the configured
//! provider, and answers with an SSE stream of widget frames. No auth, no
//! persistence; the relay holds nothing between requests.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::State;
use axum::response::sse::{Event, Sse};
use axum::routing::post;
use axum::{Json, Router};
use futures_util::stream::{self, Stream};
use tokio::sync::mpsc;
use tracing::{error, info};

use crate::api::frames::TurnRequest;
use crate::core::config::RelayConfig;

pub mod upstream;

pub struct RelayState {
    pub client: reqwest::Client,
    pub config: RelayConfig,
    pub api_key: String,
}

pub fn router(state: Arc<RelayState>) -> Router {
    let route = state.config.route.clone();
    Router::new()
        .route(&route, post(handle_widget_turn))
        .with_state(state)
}

/// Runs the relay until ctrl-c. The bind address and route come from config;
/// the provider key comes from the environment at startup.
pub async fn serve(config: RelayConfig) -> Result<(), Box<dyn std::error::Error>> {
    let api_key = RelayConfig::api_key_from_env();
    if api_key.is_empty() {
        info!("OPENAI_API_KEY is not set; forwarding requests without authentication");
    }

    let bind = config.bind.clone();
    let state = Arc::new(RelayState {
        client: reqwest::Client::new(),
        config,
        api_key,
    });

    let listener = tokio::net::TcpListener::bind(bind.as_str()).await?;
    info!(
        addr = %listener.local_addr()?,
        route = %state.config.route,
        model = %state.config.model,
        "relay listening"
    );

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to install ctrl-c handler");
        return;
    }
    info!("shutting down");
}

/// The response status commits to 200 before the provider is contacted;
/// provider failures surface in-stream as an error frame.
async fn handle_widget_turn(
    State(state): State<Arc<RelayState>>,
    Json(request): Json<TurnRequest>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    info!(
        conversation_id = %request.id,
        messages = request.messages.len(),
        "widget turn received"
    );

    let (tx, rx) = mpsc::unbounded_channel::<String>();
    tokio::spawn(upstream::relay_turn(state, request, tx));

    let stream = stream::unfold(rx, |mut rx| async move {
        let payload = rx.recv().await?;
        Some((Ok(Event::default().data(payload)), rx))
    });
    Sse::new(stream)
}
