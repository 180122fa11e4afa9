//! Webhook endpoint for Telegram updates, plus health and metrics endpoints.

use super::{update_to_event, Update};
use crate::metrics::{MetricsReport, RelayMetrics};
use crate::transport::ChatEvent;
use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::Json,
    routing::{get, post},
    Router,
};
use std::future::Future;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Header Telegram uses to echo the secret registered with `setWebhook`.
pub const SECRET_HEADER: &str = "x-telegram-bot-api-secret-token";

#[derive(Clone)]
pub struct WebhookState {
    events: mpsc::Sender<ChatEvent>,
    secret: Arc<str>,
    metrics: Arc<RelayMetrics>,
}

impl WebhookState {
    pub fn new(events: mpsc::Sender<ChatEvent>, secret: &str, metrics: Arc<RelayMetrics>) -> Self {
        Self {
            events,
            secret: Arc::from(secret),
            metrics,
        }
    }
}

fn secret_matches(headers: &HeaderMap, expected: &str) -> bool {
    let Some(provided) = headers.get(SECRET_HEADER) else {
        return false;
    };
    let provided = provided.as_bytes();
    provided.len() == expected.len() && bool::from(provided.ct_eq(expected.as_bytes()))
}

/// `POST /webhook`
async fn receive_update(
    State(state): State<WebhookState>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    if !secret_matches(&headers, &state.secret) {
        warn!("Rejected webhook call with missing or invalid secret");
        return StatusCode::UNAUTHORIZED;
    }

    let update: Update = match serde_json::from_slice(&body) {
        Ok(update) => update,
        Err(e) => {
            warn!("Malformed webhook update: {}", e);
            return StatusCode::BAD_REQUEST;
        }
    };

    let Some(event) = update_to_event(update) else {
        return StatusCode::OK;
    };

    match state.events.send(event).await {
        Ok(()) => StatusCode::OK,
        Err(_) => {
            warn!("Router stopped, refusing webhook update");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

/// `GET /health`
async fn health() -> &'static str {
    "OK"
}

/// `GET /metrics`
async fn metrics(State(state): State<WebhookState>) -> Json<MetricsReport> {
    Json(state.metrics.report())
}

pub fn webhook_router(state: WebhookState) -> Router {
    Router::new()
        .route("/webhook", post(receive_update))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the webhook on `0.0.0.0:port` until `shutdown` resolves.
pub async fn serve<S>(port: u16, state: WebhookState, shutdown: S) -> Result<()>
where
    S: Future<Output = ()> + Send + 'static,
{
    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind webhook server to {}", addr))?;
    info!("Webhook server listening on {}", addr);

    axum::serve(listener, webhook_router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("Webhook server failed")
}
