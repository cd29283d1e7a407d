//! Event Ingest Endpoint
//!
//! HTTP entry point for the matching engine and other producers. Each
//! request carries one `DomainEvent` in its tagged JSON form:
//!
//! ```text
//! POST /events
//! { "type": "new_trade", "data": { ... } }
//! ```
//!
//! Accepted events are queued on the event router, which records them in
//! the market data store and delivers them to subscribers.
//!
//! # Responses
//!
//! - `202 Accepted` - the event is queued
//! - `4xx` - the body is not a valid event
//! - `503 Service Unavailable` - the router has shut down

use std::net::SocketAddr;

use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::post};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::application::services::{EventRouter, RouterError};
use crate::domain::streaming::DomainEvent;

/// Path events are posted to.
pub const EVENTS_PATH: &str = "/events";

#[derive(Debug, Serialize)]
struct Rejection {
    code: &'static str,
    message: String,
}

// =============================================================================
// Ingest Server
// =============================================================================

/// Event ingest HTTP server.
pub struct IngestServer {
    port: u16,
    router: EventRouter,
    cancel: CancellationToken,
}

impl IngestServer {
    /// Create a new ingest server publishing through `router`.
    #[must_use]
    pub const fn new(port: u16, router: EventRouter, cancel: CancellationToken) -> Self {
        Self {
            port,
            router,
            cancel,
        }
    }

    /// Routes served by the ingest server.
    pub fn router(router: EventRouter) -> Router {
        Router::new()
            .route(EVENTS_PATH, post(publish_handler))
            .with_state(router)
    }

    /// Run the ingest server until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `IngestServerError` if binding fails or the HTTP server
    /// encounters a fatal error while running.
    pub async fn run(self) -> Result<(), IngestServerError> {
        let app = Self::router(self.router);

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| IngestServerError::BindFailed(self.port, e.to_string()))?;

        tracing::info!(port = self.port, path = EVENTS_PATH, "Ingest server listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(self.cancel.cancelled_owned())
            .await
            .map_err(|e| IngestServerError::ServerFailed(e.to_string()))?;

        tracing::info!("Ingest server stopped");
        Ok(())
    }
}

async fn publish_handler(
    State(router): State<EventRouter>,
    Json(event): Json<DomainEvent>,
) -> impl IntoResponse {
    let kind = event.kind();
    let pair = *event.pair();
    match router.publish(event).await {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(e @ RouterError::Closed) => {
            tracing::warn!(event = kind, pair = %pair, error = %e, "Dropping ingested event");
            let body = Rejection {
                code: "ROUTER_CLOSED",
                message: e.to_string(),
            };
            (StatusCode::SERVICE_UNAVAILABLE, Json(body)).into_response()
        }
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Ingest server errors.
#[derive(Debug, thiserror::Error)]
pub enum IngestServerError {
    /// Failed to bind to port.
    #[error("failed to bind to port {0}: {1}")]
    BindFailed(u16, String),

    /// Server error.
    #[error("server error: {0}")]
    ServerFailed(String),
}

// =============================================================================
// Tests
// =============================================================================
