//! Health and session diagnostics

use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;

use super::ApiState;
use crate::session::SessionSummary;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: &'static str,
    pub version: &'static str,
    pub timestamp: DateTime<Utc>,
    pub active_sessions: usize,
}

/// Session listing response
#[derive(Debug, Serialize)]
pub struct SessionsResponse {
    pub sessions: Vec<SessionSummary>,
}

/// Liveness probe with the live session count
async fn health(State(state): State<Arc<ApiState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
        timestamp: Utc::now(),
        active_sessions: state.registry.count().await,
    })
}

async fn sessions(State(state): State<Arc<ApiState>>) -> Json<SessionsResponse> {
    Json(SessionsResponse {
        sessions: state.registry.summaries().await,
    })
}

/// Build health router
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/sessions", get(sessions))
        .with_state(state)
}
