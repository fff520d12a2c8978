//! Health check endpoint.

use axum::{extract::State, Json};
use serde::Serialize;
use std::sync::Arc;

use crate::state::AppState;

#[derive(Serialize)]
pub struct HealthStatus {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub components: HealthComponents,
    pub session_idle_timeout_minutes: i64,
}

#[derive(Serialize)]
pub struct HealthComponents {
    pub database: bool,
    /// Subscribers currently attached to the HITL event bus
    pub event_subscribers: usize,
    pub escalation_cache_entries: usize,
}

/// Health check endpoint
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthStatus> {
    let db_healthy = state.db.ping().is_ok();

    let status = if db_healthy { "healthy" } else { "degraded" };

    Json(HealthStatus {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        components: HealthComponents {
            database: db_healthy,
            event_subscribers: state.events.receiver_count(),
            escalation_cache_entries: state.router.cached_entries().await,
        },
        session_idle_timeout_minutes: state.config.session.idle_timeout_minutes,
    })
}
