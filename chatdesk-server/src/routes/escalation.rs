//! Escalation target lookup and the HITL notification feed.

use axum::{
    extract::{Path, Query, State},
    routing::get,
    Extension, Json, Router,
};
use chatdesk_core::db::User;
use chatdesk_core::{AccessControl, HitlEvent};
use serde::Deserialize;
use std::sync::Arc;

use crate::error::ApiResult;
use crate::middleware::AuthContext;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route(
            "/organizations/{organization_id}/escalation-targets/{name}",
            get(escalation_targets),
        )
        .route(
            "/organizations/{organization_id}/notifications",
            get(notifications),
        )
}

#[derive(Debug, Deserialize)]
pub struct NotificationsQuery {
    pub limit: Option<usize>,
}

/// Users to hand a conversation to for the named HITL type. Any member.
async fn escalation_targets(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path((organization_id, name)): Path<(i64, String)>,
) -> ApiResult<Json<Vec<User>>> {
    state.db.require_member(&auth.caller, organization_id)?;
    Ok(Json(state.router.targets(organization_id, &name).await?))
}

/// Recent HITL events of the organization, newest first. Any member.
async fn notifications(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path(organization_id): Path<i64>,
    Query(query): Query<NotificationsQuery>,
) -> ApiResult<Json<Vec<HitlEvent>>> {
    state.db.require_member(&auth.caller, organization_id)?;
    Ok(Json(
        state
            .notifications
            .recent(organization_id, query.limit)
            .await,
    ))
}
