//! HITL type and assignment routes.
//!
//! Role checks happen in [`HitlService`](chatdesk_core::HitlService); the
//! handlers only translate between HTTP and the service.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{delete, get},
    Extension, Json, Router,
};
use chatdesk_core::db::{HitlType, HitlTypePatch, NewHitlType, User};
use chatdesk_core::hitl::AssignmentOutcome;
use serde::Deserialize;
use std::sync::Arc;

use crate::error::ApiResult;
use crate::middleware::AuthContext;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route(
            "/organizations/{organization_id}/hitl-types",
            get(list_hitl_types).post(create_hitl_type),
        )
        .route(
            "/organizations/{organization_id}/hitl-types/{id}",
            get(get_hitl_type)
                .patch(update_hitl_type)
                .delete(delete_hitl_type),
        )
        .route(
            "/organizations/{organization_id}/hitl-types/{id}/users",
            get(list_assigned_users).post(assign_users),
        )
        .route(
            "/organizations/{organization_id}/hitl-types/{id}/users/{user_id}",
            delete(remove_user_assignment),
        )
        .route(
            "/organizations/{organization_id}/users/{user_id}/hitl-types",
            get(hitl_types_for_user),
        )
}

#[derive(Debug, Deserialize)]
pub struct AssignUsersRequest {
    pub user_ids: Vec<i64>,
}

async fn list_hitl_types(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path(organization_id): Path<i64>,
) -> ApiResult<Json<Vec<HitlType>>> {
    Ok(Json(state.hitl.find_all(&auth.caller, organization_id)?))
}

async fn create_hitl_type(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path(organization_id): Path<i64>,
    Json(input): Json<NewHitlType>,
) -> ApiResult<(StatusCode, Json<HitlType>)> {
    let hitl_type = state.hitl.create(&auth.caller, organization_id, input)?;
    Ok((StatusCode::CREATED, Json(hitl_type)))
}

async fn get_hitl_type(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path((organization_id, id)): Path<(i64, i64)>,
) -> ApiResult<Json<HitlType>> {
    Ok(Json(state.hitl.find_one(&auth.caller, organization_id, id)?))
}

async fn update_hitl_type(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path((organization_id, id)): Path<(i64, i64)>,
    Json(patch): Json<HitlTypePatch>,
) -> ApiResult<Json<HitlType>> {
    Ok(Json(state.hitl.update(&auth.caller, organization_id, id, patch)?))
}

async fn delete_hitl_type(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path((organization_id, id)): Path<(i64, i64)>,
) -> ApiResult<StatusCode> {
    state.hitl.remove(&auth.caller, organization_id, id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_assigned_users(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path((organization_id, id)): Path<(i64, i64)>,
) -> ApiResult<Json<Vec<User>>> {
    Ok(Json(state.hitl.assigned_users(&auth.caller, organization_id, id)?))
}

async fn assign_users(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path((organization_id, id)): Path<(i64, i64)>,
    Json(input): Json<AssignUsersRequest>,
) -> ApiResult<Json<AssignmentOutcome>> {
    let outcome = state
        .hitl
        .assign_users(&auth.caller, organization_id, id, &input.user_ids)?;
    Ok(Json(outcome))
}

async fn remove_user_assignment(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path((organization_id, id, user_id)): Path<(i64, i64, i64)>,
) -> ApiResult<StatusCode> {
    state
        .hitl
        .remove_user_assignment(&auth.caller, organization_id, id, user_id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn hitl_types_for_user(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path((organization_id, user_id)): Path<(i64, i64)>,
) -> ApiResult<Json<Vec<HitlType>>> {
    Ok(Json(
        state
            .hitl
            .hitl_types_for_user(&auth.caller, organization_id, user_id)?,
    ))
}
