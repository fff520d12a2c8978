//! Authentication middleware for chatdesk-server.

use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chatdesk_core::Caller;
use std::sync::Arc;
use tracing::debug;

use crate::error::ErrorResponse;
use crate::state::AppState;

/// Header carrying the acting user, set by the front end
pub const USER_ID_HEADER: &str = "X-Chatdesk-User-ID";

/// Authentication context extracted from request
#[derive(Debug, Clone, Copy)]
pub struct AuthContext {
    pub caller: Caller,
}

/// Authentication error
#[derive(Debug)]
pub enum AuthError {
    MissingToken,
    InvalidToken,
    MissingUserId,
    InvalidUserId,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (error, code) = match self {
            AuthError::MissingToken => ("Missing authentication token", "MISSING_TOKEN"),
            AuthError::InvalidToken => ("Invalid authentication token", "INVALID_TOKEN"),
            AuthError::MissingUserId => ("Missing user ID header", "MISSING_USER_ID"),
            AuthError::InvalidUserId => ("Malformed user ID header", "INVALID_USER_ID"),
        };

        let body = Json(ErrorResponse {
            error: error.to_string(),
            code: code.to_string(),
        });

        (StatusCode::UNAUTHORIZED, body).into_response()
    }
}

/// Authentication middleware for axum
///
/// The service token proves the request comes from the front end; the user
/// header names who is acting. Roles are checked later, per operation.
pub async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, AuthError> {
    let token_str = match request.headers().get("Authorization") {
        Some(value) => value.to_str().map_err(|_| AuthError::InvalidToken)?,
        None => return Err(AuthError::MissingToken),
    };

    // Remove "Bearer " prefix if present
    let token_str = token_str.trim_start_matches("Bearer ").trim();

    let token_bytes = STANDARD
        .decode(token_str)
        .map_err(|_| AuthError::InvalidToken)?;

    if !state.service_token.verify(&token_bytes) {
        debug!("Rejected request with unknown service token");
        return Err(AuthError::InvalidToken);
    }

    let user_id: i64 = request
        .headers()
        .get(USER_ID_HEADER)
        .ok_or(AuthError::MissingUserId)?
        .to_str()
        .map_err(|_| AuthError::InvalidUserId)?
        .trim()
        .parse()
        .map_err(|_| AuthError::InvalidUserId)?;

    request.extensions_mut().insert(AuthContext {
        caller: Caller::new(user_id),
    });

    Ok(next.run(request).await)
}
