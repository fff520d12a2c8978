//! HTTP middleware.

mod auth;

pub use auth::{auth_middleware, AuthContext};

#[cfg(test)]
pub use auth::USER_ID_HEADER;
