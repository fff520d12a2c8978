//! chatdesk-core - Core library for Chatdesk
//!
//! This crate provides the domain logic behind the Chatdesk server:
//!
//! - **db**: SQLite persistence and entity types
//! - **session**: Chat session lifecycle (idle-timeout rollover)
//! - **hitl**: Human-in-the-loop escalation types, assignments and events
//! - **auth**: Caller identity, role checks and the service token
//! - **config**: Session configuration

pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod hitl;
pub mod session;

// Re-export commonly used types
pub use auth::{AccessControl, Caller, ServiceToken};
pub use config::SessionConfig;
pub use db::Database;
pub use error::{Error, Result};
pub use hitl::{EventBus, EventPublisher, HitlEvent, HitlService};
pub use session::{SessionAttachment, SessionLifecycle, SessionOutcome};
