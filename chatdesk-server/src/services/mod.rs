//! Service layer for chatdesk-server
//!
//! Subscribers to the HITL event bus that keep derived, in-memory views.

pub mod notifications;
pub mod routing;

pub use notifications::NotificationService;
pub use routing::EscalationRouter;
