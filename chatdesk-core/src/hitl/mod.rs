//! Human-in-the-loop escalation types.
//!
//! An organization defines named HITL types ("soporte", "ventas", ...) and
//! assigns users holding the HITL role to them. Agent routing resolves
//! escalation targets by type name. Every committed change is announced as a
//! [`HitlEvent`].

pub mod events;
mod service;

pub use events::{EventBus, EventPublisher, EventReceiver, HitlEvent, HitlEventKind, RecordingPublisher};
pub use service::{AssignmentOutcome, HitlService, MAX_DESCRIPTION_LEN, MAX_NAME_LEN};

use chrono::{DateTime, Utc};
use std::collections::HashSet;

use crate::db::{HitlType, User};
use crate::error::Result;

/// Persistence for HITL types and user assignments.
///
/// Every lookup ignores soft-deleted rows and is scoped by organization.
pub trait HitlStore: Send + Sync {
    fn find_hitl_type(&self, organization_id: i64, id: i64) -> Result<Option<HitlType>>;

    fn find_hitl_type_by_name(&self, organization_id: i64, name: &str) -> Result<Option<HitlType>>;

    /// Live types of an organization ordered by name.
    fn list_hitl_types(&self, organization_id: i64) -> Result<Vec<HitlType>>;

    /// Insert a type; `Conflict` if the name is taken in the organization.
    fn insert_hitl_type(
        &self,
        organization_id: i64,
        created_by: i64,
        name: &str,
        description: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<HitlType>;

    /// Overwrite name and description; `Conflict` if the name is taken.
    fn update_hitl_type(
        &self,
        organization_id: i64,
        id: i64,
        name: &str,
        description: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<HitlType>;

    /// Delete a type and its assignments atomically. Returns the number of
    /// assignments removed.
    fn delete_hitl_type(&self, organization_id: i64, id: i64, at: DateTime<Utc>) -> Result<usize>;

    /// Bulk user lookup; unknown IDs are absent from the result.
    fn find_users(&self, user_ids: &[i64]) -> Result<Vec<User>>;

    /// The subset of `user_ids` already assigned to the type.
    fn assigned_user_ids(&self, hitl_type_id: i64, user_ids: &[i64]) -> Result<HashSet<i64>>;

    /// Insert assignments in one transaction, skipping pairs that already
    /// exist. Returns the user IDs actually inserted.
    fn insert_assignments(
        &self,
        organization_id: i64,
        hitl_type_id: i64,
        user_ids: &[i64],
        at: DateTime<Utc>,
    ) -> Result<Vec<i64>>;

    /// Returns false if no live assignment existed.
    fn delete_assignment(&self, hitl_type_id: i64, user_id: i64, at: DateTime<Utc>) -> Result<bool>;

    fn users_for_hitl_type(&self, hitl_type_id: i64) -> Result<Vec<User>>;

    fn hitl_types_for_user(&self, organization_id: i64, user_id: i64) -> Result<Vec<HitlType>>;
}
