//! Authorization for chatdesk.
//!
//! - **Caller**: the authenticated user behind a request
//! - **AccessControl**: capability checks answered by a fresh store lookup,
//!   never by a membership list cached on the caller
//! - **ServiceToken**: shared secret between the front end and the server

mod token;

pub use token::ServiceToken;

use std::collections::HashSet;

use crate::db::OrganizationRole;
use crate::error::{Error, Result};

/// The authenticated user performing an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Caller {
    pub user_id: i64,
}

impl Caller {
    pub fn new(user_id: i64) -> Self {
        Self { user_id }
    }
}

/// Role lookups scoped to one organization.
pub trait AccessControl: Send + Sync {
    /// All roles `user_id` holds in `organization_id`.
    fn roles_in(&self, user_id: i64, organization_id: i64) -> Result<Vec<OrganizationRole>>;

    /// The subset of `user_ids` holding `role` in `organization_id`.
    fn users_with_role(
        &self,
        organization_id: i64,
        role: OrganizationRole,
        user_ids: &[i64],
    ) -> Result<HashSet<i64>>;

    fn has_role(&self, user_id: i64, organization_id: i64, role: OrganizationRole) -> Result<bool> {
        Ok(self.roles_in(user_id, organization_id)?.contains(&role))
    }

    fn is_member(&self, user_id: i64, organization_id: i64) -> Result<bool> {
        Ok(!self.roles_in(user_id, organization_id)?.is_empty())
    }

    /// Fail with `Forbidden` unless the caller holds `role`.
    fn require_role(&self, caller: &Caller, organization_id: i64, role: OrganizationRole) -> Result<()> {
        if self.has_role(caller.user_id, organization_id, role)? {
            Ok(())
        } else {
            Err(Error::forbidden(format!(
                "user {} does not hold role {} in organization {}",
                caller.user_id, role, organization_id
            )))
        }
    }

    /// Fail with `Forbidden` unless the caller belongs to the organization.
    fn require_member(&self, caller: &Caller, organization_id: i64) -> Result<()> {
        if self.is_member(caller.user_id, organization_id)? {
            Ok(())
        } else {
            Err(Error::forbidden(format!(
                "user {} is not a member of organization {}",
                caller.user_id, organization_id
            )))
        }
    }
}
