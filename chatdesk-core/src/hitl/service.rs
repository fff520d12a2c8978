//! HitlService - role-gated management of HITL types and assignments.

use chrono::Utc;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::info;

use super::{EventPublisher, HitlEvent, HitlStore};
use crate::auth::{AccessControl, Caller};
use crate::db::{HitlType, HitlTypePatch, NewHitlType, OrganizationRole, User};
use crate::error::{Error, Result};

pub const MAX_NAME_LEN: usize = 100;
pub const MAX_DESCRIPTION_LEN: usize = 500;

/// Result of a batch assignment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AssignmentOutcome {
    /// Users newly assigned by this call.
    pub assigned: Vec<i64>,
    /// Users that already held the assignment.
    pub already_assigned: Vec<i64>,
}

/// HitlService manages HITL types, assignments and their events
pub struct HitlService {
    store: Arc<dyn HitlStore>,
    access: Arc<dyn AccessControl>,
    events: Arc<dyn EventPublisher>,
}

impl HitlService {
    pub fn new(
        store: Arc<dyn HitlStore>,
        access: Arc<dyn AccessControl>,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        Self { store, access, events }
    }

    /// Create a HITL type. Owner only.
    pub fn create(&self, caller: &Caller, organization_id: i64, input: NewHitlType) -> Result<HitlType> {
        self.access
            .require_role(caller, organization_id, OrganizationRole::Owner)?;

        let name = validate_name(&input.name)?;
        let description = validate_description(input.description.as_deref())?;

        if self.store.find_hitl_type_by_name(organization_id, &name)?.is_some() {
            return Err(duplicate_name(&name));
        }

        let hitl_type = self.store.insert_hitl_type(
            organization_id,
            caller.user_id,
            &name,
            description.as_deref(),
            Utc::now(),
        )?;

        info!(
            organization_id = organization_id,
            hitl_type_id = hitl_type.id,
            name = %hitl_type.name,
            "HITL type created"
        );
        self.events.publish(HitlEvent::TypeCreated {
            organization_id,
            hitl_type_id: hitl_type.id,
            name: hitl_type.name.clone(),
            timestamp: hitl_type.created_at,
        });

        Ok(hitl_type)
    }

    /// All live HITL types of the organization. Any member.
    pub fn find_all(&self, caller: &Caller, organization_id: i64) -> Result<Vec<HitlType>> {
        self.access.require_member(caller, organization_id)?;
        self.store.list_hitl_types(organization_id)
    }

    /// One HITL type. Any member.
    pub fn find_one(&self, caller: &Caller, organization_id: i64, id: i64) -> Result<HitlType> {
        self.access.require_member(caller, organization_id)?;
        self.require_type(organization_id, id)
    }

    /// Rename and/or re-describe a HITL type. Owner only.
    pub fn update(
        &self,
        caller: &Caller,
        organization_id: i64,
        id: i64,
        patch: HitlTypePatch,
    ) -> Result<HitlType> {
        self.access
            .require_role(caller, organization_id, OrganizationRole::Owner)?;
        let current = self.require_type(organization_id, id)?;

        let name = match patch.name.as_deref() {
            Some(raw) => validate_name(raw)?,
            None => current.name.clone(),
        };
        if name != current.name {
            if let Some(other) = self.store.find_hitl_type_by_name(organization_id, &name)? {
                if other.id != id {
                    return Err(duplicate_name(&name));
                }
            }
        }

        let description = match patch.description {
            Some(new) => validate_description(new.as_deref())?,
            None => current.description.clone(),
        };

        let hitl_type = self.store.update_hitl_type(
            organization_id,
            id,
            &name,
            description.as_deref(),
            Utc::now(),
        )?;

        info!(
            organization_id = organization_id,
            hitl_type_id = id,
            name = %hitl_type.name,
            "HITL type updated"
        );
        self.events.publish(HitlEvent::TypeUpdated {
            organization_id,
            hitl_type_id: id,
            name: hitl_type.name.clone(),
            timestamp: hitl_type.updated_at,
        });

        Ok(hitl_type)
    }

    /// Delete a HITL type together with its assignments. Owner only.
    pub fn remove(&self, caller: &Caller, organization_id: i64, id: i64) -> Result<()> {
        self.access
            .require_role(caller, organization_id, OrganizationRole::Owner)?;
        let current = self.require_type(organization_id, id)?;

        let now = Utc::now();
        let removed_assignments = self.store.delete_hitl_type(organization_id, id, now)?;

        info!(
            organization_id = organization_id,
            hitl_type_id = id,
            removed_assignments = removed_assignments,
            "HITL type deleted"
        );
        self.events.publish(HitlEvent::TypeDeleted {
            organization_id,
            hitl_type_id: id,
            name: current.name,
            timestamp: now,
        });

        Ok(())
    }

    /// Assign users holding the HITL role to a type. Owner only.
    ///
    /// All-or-nothing: unknown users or users without the HITL role fail the
    /// whole batch, and the error names every offender. Users already
    /// assigned are skipped and produce no event.
    pub fn assign_users(
        &self,
        caller: &Caller,
        organization_id: i64,
        id: i64,
        user_ids: &[i64],
    ) -> Result<AssignmentOutcome> {
        self.access
            .require_role(caller, organization_id, OrganizationRole::Owner)?;
        let hitl_type = self.require_type(organization_id, id)?;

        let requested = dedup_preserving_order(user_ids);
        if requested.is_empty() {
            return Err(Error::bad_request("at least one user id is required"));
        }

        let users: HashMap<i64, User> = self
            .store
            .find_users(&requested)?
            .into_iter()
            .map(|user| (user.id, user))
            .collect();

        let missing: Vec<String> = requested
            .iter()
            .filter(|uid| !users.contains_key(*uid))
            .map(|uid| uid.to_string())
            .collect();
        if !missing.is_empty() {
            return Err(Error::bad_request(format!(
                "users not found: {}",
                missing.join(", ")
            )));
        }

        let eligible = self
            .access
            .users_with_role(organization_id, OrganizationRole::Hitl, &requested)?;
        let ineligible: Vec<&str> = requested
            .iter()
            .filter(|uid| !eligible.contains(*uid))
            .map(|uid| users[uid].email.as_str())
            .collect();
        if !ineligible.is_empty() {
            return Err(Error::bad_request(format!(
                "users without the HITL role in organization {}: {}",
                organization_id,
                ineligible.join(", ")
            )));
        }

        let existing = self.store.assigned_user_ids(id, &requested)?;
        let (already_assigned, to_assign): (Vec<i64>, Vec<i64>) =
            requested.into_iter().partition(|uid| existing.contains(uid));

        let now = Utc::now();
        let assigned = if to_assign.is_empty() {
            Vec::new()
        } else {
            self.store.insert_assignments(organization_id, id, &to_assign, now)?
        };

        // A concurrent call may have won some pairs between our read and insert.
        let already_assigned = already_assigned
            .into_iter()
            .chain(to_assign.into_iter().filter(|uid| !assigned.contains(uid)))
            .collect();

        info!(
            organization_id = organization_id,
            hitl_type_id = id,
            assigned = assigned.len(),
            "HITL users assigned"
        );
        for &user_id in &assigned {
            self.events.publish(HitlEvent::UserAssigned {
                organization_id,
                hitl_type_id: id,
                name: hitl_type.name.clone(),
                user_id,
                timestamp: now,
            });
        }

        Ok(AssignmentOutcome {
            assigned,
            already_assigned,
        })
    }

    /// Remove one user's assignment. Owner only.
    pub fn remove_user_assignment(
        &self,
        caller: &Caller,
        organization_id: i64,
        id: i64,
        user_id: i64,
    ) -> Result<()> {
        self.access
            .require_role(caller, organization_id, OrganizationRole::Owner)?;
        let hitl_type = self.require_type(organization_id, id)?;

        let now = Utc::now();
        if !self.store.delete_assignment(id, user_id, now)? {
            return Err(Error::not_found(
                "UserHitlType",
                format!("user {} in HITL type {}", user_id, id),
            ));
        }

        info!(
            organization_id = organization_id,
            hitl_type_id = id,
            user_id = user_id,
            "HITL user assignment removed"
        );
        self.events.publish(HitlEvent::UserRemoved {
            organization_id,
            hitl_type_id: id,
            name: hitl_type.name,
            user_id,
            timestamp: now,
        });

        Ok(())
    }

    /// Users assigned to the named type; empty when the type does not exist.
    ///
    /// Used by agent routing to resolve escalation targets, so no caller is
    /// involved.
    pub fn get_users_by_hitl_type(&self, organization_id: i64, hitl_type_name: &str) -> Result<Vec<User>> {
        match self
            .store
            .find_hitl_type_by_name(organization_id, hitl_type_name.trim())?
        {
            Some(hitl_type) => self.store.users_for_hitl_type(hitl_type.id),
            None => Ok(Vec::new()),
        }
    }

    /// Users assigned to a type. Any member.
    pub fn assigned_users(&self, caller: &Caller, organization_id: i64, id: i64) -> Result<Vec<User>> {
        self.access.require_member(caller, organization_id)?;
        self.require_type(organization_id, id)?;
        self.store.users_for_hitl_type(id)
    }

    /// Types a user is assigned to inside the organization. Any member.
    pub fn hitl_types_for_user(
        &self,
        caller: &Caller,
        organization_id: i64,
        user_id: i64,
    ) -> Result<Vec<HitlType>> {
        self.access.require_member(caller, organization_id)?;
        self.store.hitl_types_for_user(organization_id, user_id)
    }

    fn require_type(&self, organization_id: i64, id: i64) -> Result<HitlType> {
        self.store
            .find_hitl_type(organization_id, id)?
            .ok_or_else(|| Error::not_found("HitlType", id))
    }
}

fn duplicate_name(name: &str) -> Error {
    Error::conflict(format!("a HITL type named '{}' already exists", name))
}

fn validate_name(raw: &str) -> Result<String> {
    let name = raw.trim();
    if name.is_empty() {
        return Err(Error::bad_request("name must not be empty"));
    }
    if name.chars().count() > MAX_NAME_LEN {
        return Err(Error::bad_request(format!(
            "name must be at most {} characters",
            MAX_NAME_LEN
        )));
    }
    Ok(name.to_string())
}

fn validate_description(raw: Option<&str>) -> Result<Option<String>> {
    let Some(description) = raw.map(str::trim).filter(|d| !d.is_empty()) else {
        return Ok(None);
    };
    if description.chars().count() > MAX_DESCRIPTION_LEN {
        return Err(Error::bad_request(format!(
            "description must be at most {} characters",
            MAX_DESCRIPTION_LEN
        )));
    }
    Ok(Some(description.to_string()))
}

fn dedup_preserving_order(ids: &[i64]) -> Vec<i64> {
    let mut seen = HashSet::with_capacity(ids.len());
    ids.iter().copied().filter(|id| seen.insert(*id)).collect()
}
