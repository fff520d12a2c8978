//! Organizations, users and role memberships.

use chrono::Utc;
use rusqlite::{OptionalExtension, params, params_from_iter};
use std::collections::HashSet;

use super::{Database, Membership, Organization, OrganizationRole, User, parsed, placeholders, timestamp, to_millis};
use crate::auth::AccessControl;
use crate::error::Result;

impl Database {
    // ─────────────────────────────────────────────────────────────────────────
    // Organization Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Create an organization
    pub fn create_organization(&self, name: &str) -> Result<Organization> {
        let conn = self.lock()?;
        let now = Utc::now();
        conn.execute(
            "INSERT INTO organization (name, created_at) VALUES (?1, ?2)",
            params![name, to_millis(now)],
        )?;
        let id = conn.last_insert_rowid();
        Ok(conn.query_row(
            "SELECT id, name, created_at FROM organization WHERE id = ?1",
            params![id],
            Self::map_organization,
        )?)
    }

    /// Get organization by ID
    pub fn get_organization(&self, id: i64) -> Result<Option<Organization>> {
        let conn = self.lock()?;
        Ok(conn
            .query_row(
                "SELECT id, name, created_at FROM organization WHERE id = ?1",
                params![id],
                Self::map_organization,
            )
            .optional()?)
    }

    pub fn list_organizations(&self) -> Result<Vec<Organization>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT id, name, created_at FROM organization ORDER BY id")?;
        let orgs = stmt
            .query_map([], Self::map_organization)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(orgs)
    }

    fn map_organization(row: &rusqlite::Row) -> rusqlite::Result<Organization> {
        Ok(Organization {
            id: row.get(0)?,
            name: row.get(1)?,
            created_at: timestamp(row, 2)?,
        })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // User Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a user
    pub fn create_user(&self, name: &str, email: &str) -> Result<User> {
        let conn = self.lock()?;
        let now = Utc::now();
        conn.execute(
            "INSERT INTO user (name, email, created_at) VALUES (?1, ?2, ?3)",
            params![name, email, to_millis(now)],
        )?;
        let id = conn.last_insert_rowid();
        Ok(conn.query_row(
            "SELECT id, name, email, created_at FROM user WHERE id = ?1",
            params![id],
            Self::map_user,
        )?)
    }

    /// Get user by ID
    pub fn get_user(&self, id: i64) -> Result<Option<User>> {
        let conn = self.lock()?;
        Ok(conn
            .query_row(
                "SELECT id, name, email, created_at FROM user WHERE id = ?1",
                params![id],
                Self::map_user,
            )
            .optional()?)
    }

    /// Bulk fetch users. Unknown IDs are simply absent from the result.
    pub fn users_by_ids(&self, ids: &[i64]) -> Result<Vec<User>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.lock()?;
        let sql = format!(
            "SELECT id, name, email, created_at FROM user WHERE id IN ({}) ORDER BY id",
            placeholders(ids.len())
        );
        let mut stmt = conn.prepare(&sql)?;
        let users = stmt
            .query_map(params_from_iter(ids.iter()), Self::map_user)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(users)
    }

    pub(crate) fn map_user(row: &rusqlite::Row) -> rusqlite::Result<User> {
        Ok(User {
            id: row.get(0)?,
            name: row.get(1)?,
            email: row.get(2)?,
            created_at: timestamp(row, 3)?,
        })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Membership Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Grant a role. Granting a role the user already holds is a no-op.
    pub fn add_membership(&self, user_id: i64, organization_id: i64, role: OrganizationRole) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR IGNORE INTO user_organization_role (user_id, organization_id, role)
             VALUES (?1, ?2, ?3)",
            params![user_id, organization_id, role.as_str()],
        )?;
        Ok(())
    }

    /// Revoke a role. Returns false if the user did not hold it.
    pub fn remove_membership(&self, user_id: i64, organization_id: i64, role: OrganizationRole) -> Result<bool> {
        let conn = self.lock()?;
        let count = conn.execute(
            "DELETE FROM user_organization_role
             WHERE user_id = ?1 AND organization_id = ?2 AND role = ?3",
            params![user_id, organization_id, role.as_str()],
        )?;
        Ok(count > 0)
    }

    /// All memberships of a user across organizations
    pub fn memberships_for_user(&self, user_id: i64) -> Result<Vec<Membership>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT user_id, organization_id, role FROM user_organization_role
             WHERE user_id = ?1 ORDER BY organization_id, role",
        )?;
        let memberships = stmt
            .query_map(params![user_id], |row| {
                Ok(Membership {
                    user_id: row.get(0)?,
                    organization_id: row.get(1)?,
                    role: parsed(row, 2)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(memberships)
    }
}

impl AccessControl for Database {
    fn roles_in(&self, user_id: i64, organization_id: i64) -> Result<Vec<OrganizationRole>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT role FROM user_organization_role
             WHERE user_id = ?1 AND organization_id = ?2",
        )?;
        let roles = stmt
            .query_map(params![user_id, organization_id], |row| parsed(row, 0))?
            .collect::<std::result::Result<Vec<OrganizationRole>, _>>()?;
        Ok(roles)
    }

    fn users_with_role(
        &self,
        organization_id: i64,
        role: OrganizationRole,
        user_ids: &[i64],
    ) -> Result<HashSet<i64>> {
        if user_ids.is_empty() {
            return Ok(HashSet::new());
        }
        let conn = self.lock()?;
        let sql = format!(
            "SELECT user_id FROM user_organization_role
             WHERE organization_id = ? AND role = ? AND user_id IN ({})",
            placeholders(user_ids.len())
        );
        let mut args: Vec<rusqlite::types::Value> = vec![organization_id.into(), role.as_str().to_string().into()];
        args.extend(user_ids.iter().map(|id| rusqlite::types::Value::from(*id)));

        let mut stmt = conn.prepare(&sql)?;
        let ids = stmt
            .query_map(params_from_iter(args), |row| row.get::<_, i64>(0))?
            .collect::<std::result::Result<HashSet<_>, _>>()?;
        Ok(ids)
    }
}
