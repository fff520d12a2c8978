//! HITL type and assignment persistence.
//!
//! Deletes are soft: rows get a `deleted_at` stamp and drop out of every
//! lookup and uniqueness index.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params, params_from_iter};
use std::collections::HashSet;

use super::{Database, HitlType, User, placeholders, timestamp, to_millis};
use crate::error::{Error, Result};
use crate::hitl::HitlStore;

const HITL_TYPE_COLUMNS: &str =
    "id, organization_id, name, description, created_by, created_at, updated_at";

impl Database {
    fn map_hitl_type(row: &rusqlite::Row) -> rusqlite::Result<HitlType> {
        Ok(HitlType {
            id: row.get(0)?,
            organization_id: row.get(1)?,
            name: row.get(2)?,
            description: row.get(3)?,
            created_by: row.get(4)?,
            created_at: timestamp(row, 5)?,
            updated_at: timestamp(row, 6)?,
        })
    }

    fn fetch_hitl_type(conn: &Connection, organization_id: i64, id: i64) -> Result<Option<HitlType>> {
        Ok(conn
            .query_row(
                &format!(
                    "SELECT {} FROM hitl_type
                     WHERE id = ?1 AND organization_id = ?2 AND deleted_at IS NULL",
                    HITL_TYPE_COLUMNS
                ),
                params![id, organization_id],
                Self::map_hitl_type,
            )
            .optional()?)
    }
}

/// Turn a unique-index hit on the live name index into a domain conflict.
fn name_conflict(err: Error, name: &str) -> Error {
    if err.is_unique_violation() {
        Error::conflict(format!("a HITL type named '{}' already exists", name))
    } else {
        err
    }
}

impl HitlStore for Database {
    fn find_hitl_type(&self, organization_id: i64, id: i64) -> Result<Option<HitlType>> {
        let conn = self.lock()?;
        Self::fetch_hitl_type(&conn, organization_id, id)
    }

    fn find_hitl_type_by_name(&self, organization_id: i64, name: &str) -> Result<Option<HitlType>> {
        let conn = self.lock()?;
        Ok(conn
            .query_row(
                &format!(
                    "SELECT {} FROM hitl_type
                     WHERE organization_id = ?1 AND name = ?2 AND deleted_at IS NULL",
                    HITL_TYPE_COLUMNS
                ),
                params![organization_id, name],
                Self::map_hitl_type,
            )
            .optional()?)
    }

    fn list_hitl_types(&self, organization_id: i64) -> Result<Vec<HitlType>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM hitl_type
             WHERE organization_id = ?1 AND deleted_at IS NULL
             ORDER BY name",
            HITL_TYPE_COLUMNS
        ))?;
        let types = stmt
            .query_map(params![organization_id], Self::map_hitl_type)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(types)
    }

    fn insert_hitl_type(
        &self,
        organization_id: i64,
        created_by: i64,
        name: &str,
        description: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<HitlType> {
        let conn = self.lock()?;
        let now = to_millis(at);
        conn.execute(
            "INSERT INTO hitl_type (organization_id, name, description, created_by, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
            params![organization_id, name, description, created_by, now],
        )
        .map_err(|e| name_conflict(e.into(), name))?;

        Self::fetch_hitl_type(&conn, organization_id, conn.last_insert_rowid())?
            .ok_or_else(|| Error::Other("inserted HITL type vanished".into()))
    }

    fn update_hitl_type(
        &self,
        organization_id: i64,
        id: i64,
        name: &str,
        description: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<HitlType> {
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE hitl_type SET name = ?1, description = ?2, updated_at = ?3
                 WHERE id = ?4 AND organization_id = ?5 AND deleted_at IS NULL",
                params![name, description, to_millis(at), id, organization_id],
            )
            .map_err(|e| name_conflict(e.into(), name))?;
        if changed == 0 {
            return Err(Error::not_found("HitlType", id));
        }

        Self::fetch_hitl_type(&conn, organization_id, id)?.ok_or_else(|| Error::not_found("HitlType", id))
    }

    fn delete_hitl_type(&self, organization_id: i64, id: i64, at: DateTime<Utc>) -> Result<usize> {
        let mut conn = self.lock()?;
        let now = to_millis(at);
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let assignments = tx.execute(
            "UPDATE user_hitl_type SET deleted_at = ?1, updated_at = ?1
             WHERE hitl_type_id = ?2 AND organization_id = ?3 AND deleted_at IS NULL",
            params![now, id, organization_id],
        )?;
        let deleted = tx.execute(
            "UPDATE hitl_type SET deleted_at = ?1, updated_at = ?1
             WHERE id = ?2 AND organization_id = ?3 AND deleted_at IS NULL",
            params![now, id, organization_id],
        )?;
        if deleted == 0 {
            // Dropping the transaction rolls the assignment update back
            return Err(Error::not_found("HitlType", id));
        }

        tx.commit()?;
        Ok(assignments)
    }

    fn find_users(&self, user_ids: &[i64]) -> Result<Vec<User>> {
        self.users_by_ids(user_ids)
    }

    fn assigned_user_ids(&self, hitl_type_id: i64, user_ids: &[i64]) -> Result<HashSet<i64>> {
        if user_ids.is_empty() {
            return Ok(HashSet::new());
        }
        let conn = self.lock()?;
        let sql = format!(
            "SELECT user_id FROM user_hitl_type
             WHERE hitl_type_id = ? AND deleted_at IS NULL AND user_id IN ({})",
            placeholders(user_ids.len())
        );
        let args = std::iter::once(hitl_type_id).chain(user_ids.iter().copied());
        let mut stmt = conn.prepare(&sql)?;
        let ids = stmt
            .query_map(params_from_iter(args), |row| row.get::<_, i64>(0))?
            .collect::<std::result::Result<HashSet<_>, _>>()?;
        Ok(ids)
    }

    fn insert_assignments(
        &self,
        organization_id: i64,
        hitl_type_id: i64,
        user_ids: &[i64],
        at: DateTime<Utc>,
    ) -> Result<Vec<i64>> {
        let mut conn = self.lock()?;
        let now = to_millis(at);
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let mut inserted = Vec::with_capacity(user_ids.len());
        {
            // A row already present for the pair is skipped, not an error.
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO user_hitl_type
                 (user_id, hitl_type_id, organization_id, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?4)",
            )?;
            for &user_id in user_ids {
                if stmt.execute(params![user_id, hitl_type_id, organization_id, now])? > 0 {
                    inserted.push(user_id);
                }
            }
        }

        tx.commit()?;
        Ok(inserted)
    }

    fn delete_assignment(&self, hitl_type_id: i64, user_id: i64, at: DateTime<Utc>) -> Result<bool> {
        let conn = self.lock()?;
        let now = to_millis(at);
        let changed = conn.execute(
            "UPDATE user_hitl_type SET deleted_at = ?1, updated_at = ?1
             WHERE hitl_type_id = ?2 AND user_id = ?3 AND deleted_at IS NULL",
            params![now, hitl_type_id, user_id],
        )?;
        Ok(changed > 0)
    }

    fn users_for_hitl_type(&self, hitl_type_id: i64) -> Result<Vec<User>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT u.id, u.name, u.email, u.created_at
             FROM user_hitl_type uht
             JOIN user u ON u.id = uht.user_id
             WHERE uht.hitl_type_id = ?1 AND uht.deleted_at IS NULL
             ORDER BY u.id",
        )?;
        let users = stmt
            .query_map(params![hitl_type_id], Self::map_user)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(users)
    }

    fn hitl_types_for_user(&self, organization_id: i64, user_id: i64) -> Result<Vec<HitlType>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT ht.id, ht.organization_id, ht.name, ht.description, ht.created_by,
                    ht.created_at, ht.updated_at
             FROM user_hitl_type uht
             JOIN hitl_type ht ON ht.id = uht.hitl_type_id
             WHERE uht.user_id = ?1 AND uht.organization_id = ?2
               AND uht.deleted_at IS NULL AND ht.deleted_at IS NULL
             ORDER BY ht.name",
        )?;
        let types = stmt
            .query_map(params![user_id, organization_id], Self::map_hitl_type)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(types)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixture {
        db: Database,
        org: i64,
        owner: i64,
    }

    fn setup() -> Fixture {
        let db = Database::open_in_memory().unwrap();
        let org = db.create_organization("Acme").unwrap().id;
        let owner = db.create_user("Olga", "olga@example.com").unwrap().id;
        Fixture { db, org, owner }
    }

    #[test]
    fn test_live_name_is_unique_per_organization() {
        let f = setup();
        let other_org = f.db.create_organization("Other").unwrap().id;
        let now = Utc::now();

        f.db.insert_hitl_type(f.org, f.owner, "soporte", None, now).unwrap();
        let err = f
            .db
            .insert_hitl_type(f.org, f.owner, "soporte", None, now)
            .unwrap_err();
        assert!(err.is_conflict());

        // Same name in another organization is fine
        f.db.insert_hitl_type(other_org, f.owner, "soporte", None, now).unwrap();
    }

    #[test]
    fn test_deleted_name_can_be_reused() {
        let f = setup();
        let now = Utc::now();
        let first = f.db.insert_hitl_type(f.org, f.owner, "soporte", None, now).unwrap();
        f.db.delete_hitl_type(f.org, first.id, now).unwrap();

        assert!(f.db.find_hitl_type(f.org, first.id).unwrap().is_none());
        assert!(f.db.find_hitl_type_by_name(f.org, "soporte").unwrap().is_none());

        let second = f.db.insert_hitl_type(f.org, f.owner, "soporte", None, now).unwrap();
        assert_ne!(first.id, second.id);
    }

    #[test]
    fn test_lookup_is_scoped_by_organization() {
        let f = setup();
        let other_org = f.db.create_organization("Other").unwrap().id;
        let ty = f
            .db
            .insert_hitl_type(f.org, f.owner, "ventas", Some("sales"), Utc::now())
            .unwrap();

        assert!(f.db.find_hitl_type(other_org, ty.id).unwrap().is_none());
        assert!(f.db.list_hitl_types(other_org).unwrap().is_empty());
        assert_eq!(f.db.list_hitl_types(f.org).unwrap().len(), 1);
        assert!(f.db.delete_hitl_type(other_org, ty.id, Utc::now()).unwrap_err().is_not_found());
    }

    #[test]
    fn test_insert_assignments_skips_existing_pairs() {
        let f = setup();
        let now = Utc::now();
        let ty = f.db.insert_hitl_type(f.org, f.owner, "soporte", None, now).unwrap();
        let a = f.db.create_user("A", "a@example.com").unwrap().id;
        let b = f.db.create_user("B", "b@example.com").unwrap().id;

        assert_eq!(f.db.insert_assignments(f.org, ty.id, &[a], now).unwrap(), vec![a]);
        assert_eq!(f.db.insert_assignments(f.org, ty.id, &[a, b], now).unwrap(), vec![b]);
        assert!(f.db.insert_assignments(f.org, ty.id, &[a, b], now).unwrap().is_empty());

        let assigned = f.db.assigned_user_ids(ty.id, &[a, b, 999]).unwrap();
        assert_eq!(assigned, HashSet::from([a, b]));
        assert_eq!(f.db.users_for_hitl_type(ty.id).unwrap().len(), 2);
    }

    #[test]
    fn test_delete_type_soft_deletes_assignments() {
        let f = setup();
        let now = Utc::now();
        let ty = f.db.insert_hitl_type(f.org, f.owner, "soporte", None, now).unwrap();
        let a = f.db.create_user("A", "a@example.com").unwrap().id;
        f.db.insert_assignments(f.org, ty.id, &[a], now).unwrap();

        assert_eq!(f.db.delete_hitl_type(f.org, ty.id, now).unwrap(), 1);
        assert!(f.db.users_for_hitl_type(ty.id).unwrap().is_empty());
        assert!(f.db.hitl_types_for_user(f.org, a).unwrap().is_empty());
    }

    #[test]
    fn test_removed_assignment_can_be_recreated() {
        let f = setup();
        let now = Utc::now();
        let ty = f.db.insert_hitl_type(f.org, f.owner, "soporte", None, now).unwrap();
        let a = f.db.create_user("A", "a@example.com").unwrap().id;

        f.db.insert_assignments(f.org, ty.id, &[a], now).unwrap();
        assert!(f.db.delete_assignment(ty.id, a, now).unwrap());
        assert!(!f.db.delete_assignment(ty.id, a, now).unwrap());
        assert_eq!(f.db.insert_assignments(f.org, ty.id, &[a], now).unwrap(), vec![a]);
    }

    #[test]
    fn test_update_conflicts_with_other_live_name() {
        let f = setup();
        let now = Utc::now();
        f.db.insert_hitl_type(f.org, f.owner, "soporte", None, now).unwrap();
        let ventas = f.db.insert_hitl_type(f.org, f.owner, "ventas", None, now).unwrap();

        let err = f
            .db
            .update_hitl_type(f.org, ventas.id, "soporte", None, now)
            .unwrap_err();
        assert!(err.is_conflict());

        let renamed = f
            .db
            .update_hitl_type(f.org, ventas.id, "ventas", Some("sales team"), now)
            .unwrap();
        assert_eq!(renamed.description.as_deref(), Some("sales team"));
    }
}
