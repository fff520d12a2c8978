//! Database migrations
//!
//! SQL migrations are embedded as strings and executed when the database is opened.

use rusqlite::Connection;

use crate::error::Result;

/// Initial schema (001)
pub const INITIAL_SQL: &str = include_str!("001_initial.sql");

/// Run all migrations. Every statement is idempotent.
pub fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    conn.execute_batch(INITIAL_SQL)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_are_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();

        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'
                 AND name IN ('organization', 'user', 'user_organization_role',
                              'chat_session', 'message', 'hitl_type', 'user_hitl_type')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 7);
    }
}
