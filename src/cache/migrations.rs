//! Schema migrations for the durable store
//!
//! Migrations are applied in ascending version order, one transaction each,
//! and every applied version is recorded in `schema_version`. A failing
//! migration rolls back alone: the store stays at the last version that
//! committed and the failure is reported to the caller.

use rusqlite::Connection;
use tracing::{debug, info};

/// A single schema step.
#[derive(Debug, Clone, Copy)]
pub struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// The store schema, oldest first.
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "persistent entries",
        sql: "CREATE TABLE IF NOT EXISTS persistent_entries (
                target TEXT PRIMARY KEY NOT NULL,
                payload BLOB NOT NULL
            );",
    },
    Migration {
        version: 2,
        description: "cached messages",
        sql: "CREATE TABLE IF NOT EXISTS cachemessages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                message BLOB NOT NULL,
                expiry DATETIME
            );",
    },
    Migration {
        version: 3,
        description: "cached message expiry index",
        sql: "CREATE INDEX IF NOT EXISTS idx_cachemessages_expiry ON cachemessages(expiry);",
    },
];

/// Why a migration run stopped.
#[derive(Debug)]
pub struct MigrationFailure {
    /// Version that failed, 0 when the version table itself could not be read
    pub version: u32,
    pub source: rusqlite::Error,
}

fn ensure_version_table(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY NOT NULL,
            applied_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
        )",
        [],
    )?;
    Ok(())
}

/// Highest applied version, 0 for a fresh store.
pub fn current_version(conn: &Connection) -> rusqlite::Result<u32> {
    ensure_version_table(conn)?;
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )
}

/// Apply every migration newer than the current version.
///
/// Returns the resulting schema version.
pub fn apply(conn: &mut Connection, migrations: &[Migration]) -> Result<u32, MigrationFailure> {
    let mut version = current_version(conn).map_err(|source| MigrationFailure {
        version: 0,
        source,
    })?;

    let mut pending = migrations
        .iter()
        .filter(|m| m.version > version)
        .collect::<Vec<_>>();
    pending.sort_by_key(|m| m.version);

    if pending.is_empty() {
        debug!(version, "Durable store schema is up to date");
        return Ok(version);
    }

    for migration in pending {
        let step = |conn: &mut Connection| -> rusqlite::Result<()> {
            let tx = conn.transaction()?;
            tx.execute_batch(migration.sql)?;
            tx.execute(
                "INSERT INTO schema_version (version) VALUES (?1)",
                [migration.version],
            )?;
            tx.commit()
        };

        step(conn).map_err(|source| MigrationFailure {
            version: migration.version,
            source,
        })?;

        version = migration.version;
        info!(
            version,
            description = migration.description,
            "Applied durable store migration"
        );
    }

    Ok(version)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_exists(conn: &Connection, name: &str) -> bool {
        conn.query_row(
            "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [name],
            |row| row.get(0),
        )
        .unwrap()
    }

    #[test]
    fn fresh_store_reaches_latest_version() {
        let mut conn = Connection::open_in_memory().unwrap();

        let version = apply(&mut conn, MIGRATIONS).unwrap();

        assert_eq!(version, 3);
        assert!(table_exists(&conn, "persistent_entries"));
        assert!(table_exists(&conn, "cachemessages"));
    }

    #[test]
    fn reapplying_is_a_no_op() {
        let mut conn = Connection::open_in_memory().unwrap();
        apply(&mut conn, MIGRATIONS).unwrap();

        let version = apply(&mut conn, MIGRATIONS).unwrap();

        assert_eq!(version, 3);
        let rows: u32 = conn
            .query_row("SELECT COUNT(*) FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(rows, 3);
    }

    #[test]
    fn failing_migration_leaves_last_good_version() {
        let mut conn = Connection::open_in_memory().unwrap();
        let broken = [
            MIGRATIONS[0],
            Migration {
                version: 2,
                description: "broken",
                sql: "CREATE TABLE half_done (id INTEGER); THIS IS NOT SQL;",
            },
            MIGRATIONS[2],
        ];

        let failure = apply(&mut conn, &broken).unwrap_err();

        assert_eq!(failure.version, 2);
        assert_eq!(current_version(&conn).unwrap(), 1);
        assert!(!table_exists(&conn, "half_done"));
    }

    #[test]
    fn migrations_are_applied_in_ascending_order() {
        let mut conn = Connection::open_in_memory().unwrap();
        let shuffled = [MIGRATIONS[2], MIGRATIONS[0], MIGRATIONS[1]];

        assert_eq!(apply(&mut conn, &shuffled).unwrap(), 3);
    }
}
