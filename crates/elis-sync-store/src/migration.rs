//! Database schema migrations for SQLite.
//!
//! We use a simple versioned migration system. Each migration is a SQL string
//! that transforms the schema from version N to N+1.

use rusqlite::Connection;

use elis_sync_core::now_millis;

use crate::error::{Result, StoreError};

/// Current schema version.
pub const CURRENT_VERSION: u32 = 2;

/// Name of the sequence counter row for failed events.
pub const FAILED_EVENT_SEQUENCE: &str = "failed_events";

/// Initialize or migrate the database schema.
///
/// This function is idempotent - it can be called multiple times safely.
pub fn migrate(conn: &mut Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL
        )",
        [],
    )?;

    let current: u32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |row| row.get(0),
    )?;

    if current < CURRENT_VERSION {
        let tx = conn.transaction()?;

        for version in (current + 1)..=CURRENT_VERSION {
            apply_migration(&tx, version)?;

            tx.execute(
                "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
                rusqlite::params![version, now_millis()],
            )?;
            tracing::debug!(version, "applied schema migration");
        }

        tx.commit()?;
    }

    Ok(())
}

/// Apply a specific migration version.
fn apply_migration(conn: &Connection, version: u32) -> Result<()> {
    match version {
        1 => apply_v1(conn),
        2 => apply_v2(conn),
        _ => Err(StoreError::Migration(format!(
            "unknown migration version: {}",
            version
        ))),
    }
}

/// Migration v1: Initial schema.
fn apply_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        -- One row per unresolved failed event
        CREATE TABLE failed_events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,  -- never reused
            sequence_number INTEGER NOT NULL UNIQUE,  -- FIFO position, immutable
            event_type TEXT NOT NULL,           -- patient | test_order | lab_test
            dedup_key TEXT NOT NULL,            -- derived from subject
            subject TEXT NOT NULL,              -- SubjectRef as JSON
            owner_id INTEGER NOT NULL,          -- owning patient/order/product id
            payload TEXT NOT NULL,              -- exact JSON body
            error_message TEXT NOT NULL,
            error_kind TEXT NOT NULL,           -- connection | timeout | http | subject_missing | unclassified
            http_status INTEGER,                -- set when error_kind = http
            retry_count INTEGER NOT NULL DEFAULT 0,
            state TEXT NOT NULL,                -- pending | retrying | failed
            last_retry_at INTEGER,
            next_retry_at INTEGER,              -- NULL = eligible immediately
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            revision INTEGER NOT NULL DEFAULT 1
        );

        -- Sequence allocation by atomic increment
        CREATE TABLE sequence_counter (
            name TEXT PRIMARY KEY,
            value INTEGER NOT NULL
        );
        INSERT INTO sequence_counter (name, value) VALUES ('failed_events', 0);

        -- At most one unresolved event per subject
        CREATE UNIQUE INDEX idx_failed_events_dedup
            ON failed_events(event_type, dedup_key)
            WHERE state IN ('pending', 'retrying', 'failed');

        -- Indexes for common queries
        CREATE INDEX idx_failed_events_due ON failed_events(state, next_retry_at);
        CREATE INDEX idx_failed_events_fifo ON failed_events(sequence_number, created_at);
        CREATE INDEX idx_failed_events_owner ON failed_events(event_type, owner_id);
        "#,
    )?;

    Ok(())
}

/// Migration v2: remember that a newer failure arrived mid-attempt, so the
/// event stays claimed until that attempt completes.
fn apply_v2(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "ALTER TABLE failed_events
            ADD COLUMN refreshed_in_flight INTEGER NOT NULL DEFAULT 0;",
    )?;

    Ok(())
}
