#![forbid(unsafe_code)]

use super::StoreError;
use rusqlite::{Connection, OptionalExtension, params};
use std::collections::BTreeSet;

pub(crate) const SCHEMA_VERSION: i64 = 1;

const REQUIRED_TABLES: [&str; 4] = [
    "store_state",
    "id_counters",
    "setlist_entries",
    "roster_assignments",
];

fn existing_tables(conn: &Connection) -> Result<BTreeSet<String>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%'",
    )?;
    let names = stmt.query_map([], |row| row.get::<_, String>(0))?;
    Ok(names.collect::<Result<_, _>>()?)
}

/// Why an existing table set cannot be opened, if it cannot.
fn table_set_mismatch(tables: &BTreeSet<String>) -> Option<&'static str> {
    let foreign = tables
        .iter()
        .any(|table| !REQUIRED_TABLES.contains(&table.as_str()));
    let missing = REQUIRED_TABLES
        .iter()
        .any(|table| !tables.contains(*table));
    match (foreign, missing) {
        (true, _) => Some("RESET_REQUIRED: unsupported tables detected"),
        (false, true) => Some("RESET_REQUIRED: required table is missing"),
        (false, false) => None,
    }
}

/// Opens only a fresh database or one written by this exact schema version.
pub(crate) fn preflight_gate(conn: &Connection) -> Result<(), StoreError> {
    let tables = existing_tables(conn)?;
    if tables.is_empty() {
        return Ok(());
    }
    if let Some(reason) = table_set_mismatch(&tables) {
        return Err(StoreError::InvalidInput(reason));
    }

    let version: Option<i64> = conn
        .query_row(
            "SELECT schema_version FROM store_state WHERE singleton=1",
            [],
            |row| row.get(0),
        )
        .optional()?;
    match version {
        Some(SCHEMA_VERSION) => Ok(()),
        Some(_) => Err(StoreError::InvalidInput(
            "RESET_REQUIRED: schema version mismatch",
        )),
        None => Err(StoreError::InvalidInput(
            "RESET_REQUIRED: schema state row is missing",
        )),
    }
}

pub(crate) fn install_schema(conn: &Connection, now_ms: i64) -> Result<(), StoreError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS store_state (
          singleton INTEGER PRIMARY KEY CHECK(singleton = 1),
          schema_version INTEGER NOT NULL,
          created_at_ms INTEGER NOT NULL,
          updated_at_ms INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS id_counters (
          kind TEXT PRIMARY KEY,
          next_value INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS setlist_entries (
          id TEXT PRIMARY KEY,
          service_id TEXT NOT NULL,
          song_id TEXT NOT NULL,
          position INTEGER NOT NULL,
          notes TEXT,
          created_at_ms INTEGER NOT NULL,
          updated_at_ms INTEGER NOT NULL,
          UNIQUE(service_id, position)
        );

        CREATE TABLE IF NOT EXISTS roster_assignments (
          id TEXT PRIMARY KEY,
          service_id TEXT NOT NULL,
          volunteer_id TEXT NOT NULL,
          instrument_id TEXT NOT NULL,
          created_at_ms INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_roster_assignments_service
          ON roster_assignments(service_id, volunteer_id);
        "#,
    )?;

    conn.execute(
        "INSERT INTO store_state(singleton, schema_version, created_at_ms, updated_at_ms) \
         VALUES (1, ?1, ?2, ?2) \
         ON CONFLICT(singleton) DO UPDATE SET schema_version=excluded.schema_version, updated_at_ms=excluded.updated_at_ms",
        params![SCHEMA_VERSION, now_ms],
    )?;

    Ok(())
}
