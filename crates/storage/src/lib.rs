#![forbid(unsafe_code)]

mod error;
mod roster;
mod schema;
mod setlist;

pub use error::StoreError;

use rusqlite::{Connection, ErrorCode, Transaction, params};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const DB_FILE_NAME: &str = "worship_team.db";

pub(crate) const SETLIST_COLLECTION: &str = "setlist_entries";
pub(crate) const ROSTER_COLLECTION: &str = "roster_assignments";

/// SQLite-backed persistence gateway for setlists and rosters.
///
/// Every public method is one short transaction. The only multi-row write is
/// [`SqliteStore::setlist_renumber_atomic`]; everything else touches one row.
#[derive(Debug)]
pub struct SqliteStore {
    conn: Connection,
    storage_dir: Option<PathBuf>,
}

impl SqliteStore {
    pub fn open(storage_dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let storage_dir = storage_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&storage_dir)?;

        let conn = Connection::open(storage_dir.join(DB_FILE_NAME))?;
        Self::init(conn, Some(storage_dir))
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?, None)
    }

    fn init(conn: Connection, storage_dir: Option<PathBuf>) -> Result<Self, StoreError> {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;

        schema::preflight_gate(&conn)?;
        schema::install_schema(&conn, now_ms())?;

        Ok(Self { conn, storage_dir })
    }

    pub fn storage_dir(&self) -> Option<&Path> {
        self.storage_dir.as_deref()
    }

    pub fn db_file_name() -> &'static str {
        DB_FILE_NAME
    }
}

fn next_id_tx(tx: &Transaction<'_>, kind: &str) -> Result<i64, StoreError> {
    tx.execute(
        "INSERT INTO id_counters(kind, next_value) VALUES (?1, 1) \
         ON CONFLICT(kind) DO UPDATE SET next_value = next_value + 1",
        params![kind],
    )?;
    Ok(tx.query_row(
        "SELECT next_value FROM id_counters WHERE kind=?1",
        params![kind],
        |row| row.get::<_, i64>(0),
    )?)
}

fn map_write_conflict(err: rusqlite::Error, collection: &'static str) -> StoreError {
    if is_constraint_violation(&err) {
        return StoreError::UniqueViolation { collection };
    }
    StoreError::Sql(err)
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(code, message) => {
            code.code == ErrorCode::ConstraintViolation
                || message.as_deref().is_some_and(|value| {
                    value.contains("UNIQUE constraint failed")
                        || value.contains("PRIMARY KEY constraint failed")
                })
        }
        _ => false,
    }
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis()
        .min(i64::MAX as u128) as i64
}
