#![forbid(unsafe_code)]

use super::*;
use rusqlite::OptionalExtension;
use std::collections::{BTreeSet, HashMap};
use wt_core::ids::{EntryId, ServiceId, SongId};
use wt_core::model::{FindOrder, NewSetlistEntry, SetlistEntry, SetlistEntryPatch, SetlistFilter};
use wt_core::order::{PositionWrite, is_contiguous};

struct RawEntryRow {
    id: String,
    service_id: String,
    song_id: String,
    position: i64,
    notes: Option<String>,
}

impl RawEntryRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            service_id: row.get(1)?,
            song_id: row.get(2)?,
            position: row.get(3)?,
            notes: row.get(4)?,
        })
    }

    fn into_entry(self) -> Result<SetlistEntry, StoreError> {
        let invalid = |_| StoreError::InvalidInput("stored setlist row carries an invalid id");
        Ok(SetlistEntry {
            id: EntryId::try_new(self.id).map_err(invalid)?,
            service_id: ServiceId::try_new(self.service_id).map_err(invalid)?,
            song_id: SongId::try_new(self.song_id).map_err(invalid)?,
            position: self.position,
            notes: self.notes,
        })
    }
}

impl SqliteStore {
    pub fn setlist_find(&self, filter: &SetlistFilter) -> Result<Vec<SetlistEntry>, StoreError> {
        let sql = match filter.order {
            FindOrder::ByPosition => {
                "SELECT id, service_id, song_id, position, notes FROM setlist_entries \
                 WHERE service_id=?1 ORDER BY position ASC"
            }
            FindOrder::Unordered => {
                "SELECT id, service_id, song_id, position, notes FROM setlist_entries \
                 WHERE service_id=?1"
            }
        };
        let mut stmt = self.conn.prepare(sql)?;
        let raw = stmt
            .query_map(params![filter.service_id.as_str()], RawEntryRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        raw.into_iter().map(RawEntryRow::into_entry).collect()
    }

    pub fn setlist_insert(&mut self, row: NewSetlistEntry) -> Result<SetlistEntry, StoreError> {
        if row.position <= 0 {
            return Err(StoreError::InvalidInput(
                "setlist position must be positive on insert",
            ));
        }

        let now_ms = now_ms();
        let tx = self.conn.transaction()?;
        let seq = next_id_tx(&tx, SETLIST_COLLECTION)?;
        let id = EntryId::try_new(format!("sle-{seq}"))
            .map_err(|_| StoreError::InvalidInput("generated entry id is invalid"))?;

        tx.execute(
            "INSERT INTO setlist_entries(id, service_id, song_id, position, notes, created_at_ms, updated_at_ms) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
            params![
                id.as_str(),
                row.service_id.as_str(),
                row.song_id.as_str(),
                row.position,
                row.notes.as_deref(),
                now_ms,
            ],
        )
        .map_err(|err| map_write_conflict(err, SETLIST_COLLECTION))?;
        tx.commit()?;

        Ok(SetlistEntry {
            id,
            service_id: row.service_id,
            song_id: row.song_id,
            position: row.position,
            notes: row.notes,
        })
    }

    pub fn setlist_update(
        &mut self,
        id: &EntryId,
        patch: &SetlistEntryPatch,
    ) -> Result<(), StoreError> {
        let now_ms = now_ms();
        let tx = self.conn.transaction()?;

        let exists = tx
            .query_row(
                "SELECT 1 FROM setlist_entries WHERE id=?1",
                params![id.as_str()],
                |row| row.get::<_, i64>(0),
            )
            .optional()?
            .is_some();
        if !exists {
            return Err(StoreError::UnknownId {
                collection: SETLIST_COLLECTION,
            });
        }
        if patch.is_empty() {
            return Ok(());
        }

        if let Some(position) = patch.position {
            tx.execute(
                "UPDATE setlist_entries SET position=?2, updated_at_ms=?3 WHERE id=?1",
                params![id.as_str(), position, now_ms],
            )
            .map_err(|err| map_write_conflict(err, SETLIST_COLLECTION))?;
        }
        if let Some(notes) = patch.notes.as_ref() {
            tx.execute(
                "UPDATE setlist_entries SET notes=?2, updated_at_ms=?3 WHERE id=?1",
                params![id.as_str(), notes.as_deref(), now_ms],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    pub fn setlist_delete(&mut self, id: &EntryId) -> Result<(), StoreError> {
        let deleted = self.conn.execute(
            "DELETE FROM setlist_entries WHERE id=?1",
            params![id.as_str()],
        )?;
        if deleted == 0 {
            return Err(StoreError::UnknownId {
                collection: SETLIST_COLLECTION,
            });
        }
        Ok(())
    }

    /// Rewrites every position of one service inside a single transaction.
    ///
    /// `positions` must name each row of the service exactly once and the
    /// targets must be exactly `{1..N}`. Rows are removed and re-inserted
    /// with their final positions, so no placeholder value is ever written
    /// and readers observe either the old order or the new one.
    pub fn setlist_renumber_atomic(
        &mut self,
        service_id: &ServiceId,
        positions: &[PositionWrite],
    ) -> Result<(), StoreError> {
        if !is_contiguous(positions.iter().map(|write| write.position)) {
            return Err(StoreError::InvalidInput(
                "renumber targets must be exactly 1..N",
            ));
        }

        let now_ms = now_ms();
        let tx = self.conn.transaction()?;

        let mut existing: HashMap<String, (String, Option<String>, i64)> = HashMap::new();
        {
            let mut stmt = tx.prepare(
                "SELECT id, song_id, notes, created_at_ms FROM setlist_entries WHERE service_id=?1",
            )?;
            let mut rows = stmt.query(params![service_id.as_str()])?;
            while let Some(row) = rows.next()? {
                existing.insert(row.get(0)?, (row.get(1)?, row.get(2)?, row.get(3)?));
            }
        }

        let requested: BTreeSet<&str> = positions
            .iter()
            .map(|write| write.entry_id.as_str())
            .collect();
        if requested.len() != positions.len() || requested.len() != existing.len() {
            return Err(StoreError::InvalidInput(
                "renumber must cover every row of the service exactly once",
            ));
        }
        if requested.iter().any(|id| !existing.contains_key(*id)) {
            return Err(StoreError::UnknownId {
                collection: SETLIST_COLLECTION,
            });
        }

        tx.execute(
            "DELETE FROM setlist_entries WHERE service_id=?1",
            params![service_id.as_str()],
        )?;
        for write in positions {
            let Some((song_id, notes, created_at_ms)) = existing.get(write.entry_id.as_str())
            else {
                continue;
            };
            tx.execute(
                "INSERT INTO setlist_entries(id, service_id, song_id, position, notes, created_at_ms, updated_at_ms) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    write.entry_id.as_str(),
                    service_id.as_str(),
                    song_id,
                    write.position,
                    notes.as_deref(),
                    created_at_ms,
                    now_ms,
                ],
            )
            .map_err(|err| map_write_conflict(err, SETLIST_COLLECTION))?;
        }

        tx.commit()?;
        Ok(())
    }
}
