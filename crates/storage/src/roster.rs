#![forbid(unsafe_code)]

use super::*;
use wt_core::ids::{AssignmentId, InstrumentId, ServiceId, VolunteerId};
use wt_core::model::{NewRosterAssignment, RosterAssignment, RosterFilter};

impl SqliteStore {
    pub fn roster_find(&self, filter: &RosterFilter) -> Result<Vec<RosterAssignment>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, service_id, volunteer_id, instrument_id FROM roster_assignments \
             WHERE (?1 IS NULL OR service_id=?1) AND (?2 IS NULL OR volunteer_id=?2) \
             ORDER BY created_at_ms ASC, id ASC",
        )?;
        let raw = stmt
            .query_map(
                params![
                    filter.service_id.as_ref().map(ServiceId::as_str),
                    filter.volunteer_id.as_ref().map(VolunteerId::as_str),
                ],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )?
            .collect::<Result<Vec<_>, _>>()?;

        let invalid = |_| StoreError::InvalidInput("stored roster row carries an invalid id");
        raw.into_iter()
            .map(|(id, service_id, volunteer_id, instrument_id)| {
                Ok(RosterAssignment {
                    id: AssignmentId::try_new(id).map_err(invalid)?,
                    service_id: ServiceId::try_new(service_id).map_err(invalid)?,
                    volunteer_id: VolunteerId::try_new(volunteer_id).map_err(invalid)?,
                    instrument_id: InstrumentId::try_new(instrument_id).map_err(invalid)?,
                })
            })
            .collect()
    }

    /// Inserts without any uniqueness check on the instrument; exclusivity
    /// is the caller's job.
    pub fn roster_insert(
        &mut self,
        row: NewRosterAssignment,
    ) -> Result<RosterAssignment, StoreError> {
        let now_ms = now_ms();
        let tx = self.conn.transaction()?;
        let seq = next_id_tx(&tx, ROSTER_COLLECTION)?;
        let id = AssignmentId::try_new(format!("ra-{seq}"))
            .map_err(|_| StoreError::InvalidInput("generated assignment id is invalid"))?;

        tx.execute(
            "INSERT INTO roster_assignments(id, service_id, volunteer_id, instrument_id, created_at_ms) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                id.as_str(),
                row.service_id.as_str(),
                row.volunteer_id.as_str(),
                row.instrument_id.as_str(),
                now_ms,
            ],
        )
        .map_err(|err| map_write_conflict(err, ROSTER_COLLECTION))?;
        tx.commit()?;

        Ok(RosterAssignment {
            id,
            service_id: row.service_id,
            volunteer_id: row.volunteer_id,
            instrument_id: row.instrument_id,
        })
    }

    pub fn roster_delete(&mut self, id: &AssignmentId) -> Result<(), StoreError> {
        let deleted = self.conn.execute(
            "DELETE FROM roster_assignments WHERE id=?1",
            params![id.as_str()],
        )?;
        if deleted == 0 {
            return Err(StoreError::UnknownId {
                collection: ROSTER_COLLECTION,
            });
        }
        Ok(())
    }
}
