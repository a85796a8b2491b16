#![forbid(unsafe_code)]

use crate::error::GatewayError;
use crate::gateway::{ROSTER_ASSIGNMENTS, RosterGateway, SETLIST_ENTRIES, SetlistGateway};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use wt_core::ids::{AssignmentId, EntryId, ServiceId};
use wt_core::model::{
    FindOrder, NewRosterAssignment, NewSetlistEntry, RosterAssignment, RosterFilter,
    SetlistEntry, SetlistEntryPatch, SetlistFilter,
};
use wt_core::order::{PositionWrite, is_contiguous};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WriteKind {
    SetlistInsert { position: i64 },
    SetlistUpdate { id: EntryId, position: Option<i64> },
    SetlistDelete { id: EntryId },
    SetlistRenumber { service_id: ServiceId },
    RosterInsert,
    RosterDelete { id: AssignmentId },
}

/// One attempted write, accepted or not.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WriteRecord {
    pub kind: WriteKind,
    pub accepted: bool,
}

#[derive(Debug, Default)]
struct MemoryState {
    setlist: BTreeMap<EntryId, SetlistEntry>,
    roster: BTreeMap<u64, RosterAssignment>,
    next_entry: u64,
    next_assignment: u64,
    log: Vec<WriteRecord>,
}

impl MemoryState {
    fn position_taken(&self, service_id: &ServiceId, position: i64, except: Option<&EntryId>) -> bool {
        self.setlist.values().any(|row| {
            &row.service_id == service_id
                && row.position == position
                && except.is_none_or(|id| id != &row.id)
        })
    }

    fn record<T>(&mut self, kind: WriteKind, result: Result<T, GatewayError>) -> Result<T, GatewayError> {
        self.log.push(WriteRecord {
            kind,
            accepted: result.is_ok(),
        });
        result
    }
}

/// In-process gateway with the same constraints as the real store.
///
/// Setlist rows are unique on `(service_id, position)`; roster rows are not.
/// Every attempted write is logged so callers can count round trips.
#[derive(Debug, Default)]
pub struct MemoryGateway {
    state: Mutex<MemoryState>,
    atomic_renumber: bool,
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advertise the single-transaction renumber capability.
    pub fn with_atomic_renumber(mut self, enabled: bool) -> Self {
        self.atomic_renumber = enabled;
        self
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn writes(&self) -> Vec<WriteRecord> {
        self.state().log.clone()
    }

    pub fn write_count(&self) -> usize {
        self.state().log.len()
    }

    pub fn clear_writes(&self) {
        self.state().log.clear();
    }

    /// Rows of one service ordered by position, placeholders first.
    pub fn setlist_rows(&self, service_id: &ServiceId) -> Vec<SetlistEntry> {
        let mut rows: Vec<SetlistEntry> = self
            .state()
            .setlist
            .values()
            .filter(|row| &row.service_id == service_id)
            .cloned()
            .collect();
        rows.sort_by_key(|row| row.position);
        rows
    }

    pub fn roster_rows(&self) -> Vec<RosterAssignment> {
        self.state().roster.values().cloned().collect()
    }
}

#[async_trait]
impl SetlistGateway for MemoryGateway {
    async fn find_entries(&self, filter: SetlistFilter) -> Result<Vec<SetlistEntry>, GatewayError> {
        let state = self.state();
        let mut rows: Vec<SetlistEntry> = state
            .setlist
            .values()
            .filter(|row| row.service_id == filter.service_id)
            .cloned()
            .collect();
        if filter.order == FindOrder::ByPosition {
            rows.sort_by_key(|row| row.position);
        }
        Ok(rows)
    }

    async fn insert_entry(&self, row: NewSetlistEntry) -> Result<SetlistEntry, GatewayError> {
        let mut state = self.state();
        let kind = WriteKind::SetlistInsert {
            position: row.position,
        };
        if state.position_taken(&row.service_id, row.position, None) {
            return state.record(
                kind,
                Err(GatewayError::UniqueConstraint {
                    collection: SETLIST_ENTRIES,
                }),
            );
        }

        state.next_entry += 1;
        let id = EntryId::try_new(format!("mem-sle-{}", state.next_entry))
            .map_err(|err| GatewayError::Network(err.message().to_string()))?;
        let entry = SetlistEntry {
            id: id.clone(),
            service_id: row.service_id,
            song_id: row.song_id,
            position: row.position,
            notes: row.notes,
        };
        state.setlist.insert(id, entry.clone());
        state.record(kind, Ok(entry))
    }

    async fn update_entry(
        &self,
        id: &EntryId,
        patch: SetlistEntryPatch,
    ) -> Result<(), GatewayError> {
        let mut state = self.state();
        let kind = WriteKind::SetlistUpdate {
            id: id.clone(),
            position: patch.position,
        };
        let Some(service_id) = state.setlist.get(id).map(|row| row.service_id.clone()) else {
            return state.record(
                kind,
                Err(GatewayError::NotFound {
                    collection: SETLIST_ENTRIES,
                    id: id.to_string(),
                }),
            );
        };
        let collides = patch
            .position
            .is_some_and(|position| state.position_taken(&service_id, position, Some(id)));
        if collides {
            return state.record(
                kind,
                Err(GatewayError::UniqueConstraint {
                    collection: SETLIST_ENTRIES,
                }),
            );
        }

        if let Some(row) = state.setlist.get_mut(id) {
            if let Some(position) = patch.position {
                row.position = position;
            }
            if let Some(notes) = patch.notes {
                row.notes = notes;
            }
        }
        state.record(kind, Ok(()))
    }

    async fn delete_entry(&self, id: &EntryId) -> Result<(), GatewayError> {
        let mut state = self.state();
        let result = match state.setlist.remove(id) {
            Some(_) => Ok(()),
            None => Err(GatewayError::NotFound {
                collection: SETLIST_ENTRIES,
                id: id.to_string(),
            }),
        };
        state.record(WriteKind::SetlistDelete { id: id.clone() }, result)
    }

    fn supports_atomic_renumber(&self) -> bool {
        self.atomic_renumber
    }

    async fn renumber_atomic(
        &self,
        service_id: &ServiceId,
        positions: &[PositionWrite],
    ) -> Result<(), GatewayError> {
        if !self.atomic_renumber {
            return Err(GatewayError::Unsupported("renumber_atomic"));
        }
        let mut state = self.state();
        let kind = WriteKind::SetlistRenumber {
            service_id: service_id.clone(),
        };
        let row_count = state
            .setlist
            .values()
            .filter(|row| &row.service_id == service_id)
            .count();
        let distinct: BTreeSet<&EntryId> = positions.iter().map(|write| &write.entry_id).collect();
        let covers_service = positions.len() == row_count
            && distinct.len() == row_count
            && positions.iter().all(|write| {
                state
                    .setlist
                    .get(&write.entry_id)
                    .is_some_and(|row| &row.service_id == service_id)
            });
        if !is_contiguous(positions.iter().map(|write| write.position)) {
            return state.record(
                kind,
                Err(GatewayError::Rejected(
                    "renumber targets must be exactly 1..N".to_string(),
                )),
            );
        }
        if !covers_service {
            return state.record(
                kind,
                Err(GatewayError::Rejected(
                    "renumber must cover every row of the service exactly once".to_string(),
                )),
            );
        }

        for write in positions {
            if let Some(row) = state.setlist.get_mut(&write.entry_id) {
                row.position = write.position;
            }
        }
        state.record(kind, Ok(()))
    }
}

#[async_trait]
impl RosterGateway for MemoryGateway {
    async fn find_assignments(
        &self,
        filter: RosterFilter,
    ) -> Result<Vec<RosterAssignment>, GatewayError> {
        Ok(self
            .state()
            .roster
            .values()
            .filter(|row| filter.matches(row))
            .cloned()
            .collect())
    }

    async fn insert_assignment(
        &self,
        row: NewRosterAssignment,
    ) -> Result<RosterAssignment, GatewayError> {
        let mut state = self.state();
        state.next_assignment += 1;
        let seq = state.next_assignment;
        let id = AssignmentId::try_new(format!("mem-ra-{seq}"))
            .map_err(|err| GatewayError::Network(err.message().to_string()))?;
        let assignment = RosterAssignment {
            id,
            service_id: row.service_id,
            volunteer_id: row.volunteer_id,
            instrument_id: row.instrument_id,
        };
        state.roster.insert(seq, assignment.clone());
        state.record(WriteKind::RosterInsert, Ok(assignment))
    }

    async fn delete_assignment(&self, id: &AssignmentId) -> Result<(), GatewayError> {
        let mut state = self.state();
        let key = state
            .roster
            .iter()
            .find(|(_, row)| &row.id == id)
            .map(|(key, _)| *key);
        let result = match key.and_then(|key| state.roster.remove(&key)) {
            Some(_) => Ok(()),
            None => Err(GatewayError::NotFound {
                collection: ROSTER_ASSIGNMENTS,
                id: id.to_string(),
            }),
        };
        state.record(WriteKind::RosterDelete { id: id.clone() }, result)
    }
}
