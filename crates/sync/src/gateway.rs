#![forbid(unsafe_code)]

//! Narrow persistence interface consumed by the list store and the guard.
//!
//! Each collection offers filtered reads plus single-row insert, update and
//! delete. `setlist_entries` enforces `(service_id, position)` uniqueness;
//! `roster_assignments` enforces nothing.

use crate::error::GatewayError;
use async_trait::async_trait;
use wt_core::ids::{AssignmentId, EntryId, ServiceId};
use wt_core::model::{
    NewRosterAssignment, NewSetlistEntry, RosterAssignment, RosterFilter, SetlistEntry,
    SetlistEntryPatch, SetlistFilter,
};
use wt_core::order::PositionWrite;

pub const SETLIST_ENTRIES: &str = "setlist_entries";
pub const ROSTER_ASSIGNMENTS: &str = "roster_assignments";

#[async_trait]
pub trait SetlistGateway: Send + Sync + 'static {
    async fn find_entries(&self, filter: SetlistFilter) -> Result<Vec<SetlistEntry>, GatewayError>;

    async fn insert_entry(&self, row: NewSetlistEntry) -> Result<SetlistEntry, GatewayError>;

    async fn update_entry(&self, id: &EntryId, patch: SetlistEntryPatch)
    -> Result<(), GatewayError>;

    async fn delete_entry(&self, id: &EntryId) -> Result<(), GatewayError>;

    /// Whether [`SetlistGateway::renumber_atomic`] is implemented.
    fn supports_atomic_renumber(&self) -> bool {
        false
    }

    /// Rewrites every position of one service in a single transaction.
    async fn renumber_atomic(
        &self,
        _service_id: &ServiceId,
        _positions: &[PositionWrite],
    ) -> Result<(), GatewayError> {
        Err(GatewayError::Unsupported("renumber_atomic"))
    }
}

#[async_trait]
pub trait RosterGateway: Send + Sync + 'static {
    async fn find_assignments(
        &self,
        filter: RosterFilter,
    ) -> Result<Vec<RosterAssignment>, GatewayError>;

    async fn insert_assignment(
        &self,
        row: NewRosterAssignment,
    ) -> Result<RosterAssignment, GatewayError>;

    async fn delete_assignment(&self, id: &AssignmentId) -> Result<(), GatewayError>;
}
