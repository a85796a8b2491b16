#![forbid(unsafe_code)]

use crate::error::GatewayError;
use crate::gateway::{RosterGateway, SetlistGateway};
use async_trait::async_trait;
use std::sync::{Arc, Mutex, PoisonError};
use wt_core::ids::{AssignmentId, EntryId, ServiceId};
use wt_core::model::{
    NewRosterAssignment, NewSetlistEntry, RosterAssignment, RosterFilter, SetlistEntry,
    SetlistEntryPatch, SetlistFilter,
};
use wt_core::order::PositionWrite;
use wt_storage::{SqliteStore, StoreError};

/// Async gateway over [`SqliteStore`].
///
/// Each call runs on the blocking pool with exclusive access to the
/// connection. The store offers a real transaction, so the atomic renumber
/// capability is advertised.
#[derive(Clone, Debug)]
pub struct SqliteGateway {
    store: Arc<Mutex<SqliteStore>>,
}

impl SqliteGateway {
    pub fn new(store: SqliteStore) -> Self {
        Self {
            store: Arc::new(Mutex::new(store)),
        }
    }

    async fn run<T, F>(&self, id: Option<String>, op: F) -> Result<T, GatewayError>
    where
        T: Send + 'static,
        F: FnOnce(&mut SqliteStore) -> Result<T, StoreError> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        let joined = tokio::task::spawn_blocking(move || {
            let mut store = store.lock().unwrap_or_else(PoisonError::into_inner);
            op(&mut store)
        })
        .await
        .map_err(|err| GatewayError::Network(format!("store task failed: {err}")))?;
        joined.map_err(|err| map_store_error(err, id))
    }
}

fn map_store_error(err: StoreError, id: Option<String>) -> GatewayError {
    match err {
        StoreError::UniqueViolation { collection } => GatewayError::UniqueConstraint { collection },
        StoreError::UnknownId { collection } => GatewayError::NotFound {
            collection,
            id: id.unwrap_or_default(),
        },
        StoreError::InvalidInput(message) => GatewayError::Rejected(message.to_string()),
        other @ (StoreError::Io(_) | StoreError::Sql(_)) => GatewayError::Network(other.to_string()),
    }
}

#[async_trait]
impl SetlistGateway for SqliteGateway {
    async fn find_entries(&self, filter: SetlistFilter) -> Result<Vec<SetlistEntry>, GatewayError> {
        self.run(None, move |store| store.setlist_find(&filter)).await
    }

    async fn insert_entry(&self, row: NewSetlistEntry) -> Result<SetlistEntry, GatewayError> {
        self.run(None, move |store| store.setlist_insert(row)).await
    }

    async fn update_entry(
        &self,
        id: &EntryId,
        patch: SetlistEntryPatch,
    ) -> Result<(), GatewayError> {
        let id = id.clone();
        self.run(Some(id.to_string()), move |store| {
            store.setlist_update(&id, &patch)
        })
        .await
    }

    async fn delete_entry(&self, id: &EntryId) -> Result<(), GatewayError> {
        let id = id.clone();
        self.run(Some(id.to_string()), move |store| store.setlist_delete(&id))
            .await
    }

    fn supports_atomic_renumber(&self) -> bool {
        true
    }

    async fn renumber_atomic(
        &self,
        service_id: &ServiceId,
        positions: &[PositionWrite],
    ) -> Result<(), GatewayError> {
        let service_id = service_id.clone();
        let positions = positions.to_vec();
        self.run(None, move |store| {
            store.setlist_renumber_atomic(&service_id, &positions)
        })
        .await
    }
}

#[async_trait]
impl RosterGateway for SqliteGateway {
    async fn find_assignments(
        &self,
        filter: RosterFilter,
    ) -> Result<Vec<RosterAssignment>, GatewayError> {
        self.run(None, move |store| store.roster_find(&filter)).await
    }

    async fn insert_assignment(
        &self,
        row: NewRosterAssignment,
    ) -> Result<RosterAssignment, GatewayError> {
        self.run(None, move |store| store.roster_insert(row)).await
    }

    async fn delete_assignment(&self, id: &AssignmentId) -> Result<(), GatewayError> {
        let id = id.clone();
        self.run(Some(id.to_string()), move |store| store.roster_delete(&id))
            .await
    }
}
