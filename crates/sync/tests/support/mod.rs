#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use wt_core::ids::{AssignmentId, EntryId, InstrumentId, ServiceId, SongId, VolunteerId};
use wt_core::model::{
    NewRosterAssignment, NewSetlistEntry, RosterAssignment, RosterFilter, SetlistEntry,
    SetlistEntryPatch, SetlistFilter,
};
use wt_core::order::PositionWrite;
use wt_sync::{GatewayError, MemoryGateway, RosterGateway, SetlistGateway, SyncConfig};

pub fn svc(id: &str) -> ServiceId {
    ServiceId::try_new(id).expect("service id")
}

pub fn volunteer(id: &str) -> VolunteerId {
    VolunteerId::try_new(id).expect("volunteer id")
}

pub fn instrument(id: &str) -> InstrumentId {
    InstrumentId::try_new(id).expect("instrument id")
}

pub fn song(id: &str) -> SongId {
    SongId::try_new(id).expect("song id")
}

pub fn fast_config() -> SyncConfig {
    SyncConfig {
        commit_timeout_ms: 200,
        ..SyncConfig::default()
    }
}

/// Inserts `songs` at positions 1..N and clears the write log.
pub async fn seed<G: SetlistGateway + ?Sized>(
    gateway: &G,
    service_id: &ServiceId,
    songs: &[&str],
) -> Vec<SetlistEntry> {
    let mut rows = Vec::new();
    for (index, name) in songs.iter().enumerate() {
        let row = gateway
            .insert_entry(NewSetlistEntry {
                service_id: service_id.clone(),
                song_id: song(name),
                position: index as i64 + 1,
                notes: None,
            })
            .await
            .expect("seed insert");
        rows.push(row);
    }
    rows
}

pub fn song_order(entries: &[SetlistEntry]) -> Vec<(String, i64)> {
    entries
        .iter()
        .map(|entry| (entry.song_id.as_str().to_string(), entry.position))
        .collect()
}

pub fn pairs(values: &[(&str, i64)]) -> Vec<(String, i64)> {
    values
        .iter()
        .map(|(name, position)| (name.to_string(), *position))
        .collect()
}

/// Holds one write until released, and reports when it got there.
#[derive(Default)]
pub struct WriteGate {
    pub entered: Notify,
    pub release: Notify,
}

/// Memory gateway with switchable faults.
#[derive(Default)]
pub struct FlakyGateway {
    pub inner: MemoryGateway,
    /// Every update that writes a positive position fails.
    pub fail_final_writes: AtomicBool,
    /// Placeholder (non-positive) writes allowed before the next one fails.
    pub placeholder_budget: Mutex<Option<usize>>,
    pub fail_setlist_delete: AtomicBool,
    pub fail_roster_insert: AtomicBool,
    pub fail_roster_delete: AtomicBool,
    /// Inserts land in the store but their answer never arrives.
    pub lose_acks: AtomicBool,
    /// Updates never answer.
    pub stall_updates: AtomicBool,
    pub gate: Mutex<Option<Arc<WriteGate>>>,
    pub update_calls: AtomicUsize,
}

impl FlakyGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn install_gate(&self) -> Arc<WriteGate> {
        let gate = Arc::new(WriteGate::default());
        *self.gate.lock().unwrap() = Some(Arc::clone(&gate));
        gate
    }

    fn network(what: &str) -> GatewayError {
        GatewayError::Network(format!("injected failure: {what}"))
    }

    async fn maybe_lose_ack(&self) {
        if self.lose_acks.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
    }
}

#[async_trait]
impl SetlistGateway for FlakyGateway {
    async fn find_entries(&self, filter: SetlistFilter) -> Result<Vec<SetlistEntry>, GatewayError> {
        self.inner.find_entries(filter).await
    }

    async fn insert_entry(&self, row: NewSetlistEntry) -> Result<SetlistEntry, GatewayError> {
        let created = self.inner.insert_entry(row).await?;
        self.maybe_lose_ack().await;
        Ok(created)
    }

    async fn update_entry(
        &self,
        id: &EntryId,
        patch: SetlistEntryPatch,
    ) -> Result<(), GatewayError> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);

        let gate = self.gate.lock().unwrap().take();
        if let Some(gate) = gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }
        if self.stall_updates.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }

        let position = patch.position.unwrap_or_default();
        if position > 0 && self.fail_final_writes.load(Ordering::SeqCst) {
            return Err(Self::network("final write"));
        }
        if position <= 0 {
            let mut budget = self.placeholder_budget.lock().unwrap();
            if let Some(left) = budget.as_mut() {
                if *left == 0 {
                    return Err(Self::network("placeholder write"));
                }
                *left -= 1;
            }
        }
        self.inner.update_entry(id, patch).await
    }

    async fn delete_entry(&self, id: &EntryId) -> Result<(), GatewayError> {
        if self.fail_setlist_delete.load(Ordering::SeqCst) {
            return Err(GatewayError::Rejected("injected failure: setlist delete".into()));
        }
        self.inner.delete_entry(id).await
    }
}

#[async_trait]
impl RosterGateway for FlakyGateway {
    async fn find_assignments(
        &self,
        filter: RosterFilter,
    ) -> Result<Vec<RosterAssignment>, GatewayError> {
        self.inner.find_assignments(filter).await
    }

    async fn insert_assignment(
        &self,
        row: NewRosterAssignment,
    ) -> Result<RosterAssignment, GatewayError> {
        if self.fail_roster_insert.load(Ordering::SeqCst) {
            return Err(Self::network("roster insert"));
        }
        let created = self.inner.insert_assignment(row).await?;
        self.maybe_lose_ack().await;
        Ok(created)
    }

    async fn delete_assignment(&self, id: &AssignmentId) -> Result<(), GatewayError> {
        if self.fail_roster_delete.load(Ordering::SeqCst) {
            return Err(Self::network("roster delete"));
        }
        self.inner.delete_assignment(id).await
    }
}

/// Exists so tests can name the trait default explicitly.
pub async fn renumber_unsupported<G: SetlistGateway>(gateway: &G, service_id: &ServiceId) -> GatewayError {
    gateway
        .renumber_atomic(service_id, &Vec::<PositionWrite>::new())
        .await
        .expect_err("default renumber_atomic is unsupported")
}
