#![forbid(unsafe_code)]

//! Client-side exclusivity of instruments across every loaded roster.
//!
//! The roster collection has no uniqueness constraint, so this pool is the
//! only thing standing between two volunteers and the same instrument. Its
//! scope is "services whose roster has been loaded into this guard", not
//! every service in the store.
//!
//! Mutations are serialized by an async gate so an availability check and
//! the insert that follows it cannot interleave with another assignment.
//! The pool itself only changes after the store has confirmed a write.
//!
//! A write whose outcome is unknown (timeout, transport failure) is followed
//! by a fetch of that service's roster under the same gate. Until such a
//! fetch succeeds, an unconfirmed insert keeps its instrument claimed.

use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::gateway::RosterGateway;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use wt_core::ids::{AssignmentId, InstrumentId, ServiceId, VolunteerId};
use wt_core::model::{NewRosterAssignment, RosterAssignment, RosterFilter};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LoadReport {
    /// Assignments now held for the service.
    pub merged: usize,
    /// Assignments of the same service that the fetch replaced.
    pub replaced: usize,
    /// Instruments that stored data already assigns more than once.
    pub conflicts: Vec<InstrumentId>,
}

#[derive(Debug, Default)]
struct AssignmentPool {
    rows: BTreeMap<AssignmentId, RosterAssignment>,
    by_instrument: HashMap<InstrumentId, BTreeSet<AssignmentId>>,
    services: BTreeSet<ServiceId>,
    /// Inserts sent without an answer, keyed by instrument.
    unconfirmed: HashMap<InstrumentId, (ServiceId, VolunteerId)>,
}

impl AssignmentPool {
    fn insert(&mut self, row: RosterAssignment) {
        self.by_instrument
            .entry(row.instrument_id.clone())
            .or_default()
            .insert(row.id.clone());
        self.rows.insert(row.id.clone(), row);
    }

    fn remove(&mut self, id: &AssignmentId) -> Option<RosterAssignment> {
        let row = self.rows.remove(id)?;
        if let Some(ids) = self.by_instrument.get_mut(&row.instrument_id) {
            ids.remove(id);
            if ids.is_empty() {
                self.by_instrument.remove(&row.instrument_id);
            }
        }
        Some(row)
    }

    fn claimant(&self, instrument_id: &InstrumentId) -> Option<&VolunteerId> {
        self.holder(instrument_id)
            .map(|row| &row.volunteer_id)
            .or_else(|| self.unconfirmed.get(instrument_id).map(|(_, volunteer_id)| volunteer_id))
    }

    fn holder(&self, instrument_id: &InstrumentId) -> Option<&RosterAssignment> {
        self.by_instrument
            .get(instrument_id)
            .and_then(|ids| ids.iter().next())
            .and_then(|id| self.rows.get(id))
    }

    fn find(&self, volunteer_id: &VolunteerId, instrument_id: &InstrumentId) -> Option<&RosterAssignment> {
        self.by_instrument
            .get(instrument_id)?
            .iter()
            .filter_map(|id| self.rows.get(id))
            .find(|row| &row.volunteer_id == volunteer_id)
    }

    fn replace_service(&mut self, service_id: &ServiceId, rows: Vec<RosterAssignment>) -> LoadReport {
        let stale: Vec<AssignmentId> = self
            .rows
            .values()
            .filter(|row| &row.service_id == service_id)
            .map(|row| row.id.clone())
            .collect();
        for id in &stale {
            self.remove(id);
        }
        self.unconfirmed
            .retain(|_, (claimed_for, _)| claimed_for != service_id);

        let merged = rows.len();
        let touched: BTreeSet<InstrumentId> =
            rows.iter().map(|row| row.instrument_id.clone()).collect();
        for row in rows {
            self.insert(row);
        }
        self.services.insert(service_id.clone());

        let conflicts = touched
            .into_iter()
            .filter(|instrument_id| {
                self.by_instrument
                    .get(instrument_id)
                    .is_some_and(|ids| ids.len() > 1)
            })
            .collect();
        LoadReport {
            merged,
            replaced: stale.len(),
            conflicts,
        }
    }
}

pub struct AssignmentGuard<G: RosterGateway + ?Sized> {
    gateway: Arc<G>,
    pool: Mutex<AssignmentPool>,
    gate: AsyncMutex<()>,
    timeout: Duration,
}

impl<G: RosterGateway + ?Sized> AssignmentGuard<G> {
    pub fn new(gateway: Arc<G>, config: &SyncConfig) -> Self {
        Self {
            gateway,
            pool: Mutex::new(AssignmentPool::default()),
            gate: AsyncMutex::new(()),
            timeout: config.commit_timeout(),
        }
    }

    fn pool(&self) -> MutexGuard<'_, AssignmentPool> {
        self.pool.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// True iff no loaded assignment references `instrument_id` and no
    /// unconfirmed insert claims it.
    pub fn is_available(&self, instrument_id: &InstrumentId) -> bool {
        self.pool().claimant(instrument_id).is_none()
    }

    pub fn holder(&self, instrument_id: &InstrumentId) -> Option<RosterAssignment> {
        self.pool().holder(instrument_id).cloned()
    }

    pub fn assignments(&self, service_id: &ServiceId) -> Vec<RosterAssignment> {
        self.pool()
            .rows
            .values()
            .filter(|row| &row.service_id == service_id)
            .cloned()
            .collect()
    }

    pub fn loaded_services(&self) -> Vec<ServiceId> {
        self.pool().services.iter().cloned().collect()
    }

    /// Claims `instrument_id` for a volunteer of `service_id`.
    ///
    /// A conflict is reported before any store call. The pool gains the
    /// assignment only once the store has created the row.
    pub async fn assign(
        &self,
        service_id: &ServiceId,
        volunteer_id: &VolunteerId,
        instrument_id: &InstrumentId,
    ) -> Result<RosterAssignment, SyncError> {
        let _gate = self.gate.lock().await;
        {
            let pool = self.pool();
            if !pool.services.contains(service_id) {
                return Err(SyncError::UnknownService(service_id.clone()));
            }
            if let Some(holder) = pool.claimant(instrument_id) {
                return Err(SyncError::AlreadyAssigned {
                    instrument_id: instrument_id.clone(),
                    holder: holder.clone(),
                });
            }
        }

        let inserted = match tokio::time::timeout(
            self.timeout,
            self.gateway.insert_assignment(NewRosterAssignment {
                service_id: service_id.clone(),
                volunteer_id: volunteer_id.clone(),
                instrument_id: instrument_id.clone(),
            }),
        )
        .await
        {
            Ok(result) => result.map_err(SyncError::from),
            Err(_) => Err(SyncError::Timeout(self.timeout)),
        };

        let created = match inserted {
            Ok(created) => created,
            Err(err) => {
                if err.outcome_unknown() {
                    self.pool().unconfirmed.insert(
                        instrument_id.clone(),
                        (service_id.clone(), volunteer_id.clone()),
                    );
                    tracing::warn!(
                        service_id = %service_id,
                        instrument_id = %instrument_id,
                        "roster insert unconfirmed, instrument stays claimed: {err}"
                    );
                    self.resync(service_id).await;
                }
                return Err(err);
            }
        };

        self.pool().insert(created.clone());
        tracing::info!(
            service_id = %service_id,
            volunteer_id = %volunteer_id,
            instrument_id = %instrument_id,
            "instrument assigned"
        );
        Ok(created)
    }

    /// Releases a volunteer's instrument. The pool keeps the tuple unless the
    /// store confirms the delete.
    pub async fn unassign(
        &self,
        volunteer_id: &VolunteerId,
        instrument_id: &InstrumentId,
    ) -> Result<(), SyncError> {
        let _gate = self.gate.lock().await;
        let found = self
            .pool()
            .find(volunteer_id, instrument_id)
            .map(|row| (row.id.clone(), row.service_id.clone()));
        let Some((assignment_id, service_id)) = found else {
            return Err(SyncError::NotAssigned {
                volunteer_id: volunteer_id.clone(),
                instrument_id: instrument_id.clone(),
            });
        };

        if let Err(err) = self.delete_confirmed(&assignment_id).await {
            if err.outcome_unknown() {
                self.resync(&service_id).await;
            }
            return Err(err);
        }
        tracing::info!(
            volunteer_id = %volunteer_id,
            instrument_id = %instrument_id,
            "instrument released"
        );
        Ok(())
    }

    /// Deletes every stored assignment of the volunteer, loaded or not.
    /// Stops at the first failed delete; earlier confirmed deletes stand.
    pub async fn remove_volunteer(&self, volunteer_id: &VolunteerId) -> Result<usize, SyncError> {
        let _gate = self.gate.lock().await;
        let rows = tokio::time::timeout(
            self.timeout,
            self.gateway
                .find_assignments(RosterFilter::volunteer(volunteer_id.clone())),
        )
        .await
        .map_err(|_| SyncError::Timeout(self.timeout))??;

        let mut removed = 0;
        for row in &rows {
            if let Err(err) = self.delete_confirmed(&row.id).await {
                let loaded = self.pool().services.contains(&row.service_id);
                if err.outcome_unknown() && loaded {
                    self.resync(&row.service_id).await;
                }
                return Err(err);
            }
            removed += 1;
        }
        tracing::info!(volunteer_id = %volunteer_id, removed, "volunteer removed from roster");
        Ok(removed)
    }

    async fn delete_confirmed(&self, assignment_id: &AssignmentId) -> Result<(), SyncError> {
        tokio::time::timeout(self.timeout, self.gateway.delete_assignment(assignment_id))
            .await
            .map_err(|_| SyncError::Timeout(self.timeout))??;
        self.pool().remove(assignment_id);
        Ok(())
    }

    /// Merges one service's freshly fetched assignments into the pool.
    ///
    /// Only that service's previous assignments are replaced; every other
    /// loaded service is left alone. Rows of another service are ignored.
    pub async fn load_roster(
        &self,
        service_id: &ServiceId,
        assignments: Vec<RosterAssignment>,
    ) -> LoadReport {
        let _gate = self.gate.lock().await;
        self.merge(service_id, assignments)
    }

    /// Roster loader: fetches one service's assignments and merges them.
    pub async fn load_service(&self, service_id: &ServiceId) -> Result<LoadReport, SyncError> {
        let _gate = self.gate.lock().await;
        let rows = tokio::time::timeout(
            self.timeout,
            self.gateway
                .find_assignments(RosterFilter::service(service_id.clone())),
        )
        .await
        .map_err(|_| SyncError::Timeout(self.timeout))??;
        Ok(self.merge(service_id, rows))
    }

    /// Refetches a service after a write with an unknown outcome. The caller
    /// holds the gate.
    async fn resync(&self, service_id: &ServiceId) {
        let fetched = tokio::time::timeout(
            self.timeout,
            self.gateway
                .find_assignments(RosterFilter::service(service_id.clone())),
        )
        .await;
        match fetched {
            Ok(Ok(rows)) => {
                self.merge(service_id, rows);
            }
            Ok(Err(err)) => tracing::warn!(
                service_id = %service_id,
                "roster refetch failed, claims kept until the next load: {err}"
            ),
            Err(_) => tracing::warn!(
                service_id = %service_id,
                "roster refetch timed out, claims kept until the next load"
            ),
        }
    }

    fn merge(&self, service_id: &ServiceId, assignments: Vec<RosterAssignment>) -> LoadReport {
        let (rows, foreign): (Vec<_>, Vec<_>) = assignments
            .into_iter()
            .partition(|row| &row.service_id == service_id);
        if !foreign.is_empty() {
            tracing::warn!(
                service_id = %service_id,
                ignored = foreign.len(),
                "roster load carried rows of other services"
            );
        }

        let report = self.pool().replace_service(service_id, rows);
        if !report.conflicts.is_empty() {
            tracing::warn!(
                service_id = %service_id,
                conflicts = ?report.conflicts,
                "stored roster already assigns these instruments more than once"
            );
        }
        tracing::info!(
            service_id = %service_id,
            merged = report.merged,
            replaced = report.replaced,
            "roster loaded"
        );
        report
    }
}
