#![forbid(unsafe_code)]

//! Client-side setlists with optimistic reorder and snapshot rollback.
//!
//! Each loaded service runs its own small state machine:
//!
//! ```text
//! Idle --apply_reorder--> Reordering --commit_reorder--> Committing
//!   ^                                                        |
//!   +------------- Committed / RolledBack -------------------+
//! ```
//!
//! The snapshot taken on the first `apply_reorder` is the last order known
//! to be persisted. It is the only thing restored on failure and it is
//! dropped as soon as the commit resolves either way.
//!
//! A failure that may have left the store different from the restored order
//! marks the service stale. While stale, the next write re-reads the stored
//! rows instead of trusting the in-memory positions; a successful write, a
//! reload or a repair clears the mark.

use crate::config::SyncConfig;
use crate::error::{GatewayError, SyncError};
use crate::gateway::SetlistGateway;
use crate::reconciler::{PositionReconciler, ReconcileError, ReconcileReport};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use wt_core::ids::{EntryId, ServiceId, SongId};
use wt_core::model::{NewSetlistEntry, SetlistEntry, SetlistFilter};
use wt_core::order::{entry_ids, is_contiguous, move_item, recovery_order, renumber};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ListPhase {
    Idle,
    /// Optimistic order visible, snapshot held, nothing written yet.
    Reordering,
    /// Store writes in flight; further reorders are refused.
    Committing,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ListEvent {
    Loaded {
        service_id: ServiceId,
        len: usize,
    },
    Reordered {
        service_id: ServiceId,
        order: Vec<EntryId>,
    },
    Committed {
        service_id: ServiceId,
        writes: usize,
    },
    RolledBack {
        service_id: ServiceId,
        restored: Vec<EntryId>,
        reason: String,
    },
    Added {
        service_id: ServiceId,
        entry_id: EntryId,
    },
    Removed {
        service_id: ServiceId,
        entry_id: EntryId,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CommitOutcome {
    /// Nothing was pending, or the pending order equals the persisted one.
    Unchanged,
    Committed(ReconcileReport),
}

/// A failed commit. The visible order has already been restored.
///
/// `reload_recommended` is set when the store may now differ from the
/// restored order: placeholders left behind, a row already deleted, or a
/// timeout with writes possibly landed. It stays set across failures until
/// a write succeeds or the service is reloaded.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("{error}")]
pub struct CommitError {
    pub error: SyncError,
    pub reload_recommended: bool,
}

impl CommitError {
    fn clean(error: SyncError) -> Self {
        Self {
            error,
            reload_recommended: false,
        }
    }
}

#[derive(Debug)]
struct ServiceList {
    entries: Vec<SetlistEntry>,
    snapshot: Option<Vec<SetlistEntry>>,
    committing: bool,
    /// Stored rows may differ from `entries`.
    stale: bool,
}

impl ServiceList {
    fn loaded(entries: Vec<SetlistEntry>) -> Self {
        Self {
            entries,
            snapshot: None,
            committing: false,
            stale: false,
        }
    }

    fn phase(&self) -> ListPhase {
        if self.committing {
            ListPhase::Committing
        } else if self.snapshot.is_some() {
            ListPhase::Reordering
        } else {
            ListPhase::Idle
        }
    }
}

pub struct OptimisticListStore<G: SetlistGateway + ?Sized> {
    gateway: Arc<G>,
    reconciler: PositionReconciler<G>,
    commit_timeout: Duration,
    lists: Mutex<HashMap<ServiceId, ServiceList>>,
    events: broadcast::Sender<ListEvent>,
}

impl<G: SetlistGateway + ?Sized> OptimisticListStore<G> {
    pub fn new(gateway: Arc<G>, config: &SyncConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            reconciler: PositionReconciler::new(Arc::clone(&gateway), config),
            gateway,
            commit_timeout: config.commit_timeout(),
            lists: Mutex::new(HashMap::new()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ListEvent> {
        self.events.subscribe()
    }

    fn lists(&self) -> MutexGuard<'_, HashMap<ServiceId, ServiceList>> {
        self.lists.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: ListEvent) {
        // No subscribers is not an error.
        let _ = self.events.send(event);
    }

    /// Current visible order, or `None` when the service is not loaded.
    pub fn entries(&self, service_id: &ServiceId) -> Option<Vec<SetlistEntry>> {
        self.lists()
            .get(service_id)
            .map(|list| list.entries.clone())
    }

    pub fn phase(&self, service_id: &ServiceId) -> Option<ListPhase> {
        self.lists().get(service_id).map(ServiceList::phase)
    }

    /// True when a failed write may have left the store out of step with the
    /// visible order.
    pub fn needs_reload(&self, service_id: &ServiceId) -> bool {
        self.lists()
            .get(service_id)
            .is_some_and(|list| list.stale)
    }

    pub fn loaded_services(&self) -> Vec<ServiceId> {
        let mut services: Vec<ServiceId> = self.lists().keys().cloned().collect();
        services.sort();
        services
    }

    /// Fetches one service's rows and replaces only that service's list.
    /// Other services stay as they are.
    pub async fn load_service(&self, service_id: &ServiceId) -> Result<Vec<SetlistEntry>, SyncError> {
        if self.phase(service_id).is_some_and(|phase| phase != ListPhase::Idle) {
            return Err(SyncError::ReorderInFlight(service_id.clone()));
        }

        let rows = self
            .gateway
            .find_entries(SetlistFilter::ordered(service_id.clone()))
            .await?;
        if !is_contiguous(rows.iter().map(|row| row.position)) {
            tracing::warn!(
                service_id = %service_id,
                rows = rows.len(),
                "stored setlist positions are not contiguous; repair_service will renumber them"
            );
        }

        {
            let mut lists = self.lists();
            if lists
                .get(service_id)
                .is_some_and(|list| list.phase() != ListPhase::Idle)
            {
                return Err(SyncError::ReorderInFlight(service_id.clone()));
            }
            lists.insert(service_id.clone(), ServiceList::loaded(rows.clone()));
        }

        tracing::info!(service_id = %service_id, rows = rows.len(), "setlist loaded");
        self.emit(ListEvent::Loaded {
            service_id: service_id.clone(),
            len: rows.len(),
        });
        Ok(rows)
    }

    /// Read-through reload of a service that is already loaded.
    pub async fn reload_service(&self, service_id: &ServiceId) -> Result<Vec<SetlistEntry>, SyncError> {
        if self.phase(service_id).is_none() {
            return Err(SyncError::UnknownService(service_id.clone()));
        }
        self.load_service(service_id).await
    }

    /// Moves the entry at `from_index` to `to_index` in memory and renumbers
    /// the visible positions. Nothing is written until `commit_reorder`.
    ///
    /// Repeated calls before committing keep the first snapshot. Refused while
    /// a commit is in flight.
    pub fn apply_reorder(
        &self,
        service_id: &ServiceId,
        from_index: usize,
        to_index: usize,
    ) -> Result<Vec<SetlistEntry>, SyncError> {
        let mut lists = self.lists();
        let list = lists
            .get_mut(service_id)
            .ok_or_else(|| SyncError::UnknownService(service_id.clone()))?;
        if list.committing {
            return Err(SyncError::ReorderInFlight(service_id.clone()));
        }

        let mut reordered = list.entries.clone();
        move_item(&mut reordered, from_index, to_index)?;
        if from_index == to_index {
            return Ok(reordered);
        }
        renumber(&mut reordered);

        if list.snapshot.is_none() {
            list.snapshot = Some(std::mem::replace(&mut list.entries, reordered.clone()));
        } else {
            list.entries = reordered.clone();
        }
        drop(lists);

        self.emit(ListEvent::Reordered {
            service_id: service_id.clone(),
            order: entry_ids(&reordered),
        });
        Ok(reordered)
    }

    /// Persists the pending order. On any failure, including the commit
    /// timeout, the snapshot is restored and `RolledBack` is emitted.
    pub async fn commit_reorder(&self, service_id: &ServiceId) -> Result<CommitOutcome, CommitError> {
        let (snapshot, desired, stale) = {
            let mut lists = self.lists();
            let list = lists
                .get_mut(service_id)
                .ok_or_else(|| CommitError::clean(SyncError::UnknownService(service_id.clone())))?;
            if list.committing {
                return Err(CommitError::clean(SyncError::ReorderInFlight(
                    service_id.clone(),
                )));
            }
            let Some(snapshot) = list.snapshot.clone() else {
                return Ok(CommitOutcome::Unchanged);
            };
            list.committing = true;
            (snapshot, entry_ids(&list.entries), list.stale)
        };

        let work = async {
            let persisted = if stale {
                self.stored_rows(service_id).await.map_err(|err| (err, true))?
            } else {
                snapshot
            };
            self.reconcile(service_id, &persisted, &desired).await
        };
        self.settle(service_id, work).await
    }

    /// Deletes one entry and closes the gap behind it.
    ///
    /// The entry disappears from the visible list immediately; a failure of
    /// either the delete or the renumbering restores the previous list.
    pub async fn remove_entry(
        &self,
        service_id: &ServiceId,
        entry_id: &EntryId,
    ) -> Result<CommitOutcome, CommitError> {
        let (persisted_rest, desired, stale) = {
            let mut lists = self.lists();
            let list = lists
                .get_mut(service_id)
                .ok_or_else(|| CommitError::clean(SyncError::UnknownService(service_id.clone())))?;
            if list.phase() != ListPhase::Idle {
                return Err(CommitError::clean(SyncError::ReorderInFlight(
                    service_id.clone(),
                )));
            }
            let Some(index) = list.entries.iter().position(|entry| &entry.id == entry_id) else {
                return Err(CommitError::clean(SyncError::UnknownEntry {
                    service_id: service_id.clone(),
                    entry_id: entry_id.clone(),
                }));
            };

            let mut persisted_rest = list.entries.clone();
            persisted_rest.remove(index);
            let mut visible = persisted_rest.clone();
            renumber(&mut visible);

            list.snapshot = Some(std::mem::replace(&mut list.entries, visible));
            list.committing = true;
            let desired = entry_ids(&persisted_rest);
            (persisted_rest, desired, list.stale)
        };
        self.emit(ListEvent::Removed {
            service_id: service_id.clone(),
            entry_id: entry_id.clone(),
        });

        let work = async {
            self.gateway
                .delete_entry(entry_id)
                .await
                .map_err(|err| {
                    let row_may_be_gone =
                        matches!(err, GatewayError::NotFound { .. }) || err.is_transient();
                    (SyncError::from(err), row_may_be_gone || stale)
                })?;
            // From here on the row is gone, so a restored list is stale.
            let persisted = if stale {
                self.stored_rows(service_id).await.map_err(|err| (err, true))?
            } else {
                persisted_rest
            };
            self.reconcile(service_id, &persisted, &desired)
                .await
                .map_err(|(err, _)| (err, true))
        };
        self.settle(service_id, work).await
    }

    async fn stored_rows(&self, service_id: &ServiceId) -> Result<Vec<SetlistEntry>, SyncError> {
        Ok(self
            .gateway
            .find_entries(SetlistFilter::ordered(service_id.clone()))
            .await?)
    }

    async fn reconcile(
        &self,
        service_id: &ServiceId,
        persisted: &[SetlistEntry],
        desired: &[EntryId],
    ) -> Result<ReconcileReport, (SyncError, bool)> {
        self.reconciler
            .reconcile(service_id, persisted, desired)
            .await
            .map_err(|err: ReconcileError| {
                let touched = err.store_touched();
                (SyncError::from(err), touched)
            })
    }

    /// Runs one commit under the timeout and resolves the state machine.
    async fn settle(
        &self,
        service_id: &ServiceId,
        work: impl Future<Output = Result<ReconcileReport, (SyncError, bool)>>,
    ) -> Result<CommitOutcome, CommitError> {
        match tokio::time::timeout(self.commit_timeout, work).await {
            Ok(Ok(report)) => Ok(self.finish_commit(service_id, report)),
            Ok(Err((error, reload_recommended))) => {
                Err(self.roll_back(service_id, error, reload_recommended))
            }
            Err(_) => Err(self.roll_back(
                service_id,
                SyncError::Timeout(self.commit_timeout),
                true,
            )),
        }
    }

    /// Inserts a song at position `N+1`. Conservative: the entry becomes
    /// visible only after the store confirms it.
    ///
    /// On a stale service the stored rows are read first and replace the
    /// visible list; stored positions outside `1..N` must be repaired before
    /// anything can be appended.
    pub async fn add_song(
        &self,
        service_id: &ServiceId,
        song_id: SongId,
        notes: Option<String>,
    ) -> Result<SetlistEntry, SyncError> {
        let (visible_len, stale) = {
            let mut lists = self.lists();
            let list = lists
                .get_mut(service_id)
                .ok_or_else(|| SyncError::UnknownService(service_id.clone()))?;
            if list.phase() != ListPhase::Idle {
                return Err(SyncError::ReorderInFlight(service_id.clone()));
            }
            list.committing = true;
            (list.entries.len(), list.stale)
        };

        let outcome = tokio::time::timeout(
            self.commit_timeout,
            self.append_row(service_id, visible_len, stale, song_id, notes),
        )
        .await
        .unwrap_or(Err(SyncError::Timeout(self.commit_timeout)));

        let mut lists = self.lists();
        let list = lists
            .get_mut(service_id)
            .ok_or_else(|| SyncError::UnknownService(service_id.clone()))?;
        list.committing = false;
        let (refreshed, entry) = match outcome {
            Ok(appended) => appended,
            Err(err) => {
                if err.outcome_unknown() {
                    list.stale = true;
                    tracing::warn!(
                        service_id = %service_id,
                        "setlist insert unconfirmed, service needs a reload: {err}"
                    );
                }
                return Err(err);
            }
        };
        let reloaded = refreshed.map(|rows| {
            list.entries = rows;
            list.stale = false;
            list.entries.len()
        });
        list.entries.push(entry.clone());
        drop(lists);

        if let Some(len) = reloaded {
            self.emit(ListEvent::Loaded {
                service_id: service_id.clone(),
                len,
            });
        }
        self.emit(ListEvent::Added {
            service_id: service_id.clone(),
            entry_id: entry.id.clone(),
        });
        Ok(entry)
    }

    async fn append_row(
        &self,
        service_id: &ServiceId,
        visible_len: usize,
        refresh: bool,
        song_id: SongId,
        notes: Option<String>,
    ) -> Result<(Option<Vec<SetlistEntry>>, SetlistEntry), SyncError> {
        let refreshed = if refresh {
            let rows = self.stored_rows(service_id).await?;
            if !is_contiguous(rows.iter().map(|row| row.position)) {
                return Err(SyncError::RepairRequired(service_id.clone()));
            }
            Some(rows)
        } else {
            None
        };
        let len = refreshed.as_ref().map_or(visible_len, Vec::len);

        let entry = self
            .gateway
            .insert_entry(NewSetlistEntry {
                service_id: service_id.clone(),
                song_id,
                position: len as i64 + 1,
                notes,
            })
            .await?;
        Ok((refreshed, entry))
    }

    /// Renumbers a service whose stored positions are not `{1..N}`, typically
    /// because an earlier commit aborted with placeholders in place.
    ///
    /// Works on loaded and unloaded services alike; on success the service is
    /// (re)loaded with the repaired order.
    pub async fn repair_service(&self, service_id: &ServiceId) -> Result<CommitOutcome, CommitError> {
        {
            let mut lists = self.lists();
            if let Some(list) = lists.get_mut(service_id) {
                if list.phase() != ListPhase::Idle {
                    return Err(CommitError::clean(SyncError::ReorderInFlight(
                        service_id.clone(),
                    )));
                }
                list.committing = true;
            }
        }

        let outcome = self.repair_rows(service_id).await;

        let mut lists = self.lists();
        match outcome {
            Ok((rows, report)) => {
                let len = rows.len();
                lists.insert(service_id.clone(), ServiceList::loaded(rows));
                drop(lists);
                self.emit(ListEvent::Loaded {
                    service_id: service_id.clone(),
                    len,
                });
                Ok(match report {
                    Some(report) => {
                        tracing::info!(
                            service_id = %service_id,
                            rows = report.rows_moved,
                            "setlist positions repaired"
                        );
                        CommitOutcome::Committed(report)
                    }
                    None => CommitOutcome::Unchanged,
                })
            }
            Err(err) => {
                if let Some(list) = lists.get_mut(service_id) {
                    list.committing = false;
                }
                Err(err)
            }
        }
    }

    async fn repair_rows(
        &self,
        service_id: &ServiceId,
    ) -> Result<(Vec<SetlistEntry>, Option<ReconcileReport>), CommitError> {
        let rows = tokio::time::timeout(
            self.commit_timeout,
            self.gateway
                .find_entries(SetlistFilter::ordered(service_id.clone())),
        )
        .await
        .map_err(|_| CommitError::clean(SyncError::Timeout(self.commit_timeout)))?
        .map_err(|err| CommitError::clean(err.into()))?;

        if is_contiguous(rows.iter().map(|row| row.position)) {
            return Ok((rows, None));
        }

        let desired = recovery_order(&rows);
        let report = tokio::time::timeout(
            self.commit_timeout,
            self.reconciler.reconcile(service_id, &rows, &desired),
        )
        .await
        .map_err(|_| CommitError {
            error: SyncError::Timeout(self.commit_timeout),
            reload_recommended: true,
        })?
        .map_err(|err| CommitError {
            reload_recommended: err.store_touched(),
            error: err.into(),
        })?;

        let mut by_id: HashMap<EntryId, SetlistEntry> =
            rows.into_iter().map(|row| (row.id.clone(), row)).collect();
        let mut repaired: Vec<SetlistEntry> = desired
            .iter()
            .filter_map(|entry_id| by_id.remove(entry_id))
            .collect();
        renumber(&mut repaired);
        Ok((repaired, Some(report)))
    }

    fn finish_commit(&self, service_id: &ServiceId, report: ReconcileReport) -> CommitOutcome {
        {
            let mut lists = self.lists();
            if let Some(list) = lists.get_mut(service_id) {
                list.snapshot = None;
                list.committing = false;
                list.stale = false;
            }
        }
        tracing::info!(
            service_id = %service_id,
            strategy = ?report.strategy,
            rows = report.rows_moved,
            writes = report.writes_confirmed,
            "setlist order committed"
        );
        self.emit(ListEvent::Committed {
            service_id: service_id.clone(),
            writes: report.writes_confirmed,
        });
        if report.rows_moved == 0 {
            CommitOutcome::Unchanged
        } else {
            CommitOutcome::Committed(report)
        }
    }

    fn roll_back(&self, service_id: &ServiceId, error: SyncError, reload_recommended: bool) -> CommitError {
        let (restored, reload_recommended) = {
            let mut lists = self.lists();
            match lists.get_mut(service_id) {
                Some(list) => {
                    if let Some(snapshot) = list.snapshot.take() {
                        list.entries = snapshot;
                    }
                    list.committing = false;
                    list.stale |= reload_recommended;
                    (entry_ids(&list.entries), list.stale)
                }
                None => (Vec::new(), reload_recommended),
            }
        };
        tracing::warn!(
            service_id = %service_id,
            reload_recommended,
            "setlist commit failed, restored previous order: {error}"
        );
        self.emit(ListEvent::RolledBack {
            service_id: service_id.clone(),
            restored,
            reason: error.to_string(),
        });
        CommitError {
            error,
            reload_recommended,
        }
    }
}
