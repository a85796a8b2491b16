#![forbid(unsafe_code)]

//! Persists a new setlist order without tripping `(service_id, position)`
//! uniqueness.
//!
//! With a transactional gateway the whole order is written in one atomic
//! batch. Otherwise the two-phase scheme applies: every moving row is parked
//! on a distinct negative placeholder, and only once all of them are
//! confirmed does any row receive its final position. The two-phase path is
//! not atomic; a failed write aborts immediately and may leave placeholders
//! behind.

use crate::config::{SyncConfig, WriteMode};
use crate::error::{GatewayError, SyncError};
use crate::gateway::SetlistGateway;
use futures::future::try_join_all;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;
use wt_core::ids::{EntryId, ServiceId};
use wt_core::model::{SetlistEntry, SetlistEntryPatch};
use wt_core::order::{OrderError, PositionWrite, RenumberPlan};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RenumberStrategy {
    TwoPhase,
    AtomicBatch,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Placeholders,
    Finals,
    Atomic,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Placeholders => "placeholder phase",
            Self::Finals => "final phase",
            Self::Atomic => "atomic batch",
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconcileReport {
    pub strategy: RenumberStrategy,
    /// Rows whose position changed.
    pub rows_moved: usize,
    /// Gateway writes confirmed; zero for an unchanged order.
    pub writes_confirmed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Plan(#[from] OrderError),

    #[error("{phase} write failed after {writes_confirmed} confirmed writes: {source}")]
    Write {
        phase: Phase,
        writes_confirmed: usize,
        #[source]
        source: GatewayError,
    },
}

impl ReconcileError {
    /// True when rows may already carry placeholders or partial finals, so
    /// the caller's last known-good view can no longer be trusted.
    pub fn store_touched(&self) -> bool {
        matches!(
            self,
            Self::Write {
                phase: Phase::Placeholders | Phase::Finals,
                ..
            }
        )
    }
}

impl From<ReconcileError> for SyncError {
    fn from(value: ReconcileError) -> Self {
        match value {
            ReconcileError::Plan(err) => SyncError::Order(err),
            ReconcileError::Write { source, .. } => SyncError::Gateway(source),
        }
    }
}

pub struct PositionReconciler<G: SetlistGateway + ?Sized> {
    gateway: Arc<G>,
    write_mode: WriteMode,
    prefer_atomic_batch: bool,
}

impl<G: SetlistGateway + ?Sized> PositionReconciler<G> {
    pub fn new(gateway: Arc<G>, config: &SyncConfig) -> Self {
        Self {
            gateway,
            write_mode: config.write_mode,
            prefer_atomic_batch: config.prefer_atomic_batch,
        }
    }

    pub fn strategy(&self) -> RenumberStrategy {
        if self.prefer_atomic_batch && self.gateway.supports_atomic_renumber() {
            RenumberStrategy::AtomicBatch
        } else {
            RenumberStrategy::TwoPhase
        }
    }

    /// Moves `persisted` (the store's current rows for the service) into the
    /// order given by `desired`.
    ///
    /// Rows already at their final position are not written, so an unchanged
    /// order costs no round trip. Each write is attempted once; the first
    /// failure is returned and nothing is cleaned up.
    pub async fn reconcile(
        &self,
        service_id: &ServiceId,
        persisted: &[SetlistEntry],
        desired: &[EntryId],
    ) -> Result<ReconcileReport, ReconcileError> {
        let plan = RenumberPlan::compute(persisted, desired)?;
        let strategy = self.strategy();
        if plan.is_noop() {
            tracing::debug!(service_id = %service_id, "setlist order unchanged, nothing to write");
            return Ok(ReconcileReport {
                strategy,
                rows_moved: 0,
                writes_confirmed: 0,
            });
        }

        let confirmed = AtomicUsize::new(0);
        match strategy {
            RenumberStrategy::AtomicBatch => {
                let positions: Vec<PositionWrite> = desired
                    .iter()
                    .enumerate()
                    .map(|(index, entry_id)| PositionWrite {
                        entry_id: entry_id.clone(),
                        position: index as i64 + 1,
                    })
                    .collect();
                self.gateway
                    .renumber_atomic(service_id, &positions)
                    .await
                    .map_err(|source| ReconcileError::Write {
                        phase: Phase::Atomic,
                        writes_confirmed: 0,
                        source,
                    })?;
                confirmed.store(1, Ordering::SeqCst);
            }
            RenumberStrategy::TwoPhase => {
                tracing::debug!(
                    service_id = %service_id,
                    rows = plan.moved(),
                    "writing placeholder positions"
                );
                self.write_phase(Phase::Placeholders, plan.placeholders(), &confirmed)
                    .await?;
                tracing::debug!(
                    service_id = %service_id,
                    rows = plan.moved(),
                    "writing final positions"
                );
                self.write_phase(Phase::Finals, plan.finals(), &confirmed)
                    .await?;
            }
        }

        Ok(ReconcileReport {
            strategy,
            rows_moved: plan.moved(),
            writes_confirmed: confirmed.load(Ordering::SeqCst),
        })
    }

    async fn write_phase(
        &self,
        phase: Phase,
        writes: &[PositionWrite],
        confirmed: &AtomicUsize,
    ) -> Result<(), ReconcileError> {
        let fail = |source: GatewayError| ReconcileError::Write {
            phase,
            writes_confirmed: confirmed.load(Ordering::SeqCst),
            source,
        };

        match self.write_mode {
            WriteMode::Sequential => {
                for write in writes {
                    self.write_one(write).await.map_err(fail)?;
                    confirmed.fetch_add(1, Ordering::SeqCst);
                }
            }
            WriteMode::Concurrent => {
                try_join_all(writes.iter().map(|write| async move {
                    self.write_one(write).await?;
                    confirmed.fetch_add(1, Ordering::SeqCst);
                    Ok::<(), GatewayError>(())
                }))
                .await
                .map_err(fail)?;
            }
        }
        Ok(())
    }

    async fn write_one(&self, write: &PositionWrite) -> Result<(), GatewayError> {
        self.gateway
            .update_entry(&write.entry_id, SetlistEntryPatch::position(write.position))
            .await
    }
}
