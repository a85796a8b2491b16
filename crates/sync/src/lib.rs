#![forbid(unsafe_code)]

//! Consistency core for worship-team setlists and rosters.
//!
//! * [`OptimisticListStore`] keeps each service's setlist in memory, applies
//!   reorders immediately and rolls them back when persisting fails.
//! * [`PositionReconciler`] turns a desired order into store writes that never
//!   violate `(service_id, position)` uniqueness.
//! * [`AssignmentGuard`] keeps instruments exclusive across the loaded
//!   rosters.
//!
//! Persistence goes through [`SetlistGateway`] / [`RosterGateway`];
//! [`SqliteGateway`] and [`MemoryGateway`] implement both.

pub mod config;
pub mod error;
pub mod gateway;
pub mod guard;
pub mod list_store;
pub mod memory;
pub mod reconciler;
pub mod sqlite;

pub use config::{ConfigError, SyncConfig, WriteMode};
pub use error::{GatewayError, SyncError};
pub use gateway::{RosterGateway, SetlistGateway};
pub use guard::{AssignmentGuard, LoadReport};
pub use list_store::{CommitError, CommitOutcome, ListEvent, ListPhase, OptimisticListStore};
pub use memory::{MemoryGateway, WriteKind, WriteRecord};
pub use reconciler::{
    Phase, PositionReconciler, ReconcileError, ReconcileReport, RenumberStrategy,
};
pub use sqlite::SqliteGateway;
