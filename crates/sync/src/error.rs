#![forbid(unsafe_code)]

use std::time::Duration;
use thiserror::Error;
use wt_core::ids::{EntryId, InstrumentId, ServiceId, VolunteerId};
use wt_core::order::OrderError;

/// Failures reported by a persistence gateway.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    /// The store refused a write that would duplicate a unique key.
    #[error("unique constraint violated in {collection}")]
    UniqueConstraint { collection: &'static str },

    /// The row vanished between read and write.
    #[error("{collection} row {id} not found")]
    NotFound { collection: &'static str, id: String },

    /// Transport or backend failure; the whole operation may be retried.
    #[error("network or backend failure: {0}")]
    Network(String),

    /// The store refused the request itself, independent of stored data.
    #[error("rejected by store: {0}")]
    Rejected(String),

    #[error("operation not supported by this gateway: {0}")]
    Unsupported(&'static str),
}

impl GatewayError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Network(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error("invalid order: {0}")]
    Order(#[from] OrderError),

    #[error("persistence did not answer within {0:?}")]
    Timeout(Duration),

    #[error("instrument {instrument_id} is already assigned to {holder}")]
    AlreadyAssigned {
        instrument_id: InstrumentId,
        holder: VolunteerId,
    },

    #[error("a reorder is already committing for service {0}")]
    ReorderInFlight(ServiceId),

    #[error("service {0} is not loaded")]
    UnknownService(ServiceId),

    #[error("stored positions of service {0} are not 1..N; repair the service first")]
    RepairRequired(ServiceId),

    #[error("entry {entry_id} is not part of service {service_id}")]
    UnknownEntry {
        service_id: ServiceId,
        entry_id: EntryId,
    },

    #[error("volunteer {volunteer_id} does not hold instrument {instrument_id}")]
    NotAssigned {
        volunteer_id: VolunteerId,
        instrument_id: InstrumentId,
    },
}

impl SyncError {
    /// Validation failures are shown to the user as-is and never retried.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::AlreadyAssigned { .. } | Self::Order(_) | Self::NotAssigned { .. }
        )
    }

    /// The request may have reached the store even though no answer came
    /// back, so local state can no longer be trusted.
    pub fn outcome_unknown(&self) -> bool {
        match self {
            Self::Timeout(_) => true,
            Self::Gateway(err) => err.is_transient(),
            _ => false,
        }
    }
}
