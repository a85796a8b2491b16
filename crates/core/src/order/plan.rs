#![forbid(unsafe_code)]

use super::OrderError;
use crate::ids::EntryId;
use crate::model::SetlistEntry;
use std::collections::{HashMap, HashSet};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PositionWrite {
    pub entry_id: EntryId,
    pub position: i64,
}

/// Row writes that move a service's setlist from its persisted positions to a
/// desired order without ever holding two rows at the same position.
///
/// Phase 1 parks every moving row on a distinct negative placeholder; phase 2
/// gives each parked row its final 1-based position. Rows already sitting at
/// their final position are not written at all, so reconciling a list against
/// its own order produces an empty plan.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RenumberPlan {
    placeholders: Vec<PositionWrite>,
    finals: Vec<PositionWrite>,
}

impl RenumberPlan {
    /// `persisted` is the store's current view of the service (any order);
    /// `desired` lists the same entry ids in their new order.
    ///
    /// The entry at desired index `i` is parked at `-(i+1)`. When the
    /// persisted view already holds placeholders (an earlier run aborted),
    /// parking starts below the lowest of them instead.
    pub fn compute(persisted: &[SetlistEntry], desired: &[EntryId]) -> Result<Self, OrderError> {
        if persisted.len() != desired.len() {
            return Err(OrderError::NotAPermutation { entry_id: None });
        }

        let mut current: HashMap<&EntryId, i64> = HashMap::with_capacity(persisted.len());
        for entry in persisted {
            if current.insert(&entry.id, entry.position).is_some() {
                return Err(OrderError::DuplicateId {
                    entry_id: entry.id.clone(),
                });
            }
        }

        let floor = persisted
            .iter()
            .map(|entry| entry.position)
            .min()
            .unwrap_or(0)
            .min(0);

        let mut seen: HashSet<&EntryId> = HashSet::with_capacity(desired.len());
        let mut plan = Self::default();
        for (index, entry_id) in desired.iter().enumerate() {
            let Some(position) = current.get(entry_id) else {
                return Err(OrderError::NotAPermutation {
                    entry_id: Some(entry_id.clone()),
                });
            };
            if !seen.insert(entry_id) {
                return Err(OrderError::DuplicateId {
                    entry_id: entry_id.clone(),
                });
            }

            let target = index as i64 + 1;
            if *position == target {
                continue;
            }
            plan.placeholders.push(PositionWrite {
                entry_id: entry_id.clone(),
                position: floor - target,
            });
            plan.finals.push(PositionWrite {
                entry_id: entry_id.clone(),
                position: target,
            });
        }
        Ok(plan)
    }

    pub fn is_noop(&self) -> bool {
        self.finals.is_empty()
    }

    /// Number of rows that move; each moves twice under the two-phase scheme.
    pub fn moved(&self) -> usize {
        self.finals.len()
    }

    pub fn placeholders(&self) -> &[PositionWrite] {
        &self.placeholders
    }

    pub fn finals(&self) -> &[PositionWrite] {
        &self.finals
    }
}
