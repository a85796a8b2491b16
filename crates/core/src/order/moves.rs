#![forbid(unsafe_code)]

use super::OrderError;
use crate::ids::EntryId;
use crate::model::SetlistEntry;

/// Removes the item at `from` and reinserts it at `to`.
///
/// This is list-move semantics, not a swap: everything between the two
/// indices shifts by one. Both indices must address the current list; on
/// error the list is left untouched.
pub fn move_item<T>(items: &mut Vec<T>, from: usize, to: usize) -> Result<(), OrderError> {
    let len = items.len();
    if from >= len {
        return Err(OrderError::IndexOutOfRange { index: from, len });
    }
    if to >= len {
        return Err(OrderError::IndexOutOfRange { index: to, len });
    }
    if from != to {
        let item = items.remove(from);
        items.insert(to, item);
    }
    Ok(())
}

/// Rewrites `position` to match the slice index, 1-based.
pub fn renumber(entries: &mut [SetlistEntry]) {
    for (index, entry) in entries.iter_mut().enumerate() {
        entry.position = index as i64 + 1;
    }
}

/// True iff the positions are exactly `{1..N}` with no duplicates.
pub fn is_contiguous(positions: impl IntoIterator<Item = i64>) -> bool {
    let mut positions: Vec<i64> = positions.into_iter().collect();
    positions.sort_unstable();
    positions
        .iter()
        .enumerate()
        .all(|(index, position)| *position == index as i64 + 1)
}

pub fn entry_ids(entries: &[SetlistEntry]) -> Vec<EntryId> {
    entries.iter().map(|entry| entry.id.clone()).collect()
}

/// Best-effort order for rows left behind by an aborted renumbering.
///
/// Settled rows rank by their position. Placeholder rows (`position <= 0`)
/// rank by the final position they were heading for, `-position`. On a tie
/// the settled row goes first; the id breaks any remaining tie.
pub fn recovery_order(rows: &[SetlistEntry]) -> Vec<EntryId> {
    let mut ranked: Vec<(i64, bool, &EntryId)> = rows
        .iter()
        .map(|row| {
            let placeholder = row.position <= 0;
            let rank = if placeholder { -row.position } else { row.position };
            (rank, placeholder, &row.id)
        })
        .collect();
    ranked.sort();
    ranked.into_iter().map(|(_, _, id)| id.clone()).collect()
}
