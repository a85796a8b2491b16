#![forbid(unsafe_code)]

//! Pure ordering algorithms for setlists.
//!
//! Nothing here talks to a store: these functions compute new in-memory
//! orders and the row writes that move a store from one order to another.

mod moves;
mod plan;

pub use moves::*;
pub use plan::*;

use crate::ids::EntryId;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OrderError {
    IndexOutOfRange { index: usize, len: usize },
    NotAPermutation { entry_id: Option<EntryId> },
    DuplicateId { entry_id: EntryId },
}

impl std::fmt::Display for OrderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::IndexOutOfRange { index, len } => {
                write!(f, "index out of range (index={index}, len={len})")
            }
            Self::NotAPermutation { entry_id: Some(id) } => {
                write!(f, "desired order is not a permutation (unexpected entry {id})")
            }
            Self::NotAPermutation { entry_id: None } => {
                write!(f, "desired order is not a permutation (length mismatch)")
            }
            Self::DuplicateId { entry_id } => write!(f, "duplicate entry id {entry_id}"),
        }
    }
}

impl std::error::Error for OrderError {}
