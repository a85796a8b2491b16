#![forbid(unsafe_code)]

pub mod ids;
pub mod order;

pub use ids::*;

pub mod model {
    use crate::ids::{AssignmentId, EntryId, InstrumentId, ServiceId, SongId, VolunteerId};

    /// One song placed in one service's setlist.
    ///
    /// `position` is 1-based once persisted. Negative values only exist in the
    /// store while a two-phase renumbering is in flight.
    #[derive(Clone, Debug, PartialEq, Eq)]
    pub struct SetlistEntry {
        pub id: EntryId,
        pub service_id: ServiceId,
        pub song_id: SongId,
        pub position: i64,
        pub notes: Option<String>,
    }

    #[derive(Clone, Debug, PartialEq, Eq)]
    pub struct NewSetlistEntry {
        pub service_id: ServiceId,
        pub song_id: SongId,
        pub position: i64,
        pub notes: Option<String>,
    }

    /// Partial update of a setlist row. `None` leaves the column untouched.
    #[derive(Clone, Debug, Default, PartialEq, Eq)]
    pub struct SetlistEntryPatch {
        pub position: Option<i64>,
        pub notes: Option<Option<String>>,
    }

    impl SetlistEntryPatch {
        pub fn position(position: i64) -> Self {
            Self {
                position: Some(position),
                notes: None,
            }
        }

        pub fn is_empty(&self) -> bool {
            self.position.is_none() && self.notes.is_none()
        }
    }

    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub enum FindOrder {
        #[default]
        Unordered,
        ByPosition,
    }

    #[derive(Clone, Debug, PartialEq, Eq)]
    pub struct SetlistFilter {
        pub service_id: ServiceId,
        pub order: FindOrder,
    }

    impl SetlistFilter {
        pub fn ordered(service_id: ServiceId) -> Self {
            Self {
                service_id,
                order: FindOrder::ByPosition,
            }
        }
    }

    /// One volunteer's claim on one instrument for one service.
    #[derive(Clone, Debug, PartialEq, Eq)]
    pub struct RosterAssignment {
        pub id: AssignmentId,
        pub service_id: ServiceId,
        pub volunteer_id: VolunteerId,
        pub instrument_id: InstrumentId,
    }

    #[derive(Clone, Debug, PartialEq, Eq)]
    pub struct NewRosterAssignment {
        pub service_id: ServiceId,
        pub volunteer_id: VolunteerId,
        pub instrument_id: InstrumentId,
    }

    #[derive(Clone, Debug, Default, PartialEq, Eq)]
    pub struct RosterFilter {
        pub service_id: Option<ServiceId>,
        pub volunteer_id: Option<VolunteerId>,
    }

    impl RosterFilter {
        pub fn service(service_id: ServiceId) -> Self {
            Self {
                service_id: Some(service_id),
                volunteer_id: None,
            }
        }

        pub fn volunteer(volunteer_id: VolunteerId) -> Self {
            Self {
                service_id: None,
                volunteer_id: Some(volunteer_id),
            }
        }

        pub fn matches(&self, row: &RosterAssignment) -> bool {
            self.service_id
                .as_ref()
                .is_none_or(|service_id| service_id == &row.service_id)
                && self
                    .volunteer_id
                    .as_ref()
                    .is_none_or(|volunteer_id| volunteer_id == &row.volunteer_id)
        }
    }
}
