#![forbid(unsafe_code)]

const MAX_ID_LEN: usize = 128;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IdError {
    Empty,
    TooLong,
    ContainsControl,
}

impl IdError {
    pub fn message(&self) -> &'static str {
        match self {
            Self::Empty => "id must not be empty",
            Self::TooLong => "id is too long",
            Self::ContainsControl => "id contains control characters",
        }
    }
}

impl std::fmt::Display for IdError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.message())
    }
}

impl std::error::Error for IdError {}

fn validate_id(value: &str) -> Result<(), IdError> {
    if value.trim().is_empty() {
        return Err(IdError::Empty);
    }
    if value.len() > MAX_ID_LEN {
        return Err(IdError::TooLong);
    }
    if value.chars().any(|c| c.is_control()) {
        return Err(IdError::ContainsControl);
    }
    Ok(())
}

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(String);

        impl $name {
            pub fn try_new(value: impl Into<String>) -> Result<Self, IdError> {
                let value = value.into();
                validate_id(&value)?;
                Ok(Self(value))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_string(self) -> String {
                self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

string_id!(
    /// A worship service; owns one setlist and one roster.
    ServiceId
);
string_id!(
    /// A setlist row. Stable across reorders.
    EntryId
);
string_id!(SongId);
string_id!(
    /// A volunteer signed up for exactly one service.
    VolunteerId
);
string_id!(
    /// An instrument or role slot, e.g. `drums` or `lead-vocal`.
    InstrumentId
);
string_id!(AssignmentId);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_validation() {
        assert_eq!(ServiceId::try_new("").unwrap_err(), IdError::Empty);
        assert_eq!(ServiceId::try_new("   ").unwrap_err(), IdError::Empty);
        assert_eq!(
            EntryId::try_new("bad\u{0007}id").unwrap_err(),
            IdError::ContainsControl
        );
        assert_eq!(
            SongId::try_new("x".repeat(MAX_ID_LEN + 1)).unwrap_err(),
            IdError::TooLong
        );
        assert_eq!(
            InstrumentId::try_new("lead-vocal").unwrap().as_str(),
            "lead-vocal"
        );
    }

    #[test]
    fn ids_order_lexically() {
        let a = VolunteerId::try_new("v-a").unwrap();
        let b = VolunteerId::try_new("v-b").unwrap();
        assert!(a < b);
        assert_eq!(a.to_string(), "v-a");
    }
}
