//! Status helper enums mapping to SMALLSERIAL lookup tables.
//!
//! Each enum variant's discriminant matches the seed data in the
//! corresponding `*_statuses` table.

/// Status ID type matching SMALLINT/SMALLSERIAL in the database.
pub type StatusId = i16;

macro_rules! define_status_enum {
    (
        $(#[$meta:meta])*
        $name:ident {
            $( $(#[$vmeta:meta])* $variant:ident = $val:expr ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[repr(i16)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub enum $name {
            $( $(#[$vmeta])* $variant = $val ),+
        }

        impl $name {
            /// Return the database status ID.
            pub fn id(self) -> StatusId {
                self as StatusId
            }

            /// Resolve a database status ID back to its variant.
            pub fn from_id(id: StatusId) -> Option<Self> {
                match id {
                    $( x if x == $val => Some(Self::$variant), )+
                    _ => None,
                }
            }
        }

        impl From<$name> for StatusId {
            fn from(value: $name) -> Self {
                value as StatusId
            }
        }
    };
}

define_status_enum! {
    /// Image job execution status.
    JobStatus {
        Pending = 1,
        Running = 2,
        Completed = 3,
        Failed = 4,
    }
}

define_status_enum! {
    /// Dead-letter redelivery status.
    DeadLetterStatus {
        Pending = 1,
        Delivering = 2,
        Delivered = 3,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_status_ids_match_seed_order() {
        assert_eq!(JobStatus::Pending.id(), 1);
        assert_eq!(JobStatus::Running.id(), 2);
        assert_eq!(JobStatus::Completed.id(), 3);
        assert_eq!(JobStatus::Failed.id(), 4);
    }

    #[test]
    fn from_id_round_trips() {
        assert_eq!(JobStatus::from_id(3), Some(JobStatus::Completed));
        assert_eq!(DeadLetterStatus::from_id(2), Some(DeadLetterStatus::Delivering));
        assert_eq!(JobStatus::from_id(0), None);
    }

    #[test]
    fn into_status_id() {
        let id: StatusId = DeadLetterStatus::Delivered.into();
        assert_eq!(id, 3);
    }
}
