//! Entity identity (spec.md §3: "integer id").

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! int_id {
    ($name:ident) => {
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<i64> for $name {
            fn from(value: i64) -> Self {
                Self(value)
            }
        }
    };
}

int_id!(JobId);
int_id!(TitleId);

/// Drives are identified by the device specifier the disc scanner reports
/// (e.g. `/dev/sr0`), not an integer — there's no row for a drive.
pub type DriveId = String;
