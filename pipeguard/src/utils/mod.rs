//! Utility functions for identifiers, timestamps and the injectable clock.

mod clock;
pub mod timestamps;
mod uuid_utils;

pub use clock::{Clock, ManualClock, SystemClock};
pub use timestamps::{
    date_range, iso_timestamp, local_date, local_to_utc, now_utc, offset_from_minutes, DateArg,
    DateParseError, Timestamp,
};
pub use uuid_utils::{generate_uuid, generate_uuid_v7, short_id};
