//! Identifier generation.

use uuid::Uuid;

/// Generates a new UUID v4.
#[must_use]
pub fn generate_uuid() -> Uuid {
    Uuid::new_v4()
}

/// Generates a new UUID v7 (time-ordered).
///
/// Used for queue items and quality events so ids sort by creation time.
#[must_use]
pub fn generate_uuid_v7() -> Uuid {
    Uuid::now_v7()
}

/// Returns a short, lowercase, identifier-safe suffix.
///
/// Suitable for embedding in table names, which reject `-`.
#[must_use]
pub fn short_id() -> String {
    generate_uuid().simple().to_string()[..12].to_string()
}
