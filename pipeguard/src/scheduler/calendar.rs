//! Event calendar consulted by event-aware workflows.

use crate::utils::{local_date, Timestamp};
use chrono::{FixedOffset, NaiveDate};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

/// A scheduled real-world event (a game, a market open, ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalendarEvent {
    /// Event identifier.
    pub id: String,
    /// Scheduled start.
    pub start: Timestamp,
}

impl CalendarEvent {
    /// Creates an event.
    #[must_use]
    pub fn new(id: impl Into<String>, start: Timestamp) -> Self {
        Self {
            id: id.into(),
            start,
        }
    }
}

/// Read-only view of the event calendar.
pub trait EventCalendar: Send + Sync + Debug {
    /// Returns the events whose start falls on `date` in the given offset,
    /// ordered by start time.
    fn events_on(&self, date: NaiveDate, offset: FixedOffset) -> Vec<CalendarEvent>;
}

/// A calendar backed by a fixed list of events.
#[derive(Debug, Clone, Default)]
pub struct StaticEventCalendar {
    events: Vec<CalendarEvent>,
}

impl StaticEventCalendar {
    /// Creates an empty calendar.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an event.
    #[must_use]
    pub fn with_event(mut self, id: impl Into<String>, start: Timestamp) -> Self {
        self.push(CalendarEvent::new(id, start));
        self
    }

    /// Adds an event in place.
    pub fn push(&mut self, event: CalendarEvent) {
        self.events.push(event);
        self.events.sort_by_key(|e| e.start);
    }

    /// Returns the number of events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Returns true if there are no events.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

impl EventCalendar for StaticEventCalendar {
    fn events_on(&self, date: NaiveDate, offset: FixedOffset) -> Vec<CalendarEvent> {
        self.events
            .iter()
            .filter(|e| local_date(e.start, offset) == date)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::offset_from_minutes;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_events_on_uses_local_day() {
        let calendar = StaticEventCalendar::new()
            .with_event("late", Utc.with_ymd_and_hms(2025, 1, 15, 2, 0, 0).unwrap())
            .with_event("early", Utc.with_ymd_and_hms(2025, 1, 14, 18, 0, 0).unwrap());

        let jan14 = NaiveDate::from_ymd_opt(2025, 1, 14).unwrap();
        let eastern = offset_from_minutes(-300);

        // 02:00 UTC on the 15th is 21:00 on the 14th five hours west.
        let events = calendar.events_on(jan14, eastern);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].id, "early");

        assert_eq!(calendar.events_on(jan14, offset_from_minutes(0)).len(), 1);
    }
}
