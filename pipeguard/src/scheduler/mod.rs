//! Time- and event-driven scheduling decisions.

mod calendar;
mod engine;

pub use calendar::{CalendarEvent, EventCalendar, StaticEventCalendar};
pub use engine::{DayPlan, ScheduleDecision, WorkflowScheduler};
