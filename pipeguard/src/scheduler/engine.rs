//! Schedule evaluation.
//!
//! [`WorkflowScheduler::evaluate`] is a pure function of the workflow, the
//! current time and the calendar. It keeps no state of its own; "already ran
//! this slot" is tracked by the coordinator's schedule ledger.

use super::calendar::EventCalendar;
use crate::config::{DecisionType, SchedulerConfig, WorkflowSpec};
use crate::core::ScheduleAction;
use crate::utils::{local_date, local_to_utc, offset_from_minutes, Timestamp};
use chrono::{Duration, FixedOffset, NaiveDate};
use serde::{Deserialize, Serialize};

/// The result of evaluating one workflow at one instant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleDecision {
    /// The evaluated workflow.
    pub workflow_id: String,
    /// RUN or SKIP.
    pub action: ScheduleAction,
    /// Human-readable explanation.
    pub reason: String,
    /// When the evaluation happened.
    pub evaluated_at: Timestamp,
    /// Job names to dispatch, in declaration order.
    pub tasks: Vec<String>,
    /// The matched slot, when the action is RUN.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_time: Option<Timestamp>,
    /// Every slot planned for the local day.
    pub planned_slots: Vec<Timestamp>,
}

impl ScheduleDecision {
    fn skip(
        spec: &WorkflowSpec,
        now: Timestamp,
        reason: impl Into<String>,
        planned: Vec<Timestamp>,
    ) -> Self {
        Self {
            workflow_id: spec.id.clone(),
            action: ScheduleAction::Skip,
            reason: reason.into(),
            evaluated_at: now,
            tasks: spec.task_names(),
            target_time: None,
            planned_slots: planned,
        }
    }

    fn run(
        spec: &WorkflowSpec,
        now: Timestamp,
        reason: impl Into<String>,
        target: Timestamp,
        planned: Vec<Timestamp>,
    ) -> Self {
        Self {
            workflow_id: spec.id.clone(),
            action: ScheduleAction::Run,
            reason: reason.into(),
            evaluated_at: now,
            tasks: spec.task_names(),
            target_time: Some(target),
            planned_slots: planned,
        }
    }

    /// Returns true if the workflow should run now.
    #[must_use]
    pub fn should_run(&self) -> bool {
        self.action == ScheduleAction::Run
    }
}

/// The day's plan for one workflow, before matching against `now`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DayPlan {
    /// Planned slot times.
    pub slots: Vec<Timestamp>,
    /// Why the plan is empty, when it is.
    pub empty_reason: Option<String>,
}

impl DayPlan {
    fn slots(slots: Vec<Timestamp>) -> Self {
        Self {
            slots,
            empty_reason: None,
        }
    }

    fn empty(reason: impl Into<String>) -> Self {
        Self {
            slots: Vec::new(),
            empty_reason: Some(reason.into()),
        }
    }
}

/// Evaluates workflow schedules in a fixed local timezone.
#[derive(Debug, Clone)]
pub struct WorkflowScheduler {
    offset: FixedOffset,
    tolerance: Duration,
}

impl Default for WorkflowScheduler {
    fn default() -> Self {
        Self::new(&SchedulerConfig::default())
    }
}

impl WorkflowScheduler {
    /// Creates a scheduler from config.
    #[must_use]
    pub fn new(config: &SchedulerConfig) -> Self {
        Self {
            offset: offset_from_minutes(config.utc_offset_minutes),
            tolerance: Duration::minutes(i64::from(config.tolerance_minutes)),
        }
    }

    /// Returns the local timezone offset.
    #[must_use]
    pub fn offset(&self) -> FixedOffset {
        self.offset
    }

    /// Returns the local calendar day of `now`.
    #[must_use]
    pub fn local_day(&self, now: Timestamp) -> NaiveDate {
        local_date(now, self.offset)
    }

    /// Decides whether `spec` should run at `now`.
    #[must_use]
    pub fn evaluate(
        &self,
        spec: &WorkflowSpec,
        now: Timestamp,
        calendar: &dyn EventCalendar,
    ) -> ScheduleDecision {
        if !spec.enabled {
            return ScheduleDecision::skip(spec, now, "workflow disabled", Vec::new());
        }

        let today = self.local_day(now);
        let plan = self.planned_slots(spec, today, calendar);
        if let Some(reason) = plan.empty_reason {
            return ScheduleDecision::skip(spec, now, reason, plan.slots);
        }

        if let DecisionType::FixedWindow {
            start_hour,
            window_hours,
        } = &spec.decision
        {
            let start = self.at_hour(today, *start_hour);
            let end = start + Duration::hours(i64::from(*window_hours));
            return match plan.slots.first() {
                Some(target) if start <= now && now < end => ScheduleDecision::run(
                    spec,
                    now,
                    format!("inside window {start_hour:02}:00+{window_hours}h"),
                    *target,
                    plan.slots,
                ),
                _ => ScheduleDecision::skip(spec, now, "outside window", plan.slots),
            };
        }

        let due = plan
            .slots
            .iter()
            .copied()
            .find(|slot| *slot <= now && now < *slot + self.tolerance);

        match due {
            Some(slot) => {
                let local = slot.with_timezone(&self.offset);
                let reason = format!("slot {} due", local.format("%H:%M"));
                ScheduleDecision::run(spec, now, reason, slot, plan.slots)
            }
            None => ScheduleDecision::skip(spec, now, "no slot due", plan.slots),
        }
    }

    /// Computes every slot `spec` plans for the local day `date`.
    ///
    /// Ignores the enabled flag so the expected-schedule ledger can still
    /// show what a disabled workflow would have done.
    #[must_use]
    pub fn planned_slots(
        &self,
        spec: &WorkflowSpec,
        date: NaiveDate,
        calendar: &dyn EventCalendar,
    ) -> DayPlan {
        match &spec.decision {
            DecisionType::FixedWindow {
                start_hour,
                window_hours,
            } => {
                let start = self.at_hour(date, *start_hour);
                let midpoint = start + Duration::minutes(i64::from(*window_hours) * 30);
                DayPlan::slots(vec![midpoint])
            }
            DecisionType::EventAware {
                frequency_hours,
                window_before_event_hours,
                business_hours_start,
                business_hours_end,
                min_events,
            } => {
                let events = calendar.events_on(date, self.offset);
                if events.len() < *min_events {
                    return DayPlan::empty("no events today");
                }
                let Some(first) = events.iter().map(|e| e.start).min() else {
                    return DayPlan::empty("no events today");
                };

                let business_start = self.at_hour(date, *business_hours_start);
                let business_end = self.at_hour(date, *business_hours_end);
                let step = Duration::hours(i64::from((*frequency_hours).max(1)));

                let mut slots = Vec::new();
                let mut slot = first - Duration::hours(i64::from(*window_before_event_hours));
                while slot < first {
                    if business_start <= slot && slot < business_end {
                        slots.push(slot);
                    }
                    slot += step;
                }

                if slots.is_empty() {
                    DayPlan::empty("no slot inside business hours before first event")
                } else {
                    DayPlan::slots(slots)
                }
            }
            DecisionType::EventAwareRetrospective {
                run_hour,
                min_events,
            } => {
                let Some(yesterday) = date.pred_opt() else {
                    return DayPlan::empty("no events yesterday");
                };
                if calendar.events_on(yesterday, self.offset).len() < *min_events {
                    return DayPlan::empty("no events yesterday");
                }
                DayPlan::slots(vec![self.at_hour(date, *run_hour)])
            }
            DecisionType::Discovery {
                max_attempts,
                window_start_hour,
                window_end_hour,
            } => {
                let attempts = (*max_attempts).max(1);
                let span_minutes =
                    i64::from(window_end_hour.saturating_sub(*window_start_hour)) * 60;
                let step = span_minutes / i64::from(attempts);
                let start = self.at_hour(date, *window_start_hour);
                let slots = (0..i64::from(attempts))
                    .map(|i| start + Duration::minutes(step * i))
                    .collect();
                DayPlan::slots(slots)
            }
        }
    }

    fn at_hour(&self, date: NaiveDate, hour: u32) -> Timestamp {
        local_to_utc(date, i64::from(hour) * 60, self.offset)
    }
}
