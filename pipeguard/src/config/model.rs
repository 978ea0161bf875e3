//! Declarative configuration model.
//!
//! The whole file deserializes into a [`CoordinatorConfig`]; every section
//! has defaults so a minimal file only lists workflows.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Root of the declarative configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CoordinatorConfig {
    /// Scheduling parameters shared by all workflows.
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Completeness gate thresholds and windows.
    #[serde(default)]
    pub gate: GateConfig,
    /// Circuit breaker ceiling and cooldown.
    #[serde(default)]
    pub breaker: BreakerConfig,
    /// Backfill queue defaults.
    #[serde(default)]
    pub queue: QueueConfig,
    /// Idempotent writer tolerances.
    #[serde(default)]
    pub writer: WriterConfig,
    /// Workflow executor pool settings.
    #[serde(default)]
    pub executor: ExecutorConfig,
    /// Log output settings.
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Trigger signal to processor job names.
    #[serde(default)]
    pub triggers: BTreeMap<String, Vec<String>>,
    /// Workflow definitions, in declaration order.
    #[serde(default)]
    pub workflows: Vec<WorkflowSpec>,
}

impl CoordinatorConfig {
    /// Looks up a workflow by id.
    #[must_use]
    pub fn workflow(&self, id: &str) -> Option<&WorkflowSpec> {
        self.workflows.iter().find(|w| w.id == id)
    }

    /// Returns the processors mapped to a trigger signal.
    #[must_use]
    pub fn processors_for(&self, signal: &str) -> &[String] {
        self.triggers.get(signal).map_or(&[], Vec::as_slice)
    }
}

/// A workflow: when to run and which jobs to dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkflowSpec {
    /// Unique identifier.
    pub id: String,
    /// Disabled workflows never produce RUN decisions.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Higher priorities are dispatched first within a tick.
    #[serde(default)]
    pub priority: i32,
    /// How run times are decided.
    pub decision: DecisionType,
    /// Sub-tasks in declaration order.
    #[serde(default)]
    pub tasks: Vec<SubTaskRef>,
    /// Forces every task to follow its predecessor.
    #[serde(default)]
    pub sequential: bool,
    /// Free-text description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl WorkflowSpec {
    /// Creates an enabled workflow with no tasks.
    #[must_use]
    pub fn new(id: impl Into<String>, decision: DecisionType) -> Self {
        Self {
            id: id.into(),
            enabled: true,
            priority: 0,
            decision,
            tasks: Vec::new(),
            sequential: false,
            description: None,
        }
    }

    /// Appends an unordered task.
    #[must_use]
    pub fn with_task(mut self, job: impl Into<String>) -> Self {
        self.tasks.push(SubTaskRef::new(job));
        self
    }

    /// Appends a task that runs after the named tasks.
    #[must_use]
    pub fn with_task_after(mut self, job: impl Into<String>, after: &[&str]) -> Self {
        self.tasks.push(SubTaskRef::new(job).after(after));
        self
    }

    /// Sets the enabled flag.
    #[must_use]
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Sets the priority.
    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Forces sequential execution.
    #[must_use]
    pub fn sequential(mut self) -> Self {
        self.sequential = true;
        self
    }

    /// Job names of all tasks, in declaration order.
    #[must_use]
    pub fn task_names(&self) -> Vec<String> {
        self.tasks.iter().map(|t| t.job.clone()).collect()
    }

    /// Effective predecessors of each task, honouring `sequential`.
    #[must_use]
    pub fn task_dependencies(&self) -> HashMap<String, Vec<String>> {
        self.tasks
            .iter()
            .enumerate()
            .map(|(idx, task)| {
                let mut deps = task.after.clone();
                if self.sequential && idx > 0 {
                    let prev = &self.tasks[idx - 1].job;
                    if !deps.contains(prev) {
                        deps.push(prev.clone());
                    }
                }
                (task.job.clone(), deps)
            })
            .collect()
    }
}

/// Reference to a job dispatched by a workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SubTaskRef {
    /// Registered job name.
    pub job: String,
    /// Tasks of the same workflow that must finish first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub after: Vec<String>,
    /// Overrides the executor's default task timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
}

impl SubTaskRef {
    /// Creates an unordered task reference.
    #[must_use]
    pub fn new(job: impl Into<String>) -> Self {
        Self {
            job: job.into(),
            after: Vec::new(),
            timeout_seconds: None,
        }
    }

    /// Sets the predecessors.
    #[must_use]
    pub fn after(mut self, after: &[&str]) -> Self {
        self.after = after.iter().map(|s| (*s).to_string()).collect();
        self
    }

    /// Sets the timeout override.
    #[must_use]
    pub fn with_timeout_seconds(mut self, seconds: u64) -> Self {
        self.timeout_seconds = Some(seconds);
        self
    }
}

/// How a workflow decides when to run. Hours are local wall-clock hours.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum DecisionType {
    /// Run once inside `[start_hour, start_hour + window_hours)`.
    FixedWindow {
        /// First hour of the window.
        start_hour: u32,
        /// Window length in hours.
        #[serde(default = "default_window_hours")]
        window_hours: u32,
    },
    /// Run every `frequency_hours` ahead of the day's first event.
    EventAware {
        /// Spacing between runs.
        frequency_hours: u32,
        /// How long before the first event the first run happens.
        window_before_event_hours: u32,
        /// Earliest allowed run hour.
        #[serde(default = "default_business_start")]
        business_hours_start: u32,
        /// Runs must start before this hour.
        #[serde(default = "default_business_end")]
        business_hours_end: u32,
        /// Minimum number of events that qualifies a day.
        #[serde(default = "default_min_events")]
        min_events: usize,
    },
    /// Run once at `run_hour` if the previous day had events.
    EventAwareRetrospective {
        /// Hour of the single run.
        run_hour: u32,
        /// Minimum number of events that qualifies the previous day.
        #[serde(default = "default_min_events")]
        min_events: usize,
    },
    /// Poll an external source up to `max_attempts` times per day.
    Discovery {
        /// Number of evenly spaced attempts.
        max_attempts: u32,
        /// First attempt hour.
        window_start_hour: u32,
        /// Attempts are spread before this hour.
        window_end_hour: u32,
    },
}

impl DecisionType {
    /// Short name for logs and the expected-schedule table.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::FixedWindow { .. } => "fixed_window",
            Self::EventAware { .. } => "event_aware",
            Self::EventAwareRetrospective { .. } => "event_aware_retrospective",
            Self::Discovery { .. } => "discovery",
        }
    }
}

/// Scheduler settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SchedulerConfig {
    /// Local timezone as minutes east of UTC.
    pub utc_offset_minutes: i32,
    /// How long after a slot it still counts as due.
    pub tolerance_minutes: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            utc_offset_minutes: 0,
            tolerance_minutes: 30,
        }
    }
}

/// How far back a completeness window looks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lookback {
    /// The last N scheduled events for the entity.
    Games(u32),
    /// The last N calendar days.
    Days(u32),
}

/// One completeness window a job must clear.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WindowSpec {
    /// Window name, e.g. `last_10`.
    pub name: String,
    /// Lookback span.
    pub lookback: Lookback,
    /// Upstream older than this is treated as insufficient.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_staleness_hours: Option<u32>,
}

impl WindowSpec {
    /// Creates a window with no staleness bound.
    #[must_use]
    pub fn new(name: impl Into<String>, lookback: Lookback) -> Self {
        Self {
            name: name.into(),
            lookback,
            max_staleness_hours: None,
        }
    }

    /// Sets the staleness bound.
    #[must_use]
    pub fn with_max_staleness_hours(mut self, hours: u32) -> Self {
        self.max_staleness_hours = Some(hours);
        self
    }
}

/// Per-job completeness requirements.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct JobGateConfig {
    /// Overrides the global threshold.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threshold_pct: Option<f64>,
    /// Windows that must all clear.
    pub windows: Vec<WindowSpec>,
}

/// Completeness gate settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GateConfig {
    /// Minimum completeness percentage for production output.
    pub threshold_pct: f64,
    /// Length of the bootstrap grace period.
    pub bootstrap_days: u32,
    /// Start of the current season/epoch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub season_start: Option<NaiveDate>,
    /// Per-job windows and overrides.
    pub jobs: BTreeMap<String, JobGateConfig>,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            threshold_pct: 90.0,
            bootstrap_days: 14,
            season_start: None,
            jobs: BTreeMap::new(),
        }
    }
}

impl GateConfig {
    /// Effective threshold for a job.
    #[must_use]
    pub fn threshold_for(&self, job: &str) -> f64 {
        self.jobs
            .get(job)
            .and_then(|j| j.threshold_pct)
            .unwrap_or(self.threshold_pct)
    }

    /// Windows for a job; a single `default` window when none are configured.
    #[must_use]
    pub fn windows_for(&self, job: &str) -> Vec<WindowSpec> {
        match self.jobs.get(job) {
            Some(j) if !j.windows.is_empty() => j.windows.clone(),
            _ => vec![WindowSpec::new("default", Lookback::Days(1))],
        }
    }
}

/// Circuit breaker settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BreakerConfig {
    /// Attempts at which the breaker trips.
    pub max_attempts: u32,
    /// Cooldown once tripped.
    pub cooldown_hours: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            cooldown_hours: 24 * 7,
        }
    }
}

/// Backfill queue settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QueueConfig {
    /// Max attempts for new items.
    pub default_max_attempts: u32,
    /// Backoff after the first failure.
    pub base_backoff_minutes: u64,
    /// Backoff cap.
    pub max_backoff_minutes: u64,
    /// How long a claim is held before another worker may take it.
    pub lease_minutes: u64,
    /// Items claimed per drain pass.
    pub drain_batch_size: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            default_max_attempts: 3,
            base_backoff_minutes: 15,
            max_backoff_minutes: 240,
            lease_minutes: 60,
            drain_batch_size: 10,
        }
    }
}

/// Idempotent writer settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WriterConfig {
    /// Allowed gap between expected and counted rows.
    pub variance_tolerance_pct: f64,
    /// Rows sampled for emptiness checks.
    pub sample_size: usize,
    /// Blocked rows above which an alert is raised.
    pub blocked_alert_threshold: usize,
    /// Prefix for per-call staging tables.
    pub staging_prefix: String,
    /// Field used to pick the newest duplicate during merge.
    pub order_field: String,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            variance_tolerance_pct: 5.0,
            sample_size: 20,
            blocked_alert_threshold: 10,
            staging_prefix: "_staging".to_string(),
            order_field: "processed_at".to_string(),
        }
    }
}

/// Executor settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExecutorConfig {
    /// Tasks running at once within one workflow.
    pub max_concurrency: usize,
    /// Default per-task deadline.
    pub task_timeout_seconds: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 5,
            task_timeout_seconds: 30 * 60,
        }
    }
}

/// Log output settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

const fn default_true() -> bool {
    true
}

const fn default_window_hours() -> u32 {
    2
}

const fn default_business_start() -> u32 {
    8
}

const fn default_business_end() -> u32 {
    20
}

const fn default_min_events() -> usize {
    1
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_decision_type_deserialize() {
        let toml_src = r#"
            type = "event_aware"
            frequency_hours = 2
            window_before_event_hours = 6
        "#;
        let decision: DecisionType = toml::from_str(toml_src).unwrap();
        assert_eq!(
            decision,
            DecisionType::EventAware {
                frequency_hours: 2,
                window_before_event_hours: 6,
                business_hours_start: 8,
                business_hours_end: 20,
                min_events: 1,
            }
        );
        assert_eq!(decision.kind(), "event_aware");
    }

    #[test]
    fn test_task_dependencies_sequential() {
        let wf = WorkflowSpec::new(
            "wf",
            DecisionType::FixedWindow {
                start_hour: 6,
                window_hours: 2,
            },
        )
        .with_task("events")
        .with_task("props")
        .sequential();

        let deps = wf.task_dependencies();
        assert!(deps["events"].is_empty());
        assert_eq!(deps["props"], vec!["events".to_string()]);
    }

    #[test]
    fn test_gate_config_windows_default() {
        let gate = GateConfig::default();
        let windows = gate.windows_for("anything");
        assert_eq!(windows.len(), 1);
        assert_eq!(windows[0].name, "default");
        assert!((gate.threshold_for("anything") - 90.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_gate_config_job_override() {
        let mut gate = GateConfig::default();
        gate.jobs.insert(
            "features".to_string(),
            JobGateConfig {
                threshold_pct: Some(95.0),
                windows: vec![
                    WindowSpec::new("last_5", Lookback::Games(5)),
                    WindowSpec::new("last_7_days", Lookback::Days(7)),
                ],
            },
        );

        assert!((gate.threshold_for("features") - 95.0).abs() < f64::EPSILON);
        assert_eq!(gate.windows_for("features").len(), 2);
    }

    #[test]
    fn test_processors_for_unknown_signal() {
        let config = CoordinatorConfig::default();
        assert!(config.processors_for("nope").is_empty());
    }
}
