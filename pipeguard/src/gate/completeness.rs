//! Upstream completeness checks.

use super::source::{CompletenessSource, UpstreamSnapshot};
use crate::config::{GateConfig, WindowSpec};
use crate::errors::{PipeguardError, Result};
use crate::utils::{Clock, SystemClock, Timestamp};
use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What a job should do with a verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateDecision {
    /// Upstream is complete enough for production output.
    Proceed,
    /// Upstream is short, but the bootstrap period allows running anyway.
    ProceedBootstrap,
    /// Upstream is insufficient; do not produce output.
    Block,
}

impl GateDecision {
    /// Returns true unless blocked.
    #[must_use]
    pub fn may_proceed(&self) -> bool {
        !matches!(self, Self::Block)
    }
}

impl fmt::Display for GateDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Proceed => write!(f, "proceed"),
            Self::ProceedBootstrap => write!(f, "proceed_bootstrap"),
            Self::Block => write!(f, "block"),
        }
    }
}

/// Completeness of one window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowVerdict {
    /// Window name.
    pub window: String,
    /// Expected count.
    pub expected: u64,
    /// Actual count.
    pub actual: u64,
    /// `actual / expected * 100`, 100 when nothing is expected, capped at 100.
    pub percentage: f64,
    /// Upstream is older than the window allows.
    pub is_stale: bool,
    /// Meets the threshold and is fresh.
    pub is_production_ready: bool,
}

/// Result of a completeness check for one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletenessVerdict {
    /// The job being gated.
    pub job: String,
    /// The entity checked.
    pub entity: String,
    /// The target date.
    pub date: NaiveDate,
    /// Expected count of the weakest window.
    pub expected: u64,
    /// Actual count of the weakest window.
    pub actual: u64,
    /// Minimum percentage across windows.
    pub percentage: f64,
    /// Threshold the windows were held to.
    pub threshold_pct: f64,
    /// Every window meets the threshold and is fresh.
    pub is_production_ready: bool,
    /// The date falls inside the bootstrap period.
    pub is_bootstrap_acceptable: bool,
    /// Output will be produced from below-threshold data.
    pub backfill_bootstrap_mode: bool,
    /// Any window is stale.
    pub is_stale: bool,
    /// Why the gate decided what it did.
    pub processing_decision_reason: String,
    /// Per-window breakdown.
    pub windows: Vec<WindowVerdict>,
    /// When the check ran.
    pub checked_at: Timestamp,
}

impl CompletenessVerdict {
    /// Collapses the verdict into a decision.
    #[must_use]
    pub fn decision(&self) -> GateDecision {
        if self.is_production_ready {
            GateDecision::Proceed
        } else if self.is_bootstrap_acceptable {
            GateDecision::ProceedBootstrap
        } else {
            GateDecision::Block
        }
    }
}

/// Percentage complete, 100 when nothing is expected, capped at 100.
#[must_use]
pub fn completeness_pct(expected: u64, actual: u64) -> f64 {
    if expected == 0 {
        return 100.0;
    }
    #[allow(clippy::cast_precision_loss)]
    let pct = (actual as f64 * 100.0) / expected as f64;
    pct.min(100.0)
}

/// Decides whether downstream stages are safe to run.
pub struct CompletenessGate {
    source: Arc<dyn CompletenessSource>,
    config: GateConfig,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for CompletenessGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletenessGate")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl CompletenessGate {
    /// Creates a gate over `source`.
    #[must_use]
    pub fn new(source: Arc<dyn CompletenessSource>, config: GateConfig) -> Self {
        Self {
            source,
            config,
            clock: Arc::new(SystemClock),
        }
    }

    /// Sets the clock used for staleness checks.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Returns the gate configuration.
    #[must_use]
    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    /// Returns true if `date` falls inside the bootstrap period.
    #[must_use]
    pub fn in_bootstrap(&self, date: NaiveDate) -> bool {
        self.config.season_start.is_some_and(|start| {
            date >= start && date < start + Duration::days(i64::from(self.config.bootstrap_days))
        })
    }

    /// Checks one entity.
    pub async fn check(
        &self,
        job: &str,
        entity: &str,
        date: NaiveDate,
    ) -> Result<CompletenessVerdict> {
        self.check_batch(job, &[entity.to_string()], date)
            .await?
            .pop()
            .ok_or_else(|| PipeguardError::Internal(format!("no verdict for {entity}")))
    }

    /// Checks several entities with one source call per window.
    ///
    /// Verdicts are returned in the order of `entities`.
    pub async fn check_batch(
        &self,
        job: &str,
        entities: &[String],
        date: NaiveDate,
    ) -> Result<Vec<CompletenessVerdict>> {
        let windows = self.config.windows_for(job);
        let threshold = self.config.threshold_for(job);
        let now = self.clock.now();

        let mut per_window: Vec<(WindowSpec, HashMap<String, UpstreamSnapshot>)> =
            Vec::with_capacity(windows.len());
        for window in windows {
            let snapshots = self.source.fetch(job, &window, entities, date).await?;
            debug!(
                job,
                window = %window.name,
                entities = entities.len(),
                returned = snapshots.len(),
                "completeness source fetched"
            );
            let by_entity = snapshots.into_iter().map(|s| (s.entity.clone(), s)).collect();
            per_window.push((window, by_entity));
        }

        let bootstrap = self.in_bootstrap(date);
        let verdicts = entities
            .iter()
            .map(|entity| {
                let windows: Vec<WindowVerdict> = per_window
                    .iter()
                    .map(|(window, by_entity)| {
                        score_window(window, by_entity.get(entity), threshold, now)
                    })
                    .collect();
                build_verdict(job, entity, date, threshold, bootstrap, windows, now)
            })
            .collect::<Vec<_>>();

        for verdict in &verdicts {
            match verdict.decision() {
                GateDecision::Proceed => {}
                GateDecision::ProceedBootstrap => info!(
                    job,
                    entity = %verdict.entity,
                    %date,
                    percentage = verdict.percentage,
                    "completeness below threshold, proceeding in bootstrap mode"
                ),
                GateDecision::Block => warn!(
                    job,
                    entity = %verdict.entity,
                    %date,
                    percentage = verdict.percentage,
                    reason = %verdict.processing_decision_reason,
                    "completeness gate blocked"
                ),
            }
        }

        Ok(verdicts)
    }
}

fn score_window(
    window: &WindowSpec,
    snapshot: Option<&UpstreamSnapshot>,
    threshold: f64,
    now: Timestamp,
) -> WindowVerdict {
    let (expected, actual, last_updated) =
        snapshot.map_or((0, 0, None), |s| (s.expected, s.actual, s.last_updated));
    let percentage = completeness_pct(expected, actual);

    // Nothing expected means nothing can be stale.
    let is_stale = expected > 0
        && match (window.max_staleness_hours, last_updated) {
            (Some(hours), Some(at)) => now - at > Duration::hours(i64::from(hours)),
            (Some(_), None) => true,
            (None, _) => false,
        };

    WindowVerdict {
        window: window.name.clone(),
        expected,
        actual,
        percentage,
        is_stale,
        is_production_ready: percentage >= threshold && !is_stale,
    }
}

fn build_verdict(
    job: &str,
    entity: &str,
    date: NaiveDate,
    threshold: f64,
    bootstrap: bool,
    windows: Vec<WindowVerdict>,
    now: Timestamp,
) -> CompletenessVerdict {
    let weakest = windows
        .iter()
        .min_by(|a, b| a.percentage.total_cmp(&b.percentage));
    let (expected, actual, percentage) =
        weakest.map_or((0, 0, 100.0), |w| (w.expected, w.actual, w.percentage));

    let is_production_ready = windows.iter().all(|w| w.is_production_ready);
    let is_stale = windows.iter().any(|w| w.is_stale);
    let backfill_bootstrap_mode = bootstrap && !is_production_ready;

    let processing_decision_reason = if is_production_ready {
        format!("complete: {percentage:.1}% >= {threshold:.1}%")
    } else {
        let failing: Vec<&str> = windows
            .iter()
            .filter(|w| !w.is_production_ready)
            .map(|w| w.window.as_str())
            .collect();
        let cause = if is_stale { "stale or incomplete" } else { "incomplete" };
        if bootstrap {
            format!(
                "bootstrap period: {cause} windows [{}] at {percentage:.1}% accepted",
                failing.join(", ")
            )
        } else {
            format!(
                "{cause} windows [{}]: {percentage:.1}% < {threshold:.1}%",
                failing.join(", ")
            )
        }
    };

    CompletenessVerdict {
        job: job.to_string(),
        entity: entity.to_string(),
        date,
        expected,
        actual,
        percentage,
        threshold_pct: threshold,
        is_production_ready,
        is_bootstrap_acceptable: bootstrap,
        backfill_bootstrap_mode,
        is_stale,
        processing_decision_reason,
        windows,
        checked_at: now,
    }
}
