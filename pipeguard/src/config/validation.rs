//! Validation of a parsed [`CoordinatorConfig`].
//!
//! A config that fails here is never applied, neither at startup nor on
//! reload.

use super::model::{CoordinatorConfig, DecisionType, WorkflowSpec};
use crate::errors::ConfigValidationError;
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;

fn id_pattern() -> Result<&'static Regex, ConfigValidationError> {
    static PATTERN: OnceLock<Result<Regex, regex::Error>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^[a-z][a-z0-9_\-]{0,63}$"))
        .as_ref()
        .map_err(|e| ConfigValidationError::new("CONFIG-003-ID", format!("Id pattern failed to compile: {e}")))
}

/// Validates the whole configuration, returning the first problem found.
pub fn validate_config(config: &CoordinatorConfig) -> Result<(), ConfigValidationError> {
    let mut seen = HashSet::new();
    for workflow in &config.workflows {
        if !seen.insert(workflow.id.as_str()) {
            return Err(ConfigValidationError::new(
                "CONFIG-001-DUPLICATE",
                format!("Workflow id '{}' is declared more than once", workflow.id),
            )
            .with_workflows(vec![workflow.id.clone()]));
        }
        validate_workflow(workflow)?;
    }

    validate_sections(config)
}

/// Validates a single workflow definition.
pub fn validate_workflow(workflow: &WorkflowSpec) -> Result<(), ConfigValidationError> {
    if !id_pattern()?.is_match(&workflow.id) {
        return Err(ConfigValidationError::new(
            "CONFIG-003-ID",
            format!("Invalid workflow id '{}'", workflow.id),
        )
        .with_workflows(vec![workflow.id.clone()])
        .with_fix_hint("Use lowercase letters, digits, '_' or '-', starting with a letter."));
    }

    validate_decision(&workflow.id, &workflow.decision)?;

    let mut names = HashSet::new();
    for task in &workflow.tasks {
        if task.job.trim().is_empty() {
            return Err(invalid(&workflow.id, "task job name cannot be empty"));
        }
        if !names.insert(task.job.as_str()) {
            return Err(invalid(
                &workflow.id,
                &format!("task '{}' is listed more than once", task.job),
            ));
        }
    }

    let deps = workflow.task_dependencies();
    for (task, after) in &deps {
        for dep in after {
            if dep == task {
                return Err(invalid(&workflow.id, &format!("task '{task}' cannot run after itself")));
            }
            if !deps.contains_key(dep) {
                return Err(ConfigValidationError::new(
                    "CONFIG-004-MISSING-TASK",
                    format!(
                        "Workflow '{}': task '{}' runs after unknown task '{}'",
                        workflow.id, task, dep
                    ),
                )
                .with_workflows(vec![workflow.id.clone()]));
            }
        }
    }

    find_cycle(&deps).map_or(Ok(()), |path| Err(ConfigValidationError::cycle(&workflow.id, &path)))
}

fn validate_decision(id: &str, decision: &DecisionType) -> Result<(), ConfigValidationError> {
    match decision {
        DecisionType::FixedWindow {
            start_hour,
            window_hours,
        } => {
            check_hour(id, "start_hour", *start_hour)?;
            if *window_hours == 0 || *window_hours > 24 {
                return Err(invalid(id, "window_hours must be in 1..=24"));
            }
        }
        DecisionType::EventAware {
            frequency_hours,
            window_before_event_hours,
            business_hours_start,
            business_hours_end,
            min_events,
        } => {
            if *frequency_hours == 0 {
                return Err(invalid(id, "frequency_hours must be positive"));
            }
            if *window_before_event_hours > 24 {
                return Err(invalid(id, "window_before_event_hours must be at most 24"));
            }
            check_hour(id, "business_hours_start", *business_hours_start)?;
            if *business_hours_end > 24 || business_hours_end <= business_hours_start {
                return Err(invalid(id, "business hours must satisfy start < end <= 24"));
            }
            if *min_events == 0 {
                return Err(invalid(id, "min_events must be at least 1"));
            }
        }
        DecisionType::EventAwareRetrospective { run_hour, min_events } => {
            check_hour(id, "run_hour", *run_hour)?;
            if *min_events == 0 {
                return Err(invalid(id, "min_events must be at least 1"));
            }
        }
        DecisionType::Discovery {
            max_attempts,
            window_start_hour,
            window_end_hour,
        } => {
            if *max_attempts == 0 {
                return Err(invalid(id, "max_attempts must be at least 1"));
            }
            check_hour(id, "window_start_hour", *window_start_hour)?;
            if *window_end_hour > 24 || window_end_hour <= window_start_hour {
                return Err(invalid(id, "discovery window must satisfy start < end <= 24"));
            }
        }
    }
    Ok(())
}

fn validate_sections(config: &CoordinatorConfig) -> Result<(), ConfigValidationError> {
    let pct_ok = |v: f64| (0.0..=100.0).contains(&v);

    if !pct_ok(config.gate.threshold_pct) {
        return Err(section("gate.threshold_pct must be within 0..=100"));
    }
    for (job, gate) in &config.gate.jobs {
        if gate.threshold_pct.is_some_and(|v| !pct_ok(v)) {
            return Err(section(&format!("gate.jobs.{job}.threshold_pct must be within 0..=100")));
        }
    }
    if config.breaker.max_attempts == 0 {
        return Err(section("breaker.max_attempts must be at least 1"));
    }
    if config.queue.default_max_attempts == 0 {
        return Err(section("queue.default_max_attempts must be at least 1"));
    }
    if config.queue.max_backoff_minutes < config.queue.base_backoff_minutes {
        return Err(section("queue.max_backoff_minutes must not be below base_backoff_minutes"));
    }
    if config.executor.max_concurrency == 0 {
        return Err(section("executor.max_concurrency must be at least 1"));
    }
    if config.executor.task_timeout_seconds == 0 {
        return Err(section("executor.task_timeout_seconds must be at least 1"));
    }
    if config.queue.lease_minutes.saturating_mul(60) <= config.executor.task_timeout_seconds {
        return Err(section("queue.lease_minutes must outlast executor.task_timeout_seconds"));
    }
    if !pct_ok(config.writer.variance_tolerance_pct) {
        return Err(section("writer.variance_tolerance_pct must be within 0..=100"));
    }
    if config.writer.staging_prefix.trim().is_empty() {
        return Err(section("writer.staging_prefix cannot be empty"));
    }
    for (signal, processors) in &config.triggers {
        if processors.is_empty() {
            return Err(section(&format!("trigger '{signal}' maps to no processors")));
        }
    }
    Ok(())
}

/// Depth-first search for an ordering cycle; returns the cycle path.
fn find_cycle(deps: &HashMap<String, Vec<String>>) -> Option<Vec<String>> {
    fn dfs(
        node: &str,
        deps: &HashMap<String, Vec<String>>,
        visited: &mut HashSet<String>,
        path: &mut Vec<String>,
    ) -> Option<Vec<String>> {
        if let Some(start) = path.iter().position(|n| n == node) {
            let mut cycle = path[start..].to_vec();
            cycle.push(node.to_string());
            return Some(cycle);
        }
        if !visited.insert(node.to_string()) {
            return None;
        }

        path.push(node.to_string());
        for dep in deps.get(node).into_iter().flatten() {
            if let Some(cycle) = dfs(dep, deps, visited, path) {
                return Some(cycle);
            }
        }
        path.pop();
        None
    }

    let mut visited = HashSet::new();
    let mut nodes: Vec<&String> = deps.keys().collect();
    nodes.sort();
    nodes
        .into_iter()
        .find_map(|node| dfs(node, deps, &mut visited, &mut Vec::new()))
}

fn check_hour(id: &str, field: &str, hour: u32) -> Result<(), ConfigValidationError> {
    if hour >= 24 {
        return Err(invalid(id, &format!("{field} must be in 0..=23")));
    }
    Ok(())
}

fn invalid(id: &str, message: &str) -> ConfigValidationError {
    ConfigValidationError::new("CONFIG-005-PARAM", format!("Workflow '{id}': {message}"))
        .with_workflows(vec![id.to_string()])
}

fn section(message: &str) -> ConfigValidationError {
    ConfigValidationError::new("CONFIG-006-SECTION", message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::model::SubTaskRef;

    fn fixed() -> DecisionType {
        DecisionType::FixedWindow {
            start_hour: 6,
            window_hours: 2,
        }
    }

    #[test]
    fn test_valid_config() {
        let mut config = CoordinatorConfig::default();
        config.workflows.push(
            WorkflowSpec::new("morning_ops", fixed())
                .with_task("events")
                .with_task_after("features", &["events"]),
        );
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_duplicate_ids() {
        let mut config = CoordinatorConfig::default();
        config.workflows.push(WorkflowSpec::new("a", fixed()));
        config.workflows.push(WorkflowSpec::new("a", fixed()));

        let err = validate_config(&config).unwrap_err();
        assert_eq!(err.code, "CONFIG-001-DUPLICATE");
    }

    #[test]
    fn test_invalid_id() {
        let err = validate_workflow(&WorkflowSpec::new("Bad Id", fixed())).unwrap_err();
        assert_eq!(err.code, "CONFIG-003-ID");
    }

    #[test]
    fn test_missing_after_reference() {
        let wf = WorkflowSpec::new("wf", fixed()).with_task_after("features", &["ghost"]);
        let err = validate_workflow(&wf).unwrap_err();
        assert_eq!(err.code, "CONFIG-004-MISSING-TASK");
    }

    #[test]
    fn test_cycle_detected() {
        let mut wf = WorkflowSpec::new("wf", fixed());
        wf.tasks.push(SubTaskRef::new("a").after(&["b"]));
        wf.tasks.push(SubTaskRef::new("b").after(&["a"]));

        let err = validate_workflow(&wf).unwrap_err();
        assert_eq!(err.code, "CONFIG-002-CYCLE");
        assert!(err.message.contains("->"));
    }

    #[test]
    fn test_decision_ranges() {
        let bad = WorkflowSpec::new(
            "wf",
            DecisionType::EventAware {
                frequency_hours: 0,
                window_before_event_hours: 6,
                business_hours_start: 8,
                business_hours_end: 20,
                min_events: 1,
            },
        );
        assert!(validate_workflow(&bad).is_err());

        let bad = WorkflowSpec::new(
            "wf",
            DecisionType::Discovery {
                max_attempts: 3,
                window_start_hour: 12,
                window_end_hour: 10,
            },
        );
        assert!(validate_workflow(&bad).is_err());
    }

    #[test]
    fn test_section_ranges() {
        let mut config = CoordinatorConfig::default();
        config.gate.threshold_pct = 120.0;
        assert_eq!(validate_config(&config).unwrap_err().code, "CONFIG-006-SECTION");

        let mut config = CoordinatorConfig::default();
        config.executor.max_concurrency = 0;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_lease_must_outlast_task_timeout() {
        let mut config = CoordinatorConfig::default();
        config.queue.lease_minutes = 30;
        config.executor.task_timeout_seconds = 30 * 60;
        let err = validate_config(&config).unwrap_err();
        assert_eq!(err.code, "CONFIG-006-SECTION");
        assert!(err.message.contains("lease_minutes"));

        config.executor.task_timeout_seconds = 30 * 60 - 1;
        assert!(validate_config(&config).is_ok());
    }
}
