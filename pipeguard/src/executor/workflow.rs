//! Runs a workflow's tasks with bounded parallelism and `after` ordering.
//!
//! Tasks start as soon as every predecessor has succeeded. A task whose
//! predecessor failed or was skipped is itself skipped, and so are its
//! dependents.

use super::task::{TaskResult, TaskRunner};
use crate::config::{ExecutorConfig, WorkflowSpec};
use crate::core::{RunStatus, TaskStatus};
use crate::events::{names, EventSink, NoOpEventSink};
use crate::jobs::JobOptions;
use crate::observability::SpanTimer;
use futures::future::{BoxFuture, FutureExt};
use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinError;
use tracing::{error, info};

/// A task ready to be scheduled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedTask {
    /// Job name.
    pub job: String,
    /// Tasks that must succeed first.
    pub after: Vec<String>,
    /// Deadline for this task.
    pub timeout: Duration,
}

/// Result of one workflow run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowResult {
    /// Workflow id, or a label for ad-hoc job lists.
    pub workflow_id: String,
    /// Rolled-up status.
    pub status: RunStatus,
    /// Per-task results in declaration order.
    pub tasks: Vec<TaskResult>,
    /// Wall time of the whole run.
    pub duration_ms: u64,
}

impl WorkflowResult {
    /// Returns the result for `job`, if it was part of the run.
    #[must_use]
    pub fn task(&self, job: &str) -> Option<&TaskResult> {
        self.tasks.iter().find(|t| t.job == job)
    }
}

type Running = BoxFuture<'static, (String, Result<TaskResult, JoinError>)>;

/// Executes workflows on a shared, bounded pool.
pub struct WorkflowExecutor {
    runner: Arc<TaskRunner>,
    semaphore: Arc<Semaphore>,
    config: ExecutorConfig,
    sink: Arc<dyn EventSink>,
}

impl fmt::Debug for WorkflowExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowExecutor")
            .field("config", &self.config)
            .field("available_permits", &self.semaphore.available_permits())
            .finish_non_exhaustive()
    }
}

impl WorkflowExecutor {
    /// Creates an executor running at most `config.max_concurrency` tasks.
    #[must_use]
    pub fn new(runner: Arc<TaskRunner>, config: ExecutorConfig) -> Self {
        Self {
            runner,
            semaphore: Arc::new(Semaphore::new(config.max_concurrency.max(1))),
            config,
            sink: Arc::new(NoOpEventSink),
        }
    }

    /// Sets the lifecycle event sink.
    #[must_use]
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Returns the task runner.
    #[must_use]
    pub fn runner(&self) -> &Arc<TaskRunner> {
        &self.runner
    }

    fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.config.task_timeout_seconds)
    }

    /// Builds the plan for a workflow.
    #[must_use]
    pub fn plan_for(&self, spec: &WorkflowSpec) -> Vec<PlannedTask> {
        let mut deps = spec.task_dependencies();
        spec.tasks
            .iter()
            .map(|task| PlannedTask {
                job: task.job.clone(),
                after: deps.remove(&task.job).unwrap_or_default(),
                timeout: task
                    .timeout_seconds
                    .map_or_else(|| self.default_timeout(), Duration::from_secs),
            })
            .collect()
    }

    /// Builds an unordered plan for a list of jobs.
    #[must_use]
    pub fn plan_jobs(&self, jobs: &[String]) -> Vec<PlannedTask> {
        jobs.iter()
            .map(|job| PlannedTask {
                job: job.clone(),
                after: Vec::new(),
                timeout: self.default_timeout(),
            })
            .collect()
    }

    /// Runs every task of `spec`.
    pub async fn execute(&self, spec: &WorkflowSpec, options: &JobOptions) -> WorkflowResult {
        self.run(&spec.id, self.plan_for(spec), options).await
    }

    /// Runs `jobs` in parallel under `label`.
    pub async fn execute_jobs(&self, label: &str, jobs: &[String], options: &JobOptions) -> WorkflowResult {
        self.run(label, self.plan_jobs(jobs), options).await
    }

    /// Runs a plan.
    pub async fn run(&self, label: &str, plan: Vec<PlannedTask>, options: &JobOptions) -> WorkflowResult {
        let timer = SpanTimer::start(label);
        if plan.is_empty() {
            return WorkflowResult {
                workflow_id: label.to_string(),
                status: RunStatus::NoProcessors,
                tasks: Vec::new(),
                duration_ms: 0,
            };
        }

        info!(
            workflow = label,
            tasks = plan.len(),
            date = %options.target_date,
            backfill = options.backfill_mode,
            "workflow started"
        );
        self.sink
            .emit(
                names::WORKFLOW_STARTED,
                Some(json!({
                    "workflow": label,
                    "date": options.target_date,
                    "tasks": plan.iter().map(|t| t.job.as_str()).collect::<Vec<_>>(),
                    "correlation_id": options.correlation_id,
                })),
            )
            .await;

        let by_name: HashMap<&str, &PlannedTask> = plan.iter().map(|t| (t.job.as_str(), t)).collect();
        let mut children: HashMap<&str, Vec<&str>> = HashMap::new();
        let mut in_degree: HashMap<&str, usize> = HashMap::new();
        for task in &plan {
            let known: Vec<&str> = task
                .after
                .iter()
                .map(String::as_str)
                .filter(|dep| by_name.contains_key(dep))
                .collect();
            in_degree.insert(task.job.as_str(), known.len());
            for dep in known {
                children.entry(dep).or_default().push(task.job.as_str());
            }
        }

        let mut ready: VecDeque<&str> = plan
            .iter()
            .map(|t| t.job.as_str())
            .filter(|job| in_degree.get(job) == Some(&0))
            .collect();
        let mut blocked_by: HashMap<&str, String> = HashMap::new();
        let mut results: HashMap<String, TaskResult> = HashMap::new();
        let mut running: FuturesUnordered<Running> = FuturesUnordered::new();

        loop {
            while let Some(job) = ready.pop_front() {
                if let Some(parent) = blocked_by.get(job).cloned() {
                    let skipped =
                        TaskResult::skipped(job, format!("upstream task {parent} did not succeed"));
                    info!(workflow = label, job, upstream = %parent, "task skipped");
                    self.sink
                        .emit(names::TASK_SKIPPED, Some(json!({"job": job, "upstream": parent})))
                        .await;
                    results.insert(job.to_string(), skipped);
                    release(job, false, &children, &mut in_degree, &mut blocked_by, &mut ready);
                } else if let Some(task) = by_name.get(job) {
                    running.push(self.spawn(task, options));
                }
            }

            let Some((job, joined)) = running.next().await else {
                break;
            };
            let result = joined.unwrap_or_else(|e| {
                error!(workflow = label, job = %job, error = %e, "task panicked");
                TaskResult {
                    job: job.clone(),
                    status: TaskStatus::Failed,
                    outcome: None,
                    reason: Some(format!("task panicked: {e}")),
                    duration_ms: 0,
                    backfill_item_id: None,
                }
            });
            let succeeded = result.succeeded();
            results.insert(job.clone(), result);
            if let Some((name, _)) = by_name.get_key_value(job.as_str()) {
                release(*name, succeeded, &children, &mut in_degree, &mut blocked_by, &mut ready);
            }
        }

        let tasks: Vec<TaskResult> = plan
            .iter()
            .map(|t| {
                results
                    .remove(&t.job)
                    .unwrap_or_else(|| TaskResult::skipped(&t.job, "ordering could not be resolved"))
            })
            .collect();
        let status = RunStatus::summarize(tasks.iter().map(|t| t.status));
        let duration_ms = timer.finish();

        info!(workflow = label, status = %status, duration_ms, "workflow finished");
        self.sink
            .emit(
                names::WORKFLOW_COMPLETED,
                Some(json!({
                    "workflow": label,
                    "status": status,
                    "duration_ms": duration_ms,
                    "correlation_id": options.correlation_id,
                })),
            )
            .await;

        WorkflowResult {
            workflow_id: label.to_string(),
            status,
            tasks,
            duration_ms,
        }
    }

    fn spawn(&self, task: &PlannedTask, options: &JobOptions) -> Running {
        let runner = self.runner.clone();
        let semaphore = self.semaphore.clone();
        let options = options.clone();
        let job = task.job.clone();
        let timeout = task.timeout;

        let handle = tokio::spawn({
            let job = job.clone();
            async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return TaskResult::skipped(job, "executor pool closed");
                };
                runner.run(&job, &options, timeout).await
            }
        });
        async move { (job, handle.await) }.boxed()
    }
}

/// Marks `job` finished and queues children whose predecessors are all done.
fn release<'a>(
    job: &'a str,
    succeeded: bool,
    children: &HashMap<&'a str, Vec<&'a str>>,
    in_degree: &mut HashMap<&'a str, usize>,
    blocked_by: &mut HashMap<&'a str, String>,
    ready: &mut VecDeque<&'a str>,
) {
    for &child in children.get(job).into_iter().flatten() {
        if !succeeded {
            blocked_by.entry(child).or_insert_with(|| job.to_string());
        }
        if let Some(count) = in_degree.get_mut(child) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                ready.push_back(child);
            }
        }
    }
}
