//! Name-to-job registry built at startup.

use super::contract::{Job, JobOptions, JobOutcome};
use crate::errors::JobError;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Registry of job entry points.
#[derive(Default)]
pub struct JobRegistry {
    jobs: RwLock<HashMap<String, Arc<dyn Job>>>,
}

impl std::fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRegistry")
            .field("jobs", &self.names())
            .finish()
    }
}

impl JobRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a job under its own name, replacing any previous one.
    pub fn register(&self, job: Arc<dyn Job>) {
        let name = job.name().to_string();
        if self.jobs.write().insert(name.clone(), job).is_some() {
            warn!(job = %name, "job re-registered, previous entry replaced");
        } else {
            debug!(job = %name, "job registered");
        }
    }

    /// Builder-style registration.
    #[must_use]
    pub fn with_job(self, job: impl Job + 'static) -> Self {
        self.register(Arc::new(job));
        self
    }

    /// Looks up a job.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn Job>> {
        self.jobs.read().get(name).cloned()
    }

    /// Returns true if `name` is registered.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.jobs.read().contains_key(name)
    }

    /// Registered names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.jobs.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Runs a registered job.
    pub async fn run(&self, name: &str, options: &JobOptions) -> Result<JobOutcome, JobError> {
        let job = self
            .get(name)
            .ok_or_else(|| JobError::NotRegistered(name.to_string()))?;
        job.run(options).await
    }
}
