//! Per-(job, entity, date) circuit breaker.
//!
//! CLOSED while attempts are below the ceiling, OPEN from the ceiling-th
//! failed attempt until the cooldown elapses. Time never resets the counter;
//! only success or an operator reset does.

use super::store::{RetryKey, RetryRecord, RetryStore};
use crate::config::BreakerConfig;
use crate::errors::Result;
use crate::utils::{Clock, SystemClock, Timestamp};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Current breaker state for a key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerState {
    /// True while retries are blocked.
    pub active: bool,
    /// Failed attempts recorded.
    pub attempts: u32,
    /// End of the cooldown, if the breaker has tripped.
    pub cooldown_until: Option<Timestamp>,
}

impl BreakerState {
    fn closed() -> Self {
        Self {
            active: false,
            attempts: 0,
            cooldown_until: None,
        }
    }

    fn from_record(record: &RetryRecord, now: Timestamp) -> Self {
        let active = record.tripped && record.cooldown_until.is_some_and(|until| now < until);
        Self {
            active,
            attempts: record.attempts,
            cooldown_until: record.cooldown_until,
        }
    }

    /// Returns true if a new attempt may run.
    #[must_use]
    pub fn permits_attempt(&self) -> bool {
        !self.active
    }
}

/// Stops retry storms for a single unit of work.
pub struct CircuitBreaker {
    store: Arc<dyn RetryStore>,
    config: BreakerConfig,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl CircuitBreaker {
    /// Creates a breaker over a shared store.
    #[must_use]
    pub fn new(store: Arc<dyn RetryStore>, config: BreakerConfig) -> Self {
        Self {
            store,
            config,
            clock: Arc::new(SystemClock),
        }
    }

    /// Sets the clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn cooldown(&self) -> Duration {
        Duration::hours(i64::from(self.config.cooldown_hours))
    }

    /// Returns the state for `key`.
    pub async fn check(&self, key: &RetryKey) -> Result<BreakerState> {
        let now = self.clock.now();
        Ok(self
            .store
            .get(key)
            .await?
            .map_or_else(BreakerState::closed, |r| BreakerState::from_record(&r, now)))
    }

    /// Records one failed attempt, tripping at the ceiling.
    pub async fn record_attempt(&self, key: &RetryKey) -> Result<BreakerState> {
        let now = self.clock.now();
        let mut record = self.store.increment(key, now).await?;
        let already_open = BreakerState::from_record(&record, now).active;

        if already_open {
            debug!(key = %key, attempts = record.attempts, "attempt recorded while breaker open");
        } else if record.attempts >= self.config.max_attempts {
            let until = now + self.cooldown();
            self.store.trip(key, until).await?;
            record.tripped = true;
            record.cooldown_until = Some(until);
            warn!(
                key = %key,
                attempts = record.attempts,
                cooldown_until = %until,
                "circuit breaker tripped"
            );
        } else {
            debug!(key = %key, attempts = record.attempts, "retry attempt recorded");
        }

        Ok(BreakerState::from_record(&record, now))
    }

    /// Clears the record after a successful run.
    pub async fn record_success(&self, key: &RetryKey) -> Result<()> {
        if self.store.clear(key).await? {
            info!(key = %key, "retry record cleared after success");
        }
        Ok(())
    }

    /// Operator override: clears the record regardless of state.
    pub async fn reset(&self, key: &RetryKey) -> Result<bool> {
        let existed = self.store.clear(key).await?;
        info!(key = %key, existed, "circuit breaker reset by operator");
        Ok(existed)
    }

    /// Returns records whose cooldown is still running.
    pub async fn list_tripped(&self) -> Result<Vec<RetryRecord>> {
        let now = self.clock.now();
        let mut tripped: Vec<RetryRecord> = self
            .store
            .list()
            .await?
            .into_iter()
            .filter(|r| BreakerState::from_record(r, now).active)
            .collect();
        tripped.sort_by(|a, b| a.cooldown_until.cmp(&b.cooldown_until));
        Ok(tripped)
    }
}
