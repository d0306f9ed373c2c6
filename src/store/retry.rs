//! Optimistic-concurrency retry
//!
//! Every write to a cluster object goes through [`read_modify_write`]:
//! fetch the latest version, apply the mutation, submit, and start over on
//! a version conflict until the step budget runs out.

use crate::domain::ports::{Object, ResourceStore};
use crate::error::{Error, Result};
use backoff::backoff::Backoff;
use backoff::ExponentialBackoffBuilder;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Bounded exponential backoff for conflict retries
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub steps: u32,
    pub initial_interval: Duration,
    pub multiplier: f64,
    pub randomization_factor: f64,
    pub max_interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            steps: 5,
            initial_interval: Duration::from_millis(10),
            multiplier: 2.0,
            randomization_factor: 0.1,
            max_interval: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    fn backoff(&self) -> backoff::ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial_interval)
            .with_multiplier(self.multiplier)
            .with_randomization_factor(self.randomization_factor)
            .with_max_interval(self.max_interval)
            .with_max_elapsed_time(None)
            .build()
    }
}

/// Tracks the attempt budget of one retry loop
struct Attempts {
    backoff: backoff::ExponentialBackoff,
    attempt: u32,
    steps: u32,
    fallback: Duration,
}

impl Attempts {
    fn new(policy: &RetryPolicy) -> Self {
        Self {
            backoff: policy.backoff(),
            attempt: 1,
            steps: policy.steps,
            fallback: policy.max_interval,
        }
    }

    /// Delay before the next attempt, or None when `err` is final
    fn next_delay(&mut self, err: &Error) -> Option<Duration> {
        if !err.is_conflict() || self.attempt >= self.steps {
            return None;
        }
        self.attempt += 1;
        Some(self.backoff.next_backoff().unwrap_or(self.fallback))
    }
}

/// Run `op`, retrying only on `Error::Conflict`
pub async fn retry_on_conflict<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempts = Attempts::new(policy);
    loop {
        match op().await {
            Err(err) => match attempts.next_delay(&err) {
                Some(delay) => {
                    debug!("{}, retrying in {:?}", err, delay);
                    tokio::time::sleep(delay).await;
                }
                None => return Err(err),
            },
            ok => return ok,
        }
    }
}

/// Re-fetch `name`, apply `mutate`, and submit, retrying on conflict.
///
/// `mutate` returns whether it changed anything; an unchanged object is not
/// written and `Ok(None)` is returned. "Not found" is propagated so the
/// caller can decide whether it is benign.
pub async fn read_modify_write<K, S, F>(
    store: &S,
    name: &str,
    policy: &RetryPolicy,
    mut mutate: F,
) -> Result<Option<K>>
where
    K: Object,
    S: ResourceStore<K> + ?Sized,
    F: FnMut(&mut K) -> Result<bool>,
{
    let mut attempts = Attempts::new(policy);
    loop {
        let result = async {
            let mut object = store.get(name).await?;
            if !mutate(&mut object)? {
                return Ok(None);
            }
            store.update(&object).await.map(Some)
        }
        .await;

        match result {
            Err(err) => match attempts.next_delay(&err) {
                Some(delay) => {
                    debug!("{}, re-reading {} in {:?}", err, name, delay);
                    tokio::time::sleep(delay).await;
                }
                None => return Err(err),
            },
            ok => return ok,
        }
    }
}
