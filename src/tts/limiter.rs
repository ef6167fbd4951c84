use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Semaphore, SemaphorePermit};
use tokio::time::{Instant, sleep};
use tracing::warn;

use super::error::SynthesisError;

/// Retry behavior for transient provider failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Upper bound of the random delay added to every backoff.
    #[serde(default = "default_jitter_ms")]
    pub jitter_ms: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_jitter_ms() -> u64 {
    250
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter_ms: default_jitter_ms(),
        }
    }
}

impl RetryPolicy {
    /// delay = base_delay_ms * 2^(attempt - 1), capped at `max_delay_ms`.
    pub fn delay_for_attempt(&self, attempt: u32) -> u64 {
        let factor = 1u64
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u64::MAX);
        self.base_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms)
    }

    /// Backoff for `attempt` with jitter, still capped at `max_delay_ms`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let jitter = if self.jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=self.jitter_ms)
        };
        let ms = self
            .delay_for_attempt(attempt)
            .saturating_add(jitter)
            .min(self.max_delay_ms);
        Duration::from_millis(ms)
    }
}

/// Per-provider outbound call policy: at most `max_concurrent` calls in
/// flight and at least `60s / requests_per_minute` between call starts.
#[derive(Debug)]
pub struct RateLimiter {
    permits: Semaphore,
    min_interval: Duration,
    next_slot: Mutex<Instant>,
}

impl RateLimiter {
    pub fn new(max_concurrent: usize, requests_per_minute: u32) -> Self {
        let min_interval = if requests_per_minute == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(60_000 / u64::from(requests_per_minute))
        };
        Self {
            permits: Semaphore::new(max_concurrent.max(1)),
            min_interval,
            next_slot: Mutex::new(Instant::now()),
        }
    }

    /// Wait for a concurrency slot and for the pacing window.
    pub async fn acquire(&self) -> Result<SemaphorePermit<'_>, SynthesisError> {
        let permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| SynthesisError::Unavailable("rate limiter closed".into()))?;
        let wait = {
            let mut next = self.next_slot.lock().await;
            let now = Instant::now();
            let slot = (*next).max(now);
            *next = slot + self.min_interval;
            slot - now
        };
        if !wait.is_zero() {
            sleep(wait).await;
        }
        Ok(permit)
    }

    /// Run `op` under the limiter, retrying transient failures per `policy`.
    pub async fn execute<T, F, Fut>(
        &self,
        policy: &RetryPolicy,
        provider: &str,
        mut op: F,
    ) -> Result<T, SynthesisError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, SynthesisError>>,
    {
        retry(
            policy,
            provider,
            SynthesisError::is_transient,
            |err: &SynthesisError| err.retry_after_ms().map(Duration::from_millis),
            || {
                let call = op();
                async move {
                    let _permit = self.acquire().await?;
                    call.await
                }
            },
        )
        .await
    }
}

/// Run `op` until it succeeds, fails with an error `is_transient` rejects,
/// or `policy.max_retries` retries are spent.
///
/// `retry_after` lets a failure raise the delay floor, as a 429 with a
/// `retry-after` header does.
pub async fn retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    what: &str,
    is_transient: impl Fn(&E) -> bool,
    retry_after: impl Fn(&E) -> Option<Duration>,
    mut op: F,
) -> Result<T, E>
where
    E: std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if is_transient(&err) && attempt < policy.max_retries => {
                attempt += 1;
                let mut delay = policy.backoff(attempt);
                if let Some(floor) = retry_after(&err) {
                    delay = delay.max(floor);
                }
                warn!(
                    what,
                    attempt,
                    max_retries = policy.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retrying after transient failure"
                );
                sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}
