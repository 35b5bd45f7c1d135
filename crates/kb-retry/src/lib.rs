//! Retry/backoff and per-call timeout policy used by every adapter that
//! crosses a process boundary (`kb-blob`, `kb-models`, `kb-index`): a
//! builder producing an immutable policy, consumed by a generic `retry`
//! driver.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl RetryPolicy {
    pub fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder::default()
    }

    /// Exponential backoff for the given zero-based attempt index,
    /// optionally jittered uniformly in `[0, delay]` to avoid thundering
    /// herds against the same model/index endpoint.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = self.base_delay.as_millis().saturating_mul(1u128 << attempt.min(20));
        let capped = exp.min(self.max_delay.as_millis());
        let mut millis = capped as u64;
        if self.jitter && millis > 0 {
            millis = rand::thread_rng().gen_range(0..=millis);
        }
        Duration::from_millis(millis)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            jitter: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RetryPolicyBuilder {
    max_attempts: Option<u32>,
    base_delay: Option<Duration>,
    max_delay: Option<Duration>,
    jitter: Option<bool>,
}

impl RetryPolicyBuilder {
    pub fn max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = Some(n);
        self
    }

    pub fn base_delay(mut self, d: Duration) -> Self {
        self.base_delay = Some(d);
        self
    }

    pub fn max_delay(mut self, d: Duration) -> Self {
        self.max_delay = Some(d);
        self
    }

    pub fn jitter(mut self, enabled: bool) -> Self {
        self.jitter = Some(enabled);
        self
    }

    pub fn build(self) -> RetryPolicy {
        let default = RetryPolicy::default();
        RetryPolicy {
            max_attempts: self.max_attempts.unwrap_or(default.max_attempts),
            base_delay: self.base_delay.unwrap_or(default.base_delay),
            max_delay: self.max_delay.unwrap_or(default.max_delay),
            jitter: self.jitter.unwrap_or(default.jitter),
        }
    }
}

/// Per-call deadline configuration. `embed` uses 30s, `vlm` uses 120s per
/// spec §4.4; adapters pick the constant appropriate to the call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeoutConfig {
    pub per_call: Duration,
}

impl TimeoutConfig {
    pub const EMBED: TimeoutConfig = TimeoutConfig { per_call: Duration::from_secs(30) };
    pub const VLM: TimeoutConfig = TimeoutConfig { per_call: Duration::from_secs(120) };
    pub const STORAGE: TimeoutConfig = TimeoutConfig { per_call: Duration::from_secs(15) };
    pub const INDEX: TimeoutConfig = TimeoutConfig { per_call: Duration::from_secs(20) };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    Retryable,
    NonRetryable,
}

/// Runs `f` under `policy`, retrying while `classify` marks the error
/// `Retryable` and attempts remain. 4xx-equivalent errors must classify
/// as `NonRetryable` by the caller per spec §4.4.
pub async fn retry<F, Fut, T, E>(
    policy: &RetryPolicy,
    mut f: F,
    classify: impl Fn(&E) -> RetryOutcome,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0u32;
    loop {
        match f().await {
            Ok(v) => return Ok(v),
            Err(e) => {
                let is_last = attempt + 1 >= policy.max_attempts;
                let retryable = classify(&e) == RetryOutcome::Retryable;
                if is_last || !retryable {
                    return Err(e);
                }
                let delay = policy.delay_for_attempt(attempt);
                warn!(attempt, delay_ms = delay.as_millis() as u64, "retrying after transient failure");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

/// Wraps a future with [`TimeoutConfig`]'s per-call deadline, mapping a
/// timeout into the caller-supplied `on_timeout` error constructor.
pub async fn with_timeout<Fut, T, E>(
    cfg: TimeoutConfig,
    fut: Fut,
    on_timeout: impl FnOnce() -> E,
) -> Result<T, E>
where
    Fut: Future<Output = Result<T, E>>,
{
    match tokio::time::timeout(cfg.per_call, fut).await {
        Ok(inner) => inner,
        Err(_) => Err(on_timeout()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn retries_until_success() {
        let policy = RetryPolicy::builder().max_attempts(5).jitter(false).build();
        let calls = AtomicU32::new(0);
        let result: Result<u32, &str> = retry(
            &policy,
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err("transient")
                    } else {
                        Ok(42)
                    }
                }
            },
            |_| RetryOutcome::Retryable,
        )
        .await;
        assert_eq!(result, Ok(42));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_fails_fast() {
        let policy = RetryPolicy::builder().max_attempts(5).build();
        let calls = AtomicU32::new(0);
        let result: Result<u32, &str> = retry(
            &policy,
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("bad request") }
            },
            |_| RetryOutcome::NonRetryable,
        )
        .await;
        assert_eq!(result, Err("bad request"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn delay_grows_and_caps() {
        let policy = RetryPolicy::builder()
            .base_delay(Duration::from_millis(100))
            .max_delay(Duration::from_secs(1))
            .jitter(false)
            .build();
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(1));
    }
}
