//! Exponential backoff with jitter, plus a generic retry wrapper.
//!
//! The scheduler uses `BackoffPolicy` directly to pace cycles after an
//! escaped error; collaborator calls can be wrapped with [`with_retry`] for
//! bounded retries with an observability callback.

use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Fraction of the current delay used for symmetric jitter.
const JITTER_FRACTION: f64 = 0.25;

/// Exponential delay generator.
///
/// Growth is applied to the stored delay; jitter is applied only to the
/// emitted value, so repeated emissions never compound the randomness.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    initial: Duration,
    max: Duration,
    multiplier: f64,
    current: Duration,
}

impl BackoffPolicy {
    #[must_use]
    pub const fn new(initial: Duration, max: Duration, multiplier: f64) -> Self {
        Self {
            initial,
            max,
            multiplier,
            current: initial,
        }
    }

    /// Emits the next delay (with ±25% jitter) and grows the stored delay,
    /// capped at the configured maximum.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.current;
        let jitter = rand::thread_rng().gen_range(-JITTER_FRACTION..=JITTER_FRACTION);
        let emitted = base.mul_f64(1.0 + jitter);

        let grown = base.mul_f64(self.multiplier);
        self.current = grown.min(self.max);

        emitted
    }

    /// Sleeps for the next delay.
    pub async fn wait(&mut self) {
        tokio::time::sleep(self.next_delay()).await;
    }

    /// Restores the policy to its initial delay.
    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

type RetryPredicate<E> = Box<dyn Fn(&E) -> bool + Send + Sync>;
type RetryCallback<E> = Box<dyn Fn(u32, &E, Duration) + Send + Sync>;

/// Options for [`with_retry`].
pub struct RetryOptions<E> {
    pub max_attempts: u32,
    /// Decides whether a given error is worth retrying. Defaults to always.
    pub should_retry: RetryPredicate<E>,
    /// Invoked before each retry with the attempt number, the error, and the
    /// chosen delay.
    pub on_retry: Option<RetryCallback<E>>,
}

impl<E> Default for RetryOptions<E> {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            should_retry: Box::new(|_| true),
            on_retry: None,
        }
    }
}

/// Retries a fallible async operation with exponential backoff.
///
/// The final error is returned unchanged once attempts are exhausted or the
/// retryability predicate rejects it.
///
/// # Errors
///
/// Returns the last error produced by `op`.
pub async fn with_retry<T, E, F, Fut>(
    policy: &mut BackoffPolicy,
    options: RetryOptions<E>,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                if attempt >= options.max_attempts || !(options.should_retry)(&e) {
                    return Err(e);
                }
                let delay = policy.next_delay();
                if let Some(ref on_retry) = options.on_retry {
                    on_retry(attempt, &e, delay);
                }
                tokio::time::sleep(delay).await;
            }
        }
    }
}
