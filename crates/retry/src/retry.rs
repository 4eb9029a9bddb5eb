use std::fmt;
use std::future::Future;
use std::time::Duration;

use tracing::debug;

use crate::context::{Context, ContextError};

/// Upper bound on the random extra added to each delay, as a fraction of it.
const MAX_JITTER: f64 = 0.3;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first; `0` and `1` both mean "no retry".
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Applied to the delay after every failed attempt. Values below 1 are
    /// treated as 1.
    pub multiplier: f64,
    /// Add up to 30% random extra to each delay (still capped at `max_delay`).
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    fn next_delay(&self, delay: Duration) -> Duration {
        let multiplier = if self.multiplier.is_finite() && self.multiplier >= 1.0 {
            self.multiplier
        } else {
            1.0
        };
        Duration::try_from_secs_f64(delay.as_secs_f64() * multiplier)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if !self.jitter || delay.is_zero() {
            return delay.min(self.max_delay);
        }
        let extra = delay.mul_f64(rand::random::<f64>() * MAX_JITTER);
        delay.saturating_add(extra).min(self.max_delay)
    }
}

/// Failure of a retried operation.
#[derive(Debug)]
pub enum RetryError<E> {
    /// The context finished before or between attempts.
    Interrupted {
        reason: ContextError,
        attempts: u32,
        last_error: Option<E>,
    },
    /// The predicate rejected the error; no further attempts were made.
    NonRetryable { attempt: u32, source: E },
    /// Every allowed attempt failed.
    Exhausted { attempts: u32, source: E },
}

impl<E> RetryError<E> {
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Interrupted { attempts, .. } | Self::Exhausted { attempts, .. } => *attempts,
            Self::NonRetryable { attempt, .. } => *attempt,
        }
    }

    pub fn is_interrupted(&self) -> bool {
        matches!(self, Self::Interrupted { .. })
    }

    pub fn last_error(&self) -> Option<&E> {
        match self {
            Self::Interrupted { last_error, .. } => last_error.as_ref(),
            Self::NonRetryable { source, .. } | Self::Exhausted { source, .. } => Some(source),
        }
    }

    pub fn into_last_error(self) -> Option<E> {
        match self {
            Self::Interrupted { last_error, .. } => last_error,
            Self::NonRetryable { source, .. } | Self::Exhausted { source, .. } => Some(source),
        }
    }
}

impl<E: fmt::Display> fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Interrupted {
                reason, attempts, ..
            } => write!(f, "retry interrupted after {attempts} attempt(s): {reason}"),
            Self::NonRetryable { attempt, source } => {
                write!(f, "non-retryable error on attempt {attempt}: {source}")
            }
            Self::Exhausted { attempts, source } => {
                write!(f, "max attempts exceeded ({attempts}): {source}")
            }
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for RetryError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Interrupted { reason, .. } => Some(reason),
            Self::NonRetryable { source, .. } | Self::Exhausted { source, .. } => Some(source),
        }
    }
}

type Predicate<E> = Box<dyn Fn(&E) -> bool + Send + Sync>;

/// Cancelable retry loop.
///
/// ```ignore
/// let result = Retry::new(RetryPolicy::attempts(5))
///     .retry_if(|e: &io::Error| e.kind() != io::ErrorKind::NotFound)
///     .run(&ctx, |attempt| async move { fetch(attempt).await })
///     .await;
/// ```
pub struct Retry<E> {
    policy: RetryPolicy,
    is_retryable: Option<Predicate<E>>,
}

impl<E> Retry<E> {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            is_retryable: None,
        }
    }

    /// Only retry errors for which `predicate` returns `true`.
    pub fn retry_if(mut self, predicate: impl Fn(&E) -> bool + Send + Sync + 'static) -> Self {
        self.is_retryable = Some(Box::new(predicate));
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    fn retryable(&self, err: &E) -> bool {
        self.is_retryable.as_ref().is_none_or(|f| f(err))
    }

    /// Run `op` until it succeeds, fails permanently, runs out of attempts, or
    /// `ctx` finishes. `op` receives the 1-based attempt number.
    pub async fn run<T, F, Fut>(&self, ctx: &Context, mut op: F) -> Result<T, RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut delay = self.policy.initial_delay;
        let mut attempt = 0u32;
        let mut last_error = None;

        loop {
            if let Some(reason) = ctx.err() {
                return Err(RetryError::Interrupted {
                    reason,
                    attempts: attempt,
                    last_error,
                });
            }
            attempt += 1;

            let err = match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if !self.retryable(&err) {
                debug!(attempt, error = %err, "non-retryable error");
                return Err(RetryError::NonRetryable {
                    attempt,
                    source: err,
                });
            }
            if attempt >= max_attempts {
                debug!(attempt, error = %err, "max attempts exceeded");
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    source: err,
                });
            }

            let wait = self.policy.jittered(delay);
            debug!(attempt, max_attempts, wait_ms = wait.as_millis() as u64, error = %err, "attempt failed, backing off");
            last_error = Some(err);

            if let Err(reason) = ctx.sleep(wait).await {
                return Err(RetryError::Interrupted {
                    reason,
                    attempts: attempt,
                    last_error,
                });
            }
            delay = self.policy.next_delay(delay);
        }
    }
}

/// [`Retry::run`] with no retry predicate.
pub async fn retry<T, E, F, Fut>(
    ctx: &Context,
    policy: RetryPolicy,
    op: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Display,
{
    Retry::new(policy).run(ctx, op).await
}
