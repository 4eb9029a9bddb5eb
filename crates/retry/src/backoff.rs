use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How the delay grows with the attempt number.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    /// `base * 2^(attempt - 1)`
    #[default]
    Exponential,
    /// `base * attempt`
    Linear,
    /// `base * fib(attempt)`
    Fibonacci,
}

/// Delay before retry number `attempt`, capped at `max`.
///
/// Attempts are 1-based; `attempt <= 0` returns `base` unchanged. Overflow
/// saturates to `max`.
pub fn compute(attempt: i32, base: Duration, max: Duration, strategy: BackoffStrategy) -> Duration {
    if attempt <= 0 {
        return base;
    }
    let n = attempt.unsigned_abs();
    let factor = match strategy {
        BackoffStrategy::Exponential => 1u64.checked_shl(n - 1).unwrap_or(u64::MAX),
        BackoffStrategy::Linear => u64::from(n),
        BackoffStrategy::Fibonacci => fibonacci(n),
    };
    let factor = u32::try_from(factor).unwrap_or(u32::MAX);
    base.checked_mul(factor).map_or(max, |delay| delay.min(max))
}

/// `fib(1) = fib(2) = 1`, saturating.
fn fibonacci(n: u32) -> u64 {
    let (mut prev, mut cur) = (0u64, 1u64);
    for _ in 1..n {
        let next = prev.saturating_add(cur);
        prev = cur;
        cur = next;
    }
    cur
}

/// Backoff parameters as they appear in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    #[serde(with = "millis", rename = "base_ms")]
    pub base: Duration,
    #[serde(with = "millis", rename = "max_ms")]
    pub max: Duration,
    #[serde(default)]
    pub strategy: BackoffStrategy,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(60),
            strategy: BackoffStrategy::Exponential,
        }
    }
}

impl BackoffPolicy {
    pub fn delay(&self, attempt: i32) -> Duration {
        compute(attempt, self.base, self.max, self.strategy)
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: Duration = Duration::from_millis(100);
    const MAX: Duration = Duration::from_secs(5);

    #[test]
    fn exponential_doubles_from_base() {
        let delays: Vec<_> = (1..=5)
            .map(|n| compute(n, BASE, MAX, BackoffStrategy::Exponential))
            .collect();
        assert_eq!(
            delays,
            [100, 200, 400, 800, 1600].map(Duration::from_millis)
        );
    }

    #[test]
    fn exponential_is_capped() {
        assert_eq!(compute(7, BASE, MAX, BackoffStrategy::Exponential), MAX);
        assert_eq!(compute(64, BASE, MAX, BackoffStrategy::Exponential), MAX);
        assert_eq!(compute(i32::MAX, BASE, MAX, BackoffStrategy::Exponential), MAX);
    }

    #[test]
    fn non_positive_attempt_returns_base() {
        for strategy in [
            BackoffStrategy::Exponential,
            BackoffStrategy::Linear,
            BackoffStrategy::Fibonacci,
        ] {
            assert_eq!(compute(0, BASE, MAX, strategy), BASE);
            assert_eq!(compute(-3, BASE, MAX, strategy), BASE);
        }
    }

    #[test]
    fn linear_grows_by_base() {
        assert_eq!(compute(1, BASE, MAX, BackoffStrategy::Linear), BASE);
        assert_eq!(
            compute(3, BASE, MAX, BackoffStrategy::Linear),
            Duration::from_millis(300)
        );
        assert_eq!(compute(500, BASE, MAX, BackoffStrategy::Linear), MAX);
    }

    #[test]
    fn fibonacci_sequence() {
        let delays: Vec<_> = (1..=7)
            .map(|n| compute(n, BASE, MAX, BackoffStrategy::Fibonacci).as_millis())
            .collect();
        assert_eq!(delays, [100, 100, 200, 300, 500, 800, 1300]);
        assert_eq!(compute(200, BASE, MAX, BackoffStrategy::Fibonacci), MAX);
    }

    #[test]
    fn policy_parses_from_yaml_like_json() {
        let policy: BackoffPolicy =
            serde_json::from_str(r#"{"base_ms": 250, "max_ms": 2000, "strategy": "linear"}"#)
                .unwrap();
        assert_eq!(policy.delay(2), Duration::from_millis(500));
        assert_eq!(policy.delay(100), Duration::from_secs(2));
    }
}
