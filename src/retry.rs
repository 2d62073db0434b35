use rand::{thread_rng, Rng};
use std::time::{Duration, Instant};

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum RetryStrategy {
    /// Same delay between every attempt.
    Fixed,
    /// Each delay is the previous one multiplied by `factor`.
    Backoff { factor: f64 },
}

/// Reconnect strategy. `max_attempts == None` retries forever.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    strategy: RetryStrategy,
    max_attempts: Option<usize>,
    base_delay: Duration,
    max_delay: Option<Duration>,
    jitter_fraction: f64,
    time_budget: Option<Duration>,
}

impl RetryPolicy {
    /// `max_attempts` of zero means unlimited.
    pub fn fixed(max_attempts: usize, base_delay: Duration) -> Self {
        Self::new(RetryStrategy::Fixed, max_attempts, base_delay)
    }

    /// `max_attempts` of zero means unlimited. Factors at or below 1.0 degrade to fixed.
    pub fn backoff(max_attempts: usize, base_delay: Duration, factor: f64) -> Self {
        let strategy = if factor > 1.0 && factor.is_finite() {
            RetryStrategy::Backoff { factor }
        } else {
            RetryStrategy::Fixed
        };
        Self::new(strategy, max_attempts, base_delay)
    }

    fn new(strategy: RetryStrategy, max_attempts: usize, base_delay: Duration) -> Self {
        Self {
            strategy,
            max_attempts: (max_attempts > 0).then_some(max_attempts),
            base_delay,
            max_delay: None,
            jitter_fraction: 0.0,
            time_budget: None,
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = if max_delay.is_zero() {
            None
        } else {
            Some(max_delay)
        };
        self
    }

    pub fn with_jitter(mut self, fraction: f64) -> Self {
        self.jitter_fraction = fraction.max(0.0);
        self
    }

    pub fn with_time_budget(mut self, budget: Option<Duration>) -> Self {
        self.time_budget = budget.filter(|duration| !duration.is_zero());
        self
    }

    pub fn strategy(&self) -> RetryStrategy {
        self.strategy
    }

    pub fn max_attempts(&self) -> Option<usize> {
        self.max_attempts
    }

    pub fn handle(&self) -> RetryHandle {
        self.handle_from(Instant::now())
    }

    pub fn handle_from(&self, start: Instant) -> RetryHandle {
        let deadline = self
            .time_budget
            .and_then(|budget| start.checked_add(budget));
        RetryHandle {
            policy: self.clone(),
            attempts: 0,
            deadline,
        }
    }

    fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if self.base_delay.is_zero() {
            return Duration::ZERO;
        }
        let base = self.base_delay.as_millis() as f64;
        let raw_millis = match self.strategy {
            RetryStrategy::Fixed => base,
            RetryStrategy::Backoff { factor } => {
                let exponent = attempt.saturating_sub(1).min(i32::MAX as usize) as i32;
                base * factor.powi(exponent)
            }
        };
        let cap = self
            .max_delay
            .map(|max| max.as_millis() as f64)
            .unwrap_or(u64::MAX as f64);
        let bounded = raw_millis.min(cap);
        if bounded <= 0.0 || self.jitter_fraction <= 0.0 {
            return Duration::from_millis(bounded.round() as u64);
        }
        let jitter = self.jitter_fraction.min(1.0);
        let min = (1.0 - jitter).max(0.0);
        let max = 1.0 + jitter;
        let factor = thread_rng().gen_range(min..=max);
        let jittered = (bounded * factor).round().max(0.0);
        Duration::from_millis(jittered.min(u64::MAX as f64) as u64)
    }
}

/// Tracks attempts made under a [`RetryPolicy`].
pub struct RetryHandle {
    policy: RetryPolicy,
    attempts: usize,
    deadline: Option<Instant>,
}

impl RetryHandle {
    /// Called after a failed attempt. Returns the delay before the next one, or
    /// `None` once the policy is exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if let Some(max) = self.policy.max_attempts {
            if self.attempts + 1 >= max {
                return None;
            }
        }
        let next = self.attempts + 1;
        let delay = self.policy.delay_for_attempt(next);
        if let Some(deadline) = self.deadline {
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            if !delay.is_zero() {
                match now.checked_add(delay) {
                    Some(next_instant) if next_instant <= deadline => {}
                    _ => return None,
                }
            }
        }
        self.attempts = next;
        Some(delay)
    }

    /// Number of retries granted so far.
    pub fn attempts(&self) -> usize {
        self.attempts
    }
}
