//! Reconnection schedules for hosts marked down

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::RngExt;
use rand::rngs::StdRng;

/// Produces a fresh schedule each time a host goes down
pub trait ReconnectionPolicy: Send + Sync + Debug {
    fn new_schedule(&self) -> Box<dyn ReconnectionSchedule>;
}

/// Sequence of delays between reconnection attempts to one host
pub trait ReconnectionSchedule: Send + Debug {
    fn next_delay(&mut self) -> Duration;
}

/// Same delay between every attempt
#[derive(Debug, Clone)]
pub struct ConstantReconnectionPolicy {
    delay: Duration,
}

impl ConstantReconnectionPolicy {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl ReconnectionPolicy for ConstantReconnectionPolicy {
    fn new_schedule(&self) -> Box<dyn ReconnectionSchedule> {
        Box::new(ConstantSchedule { delay: self.delay })
    }
}

#[derive(Debug)]
struct ConstantSchedule {
    delay: Duration,
}

impl ReconnectionSchedule for ConstantSchedule {
    fn next_delay(&mut self) -> Duration {
        self.delay
    }
}

/// Exponential backoff capped at `max_delay`, with optional jitter
#[derive(Debug, Clone)]
pub struct ExponentialReconnectionPolicy {
    base_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    jitter: Option<Arc<Mutex<StdRng>>>,
}

impl ExponentialReconnectionPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay: max_delay.max(base_delay),
            multiplier: 2.0,
            jitter: None,
        }
    }

    #[must_use]
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier.max(1.0);
        self
    }

    /// Add up to 30% random delay drawn from `rng`
    #[must_use]
    pub fn with_jitter(mut self, rng: Arc<Mutex<StdRng>>) -> Self {
        self.jitter = Some(rng);
        self
    }

    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }
}

impl ReconnectionPolicy for ExponentialReconnectionPolicy {
    fn new_schedule(&self) -> Box<dyn ReconnectionSchedule> {
        Box::new(ExponentialSchedule {
            policy: self.clone(),
            next: self.base_delay,
        })
    }
}

#[derive(Debug)]
struct ExponentialSchedule {
    policy: ExponentialReconnectionPolicy,
    next: Duration,
}

impl ReconnectionSchedule for ExponentialSchedule {
    fn next_delay(&mut self) -> Duration {
        let mut delay = self.next;
        self.next = Duration::from_secs_f64(
            (self.next.as_secs_f64() * self.policy.multiplier)
                .min(self.policy.max_delay.as_secs_f64()),
        );

        if let Some(rng) = &self.policy.jitter {
            let jitter = rng.lock().random_range(0.0..0.3);
            #[allow(clippy::cast_precision_loss)]
            let jitter_ms = (delay.as_millis() as f64 * jitter) as u64;
            delay += Duration::from_millis(jitter_ms);
        }
        delay.min(self.policy.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn test_constant_schedule() {
        let mut schedule = ConstantReconnectionPolicy::new(Duration::from_secs(3)).new_schedule();
        assert_eq!(schedule.next_delay(), Duration::from_secs(3));
        assert_eq!(schedule.next_delay(), Duration::from_secs(3));
    }

    #[test]
    fn test_exponential_doubles_then_caps() {
        let policy =
            ExponentialReconnectionPolicy::new(Duration::from_secs(1), Duration::from_secs(10));
        let mut schedule = policy.new_schedule();
        let delays: Vec<_> = (0..6).map(|_| schedule.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 10, 10]);
    }

    #[test]
    fn test_new_schedule_restarts() {
        let policy =
            ExponentialReconnectionPolicy::new(Duration::from_millis(100), Duration::from_secs(60));
        let mut first = policy.new_schedule();
        first.next_delay();
        first.next_delay();
        assert_eq!(policy.new_schedule().next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let rng = Arc::new(Mutex::new(StdRng::seed_from_u64(7)));
        let policy =
            ExponentialReconnectionPolicy::new(Duration::from_secs(1), Duration::from_secs(60))
                .with_jitter(rng);
        let mut schedule = policy.new_schedule();
        for base in [1000u128, 2000, 4000, 8000] {
            let delay = schedule.next_delay().as_millis();
            assert!(delay >= base && delay < base * 13 / 10, "{delay} for base {base}");
        }
    }
}
