use std::time::Duration;

/// Doubling backoff with a fixed ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub ceiling: Duration,
}

impl BackoffPolicy {
    pub fn new(base: Duration, ceiling: Duration) -> Self {
        Self { base, ceiling }
    }

    /// Delay to use after `current`: twice as long, capped at the ceiling.
    pub fn next_backoff(&self, current: Duration) -> Duration {
        current.saturating_mul(2).min(self.ceiling)
    }

    pub fn reset_backoff(&self) -> Duration {
        self.base
    }
}

/// Backoff state of one session.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    current: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            current: policy.reset_backoff(),
            attempt: 0,
        }
    }

    /// Delay to sleep now. The following call returns the doubled delay.
    pub fn next_delay(&mut self) -> Duration {
        self.attempt += 1;
        let delay = self.current;
        self.current = self.policy.next_backoff(self.current);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.policy.reset_backoff();
        self.attempt = 0;
    }

    /// Delay the next failure will sleep for.
    pub fn current(&self) -> Duration {
        self.current
    }

    pub fn get_attempt(&self) -> u32 {
        self.attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(millis: u64) -> Duration {
        Duration::from_millis(millis)
    }

    #[test]
    fn test_next_backoff_doubles_up_to_ceiling() {
        let policy = BackoffPolicy::new(ms(500), ms(10_000));
        let mut delay = policy.reset_backoff();
        let mut sequence = vec![delay];
        for _ in 0..6 {
            delay = policy.next_backoff(delay);
            sequence.push(delay);
        }
        assert_eq!(
            sequence,
            vec![
                ms(500),
                ms(1000),
                ms(2000),
                ms(4000),
                ms(8000),
                ms(10_000),
                ms(10_000)
            ]
        );
    }

    #[test]
    fn test_tracker_sequence_and_reset() {
        let mut backoff = Backoff::new(BackoffPolicy::new(ms(2000), ms(30_000)));

        assert_eq!(backoff.next_delay(), ms(2000));
        assert_eq!(backoff.next_delay(), ms(4000));
        assert_eq!(backoff.next_delay(), ms(8000));
        assert_eq!(backoff.next_delay(), ms(16_000));
        assert_eq!(backoff.next_delay(), ms(30_000));
        assert_eq!(backoff.next_delay(), ms(30_000));
        assert_eq!(backoff.get_attempt(), 6);

        backoff.reset();
        assert_eq!(backoff.get_attempt(), 0);
        assert_eq!(backoff.current(), ms(2000));
        assert_eq!(backoff.next_delay(), ms(2000));
    }

    #[test]
    fn test_ceiling_below_double_base() {
        let mut backoff = Backoff::new(BackoffPolicy::new(ms(500), ms(600)));
        assert_eq!(backoff.next_delay(), ms(500));
        assert_eq!(backoff.next_delay(), ms(600));
        assert_eq!(backoff.next_delay(), ms(600));
    }

    #[test]
    fn test_property_holds_for_many_bases() {
        for base in [1u64, 7, 250, 500, 2000] {
            for ceiling in [base, base * 3, 5000, 30_000] {
                let policy = BackoffPolicy::new(ms(base), ms(ceiling.max(base)));
                let mut current = policy.reset_backoff();
                for _ in 0..20 {
                    let next = policy.next_backoff(current);
                    assert_eq!(next, (current * 2).min(policy.ceiling));
                    current = next;
                }
            }
        }
    }
}
