use std::time::Duration;

/// How long the listener waits before re-binding after it went down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RestartPolicy {
    /// Restart on the next scheduler tick, with no delay at all.
    #[default]
    Immediate,
    /// Double the delay for every consecutive failure, up to `max`.
    Backoff { initial: Duration, max: Duration },
}

impl RestartPolicy {
    pub fn backoff(initial: Duration, max: Duration) -> Self {
        RestartPolicy::Backoff { initial, max }
    }

    /// Delay before the next attempt. `consecutive_failures` is zero when the
    /// listener was closed on request rather than by an error.
    pub fn delay(&self, consecutive_failures: u32) -> Duration {
        match *self {
            RestartPolicy::Immediate => Duration::ZERO,
            RestartPolicy::Backoff { initial, max } => {
                if consecutive_failures == 0 {
                    return Duration::ZERO;
                }

                let exponent = (consecutive_failures - 1).min(31);

                initial.saturating_mul(1u32 << exponent).min(max)
            }
        }
    }

    /// Waits out the delay. A zero delay still yields, so restarts are never
    /// run inline with the failure that caused them.
    pub async fn pause(&self, consecutive_failures: u32) {
        let delay = self.delay(consecutive_failures);

        if delay.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    };

    #[test]
    fn test_immediate() {
        let policy = RestartPolicy::Immediate;

        assert_eq!(policy.delay(0), Duration::ZERO);
        assert_eq!(policy.delay(1), Duration::ZERO);
        assert_eq!(policy.delay(1000), Duration::ZERO);
    }

    #[test]
    fn test_backoff_doubles_until_max() {
        let policy =
            RestartPolicy::backoff(Duration::from_millis(100), Duration::from_millis(1000));

        assert_eq!(policy.delay(0), Duration::ZERO);
        assert_eq!(policy.delay(1), Duration::from_millis(100));
        assert_eq!(policy.delay(2), Duration::from_millis(200));
        assert_eq!(policy.delay(3), Duration::from_millis(400));
        assert_eq!(policy.delay(4), Duration::from_millis(800));
        assert_eq!(policy.delay(5), Duration::from_millis(1000));
        assert_eq!(policy.delay(u32::MAX), Duration::from_millis(1000));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_immediate_pause_lets_other_tasks_run() {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);

        tokio::spawn(async move { flag.store(true, Ordering::SeqCst) });
        assert!(!ran.load(Ordering::SeqCst));

        RestartPolicy::Immediate.pause(3).await;

        assert!(ran.load(Ordering::SeqCst));
    }
}
