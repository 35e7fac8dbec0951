//! Jittered exponential backoff for reconnect attempts

use rand::Rng;
use std::time::Duration;

/// Exponential backoff: base delay doubling up to a hard cap, with up to 25%
/// random jitter added so deployed instances don't retry in lockstep.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    current: Duration,
}

const JITTER_FRACTION: f64 = 0.25;

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            current: base,
        }
    }

    /// Delay to sleep before the next attempt; advances the schedule
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.cap);

        let jitter = delay.mul_f64(rand::thread_rng().gen_range(0.0..JITTER_FRACTION));
        delay + jitter
    }

    /// Restart the schedule from the base delay
    pub fn reset(&mut self) {
        self.current = self.base;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_to_cap() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(500));

        let d1 = backoff.next_delay();
        let d2 = backoff.next_delay();
        let d3 = backoff.next_delay();
        let d4 = backoff.next_delay();

        // Jitter adds at most 25% on top of the schedule
        assert!(d1 >= Duration::from_millis(100) && d1 <= Duration::from_millis(125));
        assert!(d2 >= Duration::from_millis(200) && d2 <= Duration::from_millis(250));
        assert!(d3 >= Duration::from_millis(400) && d3 <= Duration::from_millis(500));
        assert!(d4 >= Duration::from_millis(500) && d4 <= Duration::from_millis(625));
    }

    #[test]
    fn test_backoff_never_exceeds_cap_plus_jitter() {
        let cap = Duration::from_millis(200);
        let mut backoff = Backoff::new(Duration::from_millis(50), cap);

        for _ in 0..20 {
            let d = backoff.next_delay();
            assert!(d <= cap + cap.mul_f64(0.25));
        }
    }

    #[test]
    fn test_backoff_reset() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(10));
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();

        let d = backoff.next_delay();
        assert!(d <= Duration::from_millis(125));
    }
}
