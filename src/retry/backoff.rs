use rand::Rng;
use std::time::Duration;
use tracing::trace;

/// Ordered backoff schedule for retry sessions
///
/// The interval for attempt `n` is the schedule entry at
/// `min(n - 1, len - 1)`, so the last entry repeats for every attempt past
/// the end of the schedule.
#[derive(Debug, Clone)]
pub struct RetrySchedule {
    intervals: Vec<Duration>,
}

impl Default for RetrySchedule {
    fn default() -> Self {
        Self {
            intervals: vec![Duration::from_secs(5)],
        }
    }
}

impl RetrySchedule {
    /// Create a schedule from ordered intervals. An empty list falls back to
    /// the default single 5-second interval.
    pub fn new(intervals: Vec<Duration>) -> Self {
        if intervals.is_empty() {
            return Self::default();
        }
        Self { intervals }
    }

    /// Base (un-jittered) interval for a given attempt, 1-based.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let idx = (attempt.saturating_sub(1) as usize).min(self.intervals.len() - 1);
        self.intervals[idx]
    }

    /// Jittered interval for a given attempt, drawn from
    /// `[base / 2, base * 1.5)` to avoid thundering-herd synchronization.
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt).as_millis().max(1) as u64;
        let delay = base / 2 + rand::thread_rng().gen_range(0..base);

        trace!(
            attempt = attempt,
            base_ms = base,
            delay_ms = delay,
            "Calculated backoff delay"
        );

        Duration::from_millis(delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schedule_indexing() {
        let schedule = RetrySchedule::new(vec![
            Duration::from_millis(100),
            Duration::from_millis(200),
            Duration::from_millis(400),
        ]);

        assert_eq!(schedule.base_delay(1), Duration::from_millis(100));
        assert_eq!(schedule.base_delay(2), Duration::from_millis(200));
        assert_eq!(schedule.base_delay(3), Duration::from_millis(400));
        // Past the end the last entry repeats
        assert_eq!(schedule.base_delay(50), Duration::from_millis(400));
    }

    #[test]
    fn test_empty_schedule_uses_default() {
        let schedule = RetrySchedule::new(vec![]);
        assert_eq!(schedule.base_delay(1), Duration::from_secs(5));
    }

    #[test]
    fn test_jitter_bounds() {
        let schedule = RetrySchedule::new(vec![Duration::from_millis(1000)]);

        for _ in 0..200 {
            let delay = schedule.jittered_delay(1);
            let ms = delay.as_millis() as u64;
            assert!(ms >= 500, "delay {}ms below half the base", ms);
            assert!(ms < 1500, "delay {}ms at or above 1.5x the base", ms);
        }
    }

    #[test]
    fn test_jitter_variation() {
        let schedule = RetrySchedule::new(vec![Duration::from_millis(1000)]);

        let delays: Vec<Duration> = (0..100).map(|_| schedule.jittered_delay(1)).collect();
        let unique: std::collections::HashSet<_> = delays.iter().collect();
        assert!(unique.len() > 1, "jitter produced identical delays");
    }
}
