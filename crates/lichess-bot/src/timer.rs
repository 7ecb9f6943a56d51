//! Countdown timers over tokio's clock, so paused-time tests can drive them.

use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timer {
    duration: Duration,
    started: Instant,
}

impl Timer {
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            started: Instant::now(),
        }
    }

    /// A timer that has already run out.
    pub fn expired() -> Self {
        Self::new(Duration::ZERO)
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub fn is_expired(&self) -> bool {
        self.time_since_reset() >= self.duration
    }

    pub fn reset(&mut self) {
        self.started = Instant::now();
    }

    pub fn time_since_reset(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn time_until_expiration(&self) -> Duration {
        self.duration.saturating_sub(self.time_since_reset())
    }

    pub fn deadline(&self) -> Instant {
        self.started + self.duration
    }
}

pub fn seconds(n: u64) -> Duration {
    Duration::from_secs(n)
}

pub fn minutes(n: u64) -> Duration {
    Duration::from_secs(n * 60)
}

pub fn hours(n: u64) -> Duration {
    Duration::from_secs(n * 3600)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_timer_expiry_and_reset() {
        let mut timer = Timer::new(seconds(10));
        assert!(!timer.is_expired());

        tokio::time::advance(seconds(4)).await;
        assert_eq!(timer.time_until_expiration(), seconds(6));

        tokio::time::advance(seconds(6)).await;
        assert!(timer.is_expired());
        assert_eq!(timer.time_until_expiration(), Duration::ZERO);

        timer.reset();
        assert!(!timer.is_expired());
        assert!(Timer::expired().is_expired());
        assert_eq!(minutes(2), seconds(120));
    }
}
