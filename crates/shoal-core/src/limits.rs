//! Session time limit and progress-report cadence.
//!
//! The time limit is checked opportunistically: the orchestrator asks the
//! [`Watchdog`] each time its idle wait times out, so no timer thread exists.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Wall-clock budget for one session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeLimit {
    #[default]
    Unbounded,
    Bounded(Duration),
}

impl TimeLimit {
    /// Interpret a configured number of seconds. Zero or negative means no
    /// limit.
    pub fn from_secs(secs: i64) -> Self {
        match u64::try_from(secs) {
            Ok(s) if s > 0 => TimeLimit::Bounded(Duration::from_secs(s)),
            _ => TimeLimit::Unbounded,
        }
    }

    pub fn as_duration(&self) -> Option<Duration> {
        match self {
            TimeLimit::Unbounded => None,
            TimeLimit::Bounded(d) => Some(*d),
        }
    }
}

impl std::fmt::Display for TimeLimit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TimeLimit::Unbounded => f.write_str("unbounded"),
            TimeLimit::Bounded(d) => write!(f, "{}s", d.as_secs_f64()),
        }
    }
}

/// Checks elapsed time against a [`TimeLimit`].
#[derive(Debug, Clone)]
pub struct Watchdog {
    limit: TimeLimit,
    started: Instant,
}

impl Watchdog {
    pub fn new(limit: TimeLimit) -> Self {
        Self::starting_at(limit, Instant::now())
    }

    pub fn starting_at(limit: TimeLimit, started: Instant) -> Self {
        Self { limit, started }
    }

    pub fn limit(&self) -> TimeLimit {
        self.limit
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn exceeded(&self) -> bool {
        match self.limit {
            TimeLimit::Unbounded => false,
            TimeLimit::Bounded(limit) => self.elapsed() >= limit,
        }
    }

    /// Time left before the limit, `None` when unbounded.
    pub fn remaining(&self) -> Option<Duration> {
        self.limit
            .as_duration()
            .map(|limit| limit.saturating_sub(self.elapsed()))
    }
}

/// Delay until the next progress report, growing with session age.
pub fn report_delay(elapsed: Duration) -> Duration {
    let secs = elapsed.as_secs();
    let delay = if secs < 60 {
        5
    } else if secs < 300 {
        15
    } else if secs < 900 {
        30
    } else if secs < 3600 {
        60
    } else {
        300
    };
    Duration::from_secs(delay)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_non_positive_limit_is_unbounded() {
        assert_eq!(TimeLimit::from_secs(0), TimeLimit::Unbounded);
        assert_eq!(TimeLimit::from_secs(-5), TimeLimit::Unbounded);
        assert_eq!(
            TimeLimit::from_secs(90),
            TimeLimit::Bounded(Duration::from_secs(90))
        );
    }

    #[test]
    fn test_unbounded_never_exceeded() {
        let dog = Watchdog::new(TimeLimit::Unbounded);
        assert!(!dog.exceeded());
        assert_eq!(dog.remaining(), None);
    }

    #[test]
    fn test_bounded_exceeded_after_limit() {
        let dog = Watchdog::new(TimeLimit::Bounded(Duration::ZERO));
        assert!(dog.exceeded());
        assert_eq!(dog.remaining(), Some(Duration::ZERO));

        let fresh = Watchdog::new(TimeLimit::Bounded(Duration::from_secs(3600)));
        assert!(!fresh.exceeded());
    }

    #[test]
    fn test_report_delay_cadence() {
        let at = |s| report_delay(Duration::from_secs(s)).as_secs();
        assert_eq!(at(0), 5);
        assert_eq!(at(59), 5);
        assert_eq!(at(60), 15);
        assert_eq!(at(299), 15);
        assert_eq!(at(300), 30);
        assert_eq!(at(899), 30);
        assert_eq!(at(900), 60);
        assert_eq!(at(3599), 60);
        assert_eq!(at(3600), 300);
        assert_eq!(at(86_400), 300);
    }
}
