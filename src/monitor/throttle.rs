//! Sliding-window restart throttle.
//!
//! Lives in monitor memory, not the shared store: if the monitor
//! restarts, its restart budget starts clean, which errs on the side
//! of recovering lanes rather than leaving them down.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};

use crate::model::LaneKey;

pub struct RestartThrottle {
    cap: usize,
    window: Duration,
    history: HashMap<LaneKey, Vec<DateTime<Utc>>>,
}

impl RestartThrottle {
    pub fn new(cap: usize, window_secs: i64) -> Self {
        Self {
            cap,
            window: Duration::seconds(window_secs),
            history: HashMap::new(),
        }
    }

    /// Whether a restart is allowed for this lane right now. Allowed
    /// restarts are recorded against the window; denied ones are not.
    pub fn allow(&mut self, lane: &LaneKey, now: DateTime<Utc>) -> bool {
        let entries = self.history.entry(lane.clone()).or_default();
        let cutoff = now - self.window;
        entries.retain(|t| *t > cutoff);
        if entries.len() >= self.cap {
            return false;
        }
        entries.push(now);
        true
    }

    /// Restarts currently counted against the lane's window.
    pub fn recent(&self, lane: &LaneKey, now: DateTime<Utc>) -> usize {
        let cutoff = now - self.window;
        self.history
            .get(lane)
            .map(|entries| entries.iter().filter(|t| **t > cutoff).count())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lane() -> LaneKey {
        LaneKey::new(1, "urgency")
    }

    #[test]
    fn cap_restarts_within_window() {
        let mut throttle = RestartThrottle::new(3, 3600);
        let now = Utc::now();
        assert!(throttle.allow(&lane(), now));
        assert!(throttle.allow(&lane(), now + Duration::minutes(1)));
        assert!(throttle.allow(&lane(), now + Duration::minutes(2)));
        assert!(!throttle.allow(&lane(), now + Duration::minutes(3)));
    }

    #[test]
    fn budget_returns_as_window_slides() {
        let mut throttle = RestartThrottle::new(3, 3600);
        let now = Utc::now();
        for i in 0..3 {
            assert!(throttle.allow(&lane(), now + Duration::minutes(i)));
        }
        assert!(!throttle.allow(&lane(), now + Duration::minutes(30)));
        // First restart ages out after an hour.
        assert!(throttle.allow(&lane(), now + Duration::minutes(61)));
    }

    #[test]
    fn lanes_have_independent_budgets() {
        let mut throttle = RestartThrottle::new(1, 3600);
        let now = Utc::now();
        let other = LaneKey::new(2, "urgency");
        assert!(throttle.allow(&lane(), now));
        assert!(!throttle.allow(&lane(), now));
        assert!(throttle.allow(&other, now));
    }

    #[test]
    fn denied_attempts_do_not_consume_budget() {
        let mut throttle = RestartThrottle::new(1, 3600);
        let now = Utc::now();
        assert!(throttle.allow(&lane(), now));
        for i in 0..10 {
            assert!(!throttle.allow(&lane(), now + Duration::minutes(i)));
        }
        assert_eq!(throttle.recent(&lane(), now), 1);
    }
}
