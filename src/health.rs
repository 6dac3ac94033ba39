//! Network health scoring.
//!
//! The monitor keeps a short window of cumulative response/timeout counter
//! snapshots, taken on every maintenance tick, and derives whether the node
//! is online, degraded (online but losing most requests) or offline.
//! Background maintenance only runs while the node is online and healthy.

use std::collections::VecDeque;

use crate::constants::{DEGRADED_TIMEOUT_RATE, HEALTH_WINDOW};

/// A health state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthEvent {
    Online,
    Degraded,
    Offline,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Sample {
    responses: u64,
    timeouts: u64,
}

#[derive(Debug, Clone)]
pub struct HealthMonitor {
    capacity: usize,
    window: VecDeque<Sample>,
    online: bool,
    degraded: bool,
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new(HEALTH_WINDOW)
    }
}

impl HealthMonitor {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(2),
            window: VecDeque::with_capacity(capacity),
            online: true,
            degraded: false,
        }
    }

    /// Clears the window and assumes the node is online again.
    pub fn reset(&mut self) {
        self.window.clear();
        self.online = true;
        self.degraded = false;
    }

    pub fn is_online(&self) -> bool {
        self.online
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    /// Online and not losing most of its requests.
    pub fn is_healthy(&self) -> bool {
        self.online && !self.degraded
    }

    fn newest(&self) -> Sample {
        self.window.back().copied().unwrap_or_default()
    }

    fn previous(&self) -> Sample {
        match self.window.len() {
            0 | 1 => self.newest(),
            n => self.window[n - 2],
        }
    }

    fn oldest(&self) -> Sample {
        self.window.front().copied().unwrap_or_default()
    }

    pub fn recent_responses(&self) -> u64 {
        self.newest().responses.saturating_sub(self.previous().responses)
    }

    pub fn recent_timeouts(&self) -> u64 {
        self.newest().timeouts.saturating_sub(self.previous().timeouts)
    }

    pub fn responses(&self) -> u64 {
        self.newest().responses.saturating_sub(self.oldest().responses)
    }

    pub fn timeouts(&self) -> u64 {
        self.newest().timeouts.saturating_sub(self.oldest().timeouts)
    }

    pub fn timeouts_rate(&self) -> f64 {
        let timeouts = self.timeouts();
        if timeouts == 0 {
            return 0.0;
        }
        timeouts as f64 / (self.responses() + timeouts) as f64
    }

    /// Records the current cumulative counters.
    ///
    /// Returns the new state if it changed.
    pub fn update(&mut self, responses: u64, timeouts: u64) -> Option<HealthEvent> {
        if self.window.len() >= self.capacity {
            self.window.pop_front();
        }
        self.window.push_back(Sample {
            responses,
            timeouts,
        });

        let was = (self.online, self.degraded);

        if self.recent_responses() > 0 {
            self.online = true;
        } else if self.recent_timeouts() > 0 {
            self.online = false;
        }
        self.degraded = self.online && self.timeouts_rate() > DEGRADED_TIMEOUT_RATE;

        if (self.online, self.degraded) == was {
            return None;
        }

        Some(if !self.online {
            HealthEvent::Offline
        } else if self.degraded {
            HealthEvent::Degraded
        } else {
            HealthEvent::Online
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_online() {
        let health = HealthMonitor::default();
        assert!(health.is_online());
        assert!(!health.is_degraded());
        assert_eq!(health.timeouts_rate(), 0.0);
    }

    #[test]
    fn test_goes_offline_without_responses() {
        let mut health = HealthMonitor::default();
        assert_eq!(health.update(10, 0), None);
        assert_eq!(health.update(10, 4), Some(HealthEvent::Offline));
        assert!(!health.is_online());
        assert!(!health.is_degraded());

        // Still silent: no new transition.
        assert_eq!(health.update(10, 8), None);

        assert_eq!(health.update(11, 8), Some(HealthEvent::Degraded));
        assert!(health.is_online());
    }

    #[test]
    fn test_degraded_when_most_requests_time_out() {
        let mut health = HealthMonitor::default();
        health.update(0, 0);
        assert_eq!(health.update(2, 6), Some(HealthEvent::Degraded));
        assert!(health.is_online());
        assert!(health.is_degraded());
        assert!(health.timeouts_rate() > 0.5);
    }

    #[test]
    fn test_recovers_when_responses_dominate() {
        let mut health = HealthMonitor::new(4);
        health.update(0, 0);
        health.update(2, 6);
        assert!(health.is_degraded());

        assert_eq!(health.update(3, 12), None);
        assert!(health.is_degraded());

        // 40 responses against 12 timeouts across the window.
        assert_eq!(health.update(40, 12), Some(HealthEvent::Online));
        assert!(health.is_healthy());
    }

    #[test]
    fn test_window_deltas() {
        let mut health = HealthMonitor::new(3);
        health.update(5, 1);
        health.update(9, 2);
        health.update(12, 5);
        assert_eq!(health.recent_responses(), 3);
        assert_eq!(health.recent_timeouts(), 3);
        assert_eq!(health.responses(), 7);
        assert_eq!(health.timeouts(), 4);

        health.update(13, 5);
        assert_eq!(health.responses(), 4);
    }

    #[test]
    fn test_reset() {
        let mut health = HealthMonitor::default();
        health.update(0, 0);
        health.update(0, 5);
        assert!(!health.is_online());

        health.reset();
        assert!(health.is_online());
        assert_eq!(health.responses(), 0);
    }
}
