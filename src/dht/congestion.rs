use crate::constants::CONGESTION_SLOTS;

/// Rotating window of unacknowledged sends.
///
/// Each slot counts sends made during one drain tick. A send is allowed while
/// the current slot holds fewer than `max_window` sends and the window as a
/// whole fewer than `2 * max_window`. Draining rotates to the next slot and
/// forgets whatever it held.
#[derive(Debug, Clone)]
pub struct CongestionWindow {
    slot: usize,
    total: usize,
    window: [usize; CONGESTION_SLOTS],
    max_window: usize,
}

impl CongestionWindow {
    pub fn new(max_window: usize) -> Self {
        Self {
            slot: 0,
            total: 0,
            window: [0; CONGESTION_SLOTS],
            max_window,
        }
    }

    pub fn is_full(&self) -> bool {
        self.total >= 2 * self.max_window || self.window[self.slot] >= self.max_window
    }

    pub fn send(&mut self) {
        self.total += 1;
        self.window[self.slot] += 1;
    }

    /// Credits one acknowledged send against the current slot.
    pub fn recv(&mut self) {
        if self.window[self.slot] > 0 {
            self.window[self.slot] -= 1;
            self.total -= 1;
        }
    }

    pub fn drain(&mut self) {
        self.slot = (self.slot + 1) % CONGESTION_SLOTS;
        self.total -= self.window[self.slot];
        self.window[self.slot] = 0;
    }

    pub fn outstanding(&self) -> usize {
        self.total
    }
}
