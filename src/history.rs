// src/history.rs - Bounded history of recent alarm states
use crate::state::AlarmState;
use std::collections::VecDeque;

/// Fixed-capacity FIFO of the most recent alarm states of one item
///
/// Answers a single question: did the last `capacity` alarms all arrive
/// within a given time range? Leaves use it for count-based alarms,
/// automated actions use it to detect alarm floods. It never changes the
/// latched or current state of the item.
#[derive(Debug, Clone)]
pub struct AlarmStateHistory {
    capacity: usize,
    entries: VecDeque<AlarmState>,
}

impl AlarmStateHistory {
    /// Create a history that remembers `capacity` states (at least one)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: VecDeque::with_capacity(capacity),
        }
    }

    /// Record a state, evicting the oldest one when full
    pub fn add(&mut self, state: AlarmState) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(state);
    }

    /// Have `capacity` alarms been received within `seconds`?
    ///
    /// False until the history is full. Otherwise compares the time span
    /// between the oldest and the newest remembered state.
    pub fn received_alarms_within_timerange(&self, seconds: f64) -> bool {
        if self.entries.len() < self.capacity {
            return false;
        }
        match (self.entries.front(), self.entries.back()) {
            (Some(first), Some(last)) => {
                let span = last.time.signed_duration_since(first.time);
                let span_secs = span.num_milliseconds() as f64 / 1000.0;
                span_secs <= seconds
            }
            _ => false,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
