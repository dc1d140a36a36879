// src/actions/flood.rs - Suppression of automated actions during alarm floods
use crate::history::AlarmStateHistory;
use crate::state::AlarmState;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FloodConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Actions within `window_secs` that count as a flood
    #[serde(default = "default_count")]
    pub count: usize,

    #[serde(default = "default_window_secs")]
    pub window_secs: f64,

    /// Also guard actions of individual PVs, not only of groups
    #[serde(default)]
    pub include_pvs: bool,
}

impl Default for FloodConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            count: default_count(),
            window_secs: default_window_secs(),
            include_pvs: false,
        }
    }
}

fn default_enabled() -> bool {
    true
}

fn default_count() -> usize {
    5
}

fn default_window_secs() -> f64 {
    30.0
}

/// Per-item flood detector
///
/// Remembers the last `count` actions of one item. The action that completes
/// a flood still runs, later ones are suppressed until the actions spread
/// out over more than the window again.
#[derive(Debug, Clone)]
pub struct FloodGuard {
    history: AlarmStateHistory,
    window: Duration,
    suppressing: bool,
}

impl FloodGuard {
    pub fn new(count: usize, window: Duration) -> Self {
        Self {
            history: AlarmStateHistory::new(count),
            window,
            suppressing: false,
        }
    }

    pub fn from_config(config: &FloodConfig) -> Self {
        Self::new(config.count, Duration::from_secs_f64(config.window_secs.max(0.0)))
    }

    /// Record an action for `state`, returns false if it must be suppressed
    pub fn admit(&mut self, path: &str, state: &AlarmState) -> bool {
        self.history.add(state.clone());
        let flooding = self
            .history
            .received_alarms_within_timerange(self.window.as_secs_f64());
        if flooding {
            if self.suppressing {
                return false;
            }
            warn!(
                "Alarm flood at {}: {} actions within {:?}, suppressing further actions",
                path,
                self.history.capacity(),
                self.window
            );
            self.suppressing = true;
            return true;
        }
        if self.suppressing {
            info!("Alarm flood at {} is over, actions resume", path);
            self.suppressing = false;
        }
        true
    }

    pub fn is_suppressing(&self) -> bool {
        self.suppressing
    }
}
