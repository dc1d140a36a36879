// src/state.rs - Alarm state values
use crate::severity::SeverityLevel;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Severity, message, value and timestamp of one alarm-bearing entity
///
/// Also used as the input of a PV update: the PV layer reports its live
/// severity together with the alarm status text and the value that caused it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlarmState {
    pub severity: SeverityLevel,
    pub message: String,
    pub value: String,
    pub time: DateTime<Utc>,
}

impl AlarmState {
    pub fn new(
        severity: SeverityLevel,
        message: impl Into<String>,
        value: impl Into<String>,
        time: DateTime<Utc>,
    ) -> Self {
        Self {
            severity,
            message: message.into(),
            value: value.into(),
            time,
        }
    }

    /// OK state stamped with the current time
    pub fn ok() -> Self {
        Self::new(SeverityLevel::Ok, "OK", "", Utc::now())
    }

    /// Copy of this state with another severity
    pub fn with_severity(&self, severity: SeverityLevel) -> Self {
        Self {
            severity,
            ..self.clone()
        }
    }
}

impl Default for AlarmState {
    fn default() -> Self {
        Self::ok()
    }
}

/// Complete state of a PV leaf
///
/// `severity`/`message`/`value`/`time` describe the latched alarm, which is
/// kept until acknowledged. `current_severity`/`current_message` always
/// follow the live PV, so the latched severity may be MAJOR while the PV is
/// already back to OK.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PvState {
    pub severity: SeverityLevel,
    pub message: String,
    pub value: String,
    pub time: DateTime<Utc>,
    pub current_severity: SeverityLevel,
    pub current_message: String,
}

impl PvState {
    /// Latched part as a plain [`AlarmState`]
    pub fn latched(&self) -> AlarmState {
        AlarmState::new(self.severity, self.message.clone(), self.value.clone(), self.time)
    }

    pub(crate) fn latch(&mut self, state: &AlarmState) {
        self.severity = state.severity;
        self.message = state.message.clone();
        self.value = state.value.clone();
        self.time = state.time;
    }
}

impl Default for PvState {
    fn default() -> Self {
        let ok = AlarmState::ok();
        Self {
            severity: ok.severity,
            message: ok.message.clone(),
            value: ok.value,
            time: ok.time,
            current_severity: SeverityLevel::Ok,
            current_message: ok.message,
        }
    }
}
