// src/tree/logic.rs - Latching and acknowledgment rules of a PV leaf
use super::item::{AlarmPv, DelayedLatch};
use crate::history::AlarmStateHistory;
use crate::severity::SeverityLevel;
use crate::state::AlarmState;
use chrono::Utc;

/// What a leaf update did
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct LeafOutcome {
    /// Latched or current severity/message changed
    pub changed: bool,
    /// A new alarm was latched
    pub newly_latched: bool,
    /// A delayed latch was created and needs its timer
    pub schedule_delay: Option<u64>,
}

impl AlarmPv {
    /// Apply a live update from the PV layer
    pub(crate) fn update(&mut self, update: &AlarmState) -> LeafOutcome {
        let mut outcome = LeafOutcome {
            changed: self.state.current_severity != update.severity
                || self.state.current_message != update.message,
            ..LeafOutcome::default()
        };
        self.state.current_severity = update.severity;
        self.state.current_message = update.message.clone();

        // The PV layer reports live severities; treat an _ACK level as active
        let incoming = update.severity.unacknowledged();
        let incoming_state = update.with_severity(incoming);
        let latched = self.state.severity;
        let escalates = incoming.is_active()
            && (latched == SeverityLevel::Ok || incoming.base_rank() > latched.base_rank());

        if escalates {
            if self.config.count > 0 {
                let capacity = self.config.count as usize;
                let history = self
                    .history
                    .get_or_insert_with(|| AlarmStateHistory::new(capacity));
                history.add(incoming_state.clone());
                if !history.received_alarms_within_timerange(f64::from(self.config.delay)) {
                    return outcome;
                }
                history.clear();
                self.cancel_delay();
            } else if self.config.delay > 0 {
                match &mut self.delayed {
                    // Keep the running delay, remember the worst severity
                    Some(pending) => {
                        if incoming > pending.state.severity {
                            pending.state = incoming_state;
                        }
                    }
                    None => {
                        self.delay_generation += 1;
                        self.delayed = Some(DelayedLatch {
                            state: incoming_state,
                            generation: self.delay_generation,
                            timer: None,
                        });
                        outcome.schedule_delay = Some(self.delay_generation);
                    }
                }
                return outcome;
            }
            self.state.latch(&incoming_state);
            outcome.changed = true;
            outcome.newly_latched = true;
            return outcome;
        }

        if !incoming.is_active() {
            self.cancel_delay();
        }

        if latched.is_acknowledged() {
            // Acknowledged alarms follow the PV down and clear on OK
            if incoming == SeverityLevel::Ok {
                self.state.latch(&incoming_state);
                outcome.changed = true;
            } else if incoming.base_rank() < latched.base_rank() {
                self.state.latch(&incoming_state.with_severity(incoming.acknowledged()));
                outcome.changed = true;
            }
        } else if latched.is_active()
            && !self.config.latching
            && incoming.base_rank() < latched.base_rank()
        {
            self.state.latch(&incoming_state);
            outcome.changed = true;
        }
        outcome
    }

    /// Delay timer of generation `generation` expired
    pub(crate) fn fire_delayed(&mut self, generation: u64) -> LeafOutcome {
        let pending = match self.delayed.take() {
            Some(pending) if pending.generation == generation => pending,
            other => {
                self.delayed = other;
                return LeafOutcome::default();
            }
        };
        if !self.state.current_severity.unacknowledged().is_active() {
            return LeafOutcome::default();
        }
        let latched = self.state.severity;
        let severity = pending.state.severity;
        if latched == SeverityLevel::Ok || severity.base_rank() > latched.base_rank() {
            self.state.latch(&pending.state);
            return LeafOutcome {
                changed: true,
                newly_latched: true,
                schedule_delay: None,
            };
        }
        LeafOutcome::default()
    }

    /// Acknowledge (`true`) or un-acknowledge (`false`) the latched alarm
    pub(crate) fn acknowledge(&mut self, acknowledge: bool) -> bool {
        let latched = self.state.severity;
        if acknowledge {
            if !latched.is_active() {
                return false;
            }
            if self.state.current_severity == SeverityLevel::Ok {
                let cleared = AlarmState::new(
                    SeverityLevel::Ok,
                    self.state.current_message.clone(),
                    self.state.value.clone(),
                    Utc::now(),
                );
                self.state.latch(&cleared);
            } else {
                self.state.severity = latched.acknowledged();
            }
            true
        } else if latched.is_acknowledged() {
            self.state.severity = latched.unacknowledged();
            true
        } else {
            false
        }
    }

    pub(crate) fn cancel_delay(&mut self) {
        if let Some(pending) = self.delayed.take() {
            if let Some(timer) = pending.timer {
                timer.shutdown();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::config::PvConfig;
    use chrono::{Duration, TimeZone, Utc};

    fn update(severity: SeverityLevel, message: &str) -> AlarmState {
        AlarmState::new(severity, message, "1.0", Utc::now())
    }

    #[test]
    fn test_escalation_latches() {
        let mut pv = AlarmPv::new(PvConfig::default());
        let out = pv.update(&update(SeverityLevel::Minor, "LOW"));
        assert!(out.changed && out.newly_latched);
        assert_eq!(pv.state.severity, SeverityLevel::Minor);

        let out = pv.update(&update(SeverityLevel::Major, "LOLO"));
        assert!(out.newly_latched);
        assert_eq!(pv.state.severity, SeverityLevel::Major);
        assert_eq!(pv.state.message, "LOLO");
    }

    #[test]
    fn test_latched_until_acknowledged() {
        let mut pv = AlarmPv::new(PvConfig::default());
        pv.update(&update(SeverityLevel::Major, "HIHI"));

        let out = pv.update(&update(SeverityLevel::Ok, "NO_ALARM"));
        assert!(out.changed);
        assert!(!out.newly_latched);
        assert_eq!(pv.state.severity, SeverityLevel::Major);
        assert_eq!(pv.state.current_severity, SeverityLevel::Ok);

        // Same update again changes nothing
        let out = pv.update(&update(SeverityLevel::Ok, "NO_ALARM"));
        assert!(!out.changed);

        // Current is OK, so acknowledging clears
        assert!(pv.acknowledge(true));
        assert_eq!(pv.state.severity, SeverityLevel::Ok);
    }

    #[test]
    fn test_acknowledged_alarm_follows_pv() {
        let mut pv = AlarmPv::new(PvConfig::default());
        pv.update(&update(SeverityLevel::Major, "HIHI"));
        assert!(pv.acknowledge(true));
        assert_eq!(pv.state.severity, SeverityLevel::MajorAck);

        // Same level does not re-alarm
        let out = pv.update(&update(SeverityLevel::Major, "HIHI"));
        assert!(!out.newly_latched);
        assert_eq!(pv.state.severity, SeverityLevel::MajorAck);

        pv.update(&update(SeverityLevel::Minor, "HIGH"));
        assert_eq!(pv.state.severity, SeverityLevel::MinorAck);

        pv.update(&update(SeverityLevel::Ok, "NO_ALARM"));
        assert_eq!(pv.state.severity, SeverityLevel::Ok);

        // Un-acknowledge only applies to _ACK levels
        assert!(!pv.acknowledge(false));
    }

    #[test]
    fn test_unacknowledge() {
        let mut pv = AlarmPv::new(PvConfig::default());
        pv.update(&update(SeverityLevel::Invalid, "DISCONNECTED"));
        pv.acknowledge(true);
        assert!(pv.acknowledge(false));
        assert_eq!(pv.state.severity, SeverityLevel::Invalid);
    }

    #[test]
    fn test_non_latching_follows_down() {
        let mut pv = AlarmPv::new(PvConfig {
            latching: false,
            ..PvConfig::default()
        });
        pv.update(&update(SeverityLevel::Major, "HIHI"));
        pv.update(&update(SeverityLevel::Minor, "HIGH"));
        assert_eq!(pv.state.severity, SeverityLevel::Minor);
        pv.update(&update(SeverityLevel::Ok, "NO_ALARM"));
        assert_eq!(pv.state.severity, SeverityLevel::Ok);
    }

    #[test]
    fn test_count_based_alarm() {
        let mut pv = AlarmPv::new(PvConfig {
            count: 3,
            delay: 10,
            ..PvConfig::default()
        });
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let at = |secs: i64, severity| {
            AlarmState::new(severity, "HIGH", "5", start + Duration::seconds(secs))
        };

        assert!(!pv.update(&at(0, SeverityLevel::Minor)).newly_latched);
        pv.update(&at(1, SeverityLevel::Ok));
        assert!(!pv.update(&at(2, SeverityLevel::Minor)).newly_latched);
        pv.update(&at(3, SeverityLevel::Ok));
        assert_eq!(pv.state.severity, SeverityLevel::Ok);

        let out = pv.update(&at(4, SeverityLevel::Minor));
        assert!(out.newly_latched);
        assert_eq!(pv.state.severity, SeverityLevel::Minor);
    }

    #[test]
    fn test_delay_creates_pending_latch() {
        let mut pv = AlarmPv::new(PvConfig {
            delay: 5,
            ..PvConfig::default()
        });
        let out = pv.update(&update(SeverityLevel::Minor, "HIGH"));
        assert_eq!(out.schedule_delay, Some(1));
        assert_eq!(pv.state.severity, SeverityLevel::Ok);

        // Worse severity joins the running delay
        let out = pv.update(&update(SeverityLevel::Major, "HIHI"));
        assert_eq!(out.schedule_delay, None);

        let out = pv.fire_delayed(1);
        assert!(out.newly_latched);
        assert_eq!(pv.state.severity, SeverityLevel::Major);
    }

    #[test]
    fn test_delay_cancelled_by_ok() {
        let mut pv = AlarmPv::new(PvConfig {
            delay: 5,
            ..PvConfig::default()
        });
        pv.update(&update(SeverityLevel::Minor, "HIGH"));
        pv.update(&update(SeverityLevel::Ok, "NO_ALARM"));
        assert!(pv.delayed.is_none());
        assert_eq!(pv.fire_delayed(1), LeafOutcome::default());
        assert_eq!(pv.state.severity, SeverityLevel::Ok);
    }
}
