// src/actions/mod.rs - Delayed automated actions of one alarm tree item
//!
//! Every item with configured actions owns an [`AutomatedActions`]. It is fed
//! the severity the item contributes to its parent and starts one delay
//! timer per action when the item enters an active alarm. If the item is
//! still in alarm when the delay expires, the action is handed to the
//! performer, usually the [`AutomatedActionExecutor`].

pub mod command;
pub mod email;
pub mod executor;
pub mod flood;

pub use command::CommandHandler;
pub use email::{EmailHandler, EmailSender, SmtpConfig};
pub use executor::{ActionHandler, ActionRequest, AutomatedActionExecutor, ExecutorConfig};
pub use flood::{FloodConfig, FloodGuard};

#[cfg(feature = "email")]
pub use email::SmtpEmailSender;

use crate::severity::SeverityLevel;
use crate::timer::ResettableTimer;
use crate::tree::TitleDetailDelay;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

/// Invoked with the item path and the action that is due
pub type ActionPerformer = Arc<dyn Fn(&str, &TitleDetailDelay) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionState {
    /// Waiting for the next alarm
    Idle,
    /// Delay timer running
    Pending,
    /// Performed during the current alarm
    Fired,
    /// Alarm cleared before the delay expired
    Canceled,
}

pub struct AutomatedActions {
    shared: Arc<ActionsShared>,
}

struct ActionsShared {
    item: String,
    perform: ActionPerformer,
    followup: Vec<String>,
    inner: Mutex<ActionsInner>,
}

struct ActionsInner {
    severity: SeverityLevel,
    closed: bool,
    slots: Vec<ActionSlot>,
}

struct ActionSlot {
    action: TitleDetailDelay,
    state: ActionState,
    generation: u64,
    timer: Option<ResettableTimer>,
}

impl AutomatedActions {
    /// Actions of item `item`
    ///
    /// Actions whose detail starts with one of the `followup` prefixes are
    /// performed a second time when an alarm they fired for clears.
    pub fn new(
        item: impl Into<String>,
        actions: Vec<TitleDetailDelay>,
        followup: Vec<String>,
        perform: ActionPerformer,
    ) -> Self {
        let slots = actions
            .into_iter()
            .map(|action| ActionSlot {
                action,
                state: ActionState::Idle,
                generation: 0,
                timer: None,
            })
            .collect();
        Self {
            shared: Arc::new(ActionsShared {
                item: item.into(),
                perform,
                followup,
                inner: Mutex::new(ActionsInner {
                    severity: SeverityLevel::Ok,
                    closed: false,
                    slots,
                }),
            }),
        }
    }

    pub fn item(&self) -> &str {
        &self.shared.item
    }

    /// Track the severity of the item
    ///
    /// Entering an active severity arms every idle action. Escalation within
    /// an alarm, e.g. MINOR to MAJOR, leaves running timers alone. Leaving
    /// the alarm cancels pending actions, follow-ups only run once it is OK.
    pub fn handle_severity_update(&self, severity: SeverityLevel) {
        let mut due = Vec::new();
        {
            let mut inner = self.shared.inner.lock();
            if inner.closed {
                return;
            }
            inner.severity = severity;
            let active = severity.is_active();
            for index in 0..inner.slots.len() {
                let slot = &mut inner.slots[index];
                match (active, slot.state) {
                    (true, ActionState::Idle | ActionState::Canceled) => {
                        if !ActionsShared::arm(&self.shared, index, slot) {
                            slot.state = ActionState::Fired;
                            due.push(slot.action.clone());
                        }
                    }
                    (false, ActionState::Pending) => {
                        debug!("Canceling '{}' for {}", slot.action.title, self.shared.item);
                        slot.state = ActionState::Canceled;
                        if let Some(timer) = slot.timer.take() {
                            timer.shutdown();
                        }
                    }
                    // Acknowledged alarms stay in the episode until OK
                    (false, ActionState::Fired) if severity == SeverityLevel::Ok => {
                        slot.state = ActionState::Idle;
                        if self.shared.is_followup(&slot.action) {
                            due.push(slot.action.clone());
                        }
                    }
                    _ => {}
                }
            }
        }
        for action in due {
            (self.shared.perform)(&self.shared.item, &action);
        }
    }

    pub fn action_states(&self) -> Vec<(TitleDetailDelay, ActionState)> {
        self.shared
            .inner
            .lock()
            .slots
            .iter()
            .map(|slot| (slot.action.clone(), slot.state))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.shared.inner.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cancel all timers, later updates are ignored
    pub fn cancel(&self) {
        let mut inner = self.shared.inner.lock();
        inner.closed = true;
        for slot in inner.slots.iter_mut() {
            if let Some(timer) = slot.timer.take() {
                timer.shutdown();
            }
            if slot.state == ActionState::Pending {
                slot.state = ActionState::Canceled;
            }
        }
    }
}

impl Drop for AutomatedActions {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl std::fmt::Debug for AutomatedActions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AutomatedActions")
            .field("item", &self.shared.item)
            .field("actions", &self.len())
            .finish()
    }
}

impl ActionsShared {
    /// Start the delay of one slot, false if no runtime is available
    fn arm(shared: &Arc<ActionsShared>, index: usize, slot: &mut ActionSlot) -> bool {
        if tokio::runtime::Handle::try_current().is_err() {
            warn!(
                "No runtime for action '{}' of {}, performing now",
                slot.action.title, shared.item
            );
            return false;
        }
        slot.generation += 1;
        slot.state = ActionState::Pending;
        let generation = slot.generation;
        let weak: Weak<ActionsShared> = Arc::downgrade(shared);
        slot.timer = Some(ResettableTimer::with_callback(slot.action.delay(), move || {
            if let Some(shared) = weak.upgrade() {
                shared.fire(index, generation);
            }
        }));
        true
    }

    fn fire(&self, index: usize, generation: u64) {
        let action = {
            let mut inner = self.inner.lock();
            let still_active = inner.severity.is_active();
            let closed = inner.closed;
            let Some(slot) = inner.slots.get_mut(index) else {
                return;
            };
            if closed || slot.generation != generation || slot.state != ActionState::Pending {
                return;
            }
            slot.timer = None;
            if !still_active {
                slot.state = ActionState::Canceled;
                return;
            }
            slot.state = ActionState::Fired;
            slot.action.clone()
        };
        debug!("Performing '{}' for {}", action.title, self.item);
        (self.perform)(&self.item, &action);
    }

    fn is_followup(&self, action: &TitleDetailDelay) -> bool {
        self.followup
            .iter()
            .any(|prefix| action.detail.starts_with(prefix.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    type Log = Arc<Mutex<Vec<(String, String)>>>;

    fn recorder() -> (Log, ActionPerformer) {
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        let perform: ActionPerformer = Arc::new(move |item: &str, action: &TitleDetailDelay| {
            sink.lock().push((item.to_string(), action.detail.clone()));
        });
        (log, perform)
    }

    fn actions(perform: ActionPerformer, followup: &[&str]) -> AutomatedActions {
        AutomatedActions::new(
            "/Demo/pv",
            vec![
                TitleDetailDelay::new("Mail", "mailto:ops@example.org", 2),
                TitleDetailDelay::new("Script", "cmd:notify", 5),
            ],
            followup.iter().map(|s| s.to_string()).collect(),
            perform,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_actions_fire_after_delay() {
        let (log, perform) = recorder();
        let actions = actions(perform, &[]);

        actions.handle_severity_update(SeverityLevel::Minor);
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(log.lock().len(), 1);
        assert_eq!(log.lock()[0].1, "mailto:ops@example.org");

        // Escalation does not restart the running delay
        actions.handle_severity_update(SeverityLevel::Major);
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(log.lock().len(), 2);
        assert!(actions
            .action_states()
            .iter()
            .all(|(_, state)| *state == ActionState::Fired));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acknowledge_cancels_pending() {
        let (log, perform) = recorder();
        let actions = actions(perform, &[]);

        actions.handle_severity_update(SeverityLevel::Major);
        tokio::time::sleep(Duration::from_secs(3)).await;
        actions.handle_severity_update(SeverityLevel::MajorAck);
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(log.lock().len(), 1);
        let states: Vec<_> = actions.action_states().into_iter().map(|(_, s)| s).collect();
        assert_eq!(states, vec![ActionState::Fired, ActionState::Canceled]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_alarms_never_fire() {
        let (log, perform) = recorder();
        let actions = actions(perform, &[]);

        for _ in 0..5 {
            actions.handle_severity_update(SeverityLevel::Major);
            tokio::time::sleep(Duration::from_secs(1)).await;
            actions.handle_severity_update(SeverityLevel::MajorAck);
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        assert!(log.lock().is_empty());

        actions.handle_severity_update(SeverityLevel::Major);
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(log.lock().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_followup_when_alarm_clears() {
        let (log, perform) = recorder();
        let actions = actions(perform, &["mailto:"]);

        actions.handle_severity_update(SeverityLevel::Invalid);
        tokio::time::sleep(Duration::from_secs(6)).await;
        actions.handle_severity_update(SeverityLevel::Ok);

        let details: Vec<_> = log.lock().iter().map(|(_, d)| d.clone()).collect();
        assert_eq!(
            details,
            vec!["mailto:ops@example.org", "cmd:notify", "mailto:ops@example.org"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_acknowledge_is_not_a_followup() {
        let (log, perform) = recorder();
        let actions = actions(perform, &["mailto:"]);

        actions.handle_severity_update(SeverityLevel::Major);
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(log.lock().len(), 1);

        actions.handle_severity_update(SeverityLevel::MajorAck);
        assert_eq!(log.lock().len(), 1);
        assert_eq!(actions.action_states()[0].1, ActionState::Fired);

        actions.handle_severity_update(SeverityLevel::Ok);
        let details: Vec<_> = log.lock().iter().map(|(_, d)| d.clone()).collect();
        assert_eq!(
            details,
            vec!["mailto:ops@example.org", "mailto:ops@example.org"]
        );
        assert_eq!(actions.action_states()[0].1, ActionState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_everything() {
        let (log, perform) = recorder();
        let actions = actions(perform, &[]);
        actions.handle_severity_update(SeverityLevel::Major);
        actions.cancel();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(log.lock().is_empty());

        actions.handle_severity_update(SeverityLevel::Minor);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(log.lock().is_empty());
    }
}
