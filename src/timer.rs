// src/timer.rs - One-shot timer that can be pushed back before it fires
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::trace;

type Callback = Box<dyn Fn() + Send + Sync>;

/// Delayed one-shot trigger
///
/// The timer starts when created. [`reset`](Self::reset) cancels the pending
/// fire and restarts the full timeout from now, as often as needed. Once the
/// timer fired it is spent: later resets are ignored.
///
/// Each pending fire is one Tokio task tagged with a generation number.
/// A reset bumps the generation under the state lock and aborts the old
/// task, and a task only fires if its generation is still current, so two
/// callbacks for the same timer can never run.
///
/// Must be created inside a Tokio runtime.
pub struct ResettableTimer {
    shared: Arc<TimerShared>,
}

struct TimerShared {
    timeout: Duration,
    callback: Option<Callback>,
    state: Mutex<TimerState>,
    fired: watch::Sender<bool>,
}

struct TimerState {
    generation: u64,
    fired: bool,
    shut_down: bool,
    task: Option<JoinHandle<()>>,
}

impl ResettableTimer {
    /// Timer without callback, observed via [`await_timeout`](Self::await_timeout)
    pub fn new(timeout: Duration) -> Self {
        Self::start(timeout, None)
    }

    /// Timer that invokes `callback` on the runtime when it fires
    pub fn with_callback<F>(timeout: Duration, callback: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self::start(timeout, Some(Box::new(callback)))
    }

    fn start(timeout: Duration, callback: Option<Callback>) -> Self {
        let (fired, _) = watch::channel(false);
        let shared = Arc::new(TimerShared {
            timeout,
            callback,
            state: Mutex::new(TimerState {
                generation: 0,
                fired: false,
                shut_down: false,
                task: None,
            }),
            fired,
        });
        {
            let mut state = shared.state.lock();
            TimerShared::schedule(&shared, &mut state);
        }
        Self { shared }
    }

    /// Restart the timeout from now
    ///
    /// Returns false when the timer already fired or was shut down.
    pub fn reset(&self) -> bool {
        let mut state = self.shared.state.lock();
        if state.fired || state.shut_down {
            return false;
        }
        TimerShared::schedule(&self.shared, &mut state);
        true
    }

    /// Wait up to `max_wait` for the timer to fire
    ///
    /// Returns true iff the timer has fired.
    pub async fn await_timeout(&self, max_wait: Duration) -> bool {
        let mut rx = self.shared.fired.subscribe();
        let fired = match tokio::time::timeout(max_wait, rx.wait_for(|fired| *fired)).await {
            Ok(result) => result.is_ok(),
            Err(_) => false,
        };
        fired
    }

    /// Cancel any pending fire and release the task
    pub fn shutdown(&self) {
        let mut state = self.shared.state.lock();
        state.shut_down = true;
        if let Some(task) = state.task.take() {
            task.abort();
        }
    }

    /// Timer still waiting to fire?
    pub fn is_pending(&self) -> bool {
        let state = self.shared.state.lock();
        !state.fired && !state.shut_down
    }

    pub fn has_fired(&self) -> bool {
        self.shared.state.lock().fired
    }

    pub fn timeout(&self) -> Duration {
        self.shared.timeout
    }
}

impl TimerShared {
    fn schedule(shared: &Arc<TimerShared>, state: &mut TimerState) {
        state.generation += 1;
        let generation = state.generation;
        let weak = Arc::downgrade(shared);
        let timeout = shared.timeout;
        let task = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(shared) = weak.upgrade() {
                shared.fire(generation);
            }
        });
        if let Some(previous) = state.task.replace(task) {
            previous.abort();
        }
    }

    fn fire(&self, generation: u64) {
        {
            let mut state = self.state.lock();
            if state.generation != generation || state.fired || state.shut_down {
                trace!("Stale timer generation {} ignored", generation);
                return;
            }
            state.fired = true;
            state.task = None;
        }
        if let Some(callback) = &self.callback {
            callback();
        }
        self.fired.send_replace(true);
    }
}

impl Drop for ResettableTimer {
    fn drop(&mut self) {
        self.shutdown();
    }
}
