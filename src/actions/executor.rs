// src/actions/executor.rs - Worker pool that performs automated actions
use crate::error::Result;
use crate::tree::{ItemSnapshot, TitleDetailDelay};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Performs one kind of action, selected by the detail prefix
#[async_trait]
pub trait ActionHandler: Send + Sync {
    fn name(&self) -> &str;

    fn matches(&self, action: &TitleDetailDelay) -> bool;

    async fn handle(&self, item: &ItemSnapshot, action: &TitleDetailDelay) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,

    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_size: default_queue_size(),
        }
    }
}

fn default_workers() -> usize {
    4
}

fn default_queue_size() -> usize {
    100
}

#[derive(Debug, Clone)]
pub struct ActionRequest {
    pub item: ItemSnapshot,
    pub action: TitleDetailDelay,
}

/// Bounded queue drained by a fixed number of workers
///
/// [`accept`](Self::accept) never blocks: when the queue is full the request
/// is dropped with a warning. The first handler that matches an action
/// performs it.
pub struct AutomatedActionExecutor {
    sender: mpsc::Sender<ActionRequest>,
    handlers: Arc<Vec<Arc<dyn ActionHandler>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl AutomatedActionExecutor {
    /// Start the workers, must be called inside a Tokio runtime
    pub fn new(config: &ExecutorConfig, handlers: Vec<Arc<dyn ActionHandler>>) -> Self {
        let (sender, receiver) = mpsc::channel(config.queue_size.max(1));
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        let handlers = Arc::new(handlers);

        let workers = (0..config.workers.max(1))
            .map(|id| {
                let receiver = receiver.clone();
                let handlers = handlers.clone();
                tokio::spawn(async move {
                    loop {
                        let request = { receiver.lock().await.recv().await };
                        let Some(request) = request else {
                            debug!("Action worker {} stopping", id);
                            break;
                        };
                        Self::execute(&handlers, &request).await;
                    }
                })
            })
            .collect();

        info!(
            "Action executor started with {} workers, queue size {}",
            config.workers.max(1),
            config.queue_size.max(1)
        );

        Self {
            sender,
            handlers,
            workers: Mutex::new(workers),
        }
    }

    /// Queue an action, false if it was dropped
    pub fn accept(&self, item: ItemSnapshot, action: TitleDetailDelay) -> bool {
        match self.sender.try_send(ActionRequest { item, action }) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(request)) => {
                warn!(
                    "Action queue full, dropping '{}' for {}",
                    request.action.title, request.item.path
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(request)) => {
                warn!(
                    "Action executor stopped, dropping '{}' for {}",
                    request.action.title, request.item.path
                );
                false
            }
        }
    }

    async fn execute(handlers: &[Arc<dyn ActionHandler>], request: &ActionRequest) {
        let action = &request.action;
        let Some(handler) = handlers.iter().find(|handler| handler.matches(action)) else {
            warn!(
                "No handler for action '{}' ({}) of {}",
                action.title, action.detail, request.item.path
            );
            return;
        };
        debug!(
            "{} handles '{}' for {}",
            handler.name(),
            action.title,
            request.item.path
        );
        if let Err(e) = handler.handle(&request.item, action).await {
            error!(
                "Action '{}' for {} failed: {}",
                action.title, request.item.path, e
            );
        }
    }

    pub fn handler_names(&self) -> Vec<String> {
        self.handlers.iter().map(|h| h.name().to_string()).collect()
    }

    /// Stop all workers, queued requests are discarded
    pub fn shutdown(&self) {
        for worker in self.workers.lock().drain(..) {
            worker.abort();
        }
    }
}

impl Drop for AutomatedActionExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AlarmError;
    use crate::severity::SeverityLevel;
    use crate::tree::{GroupConfig, ItemConfig};
    use std::time::Duration;

    struct Recording {
        prefix: &'static str,
        seen: Arc<Mutex<Vec<String>>>,
        fail: bool,
    }

    #[async_trait]
    impl ActionHandler for Recording {
        fn name(&self) -> &str {
            self.prefix
        }

        fn matches(&self, action: &TitleDetailDelay) -> bool {
            action.detail.starts_with(self.prefix)
        }

        async fn handle(&self, item: &ItemSnapshot, action: &TitleDetailDelay) -> Result<()> {
            self.seen
                .lock()
                .push(format!("{} {}", item.path, action.detail));
            if self.fail {
                return Err(AlarmError::Action("boom".to_string()));
            }
            Ok(())
        }
    }

    fn snapshot(path: &str) -> ItemSnapshot {
        ItemSnapshot {
            path: path.to_string(),
            name: "Vacuum".to_string(),
            is_leaf: false,
            severity: SeverityLevel::Major,
            description: "Vacuum".to_string(),
            state: None,
            config: ItemConfig::Group(GroupConfig::default()),
            alarming_pvs: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_first_matching_handler_wins() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let first = Arc::new(Recording {
            prefix: "cmd:",
            seen: seen.clone(),
            fail: true,
        });
        let second = Arc::new(Recording {
            prefix: "cmd:",
            seen: Arc::new(Mutex::new(Vec::new())),
            fail: false,
        });
        let handlers: Vec<Arc<dyn ActionHandler>> = vec![first, second.clone()];
        let executor = AutomatedActionExecutor::new(&ExecutorConfig::default(), handlers);

        assert!(executor.accept(snapshot("/A/Vacuum"), TitleDetailDelay::new("Run", "cmd:x", 0)));
        assert!(executor.accept(snapshot("/A/Vacuum"), TitleDetailDelay::new("?", "sms:1", 0)));

        for _ in 0..50 {
            if !seen.lock().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(*seen.lock(), vec!["/A/Vacuum cmd:x".to_string()]);
        assert!(second.seen.lock().is_empty());
        executor.shutdown();
    }

    struct Stuck(Arc<tokio::sync::Notify>);

    #[async_trait]
    impl ActionHandler for Stuck {
        fn name(&self) -> &str {
            "stuck"
        }

        fn matches(&self, _action: &TitleDetailDelay) -> bool {
            true
        }

        async fn handle(&self, _item: &ItemSnapshot, _action: &TitleDetailDelay) -> Result<()> {
            self.0.notify_one();
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_full_queue_drops() {
        let started = Arc::new(tokio::sync::Notify::new());
        let handlers: Vec<Arc<dyn ActionHandler>> = vec![Arc::new(Stuck(started.clone()))];
        let executor = AutomatedActionExecutor::new(
            &ExecutorConfig {
                workers: 1,
                queue_size: 1,
            },
            handlers,
        );
        assert!(executor.accept(snapshot("/A"), TitleDetailDelay::new("a", "x:1", 0)));
        started.notified().await;

        // Worker is busy, one request fits into the queue
        assert!(executor.accept(snapshot("/A"), TitleDetailDelay::new("b", "x:2", 0)));
        assert!(!executor.accept(snapshot("/A"), TitleDetailDelay::new("c", "x:3", 0)));
        executor.shutdown();
    }
}
