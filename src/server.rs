// src/server.rs - Alarm server: tree, actions and distribution wired together
//!
//! The server owns the authoritative alarm tree. PV updates and client
//! commands mutate the tree; every resulting change is published on the
//! config/state topics, drives the automated actions of the affected items
//! and, for newly latched annunciating PVs, produces a talk message.

use crate::actions::{
    ActionHandler, ActionPerformer, ActionState, AutomatedActionExecutor, AutomatedActions,
    CommandHandler, FloodGuard,
};
use crate::auth::{current_user, FileBasedAuthorization};
use crate::broker::{MessageLog, Record};
use crate::client::AlarmClientModel;
use crate::config::ServerConfig;
use crate::error::{AlarmError, Result};
use crate::protocol::{
    decode, encode, AlarmCommand, CommandMessage, MessageKey, StateMessage, TalkMessage,
    TopicNames,
};
use crate::severity::SeverityLevel;
use crate::state::AlarmState;
use crate::timer::ResettableTimer;
use crate::tree::{AlarmTree, ItemChange, ItemConfig, TitleDetailDelay, TreeEvent, TreeListener};
use bytes::Bytes;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Message waiting for the publisher task
#[derive(Debug, Clone)]
struct Outbound {
    topic: String,
    key: String,
    payload: Option<Bytes>,
}

/// Own config publications per key that have not come back yet
const MAX_PENDING_ECHOES: usize = 64;

struct NodeActions {
    configured: Vec<TitleDetailDelay>,
    actions: Arc<AutomatedActions>,
}

pub struct AlarmServer {
    shared: Arc<ServerShared>,
}

struct ServerShared {
    config: Arc<ServerConfig>,
    topics: TopicNames,
    tree: AlarmTree,
    log: Arc<dyn MessageLog>,
    executor: AutomatedActionExecutor,
    authorization: Option<FileBasedAuthorization>,
    shelving: Vec<Duration>,
    actions: DashMap<String, NodeActions>,
    floods: DashMap<String, FloodGuard>,
    outbound: mpsc::UnboundedSender<Outbound>,
    outbound_rx: Mutex<Option<mpsc::UnboundedReceiver<Outbound>>>,
    /// Config payloads this server published, in publication order per key
    config_echoes: Mutex<HashMap<String, VecDeque<Option<Bytes>>>>,
    last_state_sent: Mutex<Instant>,
    nag: Mutex<Option<ResettableTimer>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    /// Restoring state from the log, actions and talk stay quiet
    replaying: AtomicBool,
    running: AtomicBool,
}

/// Tree listener that forwards into the server
struct ServerListener {
    shared: Weak<ServerShared>,
}

impl TreeListener for ServerListener {
    fn tree_event(&self, event: &TreeEvent) {
        if let Some(shared) = self.shared.upgrade() {
            shared.on_tree_event(event);
        }
    }
}

/// Action handlers for a configuration: commands, plus email when configured
pub fn default_handlers(config: &ServerConfig) -> Vec<Arc<dyn ActionHandler>> {
    let mut handlers: Vec<Arc<dyn ActionHandler>> = vec![Arc::new(CommandHandler::new(
        config.command_directory.clone(),
        config.command_timeout(),
        config.macros(),
    ))];
    #[cfg(feature = "email")]
    if let Some(smtp) = &config.email {
        let sender = Arc::new(crate::actions::SmtpEmailSender::new(smtp.clone()));
        handlers.push(Arc::new(crate::actions::EmailHandler::new(sender)));
    }
    #[cfg(not(feature = "email"))]
    if config.email.is_some() {
        warn!("Email configured but support is not compiled in, mailto: actions are dropped");
    }
    handlers
}

impl AlarmServer {
    /// Create the server, must be called inside a Tokio runtime
    pub fn new(
        config: ServerConfig,
        log: Arc<dyn MessageLog>,
        handlers: Vec<Arc<dyn ActionHandler>>,
    ) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let tree = AlarmTree::new(&config.config_name)?;
        let executor = AutomatedActionExecutor::new(&config.actions, handlers);
        let authorization = config.authorization.as_ref().map(|auth| {
            let user = auth.user.clone().unwrap_or_else(current_user);
            FileBasedAuthorization::new(&auth.file, user)
        });
        let shelving = config.shelving();
        if shelving.is_empty() {
            warn!("No valid shelving options, any shelving duration is accepted");
        }
        let (outbound, outbound_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(ServerShared {
            topics: config.topics(),
            config,
            tree,
            log,
            executor,
            authorization,
            shelving,
            actions: DashMap::new(),
            floods: DashMap::new(),
            outbound,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            config_echoes: Mutex::new(HashMap::new()),
            last_state_sent: Mutex::new(Instant::now()),
            nag: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            replaying: AtomicBool::new(false),
            running: AtomicBool::new(false),
        });
        shared.tree.add_listener(Arc::new(ServerListener {
            shared: Arc::downgrade(&shared),
        }));
        Ok(Self { shared })
    }

    pub fn tree(&self) -> &AlarmTree {
        &self.shared.tree
    }

    pub fn topics(&self) -> &TopicNames {
        &self.shared.topics
    }

    pub fn config(&self) -> &ServerConfig {
        &self.shared.config
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Create topics, load or restore the tree and start background tasks
    pub async fn start(&self) -> Result<()> {
        let shared = &self.shared;
        if shared.running.swap(true, Ordering::SeqCst) {
            return Err(AlarmError::Config("Server already started".to_string()));
        }
        info!("Starting alarm server for '{}'", shared.config.config_name);

        for (topic, retention) in shared.topics.retentions(shared.config.short_retention()) {
            shared.log.create_topic(&topic, retention).await?;
        }

        if let Some(rx) = shared.outbound_rx.lock().take() {
            let log = shared.log.clone();
            shared.spawn(publish_loop(log, rx));
        }

        let mut config_rx = shared
            .log
            .subscribe(std::slice::from_ref(&shared.topics.config))
            .await?;

        // Drain what the log retained before this server publishes anything
        let retained = collect_until_quiet(&mut config_rx, shared.config.replay_quiet()).await;

        let tree_config = shared.config.load_tree()?;
        let from_config = tree_config.is_some();
        if let Some(tree_config) = tree_config {
            let pvs = tree_config.populate(&shared.tree)?;
            // Root config is only announced by an event when it changed
            shared.publish_config(&shared.tree.root_path());
            info!("Loaded alarm tree with {} PVs", pvs);
        }

        shared.replaying.store(true, Ordering::SeqCst);
        shared.restore(&retained, from_config);
        shared.replaying.store(false, Ordering::SeqCst);
        info!(
            "Restored {} records, tree has {} items",
            retained.len(),
            shared.tree.len()
        );

        let weak = Arc::downgrade(shared);
        shared.spawn(follow_config(weak.clone(), config_rx));

        let command_rx = shared
            .log
            .subscribe(std::slice::from_ref(&shared.topics.command))
            .await?;
        shared.spawn(follow_commands(weak.clone(), command_rx, Utc::now()));
        shared.spawn(maintenance(weak, shared.config.maintenance_period()));
        shared.start_nag();
        shared.publish_state_of(&shared.tree.root_path());
        Ok(())
    }

    /// Feed a live PV update into the tree
    pub fn handle_pv_update(&self, path: &str, state: &AlarmState) -> Result<bool> {
        self.shared.tree.update_pv(path, state)
    }

    /// Execute a client command on an item
    ///
    /// Returns the number of PVs that changed.
    pub fn handle_command(&self, path: &str, command: &CommandMessage) -> Result<usize> {
        self.shared.handle_command(path, command)
    }

    /// Is the message log reachable?
    pub fn is_connected(&self) -> bool {
        self.shared.log.is_connected()
    }

    /// States of all configured actions of an item
    pub fn action_states(&self, path: &str) -> Vec<(TitleDetailDelay, ActionState)> {
        self.shared
            .actions
            .get(path)
            .map(|node| node.actions.action_states())
            .unwrap_or_default()
    }

    /// Cancel timers and stop all background work
    pub fn shutdown(&self) {
        let shared = &self.shared;
        if !shared.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down alarm server");
        if let Some(nag) = shared.nag.lock().take() {
            nag.shutdown();
        }
        for node in shared.actions.iter() {
            node.actions.cancel();
        }
        shared.actions.clear();
        shared.tree.shutdown();
        shared.executor.shutdown();
        for task in shared.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

impl Drop for AlarmServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl ServerShared {
    fn spawn<F>(&self, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.tasks.lock().push(tokio::spawn(future));
    }

    fn publish(&self, topic: &str, key: String, payload: Option<Bytes>) {
        let is_config = matches!(MessageKey::parse(&key), Some(MessageKey::Config(_)));
        if is_config && topic == self.topics.config {
            let mut echoes = self.config_echoes.lock();
            let pending = echoes.entry(key.clone()).or_default();
            if pending.len() >= MAX_PENDING_ECHOES {
                pending.pop_front();
            }
            pending.push_back(payload.clone());
        }
        let message = Outbound {
            topic: topic.to_string(),
            key,
            payload,
        };
        if self.outbound.send(message).is_err() {
            debug!("Publisher stopped, message dropped");
        }
    }

    fn publish_encoded<T: serde::Serialize>(&self, topic: &str, key: String, message: &T) {
        match encode(message) {
            Ok(payload) => self.publish(topic, key, Some(payload)),
            Err(e) => error!("Cannot encode message for {}: {}", key, e),
        }
    }

    fn publish_config(&self, path: &str) {
        match self.tree.config(path) {
            Ok(config) => self.publish_encoded(
                &self.topics.config,
                MessageKey::Config(path.to_string()).to_string(),
                &config,
            ),
            Err(e) => debug!("No config to publish for {}: {}", path, e),
        }
    }

    fn publish_state(&self, path: &str, state: &StateMessage) {
        let key = MessageKey::State(path.to_string()).to_string();
        self.publish_encoded(&self.topics.config, key.clone(), state);
        self.publish_encoded(&self.topics.long_term, key, state);
        *self.last_state_sent.lock() = Instant::now();
    }

    fn publish_state_of(&self, path: &str) {
        let state = match self.tree.pv_state(path) {
            Ok(state) => StateMessage::from_pv(&state),
            Err(_) => match self.tree.severity(path) {
                Ok(severity) => StateMessage::from_group(severity),
                Err(e) => {
                    debug!("No state to publish for {}: {}", path, e);
                    return;
                }
            },
        };
        self.publish_state(path, &state);
    }

    fn on_tree_event(self: &Arc<Self>, event: &TreeEvent) {
        match event {
            TreeEvent::Changed(change) => self.on_change(change),
            TreeEvent::Added { path, .. } => {
                self.publish_config(path);
                self.update_actions(path);
            }
            TreeEvent::ConfigChanged { path } => {
                self.publish_config(path);
                self.update_actions(path);
            }
            TreeEvent::Removed { path, .. } => {
                if let Some((_, node)) = self.actions.remove(path) {
                    node.actions.cancel();
                }
                self.floods.remove(path);
                self.publish(
                    &self.topics.config,
                    MessageKey::Config(path.clone()).to_string(),
                    None,
                );
                self.publish(
                    &self.topics.config,
                    MessageKey::State(path.clone()).to_string(),
                    None,
                );
            }
        }
    }

    fn on_change(&self, change: &ItemChange) {
        let state = match &change.state {
            Some(state) => StateMessage::from_pv(state),
            None => StateMessage::from_group(change.severity),
        };
        self.publish_state(&change.path, &state);

        if self.replaying.load(Ordering::SeqCst) {
            return;
        }

        let actions = self
            .actions
            .get(&change.path)
            .map(|node| node.actions.clone());
        if let Some(actions) = actions {
            actions.handle_severity_update(change.severity);
        }

        if change.is_leaf && change.newly_latched {
            self.annunciate(&change.path, change.severity);
            if let Some(nag) = self.nag.lock().as_ref() {
                nag.reset();
            }
        }
    }

    fn annunciate(&self, path: &str, severity: SeverityLevel) {
        let Ok(ItemConfig::Pv(config)) = self.tree.config(path) else {
            return;
        };
        if !config.annunciating {
            return;
        }
        let description = if config.description.is_empty() {
            path
        } else {
            config.description.as_str()
        };
        let talk = TalkMessage::from_description(severity, description);
        self.publish_encoded(
            &self.topics.talk,
            MessageKey::Talk(path.to_string()).to_string(),
            &talk,
        );
    }

    /// Create, replace or drop the automated actions of an item
    fn update_actions(self: &Arc<Self>, path: &str) {
        let configured = match self.tree.config(path) {
            Ok(config) => config.actions().to_vec(),
            Err(_) => return,
        };
        if let Some(node) = self.actions.get(path) {
            if node.configured == configured {
                return;
            }
        }
        if let Some((_, old)) = self.actions.remove(path) {
            old.actions.cancel();
        }
        if configured.is_empty() {
            return;
        }

        let weak = Arc::downgrade(self);
        let perform: ActionPerformer = Arc::new(move |item: &str, action: &TitleDetailDelay| {
            if let Some(shared) = weak.upgrade() {
                shared.perform(item, action);
            }
        });
        let actions = Arc::new(AutomatedActions::new(
            path,
            configured.clone(),
            self.config.automated_action_followup.clone(),
            perform,
        ));
        debug!("{} automated action(s) for {}", configured.len(), path);
        self.actions.insert(
            path.to_string(),
            NodeActions {
                configured,
                actions,
            },
        );
    }

    /// Hand a due action to the executor unless a flood suppresses it
    fn perform(&self, path: &str, action: &TitleDetailDelay) {
        let snapshot = match self.tree.snapshot(path) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                debug!("Dropping '{}', item is gone: {}", action.title, e);
                return;
            }
        };
        let flood = &self.config.flood;
        if flood.enabled && (!snapshot.is_leaf || flood.include_pvs) {
            let trigger = AlarmState::new(
                snapshot.severity,
                action.title.clone(),
                action.detail.clone(),
                Utc::now(),
            );
            let admitted = self
                .floods
                .entry(path.to_string())
                .or_insert_with(|| FloodGuard::from_config(flood))
                .admit(path, &trigger);
            if !admitted {
                debug!("'{}' for {} suppressed by flood guard", action.title, path);
                return;
            }
        }
        debug!("Queueing '{}' for {}", action.title, path);
        self.executor.accept(snapshot, action.clone());
    }

    fn handle_command(&self, path: &str, message: &CommandMessage) -> Result<usize> {
        if let Some(authorization) = &self.authorization {
            let permission = message.command.permission();
            if !authorization.has_authorization_for(&message.user, permission) {
                return Err(AlarmError::NotAuthorized {
                    user: message.user.clone(),
                    permission: permission.to_string(),
                });
            }
        }
        let changed = match &message.command {
            AlarmCommand::Acknowledge => self.tree.acknowledge(path, true)?,
            AlarmCommand::Unacknowledge => self.tree.acknowledge(path, false)?,
            AlarmCommand::Enable => self.tree.set_enabled(path, true)?,
            AlarmCommand::Disable => self.tree.set_enabled(path, false)?,
            AlarmCommand::Shelve { duration_secs } => {
                let duration = Duration::from_secs(*duration_secs);
                if !self.shelving.is_empty() && !self.shelving.contains(&duration) {
                    return Err(AlarmError::Config(format!(
                        "Shelving for {}s is not an allowed option",
                        duration_secs
                    )));
                }
                let duration = chrono::Duration::from_std(duration)
                    .map_err(|e| AlarmError::Config(format!("Invalid shelving duration: {}", e)))?;
                self.tree.shelve(path, Some(Utc::now() + duration))?
            }
            AlarmCommand::Unshelve => self.tree.shelve(path, None)?,
        };
        info!(
            "{:?} on {} by {}@{} changed {} PV(s)",
            message.command, path, message.user, message.host, changed
        );
        Ok(changed)
    }

    /// Is `record` a config this server published itself?
    ///
    /// Consumes the matching publication and every older one for the key,
    /// which the log has superseded.
    fn take_echo(&self, record: &Record) -> bool {
        let mut echoes = self.config_echoes.lock();
        let Some(pending) = echoes.get_mut(&record.key) else {
            return false;
        };
        let Some(position) = pending.iter().position(|p| *p == record.payload) else {
            return false;
        };
        pending.drain(..=position);
        if pending.is_empty() {
            echoes.remove(&record.key);
        }
        true
    }

    /// Apply records the log retained from earlier runs
    ///
    /// With a configured tree, only states of known PVs are restored and
    /// configs of unknown items are deleted from the log.
    fn restore(&self, records: &[Record], from_config: bool) {
        let model = AlarmClientModel::with_tree(self.tree.clone());
        for record in records {
            let Some(key) = MessageKey::parse(&record.key) else {
                continue;
            };
            let result = match (&key, from_config) {
                (MessageKey::Config(path), true) => {
                    if record.payload.is_some() && !self.tree.contains(path) {
                        debug!("Deleting stale config of {}", path);
                        self.publish(&self.topics.config, record.key.clone(), None);
                    }
                    Ok(())
                }
                (MessageKey::State(path), true) if !self.tree.contains(path) => Ok(()),
                _ => model.apply(record),
            };
            if let Err(e) = result {
                debug!("Skipping replayed record {}: {}", record.key, e);
            }
        }
    }

    fn start_nag(self: &Arc<Self>) {
        let Some(period) = self.config.nag_period() else {
            return;
        };
        let weak = Arc::downgrade(self);
        let timer = ResettableTimer::with_callback(period, move || {
            if let Some(shared) = weak.upgrade() {
                shared.nag();
            }
        });
        *self.nag.lock() = Some(timer);
    }

    fn nag(self: &Arc<Self>) {
        if !self.running.load(Ordering::SeqCst) {
            return;
        }
        let active = self.tree.active_alarm_count();
        if active > 0 {
            let talk = TalkMessage {
                severity: self.tree.severity(&self.tree.root_path()).unwrap_or_default(),
                standout: false,
                talk: match active {
                    1 => "There is 1 active alarm".to_string(),
                    n => format!("There are {} active alarms", n),
                },
            };
            let key = MessageKey::Talk(self.tree.root_path()).to_string();
            self.publish_encoded(&self.topics.talk, key, &talk);
        }
        self.start_nag();
    }

    fn heartbeat(&self) {
        let idle = self.last_state_sent.lock().elapsed();
        if idle >= self.config.idle_timeout() {
            debug!("Idle for {:?}, sending root state", idle);
            self.publish_state_of(&self.tree.root_path());
        }
    }
}

async fn collect_until_quiet(
    rx: &mut mpsc::UnboundedReceiver<Record>,
    quiet: Duration,
) -> Vec<Record> {
    let mut records = Vec::new();
    while let Ok(Some(record)) = tokio::time::timeout(quiet, rx.recv()).await {
        records.push(record);
    }
    records
}

async fn publish_loop(log: Arc<dyn MessageLog>, mut rx: mpsc::UnboundedReceiver<Outbound>) {
    while let Some(message) = rx.recv().await {
        let mut backoff = Duration::from_millis(100);
        loop {
            match log
                .send(&message.topic, &message.key, message.payload.clone())
                .await
            {
                Ok(()) => break,
                Err(e) => {
                    warn!("Cannot publish {}: {}, retrying in {:?}", message.key, e, backoff);
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(Duration::from_secs(5));
                }
            }
        }
    }
}

/// Apply config records written by other tools
async fn follow_config(shared: Weak<ServerShared>, mut rx: mpsc::UnboundedReceiver<Record>) {
    while let Some(record) = rx.recv().await {
        if !matches!(MessageKey::parse(&record.key), Some(MessageKey::Config(_))) {
            continue;
        }
        let Some(shared) = shared.upgrade() else {
            break;
        };
        if shared.take_echo(&record) {
            continue;
        }
        let model = AlarmClientModel::with_tree(shared.tree.clone());
        if let Err(e) = model.apply(&record) {
            warn!("Cannot apply config {}: {}", record.key, e);
        }
    }
}

async fn follow_commands(
    shared: Weak<ServerShared>,
    mut rx: mpsc::UnboundedReceiver<Record>,
    started: chrono::DateTime<Utc>,
) {
    while let Some(record) = rx.recv().await {
        // Retained commands predate this server
        if record.timestamp < started {
            continue;
        }
        let Some(MessageKey::Command(path)) = MessageKey::parse(&record.key) else {
            debug!("Ignoring command record {}", record.key);
            continue;
        };
        let Some(payload) = record.payload.as_ref() else {
            continue;
        };
        let Some(shared) = shared.upgrade() else {
            break;
        };
        match decode::<CommandMessage>(payload) {
            Ok(command) => {
                if let Err(e) = shared.handle_command(&path, &command) {
                    warn!("Command {:?} on {} rejected: {}", command.command, path, e);
                }
            }
            Err(e) => warn!("Malformed command for {}: {}", path, e),
        }
    }
}

async fn maintenance(shared: Weak<ServerShared>, period: Duration) {
    let mut interval = tokio::time::interval(period);
    loop {
        interval.tick().await;
        let Some(shared) = shared.upgrade() else {
            break;
        };
        let expired = shared.tree.expire_shelving(Utc::now());
        if !expired.is_empty() {
            info!("Shelving expired for {} PV(s)", expired.len());
        }
        shared.heartbeat();
    }
}
