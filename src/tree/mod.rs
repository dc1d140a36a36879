// src/tree/mod.rs - Hierarchical alarm tree with severity aggregation
//!
//! The tree owns all items in an arena keyed by node id. Paths look like
//! `/Accelerator/Vacuum/SR:VAC:Pressure`: the root name, then every group
//! below it, then the PV name, separated by `/`.
//!
//! Every mutation runs under one write lock and produces a list of
//! [`TreeEvent`]s. Events are delivered to the registered listeners after the
//! write lock is released, in the order the mutations happened. Listeners
//! may read the tree but must not mutate it from inside the callback.

pub mod config;
mod item;
mod logic;

pub use config::{GroupConfig, ItemConfig, PvConfig, TitleDetail, TitleDetailDelay};
pub use item::{AlarmGroup, AlarmPv, AlarmTreeItem, ItemKind};

use crate::error::{AlarmError, Result};
use crate::severity::SeverityLevel;
use crate::state::{AlarmState, PvState};
use crate::timer::ResettableTimer;
use chrono::{DateTime, Utc};
use item::NodeId;
use logic::LeafOutcome;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

pub const PATH_SEPARATOR: char = '/';

/// Receives tree changes
pub trait TreeListener: Send + Sync {
    fn tree_event(&self, event: &TreeEvent);
}

#[derive(Debug, Clone, PartialEq)]
pub enum TreeEvent {
    /// Severity or state of an item changed
    Changed(ItemChange),
    Added { path: String, is_leaf: bool },
    Removed { path: String, is_leaf: bool },
    ConfigChanged { path: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ItemChange {
    pub path: String,
    pub is_leaf: bool,
    /// Severity the item contributes to its parent
    pub severity: SeverityLevel,
    /// Full leaf state, `None` for groups
    pub state: Option<PvState>,
    /// Leaf latched a new alarm with this change
    pub newly_latched: bool,
}

/// Read-only copy of one item, handed to actions and clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemSnapshot {
    pub path: String,
    pub name: String,
    pub is_leaf: bool,
    pub severity: SeverityLevel,
    pub description: String,
    pub state: Option<PvState>,
    pub config: ItemConfig,
    /// Leaves at or below this item that are currently in alarm
    pub alarming_pvs: Vec<PvSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PvSnapshot {
    pub path: String,
    pub name: String,
    pub description: String,
    pub state: PvState,
}

/// Shared handle to the alarm tree
#[derive(Clone)]
pub struct AlarmTree {
    shared: Arc<TreeShared>,
}

struct TreeShared {
    inner: RwLock<TreeInner>,
    listeners: RwLock<Vec<Arc<dyn TreeListener>>>,
    /// Serializes mutation plus notification
    notify_lock: Mutex<()>,
}

struct TreeInner {
    items: HashMap<NodeId, AlarmTreeItem>,
    paths: HashMap<String, NodeId>,
    root: NodeId,
    next_id: NodeId,
}

impl AlarmTree {
    /// Empty tree with a root group named `root_name`
    pub fn new(root_name: &str) -> Result<Self> {
        validate_name(root_name)?;
        let path = format!("{}{}", PATH_SEPARATOR, root_name);
        let root = AlarmTreeItem::new(
            root_name.to_string(),
            path.clone(),
            None,
            ItemKind::Group(AlarmGroup::new(GroupConfig::default())),
        );
        let mut items = HashMap::new();
        items.insert(0, root);
        let mut paths = HashMap::new();
        paths.insert(path, 0);
        Ok(Self {
            shared: Arc::new(TreeShared {
                inner: RwLock::new(TreeInner {
                    items,
                    paths,
                    root: 0,
                    next_id: 1,
                }),
                listeners: RwLock::new(Vec::new()),
                notify_lock: Mutex::new(()),
            }),
        })
    }

    pub fn add_listener(&self, listener: Arc<dyn TreeListener>) {
        self.shared.listeners.write().push(listener);
    }

    pub fn root_path(&self) -> String {
        let inner = self.shared.inner.read();
        inner.path_of(inner.root)
    }

    pub fn root_name(&self) -> String {
        let inner = self.shared.inner.read();
        inner
            .items
            .get(&inner.root)
            .map(|item| item.name.clone())
            .unwrap_or_default()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.shared.inner.read().paths.contains_key(path)
    }

    pub fn is_leaf(&self, path: &str) -> Result<bool> {
        let inner = self.shared.inner.read();
        Ok(inner.get(inner.lookup(path)?)?.is_leaf())
    }

    /// Number of items including the root
    pub fn len(&self) -> usize {
        self.shared.inner.read().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() <= 1
    }

    /// Add a group below `parent`, returns the new path
    pub fn add_group(&self, parent: &str, name: &str, config: GroupConfig) -> Result<String> {
        self.add_item(parent, name, ItemKind::Group(AlarmGroup::new(config)))
    }

    /// Add a PV leaf below `parent`, returns the new path
    pub fn add_pv(&self, parent: &str, name: &str, config: PvConfig) -> Result<String> {
        self.add_item(parent, name, ItemKind::Leaf(AlarmPv::new(config)))
    }

    fn add_item(&self, parent: &str, name: &str, kind: ItemKind) -> Result<String> {
        self.mutate(|inner, events| {
            let parent_id = inner.lookup(parent)?;
            let is_leaf = matches!(kind, ItemKind::Leaf(_));
            let id = inner.insert(parent_id, name, kind)?;
            let path = inner.path_of(id);
            events.push(TreeEvent::Added {
                path: path.clone(),
                is_leaf,
            });
            Ok(path)
        })
    }

    /// Remove an item and everything below it
    pub fn remove(&self, path: &str) -> Result<()> {
        self.mutate(|inner, events| {
            let id = inner.lookup(path)?;
            if id == inner.root {
                return Err(AlarmError::InvalidPath(format!("cannot remove root {}", path)));
            }
            let parent = inner.get(id)?.parent;
            let subtree = inner.subtree(id);
            for node in subtree.into_iter().rev() {
                if let Some(mut item) = inner.items.remove(&node) {
                    if let Some(pv) = item.as_leaf_mut() {
                        pv.cancel_delay();
                    }
                    inner.paths.remove(&item.path);
                    events.push(TreeEvent::Removed {
                        is_leaf: item.is_leaf(),
                        path: item.path,
                    });
                }
            }
            if let Some(group) = parent
                .and_then(|p| inner.items.get_mut(&p))
                .and_then(AlarmTreeItem::as_group_mut)
            {
                group.children.retain(|child| *child != id);
            }
            inner.aggregate(parent, Utc::now(), events);
            Ok(())
        })
    }

    /// Move an item below another group, returns its new path
    pub fn move_item(&self, path: &str, new_parent: &str) -> Result<String> {
        self.mutate(|inner, events| {
            let id = inner.lookup(path)?;
            if id == inner.root {
                return Err(AlarmError::InvalidPath(format!("cannot move root {}", path)));
            }
            let new_parent_id = inner.lookup(new_parent)?;
            if new_parent == path || new_parent.starts_with(&format!("{}{}", path, PATH_SEPARATOR)) {
                return Err(AlarmError::Cycle {
                    item: path.to_string(),
                    parent: new_parent.to_string(),
                });
            }
            if inner.get(new_parent_id)?.is_leaf() {
                return Err(AlarmError::WrongKind {
                    path: new_parent.to_string(),
                    expected: "group",
                });
            }
            let (name, old_parent) = {
                let item = inner.get(id)?;
                (item.name.clone(), item.parent)
            };
            if old_parent == Some(new_parent_id) {
                return Ok(path.to_string());
            }
            let new_path = format!("{}{}{}", new_parent, PATH_SEPARATOR, name);
            if inner.paths.contains_key(&new_path) {
                return Err(AlarmError::DuplicatePath(new_path));
            }

            if let Some(group) = old_parent
                .and_then(|p| inner.items.get_mut(&p))
                .and_then(AlarmTreeItem::as_group_mut)
            {
                group.children.retain(|child| *child != id);
            }
            if let Some(group) = inner
                .items
                .get_mut(&new_parent_id)
                .and_then(AlarmTreeItem::as_group_mut)
            {
                group.children.push(id);
            }
            if let Some(item) = inner.items.get_mut(&id) {
                item.parent = Some(new_parent_id);
            }

            let now = Utc::now();
            let mut added = Vec::new();
            for node in inner.subtree(id) {
                let Some(item) = inner.items.get_mut(&node) else {
                    continue;
                };
                let old = std::mem::take(&mut item.path);
                item.path = format!("{}{}", new_path, &old[path.len()..]);
                let is_leaf = item.is_leaf();
                let renamed = item.path.clone();
                inner.paths.remove(&old);
                inner.paths.insert(renamed.clone(), node);
                events.push(TreeEvent::Removed { path: old, is_leaf });
                added.push(TreeEvent::Added {
                    path: renamed,
                    is_leaf,
                });
                if let Some(change) = inner.leaf_change(node, false, now) {
                    added.push(change);
                }
            }
            events.extend(added);
            inner.aggregate(old_parent, now, events);
            inner.aggregate(Some(new_parent_id), now, events);
            Ok(new_path)
        })
    }

    /// Feed a live update of a PV into the tree
    ///
    /// Returns true if the leaf state changed.
    pub fn update_pv(&self, path: &str, update: &AlarmState) -> Result<bool> {
        self.mutate(|inner, events| {
            let id = inner.lookup(path)?;
            let pv = inner.leaf_mut(id, path)?;
            let mut outcome = pv.update(update);
            if let Some(generation) = outcome.schedule_delay {
                if !self.arm_delay(pv, path, generation) {
                    let fired = pv.fire_delayed(generation);
                    outcome.changed |= fired.changed;
                    outcome.newly_latched |= fired.newly_latched;
                }
            }
            self.apply_leaf_outcome(inner, id, outcome, events);
            Ok(outcome.changed)
        })
    }

    fn fire_delayed(&self, path: &str, generation: u64) -> Result<bool> {
        self.mutate(|inner, events| {
            let id = inner.lookup(path)?;
            let outcome = inner.leaf_mut(id, path)?.fire_delayed(generation);
            if outcome.newly_latched {
                debug!("Delayed alarm latched for {}", path);
            }
            self.apply_leaf_outcome(inner, id, outcome, events);
            Ok(outcome.changed)
        })
    }

    /// Start the delay timer of a pending latch, false without a runtime
    fn arm_delay(&self, pv: &mut AlarmPv, path: &str, generation: u64) -> bool {
        if tokio::runtime::Handle::try_current().is_err() {
            warn!("No runtime for delayed alarm of {}, latching immediately", path);
            return false;
        }
        let delay = std::time::Duration::from_secs(u64::from(pv.config.delay));
        let Some(pending) = pv.delayed.as_mut() else {
            return true;
        };
        let weak = Arc::downgrade(&self.shared);
        let path = path.to_string();
        pending.timer = Some(ResettableTimer::with_callback(delay, move || {
            if let Some(shared) = weak.upgrade() {
                if let Err(e) = (AlarmTree { shared }).fire_delayed(&path, generation) {
                    debug!("Delayed alarm for {} dropped: {}", path, e);
                }
            }
        }));
        true
    }

    fn apply_leaf_outcome(
        &self,
        inner: &mut TreeInner,
        id: NodeId,
        outcome: LeafOutcome,
        events: &mut Vec<TreeEvent>,
    ) {
        if !outcome.changed {
            return;
        }
        let now = Utc::now();
        if let Some(change) = inner.leaf_change(id, outcome.newly_latched, now) {
            events.push(change);
        }
        let parent = inner.items.get(&id).and_then(|item| item.parent);
        inner.aggregate(parent, now, events);
    }

    /// Acknowledge or un-acknowledge a leaf, or every leaf below a group
    ///
    /// Returns the number of leaves that changed.
    pub fn acknowledge(&self, path: &str, acknowledge: bool) -> Result<usize> {
        self.mutate(|inner, events| {
            let id = inner.lookup(path)?;
            let now = Utc::now();
            let mut changed = 0;
            for node in inner.subtree(id) {
                let Some(pv) = inner.items.get_mut(&node).and_then(AlarmTreeItem::as_leaf_mut)
                else {
                    continue;
                };
                if pv.acknowledge(acknowledge) {
                    changed += 1;
                    if let Some(change) = inner.leaf_change(node, false, now) {
                        events.push(change);
                    }
                    let parent = inner.items.get(&node).and_then(|item| item.parent);
                    inner.aggregate(parent, now, events);
                }
            }
            Ok(changed)
        })
    }

    /// Enable or disable a leaf, or every leaf below a group
    pub fn set_enabled(&self, path: &str, enabled: bool) -> Result<usize> {
        self.modify_leaves(path, |config| {
            if config.enabled == enabled {
                return false;
            }
            config.enabled = enabled;
            true
        })
    }

    /// Shelve leaves until `until`, or unshelve them with `None`
    pub fn shelve(&self, path: &str, until: Option<DateTime<Utc>>) -> Result<usize> {
        self.modify_leaves(path, |config| {
            if config.shelved_until == until {
                return false;
            }
            config.shelved_until = until;
            true
        })
    }

    fn modify_leaves<F>(&self, path: &str, mut modify: F) -> Result<usize>
    where
        F: FnMut(&mut PvConfig) -> bool,
    {
        self.mutate(|inner, events| {
            let id = inner.lookup(path)?;
            let now = Utc::now();
            let mut changed = 0;
            for node in inner.subtree(id) {
                let Some(item) = inner.items.get_mut(&node) else {
                    continue;
                };
                let item_path = item.path.clone();
                let parent = item.parent;
                let Some(pv) = item.as_leaf_mut() else {
                    continue;
                };
                let before = pv.effective_severity(now);
                if !modify(&mut pv.config) {
                    continue;
                }
                changed += 1;
                let after = pv.effective_severity(now);
                events.push(TreeEvent::ConfigChanged { path: item_path });
                if before != after {
                    if let Some(change) = inner.leaf_change(node, false, now) {
                        events.push(change);
                    }
                    inner.aggregate(parent, now, events);
                }
            }
            Ok(changed)
        })
    }

    /// Clear shelving that ran out before `now`, returns the affected paths
    pub fn expire_shelving(&self, now: DateTime<Utc>) -> Vec<String> {
        let result = self.mutate(|inner, events| {
            let expired: Vec<NodeId> = inner
                .items
                .iter()
                .filter_map(|(id, item)| match &item.kind {
                    ItemKind::Leaf(pv) => pv
                        .config
                        .shelved_until
                        .filter(|until| *until <= now)
                        .map(|_| *id),
                    ItemKind::Group(_) => None,
                })
                .collect();
            let mut paths = Vec::with_capacity(expired.len());
            for node in expired {
                let Some(item) = inner.items.get_mut(&node) else {
                    continue;
                };
                let parent = item.parent;
                let path = item.path.clone();
                if let Some(pv) = item.as_leaf_mut() {
                    pv.config.shelved_until = None;
                }
                events.push(TreeEvent::ConfigChanged { path: path.clone() });
                if let Some(change) = inner.leaf_change(node, false, now) {
                    events.push(change);
                }
                inner.aggregate(parent, now, events);
                paths.push(path);
            }
            Ok(paths)
        });
        result.unwrap_or_default()
    }

    /// Replace the configuration of an item
    ///
    /// The kind must match. Returns false if the configuration is unchanged.
    pub fn update_config(&self, path: &str, config: ItemConfig) -> Result<bool> {
        self.mutate(|inner, events| {
            let id = inner.lookup(path)?;
            let now = Utc::now();
            let item = inner
                .items
                .get_mut(&id)
                .ok_or_else(|| AlarmError::ItemNotFound(path.to_string()))?;
            let parent = item.parent;
            let severity_changed = match (&mut item.kind, config) {
                (ItemKind::Leaf(pv), ItemConfig::Pv(config)) => {
                    if pv.config == config {
                        return Ok(false);
                    }
                    let before = pv.effective_severity(now);
                    pv.set_config(config);
                    before != pv.effective_severity(now)
                }
                (ItemKind::Group(group), ItemConfig::Group(config)) => {
                    if group.config == config {
                        return Ok(false);
                    }
                    group.config = config;
                    false
                }
                (ItemKind::Leaf(_), ItemConfig::Group(_)) => {
                    return Err(AlarmError::WrongKind {
                        path: path.to_string(),
                        expected: "pv",
                    })
                }
                (ItemKind::Group(_), ItemConfig::Pv(_)) => {
                    return Err(AlarmError::WrongKind {
                        path: path.to_string(),
                        expected: "group",
                    })
                }
            };
            events.push(TreeEvent::ConfigChanged {
                path: path.to_string(),
            });
            if severity_changed {
                if let Some(change) = inner.leaf_change(id, false, now) {
                    events.push(change);
                }
                inner.aggregate(parent, now, events);
            }
            Ok(true)
        })
    }

    /// Overwrite the complete state of a leaf, as received from the server
    pub fn set_pv_state(&self, path: &str, state: PvState) -> Result<()> {
        self.mutate(|inner, events| {
            let id = inner.lookup(path)?;
            let pv = inner.leaf_mut(id, path)?;
            if pv.state == state {
                return Ok(());
            }
            pv.state = state;
            let outcome = LeafOutcome {
                changed: true,
                ..LeafOutcome::default()
            };
            self.apply_leaf_outcome(inner, id, outcome, events);
            Ok(())
        })
    }

    /// Severity an item contributes to its parent
    pub fn severity(&self, path: &str) -> Result<SeverityLevel> {
        let inner = self.shared.inner.read();
        Ok(inner.get(inner.lookup(path)?)?.severity(Utc::now()))
    }

    pub fn pv_state(&self, path: &str) -> Result<PvState> {
        let inner = self.shared.inner.read();
        match &inner.get(inner.lookup(path)?)?.kind {
            ItemKind::Leaf(pv) => Ok(pv.state.clone()),
            ItemKind::Group(_) => Err(AlarmError::WrongKind {
                path: path.to_string(),
                expected: "pv",
            }),
        }
    }

    pub fn config(&self, path: &str) -> Result<ItemConfig> {
        let inner = self.shared.inner.read();
        Ok(inner.get(inner.lookup(path)?)?.config())
    }

    pub fn snapshot(&self, path: &str) -> Result<ItemSnapshot> {
        let inner = self.shared.inner.read();
        let id = inner.lookup(path)?;
        let item = inner.get(id)?;
        let now = Utc::now();
        let (description, state) = match &item.kind {
            ItemKind::Leaf(pv) => (pv.config.description.clone(), Some(pv.state.clone())),
            ItemKind::Group(_) => (item.name.clone(), None),
        };
        Ok(ItemSnapshot {
            path: item.path.clone(),
            name: item.name.clone(),
            is_leaf: item.is_leaf(),
            severity: item.severity(now),
            description,
            state,
            config: item.config(),
            alarming_pvs: inner.alarming_pvs(id, now),
        })
    }

    /// Leaves at or below `path` whose contributed severity is active
    pub fn alarming_pvs(&self, path: &str) -> Result<Vec<PvSnapshot>> {
        let inner = self.shared.inner.read();
        let id = inner.lookup(path)?;
        Ok(inner.alarming_pvs(id, Utc::now()))
    }

    /// Number of leaves in an active, unacknowledged alarm
    pub fn active_alarm_count(&self) -> usize {
        let inner = self.shared.inner.read();
        let now = Utc::now();
        inner
            .items
            .values()
            .filter(|item| item.is_leaf() && item.severity(now).is_active())
            .count()
    }

    /// All paths, parents before children
    pub fn paths(&self) -> Vec<String> {
        let inner = self.shared.inner.read();
        inner
            .subtree(inner.root)
            .into_iter()
            .map(|id| inner.path_of(id))
            .collect()
    }

    /// Configuration of every item, parents before children
    pub fn item_configs(&self) -> Vec<(String, ItemConfig)> {
        let inner = self.shared.inner.read();
        inner
            .subtree(inner.root)
            .into_iter()
            .filter_map(|id| inner.items.get(&id))
            .map(|item| (item.path.clone(), item.config()))
            .collect()
    }

    /// Cancel every pending delayed latch
    pub fn shutdown(&self) {
        let mut inner = self.shared.inner.write();
        for item in inner.items.values_mut() {
            if let Some(pv) = item.as_leaf_mut() {
                pv.cancel_delay();
            }
        }
    }

    fn mutate<T, F>(&self, op: F) -> Result<T>
    where
        F: FnOnce(&mut TreeInner, &mut Vec<TreeEvent>) -> Result<T>,
    {
        let _order = self.shared.notify_lock.lock();
        let mut events = Vec::new();
        let result = {
            let mut inner = self.shared.inner.write();
            op(&mut inner, &mut events)
        };
        if !events.is_empty() {
            let listeners = self.shared.listeners.read().clone();
            for event in &events {
                for listener in &listeners {
                    listener.tree_event(event);
                }
            }
        }
        result
    }
}

impl std::fmt::Debug for AlarmTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlarmTree")
            .field("root", &self.root_path())
            .field("items", &self.len())
            .finish()
    }
}

impl TreeInner {
    fn lookup(&self, path: &str) -> Result<NodeId> {
        self.paths
            .get(path)
            .copied()
            .ok_or_else(|| AlarmError::ItemNotFound(path.to_string()))
    }

    fn get(&self, id: NodeId) -> Result<&AlarmTreeItem> {
        self.items
            .get(&id)
            .ok_or_else(|| AlarmError::ItemNotFound(format!("node {}", id)))
    }

    fn path_of(&self, id: NodeId) -> String {
        self.items
            .get(&id)
            .map(|item| item.path.clone())
            .unwrap_or_default()
    }

    fn leaf_mut(&mut self, id: NodeId, path: &str) -> Result<&mut AlarmPv> {
        self.items
            .get_mut(&id)
            .and_then(AlarmTreeItem::as_leaf_mut)
            .ok_or_else(|| AlarmError::WrongKind {
                path: path.to_string(),
                expected: "pv",
            })
    }

    fn insert(&mut self, parent: NodeId, name: &str, kind: ItemKind) -> Result<NodeId> {
        validate_name(name)?;
        let parent_item = self.get(parent)?;
        if parent_item.is_leaf() {
            return Err(AlarmError::WrongKind {
                path: parent_item.path.clone(),
                expected: "group",
            });
        }
        let path = format!("{}{}{}", parent_item.path, PATH_SEPARATOR, name);
        if self.paths.contains_key(&path) {
            return Err(AlarmError::DuplicatePath(path));
        }
        let id = self.next_id;
        self.next_id += 1;
        self.items.insert(
            id,
            AlarmTreeItem::new(name.to_string(), path.clone(), Some(parent), kind),
        );
        self.paths.insert(path, id);
        if let Some(group) = self
            .items
            .get_mut(&parent)
            .and_then(AlarmTreeItem::as_group_mut)
        {
            group.children.push(id);
        }
        Ok(id)
    }

    /// `id` and all its descendants, pre-order
    fn subtree(&self, id: NodeId) -> Vec<NodeId> {
        let mut result = Vec::new();
        let mut stack = vec![id];
        while let Some(node) = stack.pop() {
            if let Some(item) = self.items.get(&node) {
                result.push(node);
                stack.extend(item.children().iter().rev());
            }
        }
        result
    }

    fn leaf_change(&self, id: NodeId, newly_latched: bool, now: DateTime<Utc>) -> Option<TreeEvent> {
        let item = self.items.get(&id)?;
        match &item.kind {
            ItemKind::Leaf(pv) => Some(TreeEvent::Changed(ItemChange {
                path: item.path.clone(),
                is_leaf: true,
                severity: pv.effective_severity(now),
                state: Some(pv.state.clone()),
                newly_latched,
            })),
            ItemKind::Group(_) => None,
        }
    }

    /// Recompute group severities from `start` upwards
    ///
    /// Stops at the first group whose severity did not change.
    fn aggregate(&mut self, start: Option<NodeId>, now: DateTime<Utc>, events: &mut Vec<TreeEvent>) {
        let mut node = start;
        while let Some(id) = node {
            let Some(item) = self.items.get(&id) else {
                break;
            };
            let severity = item
                .children()
                .iter()
                .filter_map(|child| self.items.get(child))
                .map(|child| child.severity(now))
                .max()
                .unwrap_or(SeverityLevel::Ok);
            let path = item.path.clone();
            let parent = item.parent;
            let Some(group) = self.items.get_mut(&id).and_then(AlarmTreeItem::as_group_mut) else {
                break;
            };
            if group.severity == severity {
                break;
            }
            group.severity = severity;
            events.push(TreeEvent::Changed(ItemChange {
                path,
                is_leaf: false,
                severity,
                state: None,
                newly_latched: false,
            }));
            node = parent;
        }
    }

    fn alarming_pvs(&self, id: NodeId, now: DateTime<Utc>) -> Vec<PvSnapshot> {
        self.subtree(id)
            .into_iter()
            .filter_map(|node| self.items.get(&node))
            .filter_map(|item| match &item.kind {
                ItemKind::Leaf(pv) if pv.effective_severity(now).is_active() => Some(PvSnapshot {
                    path: item.path.clone(),
                    name: item.name.clone(),
                    description: pv.config.description.clone(),
                    state: pv.state.clone(),
                }),
                _ => None,
            })
            .collect()
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.trim().is_empty() || name.contains(PATH_SEPARATOR) {
        return Err(AlarmError::InvalidPath(format!("invalid item name '{}'", name)));
    }
    Ok(())
}

/// Split a path into its element names
pub fn path_elements(path: &str) -> Vec<&str> {
    path.split(PATH_SEPARATOR)
        .filter(|element| !element.is_empty())
        .collect()
}

/// Parent path, `None` for the root or a malformed path
pub fn parent_path(path: &str) -> Option<&str> {
    let pos = path.rfind(PATH_SEPARATOR)?;
    if pos == 0 {
        None
    } else {
        Some(&path[..pos])
    }
}
