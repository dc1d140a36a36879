// src/tree/item.rs - Leaf and group items of the alarm tree
use super::config::{GroupConfig, ItemConfig, PvConfig};
use crate::history::AlarmStateHistory;
use crate::severity::SeverityLevel;
use crate::state::{AlarmState, PvState};
use crate::timer::ResettableTimer;
use chrono::{DateTime, Utc};

pub(crate) type NodeId = usize;

/// One node of the alarm tree
#[derive(Debug)]
pub struct AlarmTreeItem {
    pub(crate) name: String,
    pub(crate) path: String,
    pub(crate) parent: Option<NodeId>,
    pub(crate) kind: ItemKind,
}

/// Leaf/group duality of [`AlarmTreeItem`]
#[derive(Debug)]
pub enum ItemKind {
    Leaf(AlarmPv),
    Group(AlarmGroup),
}

/// Leaf: one PV with its latched and current state
#[derive(Debug)]
pub struct AlarmPv {
    pub(crate) config: PvConfig,
    pub(crate) state: PvState,
    /// Recent active updates, only kept for count-based alarms
    pub(crate) history: Option<AlarmStateHistory>,
    /// Escalation waiting for the configured delay
    pub(crate) delayed: Option<DelayedLatch>,
    pub(crate) delay_generation: u64,
}

pub(crate) struct DelayedLatch {
    pub(crate) state: AlarmState,
    pub(crate) generation: u64,
    pub(crate) timer: Option<ResettableTimer>,
}

impl std::fmt::Debug for DelayedLatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DelayedLatch")
            .field("state", &self.state)
            .field("generation", &self.generation)
            .finish()
    }
}

/// Group: ordered children and their aggregated severity
#[derive(Debug)]
pub struct AlarmGroup {
    pub(crate) config: GroupConfig,
    pub(crate) children: Vec<NodeId>,
    pub(crate) severity: SeverityLevel,
}

impl AlarmTreeItem {
    pub(crate) fn new(name: String, path: String, parent: Option<NodeId>, kind: ItemKind) -> Self {
        Self {
            name,
            path,
            parent,
            kind,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self.kind, ItemKind::Leaf(_))
    }

    pub fn kind(&self) -> &ItemKind {
        &self.kind
    }

    /// Severity this item contributes to its parent
    ///
    /// Disabled or shelved leaves contribute OK while keeping their own state.
    pub fn severity(&self, now: DateTime<Utc>) -> SeverityLevel {
        match &self.kind {
            ItemKind::Leaf(pv) => pv.effective_severity(now),
            ItemKind::Group(group) => group.severity,
        }
    }

    pub(crate) fn children(&self) -> &[NodeId] {
        match &self.kind {
            ItemKind::Leaf(_) => &[],
            ItemKind::Group(group) => &group.children,
        }
    }

    pub fn config(&self) -> ItemConfig {
        match &self.kind {
            ItemKind::Leaf(pv) => ItemConfig::Pv(pv.config.clone()),
            ItemKind::Group(group) => ItemConfig::Group(group.config.clone()),
        }
    }

    pub(crate) fn as_leaf_mut(&mut self) -> Option<&mut AlarmPv> {
        match &mut self.kind {
            ItemKind::Leaf(pv) => Some(pv),
            ItemKind::Group(_) => None,
        }
    }

    pub(crate) fn as_group_mut(&mut self) -> Option<&mut AlarmGroup> {
        match &mut self.kind {
            ItemKind::Leaf(_) => None,
            ItemKind::Group(group) => Some(group),
        }
    }
}

impl AlarmPv {
    pub(crate) fn new(config: PvConfig) -> Self {
        Self {
            config,
            state: PvState::default(),
            history: None,
            delayed: None,
            delay_generation: 0,
        }
    }

    pub fn config(&self) -> &PvConfig {
        &self.config
    }

    pub fn state(&self) -> &PvState {
        &self.state
    }

    pub fn effective_severity(&self, now: DateTime<Utc>) -> SeverityLevel {
        if self.config.is_effectively_enabled(now) {
            self.state.severity
        } else {
            SeverityLevel::Ok
        }
    }

    pub(crate) fn set_config(&mut self, config: PvConfig) {
        if config.count != self.config.count || config.delay != self.config.delay {
            self.history = None;
            self.cancel_delay();
        }
        self.config = config;
    }
}

impl AlarmGroup {
    pub(crate) fn new(config: GroupConfig) -> Self {
        Self {
            config,
            children: Vec::new(),
            severity: SeverityLevel::Ok,
        }
    }

    pub fn config(&self) -> &GroupConfig {
        &self.config
    }

    pub fn severity(&self) -> SeverityLevel {
        self.severity
    }
}
