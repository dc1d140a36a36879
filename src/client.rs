// src/client.rs - Alarm tree rebuilt from the config and state channel
use crate::broker::Record;
use crate::error::{AlarmError, Result};
use crate::protocol::{decode, MessageKey, StateMessage};
use crate::state::PvState;
use crate::tree::{
    parent_path, path_elements, AlarmTree, GroupConfig, ItemConfig, PATH_SEPARATOR,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

/// Client view of an alarm configuration
///
/// Applies `config:` and `state:` records in any order. Missing parent groups
/// are created on the fly, a state that arrives before its PV is kept until
/// the PV appears. Group severities are aggregated locally.
pub struct AlarmClientModel {
    tree: AlarmTree,
    pending_states: Mutex<HashMap<String, PvState>>,
}

impl AlarmClientModel {
    pub fn new(root_name: &str) -> Result<Self> {
        Ok(Self {
            tree: AlarmTree::new(root_name)?,
            pending_states: Mutex::new(HashMap::new()),
        })
    }

    /// Model on top of an existing tree
    pub fn with_tree(tree: AlarmTree) -> Self {
        Self {
            tree,
            pending_states: Mutex::new(HashMap::new()),
        }
    }

    pub fn tree(&self) -> &AlarmTree {
        &self.tree
    }

    pub fn apply(&self, record: &Record) -> Result<()> {
        let Some(key) = MessageKey::parse(&record.key) else {
            debug!("Ignoring record with key '{}'", record.key);
            return Ok(());
        };
        match key {
            MessageKey::Config(path) => match &record.payload {
                Some(payload) => self.apply_config(&path, decode(payload)?),
                None => self.remove(&path),
            },
            MessageKey::State(path) => match &record.payload {
                Some(payload) => {
                    let state: StateMessage = decode(payload)?;
                    self.apply_state(&path, &state)
                }
                None => Ok(()),
            },
            MessageKey::Command(_) | MessageKey::Talk(_) => Ok(()),
        }
    }

    fn apply_config(&self, path: &str, config: ItemConfig) -> Result<()> {
        if self.tree.contains(path) {
            let is_leaf = self.tree.is_leaf(path)?;
            if is_leaf == config.is_pv() {
                self.tree.update_config(path, config)?;
                return Ok(());
            }
            // Item changed kind
            self.tree.remove(path)?;
        }
        let parent = parent_path(path).ok_or_else(|| AlarmError::InvalidPath(path.to_string()))?;
        let name = &path[parent.len() + 1..];
        self.ensure_groups(parent)?;
        match config {
            ItemConfig::Pv(pv) => {
                self.tree.add_pv(parent, name, pv)?;
                if let Some(state) = self.pending_states.lock().remove(path) {
                    self.tree.set_pv_state(path, state)?;
                }
            }
            ItemConfig::Group(group) => {
                self.tree.add_group(parent, name, group)?;
            }
        }
        Ok(())
    }

    fn apply_state(&self, path: &str, state: &StateMessage) -> Result<()> {
        if !self.tree.contains(path) {
            self.pending_states
                .lock()
                .insert(path.to_string(), state.to_pv_state());
            return Ok(());
        }
        if self.tree.is_leaf(path)? {
            self.tree.set_pv_state(path, state.to_pv_state())?;
        }
        Ok(())
    }

    fn remove(&self, path: &str) -> Result<()> {
        self.pending_states.lock().remove(path);
        if self.tree.contains(path) && path != self.tree.root_path() {
            self.tree.remove(path)?;
        }
        Ok(())
    }

    /// Create every missing group along `path`
    fn ensure_groups(&self, path: &str) -> Result<()> {
        let elements = path_elements(path);
        let root = self.tree.root_name();
        if elements.first() != Some(&root.as_str()) {
            return Err(AlarmError::InvalidPath(format!(
                "{} is not below /{}",
                path, root
            )));
        }
        let mut current = format!("{}{}", PATH_SEPARATOR, root);
        for name in &elements[1..] {
            let next = format!("{}{}{}", current, PATH_SEPARATOR, name);
            if !self.tree.contains(&next) {
                self.tree.add_group(&current, name, GroupConfig::default())?;
            }
            current = next;
        }
        Ok(())
    }

    /// States received for PVs that are not configured yet
    pub fn pending_count(&self) -> usize {
        self.pending_states.lock().len()
    }

    /// Apply records until none arrived for `quiet`, returns how many
    pub async fn apply_until_quiet(
        &self,
        rx: &mut mpsc::UnboundedReceiver<Record>,
        quiet: Duration,
    ) -> usize {
        let mut count = 0;
        while let Ok(Some(record)) = tokio::time::timeout(quiet, rx.recv()).await {
            if let Err(e) = self.apply(&record) {
                debug!("Skipping record {}: {}", record.key, e);
            }
            count += 1;
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::encode;
    use crate::severity::SeverityLevel;
    use crate::tree::PvConfig;
    use chrono::Utc;

    fn record(key: &str, payload: Option<bytes::Bytes>) -> Record {
        Record {
            topic: "Demo".to_string(),
            key: key.to_string(),
            payload,
            offset: 0,
            timestamp: Utc::now(),
        }
    }

    fn major() -> StateMessage {
        StateMessage::from_pv(&PvState {
            severity: SeverityLevel::Major,
            ..PvState::default()
        })
    }

    #[test]
    fn test_state_before_config() {
        let model = AlarmClientModel::new("Demo").unwrap();
        model
            .apply(&record("state:/Demo/A/B/pv", Some(encode(&major()).unwrap())))
            .unwrap();
        assert_eq!(model.pending_count(), 1);

        let config = ItemConfig::Pv(PvConfig::default());
        model
            .apply(&record("config:/Demo/A/B/pv", Some(encode(&config).unwrap())))
            .unwrap();
        assert_eq!(model.pending_count(), 0);
        assert!(model.tree().contains("/Demo/A/B"));
        assert_eq!(model.tree().severity("/Demo").unwrap(), SeverityLevel::Major);
    }

    #[test]
    fn test_tombstone_removes() {
        let model = AlarmClientModel::new("Demo").unwrap();
        let config = ItemConfig::Pv(PvConfig::default());
        model
            .apply(&record("config:/Demo/G/pv", Some(encode(&config).unwrap())))
            .unwrap();
        model.apply(&record("config:/Demo/G", None)).unwrap();
        assert!(!model.tree().contains("/Demo/G/pv"));
        assert_eq!(model.tree().len(), 1);
    }

    #[test]
    fn test_kind_change_and_foreign_root() {
        let model = AlarmClientModel::new("Demo").unwrap();
        let pv = ItemConfig::Pv(PvConfig::default());
        let group = ItemConfig::Group(GroupConfig::default());
        model
            .apply(&record("config:/Demo/x", Some(encode(&pv).unwrap())))
            .unwrap();
        model
            .apply(&record("config:/Demo/x", Some(encode(&group).unwrap())))
            .unwrap();
        assert!(!model.tree().is_leaf("/Demo/x").unwrap());

        assert!(model
            .apply(&record("config:/Other/x", Some(encode(&pv).unwrap())))
            .is_err());
        // Unknown keys are skipped
        assert!(model.apply(&record("whatever", None)).is_ok());
    }
}
