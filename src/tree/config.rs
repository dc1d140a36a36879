// src/tree/config.rs - Per-item configuration
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Guidance, display or command link shown to operators
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TitleDetail {
    pub title: String,
    pub detail: String,
}

/// One configured automated action
///
/// `detail` is tagged by prefix: `mailto:a@x,b@y`, `cmd:program args`, or a
/// prefix understood by a registered action handler.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct TitleDetailDelay {
    pub title: String,
    pub detail: String,
    /// Seconds the alarm must stay active before the action runs
    #[serde(default)]
    pub delay: u32,
}

impl TitleDetailDelay {
    pub fn new(title: impl Into<String>, detail: impl Into<String>, delay: u32) -> Self {
        Self {
            title: title.into(),
            detail: detail.into(),
            delay,
        }
    }

    pub fn delay(&self) -> Duration {
        Duration::from_secs(u64::from(self.delay))
    }

    /// Detail prefix including the colon, e.g. `mailto:`
    pub fn prefix(&self) -> Option<&str> {
        self.detail.find(':').map(|pos| &self.detail[..=pos])
    }
}

/// Configuration of a PV leaf
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PvConfig {
    #[serde(default)]
    pub description: String,

    /// Disabled PVs keep their state but report OK to their parents
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Disabled until this time (shelved); cleared when it expires
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shelved_until: Option<DateTime<Utc>>,

    /// Latch the highest severity until acknowledged
    #[serde(default = "default_true")]
    pub latching: bool,

    /// Announce new alarms on the talk channel
    #[serde(default = "default_true")]
    pub annunciating: bool,

    /// Seconds an alarm must persist before it is latched
    #[serde(default)]
    pub delay: u32,

    /// Latch once this many alarms arrive within `delay` seconds
    #[serde(default)]
    pub count: u32,

    /// Enable expression, evaluated by the PV layer
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub filter: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub guidance: Vec<TitleDetail>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub displays: Vec<TitleDetail>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub commands: Vec<TitleDetail>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<TitleDetailDelay>,
}

impl PvConfig {
    pub fn with_description(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            ..Self::default()
        }
    }

    /// Enabled and not shelved at `now`?
    pub fn is_effectively_enabled(&self, now: DateTime<Utc>) -> bool {
        self.enabled && self.shelved_until.map_or(true, |until| until <= now)
    }
}

impl Default for PvConfig {
    fn default() -> Self {
        Self {
            description: String::new(),
            enabled: true,
            shelved_until: None,
            latching: true,
            annunciating: true,
            delay: 0,
            count: 0,
            filter: String::new(),
            guidance: Vec::new(),
            displays: Vec::new(),
            commands: Vec::new(),
            actions: Vec::new(),
        }
    }
}

/// Configuration of a group node
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GroupConfig {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub guidance: Vec<TitleDetail>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub displays: Vec<TitleDetail>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub commands: Vec<TitleDetail>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<TitleDetailDelay>,
}

/// Configuration of either kind of item, as published on the config channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ItemConfig {
    Group(GroupConfig),
    Pv(PvConfig),
}

impl ItemConfig {
    pub fn actions(&self) -> &[TitleDetailDelay] {
        match self {
            ItemConfig::Group(group) => &group.actions,
            ItemConfig::Pv(pv) => &pv.actions,
        }
    }

    pub fn is_pv(&self) -> bool {
        matches!(self, ItemConfig::Pv(_))
    }
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_prefix() {
        let action = TitleDetailDelay::new("Notify", "mailto:ops@example.org", 30);
        assert_eq!(action.prefix(), Some("mailto:"));
        assert_eq!(action.delay(), Duration::from_secs(30));
        assert_eq!(TitleDetailDelay::new("x", "nothing", 0).prefix(), None);
    }

    #[test]
    fn test_item_config_tagging() {
        let config = ItemConfig::Pv(PvConfig {
            description: "Vacuum pressure".to_string(),
            delay: 5,
            ..PvConfig::default()
        });
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["type"], "pv");
        assert_eq!(json["delay"], 5);
        assert!(json.get("guidance").is_none());

        let back: ItemConfig = serde_json::from_value(json).unwrap();
        assert_eq!(back, config);

        let group: ItemConfig = serde_json::from_str(r#"{"type":"group"}"#).unwrap();
        assert_eq!(group, ItemConfig::Group(GroupConfig::default()));
    }

    #[test]
    fn test_pv_defaults_from_yaml() {
        let config: PvConfig = serde_yaml::from_str("description: Beam current").unwrap();
        assert!(config.enabled);
        assert!(config.latching);
        assert!(config.annunciating);
        assert_eq!(config.count, 0);
    }
}
