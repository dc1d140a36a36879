// src/config.rs - Server configuration with YAML support and validation

use crate::actions::{ExecutorConfig, FloodConfig, SmtpConfig};
use crate::error::{AlarmError, Result};
use crate::macros::Macros;
use crate::protocol::TopicNames;
use crate::tree::{AlarmTree, GroupConfig, ItemConfig, PvConfig, PATH_SEPARATOR};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

#[cfg(feature = "mqtt")]
use crate::broker::MqttConfig;

// ============================================================================
// MAIN CONFIGURATION
// ============================================================================

/// Alarm server configuration
///
/// Built once at startup and shared read-only by every component.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Name of the alarm configuration, root of the tree and base topic
    #[serde(default = "default_config_name")]
    pub config_name: String,

    /// Message log back-end
    #[serde(default)]
    pub broker: BrokerConfig,

    /// Root state is re-sent after this much silence on the state channel
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,

    /// Reminder about unacknowledged alarms, 0 disables
    #[serde(default = "default_nag_period_secs")]
    pub nag_period_secs: u64,

    /// Working directory of `cmd:` actions
    #[serde(default = "default_command_directory")]
    pub command_directory: PathBuf,

    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,

    /// Action prefixes that run again when their alarm clears
    #[serde(default = "default_followup")]
    pub automated_action_followup: Vec<String>,

    /// Allowed shelving durations, e.g. `1 hour, 6 hours, 1 day`
    #[serde(default = "default_shelving_options")]
    pub shelving_options: String,

    /// Macros for `cmd:` actions, e.g. `BIN=/opt/alarm/bin, S=SR`
    #[serde(default)]
    pub macros: String,

    #[serde(default)]
    pub actions: ExecutorConfig,

    #[serde(default)]
    pub flood: FloodConfig,

    #[serde(default)]
    pub email: Option<SmtpConfig>,

    /// Rules for client commands
    ///
    /// When absent, authorization is off and every command is accepted. A
    /// configured file that cannot be read denies every command.
    #[serde(default)]
    pub authorization: Option<AuthorizationConfig>,

    /// Replay of existing state ends after this much silence
    #[serde(default = "default_replay_quiet_ms")]
    pub replay_quiet_ms: u64,

    /// Retention of the command and talk topics
    #[serde(default = "default_short_retention_secs")]
    pub short_retention_secs: u64,

    /// Period of heartbeat and shelving checks
    #[serde(default = "default_maintenance_period_ms")]
    pub maintenance_period_ms: u64,

    /// Inline alarm tree
    #[serde(default)]
    pub tree: Option<TreeConfig>,

    /// Alarm tree in a separate YAML file, takes precedence over `tree`
    #[serde(default)]
    pub tree_file: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BrokerConfig {
    /// In-process log, nothing leaves this server
    Local,
    #[cfg(feature = "mqtt")]
    Mqtt(MqttConfig),
}

impl Default for BrokerConfig {
    fn default() -> Self {
        BrokerConfig::Local
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizationConfig {
    /// Rules file, may reference environment variables as `$(NAME)`
    pub file: String,

    /// User whose own permissions are reported, default is the process user
    #[serde(default)]
    pub user: Option<String>,
}

// ============================================================================
// ALARM TREE CONFIGURATION
// ============================================================================

/// Initial alarm tree
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TreeConfig {
    /// Configuration of the root group
    #[serde(default)]
    pub root: GroupConfig,

    #[serde(default)]
    pub children: Vec<TreeNodeConfig>,
}

/// Group or PV below the root, a PV iff `pv` is set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeNodeConfig {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<GroupConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pv: Option<PvConfig>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<TreeNodeConfig>,
}

impl TreeConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let tree: TreeConfig = serde_yaml::from_str(&text)?;
        tree.validate()?;
        Ok(tree)
    }

    pub fn validate(&self) -> Result<()> {
        fn check(node: &TreeNodeConfig, parent: &str) -> Result<()> {
            let path = format!("{}{}{}", parent, PATH_SEPARATOR, node.name);
            if node.name.trim().is_empty() || node.name.contains(PATH_SEPARATOR) {
                return Err(AlarmError::Config(format!("Invalid item name at {}", path)));
            }
            if node.pv.is_some() && (node.group.is_some() || !node.children.is_empty()) {
                return Err(AlarmError::Config(format!(
                    "PV {} cannot have group settings or children",
                    path
                )));
            }
            node.children.iter().try_for_each(|child| check(child, &path))
        }
        self.children.iter().try_for_each(|node| check(node, ""))
    }

    /// Add every configured item below the root of `tree`
    ///
    /// Returns the number of PVs.
    pub fn populate(&self, tree: &AlarmTree) -> Result<usize> {
        fn add(tree: &AlarmTree, parent: &str, node: &TreeNodeConfig) -> Result<usize> {
            if let Some(pv) = &node.pv {
                tree.add_pv(parent, &node.name, pv.clone())?;
                return Ok(1);
            }
            let path = tree.add_group(parent, &node.name, node.group.clone().unwrap_or_default())?;
            node.children
                .iter()
                .map(|child| add(tree, &path, child))
                .sum()
        }

        let root = tree.root_path();
        tree.update_config(&root, ItemConfig::Group(self.root.clone()))?;
        self.children.iter().map(|node| add(tree, &root, node)).sum()
    }
}

// ============================================================================
// LOADING AND DERIVED SETTINGS
// ============================================================================

impl ServerConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&text)
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        let config: ServerConfig = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.config_name.trim().is_empty() || self.config_name.contains(PATH_SEPARATOR) {
            return Err(AlarmError::Config(format!(
                "Invalid configuration name '{}'",
                self.config_name
            )));
        }
        if self.idle_timeout_ms == 0 {
            return Err(AlarmError::Config("idle_timeout_ms must be positive".to_string()));
        }
        if self.maintenance_period_ms == 0 {
            return Err(AlarmError::Config(
                "maintenance_period_ms must be positive".to_string(),
            ));
        }
        if self.actions.workers == 0 || self.actions.queue_size == 0 {
            return Err(AlarmError::Config(
                "Action workers and queue size must be positive".to_string(),
            ));
        }
        if self.flood.enabled && self.flood.count == 0 {
            return Err(AlarmError::Config("Flood count must be positive".to_string()));
        }
        if let Some(tree) = &self.tree {
            tree.validate()?;
        }
        Ok(())
    }

    pub fn topics(&self) -> TopicNames {
        TopicNames::new(&self.config_name)
    }

    /// Parsed shelving options, malformed entries are skipped
    pub fn shelving(&self) -> Vec<Duration> {
        parse_shelving_options(&self.shelving_options)
    }

    pub fn macros(&self) -> Macros {
        Macros::parse_or_default(&self.macros)
    }

    /// Tree from `tree_file` or the inline `tree`
    pub fn load_tree(&self) -> Result<Option<TreeConfig>> {
        match &self.tree_file {
            Some(path) => TreeConfig::from_file(path).map(Some),
            None => Ok(self.tree.clone()),
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn nag_period(&self) -> Option<Duration> {
        (self.nag_period_secs > 0).then(|| Duration::from_secs(self.nag_period_secs))
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn replay_quiet(&self) -> Duration {
        Duration::from_millis(self.replay_quiet_ms)
    }

    pub fn short_retention(&self) -> Duration {
        Duration::from_secs(self.short_retention_secs)
    }

    pub fn maintenance_period(&self) -> Duration {
        Duration::from_millis(self.maintenance_period_ms)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            config_name: default_config_name(),
            broker: BrokerConfig::default(),
            idle_timeout_ms: default_idle_timeout_ms(),
            nag_period_secs: default_nag_period_secs(),
            command_directory: default_command_directory(),
            command_timeout_secs: default_command_timeout_secs(),
            automated_action_followup: default_followup(),
            shelving_options: default_shelving_options(),
            macros: String::new(),
            actions: ExecutorConfig::default(),
            flood: FloodConfig::default(),
            email: None,
            authorization: None,
            replay_quiet_ms: default_replay_quiet_ms(),
            short_retention_secs: default_short_retention_secs(),
            maintenance_period_ms: default_maintenance_period_ms(),
            tree: None,
            tree_file: None,
        }
    }
}

/// Parse `1 hour, 30 minutes, 2 days`
pub fn parse_shelving_options(text: &str) -> Vec<Duration> {
    text.split(',')
        .map(str::trim)
        .filter(|option| !option.is_empty())
        .filter_map(|option| match parse_duration(option) {
            Some(duration) => Some(duration),
            None => {
                warn!("Ignoring malformed shelving option '{}'", option);
                None
            }
        })
        .collect()
}

fn parse_duration(text: &str) -> Option<Duration> {
    let mut parts = text.split_whitespace();
    let count: u64 = parts.next()?.parse().ok()?;
    let unit = parts.next()?.to_ascii_lowercase();
    if parts.next().is_some() || count == 0 {
        return None;
    }
    let seconds = match unit.trim_end_matches('s') {
        "sec" | "second" => 1,
        "min" | "minute" => 60,
        "hour" | "hr" => 3600,
        "day" => 86_400,
        "week" | "wk" => 604_800,
        _ => return None,
    };
    count.checked_mul(seconds).map(Duration::from_secs)
}

fn default_config_name() -> String {
    "Accelerator".to_string()
}
fn default_idle_timeout_ms() -> u64 {
    10_000
}
fn default_nag_period_secs() -> u64 {
    900
}
fn default_command_directory() -> PathBuf {
    PathBuf::from(".")
}
fn default_command_timeout_secs() -> u64 {
    30
}
fn default_followup() -> Vec<String> {
    vec!["mailto:".to_string(), "cmd:".to_string()]
}
fn default_shelving_options() -> String {
    "1 hour, 6 hours, 12 hours, 1 day, 7 days, 30 days".to_string()
}
fn default_replay_quiet_ms() -> u64 {
    500
}
fn default_short_retention_secs() -> u64 {
    3600
}
fn default_maintenance_period_ms() -> u64 {
    1000
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = r#"
config_name: Demo
idle_timeout_ms: 2000
macros: 'BIN=/opt/bin'
flood:
  count: 3
tree:
  children:
    - name: Vacuum
      group:
        guidance:
          - title: Call
            detail: Vacuum expert
      children:
        - name: "SR:VAC:P1"
          pv:
            description: Sector 1 pressure
            delay: 5
            actions:
              - title: Mail
                detail: "mailto:vac@example.org"
                delay: 60
    - name: "SR:RF:Fwd"
      pv:
        description: "* RF trip"
"#;

    #[test]
    fn test_load_yaml() {
        let config = ServerConfig::from_yaml(YAML).unwrap();
        assert_eq!(config.config_name, "Demo");
        assert_eq!(config.broker, BrokerConfig::Local);
        assert_eq!(config.idle_timeout(), Duration::from_millis(2000));
        assert_eq!(config.flood.count, 3);
        assert_eq!(config.macros().get("BIN"), Some("/opt/bin"));
        assert_eq!(config.topics().talk, "DemoTalk");
        assert_eq!(config.nag_period(), Some(Duration::from_secs(900)));
        assert!(config.authorization.is_none());
    }

    #[test]
    fn test_populate_tree() {
        let config = ServerConfig::from_yaml(YAML).unwrap();
        let tree = AlarmTree::new(&config.config_name).unwrap();
        let pvs = config.load_tree().unwrap().unwrap().populate(&tree).unwrap();
        assert_eq!(pvs, 2);
        assert!(tree.contains("/Demo/Vacuum/SR:VAC:P1"));
        match tree.config("/Demo/Vacuum/SR:VAC:P1").unwrap() {
            ItemConfig::Pv(pv) => {
                assert_eq!(pv.delay, 5);
                assert_eq!(pv.actions[0].delay, 60);
            }
            other => panic!("expected PV, got {:?}", other),
        }
    }

    #[test]
    fn test_tree_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("tree.yaml");
        std::fs::write(&file, "children:\n  - name: pv1\n    pv: {}\n").unwrap();
        let config = ServerConfig {
            tree_file: Some(file),
            ..ServerConfig::default()
        };
        let tree = config.load_tree().unwrap().unwrap();
        assert_eq!(tree.children[0].pv, Some(PvConfig::default()));
    }

    #[test]
    fn test_invalid_configs() {
        assert!(ServerConfig::from_yaml("config_name: 'a/b'").is_err());
        assert!(ServerConfig::from_yaml("idle_timeout_ms: 0").is_err());
        let pv_with_children = r#"
tree:
  children:
    - name: p
      pv: {}
      children:
        - name: q
          pv: {}
"#;
        assert!(ServerConfig::from_yaml(pv_with_children).is_err());
    }

    #[test]
    fn test_shelving_options() {
        let options = parse_shelving_options("30 minutes, 1 hour, bogus, 2 Days, 0 sec, 1 week");
        assert_eq!(
            options,
            vec![
                Duration::from_secs(1800),
                Duration::from_secs(3600),
                Duration::from_secs(2 * 86_400),
                Duration::from_secs(604_800),
            ]
        );
        assert_eq!(ServerConfig::default().shelving().len(), 6);
    }

    #[test]
    fn test_oversized_shelving_option_skipped() {
        let options = parse_shelving_options("99999999999999999 days, 1 hour");
        assert_eq!(options, vec![Duration::from_secs(3600)]);

        let yaml = "shelving_options: \"18446744073709551615 weeks\"";
        let config = ServerConfig::from_yaml(yaml).unwrap();
        assert!(config.shelving().is_empty());
    }
}
