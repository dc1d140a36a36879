// src/protocol.rs - Topic names, message keys and JSON payloads
use crate::broker::Retention;
use crate::error::{AlarmError, Result};
use crate::severity::SeverityLevel;
use crate::state::PvState;
use crate::tree::{AlarmTree, ItemConfig};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

pub const COMMAND_SUFFIX: &str = "Command";
pub const TALK_SUFFIX: &str = "Talk";
pub const LONG_TERM_SUFFIX: &str = "LongTerm";

/// Topics of one alarm configuration
///
/// Config and state share the base topic, named after the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicNames {
    pub config: String,
    pub command: String,
    pub talk: String,
    pub long_term: String,
}

impl TopicNames {
    pub fn new(config_name: &str) -> Self {
        Self {
            config: config_name.to_string(),
            command: format!("{}{}", config_name, COMMAND_SUFFIX),
            talk: format!("{}{}", config_name, TALK_SUFFIX),
            long_term: format!("{}{}", config_name, LONG_TERM_SUFFIX),
        }
    }

    /// Every topic with its retention
    pub fn retentions(&self, short: Duration) -> Vec<(String, Retention)> {
        vec![
            (self.config.clone(), Retention::Compacted),
            (self.command.clone(), Retention::TimeLimited(short)),
            (self.talk.clone(), Retention::TimeLimited(short)),
            (self.long_term.clone(), Retention::Unlimited),
        ]
    }
}

/// `<kind>:<path>` key of a record
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageKey {
    Config(String),
    State(String),
    Command(String),
    Talk(String),
}

impl MessageKey {
    pub fn parse(key: &str) -> Option<Self> {
        let (kind, path) = key.split_once(':')?;
        if !path.starts_with(crate::tree::PATH_SEPARATOR) {
            return None;
        }
        let path = path.to_string();
        match kind {
            "config" => Some(MessageKey::Config(path)),
            "state" => Some(MessageKey::State(path)),
            "command" => Some(MessageKey::Command(path)),
            "talk" => Some(MessageKey::Talk(path)),
            _ => None,
        }
    }

    pub fn path(&self) -> &str {
        match self {
            MessageKey::Config(path)
            | MessageKey::State(path)
            | MessageKey::Command(path)
            | MessageKey::Talk(path) => path,
        }
    }

    fn prefix(&self) -> &'static str {
        match self {
            MessageKey::Config(_) => "config",
            MessageKey::State(_) => "state",
            MessageKey::Command(_) => "command",
            MessageKey::Talk(_) => "talk",
        }
    }
}

impl fmt::Display for MessageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.prefix(), self.path())
    }
}

/// State of a leaf or group on the state channel
///
/// Groups only carry their severity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateMessage {
    pub severity: SeverityLevel,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_severity: Option<SeverityLevel>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_message: Option<String>,
}

impl StateMessage {
    pub fn from_pv(state: &PvState) -> Self {
        Self {
            severity: state.severity,
            message: Some(state.message.clone()),
            value: Some(state.value.clone()),
            time: Some(state.time),
            current_severity: Some(state.current_severity),
            current_message: Some(state.current_message.clone()),
        }
    }

    pub fn from_group(severity: SeverityLevel) -> Self {
        Self {
            severity,
            message: None,
            value: None,
            time: None,
            current_severity: None,
            current_message: None,
        }
    }

    /// Leaf state, missing fields take their defaults
    pub fn to_pv_state(&self) -> PvState {
        let defaults = PvState::default();
        PvState {
            severity: self.severity,
            message: self.message.clone().unwrap_or(defaults.message),
            value: self.value.clone().unwrap_or(defaults.value),
            time: self.time.unwrap_or(defaults.time),
            current_severity: self.current_severity.unwrap_or(defaults.current_severity),
            current_message: self
                .current_message
                .clone()
                .unwrap_or(defaults.current_message),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum AlarmCommand {
    Acknowledge,
    Unacknowledge,
    Enable,
    Disable,
    Shelve { duration_secs: u64 },
    Unshelve,
}

impl AlarmCommand {
    /// Permission a user needs for this command
    pub fn permission(&self) -> &'static str {
        match self {
            AlarmCommand::Acknowledge | AlarmCommand::Unacknowledge => crate::auth::ALARM_ACK,
            _ => crate::auth::ALARM_CONFIG,
        }
    }
}

/// Client request on the command channel, keyed `command:<path>`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandMessage {
    pub user: String,
    pub host: String,
    #[serde(flatten)]
    pub command: AlarmCommand,
}

/// Annunciation on the talk channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TalkMessage {
    pub severity: SeverityLevel,
    /// Announce even while the annunciator is muted or flooded
    pub standout: bool,
    pub talk: String,
}

impl TalkMessage {
    /// Description starting with `*` stands out, the `*` is not spoken
    pub fn from_description(severity: SeverityLevel, description: &str) -> Self {
        match description.strip_prefix('*') {
            Some(rest) => Self {
                severity,
                standout: true,
                talk: rest.trim().to_string(),
            },
            None => Self {
                severity,
                standout: false,
                talk: description.to_string(),
            },
        }
    }
}

pub fn encode<T: Serialize>(message: &T) -> Result<Bytes> {
    Ok(Bytes::from(serde_json::to_vec(message)?))
}

pub fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T> {
    serde_json::from_slice(payload).map_err(AlarmError::from)
}

/// `config:<path>` records for the whole tree, parents first
pub fn config_messages(tree: &AlarmTree) -> Result<Vec<(String, Bytes)>> {
    tree.item_configs()
        .into_iter()
        .map(|(path, config): (String, ItemConfig)| {
            Ok((MessageKey::Config(path).to_string(), encode(&config)?))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::{GroupConfig, PvConfig};

    #[test]
    fn test_topic_names() {
        let topics = TopicNames::new("Accelerator");
        assert_eq!(topics.command, "AcceleratorCommand");
        assert_eq!(topics.talk, "AcceleratorTalk");
        assert_eq!(topics.long_term, "AcceleratorLongTerm");
        let retentions = topics.retentions(Duration::from_secs(60));
        assert_eq!(retentions[0], ("Accelerator".to_string(), Retention::Compacted));
    }

    #[test]
    fn test_message_keys() {
        let key = MessageKey::parse("state:/Accelerator/Vacuum/SR:P1").unwrap();
        assert_eq!(key, MessageKey::State("/Accelerator/Vacuum/SR:P1".to_string()));
        assert_eq!(key.to_string(), "state:/Accelerator/Vacuum/SR:P1");
        assert!(MessageKey::parse("bogus:/A").is_none());
        assert!(MessageKey::parse("state:A").is_none());
        assert!(MessageKey::parse("nocolon").is_none());
    }

    #[test]
    fn test_command_wire_format() {
        let message = CommandMessage {
            user: "operator".to_string(),
            host: "console1".to_string(),
            command: AlarmCommand::Shelve { duration_secs: 3600 },
        };
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["command"], "shelve");
        assert_eq!(json["duration_secs"], 3600);

        let ack: CommandMessage =
            decode(br#"{"user":"u","host":"h","command":"acknowledge"}"#).unwrap();
        assert_eq!(ack.command, AlarmCommand::Acknowledge);
        assert_eq!(ack.command.permission(), "alarm_ack");
        assert_eq!(AlarmCommand::Disable.permission(), "alarm_config");
    }

    #[test]
    fn test_group_state_is_severity_only() {
        let json = serde_json::to_string(&StateMessage::from_group(SeverityLevel::MinorAck)).unwrap();
        assert_eq!(json, r#"{"severity":"MINOR_ACK"}"#);
    }

    #[test]
    fn test_talk_standout() {
        let talk = TalkMessage::from_description(SeverityLevel::Major, "* Beam dump");
        assert!(talk.standout);
        assert_eq!(talk.talk, "Beam dump");
        assert!(!TalkMessage::from_description(SeverityLevel::Minor, "Vacuum").standout);
    }

    #[test]
    fn test_config_messages_parent_first() {
        let tree = AlarmTree::new("Demo").unwrap();
        tree.add_group("/Demo", "G", GroupConfig::default()).unwrap();
        tree.add_pv("/Demo/G", "pv", PvConfig::default()).unwrap();
        let keys: Vec<_> = config_messages(&tree)
            .unwrap()
            .into_iter()
            .map(|(key, _)| key)
            .collect();
        assert_eq!(keys, vec!["config:/Demo", "config:/Demo/G", "config:/Demo/G/pv"]);
    }
}
