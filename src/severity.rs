// src/severity.rs - Alarm severity levels and their ordering
use crate::error::{AlarmError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Alarm severity
///
/// The derived ordering is the one used for tree aggregation:
///
/// `OK < MINOR_ACK < MAJOR_ACK < INVALID_ACK < UNDEFINED_ACK < MINOR < MAJOR < INVALID < UNDEFINED`
///
/// Every acknowledged level ranks below every active level, so a group
/// containing one un-acknowledged MINOR alarm shows MINOR even if a sibling
/// holds an acknowledged MAJOR alarm.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SeverityLevel {
    /// No alarm
    #[default]
    Ok,
    /// Acknowledged minor alarm
    MinorAck,
    /// Acknowledged major alarm
    MajorAck,
    /// Acknowledged invalid alarm
    InvalidAck,
    /// Acknowledged undefined alarm
    UndefinedAck,
    /// Minor alarm
    Minor,
    /// Major alarm
    Major,
    /// Invalid value, for example a disconnected PV
    Invalid,
    /// Undefined state
    Undefined,
}

impl SeverityLevel {
    /// All levels in ascending order
    pub const ALL: [SeverityLevel; 9] = [
        SeverityLevel::Ok,
        SeverityLevel::MinorAck,
        SeverityLevel::MajorAck,
        SeverityLevel::InvalidAck,
        SeverityLevel::UndefinedAck,
        SeverityLevel::Minor,
        SeverityLevel::Major,
        SeverityLevel::Invalid,
        SeverityLevel::Undefined,
    ];

    /// Is this an alarm that still awaits acknowledgment?
    pub fn is_active(self) -> bool {
        matches!(
            self,
            SeverityLevel::Minor
                | SeverityLevel::Major
                | SeverityLevel::Invalid
                | SeverityLevel::Undefined
        )
    }

    /// Is this one of the `_ACK` levels?
    pub fn is_acknowledged(self) -> bool {
        matches!(
            self,
            SeverityLevel::MinorAck
                | SeverityLevel::MajorAck
                | SeverityLevel::InvalidAck
                | SeverityLevel::UndefinedAck
        )
    }

    /// Rank ignoring the acknowledgment suffix: OK=0, MINOR=1 .. UNDEFINED=4
    pub fn base_rank(self) -> u8 {
        match self {
            SeverityLevel::Ok => 0,
            SeverityLevel::Minor | SeverityLevel::MinorAck => 1,
            SeverityLevel::Major | SeverityLevel::MajorAck => 2,
            SeverityLevel::Invalid | SeverityLevel::InvalidAck => 3,
            SeverityLevel::Undefined | SeverityLevel::UndefinedAck => 4,
        }
    }

    /// The acknowledged counterpart of an active level
    pub fn acknowledged(self) -> Self {
        match self {
            SeverityLevel::Minor => SeverityLevel::MinorAck,
            SeverityLevel::Major => SeverityLevel::MajorAck,
            SeverityLevel::Invalid => SeverityLevel::InvalidAck,
            SeverityLevel::Undefined => SeverityLevel::UndefinedAck,
            other => other,
        }
    }

    /// The active counterpart of an acknowledged level
    pub fn unacknowledged(self) -> Self {
        match self {
            SeverityLevel::MinorAck => SeverityLevel::Minor,
            SeverityLevel::MajorAck => SeverityLevel::Major,
            SeverityLevel::InvalidAck => SeverityLevel::Invalid,
            SeverityLevel::UndefinedAck => SeverityLevel::Undefined,
            other => other,
        }
    }

    /// Name as used on the wire
    pub fn as_str(self) -> &'static str {
        match self {
            SeverityLevel::Ok => "OK",
            SeverityLevel::MinorAck => "MINOR_ACK",
            SeverityLevel::MajorAck => "MAJOR_ACK",
            SeverityLevel::InvalidAck => "INVALID_ACK",
            SeverityLevel::UndefinedAck => "UNDEFINED_ACK",
            SeverityLevel::Minor => "MINOR",
            SeverityLevel::Major => "MAJOR",
            SeverityLevel::Invalid => "INVALID",
            SeverityLevel::Undefined => "UNDEFINED",
        }
    }
}

impl fmt::Display for SeverityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SeverityLevel {
    type Err = AlarmError;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().to_ascii_uppercase();
        SeverityLevel::ALL
            .iter()
            .copied()
            .find(|level| level.as_str() == wanted)
            .ok_or_else(|| AlarmError::Config(format!("Unknown severity '{}'", s)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordering() {
        assert!(SeverityLevel::Ok < SeverityLevel::MinorAck);
        assert!(SeverityLevel::UndefinedAck < SeverityLevel::Minor);
        assert!(SeverityLevel::MajorAck < SeverityLevel::Major);
        assert!(SeverityLevel::Minor < SeverityLevel::Major);
        assert!(SeverityLevel::Invalid < SeverityLevel::Undefined);
        assert_eq!(
            SeverityLevel::ALL.iter().max(),
            Some(&SeverityLevel::Undefined)
        );
    }

    #[test]
    fn test_ack_round_trip() {
        for level in SeverityLevel::ALL {
            if level.is_active() {
                let acked = level.acknowledged();
                assert!(acked.is_acknowledged());
                assert_eq!(acked.unacknowledged(), level);
                assert_eq!(acked.base_rank(), level.base_rank());
            }
        }
        assert_eq!(SeverityLevel::Ok.acknowledged(), SeverityLevel::Ok);
        assert!(!SeverityLevel::Ok.is_active());
    }

    #[test]
    fn test_parse_and_serde() {
        assert_eq!("major_ack".parse::<SeverityLevel>().unwrap(), SeverityLevel::MajorAck);
        assert!("SEVERE".parse::<SeverityLevel>().is_err());

        let json = serde_json::to_string(&SeverityLevel::InvalidAck).unwrap();
        assert_eq!(json, "\"INVALID_ACK\"");
        let back: SeverityLevel = serde_json::from_str("\"OK\"").unwrap();
        assert_eq!(back, SeverityLevel::Ok);
    }
}
