// src/broker/mod.rs - Keyed message log that distributes config, state, commands and talk
//!
//! The alarm system replicates everything through a small set of topics.
//! Records carry a key and an optional payload; a `None` payload is a
//! tombstone that deletes the key on compacted topics. Subscribers first
//! receive what the topic retained, then live records, in send order per
//! topic.

pub mod local;
#[cfg(feature = "mqtt")]
pub mod mqtt;

pub use local::LocalLog;
#[cfg(feature = "mqtt")]
pub use mqtt::{MqttConfig, MqttLog};

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::sync::mpsc;

/// What a topic keeps for late subscribers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retention {
    /// Only the latest record per key
    Compacted,
    /// Every record younger than the duration
    TimeLimited(Duration),
    /// Every record
    Unlimited,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub topic: String,
    pub key: String,
    /// `None` marks a deleted key
    pub payload: Option<Bytes>,
    pub offset: u64,
    pub timestamp: DateTime<Utc>,
}

impl Record {
    pub fn is_tombstone(&self) -> bool {
        self.payload.is_none()
    }
}

#[async_trait]
pub trait MessageLog: Send + Sync {
    /// Declare a topic, idempotent
    async fn create_topic(&self, topic: &str, retention: Retention) -> Result<()>;

    async fn send(&self, topic: &str, key: &str, payload: Option<Bytes>) -> Result<()>;

    /// Retained and future records of `topics`, merged into one channel
    async fn subscribe(&self, topics: &[String]) -> Result<mpsc::UnboundedReceiver<Record>>;

    fn is_connected(&self) -> bool;
}
