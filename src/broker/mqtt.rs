// src/broker/mqtt.rs - Message log on top of an MQTT broker
//!
//! Every record goes to `<topic>/<key>`. Compacted topics use retained
//! messages, so the broker keeps the latest payload per key and replays it
//! to new subscribers. A tombstone is an empty retained payload, which
//! clears the retained message.

use super::{MessageLog, Record, Retention};
use crate::error::{AlarmError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use parking_lot::Mutex;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MqttConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Random id when not set
    #[serde(default)]
    pub client_id: Option<String>,

    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,

    /// Requests buffered while the connection is down
    #[serde(default = "default_capacity")]
    pub capacity: usize,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            client_id: None,
            keep_alive_secs: default_keep_alive_secs(),
            capacity: default_capacity(),
        }
    }
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    1883
}

fn default_keep_alive_secs() -> u64 {
    30
}

fn default_capacity() -> usize {
    100
}

pub struct MqttLog {
    client: AsyncClient,
    shared: Arc<MqttShared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

struct MqttShared {
    connected: AtomicBool,
    next_offset: AtomicU64,
    retention: Mutex<HashMap<String, Retention>>,
    subscribers: Mutex<Vec<(Vec<String>, mpsc::UnboundedSender<Record>)>>,
}

impl MqttLog {
    /// Create the client and start polling its event loop
    pub fn connect(config: &MqttConfig) -> Self {
        let client_id = config
            .client_id
            .clone()
            .unwrap_or_else(|| format!("alarm-server-{}", uuid::Uuid::new_v4()));
        let mut options = MqttOptions::new(client_id, &config.host, config.port);
        options.set_keep_alive(Duration::from_secs(config.keep_alive_secs.max(5)));

        let (client, eventloop) = AsyncClient::new(options, config.capacity.max(10));
        let shared = Arc::new(MqttShared {
            connected: AtomicBool::new(false),
            next_offset: AtomicU64::new(0),
            retention: Mutex::new(HashMap::new()),
            subscribers: Mutex::new(Vec::new()),
        });

        info!("Connecting to MQTT broker {}:{}", config.host, config.port);
        let task = tokio::spawn(Self::poll(eventloop, client.clone(), shared.clone()));

        Self {
            client,
            shared,
            task: Mutex::new(Some(task)),
        }
    }

    async fn poll(mut eventloop: EventLoop, client: AsyncClient, shared: Arc<MqttShared>) {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("Connected to MQTT broker");
                    shared.connected.store(true, Ordering::SeqCst);
                    // Sessions are clean, subscriptions must be renewed
                    for filter in shared.filters() {
                        if let Err(e) = client.try_subscribe(filter.clone(), QoS::AtLeastOnce) {
                            warn!("Failed to renew subscription {}: {}", filter, e);
                        }
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    shared.dispatch(&publish.topic, publish.payload);
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    shared.connected.store(false, Ordering::SeqCst);
                }
                Ok(_) => {}
                Err(e) => {
                    if shared.connected.swap(false, Ordering::SeqCst) {
                        warn!("MQTT connection lost: {}", e);
                    } else {
                        debug!("MQTT connection error: {}", e);
                    }
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    pub fn shutdown(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

impl Drop for MqttLog {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl MqttShared {
    fn filters(&self) -> Vec<String> {
        let mut filters: Vec<String> = self
            .subscribers
            .lock()
            .iter()
            .flat_map(|(topics, _)| topics.iter().map(|t| topic_filter(t)))
            .collect();
        filters.sort();
        filters.dedup();
        filters
    }

    fn dispatch(&self, mqtt_topic: &str, payload: Bytes) {
        let Some((topic, key)) = mqtt_topic.split_once('/') else {
            debug!("Ignoring message on {}", mqtt_topic);
            return;
        };
        let record = Record {
            topic: topic.to_string(),
            key: key.to_string(),
            payload: (!payload.is_empty()).then_some(payload),
            offset: self.next_offset.fetch_add(1, Ordering::SeqCst),
            timestamp: Utc::now(),
        };
        self.subscribers.lock().retain(|(topics, tx)| {
            if !topics.iter().any(|t| t == topic) {
                return true;
            }
            tx.send(record.clone()).is_ok()
        });
    }
}

fn topic_filter(topic: &str) -> String {
    format!("{}/#", topic)
}

#[async_trait]
impl MessageLog for MqttLog {
    async fn create_topic(&self, topic: &str, retention: Retention) -> Result<()> {
        self.shared
            .retention
            .lock()
            .insert(topic.to_string(), retention);
        Ok(())
    }

    async fn send(&self, topic: &str, key: &str, payload: Option<Bytes>) -> Result<()> {
        let retain = matches!(
            self.shared.retention.lock().get(topic),
            Some(Retention::Compacted)
        );
        let payload = payload.map(|p| p.to_vec()).unwrap_or_default();
        self.client
            .publish(format!("{}/{}", topic, key), QoS::AtLeastOnce, retain, payload)
            .await
            .map_err(|e| AlarmError::Broker(format!("Publish to {} failed: {}", topic, e)))
    }

    async fn subscribe(&self, topics: &[String]) -> Result<mpsc::UnboundedReceiver<Record>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared.subscribers.lock().push((topics.to_vec(), tx));
        for topic in topics {
            self.client
                .subscribe(topic_filter(topic), QoS::AtLeastOnce)
                .await
                .map_err(|e| AlarmError::Broker(format!("Subscribe to {} failed: {}", topic, e)))?;
        }
        Ok(rx)
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shared() -> MqttShared {
        MqttShared {
            connected: AtomicBool::new(false),
            next_offset: AtomicU64::new(0),
            retention: Mutex::new(HashMap::new()),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    #[test]
    fn test_dispatch_splits_topic_and_key() {
        let shared = shared();
        let (tx, mut rx) = mpsc::unbounded_channel();
        shared
            .subscribers
            .lock()
            .push((vec!["Accelerator".to_string()], tx));

        shared.dispatch(
            "Accelerator/state:/Accelerator/Vacuum/p1",
            Bytes::from_static(b"{\"severity\":\"MAJOR\"}"),
        );
        shared.dispatch("Accelerator/config:/Accelerator/Vacuum", Bytes::new());
        shared.dispatch("AcceleratorTalk/talk:/Accelerator", Bytes::from_static(b"x"));

        let state = rx.try_recv().unwrap();
        assert_eq!(state.topic, "Accelerator");
        assert_eq!(state.key, "state:/Accelerator/Vacuum/p1");
        let tombstone = rx.try_recv().unwrap();
        assert!(tombstone.is_tombstone());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_config_defaults() {
        let config: MqttConfig = serde_yaml::from_str("host: broker.local").unwrap();
        assert_eq!(config.port, 1883);
        assert_eq!(config.keep_alive_secs, 30);
        assert!(config.client_id.is_none());
    }
}
