// src/broker/local.rs - In-process message log
use super::{MessageLog, Record, Retention};
use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// Message log kept in memory, for single-process deployments and tests
///
/// Compacted topics drop older records of a key on every send. Time-limited
/// topics drop expired records on every send.
#[derive(Clone, Default)]
pub struct LocalLog {
    inner: Arc<Mutex<LocalInner>>,
}

#[derive(Default)]
struct LocalInner {
    topics: HashMap<String, TopicLog>,
    next_offset: u64,
}

struct TopicLog {
    retention: Retention,
    records: Vec<Record>,
    subscribers: Vec<mpsc::UnboundedSender<Record>>,
}

impl TopicLog {
    fn new(retention: Retention) -> Self {
        Self {
            retention,
            records: Vec::new(),
            subscribers: Vec::new(),
        }
    }

    fn append(&mut self, record: Record) {
        match self.retention {
            Retention::Compacted => self.records.retain(|r| r.key != record.key),
            Retention::TimeLimited(keep) => {
                let keep = chrono::Duration::from_std(keep)
                    .unwrap_or_else(|_| chrono::Duration::weeks(5200));
                let oldest = record.timestamp - keep;
                self.records.retain(|r| r.timestamp >= oldest);
            }
            Retention::Unlimited => {}
        }
        self.subscribers
            .retain(|subscriber| subscriber.send(record.clone()).is_ok());
        self.records.push(record);
    }
}

impl LocalLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a new subscriber of `topic` would replay
    pub fn records(&self, topic: &str) -> Vec<Record> {
        self.inner
            .lock()
            .topics
            .get(topic)
            .map(|log| log.records.clone())
            .unwrap_or_default()
    }

    pub fn topics(&self) -> Vec<String> {
        self.inner.lock().topics.keys().cloned().collect()
    }
}

impl LocalInner {
    fn topic(&mut self, topic: &str) -> &mut TopicLog {
        self.topics.entry(topic.to_string()).or_insert_with(|| {
            debug!("Auto-creating topic {}", topic);
            TopicLog::new(Retention::Unlimited)
        })
    }
}

#[async_trait]
impl MessageLog for LocalLog {
    async fn create_topic(&self, topic: &str, retention: Retention) -> Result<()> {
        let mut inner = self.inner.lock();
        inner
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| TopicLog::new(retention));
        Ok(())
    }

    async fn send(&self, topic: &str, key: &str, payload: Option<Bytes>) -> Result<()> {
        let mut inner = self.inner.lock();
        let offset = inner.next_offset;
        inner.next_offset += 1;
        let record = Record {
            topic: topic.to_string(),
            key: key.to_string(),
            payload,
            offset,
            timestamp: Utc::now(),
        };
        inner.topic(topic).append(record);
        Ok(())
    }

    async fn subscribe(&self, topics: &[String]) -> Result<mpsc::UnboundedReceiver<Record>> {
        let (tx, rx) = mpsc::unbounded_channel();
        // Replay and registration under one lock, so nothing is lost or doubled
        let mut inner = self.inner.lock();
        for topic in topics {
            let log = inner.topic(topic);
            for record in &log.records {
                let _ = tx.send(record.clone());
            }
            log.subscribers.push(tx.clone());
        }
        Ok(rx)
    }

    fn is_connected(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn payload(text: &str) -> Option<Bytes> {
        Some(Bytes::from(text.to_string()))
    }

    #[tokio::test]
    async fn test_compaction_keeps_latest_per_key() {
        let log = LocalLog::new();
        log.create_topic("Demo", Retention::Compacted).await.unwrap();
        log.send("Demo", "state:/Demo/a", payload("1")).await.unwrap();
        log.send("Demo", "state:/Demo/b", payload("2")).await.unwrap();
        log.send("Demo", "state:/Demo/a", payload("3")).await.unwrap();
        log.send("Demo", "state:/Demo/b", None).await.unwrap();

        let records = log.records("Demo");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].payload, payload("3"));
        assert!(records[1].is_tombstone());
    }

    #[tokio::test]
    async fn test_subscriber_replays_then_follows() {
        let log = LocalLog::new();
        log.create_topic("Demo", Retention::Compacted).await.unwrap();
        log.create_topic("DemoTalk", Retention::TimeLimited(Duration::from_secs(60)))
            .await
            .unwrap();
        log.send("Demo", "config:/Demo", payload("{}")).await.unwrap();

        let mut rx = log
            .subscribe(&["Demo".to_string(), "DemoTalk".to_string()])
            .await
            .unwrap();
        log.send("DemoTalk", "talk:/Demo/x", payload("hi")).await.unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!(first.key, "config:/Demo");
        let second = rx.recv().await.unwrap();
        assert_eq!(second.topic, "DemoTalk");
        assert!(second.offset > first.offset);
    }

    #[tokio::test]
    async fn test_unknown_topic_is_unlimited() {
        let log = LocalLog::new();
        log.send("Other", "k", payload("1")).await.unwrap();
        log.send("Other", "k", payload("2")).await.unwrap();
        assert_eq!(log.records("Other").len(), 2);
        assert!(log.is_connected());
    }
}
