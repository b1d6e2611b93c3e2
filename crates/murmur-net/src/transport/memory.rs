//! In-process broker.
//!
//! Keeps topics, consumer groups and a log of every accepted record in
//! memory. Group states follow the broker's lifecycle closely enough for
//! presence: `Empty` after connect, `Stable` once subscribed, `Empty`
//! again after the consumer leaves. Faults can be injected for every
//! operation the gateway treats differently on failure.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use murmur_shared::constants::{MAX_RECORD_BYTES, RECORD_QUEUE_DEPTH};
use murmur_shared::GroupState;

use super::{BrokerRecord, BrokerResult, BrokerTransport, ClientChannel};
use crate::error::BrokerError;

type PublishFault = Box<dyn Fn(&str, &[u8]) -> bool + Send + Sync>;

struct GroupEntry {
    state: GroupState,
    topics: Vec<String>,
    sender: Option<mpsc::Sender<BrokerRecord>>,
}

#[derive(Default)]
struct BrokerState {
    topics: HashSet<String>,
    groups: HashMap<String, GroupEntry>,
    log: Vec<BrokerRecord>,
    unreachable: bool,
    fail_subscriptions: bool,
    fail_group_queries: bool,
    publish_fault: Option<PublishFault>,
}

/// Shared in-memory broker. Hand one [`MemoryTransport`] to each session.
#[derive(Default)]
pub struct MemoryBroker {
    state: Mutex<BrokerState>,
}

impl MemoryBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A fresh, disconnected transport bound to this broker.
    pub fn transport(self: &Arc<Self>) -> MemoryTransport {
        MemoryTransport {
            broker: Arc::clone(self),
            channels: Mutex::new(Channels::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        // A panicking test thread must not wedge every other session.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Refuse all new connections.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.lock().unreachable = unreachable;
    }

    pub fn fail_subscriptions(&self, fail: bool) {
        self.lock().fail_subscriptions = fail;
    }

    pub fn fail_group_queries(&self, fail: bool) {
        self.lock().fail_group_queries = fail;
    }

    /// Reject every publish for which `fault(topic, payload)` is true.
    pub fn fail_publishes_where<F>(&self, fault: F)
    where
        F: Fn(&str, &[u8]) -> bool + Send + Sync + 'static,
    {
        self.lock().publish_fault = Some(Box::new(fault));
    }

    /// Add or overwrite a consumer group that has no live consumer here.
    pub fn register_group(&self, group_id: &str, state: GroupState) {
        self.lock().groups.insert(
            group_id.to_string(),
            GroupEntry {
                state,
                topics: Vec::new(),
                sender: None,
            },
        );
    }

    pub fn group_state(&self, group_id: &str) -> Option<GroupState> {
        self.lock().groups.get(group_id).map(|g| g.state.clone())
    }

    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.lock().topics.iter().cloned().collect();
        topics.sort();
        topics
    }

    /// Every accepted record on `topic`, in publish order.
    pub fn published(&self, topic: &str) -> Vec<BrokerRecord> {
        self.lock()
            .log
            .iter()
            .filter(|r| r.topic == topic)
            .cloned()
            .collect()
    }

    /// Deliver a raw record to subscribers, bypassing publish faults.
    pub async fn inject(&self, topic: &str, payload: Vec<u8>) {
        let record = BrokerRecord {
            topic: topic.to_string(),
            payload,
        };
        self.fan_out(record).await;
    }

    async fn fan_out(&self, record: BrokerRecord) {
        let senders: Vec<mpsc::Sender<BrokerRecord>> = {
            let mut state = self.lock();
            state.log.push(record.clone());
            state
                .groups
                .values()
                .filter(|g| g.topics.iter().any(|t| *t == record.topic))
                .filter_map(|g| g.sender.clone())
                .collect()
        };

        for sender in senders {
            // A dropped receiver just means that consumer went away.
            let _ = sender.send(record.clone()).await;
        }
    }
}

#[derive(Default)]
struct Channels {
    group_id: Option<String>,
    producer: bool,
    consumer: bool,
    admin: bool,
}

/// One session's view of a [`MemoryBroker`].
pub struct MemoryTransport {
    broker: Arc<MemoryBroker>,
    channels: Mutex<Channels>,
}

impl MemoryTransport {
    fn channels(&self) -> MutexGuard<'_, Channels> {
        self.channels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn require(&self, channel: ClientChannel) -> BrokerResult<()> {
        let channels = self.channels();
        let up = match channel {
            ClientChannel::Producer => channels.producer,
            ClientChannel::Consumer => channels.consumer,
            ClientChannel::Admin => channels.admin,
        };
        if up {
            Ok(())
        } else {
            Err(BrokerError::NotConnected)
        }
    }
}

#[async_trait]
impl BrokerTransport for MemoryTransport {
    async fn connect(&self, group_id: &str) -> BrokerResult<()> {
        {
            let mut state = self.broker.lock();
            if state.unreachable {
                return Err(BrokerError::Unreachable("memory broker offline".into()));
            }
            state.groups.insert(
                group_id.to_string(),
                GroupEntry {
                    state: GroupState::Empty,
                    topics: Vec::new(),
                    sender: None,
                },
            );
        }

        let mut channels = self.channels();
        channels.group_id = Some(group_id.to_string());
        channels.producer = true;
        channels.consumer = true;
        channels.admin = true;

        debug!(group = %group_id, "Memory transport connected");
        Ok(())
    }

    async fn create_topics(&self, topics: &[&str]) -> BrokerResult<()> {
        self.require(ClientChannel::Admin)?;
        let mut state = self.broker.lock();
        for topic in topics {
            state.topics.insert(topic.to_string());
        }
        Ok(())
    }

    async fn send(&self, topic: &str, payload: Vec<u8>) -> BrokerResult<()> {
        self.require(ClientChannel::Producer)?;
        if payload.len() > MAX_RECORD_BYTES {
            return Err(BrokerError::Backend(format!(
                "record of {} bytes exceeds the {MAX_RECORD_BYTES} byte limit",
                payload.len()
            )));
        }
        {
            let state = self.broker.lock();
            if !state.topics.contains(topic) {
                return Err(BrokerError::Backend(format!("unknown topic {topic}")));
            }
            if let Some(fault) = &state.publish_fault {
                if fault(topic, &payload) {
                    return Err(BrokerError::Backend("injected publish failure".into()));
                }
            }
        }

        self.broker
            .fan_out(BrokerRecord {
                topic: topic.to_string(),
                payload,
            })
            .await;
        Ok(())
    }

    async fn subscribe(&self, topics: &[&str]) -> BrokerResult<mpsc::Receiver<BrokerRecord>> {
        self.require(ClientChannel::Consumer)?;
        let group_id = self
            .channels()
            .group_id
            .clone()
            .ok_or(BrokerError::NotConnected)?;

        let mut state = self.broker.lock();
        if state.fail_subscriptions {
            return Err(BrokerError::Backend("injected subscription failure".into()));
        }

        let (tx, rx) = mpsc::channel(RECORD_QUEUE_DEPTH);
        let entry = state
            .groups
            .get_mut(&group_id)
            .ok_or(BrokerError::NotConnected)?;
        entry.topics = topics.iter().map(|t| t.to_string()).collect();
        entry.sender = Some(tx);
        entry.state = GroupState::Stable;

        Ok(rx)
    }

    async fn list_groups(&self) -> BrokerResult<Vec<String>> {
        self.require(ClientChannel::Admin)?;
        let state = self.broker.lock();
        if state.fail_group_queries {
            return Err(BrokerError::Backend("injected group listing failure".into()));
        }
        Ok(state.groups.keys().cloned().collect())
    }

    async fn describe_group(&self, group_id: &str) -> BrokerResult<GroupState> {
        self.require(ClientChannel::Admin)?;
        let state = self.broker.lock();
        if state.fail_group_queries {
            return Err(BrokerError::Backend("injected group describe failure".into()));
        }
        Ok(state
            .groups
            .get(group_id)
            .map(|g| g.state.clone())
            .unwrap_or(GroupState::Dead))
    }

    async fn disconnect(&self, channel: ClientChannel) -> BrokerResult<()> {
        let mut channels = self.channels();
        match channel {
            ClientChannel::Producer => channels.producer = false,
            ClientChannel::Admin => channels.admin = false,
            ClientChannel::Consumer => {
                channels.consumer = false;
                if let Some(group_id) = &channels.group_id {
                    if let Some(entry) = self.broker.lock().groups.get_mut(group_id) {
                        entry.sender = None;
                        entry.topics.clear();
                        entry.state = GroupState::Empty;
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_group_lifecycle() {
        let broker = MemoryBroker::new();
        let transport = broker.transport();

        transport.connect("chat-user-alice-1").await.unwrap();
        assert_eq!(broker.group_state("chat-user-alice-1"), Some(GroupState::Empty));

        transport.create_topics(&["t"]).await.unwrap();
        let _rx = transport.subscribe(&["t"]).await.unwrap();
        assert_eq!(broker.group_state("chat-user-alice-1"), Some(GroupState::Stable));

        transport.disconnect(ClientChannel::Consumer).await.unwrap();
        assert_eq!(broker.group_state("chat-user-alice-1"), Some(GroupState::Empty));
    }

    #[tokio::test]
    async fn test_fan_out_only_to_subscribed_topics() {
        let broker = MemoryBroker::new();
        let a = broker.transport();
        let b = broker.transport();
        a.connect("ga").await.unwrap();
        b.connect("gb").await.unwrap();
        a.create_topics(&["x", "y"]).await.unwrap();

        let mut rx_a = a.subscribe(&["x"]).await.unwrap();
        let mut rx_b = b.subscribe(&["x", "y"]).await.unwrap();

        b.send("y", b"1".to_vec()).await.unwrap();
        b.send("x", b"2".to_vec()).await.unwrap();

        assert_eq!(rx_a.recv().await.unwrap().payload, b"2");
        assert_eq!(rx_b.recv().await.unwrap().payload, b"1");
        assert_eq!(rx_b.recv().await.unwrap().payload, b"2");
        assert_eq!(broker.published("x").len(), 1);
    }

    #[tokio::test]
    async fn test_faults() {
        let broker = MemoryBroker::new();
        let t = broker.transport();

        broker.set_unreachable(true);
        assert!(matches!(
            t.connect("g").await,
            Err(BrokerError::Unreachable(_))
        ));
        broker.set_unreachable(false);
        t.connect("g").await.unwrap();

        assert!(t.send("missing", vec![]).await.is_err());

        t.create_topics(&["x"]).await.unwrap();
        broker.fail_publishes_where(|_, payload| payload == b"bad");
        assert!(t.send("x", b"bad".to_vec()).await.is_err());
        assert!(t.send("x", b"good".to_vec()).await.is_ok());
        assert_eq!(broker.published("x").len(), 1);

        assert!(t.send("x", vec![b'a'; MAX_RECORD_BYTES + 1]).await.is_err());
        assert!(t.send("x", vec![b'a'; MAX_RECORD_BYTES]).await.is_ok());

        broker.fail_group_queries(true);
        assert!(t.list_groups().await.is_err());
    }

    #[tokio::test]
    async fn test_requires_connection() {
        let broker = MemoryBroker::new();
        let t = broker.transport();
        assert!(matches!(
            t.send("x", vec![]).await,
            Err(BrokerError::NotConnected)
        ));
        assert!(matches!(t.list_groups().await, Err(BrokerError::NotConnected)));
    }
}
