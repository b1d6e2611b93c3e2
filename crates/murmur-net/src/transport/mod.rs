//! Broker backends.
//!
//! A [`BrokerTransport`] owns the three client channels a chat session
//! needs: a producer, a consumer bound to the session's group id, and an
//! administrative channel for topic creation and group metadata.

use std::fmt;

use async_trait::async_trait;
use tokio::sync::mpsc;

use murmur_shared::GroupState;

use crate::error::BrokerError;

#[cfg(feature = "kafka")]
pub mod kafka;
pub mod memory;

#[cfg(feature = "kafka")]
pub use kafka::KafkaTransport;
pub use memory::{MemoryBroker, MemoryTransport};

pub type BrokerResult<T> = std::result::Result<T, BrokerError>;

/// One raw record, in the order the consumer received it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerRecord {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// The client channels a transport manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientChannel {
    Producer,
    Consumer,
    Admin,
}

impl ClientChannel {
    pub const ALL: [ClientChannel; 3] = [
        ClientChannel::Consumer,
        ClientChannel::Producer,
        ClientChannel::Admin,
    ];
}

impl fmt::Display for ClientChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ClientChannel::Producer => "producer",
            ClientChannel::Consumer => "consumer",
            ClientChannel::Admin => "admin",
        })
    }
}

#[async_trait]
pub trait BrokerTransport: Send + Sync {
    /// Connect producer, consumer (bound to `group_id`) and admin channels.
    async fn connect(&self, group_id: &str) -> BrokerResult<()>;

    /// Create the given topics; topics that already exist are not an error.
    async fn create_topics(&self, topics: &[&str]) -> BrokerResult<()>;

    /// Publish one record and wait for the broker to accept it.
    async fn send(&self, topic: &str, payload: Vec<u8>) -> BrokerResult<()>;

    /// Subscribe the consumer to exactly `topics` and start delivering
    /// records, in consumer order, on the returned channel.
    async fn subscribe(&self, topics: &[&str]) -> BrokerResult<mpsc::Receiver<BrokerRecord>>;

    /// Ids of every consumer group known to the broker.
    async fn list_groups(&self) -> BrokerResult<Vec<String>>;

    /// Live state of one consumer group.
    async fn describe_group(&self, group_id: &str) -> BrokerResult<GroupState>;

    /// Close a single channel.
    async fn disconnect(&self, channel: ClientChannel) -> BrokerResult<()>;
}
